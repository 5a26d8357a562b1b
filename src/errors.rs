//! Typed error taxonomy for the ETL worker.
//!
//! Each fallible boundary gets its own `thiserror` enum; `anyhow` is reserved
//! for the binary/CLI edge, where we mostly want context propagation rather
//! than matchable variants.

use thiserror::Error;

/// Errors raised by [`crate::indexer::IndexerClient`].
#[derive(Debug, Error)]
pub enum IndexerError {
    #[error("indexer unavailable: {0}")]
    Unavailable(#[source] reqwest::Error),

    #[error("indexer returned an unparseable response for index '{index}': {source}")]
    BadResponse {
        index: String,
        #[source]
        source: reqwest::Error,
    },
}

/// Errors raised by [`crate::warehouse::WarehouseClient`].
#[derive(Debug, Error)]
pub enum WarehouseError {
    #[error("warehouse unavailable: {0}")]
    Unavailable(#[source] reqwest::Error),

    #[error("schema mismatch loading table '{table}': {message}")]
    SchemaMismatch { table: String, message: String },

    #[error("failed to read staging file for load: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors that can abort a bulk or an iteration.
#[derive(Debug, Error)]
pub enum EtlError {
    #[error("data missing in warehouse for table '{table}': indexer has {indexer_count}, warehouse has {warehouse_count} (delta {delta})")]
    CountsMismatchMissing {
        table: String,
        indexer_count: i64,
        warehouse_count: i64,
        delta: i64,
    },

    #[error("possible duplicates in warehouse for table '{table}': indexer has {indexer_count}, warehouse has {warehouse_count} (delta {delta})")]
    CountsMismatchDuplicates {
        table: String,
        indexer_count: i64,
        warehouse_count: i64,
        delta: i64,
    },

    #[error("{0} task(s) failed during this bulk")]
    SomeTasksFailed(usize),

    #[error(transparent)]
    Indexer(#[from] IndexerError),

    #[error(transparent)]
    Warehouse(#[from] WarehouseError),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

impl EtlError {
    /// True for the two reconciliation outcomes; used by callers that only
    /// care about "did reconciliation fail" rather than the specific shape.
    pub fn is_counts_mismatch(&self) -> bool {
        matches!(
            self,
            EtlError::CountsMismatchMissing { .. } | EtlError::CountsMismatchDuplicates { .. }
        )
    }
}

/// Configuration/workspace problems. Fatal, not retried, not catchable by
/// worker threads.
#[derive(Debug, Error)]
pub enum UsageError {
    #[error("worker config file not found: {}", .0.display())]
    ConfigNotFound(std::path::PathBuf),

    #[error("worker state file not found: {}", .0.display())]
    StateNotFound(std::path::PathBuf),

    #[error("malformed worker config at {}: {source}", .path.display())]
    MalformedConfig {
        path: std::path::PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("malformed worker state at {}: {source}", .path.display())]
    MalformedState {
        path: std::path::PathBuf,
        #[source]
        source: serde_json::Error,
    },
}
