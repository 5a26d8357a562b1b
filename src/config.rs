//! Declarative, per-iteration configuration. Reloaded fresh every iteration
//! so an operator can tune bulk size, thread count, or erratum tolerances
//! without restarting the worker.

use std::collections::HashMap;
use std::path::Path;

use serde::Deserialize;

use crate::errors::UsageError;

#[derive(Debug, Clone, Deserialize)]
pub struct IndicesConfig {
    pub bq_dataset: String,
    #[serde(default)]
    pub bq_data_transfer_name: String,
    pub indices: Vec<String>,
    #[serde(default)]
    pub indices_without_timestamp: Vec<String>,
    pub time_partition_start: i64,
    /// `<= 0` means unbounded.
    pub time_partition_end: i64,
    pub interval_size_in_seconds: i64,
    pub num_intervals_in_bulk: u32,
    pub num_threads: u32,
    pub should_fail_on_counts_mismatch: bool,
    #[serde(default)]
    pub skip_counts_check_for_indices: Vec<String>,
    #[serde(default)]
    pub counts_checks_errata: HashMap<String, i64>,
}

impl IndicesConfig {
    pub fn time_partition_end_or(&self, default: i64) -> i64 {
        if self.time_partition_end > 0 {
            self.time_partition_end
        } else {
            default
        }
    }

    /// `indices` and `indices_without_timestamp` are treated as two disjoint
    /// sets, unioned here for callers (truncate-table lists) that need every
    /// table this config touches.
    pub fn all_tables(&self) -> Vec<String> {
        let mut tables = self.indices.clone();
        for index in &self.indices_without_timestamp {
            if !tables.contains(index) {
                tables.push(index.clone());
            }
        }
        tables
    }

    pub fn erratum_for(&self, table: &str) -> i64 {
        self.counts_checks_errata.get(table).copied().unwrap_or(0)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct WorkerConfig {
    pub gcp_project_id: String,
    pub schema_folder: String,
    pub indexer_url: String,
    #[serde(default)]
    pub indexer_username: String,
    #[serde(default)]
    pub indexer_password: String,
    pub genesis_timestamp: i64,
    pub append_only_indices: IndicesConfig,
    pub mutable_indices: IndicesConfig,
}

impl WorkerConfig {
    pub fn load(path: &Path) -> Result<Self, UsageError> {
        let contents = std::fs::read_to_string(path)
            .map_err(|_| UsageError::ConfigNotFound(path.to_path_buf()))?;
        serde_json::from_str(&contents).map_err(|source| UsageError::MalformedConfig {
            path: path.to_path_buf(),
            source,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_json() -> &'static str {
        r#"{
            "gcp_project_id": "proj",
            "schema_folder": "/schemas",
            "indexer_url": "http://indexer.local",
            "genesis_timestamp": 0,
            "append_only_indices": {
                "bq_dataset": "ds",
                "indices": ["blocks", "logs"],
                "indices_without_timestamp": [],
                "time_partition_start": 0,
                "time_partition_end": 0,
                "interval_size_in_seconds": 60,
                "num_intervals_in_bulk": 10,
                "num_threads": 4,
                "should_fail_on_counts_mismatch": true,
                "skip_counts_check_for_indices": [],
                "counts_checks_errata": {"blocks": 2}
            },
            "mutable_indices": {
                "bq_dataset": "ds",
                "indices": ["accounts"],
                "indices_without_timestamp": ["accounts", "tokens"],
                "time_partition_start": 0,
                "time_partition_end": 0,
                "interval_size_in_seconds": 60,
                "num_intervals_in_bulk": 1,
                "num_threads": 1,
                "should_fail_on_counts_mismatch": false,
                "skip_counts_check_for_indices": [],
                "counts_checks_errata": {}
            }
        }"#
    }

    #[test]
    fn loads_and_parses_optional_fields_with_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("worker_config.json");
        std::fs::write(&path, sample_json()).unwrap();

        let config = WorkerConfig::load(&path).unwrap();
        assert_eq!(config.indexer_username, "");
        assert_eq!(config.append_only_indices.erratum_for("blocks"), 2);
        assert_eq!(config.append_only_indices.erratum_for("logs"), 0);
    }

    #[test]
    fn time_partition_end_or_falls_back_when_unbounded() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("worker_config.json");
        std::fs::write(&path, sample_json()).unwrap();
        let config = WorkerConfig::load(&path).unwrap();

        assert_eq!(config.append_only_indices.time_partition_end_or(999), 999);
    }

    #[test]
    fn all_tables_unions_disjoint_index_lists() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("worker_config.json");
        std::fs::write(&path, sample_json()).unwrap();
        let config = WorkerConfig::load(&path).unwrap();

        let mut tables = config.mutable_indices.all_tables();
        tables.sort();
        assert_eq!(tables, vec!["accounts".to_string(), "tokens".to_string()]);
    }

    #[test]
    fn missing_file_is_a_usage_error() {
        let err = WorkerConfig::load(Path::new("/nonexistent/worker_config.json")).unwrap_err();
        assert!(matches!(err, UsageError::ConfigNotFound(_)));
    }

    #[test]
    fn malformed_json_is_a_usage_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("worker_config.json");
        std::fs::write(&path, "{ not json").unwrap();
        let err = WorkerConfig::load(&path).unwrap_err();
        assert!(matches!(err, UsageError::MalformedConfig { .. }));
    }
}
