//! Per-index source-vs-warehouse count comparison.
//!
//! Runs after a bulk drains, before the checkpoint is allowed to advance.
//! The only state this module touches is read-only: it never mutates the
//! warehouse or the indexer, only compares what each reports.

use crate::config::IndicesConfig;
use crate::errors::EtlError;
use crate::indexer::IndexerClient;
use crate::warehouse::WarehouseClient;

pub struct Reconciler<'a> {
    indexer: &'a IndexerClient,
    warehouse: &'a WarehouseClient,
}

impl<'a> Reconciler<'a> {
    pub fn new(indexer: &'a IndexerClient, warehouse: &'a WarehouseClient) -> Self {
        Self { indexer, warehouse }
    }

    /// Reconciles every table named in `config.indices` plus
    /// `config.indices_without_timestamp`, over `[start, end)` for the
    /// former and globally for the latter, skipping anything in
    /// `skip_counts_check_for_indices`. Returns `Err` on the first
    /// mismatched table when `config.should_fail_on_counts_mismatch`;
    /// otherwise logs every mismatch and returns `Ok`.
    pub fn reconcile_interval(
        &self,
        dataset: &str,
        config: &IndicesConfig,
        start: i64,
        end: i64,
    ) -> Result<(), EtlError> {
        for index in &config.indices {
            if config.indices_without_timestamp.contains(index) {
                continue;
            }
            self.reconcile_one(dataset, config, index, Some(start), Some(end))?;
        }
        for index in &config.indices_without_timestamp {
            self.reconcile_one(dataset, config, index, None, None)?;
        }
        Ok(())
    }

    fn reconcile_one(
        &self,
        dataset: &str,
        config: &IndicesConfig,
        index: &str,
        start: Option<i64>,
        end: Option<i64>,
    ) -> Result<(), EtlError> {
        if config.skip_counts_check_for_indices.iter().any(|s| s == index) {
            tracing::debug!(index, "skipping counts check");
            return Ok(());
        }

        let indexer_count = self.indexer.count_records(index, start, end)?;
        let warehouse_count = match (start, end) {
            (Some(start), Some(end)) => {
                self.warehouse.get_num_records_in_interval(dataset, index, start, end)?
            }
            _ => self.warehouse.get_num_records(dataset, index)?,
        };

        let raw_delta = indexer_count - warehouse_count;
        let erratum = config.erratum_for(index);
        let adjusted_delta = shrink_towards_zero(raw_delta, erratum);

        tracing::info!(
            index,
            indexer_count,
            warehouse_count,
            raw_delta,
            adjusted_delta,
            "reconciliation result"
        );

        if adjusted_delta == 0 {
            return Ok(());
        }

        let error = if adjusted_delta > 0 {
            EtlError::CountsMismatchMissing {
                table: index.to_string(),
                indexer_count,
                warehouse_count,
                delta: adjusted_delta,
            }
        } else {
            EtlError::CountsMismatchDuplicates {
                table: index.to_string(),
                indexer_count,
                warehouse_count,
                delta: adjusted_delta,
            }
        };

        if config.should_fail_on_counts_mismatch {
            return Err(error);
        }
        tracing::warn!(%error, "counts mismatch, not configured to fail");
        Ok(())
    }
}

/// Subtracts up to `erratum` magnitude from `delta`, stopping at zero: a
/// table pre-approved for a tolerance of 2 treats a raw delta of 2 (or -2,
/// or anything between) as fully absorbed, and anything beyond as the
/// genuine residual mismatch.
fn shrink_towards_zero(delta: i64, erratum: i64) -> i64 {
    let erratum = erratum.abs();
    if delta > 0 {
        (delta - erratum).max(0)
    } else {
        (delta + erratum).min(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shrink_towards_zero_absorbs_small_deltas() {
        assert_eq!(shrink_towards_zero(2, 2), 0);
        assert_eq!(shrink_towards_zero(-2, 2), 0);
        assert_eq!(shrink_towards_zero(5, 2), 3);
        assert_eq!(shrink_towards_zero(-5, 2), -3);
        assert_eq!(shrink_towards_zero(0, 5), 0);
    }

    #[test]
    fn shrink_towards_zero_with_no_erratum_is_identity() {
        assert_eq!(shrink_towards_zero(7, 0), 7);
        assert_eq!(shrink_towards_zero(-7, 0), -7);
    }
}
