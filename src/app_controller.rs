//! Orchestrates one iteration: plan a bulk, run the worker pool, reconcile,
//! advance the checkpoint. Also owns the rewind and mutable-reload paths,
//! which reuse the same pool-and-reconcile machinery with different inputs.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use chrono::Utc;

use crate::config::WorkerConfig;
use crate::dashboard::TasksDashboard;
use crate::errors::EtlError;
use crate::file_storage::FileStorage;
use crate::indexer::IndexerClient;
use crate::reconciler::Reconciler;
use crate::runner::TasksRunner;
use crate::state::{self, WorkerState};
use crate::transformers::TransformerRegistry;
use crate::warehouse::{LoadThrottle, WarehouseClient};

/// Lag bound that preserves the append-only assumption: records indexed
/// within the last `EPSILON_SECONDS` might still be subject to the
/// indexer's own consistency delay, so the worker never reads past `now -
/// EPSILON_SECONDS`.
const EPSILON_SECONDS: i64 = 60;

/// Small per-thread startup stagger so a bulk's worker pool doesn't open
/// its HTTP connections in one thundering-herd burst.
const WORKER_STARTUP_STAGGER: Duration = Duration::from_millis(50);

pub struct AppController {
    workspace: PathBuf,
    schema_folder: PathBuf,
    indexer: IndexerClient,
    warehouse: WarehouseClient,
    storage: FileStorage,
    transformers: TransformerRegistry,
    dashboard: Arc<TasksDashboard>,
}

impl AppController {
    pub fn new(workspace: PathBuf, config: &WorkerConfig) -> anyhow::Result<Self> {
        let storage = FileStorage::new(&workspace)?;
        let indexer = IndexerClient::new(
            config.indexer_url.clone(),
            config.indexer_username.clone(),
            config.indexer_password.clone(),
        )?;
        let warehouse = WarehouseClient::new(config.gcp_project_id.clone(), LoadThrottle::new())?;

        Ok(Self {
            workspace,
            schema_folder: PathBuf::from(&config.schema_folder),
            indexer,
            warehouse,
            storage,
            transformers: TransformerRegistry::default(),
            dashboard: Arc::new(TasksDashboard::new()),
        })
    }

    fn state_path(&self) -> PathBuf {
        state::state_path(&self.workspace)
    }

    fn load_state(&self) -> anyhow::Result<WorkerState> {
        WorkerState::load_or_default(&self.state_path()).context("loading worker_state.json")
    }

    /// Runs append-only bulks until caught up to `now - EPSILON_SECONDS`
    /// (or `config.time_partition_end`, if lower). Each bulk that reconciles
    /// successfully advances and persists the checkpoint before the next
    /// bulk is planned; a bulk that fails to reconcile, or that has any
    /// FAILED task, aborts the whole iteration without advancing anything.
    pub fn run_append_only_iteration(&self, config: &WorkerConfig) -> anyhow::Result<()> {
        let indices_config = &config.append_only_indices;
        let now = Utc::now().timestamp();
        let initial_end =
            (now - EPSILON_SECONDS).min(indices_config.time_partition_end_or(i64::MAX));

        let mut state = self.load_state()?;

        loop {
            let start = state.checkpoint_or(indices_config.time_partition_start);
            if start >= initial_end {
                tracing::info!(start, initial_end, "caught up, nothing to plan");
                return Ok(());
            }

            let end_of_last_interval = self.dashboard.plan_bulk(
                &indices_config.bq_dataset,
                &indices_config.indices,
                &indices_config.indices_without_timestamp,
                start,
                initial_end,
                indices_config.num_intervals_in_bulk,
                indices_config.interval_size_in_seconds,
            );

            let Some(end_of_last_interval) = end_of_last_interval else {
                tracing::info!("plan_bulk emitted nothing, iteration done");
                return Ok(());
            };

            self.run_pool(indices_config.num_threads)?;

            let reconciler = Reconciler::new(&self.indexer, &self.warehouse);
            reconciler.reconcile_interval(
                &indices_config.bq_dataset,
                indices_config,
                indices_config.time_partition_start,
                end_of_last_interval,
            )?;

            state.latest_checkpoint_timestamp = end_of_last_interval;
            state
                .save(&self.state_path())
                .context("persisting worker_state.json")?;
            tracing::info!(checkpoint = end_of_last_interval, "checkpoint advanced");
        }
    }

    /// Truncates every mutable table, plans one bulk covering
    /// `[genesis_timestamp, now)`, runs the pool, and reconciles globally.
    /// Because the tables were just truncated, a successful reconciliation
    /// is a full, from-scratch reload rather than an incremental one.
    pub fn run_mutable_iteration(&self, config: &WorkerConfig) -> anyhow::Result<()> {
        let indices_config = &config.mutable_indices;
        let now = Utc::now().timestamp();

        self.warehouse
            .truncate_tables(&indices_config.bq_dataset, &indices_config.all_tables())?;

        let end_of_last_interval = self.dashboard.plan_bulk(
            &indices_config.bq_dataset,
            &indices_config.indices,
            &indices_config.indices_without_timestamp,
            config.genesis_timestamp,
            now,
            indices_config.num_intervals_in_bulk,
            indices_config.interval_size_in_seconds,
        );

        if end_of_last_interval.is_none() && indices_config.indices_without_timestamp.is_empty() {
            tracing::info!("mutable reload planned nothing");
            return Ok(());
        }

        self.run_pool(indices_config.num_threads)?;

        let reconciler = Reconciler::new(&self.indexer, &self.warehouse);
        reconciler.reconcile_interval(
            &indices_config.bq_dataset,
            indices_config,
            config.genesis_timestamp,
            now,
        )?;
        Ok(())
    }

    /// Deletes warehouse rows with `timestamp >= checkpoint` for every
    /// append-only table, then reconciles `[time_partition_start,
    /// checkpoint)` with a hard failure on any mismatch. Run at process
    /// start so a crash mid-bulk never leaves the warehouse ahead of the
    /// checkpoint it will resume from.
    pub fn rewind_to_checkpoint(&self, config: &WorkerConfig) -> anyhow::Result<()> {
        let indices_config = &config.append_only_indices;
        let state = self.load_state()?;
        let checkpoint = state.checkpoint_or(indices_config.time_partition_start);

        for table in &indices_config.indices {
            self.warehouse
                .delete_on_or_after(&indices_config.bq_dataset, table, checkpoint)?;
        }

        let mut strict = indices_config.clone();
        strict.should_fail_on_counts_mismatch = true;

        let reconciler = Reconciler::new(&self.indexer, &self.warehouse);
        reconciler.reconcile_interval(
            &indices_config.bq_dataset,
            &strict,
            indices_config.time_partition_start,
            checkpoint,
        )?;
        tracing::info!(checkpoint, "rewind complete");
        Ok(())
    }

    /// Walks candidate checkpoints backwards from `time_partition_end` (or
    /// `now`, if unbounded) in `search_step`-sized decrements, reconciling
    /// non-fatally at each candidate, and reports the first one where every
    /// table's delta is zero (within its erratum). Read-only: never writes
    /// `worker_state.json` itself -- the operator copies the recommended
    /// value in by hand.
    pub fn find_latest_good_checkpoint(
        &self,
        config: &WorkerConfig,
        search_step: i64,
    ) -> anyhow::Result<Option<i64>> {
        let indices_config = &config.append_only_indices;
        let now = Utc::now().timestamp();
        let mut candidate = indices_config.time_partition_end_or(now);
        let floor = indices_config.time_partition_start;

        let mut lenient = indices_config.clone();
        lenient.should_fail_on_counts_mismatch = false;

        let reconciler = Reconciler::new(&self.indexer, &self.warehouse);
        while candidate > floor {
            match reconciler.reconcile_interval(&indices_config.bq_dataset, &lenient, floor, candidate) {
                Ok(()) => {
                    tracing::info!(candidate, "found a consistent checkpoint candidate");
                    return Ok(Some(candidate));
                }
                Err(e) => {
                    tracing::debug!(candidate, error = %e, "candidate not consistent, stepping back");
                }
            }
            candidate -= search_step;
        }
        Ok(None)
    }

    /// Spawns `num_threads` worker threads, each looping
    /// `pick_and_start_task -> Runner.run -> on_task_finished` until the
    /// dashboard is drained or a shared error flag is set by a failing
    /// peer. Returns `Err(SomeTasksFailed)` if any task ended up FAILED.
    fn run_pool(&self, num_threads: u32) -> Result<(), EtlError> {
        self.dashboard.report_status("pool start");
        let has_error_happened = Arc::new(AtomicBool::new(false));

        std::thread::scope(|scope| {
            for worker_id in 0..num_threads.max(1) {
                let dashboard = Arc::clone(&self.dashboard);
                let has_error_happened = Arc::clone(&has_error_happened);
                let indexer = &self.indexer;
                let warehouse = &self.warehouse;
                let storage = &self.storage;
                let transformers = &self.transformers;
                let schema_folder = self.schema_folder.as_path();

                scope.spawn(move || {
                    std::thread::sleep(WORKER_STARTUP_STAGGER * worker_id);
                    let runner =
                        TasksRunner::new(indexer, warehouse, storage, transformers, schema_folder);

                    loop {
                        if has_error_happened.load(Ordering::SeqCst) {
                            break;
                        }
                        let Some(task) = dashboard.pick_and_start_task() else {
                            break;
                        };

                        match runner.run(&task) {
                            Ok(()) => dashboard.on_task_finished(&task),
                            Err(e) => {
                                tracing::error!(task = %task, error = %e, "task failed");
                                dashboard.on_task_failed(&task, &e, format!("{e:?}"));
                                has_error_happened.store(true, Ordering::SeqCst);
                            }
                        }

                        if has_error_happened.load(Ordering::SeqCst) {
                            break;
                        }
                    }
                });
            }
        });

        let failed = self.dashboard.get_failed_tasks();
        if !failed.is_empty() {
            return Err(EtlError::SomeTasksFailed(failed.len()));
        }
        self.dashboard.assert_all_existing_tasks_are_finished();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::IndicesConfig;

    fn sample_indices_config() -> IndicesConfig {
        IndicesConfig {
            bq_dataset: "ds".into(),
            bq_data_transfer_name: String::new(),
            indices: vec!["blocks".into()],
            indices_without_timestamp: vec![],
            time_partition_start: 0,
            time_partition_end: 0,
            interval_size_in_seconds: 60,
            num_intervals_in_bulk: 10,
            num_threads: 2,
            should_fail_on_counts_mismatch: true,
            skip_counts_check_for_indices: vec![],
            counts_checks_errata: std::collections::HashMap::new(),
        }
    }

    #[test]
    fn time_partition_end_or_max_when_unbounded() {
        let config = sample_indices_config();
        assert_eq!(config.time_partition_end_or(i64::MAX), i64::MAX);
    }
}
