//! TasksDashboard: an in-process work queue shared by worker threads.
//!
//! All state transitions happen inside one mutex. `plan_bulk` must only be
//! called when no non-finished tasks remain (the orchestrator thread owns
//! that invariant; the dashboard asserts it defensively).

use std::sync::Mutex;

use chrono::Utc;
use rand::seq::SliceRandom;

use crate::task::{Interval, Task};

#[derive(Debug, Default, Clone, Copy)]
pub struct TaskCounts {
    pub pending: usize,
    pub started: usize,
    pub finished: usize,
    pub failed: usize,
}

impl TaskCounts {
    pub fn total(&self) -> usize {
        self.pending + self.started + self.finished + self.failed
    }
}

pub struct TasksDashboard {
    tasks: Mutex<Vec<Task>>,
}

impl Default for TasksDashboard {
    fn default() -> Self {
        Self::new()
    }
}

impl TasksDashboard {
    pub fn new() -> Self {
        Self {
            tasks: Mutex::new(Vec::new()),
        }
    }

    /// Plans one bulk: `num_intervals` windows of `interval_size` seconds
    /// starting at `start`, clamped to `end`, one task per index (minus the
    /// interval-free indices) per window, plus one interval-free task per
    /// interval-free index. Returns the end of the last emitted interval, or
    /// `None` if nothing was planned (already caught up to `end`).
    ///
    /// Must not be called while the dashboard holds unfinished tasks from a
    /// previous bulk.
    #[allow(clippy::too_many_arguments)]
    pub fn plan_bulk(
        &self,
        dataset: &str,
        indices: &[String],
        indices_without_timestamp: &[String],
        start: i64,
        end: i64,
        num_intervals: u32,
        interval_size: i64,
    ) -> Option<i64> {
        self.assert_all_existing_tasks_are_finished();

        let mut planned = Vec::new();
        let mut end_of_last_interval = None;

        let timed_indices: Vec<&String> = indices
            .iter()
            .filter(|index| !indices_without_timestamp.contains(index))
            .collect();

        for i in 0..num_intervals as i64 {
            let interval_start = start + i * interval_size;
            if interval_start >= end {
                break;
            }
            let interval_end = (interval_start + interval_size).min(end);
            end_of_last_interval = Some(interval_end);

            for index in &timed_indices {
                planned.push(Task::new_with_interval(
                    dataset.to_string(),
                    (*index).clone(),
                    Interval::new(interval_start, interval_end),
                ));
            }
        }

        for index in indices_without_timestamp {
            planned.push(Task::new_without_interval(
                dataset.to_string(),
                index.clone(),
            ));
        }

        planned.shuffle(&mut rand::thread_rng());

        let mut tasks = self.tasks.lock().unwrap();
        *tasks = planned;
        drop(tasks);

        self.log_status("plan_bulk");
        end_of_last_interval
    }

    /// Atomically picks the first pending task and marks it started. Safe
    /// under concurrent callers: the whole scan-and-flip happens under one
    /// lock, so no two callers can ever observe the same task as pending.
    pub fn pick_and_start_task(&self) -> Option<Task> {
        let mut tasks = self.tasks.lock().unwrap();
        let now = Utc::now();
        let picked = tasks.iter_mut().find(|t| t.is_pending()).map(|t| {
            t.set_started(now);
            t.clone()
        });
        drop(tasks);
        self.log_status("pick_and_start_task");
        picked
    }

    /// Marks the task matching `finished.filename_friendly_description()` and
    /// `finished.window` as finished. The caller passes back the same `Task`
    /// value it received from `pick_and_start_task` after running it.
    pub fn on_task_finished(&self, finished: &Task) {
        let mut tasks = self.tasks.lock().unwrap();
        if let Some(t) = find_matching(&mut tasks, finished) {
            let now = Utc::now();
            t.set_finished(now);
            tracing::info!(
                task = %t,
                duration_seconds = t.duration_seconds(),
                "task finished"
            );
        }
        drop(tasks);
        self.log_status("on_task_finished");
    }

    pub fn on_task_failed(&self, failed: &Task, error: impl std::fmt::Display, trace: String) {
        let mut tasks = self.tasks.lock().unwrap();
        if let Some(t) = find_matching(&mut tasks, failed) {
            t.set_failed(error, trace);
        }
        drop(tasks);
        self.log_status("on_task_failed");
    }

    pub fn get_failed_tasks(&self) -> Vec<Task> {
        self.tasks
            .lock()
            .unwrap()
            .iter()
            .filter(|t| t.is_failed())
            .cloned()
            .collect()
    }

    pub fn assert_all_existing_tasks_are_finished(&self) {
        let tasks = self.tasks.lock().unwrap();
        for t in tasks.iter() {
            assert!(t.is_finished(), "task {t} is not finished");
        }
    }

    pub fn report_status(&self, context: &str) -> TaskCounts {
        let counts = self.counts();
        tracing::debug!(
            context,
            pending = counts.pending,
            started = counts.started,
            finished = counts.finished,
            failed = counts.failed,
            total = counts.total(),
            "dashboard status"
        );
        counts
    }

    fn log_status(&self, context: &str) {
        self.report_status(context);
    }

    fn counts(&self) -> TaskCounts {
        let tasks = self.tasks.lock().unwrap();
        let mut counts = TaskCounts::default();
        for t in tasks.iter() {
            match t.status {
                crate::task::TaskStatus::Pending => counts.pending += 1,
                crate::task::TaskStatus::Started => counts.started += 1,
                crate::task::TaskStatus::Finished => counts.finished += 1,
                crate::task::TaskStatus::Failed => counts.failed += 1,
            }
        }
        counts
    }
}

fn find_matching<'a>(tasks: &'a mut [Task], needle: &Task) -> Option<&'a mut Task> {
    tasks
        .iter_mut()
        .find(|t| t.index_name == needle.index_name && t.window == needle.window)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn plan_bulk_emits_half_open_intervals_clamped_to_end() {
        let dashboard = TasksDashboard::new();
        let end = dashboard.plan_bulk(
            "ds",
            &["blocks".to_string()],
            &[],
            0,
            150,
            10,
            60,
        );
        // intervals: [0,60) [60,120) [120,150) -> 3 tasks, last end = 150
        assert_eq!(end, Some(150));
        assert_eq!(dashboard.counts().pending, 3);
    }

    #[test]
    fn plan_bulk_empty_range_returns_none() {
        let dashboard = TasksDashboard::new();
        let end = dashboard.plan_bulk("ds", &["blocks".to_string()], &[], 1000, 1000, 10, 60);
        assert_eq!(end, None);
        assert_eq!(dashboard.counts().total(), 0);
    }

    #[test]
    fn plan_bulk_emits_one_task_per_interval_free_index() {
        let dashboard = TasksDashboard::new();
        let without_timestamp = vec!["accounts".to_string(), "tokens".to_string()];
        let end = dashboard.plan_bulk("ds", &without_timestamp, &without_timestamp, 0, 60, 1, 60);
        assert_eq!(end, Some(60));
        assert_eq!(dashboard.counts().pending, 2);
    }

    #[test]
    fn concurrent_pick_never_double_assigns() {
        let dashboard = Arc::new(TasksDashboard::new());
        let indices: Vec<String> = (0..100).map(|i| format!("idx{i}")).collect();
        dashboard.plan_bulk("ds", &indices, &indices, 0, 60, 1, 60);
        assert_eq!(dashboard.counts().total(), 100);

        let mut handles = Vec::new();
        for _ in 0..8 {
            let dashboard = Arc::clone(&dashboard);
            handles.push(thread::spawn(move || {
                let mut picked = Vec::new();
                while let Some(task) = dashboard.pick_and_start_task() {
                    picked.push(task);
                }
                picked
            }));
        }

        let mut all_picked = Vec::new();
        for h in handles {
            all_picked.extend(h.join().unwrap());
        }

        assert_eq!(all_picked.len(), 100);
        let mut names: Vec<&str> = all_picked.iter().map(|t| t.index_name.as_str()).collect();
        names.sort();
        names.dedup();
        assert_eq!(names.len(), 100, "no index should be picked twice");

        for task in &all_picked {
            dashboard.on_task_finished(task);
        }
        assert_eq!(dashboard.counts().finished, 100);
    }
}
