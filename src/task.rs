//! Task value type and its status lifecycle.
//!
//! A single struct covers both interval-bound and interval-free tasks: the
//! window is just `Option<(i64, i64)>`. The original system modeled these as
//! two subclasses (`TaskWithInterval` / `TaskWithoutInterval`); since the only
//! branching downstream is "do I have a window", a struct field is simpler.

use chrono::{DateTime, Utc};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskStatus {
    Pending,
    Started,
    Finished,
    Failed,
}

/// `[start, end)` in UTC seconds. `start < end` is enforced at construction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Interval {
    pub start: i64,
    pub end: i64,
}

impl Interval {
    pub fn new(start: i64, end: i64) -> Self {
        assert!(start < end, "interval start {start} must be < end {end}");
        Self { start, end }
    }
}

#[derive(Debug, Clone)]
pub struct Task {
    pub dataset: String,
    pub index_name: String,
    pub window: Option<Interval>,
    pub status: TaskStatus,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
    pub error_trace: String,
}

impl Task {
    pub fn new_with_interval(dataset: String, index_name: String, window: Interval) -> Self {
        Self {
            dataset,
            index_name,
            window: Some(window),
            status: TaskStatus::Pending,
            started_at: None,
            finished_at: None,
            error: None,
            error_trace: String::new(),
        }
    }

    pub fn new_without_interval(dataset: String, index_name: String) -> Self {
        Self {
            dataset,
            index_name,
            window: None,
            status: TaskStatus::Pending,
            started_at: None,
            finished_at: None,
            error: None,
            error_trace: String::new(),
        }
    }

    pub fn is_time_bound(&self) -> bool {
        self.window.is_some()
    }

    pub fn is_pending(&self) -> bool {
        self.status == TaskStatus::Pending
    }

    pub fn is_started(&self) -> bool {
        self.status == TaskStatus::Started
    }

    pub fn is_finished(&self) -> bool {
        self.status == TaskStatus::Finished
    }

    pub fn is_failed(&self) -> bool {
        self.status == TaskStatus::Failed
    }

    pub fn set_started(&mut self, now: DateTime<Utc>) {
        assert!(self.is_pending(), "cannot start task {self}: not pending");
        self.status = TaskStatus::Started;
        self.started_at = Some(now);
    }

    pub fn set_finished(&mut self, now: DateTime<Utc>) {
        assert!(self.is_started(), "cannot finish task {self}: not started");
        self.status = TaskStatus::Finished;
        self.finished_at = Some(now);
    }

    pub fn set_failed(&mut self, error: impl std::fmt::Display, trace: String) {
        assert!(self.is_started(), "cannot fail task {self}: not started");
        self.status = TaskStatus::Failed;
        self.error = Some(error.to_string());
        self.error_trace = trace;
    }

    /// Used to derive staging file paths: `{index}_{start}_{end}` or `{index}`.
    pub fn filename_friendly_description(&self) -> String {
        match self.window {
            Some(Interval { start, end }) => format!("{}_{}_{}", self.index_name, start, end),
            None => self.index_name.clone(),
        }
    }

    pub fn duration_seconds(&self) -> Option<f64> {
        match (self.started_at, self.finished_at) {
            (Some(started), Some(finished)) => {
                Some((finished - started).num_milliseconds() as f64 / 1000.0)
            }
            _ => None,
        }
    }
}

impl std::fmt::Display for Task {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.window {
            Some(Interval { start, end }) => {
                write!(f, "({}, {} <> {})", self.index_name, start, end)
            }
            None => write!(f, "({})", self.index_name),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pending_task() -> Task {
        Task::new_with_interval("ds".into(), "blocks".into(), Interval::new(0, 60))
    }

    #[test]
    fn lifecycle_happy_path() {
        let mut task = pending_task();
        assert!(task.is_pending());

        task.set_started(Utc::now());
        assert!(task.is_started());

        task.set_finished(Utc::now());
        assert!(task.is_finished());
        assert!(task.duration_seconds().is_some());
    }

    #[test]
    fn lifecycle_failure_path() {
        let mut task = pending_task();
        task.set_started(Utc::now());
        task.set_failed("boom", "trace".into());
        assert!(task.is_failed());
        assert_eq!(task.error.as_deref(), Some("boom"));
    }

    #[test]
    #[should_panic(expected = "not pending")]
    fn cannot_start_twice() {
        let mut task = pending_task();
        task.set_started(Utc::now());
        task.set_started(Utc::now());
    }

    #[test]
    #[should_panic(expected = "not started")]
    fn cannot_finish_before_starting() {
        let mut task = pending_task();
        task.set_finished(Utc::now());
    }

    #[test]
    #[should_panic(expected = "start 60 must be < end 60")]
    fn interval_requires_start_before_end() {
        Interval::new(60, 60);
    }

    #[test]
    fn filename_friendly_description_matches_identity() {
        let with_interval = pending_task();
        assert_eq!(with_interval.filename_friendly_description(), "blocks_0_60");

        let without_interval = Task::new_without_interval("ds".into(), "accounts".into());
        assert_eq!(without_interval.filename_friendly_description(), "accounts");
    }
}
