//! Persisted checkpoint. The only durable commit in the whole pipeline --
//! everything before a successful write here is undone by rewind on restart.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::errors::UsageError;

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct WorkerState {
    pub latest_checkpoint_timestamp: i64,
}

impl WorkerState {
    /// Missing file is not an error here: an absent or zero checkpoint means
    /// "start from `time_partition_start`", resolved by the caller.
    pub fn load_or_default(path: &Path) -> Result<Self, UsageError> {
        if !path.exists() {
            return Ok(Self {
                latest_checkpoint_timestamp: 0,
            });
        }
        let contents = std::fs::read_to_string(path)
            .map_err(|_| UsageError::StateNotFound(path.to_path_buf()))?;
        serde_json::from_str(&contents).map_err(|source| UsageError::MalformedState {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn checkpoint_or(&self, floor: i64) -> i64 {
        self.latest_checkpoint_timestamp.max(floor)
    }

    /// Write-to-temp-then-rename: never an in-place overwrite, so a crash
    /// mid-write never leaves a torn state file behind.
    pub fn save(&self, path: &Path) -> std::io::Result<()> {
        let parent = path.parent().unwrap_or_else(|| Path::new("."));
        let mut tmp = tempfile::NamedTempFile::new_in(parent)?;
        let contents = serde_json::to_string_pretty(self)?;
        std::io::Write::write_all(&mut tmp, contents.as_bytes())?;
        tmp.persist(path)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e))?;
        Ok(())
    }
}

pub fn state_path(workspace: &Path) -> PathBuf {
    workspace.join("worker_state.json")
}

pub fn config_path(workspace: &Path) -> PathBuf {
    workspace.join("worker_config.json")
}
