//! Per-task staging file paths, lifetimes bounded by the task that created them.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

pub struct FileStorage {
    extracted_folder: PathBuf,
    transformed_folder: PathBuf,
}

impl FileStorage {
    pub fn new(workspace: &Path) -> Result<Self> {
        let extracted_folder = workspace.join("extracted");
        let transformed_folder = workspace.join("transformed");

        fs::create_dir_all(&extracted_folder).context("failed to create extracted/ folder")?;
        fs::create_dir_all(&transformed_folder).context("failed to create transformed/ folder")?;

        Ok(Self {
            extracted_folder,
            transformed_folder,
        })
    }

    pub fn extracted_path(&self, task_description: &str) -> PathBuf {
        self.extracted_folder
            .join(format!("{task_description}_extracted.json"))
    }

    pub fn transformed_path(&self, task_description: &str) -> PathBuf {
        self.transformed_folder
            .join(format!("{task_description}_transformed.json"))
    }

    /// Transformed path if it exists, else the extracted path (index types
    /// that need no transform skip writing a transformed file at all).
    pub fn load_path(&self, task_description: &str) -> PathBuf {
        let transformed = self.transformed_path(task_description);
        if transformed.exists() {
            transformed
        } else {
            self.extracted_path(task_description)
        }
    }

    pub fn remove_extracted(&self, task_description: &str) {
        remove_if_exists(&self.extracted_path(task_description));
    }

    pub fn remove_transformed(&self, task_description: &str) {
        remove_if_exists(&self.transformed_path(task_description));
    }
}

fn remove_if_exists(path: &Path) {
    if let Err(e) = fs::remove_file(path) {
        if e.kind() != std::io::ErrorKind::NotFound {
            tracing::warn!(path = %path.display(), error = %e, "failed to remove staging file");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn load_path_prefers_transformed_when_present() {
        let dir = tempfile::tempdir().unwrap();
        let storage = FileStorage::new(dir.path()).unwrap();

        assert_eq!(
            storage.load_path("blocks_0_60"),
            storage.extracted_path("blocks_0_60")
        );

        fs::write(storage.transformed_path("blocks_0_60"), "{}\n").unwrap();
        assert_eq!(
            storage.load_path("blocks_0_60"),
            storage.transformed_path("blocks_0_60")
        );
    }

    #[test]
    fn remove_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let storage = FileStorage::new(dir.path()).unwrap();
        storage.remove_extracted("missing");
        storage.remove_transformed("missing");

        fs::write(storage.extracted_path("present"), "{}\n").unwrap();
        storage.remove_extracted("present");
        assert!(!storage.extracted_path("present").exists());
        storage.remove_extracted("present");
    }
}
