//! Task table persistence to a JSON state file.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::model::{DownloadTask, TaskStatus};
use crate::plugin::PluginRegistry;

const STATE_VERSION: u32 = 1;

/// Message given to tasks that were running when the process stopped.
pub const INTERRUPTED_MESSAGE: &str = "Interrupted before completion";

/// Errors reading or writing the state file.
#[derive(Debug, Error)]
pub enum PersistenceError {
    /// Filesystem failure.
    #[error("state file I/O failed for {path}: {source}")]
    Io {
        /// State file path
        path: PathBuf,
        /// Underlying error
        #[source]
        source: std::io::Error,
    },

    /// The file does not contain a valid task list.
    #[error("state file {path} is corrupt: {source}")]
    Format {
        /// State file path
        path: PathBuf,
        /// Underlying error
        #[source]
        source: serde_json::Error,
    },
}

impl PersistenceError {
    fn io(path: &Path, source: std::io::Error) -> Self {
        Self::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct PersistedState {
    version: u32,
    tasks: Vec<DownloadTask>,
}

/// JSON file holding every task record, written atomically.
#[derive(Debug, Clone)]
pub struct StateFile {
    path: PathBuf,
}

impl StateFile {
    /// Uses `path` as the state file.
    #[must_use]
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Path of the state file.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Reads every stored task. A missing file yields an empty list.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub async fn load(&self) -> Result<Vec<DownloadTask>, PersistenceError> {
        let raw = match tokio::fs::read(&self.path).await {
            Ok(raw) => raw,
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = %self.path.display(), "No state file yet");
                return Ok(Vec::new());
            }
            Err(error) => return Err(PersistenceError::io(&self.path, error)),
        };
        let state: PersistedState =
            serde_json::from_slice(&raw).map_err(|source| PersistenceError::Format {
                path: self.path.clone(),
                source,
            })?;
        if state.version != STATE_VERSION {
            warn!(
                path = %self.path.display(),
                version = state.version,
                "Unexpected state file version, loading anyway"
            );
        }
        Ok(state.tasks)
    }

    /// Writes `tasks` through a temporary file and rename.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be written.
    pub async fn save(&self, tasks: Vec<DownloadTask>) -> Result<(), PersistenceError> {
        let mut tasks = tasks;
        tasks.sort_by(|a, b| a.id.cmp(&b.id));
        let count = tasks.len();
        let state = PersistedState {
            version: STATE_VERSION,
            tasks,
        };
        let body = serde_json::to_vec_pretty(&state).map_err(|source| PersistenceError::Format {
            path: self.path.clone(),
            source,
        })?;

        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|error| PersistenceError::io(parent, error))?;
        }
        let temp = self.temp_path();
        tokio::fs::write(&temp, body)
            .await
            .map_err(|error| PersistenceError::io(&temp, error))?;
        tokio::fs::rename(&temp, &self.path)
            .await
            .map_err(|error| PersistenceError::io(&self.path, error))?;
        debug!(path = %self.path.display(), tasks = count, "Saved task state");
        Ok(())
    }

    fn temp_path(&self) -> PathBuf {
        let mut name = self
            .path
            .file_name()
            .map(std::ffi::OsStr::to_os_string)
            .unwrap_or_default();
        name.push(".tmp");
        self.path.with_file_name(name)
    }
}

/// Applies restore rules to loaded records.
///
/// Records whose source has no executor are dropped, queued records stay
/// queued, records caught mid-execution become errors and terminal records
/// are kept as they were.
#[must_use]
pub fn restore_tasks(tasks: Vec<DownloadTask>, registry: &PluginRegistry) -> Vec<DownloadTask> {
    let loaded = tasks.len();
    let restored: Vec<DownloadTask> = tasks
        .into_iter()
        .filter(|task| {
            let known = registry.get_handler(&task.source).is_some();
            if !known {
                debug!(task_id = %task.id, source = %task.source, "Dropping task for unknown source");
            }
            known
        })
        .map(|mut task| {
            if task.status.is_active() {
                task.status = TaskStatus::Error;
                task.status_message = Some(INTERRUPTED_MESSAGE.to_string());
            }
            task
        })
        .collect();
    info!(loaded, restored = restored.len(), "Restored task state");
    restored
}
