//! Delivery of staged payloads into their final location.
//!
//! Executors stage their output (a file or a directory) and return its
//! path; after a successful execution the orchestrator hands that path to an
//! [`OutputHandler`], which returns the final location recorded on the task.

pub mod filename;

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::model::DownloadTask;

pub use filename::{Claim, claim_unique_path, filename_from_url, sanitize_filename};

/// Errors raised while delivering a payload.
#[derive(Debug, Error)]
pub enum OutputError {
    /// The staged payload is missing.
    #[error("staged output {path} does not exist")]
    Missing {
        /// Path returned by the executor
        path: PathBuf,
    },

    /// Moving or copying failed.
    #[error("could not deliver {from} to {to}: {source}")]
    Io {
        /// Staged path
        from: PathBuf,
        /// Destination path
        to: PathBuf,
        /// Underlying error
        #[source]
        source: std::io::Error,
    },
}

/// Moves a staged payload to where the user expects it.
#[async_trait]
pub trait OutputHandler: Send + Sync {
    /// Delivers `staged` for `task`, returning the final path.
    async fn deliver(&self, task: &DownloadTask, staged: &Path) -> Result<PathBuf, OutputError>;
}

/// Leaves the payload where the executor put it.
#[derive(Debug, Clone, Copy, Default)]
pub struct KeepInPlace;

#[async_trait]
impl OutputHandler for KeepInPlace {
    async fn deliver(&self, _task: &DownloadTask, staged: &Path) -> Result<PathBuf, OutputError> {
        if tokio::fs::try_exists(staged).await.unwrap_or(false) {
            Ok(staged.to_path_buf())
        } else {
            Err(OutputError::Missing {
                path: staged.to_path_buf(),
            })
        }
    }
}

/// Moves payloads into a destination folder with collision-safe names.
#[derive(Debug, Clone)]
pub struct DestinationFolder {
    dir: PathBuf,
}

impl DestinationFolder {
    /// Creates a handler delivering into `dir`.
    #[must_use]
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// Destination directory.
    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn target_name(task: &DownloadTask, staged: &Path) -> String {
        if let Some(name) = staged.file_name().and_then(|n| n.to_str()) {
            return name.to_string();
        }
        match task.format.as_deref() {
            Some(ext) => format!("{}.{ext}", task.title),
            None => task.title.clone(),
        }
    }
}

#[async_trait]
impl OutputHandler for DestinationFolder {
    #[tracing::instrument(skip(self, task), fields(task_id = %task.id))]
    async fn deliver(&self, task: &DownloadTask, staged: &Path) -> Result<PathBuf, OutputError> {
        let metadata = tokio::fs::metadata(staged).await.map_err(|_| OutputError::Missing {
            path: staged.to_path_buf(),
        })?;

        tokio::fs::create_dir_all(&self.dir)
            .await
            .map_err(|source| OutputError::Io {
                from: staged.to_path_buf(),
                to: self.dir.clone(),
                source,
            })?;

        // The claimed placeholder is replaced by the rename below.
        let claim = if metadata.is_dir() { Claim::Dir } else { Claim::File };
        let target = claim_unique_path(&self.dir, &Self::target_name(task, staged), claim)
            .await
            .map_err(|source| OutputError::Io {
                from: staged.to_path_buf(),
                to: self.dir.clone(),
                source,
            })?;
        let io_error = |source| OutputError::Io {
            from: staged.to_path_buf(),
            to: target.clone(),
            source,
        };

        let moved = match tokio::fs::rename(staged, &target).await {
            Ok(()) => Ok(()),
            Err(error) if metadata.is_file() => {
                // Rename fails across filesystems; fall back to copy + remove.
                debug!(error = %error, "rename failed, copying instead");
                match tokio::fs::copy(staged, &target).await {
                    Ok(_) => {
                        if let Err(error) = tokio::fs::remove_file(staged).await {
                            warn!(path = %staged.display(), error = %error, "could not remove staged file");
                        }
                        Ok(())
                    }
                    Err(error) => Err(error),
                }
            }
            Err(error) => Err(error),
        };
        if let Err(error) = moved {
            release_claim(&target, claim).await;
            return Err(io_error(error));
        }

        info!(path = %target.display(), "Payload delivered");
        Ok(target)
    }
}

async fn release_claim(path: &Path, claim: Claim) {
    let removed = match claim {
        Claim::File => tokio::fs::remove_file(path).await,
        Claim::Dir => tokio::fs::remove_dir(path).await,
    };
    if let Err(error) = removed {
        warn!(path = %path.display(), error = %error, "could not release claimed path");
    }
}
