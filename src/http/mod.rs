//! Reference direct-download executor.
//!
//! [`DirectHttpExecutor`] streams a task's `download_url` into a staging
//! directory, honouring the cancellation token between chunks and retrying
//! transient failures internally with [`RetryPolicy`].

mod client;
mod error;
mod retry;

pub use client::{CONNECT_TIMEOUT_SECS, READ_TIMEOUT_SECS, build_client};
pub use error::DownloadError;
pub use retry::{DEFAULT_MAX_RETRIES, FailureType, RetryDecision, RetryPolicy, classify_error};

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use reqwest::Client;
use tokio::fs::OpenOptions;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use url::Url;

use crate::model::{DownloadTask, Release, ReleaseProtocol};
use crate::output::{Claim, claim_unique_path, filename_from_url};
use crate::plugin::{DownloadExecutor, ExecutorError, ReportedStatus, TaskReporter};

use client::{StreamOutcome, extract_filename, send_request, stream_to_file};

/// Registry name of the direct HTTP executor.
pub const DIRECT_HTTP: &str = "direct_http";

/// Downloads a URL over plain HTTP(S).
#[derive(Debug, Clone)]
pub struct DirectHttpExecutor {
    client: Client,
    staging_dir: PathBuf,
    retry: RetryPolicy,
}

impl DirectHttpExecutor {
    /// Creates an executor staging into `staging_dir` with default timeouts.
    ///
    /// # Errors
    ///
    /// Returns the reqwest error if the client cannot be built.
    pub fn new(staging_dir: impl Into<PathBuf>) -> Result<Self, reqwest::Error> {
        let client = build_client(CONNECT_TIMEOUT_SECS, READ_TIMEOUT_SECS)?;
        Ok(Self::with_client(client, staging_dir))
    }

    /// Creates an executor around an existing client.
    #[must_use]
    pub fn with_client(client: Client, staging_dir: impl Into<PathBuf>) -> Self {
        Self {
            client,
            staging_dir: staging_dir.into(),
            retry: RetryPolicy::default(),
        }
    }

    /// Replaces the retry policy.
    #[must_use]
    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Staging directory.
    #[must_use]
    pub fn staging_dir(&self) -> &Path {
        &self.staging_dir
    }

    /// Builds a release for a bare URL, owned by this executor.
    ///
    /// The URL doubles as the source-local id, so enqueueing the same URL
    /// twice is idempotent.
    ///
    /// # Errors
    ///
    /// Returns `DownloadError::InvalidUrl` unless the URL is http(s).
    pub fn release_for_url(url: &str) -> Result<Release, DownloadError> {
        let parsed = Url::parse(url).map_err(|_| DownloadError::invalid_url(url))?;
        if !matches!(parsed.scheme(), "http" | "https") {
            return Err(DownloadError::invalid_url(url));
        }
        let title = filename_from_url(&parsed);
        let mut release = Release::new(DIRECT_HTTP, parsed.as_str(), title.clone());
        release.download_url = Some(parsed.to_string());
        release.protocol = ReleaseProtocol::Http;
        release.format = Path::new(&title)
            .extension()
            .and_then(|e| e.to_str())
            .map(str::to_lowercase);
        Ok(release)
    }

    async fn attempt(
        &self,
        url: &Url,
        cancel: &CancellationToken,
        reporter: &TaskReporter,
    ) -> Result<Option<PathBuf>, DownloadError> {
        let response = tokio::select! {
            biased;
            () = cancel.cancelled() => return Ok(None),
            response = send_request(&self.client, url.as_str()) => response?,
        };

        tokio::fs::create_dir_all(&self.staging_dir)
            .await
            .map_err(|e| DownloadError::io(self.staging_dir.clone(), e))?;
        let file_path =
            claim_unique_path(&self.staging_dir, &extract_filename(&response, url), Claim::File)
                .await
                .map_err(|e| DownloadError::io(self.staging_dir.clone(), e))?;
        let file = match OpenOptions::new().write(true).open(&file_path).await {
            Ok(file) => file,
            Err(e) => {
                remove_partial(&file_path).await;
                return Err(DownloadError::io(file_path, e));
            }
        };

        reporter.downloading();
        reporter.progress(0.0);

        let outcome =
            stream_to_file(file, response, url.as_str(), &file_path, cancel, reporter).await;
        match outcome {
            Ok(StreamOutcome::Finished(bytes)) => {
                info!(path = %file_path.display(), bytes, "Download staged");
                Ok(Some(file_path))
            }
            Ok(StreamOutcome::Cancelled) => {
                debug!(path = %file_path.display(), "Cancelled mid-transfer, removing partial file");
                remove_partial(&file_path).await;
                Ok(None)
            }
            Err(error) => {
                debug!(path = %file_path.display(), "Cleaning up partial file after error");
                remove_partial(&file_path).await;
                Err(error)
            }
        }
    }
}

async fn remove_partial(path: &Path) {
    if let Err(error) = tokio::fs::remove_file(path).await {
        warn!(path = %path.display(), error = %error, "could not remove partial file");
    }
}

#[async_trait]
impl DownloadExecutor for DirectHttpExecutor {
    fn name(&self) -> &str {
        DIRECT_HTTP
    }

    #[tracing::instrument(skip(self, task, cancel, reporter), fields(task_id = %task.id))]
    async fn execute(
        &self,
        task: &DownloadTask,
        cancel: CancellationToken,
        reporter: TaskReporter,
    ) -> Result<Option<PathBuf>, ExecutorError> {
        let raw_url = task
            .download_url
            .as_deref()
            .ok_or_else(|| ExecutorError::invalid_task("task has no download URL"))?;
        let url = Url::parse(raw_url).map_err(|_| DownloadError::invalid_url(raw_url))?;

        reporter.resolving(format!("Connecting to {}", url.host_str().unwrap_or("server")));

        let mut attempt = 1;
        loop {
            if cancel.is_cancelled() {
                return Ok(None);
            }
            let error = match self.attempt(&url, &cancel, &reporter).await {
                Ok(path) => return Ok(path),
                Err(error) => error,
            };
            match self.retry.should_retry(classify_error(&error), attempt) {
                RetryDecision::Retry { delay, attempt: next } => {
                    let delay = error.retry_after().map_or(delay, |wait| delay.max(wait));
                    warn!(error = %error, attempt = next, ?delay, "Transient download failure, retrying");
                    reporter.status(
                        ReportedStatus::Downloading,
                        Some(format!(
                            "Retrying ({next}/{}): {error}",
                            self.retry.max_attempts()
                        )),
                    );
                    tokio::select! {
                        biased;
                        () = cancel.cancelled() => return Ok(None),
                        () = tokio::time::sleep(delay) => {}
                    }
                    attempt = next;
                }
                RetryDecision::DoNotRetry { reason } => {
                    debug!(reason = %reason, "Giving up");
                    return Err(error.into());
                }
            }
        }
    }
}
