//! Error types for plugin registration and plugin calls.

use thiserror::Error;

use crate::http::DownloadError;

/// Errors raised while building the plugin registry.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RegistryError {
    /// Two plugins of the same kind were registered under one name
    #[error("duplicate {kind} registration for '{name}'\n  Suggestion: Give each plugin a unique name")]
    Duplicate {
        /// "source" or "executor"
        kind: &'static str,
        /// The conflicting name
        name: String,
    },

    /// A source/executor pair was registered with differing names
    #[error("source '{source_name}' and executor '{executor_name}' must share a name")]
    NameMismatch {
        /// Name reported by the source
        source_name: String,
        /// Name reported by the executor
        executor_name: String,
    },
}

impl RegistryError {
    /// Creates a `Duplicate` error.
    #[must_use]
    pub fn duplicate(kind: &'static str, name: &str) -> Self {
        Self::Duplicate {
            kind,
            name: name.to_string(),
        }
    }
}

/// Errors a release source may return from a probe or a search.
///
/// These never reach callers of the aggregator: they are logged and
/// reported in the search outcome.
#[derive(Debug, Clone, Error)]
pub enum SourceError {
    /// Upstream request failed
    #[error("request to {source_name} failed: {message}")]
    Request {
        /// Source name
        source_name: String,
        /// Failure detail
        message: String,
    },

    /// Upstream answered with something unparseable
    #[error("could not parse response from {source_name}: {message}")]
    Parse {
        /// Source name
        source_name: String,
        /// Failure detail
        message: String,
    },

    /// Source is missing configuration (API key, URL, ...)
    #[error("{source_name} is not configured: {missing}")]
    NotConfigured {
        /// Source name
        source_name: String,
        /// What is missing
        missing: String,
    },
}

impl SourceError {
    /// Creates a `Request` error.
    #[must_use]
    pub fn request(source_name: &str, message: impl Into<String>) -> Self {
        Self::Request {
            source_name: source_name.to_string(),
            message: message.into(),
        }
    }

    /// Creates a `Parse` error.
    #[must_use]
    pub fn parse(source_name: &str, message: impl Into<String>) -> Self {
        Self::Parse {
            source_name: source_name.to_string(),
            message: message.into(),
        }
    }

    /// Creates a `NotConfigured` error.
    #[must_use]
    pub fn not_configured(source_name: &str, missing: impl Into<String>) -> Self {
        Self::NotConfigured {
            source_name: source_name.to_string(),
            missing: missing.into(),
        }
    }
}

/// Errors an executor may return from `execute`.
#[derive(Debug, Error)]
pub enum ExecutorError {
    /// Transfer failed
    #[error(transparent)]
    Download(#[from] DownloadError),

    /// Local filesystem failure
    #[error("file system error: {0}")]
    Io(#[from] std::io::Error),

    /// The task lacks something the executor needs
    #[error("{0}")]
    InvalidTask(String),

    /// Any other executor-specific failure
    #[error("{0}")]
    Failed(String),
}

impl ExecutorError {
    /// Creates an `InvalidTask` error.
    #[must_use]
    pub fn invalid_task(message: impl Into<String>) -> Self {
        Self::InvalidTask(message.into())
    }

    /// Creates a `Failed` error.
    #[must_use]
    pub fn failed(message: impl Into<String>) -> Self {
        Self::Failed(message.into())
    }
}
