//! Cache error type.

use thiserror::Error;

/// Errors returned by cache lookups.
///
/// Cloneable so one failed upstream fetch can be handed to every coalesced
/// caller.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CacheError {
    /// The upstream fetch failed; nothing was cached.
    #[error("upstream fetch for '{key}' failed: {message}")]
    Upstream {
        /// Cache key being fetched
        key: String,
        /// Rendered upstream error
        message: String,
    },
}

impl CacheError {
    /// Creates an `Upstream` error.
    #[must_use]
    pub fn upstream(key: &str, message: impl Into<String>) -> Self {
        Self::Upstream {
            key: key.to_string(),
            message: message.into(),
        }
    }
}
