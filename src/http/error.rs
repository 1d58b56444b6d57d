//! Error types for the direct HTTP executor.

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

/// Longest server-requested wait honoured between attempts.
pub const MAX_RETRY_AFTER: Duration = Duration::from_secs(120);

/// Errors that can occur while transferring a payload over HTTP.
#[derive(Debug, Error)]
pub enum DownloadError {
    /// Network-level error (DNS resolution, connection refused, TLS errors, etc.)
    #[error("network error downloading {url}: {source}")]
    Network {
        /// The URL that failed to download.
        url: String,
        /// The underlying network error.
        #[source]
        source: reqwest::Error,
    },

    /// Request timed out before completion.
    #[error("timeout downloading {url}")]
    Timeout {
        /// The URL that timed out.
        url: String,
    },

    /// HTTP error response (4xx client errors, 5xx server errors).
    #[error("HTTP {status} downloading {url}")]
    HttpStatus {
        /// The URL that returned an error status.
        url: String,
        /// The HTTP status code.
        status: u16,
        /// The Retry-After header value, if present (for 429 responses).
        retry_after: Option<String>,
    },

    /// File system error while staging the payload.
    #[error("IO error writing to {path}: {source}")]
    Io {
        /// The file path where the error occurred.
        path: PathBuf,
        /// The underlying IO error.
        #[source]
        source: std::io::Error,
    },

    /// The provided URL is malformed or invalid.
    #[error("invalid URL: {url}")]
    InvalidUrl {
        /// The invalid URL string.
        url: String,
    },

    /// Body ended before the advertised content length was received.
    #[error("truncated transfer from {url}: expected {expected_bytes} bytes, got {actual_bytes}")]
    Truncated {
        /// The URL being downloaded.
        url: String,
        /// Advertised size in bytes.
        expected_bytes: u64,
        /// Bytes actually received.
        actual_bytes: u64,
    },
}

impl DownloadError {
    /// Creates a network error from a reqwest error.
    pub fn network(url: impl Into<String>, source: reqwest::Error) -> Self {
        Self::Network {
            url: url.into(),
            source,
        }
    }

    /// Creates an HTTP status error.
    pub fn http_status(url: impl Into<String>, status: u16) -> Self {
        Self::HttpStatus {
            url: url.into(),
            status,
            retry_after: None,
        }
    }

    /// Creates an HTTP status error with a Retry-After header value.
    pub fn http_status_with_retry_after(
        url: impl Into<String>,
        status: u16,
        retry_after: Option<String>,
    ) -> Self {
        Self::HttpStatus {
            url: url.into(),
            status,
            retry_after,
        }
    }

    /// Creates a timeout error.
    pub fn timeout(url: impl Into<String>) -> Self {
        Self::Timeout { url: url.into() }
    }

    /// Creates an IO error.
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    /// Creates an invalid URL error.
    pub fn invalid_url(url: impl Into<String>) -> Self {
        Self::InvalidUrl { url: url.into() }
    }

    /// Creates a truncated transfer error.
    pub fn truncated(url: impl Into<String>, expected_bytes: u64, actual_bytes: u64) -> Self {
        Self::Truncated {
            url: url.into(),
            expected_bytes,
            actual_bytes,
        }
    }

    /// Server-requested wait from a `Retry-After: <seconds>` header, capped
    /// at [`MAX_RETRY_AFTER`]. HTTP-date values are ignored.
    #[must_use]
    pub fn retry_after(&self) -> Option<Duration> {
        let Self::HttpStatus {
            retry_after: Some(value),
            ..
        } = self
        else {
            return None;
        };
        let secs: u64 = value.trim().parse().ok()?;
        Some(Duration::from_secs(secs).min(MAX_RETRY_AFTER))
    }
}

// No `From<reqwest::Error>` / `From<std::io::Error>`: every variant needs the
// url or path, so callers go through the constructors above.

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_download_error_timeout_display() {
        let error = DownloadError::timeout("https://example.com/book.epub");
        assert!(error.to_string().contains("timeout"));
        assert!(error.to_string().contains("https://example.com/book.epub"));
    }

    #[test]
    fn test_download_error_http_status_display() {
        let error = DownloadError::http_status("https://example.com/book.epub", 404);
        let msg = error.to_string();
        assert!(msg.contains("404"), "Expected '404' in: {msg}");
        assert!(msg.contains("https://example.com/book.epub"), "Expected URL in: {msg}");
    }

    #[test]
    fn test_download_error_io_display() {
        let io_error = std::io::Error::new(std::io::ErrorKind::PermissionDenied, "access denied");
        let error = DownloadError::io(PathBuf::from("/tmp/book.epub"), io_error);
        assert!(error.to_string().contains("/tmp/book.epub"));
    }

    #[test]
    fn test_download_error_truncated_display() {
        let error = DownloadError::truncated("https://example.com/a.m4b", 100, 40);
        let msg = error.to_string();
        assert!(msg.contains("expected 100 bytes, got 40"), "{msg}");
    }

    #[test]
    fn test_retry_after_seconds_is_parsed_and_capped() {
        let url = "https://example.com/a.epub";
        let error = DownloadError::http_status_with_retry_after(url, 503, Some(" 7 ".into()));
        assert_eq!(error.retry_after(), Some(Duration::from_secs(7)));

        let error = DownloadError::http_status_with_retry_after(url, 429, Some("86400".into()));
        assert_eq!(error.retry_after(), Some(MAX_RETRY_AFTER));

        let dated = Some("Wed, 21 Oct 2015 07:28:00 GMT".to_string());
        let error = DownloadError::http_status_with_retry_after(url, 503, dated);
        assert_eq!(error.retry_after(), None);
        assert_eq!(DownloadError::http_status(url, 503).retry_after(), None);
    }
}
