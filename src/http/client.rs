//! Request and streaming helpers for the direct HTTP executor.

use std::path::Path;
use std::time::Duration;

use futures_util::StreamExt;
use reqwest::Client;
use reqwest::header::{CONTENT_DISPOSITION, RETRY_AFTER};
use tokio::fs::File;
use tokio::io::{AsyncWriteExt, BufWriter};
use tokio_util::sync::CancellationToken;
use tracing::debug;
use url::Url;

use super::DownloadError;
use crate::output::{filename_from_url, sanitize_filename};
use crate::plugin::TaskReporter;

/// Default HTTP connect timeout (30 seconds).
pub const CONNECT_TIMEOUT_SECS: u64 = 30;

/// Default HTTP read timeout between body chunks (5 minutes).
pub const READ_TIMEOUT_SECS: u64 = 300;

const USER_AGENT: &str = concat!("shelfdl/", env!("CARGO_PKG_VERSION"));

/// Builds the shared HTTP client.
///
/// # Errors
///
/// Returns the underlying reqwest error if the TLS backend cannot be
/// initialized.
pub fn build_client(
    connect_timeout_secs: u64,
    read_timeout_secs: u64,
) -> Result<Client, reqwest::Error> {
    Client::builder()
        .connect_timeout(Duration::from_secs(connect_timeout_secs))
        .read_timeout(Duration::from_secs(read_timeout_secs))
        .gzip(true)
        .user_agent(USER_AGENT)
        .build()
}

/// Sends a GET and maps failures and non-success statuses to [`DownloadError`].
pub(crate) async fn send_request(
    client: &Client,
    url: &str,
) -> Result<reqwest::Response, DownloadError> {
    let response = client.get(url).send().await.map_err(|e| {
        if e.is_timeout() {
            DownloadError::timeout(url)
        } else {
            DownloadError::network(url, e)
        }
    })?;

    let status = response.status();
    if !status.is_success() {
        let retry_after = response
            .headers()
            .get(RETRY_AFTER)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        return Err(DownloadError::http_status_with_retry_after(
            url,
            status.as_u16(),
            retry_after,
        ));
    }
    Ok(response)
}

/// How a streaming transfer ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum StreamOutcome {
    /// Body fully written; bytes written.
    Finished(u64),
    /// Cancellation observed between chunks.
    Cancelled,
}

/// Streams the response body into `file`, reporting progress when the total
/// size is known and checking `cancel` between chunks.
pub(crate) async fn stream_to_file(
    file: File,
    response: reqwest::Response,
    url: &str,
    file_path: &Path,
    cancel: &CancellationToken,
    reporter: &TaskReporter,
) -> Result<StreamOutcome, DownloadError> {
    let total = response.content_length().filter(|len| *len > 0);
    let mut writer = BufWriter::new(file);
    let mut stream = response.bytes_stream();
    let mut bytes_written: u64 = 0;
    let mut last_reported: u64 = 0;

    loop {
        let next = tokio::select! {
            biased;
            () = cancel.cancelled() => return Ok(StreamOutcome::Cancelled),
            next = stream.next() => next,
        };
        let Some(chunk_result) = next else { break };
        let chunk = chunk_result.map_err(|e| {
            if e.is_timeout() {
                DownloadError::timeout(url)
            } else {
                DownloadError::network(url, e)
            }
        })?;

        writer
            .write_all(&chunk)
            .await
            .map_err(|e| DownloadError::io(file_path.to_path_buf(), e))?;
        bytes_written += chunk.len() as u64;

        if let Some(total) = total {
            let percent = (bytes_written.saturating_mul(100) / total).min(100);
            if percent > last_reported {
                last_reported = percent;
                #[allow(clippy::cast_precision_loss)]
                let percent = percent as f64;
                reporter.progress(percent);
            }
        }
    }

    writer
        .flush()
        .await
        .map_err(|e| DownloadError::io(file_path.to_path_buf(), e))?;

    if let Some(expected) = total
        && expected != bytes_written
    {
        return Err(DownloadError::truncated(url, expected, bytes_written));
    }

    debug!(bytes = bytes_written, path = %file_path.display(), "Body streamed");
    Ok(StreamOutcome::Finished(bytes_written))
}

/// Filename from Content-Disposition, else from the URL path.
pub(crate) fn extract_filename(response: &reqwest::Response, url: &Url) -> String {
    if let Some(filename) = response
        .headers()
        .get(CONTENT_DISPOSITION)
        .and_then(|cd| cd.to_str().ok())
        .and_then(parse_content_disposition)
    {
        return sanitize_filename(&filename);
    }
    filename_from_url(url)
}

/// Parses the filename out of a Content-Disposition header value.
///
/// `filename*=` (RFC 5987) wins over plain `filename=`.
pub(crate) fn parse_content_disposition(header: &str) -> Option<String> {
    if let Some(pos) = header.find("filename*=") {
        let value = header[pos + 10..].trim();
        if let Some(quote_pos) = value.find("''") {
            let encoded = &value[quote_pos + 2..];
            let end = encoded.find(';').unwrap_or(encoded.len());
            if let Ok(decoded) = urlencoding::decode(encoded[..end].trim()) {
                return Some(decoded.into_owned());
            }
        }
    }

    let pos = header.find("filename=")?;
    let value = header[pos + 9..].trim();
    if let Some(stripped) = value.strip_prefix('"') {
        return stripped.find('"').map(|end| stripped[..end].to_string());
    }
    let end = value.find(';').unwrap_or(value.len());
    let filename = value[..end].trim();
    (!filename.is_empty()).then(|| filename.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_content_disposition_quoted() {
        assert_eq!(
            parse_content_disposition(r#"attachment; filename="Dune.epub""#),
            Some("Dune.epub".to_string())
        );
    }

    #[test]
    fn test_parse_content_disposition_unquoted_with_semicolon() {
        assert_eq!(
            parse_content_disposition("attachment; filename=dune.epub; size=10"),
            Some("dune.epub".to_string())
        );
    }

    #[test]
    fn test_parse_content_disposition_rfc5987() {
        assert_eq!(
            parse_content_disposition("attachment; filename*=UTF-8''Der%20W%C3%BCstenplanet.epub"),
            Some("Der Wüstenplanet.epub".to_string())
        );
    }

    #[test]
    fn test_parse_content_disposition_missing() {
        assert_eq!(parse_content_disposition("inline"), None);
    }

    #[test]
    fn test_build_client_with_defaults() {
        assert!(build_client(CONNECT_TIMEOUT_SECS, READ_TIMEOUT_SECS).is_ok());
    }
}
