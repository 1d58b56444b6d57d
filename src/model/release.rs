//! Release candidates returned by search providers.

use std::collections::HashMap;
use std::fmt;

use serde::{Deserialize, Serialize};

/// Transfer protocol a release is delivered over.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReleaseProtocol {
    /// Direct HTTP download.
    #[default]
    Http,
    /// BitTorrent.
    Torrent,
    /// Usenet NZB.
    Nzb,
    /// IRC DCC transfer.
    Dcc,
}

impl ReleaseProtocol {
    /// Returns the wire string representation.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Http => "http",
            Self::Torrent => "torrent",
            Self::Nzb => "nzb",
            Self::Dcc => "dcc",
        }
    }
}

impl fmt::Display for ReleaseProtocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Kind of media a release contains.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContentType {
    /// Ebook formats (epub, pdf, mobi, ...).
    #[default]
    Ebook,
    /// Audiobook formats (m4b, mp3, ...).
    Audiobook,
}

impl ContentType {
    /// Returns the wire string representation.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Ebook => "ebook",
            Self::Audiobook => "audiobook",
        }
    }
}

impl fmt::Display for ContentType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// One downloadable candidate for a book, from a single source.
///
/// Every source returns this same structure. Releases are produced fresh per
/// search and never persisted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Release {
    /// Registry name of the source that produced this release.
    pub source: String,
    /// Identifier within that source; becomes the task id on enqueue.
    pub source_id: String,
    /// Release title as reported by the source.
    pub title: String,
    /// File format.
    pub format: Option<String>,
    /// ISO 639-1 language code.
    pub language: Option<String>,
    /// Human readable size ("12.4 MB").
    pub size: Option<String>,
    /// Size in bytes when the source reports it.
    pub size_bytes: Option<u64>,
    /// Direct URL to the payload, when known at search time.
    pub download_url: Option<String>,
    /// Link to a release information page.
    pub info_url: Option<String>,
    /// Transfer protocol.
    #[serde(default)]
    pub protocol: ReleaseProtocol,
    /// Display name of the indexer or mirror that listed the release.
    pub indexer: Option<String>,
    /// Torrent seeders.
    pub seeders: Option<u32>,
    /// Torrent "seeders/leechers" display string.
    pub peers: Option<String>,
    /// Ebook or audiobook.
    pub content_type: Option<ContentType>,
    /// Source-specific attributes (author, cover URL, quality, ...).
    #[serde(default)]
    pub extra: HashMap<String, serde_json::Value>,
}

impl Release {
    /// Creates a minimal HTTP release with no optional attributes.
    #[must_use]
    pub fn new(
        source: impl Into<String>,
        source_id: impl Into<String>,
        title: impl Into<String>,
    ) -> Self {
        Self {
            source: source.into(),
            source_id: source_id.into(),
            title: title.into(),
            format: None,
            language: None,
            size: None,
            size_bytes: None,
            download_url: None,
            info_url: None,
            protocol: ReleaseProtocol::Http,
            indexer: None,
            seeders: None,
            peers: None,
            content_type: None,
            extra: HashMap::new(),
        }
    }

    /// Returns a string-valued extra attribute.
    #[must_use]
    pub fn extra_str(&self, key: &str) -> Option<&str> {
        self.extra.get(key).and_then(serde_json::Value::as_str)
    }

    /// Key used to de-duplicate releases across and within sources.
    #[must_use]
    pub fn dedup_key(&self) -> (&str, &str) {
        (self.source.as_str(), self.source_id.as_str())
    }
}
