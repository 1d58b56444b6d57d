//! Size-bounded cover image cache.

use std::sync::Arc;
use std::time::Duration;

use futures_util::FutureExt;
use reqwest::StatusCode;
use reqwest::header::CONTENT_TYPE;

use super::{CacheConfig, CacheError, CacheStats, TtlCache};

const SECS_PER_DAY: u64 = 86_400;
const BYTES_PER_MB: u64 = 1024 * 1024;

/// A cached cover image.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CoverImage {
    /// Raw image bytes.
    pub data: Arc<[u8]>,
    /// Content-Type reported by the upstream.
    pub content_type: Option<String>,
}

impl CoverImage {
    /// Wraps image bytes.
    #[must_use]
    pub fn new(data: impl Into<Arc<[u8]>>, content_type: Option<String>) -> Self {
        Self {
            data: data.into(),
            content_type,
        }
    }

    /// Size in bytes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Returns true for an empty image.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

fn weigh(cover: &Option<CoverImage>) -> u64 {
    cover.as_ref().map_or(0, |c| c.len() as u64)
}

/// Cover cache keyed by image URL.
///
/// `None` records a cover the upstream does not have, so repeated lookups
/// for missing covers do not hit the network.
#[derive(Debug, Clone)]
pub struct CoverCache {
    cache: TtlCache<Option<CoverImage>>,
}

impl CoverCache {
    /// Creates a cache from user-facing settings: TTL in days (zero means
    /// forever) and ceiling in megabytes.
    #[must_use]
    pub fn new(enabled: bool, ttl_days: u64, max_size_mb: u64) -> Self {
        let config = CacheConfig::new(Duration::from_secs(ttl_days.saturating_mul(SECS_PER_DAY)))
            .enabled(enabled)
            .max_bytes(max_size_mb.saturating_mul(BYTES_PER_MB));
        Self::with_config(config)
    }

    /// Creates a cache from a raw config.
    #[must_use]
    pub fn with_config(config: CacheConfig) -> Self {
        Self {
            cache: TtlCache::with_weigher("covers", config, weigh),
        }
    }

    /// Returns the cover for `url`, fetching it on a miss.
    ///
    /// # Errors
    ///
    /// Returns `CacheError::Upstream` when the fetch fails.
    pub async fn get_or_fetch<F, Fut, E>(
        &self,
        url: &str,
        fetch: F,
    ) -> Result<Option<CoverImage>, CacheError>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: std::future::Future<Output = Result<Option<CoverImage>, E>> + Send + 'static,
        E: std::fmt::Display + Send + 'static,
    {
        self.cache.get_or_fetch(url, fetch).await
    }

    /// Returns the cover for `url`, downloading it with `client` on a miss.
    ///
    /// A 404 is cached as a missing cover.
    ///
    /// # Errors
    ///
    /// Returns `CacheError::Upstream` for network errors and other non-success
    /// statuses.
    pub async fn fetch_http(
        &self,
        client: &reqwest::Client,
        url: &str,
    ) -> Result<Option<CoverImage>, CacheError> {
        let client = client.clone();
        let target = url.to_string();
        self.get_or_fetch(url, move || {
            async move {
                let response = client.get(&target).send().await?;
                if response.status() == StatusCode::NOT_FOUND {
                    return Ok(None);
                }
                let response = response.error_for_status()?;
                let content_type = response
                    .headers()
                    .get(CONTENT_TYPE)
                    .and_then(|v| v.to_str().ok())
                    .map(str::to_string);
                let bytes = response.bytes().await?;
                Ok::<_, reqwest::Error>(Some(CoverImage::new(bytes.to_vec(), content_type)))
            }
            .boxed()
        })
        .await
    }

    /// Drops the cover for `url`.
    pub fn invalidate(&self, url: &str) -> bool {
        self.cache.invalidate(url)
    }

    /// Drops every cover.
    pub fn clear(&self) {
        self.cache.clear();
    }

    /// Current counters.
    #[must_use]
    pub fn stats(&self) -> CacheStats {
        self.cache.stats()
    }
}
