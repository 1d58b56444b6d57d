//! TTL caches protecting upstream providers from redundant calls.
//!
//! [`TtlCache`] memoizes keyed async fetches:
//!
//! - entries expire after a per-insert TTL (zero means never)
//! - concurrent misses for one key share a single upstream fetch
//! - errors reach every coalesced caller and are never stored
//! - an optional byte ceiling evicts the oldest insertions first
//!
//! [`MetadataCache`] and [`CoverCache`] are the two configured instances the
//! process context wires up.

mod cover;
mod error;
mod store;

pub use cover::{CoverCache, CoverImage};
pub use error::CacheError;

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use futures_util::FutureExt;
use futures_util::future::{BoxFuture, Shared};
use serde::Serialize;
use tokio::time::Instant;
use tracing::{debug, warn};

use store::{EntryStore, Insert};

/// Sizes a value for the byte ceiling.
pub type Weigher<V> = fn(&V) -> u64;

/// Construction-time cache settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheConfig {
    /// When false every lookup misses and nothing is stored.
    pub enabled: bool,
    /// Default TTL; zero means entries never expire.
    pub ttl: Duration,
    /// Byte ceiling across all entries, if any.
    pub max_bytes: Option<u64>,
}

impl CacheConfig {
    /// Enabled cache with the given default TTL and no byte ceiling.
    #[must_use]
    pub fn new(ttl: Duration) -> Self {
        Self {
            enabled: true,
            ttl,
            max_bytes: None,
        }
    }

    /// Sets the byte ceiling.
    #[must_use]
    pub fn max_bytes(mut self, max_bytes: u64) -> Self {
        self.max_bytes = Some(max_bytes);
        self
    }

    /// Sets the enabled flag.
    #[must_use]
    pub fn enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }
}

/// Point-in-time cache counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct CacheStats {
    /// Live entries (expired entries are purged first).
    pub entries: usize,
    /// Bytes held, as measured by the weigher.
    pub bytes: u64,
    /// Configured byte ceiling.
    pub max_bytes: Option<u64>,
    /// Lookups served from the cache.
    pub hits: u64,
    /// Lookups that went upstream or joined an in-flight fetch.
    pub misses: u64,
    /// Fetches currently running.
    pub in_flight: usize,
    /// Whether the cache is enabled.
    pub enabled: bool,
}

type SharedFetch<V> = Shared<BoxFuture<'static, Result<V, CacheError>>>;

struct InFlight<V> {
    generation: u64,
    fetch: SharedFetch<V>,
    /// Callers currently awaiting `fetch`. The fetch only runs while polled.
    waiters: usize,
}

struct State<V> {
    store: EntryStore<V>,
    in_flight: HashMap<String, InFlight<V>>,
    next_generation: u64,
}

struct Inner<V> {
    name: &'static str,
    config: CacheConfig,
    weigher: Weigher<V>,
    state: Mutex<State<V>>,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl<V> Inner<V> {
    fn lock(&self) -> MutexGuard<'_, State<V>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl<V: Clone> Inner<V> {
    fn finish(&self, key: &str, generation: u64, ttl: Option<Duration>, result: &Result<V, CacheError>) {
        let mut state = self.lock();
        let current = state
            .in_flight
            .get(key)
            .is_some_and(|f| f.generation == generation);
        if !current {
            // Invalidated or cleared while fetching; the result is not stored.
            return;
        }
        state.in_flight.remove(key);

        let Ok(value) = result else { return };
        if !self.config.enabled {
            return;
        }
        let bytes = (self.weigher)(value);
        match state
            .store
            .insert(key.to_string(), value.clone(), ttl, bytes, Instant::now())
        {
            Insert::Stored { evicted } if evicted > 0 => {
                debug!(cache = self.name, key, evicted, "Evicted oldest entries");
            }
            Insert::Stored { .. } => {}
            Insert::TooLarge => {
                debug!(cache = self.name, key, bytes, "Entry exceeds cache ceiling, not stored");
            }
        }
    }
}

/// Registration of one caller awaiting an in-flight fetch.
///
/// Dropping the last waiter before the fetch finishes abandons it, so the
/// next lookup for the key starts a fresh upstream call.
struct Waiter<'a, V> {
    inner: &'a Inner<V>,
    key: &'a str,
    generation: u64,
}

impl<V> Drop for Waiter<'_, V> {
    fn drop(&mut self) {
        let mut state = self.inner.lock();
        let Some(in_flight) = state.in_flight.get_mut(self.key) else {
            return;
        };
        if in_flight.generation != self.generation {
            return;
        }
        in_flight.waiters = in_flight.waiters.saturating_sub(1);
        if in_flight.waiters == 0 {
            state.in_flight.remove(self.key);
            debug!(cache = self.inner.name, key = self.key, "In-flight fetch abandoned");
        }
    }
}

/// Keyed async memoizer with TTL, coalescing and optional byte ceiling.
///
/// Cheap to clone; clones share state.
pub struct TtlCache<V> {
    inner: Arc<Inner<V>>,
}

impl<V> Clone for TtlCache<V> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<V> fmt::Debug for TtlCache<V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TtlCache")
            .field("name", &self.inner.name)
            .field("config", &self.inner.config)
            .finish_non_exhaustive()
    }
}

impl<V> TtlCache<V>
where
    V: Clone + Send + Sync + 'static,
{
    /// Creates a cache where every entry weighs zero bytes.
    #[must_use]
    pub fn new(name: &'static str, config: CacheConfig) -> Self {
        Self::with_weigher(name, config, |_| 0)
    }

    /// Creates a cache sizing entries with `weigher`.
    #[must_use]
    pub fn with_weigher(name: &'static str, config: CacheConfig, weigher: Weigher<V>) -> Self {
        Self {
            inner: Arc::new(Inner {
                name,
                config,
                weigher,
                state: Mutex::new(State {
                    store: EntryStore::new(config.max_bytes),
                    in_flight: HashMap::new(),
                    next_generation: 0,
                }),
                hits: AtomicU64::new(0),
                misses: AtomicU64::new(0),
            }),
        }
    }

    /// Returns true unless the cache was disabled by configuration.
    #[must_use]
    pub fn is_enabled(&self) -> bool {
        self.inner.config.enabled
    }

    /// Returns the cached value for `key`, or fetches it with the default TTL.
    ///
    /// # Errors
    ///
    /// Returns `CacheError::Upstream` when the fetch fails or panics. The
    /// error is not cached.
    pub async fn get_or_fetch<F, Fut, E>(&self, key: &str, fetch: F) -> Result<V, CacheError>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<V, E>> + Send + 'static,
        E: fmt::Display + Send + 'static,
    {
        self.get_or_fetch_with_ttl(key, None, fetch).await
    }

    /// Like [`get_or_fetch`](Self::get_or_fetch) with a TTL for this insert.
    ///
    /// `ttl` overrides the configured default; zero means never expire.
    ///
    /// # Errors
    ///
    /// Returns `CacheError::Upstream` when the fetch fails or panics.
    pub async fn get_or_fetch_with_ttl<F, Fut, E>(
        &self,
        key: &str,
        ttl: Option<Duration>,
        fetch: F,
    ) -> Result<V, CacheError>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<V, E>> + Send + 'static,
        E: fmt::Display + Send + 'static,
    {
        let (shared, generation) = {
            let mut state = self.inner.lock();
            if self.inner.config.enabled
                && let Some(value) = state.store.get(key, Instant::now())
            {
                self.inner.hits.fetch_add(1, Ordering::Relaxed);
                return Ok(value);
            }
            self.inner.misses.fetch_add(1, Ordering::Relaxed);

            if let Some(in_flight) = state.in_flight.get_mut(key) {
                debug!(cache = self.inner.name, key, "Joining in-flight fetch");
                in_flight.waiters += 1;
                (in_flight.fetch.clone(), in_flight.generation)
            } else {
                let generation = state.next_generation;
                state.next_generation += 1;
                let shared = self.spawn_fetch(key, generation, self.effective_ttl(ttl), fetch);
                state.in_flight.insert(
                    key.to_string(),
                    InFlight {
                        generation,
                        fetch: shared.clone(),
                        waiters: 1,
                    },
                );
                (shared, generation)
            }
        };
        let _waiter = Waiter {
            inner: &self.inner,
            key,
            generation,
        };
        shared.await
    }

    /// Returns a live cached value without fetching.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<V> {
        if !self.inner.config.enabled {
            return None;
        }
        self.inner.lock().store.get(key, Instant::now())
    }

    /// Stores a value directly. `ttl` overrides the default; zero means never.
    pub fn insert(&self, key: &str, value: V, ttl: Option<Duration>) {
        if !self.inner.config.enabled {
            return;
        }
        let bytes = (self.inner.weigher)(&value);
        let ttl = self.effective_ttl(ttl);
        let mut state = self.inner.lock();
        // A direct insert supersedes any fetch still running for the key.
        state.in_flight.remove(key);
        state
            .store
            .insert(key.to_string(), value, ttl, bytes, Instant::now());
    }

    /// Drops the entry for `key`; a fetch already running will not be stored.
    pub fn invalidate(&self, key: &str) -> bool {
        let mut state = self.inner.lock();
        let had_fetch = state.in_flight.remove(key).is_some();
        state.store.remove(key) || had_fetch
    }

    /// Drops every entry.
    pub fn clear(&self) {
        let mut state = self.inner.lock();
        state.in_flight.clear();
        state.store.clear();
        debug!(cache = self.inner.name, "Cache cleared");
    }

    /// Returns current counters after purging expired entries.
    #[must_use]
    pub fn stats(&self) -> CacheStats {
        let mut state = self.inner.lock();
        state.store.purge_expired(Instant::now());
        CacheStats {
            entries: state.store.len(),
            bytes: state.store.total_bytes(),
            max_bytes: self.inner.config.max_bytes,
            hits: self.inner.hits.load(Ordering::Relaxed),
            misses: self.inner.misses.load(Ordering::Relaxed),
            in_flight: state.in_flight.len(),
            enabled: self.inner.config.enabled,
        }
    }

    fn effective_ttl(&self, ttl: Option<Duration>) -> Option<Duration> {
        let ttl = ttl.unwrap_or(self.inner.config.ttl);
        (!ttl.is_zero()).then_some(ttl)
    }

    fn spawn_fetch<F, Fut, E>(
        &self,
        key: &str,
        generation: u64,
        ttl: Option<Duration>,
        fetch: F,
    ) -> SharedFetch<V>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<V, E>> + Send + 'static,
        E: fmt::Display + Send + 'static,
    {
        let weak: Weak<Inner<V>> = Arc::downgrade(&self.inner);
        let name = self.inner.name;
        let key = key.to_string();
        async move {
            debug!(cache = name, key = %key, "Fetching from upstream");
            let outcome = AssertUnwindSafe(async move { fetch().await })
                .catch_unwind()
                .await;
            let result = match outcome {
                Ok(Ok(value)) => Ok(value),
                Ok(Err(error)) => {
                    warn!(cache = name, key = %key, error = %error, "Upstream fetch failed");
                    Err(CacheError::upstream(&key, error.to_string()))
                }
                Err(_) => {
                    warn!(cache = name, key = %key, "Upstream fetch panicked");
                    Err(CacheError::upstream(&key, "fetch panicked"))
                }
            };
            if let Some(inner) = weak.upgrade() {
                inner.finish(&key, generation, ttl, &result);
            }
            result
        }
        .boxed()
        .shared()
    }
}

/// Cache for metadata provider calls, with separate TTLs for search results
/// and book details.
#[derive(Debug, Clone)]
pub struct MetadataCache<V> {
    cache: TtlCache<V>,
    search_ttl: Duration,
    book_ttl: Duration,
}

impl<V> MetadataCache<V>
where
    V: Clone + Send + Sync + 'static,
{
    /// Creates the cache. A zero TTL means never expire.
    #[must_use]
    pub fn new(enabled: bool, search_ttl: Duration, book_ttl: Duration) -> Self {
        Self {
            cache: TtlCache::new("metadata", CacheConfig::new(book_ttl).enabled(enabled)),
            search_ttl,
            book_ttl,
        }
    }

    /// Memoizes a provider search under `search:<key>`.
    ///
    /// # Errors
    ///
    /// Returns `CacheError::Upstream` when the fetch fails.
    pub async fn search<F, Fut, E>(&self, key: &str, fetch: F) -> Result<V, CacheError>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<V, E>> + Send + 'static,
        E: fmt::Display + Send + 'static,
    {
        self.cache
            .get_or_fetch_with_ttl(&format!("search:{key}"), Some(self.search_ttl), fetch)
            .await
    }

    /// Memoizes a book-details lookup under `book:<key>`.
    ///
    /// # Errors
    ///
    /// Returns `CacheError::Upstream` when the fetch fails.
    pub async fn book<F, Fut, E>(&self, key: &str, fetch: F) -> Result<V, CacheError>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<V, E>> + Send + 'static,
        E: fmt::Display + Send + 'static,
    {
        self.cache
            .get_or_fetch_with_ttl(&format!("book:{key}"), Some(self.book_ttl), fetch)
            .await
    }

    /// Underlying cache, for invalidation and stats.
    #[must_use]
    pub fn inner(&self) -> &TtlCache<V> {
        &self.cache
    }
}
