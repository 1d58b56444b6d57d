//! Release aggregation across every registered source.
//!
//! Fast sources are always queried, in parallel up to a configured limit.
//! Slow sources are a fallback: tried one at a time in priority order when
//! the fast pass found nothing, or all at once when the caller expands the
//! search. Everything runs inside one search-wide deadline. A source that
//! errors, panics or runs out of time contributes zero results and is
//! reported in the [`SearchOutcome`]; it never fails the search.

mod rank;

pub use rank::RankingPolicy;

use std::collections::HashSet;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use futures_util::{FutureExt, StreamExt, stream};
use serde::Serialize;
use tokio::time::Instant;
use tracing::{debug, info, instrument, warn};

use crate::cache::MetadataCache;
use crate::config::Settings;
use crate::model::{BookMetadata, ContentType, Release};
use crate::plugin::{PluginRegistry, ReleaseSource, SearchQuery, SourceSpeed};

/// When a second, expanded pass runs automatically.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum AutoExpandPolicy {
    /// Never.
    #[default]
    Never,
    /// When the first pass found nothing.
    WhenEmpty,
    /// When the first pass found fewer than this many releases.
    BelowThreshold(usize),
}

impl AutoExpandPolicy {
    /// Returns true if a first pass with `found` results should be expanded.
    #[must_use]
    pub fn should_expand(self, found: usize) -> bool {
        match self {
            Self::Never => false,
            Self::WhenEmpty => found == 0,
            Self::BelowThreshold(min) => found < min,
        }
    }
}

/// Aggregator tuning.
#[derive(Debug, Clone, PartialEq)]
pub struct AggregatorConfig {
    /// Sources queried concurrently.
    pub parallelism: usize,
    /// Budget for a normal search.
    pub timeout: Duration,
    /// Budget for an expanded search or pass.
    pub expanded_timeout: Duration,
    /// Automatic second pass.
    pub auto_expand: AutoExpandPolicy,
    /// Slow-source fallback order; unlisted slow sources follow in
    /// registration order.
    pub source_priority: Vec<String>,
    /// Result ordering.
    pub ranking: RankingPolicy,
}

impl Default for AggregatorConfig {
    fn default() -> Self {
        Self::from_settings(&Settings::default())
    }
}

impl AggregatorConfig {
    /// Extracts the search settings.
    #[must_use]
    pub fn from_settings(settings: &Settings) -> Self {
        Self {
            parallelism: settings.search_parallelism,
            timeout: settings.search_timeout,
            expanded_timeout: settings.expanded_search_timeout,
            auto_expand: if settings.search_auto_expand {
                AutoExpandPolicy::WhenEmpty
            } else {
                AutoExpandPolicy::Never
            },
            source_priority: settings.source_priority.clone(),
            ranking: RankingPolicy::SourceOrder,
        }
    }
}

/// Caller options for one search.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SearchRequest {
    /// Restrict to these sources; `None` searches all.
    pub sources: Option<Vec<String>>,
    /// Preferred languages, most preferred first.
    pub languages: Vec<String>,
    /// Requested content type.
    pub content_type: ContentType,
    /// Query slow sources too and skip exact lookups.
    pub expand: bool,
}

/// A source whose search failed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SourceFailure {
    /// Source name
    pub source: String,
    /// What went wrong
    pub message: String,
}

/// Aggregated result of one search.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SearchOutcome {
    /// De-duplicated, ranked releases.
    pub releases: Vec<Release>,
    /// Sources that answered, in query order.
    pub searched: Vec<String>,
    /// Sources whose search failed or panicked.
    pub failed: Vec<SourceFailure>,
    /// Sources cut off by the deadline.
    pub timed_out: Vec<String>,
    /// Sources that reported themselves unavailable.
    pub unavailable: Vec<String>,
    /// True if slow sources were expanded into or a second pass ran.
    pub expanded: bool,
}

impl SearchOutcome {
    /// Number of sources that errored or timed out.
    #[must_use]
    pub fn error_count(&self) -> usize {
        self.failed.len() + self.timed_out.len()
    }

    fn record(&mut self, name: String, result: SourceResult) -> usize {
        match result {
            SourceResult::Found(releases) => {
                let count = releases.len();
                self.searched.push(name);
                self.releases.extend(releases);
                count
            }
            SourceResult::Unavailable => {
                self.unavailable.push(name);
                0
            }
            SourceResult::Failed(message) => {
                self.failed.push(SourceFailure {
                    source: name,
                    message,
                });
                0
            }
            SourceResult::TimedOut => {
                self.timed_out.push(name);
                0
            }
        }
    }

    fn dedup(&mut self) {
        let mut seen = HashSet::new();
        self.releases.retain(|release| {
            let (source, id) = release.dedup_key();
            seen.insert((source.to_string(), id.to_string()))
        });
    }
}

#[derive(Debug)]
enum SourceResult {
    Found(Vec<Release>),
    Unavailable,
    Failed(String),
    TimedOut,
}

/// Queries registered sources and merges their releases.
#[derive(Debug, Clone)]
pub struct ReleaseAggregator {
    registry: Arc<PluginRegistry>,
    config: AggregatorConfig,
    cache: Option<MetadataCache<Vec<Release>>>,
}

impl ReleaseAggregator {
    /// Creates an aggregator over `registry`.
    #[must_use]
    pub fn new(registry: Arc<PluginRegistry>, config: AggregatorConfig) -> Self {
        Self {
            registry,
            config,
            cache: None,
        }
    }

    /// Memoizes per-source results in `cache`.
    #[must_use]
    pub fn with_cache(mut self, cache: MetadataCache<Vec<Release>>) -> Self {
        self.cache = Some(cache);
        self
    }

    /// Active configuration.
    #[must_use]
    pub fn config(&self) -> &AggregatorConfig {
        &self.config
    }

    /// Searches every source with default options. Never fails.
    pub async fn search_releases(&self, book: &BookMetadata) -> Vec<Release> {
        self.search(book, &SearchRequest::default()).await.releases
    }

    /// Runs a search across sources.
    #[instrument(skip(self, book, request), fields(title = %book.title, expand = request.expand))]
    pub async fn search(&self, book: &BookMetadata, request: &SearchRequest) -> SearchOutcome {
        let (fast, slow) = self.candidates(request);
        let mut outcome = SearchOutcome::default();

        if request.expand {
            outcome.expanded = true;
            let deadline = Instant::now() + self.config.expanded_timeout;
            let all: Vec<_> = fast.into_iter().chain(slow).collect();
            self.parallel_pass(&mut outcome, all, book, &query_for(request, true), deadline)
                .await;
        } else {
            let deadline = Instant::now() + self.config.timeout;
            let query = query_for(request, false);
            self.parallel_pass(&mut outcome, fast.clone(), book, &query, deadline)
                .await;
            if outcome.releases.is_empty() && !slow.is_empty() {
                self.fallback_pass(&mut outcome, &slow, book, &query, deadline)
                    .await;
            }

            outcome.dedup();
            if self.config.auto_expand.should_expand(outcome.releases.len()) {
                info!(found = outcome.releases.len(), "Auto-expanding search");
                outcome.expanded = true;
                let deadline = Instant::now() + self.config.expanded_timeout;
                let all: Vec<_> = fast.into_iter().chain(slow).collect();
                let mut second = SearchOutcome::default();
                self.parallel_pass(&mut second, all, book, &query_for(request, true), deadline)
                    .await;
                merge(&mut outcome, second);
            }
        }

        outcome.dedup();
        self.config.ranking.rank(&mut outcome.releases);
        info!(
            releases = outcome.releases.len(),
            searched = outcome.searched.len(),
            failed = outcome.failed.len(),
            timed_out = outcome.timed_out.len(),
            expanded = outcome.expanded,
            "Search finished"
        );
        outcome
    }

    /// Eligible sources split by speed; slow ones in fallback order.
    fn candidates(
        &self,
        request: &SearchRequest,
    ) -> (Vec<Arc<dyn ReleaseSource>>, Vec<Arc<dyn ReleaseSource>>) {
        let mut fast = Vec::new();
        let mut slow = Vec::new();
        for name in self.registry.source_names() {
            if let Some(only) = &request.sources
                && !only.iter().any(|n| n == name)
            {
                continue;
            }
            let Some(source) = self.registry.get_source(name) else {
                continue;
            };
            if !source
                .supported_content_types()
                .contains(&request.content_type)
            {
                debug!(source = name, content_type = %request.content_type, "Source skipped for content type");
                continue;
            }
            match source.speed() {
                SourceSpeed::Fast => fast.push(source),
                SourceSpeed::Slow => slow.push(source),
            }
        }
        let priority = &self.config.source_priority;
        slow.sort_by_key(|s| {
            priority
                .iter()
                .position(|name| name == s.name())
                .unwrap_or(priority.len())
        });
        (fast, slow)
    }

    async fn parallel_pass(
        &self,
        outcome: &mut SearchOutcome,
        sources: Vec<Arc<dyn ReleaseSource>>,
        book: &BookMetadata,
        query: &SearchQuery,
        deadline: Instant,
    ) {
        let mut results: Vec<(usize, String, SourceResult)> = stream::iter(sources.into_iter().enumerate())
            .map(|(index, source)| async move {
                let name = source.name().to_string();
                let result = self.query_source(source, book, query, deadline).await;
                (index, name, result)
            })
            .buffer_unordered(self.config.parallelism.max(1))
            .collect()
            .await;
        results.sort_by_key(|(index, _, _)| *index);
        for (_, name, result) in results {
            outcome.record(name, result);
        }
    }

    async fn fallback_pass(
        &self,
        outcome: &mut SearchOutcome,
        slow: &[Arc<dyn ReleaseSource>],
        book: &BookMetadata,
        query: &SearchQuery,
        deadline: Instant,
    ) {
        for source in slow {
            let name = source.name().to_string();
            debug!(source = %name, "Trying fallback source");
            let result = self.query_source(Arc::clone(source), book, query, deadline).await;
            let timed_out = matches!(result, SourceResult::TimedOut);
            if outcome.record(name, result) > 0 || timed_out {
                // Found something, or the budget is spent.
                return;
            }
        }
    }

    async fn query_source(
        &self,
        source: Arc<dyn ReleaseSource>,
        book: &BookMetadata,
        query: &SearchQuery,
        deadline: Instant,
    ) -> SourceResult {
        let name = source.name().to_string();
        let work = AssertUnwindSafe(self.search_one(source, book, query)).catch_unwind();
        match tokio::time::timeout_at(deadline, work).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => {
                warn!(source = %name, "Source panicked during search");
                SourceResult::Failed("source panicked".to_string())
            }
            Err(_) => {
                warn!(source = %name, "Source search timed out");
                SourceResult::TimedOut
            }
        }
    }

    async fn search_one(
        &self,
        source: Arc<dyn ReleaseSource>,
        book: &BookMetadata,
        query: &SearchQuery,
    ) -> SourceResult {
        let name = source.name().to_string();
        match source.is_available().await {
            Ok(true) => {}
            Ok(false) => {
                debug!(source = %name, "Source unavailable, skipped");
                return SourceResult::Unavailable;
            }
            Err(error) => {
                warn!(source = %name, error = %error, "Availability check failed, skipped");
                return SourceResult::Unavailable;
            }
        }

        let result = match &self.cache {
            Some(cache) => {
                let key = cache_key(&name, book, query);
                let book = book.clone();
                let query = query.clone();
                cache
                    .search(&key, move || async move { source.search(&book, &query).await })
                    .await
                    .map_err(|error| error.to_string())
            }
            None => source
                .search(book, query)
                .await
                .map_err(|error| error.to_string()),
        };

        match result {
            Ok(releases) => {
                debug!(source = %name, count = releases.len(), "Source answered");
                SourceResult::Found(releases)
            }
            Err(message) => {
                warn!(source = %name, error = %message, "Source search failed");
                SourceResult::Failed(message)
            }
        }
    }
}

fn query_for(request: &SearchRequest, expand: bool) -> SearchQuery {
    SearchQuery {
        expand,
        languages: request.languages.clone(),
        content_type: request.content_type,
    }
}

fn merge(into: &mut SearchOutcome, other: SearchOutcome) {
    into.releases.extend(other.releases);
    for name in other.searched {
        if !into.searched.contains(&name) {
            into.searched.push(name);
        }
    }
    into.failed.extend(other.failed);
    into.timed_out.extend(other.timed_out);
    for name in other.unavailable {
        if !into.unavailable.contains(&name) {
            into.unavailable.push(name);
        }
    }
}

fn cache_key(source: &str, book: &BookMetadata, query: &SearchQuery) -> String {
    let identity = book.preferred_isbn().map_or_else(
        || {
            format!(
                "{}|{}",
                book.query_title().to_lowercase(),
                book.primary_author().unwrap_or("").to_lowercase()
            )
        },
        str::to_string,
    );
    format!(
        "{source}:{identity}:{}:{}:{}",
        query.content_type,
        query.expand,
        query.languages.join(",")
    )
}
