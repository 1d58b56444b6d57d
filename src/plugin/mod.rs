//! Pluggable release sources and download executors.
//!
//! Every source kind (direct-download sites, indexers, IRC bots, ...) plugs in
//! through two traits:
//!
//! - [`ReleaseSource`] - finds [`Release`]s for a book
//! - [`DownloadExecutor`] - turns a queued [`DownloadTask`] into a file on disk
//!
//! Both are registered under a shared name in a [`PluginRegistryBuilder`],
//! which is consumed into an immutable [`PluginRegistry`] before the
//! orchestrator starts.

mod error;
mod registry;
mod reporter;

pub use error::{ExecutorError, RegistryError, SourceError};
pub use registry::{DEFAULT_PROBE_TIMEOUT, PluginRegistry, PluginRegistryBuilder, SourceInfo};
pub use reporter::{ReportedStatus, TaskEvent, TaskReporter};

use std::future::Future;
use std::path::PathBuf;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::model::{BookMetadata, ContentType, DownloadTask, Release};

/// How expensive a source is to query.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceSpeed {
    /// No waits or bypasses; always queried.
    #[default]
    Fast,
    /// Rate limited or bypass-protected; queried only as a fallback or on
    /// explicit expansion.
    Slow,
}

/// Per-search options passed to every source.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SearchQuery {
    /// Skip exact lookups and search as broadly as the source allows.
    pub expand: bool,
    /// Preferred ISO 639-1 languages, most preferred first.
    pub languages: Vec<String>,
    /// Requested content type.
    pub content_type: ContentType,
}

/// Finds releases for a book in one upstream.
///
/// # Object Safety
///
/// Uses `async_trait` so sources can be stored as `Arc<dyn ReleaseSource>`.
#[async_trait]
pub trait ReleaseSource: Send + Sync {
    /// Registry name ("direct_download", "prowlarr", ...).
    fn name(&self) -> &str;

    /// Name shown to users.
    fn display_name(&self) -> String {
        default_display_name(self.name())
    }

    /// Fast or slow class.
    fn speed(&self) -> SourceSpeed {
        SourceSpeed::Fast
    }

    /// Content types this source can search for.
    fn supported_content_types(&self) -> Vec<ContentType> {
        vec![ContentType::Ebook]
    }

    /// Probes whether the source can currently be used.
    ///
    /// May perform network I/O. Called on every availability listing.
    async fn is_available(&self) -> Result<bool, SourceError> {
        Ok(true)
    }

    /// Searches for releases of `book`.
    async fn search(
        &self,
        book: &BookMetadata,
        query: &SearchQuery,
    ) -> Result<Vec<Release>, SourceError>;
}

/// Executes queued tasks for one source.
///
/// `execute` must check `cancel` at bounded intervals (at least between
/// network chunks), return promptly once it fires, and discard partial
/// output. Progress reported through `reporter` should be non-decreasing.
#[async_trait]
pub trait DownloadExecutor: Send + Sync {
    /// Registry name, shared with the matching source.
    fn name(&self) -> &str;

    /// Runs the task to completion.
    ///
    /// Returns the staged payload path, or `None` when nothing was produced.
    async fn execute(
        &self,
        task: &DownloadTask,
        cancel: CancellationToken,
        reporter: TaskReporter,
    ) -> Result<Option<PathBuf>, ExecutorError>;

    /// Cancels the task in an external system, if the executor hands work off.
    ///
    /// The cancellation token stays authoritative; this is best effort.
    async fn cancel(&self, _task_id: &str) -> bool {
        false
    }

    /// Called after output delivery (or after a failure) so the executor can
    /// remove its own state, e.g. a finished torrent.
    async fn post_process_cleanup(
        &self,
        _task: &DownloadTask,
        _success: bool,
    ) -> Result<(), ExecutorError> {
        Ok(())
    }
}

/// Fallback display name: underscores become spaces, each word title-cased.
#[must_use]
pub fn default_display_name(name: &str) -> String {
    name.replace('_', " ")
        .split(' ')
        .map(|word| {
            let mut chars = word.chars();
            match chars.next() {
                Some(first) => first
                    .to_uppercase()
                    .chain(chars.flat_map(char::to_lowercase))
                    .collect(),
                None => String::new(),
            }
        })
        .collect::<Vec<_>>()
        .join(" ")
}

/// One step of the shared search plan.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SearchTerm {
    /// Exact ISBN lookup.
    Isbn(String),
    /// Free-text title plus optional author.
    TitleAuthor {
        /// Title to search for
        title: String,
        /// Primary author
        author: Option<String>,
    },
}

/// Builds the ISBN-then-title/author plan for a book.
///
/// Expanded searches skip the ISBN step. Localized titles for the preferred
/// languages follow the main title.
#[must_use]
pub fn search_plan(book: &BookMetadata, query: &SearchQuery) -> Vec<SearchTerm> {
    let mut plan = Vec::new();
    if !query.expand
        && let Some(isbn) = book.preferred_isbn()
    {
        plan.push(SearchTerm::Isbn(isbn.trim().to_string()));
    }

    let author = book.primary_author().map(str::to_string);
    let mut titles = vec![book.query_title().to_string()];
    for language in &query.languages {
        if let Some(localized) = book.titles_by_language.get(language)
            && !titles.iter().any(|t| t.eq_ignore_ascii_case(localized))
        {
            titles.push(localized.clone());
        }
    }
    plan.extend(titles.into_iter().filter(|t| !t.trim().is_empty()).map(|title| {
        SearchTerm::TitleAuthor {
            title,
            author: author.clone(),
        }
    }));
    plan
}

/// Runs the search plan, returning the first non-empty step's results.
///
/// A failing step falls through to the next; the error of the last step is
/// returned only if no step produced results.
///
/// # Errors
///
/// Returns the last step's error when every step failed or came back empty
/// and the final one failed.
pub async fn run_search_plan<F, Fut>(
    source_name: &str,
    book: &BookMetadata,
    query: &SearchQuery,
    mut step: F,
) -> Result<Vec<Release>, SourceError>
where
    F: FnMut(SearchTerm) -> Fut,
    Fut: Future<Output = Result<Vec<Release>, SourceError>>,
{
    let mut last_error = None;
    for term in search_plan(book, query) {
        match step(term.clone()).await {
            Ok(releases) if !releases.is_empty() => return Ok(releases),
            Ok(_) => {
                debug!(source = source_name, ?term, "Search step returned nothing");
                last_error = None;
            }
            Err(error) => {
                debug!(source = source_name, ?term, error = %error, "Search step failed");
                last_error = Some(error);
            }
        }
    }
    match last_error {
        Some(error) => Err(error),
        None => Ok(Vec::new()),
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn dune() -> BookMetadata {
        let mut book = BookMetadata::new("Dune", vec!["Frank Herbert".to_string()]);
        book.isbn_13 = Some("9780441013593".to_string());
        book.titles_by_language
            .insert("de".to_string(), "Der Wüstenplanet".to_string());
        book
    }

    #[test]
    fn test_default_display_name_title_cases() {
        assert_eq!(default_display_name("direct_download"), "Direct Download");
        assert_eq!(default_display_name("prowlarr"), "Prowlarr");
        assert_eq!(default_display_name("IRC_bot"), "Irc Bot");
    }

    #[test]
    fn test_search_plan_isbn_first() {
        let plan = search_plan(&dune(), &SearchQuery::default());
        assert_eq!(plan[0], SearchTerm::Isbn("9780441013593".to_string()));
        assert_eq!(
            plan[1],
            SearchTerm::TitleAuthor {
                title: "Dune".to_string(),
                author: Some("Frank Herbert".to_string()),
            }
        );
        assert_eq!(plan.len(), 2);
    }

    #[test]
    fn test_search_plan_expand_skips_isbn_and_adds_localized_titles() {
        let query = SearchQuery {
            expand: true,
            languages: vec!["de".to_string(), "fr".to_string()],
            ..SearchQuery::default()
        };
        let plan = search_plan(&dune(), &query);
        assert_eq!(plan.len(), 2);
        assert!(matches!(&plan[0], SearchTerm::TitleAuthor { title, .. } if title == "Dune"));
        assert!(
            matches!(&plan[1], SearchTerm::TitleAuthor { title, .. } if title == "Der Wüstenplanet")
        );
    }

    #[tokio::test]
    async fn test_run_search_plan_falls_back_to_title() {
        let book = dune();
        let releases = run_search_plan("t", &book, &SearchQuery::default(), |term| async move {
            match term {
                SearchTerm::Isbn(_) => Ok(Vec::new()),
                SearchTerm::TitleAuthor { title, .. } => Ok(vec![Release::new("t", "1", title)]),
            }
        })
        .await
        .unwrap();
        assert_eq!(releases.len(), 1);
        assert_eq!(releases[0].title, "Dune");
    }

    #[tokio::test]
    async fn test_run_search_plan_stops_at_first_hit() {
        let book = dune();
        let mut calls = 0;
        let releases = run_search_plan("t", &book, &SearchQuery::default(), |_| {
            calls += 1;
            async { Ok(vec![Release::new("t", "isbn-hit", "Dune")]) }
        })
        .await
        .unwrap();
        assert_eq!(calls, 1);
        assert_eq!(releases[0].source_id, "isbn-hit");
    }

    #[tokio::test]
    async fn test_run_search_plan_error_only_when_last_step_fails() {
        let book = dune();
        let result = run_search_plan("t", &book, &SearchQuery::default(), |term| async move {
            match term {
                SearchTerm::Isbn(_) => Err(SourceError::request("t", "isbn endpoint down")),
                SearchTerm::TitleAuthor { .. } => Ok(Vec::new()),
            }
        })
        .await;
        assert!(result.unwrap().is_empty());

        let result = run_search_plan("t", &book, &SearchQuery::default(), |_| async {
            Err::<Vec<Release>, _>(SourceError::request("t", "down"))
        })
        .await;
        assert!(result.is_err());
    }
}
