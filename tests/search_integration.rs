//! Integration tests for the release aggregator.

#![allow(clippy::unwrap_used, clippy::expect_used)]

mod support;

use std::sync::Arc;
use std::time::Duration;

use shelfdl_core::plugin::{PluginRegistry, ReleaseSource};
use shelfdl_core::search::SourceFailure;
use shelfdl_core::{
    AggregatorConfig, AutoExpandPolicy, BookMetadata, ContentType, MetadataCache,
    ReleaseAggregator, SearchRequest,
};

use support::fakes::{FakeSource, SourceBehavior, releases};

fn book() -> BookMetadata {
    BookMetadata::new("The Left Hand of Darkness", vec!["Ursula K. Le Guin".to_string()])
}

fn aggregator(sources: &[Arc<FakeSource>], config: AggregatorConfig) -> ReleaseAggregator {
    let mut builder = PluginRegistry::builder();
    for source in sources {
        let source: Arc<dyn ReleaseSource> = source.clone();
        builder.register_source(source).unwrap();
    }
    ReleaseAggregator::new(Arc::new(builder.build()), config)
}

fn config() -> AggregatorConfig {
    AggregatorConfig {
        timeout: Duration::from_secs(5),
        expanded_timeout: Duration::from_secs(15),
        auto_expand: AutoExpandPolicy::Never,
        ..AggregatorConfig::default()
    }
}

fn ids(outcome: &shelfdl_core::SearchOutcome) -> Vec<String> {
    outcome
        .releases
        .iter()
        .map(|r| r.source_id.clone())
        .collect()
}

#[tokio::test(start_paused = true)]
async fn test_hanging_source_times_out_without_losing_others() {
    let a = Arc::new(FakeSource::new("a", SourceBehavior::Results(releases("a", 2))));
    let b = Arc::new(FakeSource::new("b", SourceBehavior::Hangs));
    let c = Arc::new(FakeSource::new("c", SourceBehavior::Results(releases("c", 1))));
    let aggregator = aggregator(&[a, b, c], config());

    let started = tokio::time::Instant::now();
    let outcome = aggregator.search(&book(), &SearchRequest::default()).await;

    assert_eq!(ids(&outcome), ["a-0", "a-1", "c-0"]);
    assert_eq!(outcome.searched, ["a", "c"]);
    assert_eq!(outcome.timed_out, ["b"]);
    assert_eq!(outcome.error_count(), 1);
    assert!(started.elapsed() >= Duration::from_secs(5));
    assert!(started.elapsed() < Duration::from_secs(6));
}

#[tokio::test]
async fn test_failing_and_panicking_sources_are_contained() {
    let good = Arc::new(FakeSource::new("good", SourceBehavior::Results(releases("good", 1))));
    let bad = Arc::new(FakeSource::new("bad", SourceBehavior::Fails("503".to_string())));
    let boom = Arc::new(FakeSource::new("boom", SourceBehavior::Panics));
    let aggregator = aggregator(&[good, bad, boom], config());

    let outcome = aggregator.search(&book(), &SearchRequest::default()).await;

    assert_eq!(ids(&outcome), ["good-0"]);
    assert_eq!(
        outcome.failed,
        [
            SourceFailure {
                source: "bad".to_string(),
                message: "request to bad failed: 503".to_string(),
            },
            SourceFailure {
                source: "boom".to_string(),
                message: "source panicked".to_string(),
            },
        ]
    );
}

#[tokio::test]
async fn test_unavailable_source_is_skipped() {
    let up = Arc::new(FakeSource::new("up", SourceBehavior::Results(releases("up", 1))));
    let down = Arc::new(FakeSource::new("down", SourceBehavior::Unavailable));
    let aggregator = aggregator(&[up, down.clone()], config());

    let outcome = aggregator.search(&book(), &SearchRequest::default()).await;

    assert_eq!(outcome.unavailable, ["down"]);
    assert_eq!(outcome.searched, ["up"]);
    assert_eq!(down.calls(), 0);
}

#[tokio::test]
async fn test_slow_sources_only_queried_when_fast_find_nothing() {
    let fast = Arc::new(FakeSource::new("fast", SourceBehavior::Results(releases("fast", 1))));
    let slow = Arc::new(FakeSource::new("slow", SourceBehavior::Results(releases("slow", 1))).slow());
    let aggregator = aggregator(&[fast, slow.clone()], config());

    let outcome = aggregator.search(&book(), &SearchRequest::default()).await;

    assert_eq!(ids(&outcome), ["fast-0"]);
    assert_eq!(slow.calls(), 0);
    assert!(!outcome.expanded);
}

#[tokio::test]
async fn test_slow_fallback_follows_priority_and_stops_at_first_hit() {
    let fast = Arc::new(FakeSource::new("fast", SourceBehavior::Results(Vec::new())));
    let s1 = Arc::new(FakeSource::new("s1", SourceBehavior::Results(releases("s1", 2))).slow());
    let s2 = Arc::new(FakeSource::new("s2", SourceBehavior::Results(Vec::new())).slow());
    let s3 = Arc::new(FakeSource::new("s3", SourceBehavior::Results(releases("s3", 1))).slow());
    let mut config = config();
    config.source_priority = vec!["s2".to_string(), "s1".to_string()];
    let aggregator = aggregator(&[fast, s1.clone(), s2.clone(), s3.clone()], config);

    let outcome = aggregator.search(&book(), &SearchRequest::default()).await;

    assert_eq!(outcome.searched, ["fast", "s2", "s1"]);
    assert_eq!(ids(&outcome), ["s1-0", "s1-1"]);
    assert_eq!((s2.calls(), s1.calls(), s3.calls()), (1, 1, 0));
}

#[tokio::test]
async fn test_expand_queries_every_source_in_parallel() {
    let fast = Arc::new(FakeSource::new("fast", SourceBehavior::Results(releases("fast", 1))));
    let slow = Arc::new(FakeSource::new("slow", SourceBehavior::Results(releases("slow", 1))).slow());
    let aggregator = aggregator(&[fast.clone(), slow.clone()], config());

    let request = SearchRequest {
        expand: true,
        ..SearchRequest::default()
    };
    let outcome = aggregator.search(&book(), &request).await;

    assert!(outcome.expanded);
    assert_eq!(ids(&outcome), ["fast-0", "slow-0"]);
    assert_eq!(fast.expanded_calls(), 1);
    assert_eq!(slow.expanded_calls(), 1);
}

#[tokio::test]
async fn test_auto_expand_runs_second_pass_when_empty() {
    let source = Arc::new(FakeSource::new(
        "broad",
        SourceBehavior::ResultsWhenExpanded(releases("broad", 2)),
    ));
    let mut config = config();
    config.auto_expand = AutoExpandPolicy::WhenEmpty;
    let aggregator = aggregator(&[source.clone()], config);

    let outcome = aggregator.search(&book(), &SearchRequest::default()).await;

    assert!(outcome.expanded);
    assert_eq!(ids(&outcome), ["broad-0", "broad-1"]);
    assert_eq!(source.calls(), 2);
    assert_eq!(source.expanded_calls(), 1);
}

#[tokio::test]
async fn test_content_type_filters_sources() {
    let ebooks = Arc::new(FakeSource::new("ebooks", SourceBehavior::Results(releases("ebooks", 1))));
    let audio = Arc::new(
        FakeSource::new("audio", SourceBehavior::Results(releases("audio", 1)))
            .content_types(vec![ContentType::Audiobook]),
    );
    let aggregator = aggregator(&[ebooks.clone(), audio], config());

    let request = SearchRequest {
        content_type: ContentType::Audiobook,
        ..SearchRequest::default()
    };
    let outcome = aggregator.search(&book(), &request).await;

    assert_eq!(ids(&outcome), ["audio-0"]);
    assert_eq!(ebooks.calls(), 0);
}

#[tokio::test]
async fn test_source_filter_and_dedup() {
    let mut duplicated = releases("a", 2);
    duplicated.push(duplicated[0].clone());
    let a = Arc::new(FakeSource::new("a", SourceBehavior::Results(duplicated)));
    let b = Arc::new(FakeSource::new("b", SourceBehavior::Results(releases("b", 1))));
    let aggregator = aggregator(&[a, b.clone()], config());

    let request = SearchRequest {
        sources: Some(vec!["a".to_string()]),
        ..SearchRequest::default()
    };
    let outcome = aggregator.search(&book(), &request).await;

    assert_eq!(ids(&outcome), ["a-0", "a-1"]);
    assert_eq!(b.calls(), 0);
}

#[tokio::test]
async fn test_cached_results_skip_repeat_queries() {
    let source = Arc::new(FakeSource::new("a", SourceBehavior::Results(releases("a", 1))));
    let cache = MetadataCache::new(true, Duration::from_secs(300), Duration::from_secs(600));
    let aggregator = aggregator(&[source.clone()], config()).with_cache(cache);

    let first = aggregator.search_releases(&book()).await;
    let second = aggregator.search_releases(&book()).await;

    assert_eq!(first, second);
    assert_eq!(source.calls(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_timed_out_cached_search_is_retried_next_time() {
    let source = Arc::new(FakeSource::new("flaky", SourceBehavior::HangsOnce(releases("flaky", 1))));
    let cache = MetadataCache::new(true, Duration::from_secs(300), Duration::from_secs(600));
    let aggregator = aggregator(&[source.clone()], config()).with_cache(cache.clone());

    let first = aggregator.search(&book(), &SearchRequest::default()).await;
    assert_eq!(first.timed_out, ["flaky"]);
    assert!(first.releases.is_empty());
    assert_eq!(cache.inner().stats().in_flight, 0);

    let second = aggregator.search(&book(), &SearchRequest::default()).await;
    assert!(second.timed_out.is_empty());
    assert_eq!(ids(&second), ["flaky-0"]);
    assert_eq!(source.calls(), 2);
}

#[tokio::test]
async fn test_no_sources_yields_empty_outcome() {
    let aggregator = aggregator(&[], config());
    let outcome = aggregator.search(&book(), &SearchRequest::default()).await;
    assert!(outcome.releases.is_empty());
    assert!(outcome.searched.is_empty());
    assert_eq!(outcome.error_count(), 0);
}
