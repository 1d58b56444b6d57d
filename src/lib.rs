//! shelfdl core library
//!
//! Download orchestration for books and audiobooks found through pluggable
//! release sources.
//!
//! # Architecture
//!
//! - [`plugin`] - source/executor traits and the immutable plugin registry
//! - [`search`] - bounded-parallel release aggregation across sources
//! - [`orchestrator`] - task table, worker pool and lifecycle state machine
//! - [`status`] - snapshot and throttled push fan-out of task state
//! - [`cache`] - TTL caches with in-flight coalescing, including covers
//! - [`http`] - direct HTTP download executor
//! - [`output`] - delivery of finished payloads
//! - [`config`] - layered configuration and typed settings
//! - [`context`] - wiring of all of the above

// Clippy lints - strict for library code
#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod cache;
pub mod config;
pub mod context;
pub mod http;
pub mod model;
pub mod orchestrator;
pub mod output;
pub mod plugin;
pub mod search;
pub mod status;

// Re-export commonly used types
pub use cache::{CacheConfig, CacheError, CacheStats, CoverCache, CoverImage, MetadataCache, TtlCache};
pub use config::{ConfigError, LayeredConfig, Settings};
pub use context::AppContext;
pub use http::{DIRECT_HTTP, DirectHttpExecutor, DownloadError, RetryPolicy};
pub use model::{BookMetadata, ContentType, DownloadTask, Release, ReleaseProtocol, TaskStatus};
pub use orchestrator::{Orchestrator, OrchestratorConfig, OrchestratorError, PersistenceError};
pub use output::{DestinationFolder, KeepInPlace, OutputError, OutputHandler};
pub use plugin::{
    DownloadExecutor, ExecutorError, PluginRegistry, PluginRegistryBuilder, RegistryError,
    ReleaseSource, SearchQuery, SourceError, SourceInfo, SourceSpeed, TaskReporter,
};
pub use search::{
    AggregatorConfig, AutoExpandPolicy, RankingPolicy, ReleaseAggregator, SearchOutcome,
    SearchRequest,
};
pub use status::{QueueMirror, QueueSnapshot, StatusBroadcaster, StatusUpdate, TaskDelta};
