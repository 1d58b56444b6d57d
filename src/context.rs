//! Application wiring.

use std::sync::Arc;

use tracing::info;

use crate::cache::{CoverCache, MetadataCache};
use crate::config::Settings;
use crate::model::{BookMetadata, Release};
use crate::orchestrator::{Orchestrator, OrchestratorConfig, OrchestratorError};
use crate::output::OutputHandler;
use crate::plugin::{PluginRegistry, SourceInfo};
use crate::search::{AggregatorConfig, ReleaseAggregator, SearchOutcome, SearchRequest};
use crate::status::{DEFAULT_PUSH_BUFFER, StatusBroadcaster};

/// Every long-lived component, built once at startup and passed explicitly.
#[derive(Debug, Clone)]
pub struct AppContext {
    settings: Arc<Settings>,
    registry: Arc<PluginRegistry>,
    status: Arc<StatusBroadcaster>,
    orchestrator: Orchestrator,
    aggregator: ReleaseAggregator,
    metadata_cache: MetadataCache<Vec<Release>>,
    cover_cache: CoverCache,
}

impl AppContext {
    /// Builds the caches, broadcaster, aggregator and a running orchestrator.
    ///
    /// # Errors
    ///
    /// Returns an error if persisted task state cannot be loaded.
    pub async fn init(
        settings: Settings,
        registry: PluginRegistry,
        output: Arc<dyn OutputHandler>,
    ) -> Result<Self, OrchestratorError> {
        let registry = Arc::new(registry);
        let status = Arc::new(StatusBroadcaster::new(
            DEFAULT_PUSH_BUFFER,
            settings.progress_interval,
        ));
        let metadata_cache = MetadataCache::new(
            settings.metadata_cache_enabled,
            settings.metadata_cache_search_ttl,
            settings.metadata_cache_book_ttl,
        );
        let cover_cache = CoverCache::new(
            settings.covers_cache_enabled,
            settings.covers_cache_ttl_days,
            settings.covers_cache_max_size_mb,
        );
        let aggregator = ReleaseAggregator::new(
            Arc::clone(&registry),
            AggregatorConfig::from_settings(&settings),
        )
        .with_cache(metadata_cache.clone());
        let orchestrator = Orchestrator::start(
            OrchestratorConfig::from_settings(&settings),
            Arc::clone(&registry),
            output,
            Arc::clone(&status),
        )
        .await?;

        info!(
            sources = registry.source_names().len(),
            max_concurrent = settings.max_concurrent_downloads,
            "Application context ready"
        );
        Ok(Self {
            settings: Arc::new(settings),
            registry,
            status,
            orchestrator,
            aggregator,
            metadata_cache,
            cover_cache,
        })
    }

    /// Resolved settings.
    #[must_use]
    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    /// Plugin registry.
    #[must_use]
    pub fn registry(&self) -> &Arc<PluginRegistry> {
        &self.registry
    }

    /// Task scheduler.
    #[must_use]
    pub fn orchestrator(&self) -> &Orchestrator {
        &self.orchestrator
    }

    /// Release search.
    #[must_use]
    pub fn aggregator(&self) -> &ReleaseAggregator {
        &self.aggregator
    }

    /// Status push fan-out.
    #[must_use]
    pub fn status(&self) -> &Arc<StatusBroadcaster> {
        &self.status
    }

    /// Cache of per-source search results.
    #[must_use]
    pub fn metadata_cache(&self) -> &MetadataCache<Vec<Release>> {
        &self.metadata_cache
    }

    /// Cover image cache.
    #[must_use]
    pub fn cover_cache(&self) -> &CoverCache {
        &self.cover_cache
    }

    /// Searches every source for `book`.
    pub async fn search(&self, book: &BookMetadata, request: &SearchRequest) -> SearchOutcome {
        self.aggregator.search(book, request).await
    }

    /// Probes every source.
    pub async fn list_available_sources(&self) -> Vec<SourceInfo> {
        self.registry.list_available_sources().await
    }

    /// Stops the orchestrator and saves state.
    pub async fn shutdown(&self) {
        self.orchestrator.shutdown().await;
        info!("Application context shut down");
    }
}
