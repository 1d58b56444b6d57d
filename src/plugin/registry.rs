//! Name-keyed registry of release sources and download executors.
//!
//! Registration happens once through [`PluginRegistryBuilder`]; the built
//! [`PluginRegistry`] is immutable and shared as `Arc<PluginRegistry>`.

use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use futures_util::FutureExt;
use futures_util::future::join_all;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::model::ContentType;

use super::{
    DownloadExecutor, RegistryError, ReleaseSource, SourceSpeed, default_display_name,
};

/// Default time allowed for a single availability probe.
pub const DEFAULT_PROBE_TIMEOUT: Duration = Duration::from_secs(10);

/// Availability listing entry for one source.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SourceInfo {
    /// Registry name.
    pub name: String,
    /// Name shown to users.
    pub display_name: String,
    /// Result of the latest probe.
    pub available: bool,
    /// Fast or slow class.
    pub speed: SourceSpeed,
    /// Content types the source can search for.
    pub supported_content_types: Vec<ContentType>,
}

/// Collects plugins before the registry is frozen.
pub struct PluginRegistryBuilder {
    sources: HashMap<String, Arc<dyn ReleaseSource>>,
    executors: HashMap<String, Arc<dyn DownloadExecutor>>,
    order: Vec<String>,
    probe_timeout: Duration,
}

impl PluginRegistryBuilder {
    /// Creates an empty builder.
    #[must_use]
    pub fn new() -> Self {
        Self {
            sources: HashMap::new(),
            executors: HashMap::new(),
            order: Vec::new(),
            probe_timeout: DEFAULT_PROBE_TIMEOUT,
        }
    }

    /// Sets the per-probe timeout used by `list_available_sources`.
    #[must_use]
    pub fn probe_timeout(mut self, timeout: Duration) -> Self {
        self.probe_timeout = timeout;
        self
    }

    /// Registers a source.
    ///
    /// # Errors
    ///
    /// Returns `RegistryError::Duplicate` if a source with the same name exists.
    #[tracing::instrument(skip(self, source), fields(source = source.name()))]
    pub fn register_source(&mut self, source: Arc<dyn ReleaseSource>) -> Result<(), RegistryError> {
        let name = source.name().to_string();
        if self.sources.contains_key(&name) {
            return Err(RegistryError::duplicate("source", &name));
        }
        debug!(speed = ?source.speed(), "Registering release source");
        self.note_name(&name);
        self.sources.insert(name, source);
        Ok(())
    }

    /// Registers an executor.
    ///
    /// # Errors
    ///
    /// Returns `RegistryError::Duplicate` if an executor with the same name exists.
    #[tracing::instrument(skip(self, executor), fields(executor = executor.name()))]
    pub fn register_executor(
        &mut self,
        executor: Arc<dyn DownloadExecutor>,
    ) -> Result<(), RegistryError> {
        let name = executor.name().to_string();
        if self.executors.contains_key(&name) {
            return Err(RegistryError::duplicate("executor", &name));
        }
        debug!("Registering download executor");
        self.note_name(&name);
        self.executors.insert(name, executor);
        Ok(())
    }

    /// Registers a source and its executor under their shared name.
    ///
    /// # Errors
    ///
    /// Returns `RegistryError::NameMismatch` if the two names differ, or
    /// `RegistryError::Duplicate` if either is already registered.
    pub fn register(
        &mut self,
        source: Arc<dyn ReleaseSource>,
        executor: Arc<dyn DownloadExecutor>,
    ) -> Result<(), RegistryError> {
        if source.name() != executor.name() {
            return Err(RegistryError::NameMismatch {
                source_name: source.name().to_string(),
                executor_name: executor.name().to_string(),
            });
        }
        if self.sources.contains_key(source.name()) {
            return Err(RegistryError::duplicate("source", source.name()));
        }
        if self.executors.contains_key(executor.name()) {
            return Err(RegistryError::duplicate("executor", executor.name()));
        }
        self.register_source(source)?;
        self.register_executor(executor)
    }

    /// Freezes the registry.
    #[must_use]
    pub fn build(self) -> PluginRegistry {
        info!(
            sources = self.sources.len(),
            executors = self.executors.len(),
            "Plugin registry built"
        );
        PluginRegistry {
            sources: self.sources,
            executors: self.executors,
            order: self.order,
            probe_timeout: self.probe_timeout,
        }
    }

    fn note_name(&mut self, name: &str) {
        if !self.order.iter().any(|n| n == name) {
            self.order.push(name.to_string());
        }
    }
}

impl Default for PluginRegistryBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Immutable map from source name to its plugins.
pub struct PluginRegistry {
    sources: HashMap<String, Arc<dyn ReleaseSource>>,
    executors: HashMap<String, Arc<dyn DownloadExecutor>>,
    order: Vec<String>,
    probe_timeout: Duration,
}

impl PluginRegistry {
    /// Starts a new builder.
    #[must_use]
    pub fn builder() -> PluginRegistryBuilder {
        PluginRegistryBuilder::new()
    }

    /// Looks up a source by name.
    #[must_use]
    pub fn get_source(&self, name: &str) -> Option<Arc<dyn ReleaseSource>> {
        self.sources.get(name).cloned()
    }

    /// Looks up an executor by name.
    #[must_use]
    pub fn get_handler(&self, name: &str) -> Option<Arc<dyn DownloadExecutor>> {
        self.executors.get(name).cloned()
    }

    /// Returns true if `name` has a source or an executor.
    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.sources.contains_key(name) || self.executors.contains_key(name)
    }

    /// Source names in registration order.
    #[must_use]
    pub fn source_names(&self) -> Vec<&str> {
        self.order
            .iter()
            .filter(|name| self.sources.contains_key(name.as_str()))
            .map(String::as_str)
            .collect()
    }

    /// Display name for `name`, falling back to a title-cased form.
    #[must_use]
    pub fn display_name(&self, name: &str) -> String {
        self.sources
            .get(name)
            .map_or_else(|| default_display_name(name), |s| s.display_name())
    }

    /// Probes every source concurrently and reports availability.
    ///
    /// Probes are never cached. A probe that errors, panics or exceeds the
    /// probe timeout reports the source as unavailable.
    #[tracing::instrument(skip(self))]
    pub async fn list_available_sources(&self) -> Vec<SourceInfo> {
        let probes = self.source_names().into_iter().filter_map(|name| {
            let source = self.sources.get(name)?.clone();
            let timeout = self.probe_timeout;
            Some(async move {
                let available = probe(source.as_ref(), timeout).await;
                SourceInfo {
                    name: source.name().to_string(),
                    display_name: source.display_name(),
                    available,
                    speed: source.speed(),
                    supported_content_types: source.supported_content_types(),
                }
            })
        });
        let infos = join_all(probes).await;
        debug!(
            total = infos.len(),
            available = infos.iter().filter(|i| i.available).count(),
            "Availability probe finished"
        );
        infos
    }
}

async fn probe(source: &dyn ReleaseSource, timeout: Duration) -> bool {
    let fut = AssertUnwindSafe(source.is_available()).catch_unwind();
    match tokio::time::timeout(timeout, fut).await {
        Ok(Ok(Ok(available))) => available,
        Ok(Ok(Err(error))) => {
            warn!(source = source.name(), error = %error, "Availability probe failed");
            false
        }
        Ok(Err(_)) => {
            warn!(source = source.name(), "Availability probe panicked");
            false
        }
        Err(_) => {
            warn!(
                source = source.name(),
                timeout_secs = timeout.as_secs(),
                "Availability probe timed out"
            );
            false
        }
    }
}

impl std::fmt::Debug for PluginRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut executors: Vec<&str> = self.executors.keys().map(String::as_str).collect();
        executors.sort_unstable();
        f.debug_struct("PluginRegistry")
            .field("sources", &self.source_names())
            .field("executors", &executors)
            .field("probe_timeout", &self.probe_timeout)
            .finish()
    }
}
