//! Layered configuration.
//!
//! Values resolve environment (`SHELFDL_<KEY>`, then bare `<KEY>`) over
//! config file over built-in default. Keys are case-insensitive. Unknown
//! keys are kept so plugins can read their own credentials with
//! [`LayeredConfig::get_str`].

mod parse;

use std::collections::HashMap;
use std::fmt::Display;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use thiserror::Error;
use tracing::debug;

/// Prefix for namespaced environment variables.
pub const ENV_PREFIX: &str = "SHELFDL_";

/// Environment variable naming an explicit config file.
pub const CONFIG_PATH_ENV: &str = "SHELFDL_CONFIG";

/// Default worker pool size.
pub const DEFAULT_MAX_CONCURRENT_DOWNLOADS: usize = 3;

/// Upper bound for the worker pool size.
pub const MAX_CONCURRENT_DOWNLOADS_LIMIT: usize = 10;

/// Errors raised while loading or validating configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The config file could not be read.
    #[error("failed to read config file {path}: {source}")]
    Read {
        /// Path that failed
        path: PathBuf,
        /// Underlying error
        #[source]
        source: std::io::Error,
    },

    /// A config file line is malformed.
    #[error("Invalid config syntax on line {line}: {message}")]
    Syntax {
        /// 1-based line number
        line: usize,
        /// What is wrong
        message: String,
    },

    /// A value cannot be parsed as the expected type.
    #[error("Invalid config value for `{key}`: {value}. Expected {expected}")]
    Invalid {
        /// Config key
        key: String,
        /// Raw value
        value: String,
        /// Expected type or shape
        expected: String,
    },

    /// A value is outside its allowed range.
    #[error("Invalid config value for `{key}`: {value}. Expected range: {range}")]
    OutOfRange {
        /// Config key
        key: String,
        /// Offending value
        value: String,
        /// Allowed range
        range: String,
    },
}

impl ConfigError {
    fn syntax(line: usize, message: impl Into<String>) -> Self {
        Self::Syntax {
            line,
            message: message.into(),
        }
    }

    fn out_of_range(key: &str, value: impl Display, range: impl Display) -> Self {
        Self::OutOfRange {
            key: key.to_string(),
            value: value.to_string(),
            range: range.to_string(),
        }
    }
}

/// Anything that can answer raw config lookups.
pub trait ConfigSource: Send + Sync {
    /// Raw string value for `key`, if set.
    fn get_str(&self, key: &str) -> Option<String>;
}

/// Environment over file over default.
#[derive(Debug, Clone, Default)]
pub struct LayeredConfig {
    env: HashMap<String, String>,
    file: HashMap<String, String>,
    path: Option<PathBuf>,
}

impl LayeredConfig {
    /// Empty config: every lookup falls through to its default.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Loads the process environment and, if it exists, the config file at
    /// `path` (or the default location when `None`).
    ///
    /// # Errors
    ///
    /// Returns an error if the file exists but cannot be read or parsed.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let env_path = std::env::var_os(CONFIG_PATH_ENV).map(PathBuf::from);
        let resolved = path
            .map(Path::to_path_buf)
            .or(env_path)
            .or_else(resolve_default_config_path);
        let config = Self::new().with_env(std::env::vars());
        match resolved {
            Some(path) if path.exists() => config.with_file(&path),
            Some(path) => {
                debug!(path = %path.display(), "No config file, using defaults");
                Ok(config)
            }
            None => Ok(config),
        }
    }

    /// Replaces the environment layer.
    #[must_use]
    pub fn with_env<K, V>(mut self, vars: impl IntoIterator<Item = (K, V)>) -> Self
    where
        K: Into<String>,
        V: Into<String>,
    {
        self.env = vars
            .into_iter()
            .map(|(k, v)| (k.into().to_ascii_uppercase(), v.into()))
            .collect();
        self
    }

    /// Replaces the file layer with parsed `raw` contents.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::Syntax` for malformed lines.
    pub fn with_file_str(mut self, raw: &str) -> Result<Self, ConfigError> {
        self.file = parse::parse_config_str(raw)?;
        Ok(self)
    }

    /// Replaces the file layer with the contents of `path`.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn with_file(self, path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let mut config = self.with_file_str(&raw)?;
        debug!(path = %path.display(), keys = config.file.len(), "Loaded config file");
        config.path = Some(path.to_path_buf());
        Ok(config)
    }

    /// File the file layer came from.
    #[must_use]
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Typed lookup with a default for unset keys.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::Invalid` when a set value does not parse as `T`.
    pub fn get<T>(&self, key: &str, default: T) -> Result<T, ConfigError>
    where
        T: FromStr,
    {
        let Some(raw) = self.get_str(key) else {
            return Ok(default);
        };
        raw.trim().parse().map_err(|_| ConfigError::Invalid {
            key: key.to_ascii_uppercase(),
            value: raw.clone(),
            expected: std::any::type_name::<T>().to_string(),
        })
    }

    /// Boolean lookup accepting `true/false`, `1/0`, `yes/no`.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::Invalid` for anything else.
    pub fn get_bool(&self, key: &str, default: bool) -> Result<bool, ConfigError> {
        let Some(raw) = self.get_str(key) else {
            return Ok(default);
        };
        match raw.trim().to_ascii_lowercase().as_str() {
            "true" | "1" | "yes" | "on" => Ok(true),
            "false" | "0" | "no" | "off" => Ok(false),
            _ => Err(ConfigError::Invalid {
                key: key.to_ascii_uppercase(),
                value: raw,
                expected: "true or false".to_string(),
            }),
        }
    }

    /// Comma-separated list lookup. Blank items are dropped.
    #[must_use]
    pub fn get_list(&self, key: &str) -> Vec<String> {
        self.get_str(key)
            .map(|raw| {
                raw.split(',')
                    .map(str::trim)
                    .filter(|item| !item.is_empty())
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default()
    }
}

impl ConfigSource for LayeredConfig {
    fn get_str(&self, key: &str) -> Option<String> {
        let key = key.to_ascii_uppercase();
        self.env
            .get(&format!("{ENV_PREFIX}{key}"))
            .or_else(|| self.env.get(&key))
            .or_else(|| self.file.get(&key))
            .cloned()
    }
}

/// Default config path: `$XDG_CONFIG_HOME/shelfdl/config.toml`, falling back
/// to `$HOME/.config/shelfdl/config.toml`.
#[must_use]
pub fn resolve_default_config_path() -> Option<PathBuf> {
    if let Some(xdg) = std::env::var_os("XDG_CONFIG_HOME").filter(|v| !v.is_empty()) {
        return Some(PathBuf::from(xdg).join("shelfdl").join("config.toml"));
    }
    std::env::var_os("HOME")
        .filter(|v| !v.is_empty())
        .map(|home| {
            PathBuf::from(home)
                .join(".config")
                .join("shelfdl")
                .join("config.toml")
        })
}

/// Random delay range before a dispatched task starts while others run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StaggerRange {
    /// Lower bound.
    pub min: Duration,
    /// Upper bound, inclusive.
    pub max: Duration,
}

impl StaggerRange {
    /// Range with both ends at zero.
    pub const DISABLED: Self = Self {
        min: Duration::ZERO,
        max: Duration::ZERO,
    };

    /// Returns true when no delay is ever applied.
    #[must_use]
    pub fn is_disabled(&self) -> bool {
        self.max.is_zero()
    }
}

/// Typed, validated settings.
#[derive(Debug, Clone, PartialEq)]
pub struct Settings {
    /// Worker pool size.
    pub max_concurrent_downloads: usize,
    /// How long terminal tasks stay in the table.
    pub status_timeout: Duration,
    /// Minimum interval between progress pushes for one task.
    pub progress_interval: Duration,
    /// Inactivity after which a running task is cancelled. Zero disables.
    pub stall_timeout: Duration,
    /// Start staggering range.
    pub stagger: StaggerRange,
    /// Search-wide budget.
    pub search_timeout: Duration,
    /// Budget for an explicitly expanded search.
    pub expanded_search_timeout: Duration,
    /// Concurrent source queries.
    pub search_parallelism: usize,
    /// Run a second, expanded pass when the first finds nothing.
    pub search_auto_expand: bool,
    /// Slow-source fallback order, by source name.
    pub source_priority: Vec<String>,
    /// Metadata cache switch.
    pub metadata_cache_enabled: bool,
    /// TTL for cached search results.
    pub metadata_cache_search_ttl: Duration,
    /// TTL for cached book details.
    pub metadata_cache_book_ttl: Duration,
    /// Cover cache switch.
    pub covers_cache_enabled: bool,
    /// Cover TTL in days. Zero keeps covers forever.
    pub covers_cache_ttl_days: u64,
    /// Cover cache ceiling in megabytes.
    pub covers_cache_max_size_mb: u64,
    /// Where finished downloads are delivered.
    pub destination_dir: PathBuf,
    /// Where executors stage partial downloads.
    pub staging_dir: PathBuf,
    /// Task table persistence file, if any.
    pub state_file: Option<PathBuf>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            max_concurrent_downloads: DEFAULT_MAX_CONCURRENT_DOWNLOADS,
            status_timeout: Duration::from_secs(3600),
            progress_interval: Duration::from_secs(1),
            stall_timeout: Duration::from_secs(300),
            stagger: StaggerRange {
                min: Duration::from_millis(2000),
                max: Duration::from_millis(5000),
            },
            search_timeout: Duration::from_secs(30),
            expanded_search_timeout: Duration::from_secs(90),
            search_parallelism: 4,
            search_auto_expand: false,
            source_priority: Vec::new(),
            metadata_cache_enabled: true,
            metadata_cache_search_ttl: Duration::from_secs(300),
            metadata_cache_book_ttl: Duration::from_secs(600),
            covers_cache_enabled: true,
            covers_cache_ttl_days: 0,
            covers_cache_max_size_mb: 500,
            destination_dir: PathBuf::from("books"),
            staging_dir: std::env::temp_dir().join("shelfdl-staging"),
            state_file: None,
        }
    }
}

fn ranged_u64(
    config: &LayeredConfig,
    key: &str,
    default: u64,
    min: u64,
    max: u64,
) -> Result<u64, ConfigError> {
    let value: u64 = config.get(key, default)?;
    if !(min..=max).contains(&value) {
        return Err(ConfigError::out_of_range(key, value, format!("{min}..={max}")));
    }
    Ok(value)
}

fn secs(
    config: &LayeredConfig,
    key: &str,
    default: Duration,
    min: u64,
    max: u64,
) -> Result<Duration, ConfigError> {
    ranged_u64(config, key, default.as_secs(), min, max).map(Duration::from_secs)
}

impl Settings {
    /// Resolves and validates every setting.
    ///
    /// # Errors
    ///
    /// Returns the first unparsable or out-of-range value.
    pub fn from_config(config: &LayeredConfig) -> Result<Self, ConfigError> {
        let defaults = Self::default();

        let max_concurrent = ranged_u64(
            config,
            "MAX_CONCURRENT_DOWNLOADS",
            DEFAULT_MAX_CONCURRENT_DOWNLOADS as u64,
            1,
            MAX_CONCURRENT_DOWNLOADS_LIMIT as u64,
        )?;
        let parallelism = ranged_u64(config, "SEARCH_PARALLELISM", 4, 1, 64)?;

        let stagger_min = ranged_u64(config, "DOWNLOAD_STAGGER_MIN_MS", 2000, 0, 600_000)?;
        let stagger_max = ranged_u64(config, "DOWNLOAD_STAGGER_MAX_MS", 5000, 0, 600_000)?;
        if stagger_min > stagger_max {
            return Err(ConfigError::out_of_range(
                "DOWNLOAD_STAGGER_MIN_MS",
                stagger_min,
                format!("0..={stagger_max} (DOWNLOAD_STAGGER_MAX_MS)"),
            ));
        }

        let search_timeout = secs(config, "SEARCH_TIMEOUT", defaults.search_timeout, 1, 3600)?;
        let expanded_search_timeout = secs(
            config,
            "EXPANDED_SEARCH_TIMEOUT",
            defaults.expanded_search_timeout,
            1,
            3600,
        )?;

        let settings = Self {
            max_concurrent_downloads: usize::try_from(max_concurrent)
                .unwrap_or(DEFAULT_MAX_CONCURRENT_DOWNLOADS),
            status_timeout: secs(config, "STATUS_TIMEOUT", defaults.status_timeout, 0, u64::MAX)?,
            progress_interval: secs(
                config,
                "DOWNLOAD_PROGRESS_UPDATE_INTERVAL",
                defaults.progress_interval,
                0,
                3600,
            )?,
            stall_timeout: secs(config, "STALL_TIMEOUT", defaults.stall_timeout, 0, u64::MAX)?,
            stagger: StaggerRange {
                min: Duration::from_millis(stagger_min),
                max: Duration::from_millis(stagger_max),
            },
            search_timeout,
            expanded_search_timeout,
            search_parallelism: usize::try_from(parallelism).unwrap_or(4),
            search_auto_expand: config.get_bool("SEARCH_AUTO_EXPAND", false)?,
            source_priority: config.get_list("SOURCE_PRIORITY"),
            metadata_cache_enabled: config.get_bool("METADATA_CACHE_ENABLED", true)?,
            metadata_cache_search_ttl: secs(
                config,
                "METADATA_CACHE_SEARCH_TTL",
                defaults.metadata_cache_search_ttl,
                0,
                u64::MAX,
            )?,
            metadata_cache_book_ttl: secs(
                config,
                "METADATA_CACHE_BOOK_TTL",
                defaults.metadata_cache_book_ttl,
                0,
                u64::MAX,
            )?,
            covers_cache_enabled: config.get_bool("COVERS_CACHE_ENABLED", true)?,
            covers_cache_ttl_days: ranged_u64(config, "COVERS_CACHE_TTL", 0, 0, 36_500)?,
            covers_cache_max_size_mb: ranged_u64(
                config,
                "COVERS_CACHE_MAX_SIZE_MB",
                500,
                1,
                1_048_576,
            )?,
            destination_dir: config
                .get_str("DESTINATION_DIR")
                .map_or(defaults.destination_dir, PathBuf::from),
            staging_dir: config
                .get_str("STAGING_DIR")
                .map_or(defaults.staging_dir, PathBuf::from),
            state_file: config.get_str("STATE_FILE").map(PathBuf::from),
        };
        debug!(
            max_concurrent_downloads = settings.max_concurrent_downloads,
            search_parallelism = settings.search_parallelism,
            "Resolved settings"
        );
        Ok(settings)
    }
}
