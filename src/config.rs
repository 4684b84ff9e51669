//! Service configuration.
//!
//! Loaded from a single TOML file. Every key is optional; values are merged
//! on top of the stock defaults, unknown keys are rejected, and the result is
//! validated before use.
//!
//! ## Configuration Options
//!
//! ```toml
//! [cache]
//! enabled = true              # Serve and store derivatives through the cache
//! backend = "filesystem"      # "filesystem" or "heap"
//! directory = "cache"         # Root of the filesystem cache
//!
//! [delegate]
//! invocation_cache_enabled = false  # Memoize delegate method results
//! script = "delegates.json"         # Delegate logic loaded at startup
//!
//! [http]
//! content_disposition = "none"      # "none", "inline" or "attachment"
//!
//! [processing]
//! max_workers = 4             # Parallel renders in batch mode (omit for auto)
//! ```

use crate::cache::{DerivativeCache, FilesystemCacheStore, HeapCacheStore};
use crate::delegate::MethodName;
use crate::representation::ContentDisposition;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),
    #[error("TOML serialize error: {0}")]
    Serialize(#[from] toml::ser::Error),
    #[error("Config validation error: {0}")]
    Validation(String),
}

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    pub cache: CacheConfig,
    pub delegate: DelegateConfig,
    pub http: HttpConfig,
    pub processing: ProcessingConfig,
}

impl Config {
    /// Validate values that parse but cannot work.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.cache.enabled
            && self.cache.backend == CacheBackend::Filesystem
            && self.cache.directory.as_os_str().is_empty()
        {
            return Err(ConfigError::Validation(
                "cache.directory must not be empty for the filesystem backend".into(),
            ));
        }
        if let Some(namespace) = &self.delegate.namespace {
            MethodName::parse(namespace).map_err(|e| {
                ConfigError::Validation(format!("delegate.namespace: {e}"))
            })?;
        }
        if self.processing.max_workers == Some(0) {
            return Err(ConfigError::Validation(
                "processing.max_workers must be at least 1".into(),
            ));
        }
        Ok(())
    }
}

/// Which store backs the derivative cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CacheBackend {
    #[default]
    Filesystem,
    Heap,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CacheConfig {
    pub enabled: bool,
    pub backend: CacheBackend,
    /// Root directory of the filesystem store.
    pub directory: PathBuf,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            backend: CacheBackend::Filesystem,
            directory: PathBuf::from("cache"),
        }
    }
}

impl CacheConfig {
    /// The configured cache, or `None` when caching is disabled.
    pub fn open(&self) -> Option<DerivativeCache> {
        if !self.enabled {
            return None;
        }
        Some(match self.backend {
            CacheBackend::Filesystem => {
                DerivativeCache::new(FilesystemCacheStore::new(&self.directory))
            }
            CacheBackend::Heap => DerivativeCache::new(HeapCacheStore::new()),
        })
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct DelegateConfig {
    /// Memoize delegate results per (method, arguments). Off by default:
    /// delegate logic may depend on state the cache cannot see.
    pub invocation_cache_enabled: bool,
    /// Delegate logic loaded at startup.
    pub script: Option<PathBuf>,
    /// Root module every delegate method is resolved under.
    pub namespace: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct HttpConfig {
    pub content_disposition: ContentDisposition,
}

/// Parallel processing settings.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ProcessingConfig {
    /// Maximum number of parallel renders. When absent, defaults to the
    /// number of CPU cores. Larger values are clamped to the core count.
    pub max_workers: Option<usize>,
}

/// Resolve the effective worker count.
///
/// - `None` → all available cores
/// - `Some(n)` → `min(n, cores)`
pub fn effective_workers(config: &ProcessingConfig) -> usize {
    let cores = std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1);
    config.max_workers.map(|n| n.min(cores)).unwrap_or(cores)
}

/// The stock defaults as a TOML table, the base layer user values merge onto.
pub fn stock_defaults_value() -> Result<toml::Value, ConfigError> {
    Ok(toml::Value::try_from(Config::default())?)
}

/// Recursively merge `overlay` on top of `base`.
///
/// Tables merge key by key; any other overlay value replaces the base value.
pub fn merge_toml(base: toml::Value, overlay: toml::Value) -> toml::Value {
    match (base, overlay) {
        (toml::Value::Table(mut base_table), toml::Value::Table(overlay_table)) => {
            for (key, overlay_val) in overlay_table {
                let merged = match base_table.remove(&key) {
                    Some(base_val) => merge_toml(base_val, overlay_val),
                    None => overlay_val,
                };
                base_table.insert(key, merged);
            }
            toml::Value::Table(base_table)
        }
        (_, overlay) => overlay,
    }
}

/// Load configuration from `path`.
///
/// A missing file yields the defaults. Invalid TOML, unknown keys and
/// values failing [`Config::validate`] are errors.
pub fn load_config(path: &Path) -> Result<Config, ConfigError> {
    let base = stock_defaults_value()?;
    let merged = if path.exists() {
        let content = fs::read_to_string(path)?;
        let overlay: toml::Value = toml::from_str(&content)?;
        merge_toml(base, overlay)
    } else {
        base
    };
    let config: Config = merged.try_into()?;
    config.validate()?;
    Ok(config)
}

/// A fully commented `config.toml` with every key at its default.
///
/// Used by the `gen-config` CLI command.
pub fn stock_config_toml() -> &'static str {
    r##"# image-derivatives configuration
# ===============================
# All settings are optional. Values shown below are the defaults.
# Unknown keys will cause an error.

# ---------------------------------------------------------------------------
# Derivative cache
# ---------------------------------------------------------------------------
[cache]
# Serve repeated requests from the cache and store new derivatives in it.
enabled = true

# Storage medium: "filesystem" (persistent) or "heap" (in-memory, per process).
backend = "filesystem"

# Root directory of the filesystem cache. Entries are sharded into
# subdirectories by the first two characters of their key.
directory = "cache"

# ---------------------------------------------------------------------------
# Delegate
# ---------------------------------------------------------------------------
[delegate]
# Memoize delegate method results by method name and arguments.
# Reloading the delegate logic discards every memoized result.
invocation_cache_enabled = false

# Delegate logic to load at startup: a JSON object mapping method names
# (e.g. "resolver::source") to the value they return.
# script = "delegates.json"

# Root module prepended to every method name that does not already start
# with it. With namespace = "Server", "resolver::source" resolves to
# "Server::resolver::source".
# namespace = "Server"

# ---------------------------------------------------------------------------
# HTTP
# ---------------------------------------------------------------------------
[http]
# Content-Disposition sent with derivatives: "none", "inline" or "attachment".
content_disposition = "none"

# ---------------------------------------------------------------------------
# Processing
# ---------------------------------------------------------------------------
[processing]
# Maximum number of parallel renders in batch mode.
# Omit to use all CPU cores. Values above the core count are clamped.
# max_workers = 4
"##
}
