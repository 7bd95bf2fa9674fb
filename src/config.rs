//! Configuration management for Turnstile.
//!
//! Configuration is layered: built-in defaults, then an optional YAML file,
//! then `TURNSTILE__*` environment variables (`__` separates nested keys, e.g.
//! `TURNSTILE__CONNECTIONS__MAX_PER_USER=3`).

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

use crate::connection::ConnectionLimits;
use crate::error::{AdmissionError, Result};
use crate::ratelimit::{RateLimitPresets, DEFAULT_KEY_PREFIX};
use crate::store::{CounterStore, InMemoryCounterStore, RedisCounterStore};

/// Prefix of environment variables read by [`TurnstileConfig::load`].
pub const ENV_PREFIX: &str = "TURNSTILE";

/// Main configuration for Turnstile.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TurnstileConfig {
    /// Counter store connection
    #[serde(default)]
    pub store: StoreConfig,

    /// Rate limiting configuration
    #[serde(default)]
    pub rate_limiting: RateLimitingConfig,

    /// Connection admission configuration
    #[serde(default)]
    pub connections: ConnectionLimits,

    /// Log output
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Which counter store implementation to use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    /// Process-local store; only correct for a single instance
    Memory,
    /// Shared Redis store
    Redis,
}

/// Counter store configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreConfig {
    #[serde(default = "default_backend")]
    pub backend: StoreBackend,

    /// Store URL, used by the Redis backend
    #[serde(default = "default_store_url")]
    pub url: String,

    /// How long to wait for any single store round trip
    #[serde(default = "default_command_timeout")]
    pub command_timeout_ms: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: default_backend(),
            url: default_store_url(),
            command_timeout_ms: default_command_timeout(),
        }
    }
}

fn default_backend() -> StoreBackend {
    StoreBackend::Redis
}

fn default_store_url() -> String {
    "redis://127.0.0.1:6379/".to_string()
}

fn default_command_timeout() -> u64 {
    500
}

impl StoreConfig {
    pub fn command_timeout(&self) -> Duration {
        Duration::from_millis(self.command_timeout_ms)
    }

    /// Open the configured counter store.
    pub async fn connect(&self) -> Result<Arc<dyn CounterStore>> {
        match self.backend {
            StoreBackend::Memory => {
                info!("Using in-memory counter store");
                Ok(Arc::new(InMemoryCounterStore::new()))
            }
            StoreBackend::Redis => {
                let store = RedisCounterStore::connect(&self.url, self.command_timeout()).await?;
                Ok(Arc::new(store))
            }
        }
    }
}

/// Rate limiting configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimitingConfig {
    /// Namespace for window keys in the counter store
    #[serde(default = "default_rate_limit_prefix")]
    pub key_prefix: String,

    /// Limits for each operation class
    #[serde(default)]
    pub presets: RateLimitPresets,
}

impl Default for RateLimitingConfig {
    fn default() -> Self {
        Self {
            key_prefix: default_rate_limit_prefix(),
            presets: RateLimitPresets::default(),
        }
    }
}

fn default_rate_limit_prefix() -> String {
    DEFAULT_KEY_PREFIX.to_string()
}

/// Log output configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Default filter directive when `RUST_LOG` is unset
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Emit JSON lines instead of human-readable output
    #[serde(default)]
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

impl TurnstileConfig {
    /// Load configuration from an optional YAML file plus the environment.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let environment = config::Environment::with_prefix(ENV_PREFIX)
            .separator("__")
            .try_parsing(true);
        Self::load_from(path, environment)
    }

    /// Load configuration from an optional YAML file plus the given
    /// environment source.
    pub fn load_from(path: Option<&Path>, environment: config::Environment) -> Result<Self> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            info!(path = %path.display(), "Loading configuration");
            builder = builder.add_source(
                config::File::from(path)
                    .format(config::FileFormat::Yaml)
                    .required(true),
            );
        }

        let config: TurnstileConfig = builder
            .add_source(environment)
            .build()?
            .try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Parse configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let config: TurnstileConfig = serde_yaml::from_str(yaml)
            .map_err(|e| AdmissionError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Check values that deserialize fine but cannot work.
    pub fn validate(&self) -> Result<()> {
        if self.store.command_timeout_ms == 0 {
            return Err(AdmissionError::Config(
                "store.command_timeout_ms must be at least 1".to_string(),
            ));
        }
        self.rate_limiting.presets.validate()?;
        self.connections.validate()
    }
}
