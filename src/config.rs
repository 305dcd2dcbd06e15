//! Gateway configuration.
//!
//! Every field has a default, so an empty file (or no file at all) yields a
//! working gateway. Durations are whole milliseconds.
//!
//! ## Example TOML Configuration
//!
//! ```toml
//! call_deadline = 20000
//!
//! [cache]
//! capacity = 4096
//! shards = 16
//! default_ttl = 60000
//! sweep_interval = 30000
//!
//! [breaker]
//! failure_threshold = 5
//! failure_window = 60000
//! cooldown = 30000
//!
//! [retry]
//! max_attempts = 3
//! base_delay = 200
//! max_delay = 10000
//! backoff_multiplier = 2.0
//! jitter = 0.2
//! attempt_timeout = 30000
//! retry_on = ["network", "timeout"]
//!
//! [batch]
//! concurrency = 8
//! fail_fast_threshold = 0.5
//!
//! [stream]
//! page_size = 100
//! cache_pages = true
//!
//! [stream.layout]
//! items_field = "value"
//! cursor_field = "next_cursor"
//! ```
//!
//! Environment variables override file values: `APIGUARD__CACHE__CAPACITY=10`.

use resilience::{CircuitBreakerConfig, RetryPolicy};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

use crate::stream::PageLayout;

/// Errors that can occur when loading configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to load configuration: {0}")]
    Load(#[from] config::ConfigError),

    #[error("invalid configuration: {field}: {reason}")]
    Invalid { field: &'static str, reason: String },
}

impl ConfigError {
    fn invalid(field: &'static str, reason: impl Into<String>) -> Self {
        ConfigError::Invalid {
            field,
            reason: reason.into(),
        }
    }
}

/// Response cache settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Maximum number of cached responses.
    pub capacity: usize,
    /// Independent LRU shards; clamped to `capacity`.
    pub shards: usize,
    /// TTL used when a call's cache policy does not name one.
    #[serde(with = "resilience::serde_millis")]
    pub default_ttl: Duration,
    /// Period of the background expiry sweep. `None` relies on lazy expiry only.
    #[serde(with = "resilience::serde_millis::option")]
    pub sweep_interval: Option<Duration>,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            capacity: 1024,
            shards: 16,
            default_ttl: Duration::from_secs(60),
            sweep_interval: None,
        }
    }
}

/// Batch executor defaults.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BatchConfig {
    /// Maximum items in flight.
    pub concurrency: usize,
    /// Fraction of failed items (of all submitted) that aborts unstarted ones.
    pub fail_fast_threshold: Option<f64>,
    /// Return results in submission order instead of completion order.
    pub preserve_order: bool,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            concurrency: 8,
            fail_fast_threshold: None,
            preserve_order: false,
        }
    }
}

/// Streaming iterator defaults.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamConfig {
    pub page_size: usize,
    /// Route page requests through the cache with the default TTL. The
    /// cursor is part of each page's key.
    pub cache_pages: bool,
    pub layout: PageLayout,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            page_size: 100,
            cache_pages: true,
            layout: PageLayout::default(),
        }
    }
}

/// Metrics collector settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MetricsConfig {
    /// Distinct operation names tracked before new ones are dropped.
    pub max_operations: usize,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            max_operations: telemetry::DEFAULT_MAX_OPERATIONS,
        }
    }
}

/// Top-level configuration for a [`Gateway`](crate::Gateway).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    pub cache: CacheConfig,
    pub breaker: CircuitBreakerConfig,
    /// Retry policy for calls that do not bring their own.
    pub retry: RetryPolicy,
    pub batch: BatchConfig,
    pub stream: StreamConfig,
    pub metrics: MetricsConfig,
    /// Hard ceiling on breaker plus retry time for calls without their own deadline.
    #[serde(with = "resilience::serde_millis::option")]
    pub call_deadline: Option<Duration>,
}

impl GatewayConfig {
    /// Load from an optional `apiguard.{toml,yaml,json}` in the working
    /// directory, overridden by `APIGUARD__*` environment variables.
    pub fn load() -> Result<Self, ConfigError> {
        let builder = config::Config::builder()
            .add_source(config::File::with_name("apiguard").required(false));
        Self::finish(builder)
    }

    /// Load from an explicit file (format from its extension), overridden by
    /// `APIGUARD__*` environment variables.
    pub fn load_from(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let builder =
            config::Config::builder().add_source(config::File::from(path.as_ref()).required(true));
        Self::finish(builder)
    }

    /// Parse inline TOML. Environment variables are not consulted.
    pub fn from_toml_str(toml: &str) -> Result<Self, ConfigError> {
        let config: GatewayConfig = config::Config::builder()
            .add_source(config::File::from_str(toml, config::FileFormat::Toml))
            .build()?
            .try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    fn finish(
        builder: config::ConfigBuilder<config::builder::DefaultState>,
    ) -> Result<Self, ConfigError> {
        let config: GatewayConfig = builder
            .add_source(
                config::Environment::with_prefix("APIGUARD")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Reject settings the gateway cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.cache.capacity == 0 {
            return Err(ConfigError::invalid("cache.capacity", "must be at least 1"));
        }
        if self.cache.shards == 0 {
            return Err(ConfigError::invalid("cache.shards", "must be at least 1"));
        }
        if self.cache.sweep_interval.is_some_and(|d| d.is_zero()) {
            return Err(ConfigError::invalid("cache.sweep_interval", "must be positive"));
        }
        if self.breaker.failure_threshold == 0 {
            return Err(ConfigError::invalid("breaker.failure_threshold", "must be at least 1"));
        }
        if self.retry.max_attempts == 0 {
            return Err(ConfigError::invalid("retry.max_attempts", "must be at least 1"));
        }
        if !(0.0..=1.0).contains(&self.retry.jitter) {
            return Err(ConfigError::invalid(
                "retry.jitter",
                format!("{} is outside [0, 1]", self.retry.jitter),
            ));
        }
        if !(self.retry.backoff_multiplier >= 1.0) {
            return Err(ConfigError::invalid(
                "retry.backoff_multiplier",
                format!("{} is below 1.0", self.retry.backoff_multiplier),
            ));
        }
        if self.batch.concurrency == 0 {
            return Err(ConfigError::invalid("batch.concurrency", "must be at least 1"));
        }
        if let Some(threshold) = self.batch.fail_fast_threshold {
            if !(threshold > 0.0 && threshold <= 1.0) {
                return Err(ConfigError::invalid(
                    "batch.fail_fast_threshold",
                    format!("{threshold} is outside (0, 1]"),
                ));
            }
        }
        if self.stream.page_size == 0 {
            return Err(ConfigError::invalid("stream.page_size", "must be at least 1"));
        }
        let layout = &self.stream.layout;
        for (field, value) in [
            ("stream.layout.items_field", &layout.items_field),
            ("stream.layout.cursor_field", &layout.cursor_field),
            ("stream.layout.cursor_arg", &layout.cursor_arg),
            ("stream.layout.limit_arg", &layout.limit_arg),
        ] {
            if value.is_empty() {
                return Err(ConfigError::invalid(field, "must not be empty"));
            }
        }
        if self.metrics.max_operations == 0 {
            return Err(ConfigError::invalid("metrics.max_operations", "must be at least 1"));
        }
        Ok(())
    }
}
