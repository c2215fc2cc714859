//! Configuration management for fairq
//!
//! Settings come from defaults, environment variables (`FAIRQ_*`, `REDIS_URL`)
//! or a TOML file. Every field has a default so a partial file is valid.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    /// Queue name; instances sharing a name share one schedule
    pub name: String,

    /// Namespace prefix for every coordinator key
    pub key_prefix: String,

    /// Redis coordinator settings
    pub redis: RedisConfig,

    /// Stable instance identity. A random id is generated when unset;
    /// set it to let a restarted process recover its own in-flight jobs.
    pub instance_id: Option<String>,

    /// Maximum host queue length per destination (unbounded when unset)
    pub max_queue_length: Option<usize>,

    /// Dedup entry lifetime in seconds (never expires when unset)
    pub dedup_ttl_secs: Option<u64>,

    /// Tombstone lifetime in seconds
    pub tombstone_ttl_secs: u64,

    /// An instance whose heartbeat is older than this is considered dead
    pub stale_interval_ms: u64,

    /// Heartbeat period; must be shorter than `stale_interval_ms`
    pub heartbeat_interval_ms: u64,

    /// Upper bound of one blocking slot wait before the active flag is rechecked
    pub block_timeout_ms: u64,

    /// Publish job outcomes for `wait_for`
    pub publish_results: bool,

    /// How long an unconsumed outcome is retained, in seconds
    pub result_ttl_secs: u64,

    /// Capacity of the observer broadcast channel
    pub event_channel_capacity: usize,

    /// Logging configuration for the `fairq` binary
    pub logging: LoggingConfig,
}

/// Redis coordinator configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RedisConfig {
    /// Redis URL (e.g., redis://localhost:6379)
    pub url: String,

    /// Connection pool size for non-blocking commands
    pub pool_size: usize,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    pub level: String,

    /// Log format (text, json)
    pub format: String,
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            url: String::from("redis://localhost:6379"),
            pool_size: 10,
        }
    }
}

const LOG_LEVELS: [&str; 5] = ["trace", "debug", "info", "warn", "error"];
const LOG_FORMATS: [&str; 2] = ["text", "json"];

impl LoggingConfig {
    /// `tracing_subscriber::EnvFilter` directive: this crate at the configured
    /// level, dependencies at warn
    #[must_use]
    pub fn filter_directive(&self) -> String {
        format!("fairq={},warn", self.level)
    }

    pub fn is_json(&self) -> bool {
        self.format == "json"
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: String::from("info"),
            format: String::from("text"),
        }
    }
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            name: String::from("default"),
            key_prefix: String::from("fair-queue"),
            redis: RedisConfig::default(),
            instance_id: None,
            max_queue_length: None,
            dedup_ttl_secs: None,
            tombstone_ttl_secs: 86_400,
            stale_interval_ms: 30_000,
            heartbeat_interval_ms: 10_000,
            block_timeout_ms: 1_000,
            publish_results: true,
            result_ttl_secs: 600,
            event_channel_capacity: 256,
            logging: LoggingConfig::default(),
        }
    }
}

fn env_parse<T: std::str::FromStr>(name: &str) -> Option<T> {
    std::env::var(name).ok().and_then(|v| v.parse::<T>().ok())
}

impl QueueConfig {
    /// Create a config for the named queue with defaults
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self> {
        let defaults = Self::default();

        let config = Self {
            name: std::env::var("FAIRQ_NAME").unwrap_or(defaults.name),
            key_prefix: std::env::var("FAIRQ_KEY_PREFIX").unwrap_or(defaults.key_prefix),
            redis: RedisConfig {
                url: std::env::var("REDIS_URL").unwrap_or(defaults.redis.url),
                pool_size: env_parse("REDIS_POOL_SIZE").unwrap_or(defaults.redis.pool_size),
            },
            instance_id: std::env::var("FAIRQ_INSTANCE_ID").ok(),
            max_queue_length: env_parse("FAIRQ_MAX_QUEUE_LENGTH"),
            dedup_ttl_secs: env_parse("FAIRQ_DEDUP_TTL"),
            tombstone_ttl_secs: env_parse("FAIRQ_TOMBSTONE_TTL")
                .unwrap_or(defaults.tombstone_ttl_secs),
            stale_interval_ms: env_parse("FAIRQ_STALE_INTERVAL_MS")
                .unwrap_or(defaults.stale_interval_ms),
            heartbeat_interval_ms: env_parse("FAIRQ_HEARTBEAT_INTERVAL_MS")
                .unwrap_or(defaults.heartbeat_interval_ms),
            block_timeout_ms: env_parse("FAIRQ_BLOCK_TIMEOUT_MS")
                .unwrap_or(defaults.block_timeout_ms),
            publish_results: env_parse("FAIRQ_PUBLISH_RESULTS")
                .unwrap_or(defaults.publish_results),
            result_ttl_secs: env_parse("FAIRQ_RESULT_TTL").unwrap_or(defaults.result_ttl_secs),
            event_channel_capacity: defaults.event_channel_capacity,
            logging: LoggingConfig {
                level: std::env::var("FAIRQ_LOG_LEVEL").unwrap_or(defaults.logging.level),
                format: std::env::var("FAIRQ_LOG_FORMAT").unwrap_or(defaults.logging.format),
            },
        };

        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a TOML file
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let config: Self = toml::from_str(&content)
            .with_context(|| format!("Failed to parse TOML config file: {}", path.display()))?;

        config.validate()?;
        Ok(config)
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<()> {
        if self.name.is_empty() {
            anyhow::bail!("name must not be empty");
        }

        if self.redis.pool_size == 0 {
            anyhow::bail!("redis.pool_size must be greater than 0");
        }

        if self.max_queue_length == Some(0) {
            anyhow::bail!("max_queue_length must be greater than 0 when set");
        }

        if self.heartbeat_interval_ms == 0 || self.heartbeat_interval_ms >= self.stale_interval_ms
        {
            anyhow::bail!("heartbeat_interval_ms must be positive and below stale_interval_ms");
        }

        if self.block_timeout_ms == 0 {
            anyhow::bail!("block_timeout_ms must be greater than 0");
        }

        if self.event_channel_capacity == 0 {
            anyhow::bail!("event_channel_capacity must be greater than 0");
        }

        if !LOG_LEVELS.contains(&self.logging.level.as_str()) {
            anyhow::bail!(
                "logging.level must be one of {}, got '{}'",
                LOG_LEVELS.join(", "),
                self.logging.level
            );
        }

        if !LOG_FORMATS.contains(&self.logging.format.as_str()) {
            anyhow::bail!(
                "logging.format must be text or json, got '{}'",
                self.logging.format
            );
        }

        Ok(())
    }

    pub fn with_redis_url(mut self, url: &str) -> Self {
        self.redis.url = url.to_string();
        self
    }

    pub fn with_instance_id(mut self, id: &str) -> Self {
        self.instance_id = Some(id.to_string());
        self
    }

    pub fn with_max_queue_length(mut self, max: usize) -> Self {
        self.max_queue_length = Some(max);
        self
    }

    pub fn with_dedup_ttl(mut self, ttl: Duration) -> Self {
        self.dedup_ttl_secs = Some(ttl.as_secs());
        self
    }

    pub fn with_stale_interval(mut self, interval: Duration) -> Self {
        self.stale_interval_ms = interval.as_millis() as u64;
        self
    }

    pub fn with_heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval_ms = interval.as_millis() as u64;
        self
    }

    pub fn with_block_timeout(mut self, timeout: Duration) -> Self {
        self.block_timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn with_publish_results(mut self, enabled: bool) -> Self {
        self.publish_results = enabled;
        self
    }

    /// Base key every coordinator key of this queue hangs off
    #[must_use]
    pub fn namespace(&self) -> String {
        format!("{}:{}", self.key_prefix, self.name)
    }

    #[must_use]
    pub fn dedup_ttl(&self) -> Option<Duration> {
        self.dedup_ttl_secs.map(Duration::from_secs)
    }

    #[must_use]
    pub fn tombstone_ttl(&self) -> Duration {
        Duration::from_secs(self.tombstone_ttl_secs)
    }

    #[must_use]
    pub fn stale_interval(&self) -> Duration {
        Duration::from_millis(self.stale_interval_ms)
    }

    #[must_use]
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    #[must_use]
    pub fn block_timeout(&self) -> Duration {
        Duration::from_millis(self.block_timeout_ms)
    }

    #[must_use]
    pub fn result_ttl(&self) -> Duration {
        Duration::from_secs(self.result_ttl_secs)
    }
}
