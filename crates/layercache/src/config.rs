use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::invalidation::ListenerOptions;
use crate::namespace::Namespace;
use crate::serializer::SerializerKind;
use crate::stats::AggregatorOptions;

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct LayeringConfig {
    #[serde(default)]
    pub namespace: NamespaceConfig,
    /// Redis configuration
    #[serde(default)]
    pub redis: RedisConfig,
    /// Encoding of values in the remote tier
    #[serde(default)]
    pub serializer: SerializerKind,
    #[serde(default)]
    pub stats: StatsConfig,
    #[serde(default)]
    pub invalidation: InvalidationConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl LayeringConfig {
    pub fn validate(&self) -> Result<(), String> {
        if self.namespace.service.trim().is_empty() {
            return Err("namespace.service must not be empty".into());
        }
        if self.namespace.service.contains(':') {
            return Err("namespace.service must not contain ':'".into());
        }
        if self.redis.enabled && self.redis.url.trim().is_empty() {
            return Err("redis.url must be set when redis is enabled".into());
        }
        if self.redis.pool_size == 0 {
            return Err("redis.pool_size must be > 0".into());
        }
        if self.stats.period_secs == 0 {
            return Err("stats.period_secs must be > 0".into());
        }
        if self.stats.lock_lease_secs == 0 {
            return Err("stats.lock_lease_secs must be > 0".into());
        }
        if self.invalidation.poll_interval_ms == 0 {
            return Err("invalidation.poll_interval_ms must be > 0".into());
        }
        if self.invalidation.max_queue_len == 0 || self.invalidation.batch_size == 0 {
            return Err("invalidation queue sizes must be > 0".into());
        }
        if self.invalidation.batch_size > self.invalidation.max_queue_len {
            return Err("invalidation.batch_size must not exceed max_queue_len".into());
        }
        if tracing_subscriber::EnvFilter::try_new(&self.logging.level).is_err() {
            return Err(format!("logging.level '{}' is not a valid filter", self.logging.level));
        }
        Ok(())
    }
}

/// Deployment identity; every store key is scoped by it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NamespaceConfig {
    #[serde(default = "default_service")]
    pub service: String,
    /// Optional environment, e.g. "prod"; prepended to the service name
    #[serde(default)]
    pub env: Option<String>,
}

fn default_service() -> String {
    "layercache".into()
}

impl Default for NamespaceConfig {
    fn default() -> Self {
        Self {
            service: default_service(),
            env: None,
        }
    }
}

impl NamespaceConfig {
    pub fn namespace(&self) -> Namespace {
        Namespace::new(&self.service, self.env.as_deref())
    }
}

/// Redis configuration for the distributed tier.
///
/// ## Deployment Modes
///
/// - **Single instance** (Redis disabled): an in-process store stands in for Redis
/// - **Multi instance** (Redis enabled): remote tier, locks, invalidation and stats shared via Redis
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RedisConfig {
    /// Enable Redis (gracefully degrades without it)
    /// Default: false (disabled for single-instance deployments)
    #[serde(default = "default_redis_enabled")]
    pub enabled: bool,

    /// Redis connection URL (e.g., "redis://localhost:6379")
    #[serde(default = "default_redis_url")]
    pub url: String,

    /// Connection pool size
    #[serde(default = "default_redis_pool_size")]
    pub pool_size: usize,

    /// Connection timeout in milliseconds
    #[serde(default = "default_redis_timeout_ms")]
    pub timeout_ms: u64,
}

fn default_redis_enabled() -> bool {
    false
}

fn default_redis_url() -> String {
    "redis://localhost:6379".to_string()
}

fn default_redis_pool_size() -> usize {
    10
}

fn default_redis_timeout_ms() -> u64 {
    5000
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            enabled: default_redis_enabled(),
            url: default_redis_url(),
            pool_size: default_redis_pool_size(),
            timeout_ms: default_redis_timeout_ms(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatsConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Seconds between aggregation passes
    #[serde(default = "default_stats_period_secs")]
    pub period_secs: u64,
    #[serde(default = "default_stats_lock_lease_secs")]
    pub lock_lease_secs: u64,
    #[serde(default = "default_stats_lock_wait_ms")]
    pub lock_wait_ms: u64,
    /// Lifetime of a durable stats record after its last merge
    #[serde(default = "default_stats_record_ttl_secs")]
    pub record_ttl_secs: u64,
}

fn default_true() -> bool {
    true
}

fn default_stats_period_secs() -> u64 {
    60
}

fn default_stats_lock_lease_secs() -> u64 {
    5
}

fn default_stats_lock_wait_ms() -> u64 {
    500
}

fn default_stats_record_ttl_secs() -> u64 {
    24 * 60 * 60
}

impl Default for StatsConfig {
    fn default() -> Self {
        Self {
            enabled: default_true(),
            period_secs: default_stats_period_secs(),
            lock_lease_secs: default_stats_lock_lease_secs(),
            lock_wait_ms: default_stats_lock_wait_ms(),
            record_ttl_secs: default_stats_record_ttl_secs(),
        }
    }
}

impl StatsConfig {
    pub fn aggregator_options(&self) -> AggregatorOptions {
        AggregatorOptions {
            period: Duration::from_secs(self.period_secs),
            lock_lease: Duration::from_secs(self.lock_lease_secs),
            lock_wait: Duration::from_millis(self.lock_wait_ms),
            record_ttl: Duration::from_secs(self.record_ttl_secs),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvalidationConfig {
    /// Interval of the durable-queue poller
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    /// Bound of the durable queue
    #[serde(default = "default_max_queue_len")]
    pub max_queue_len: u64,
    /// Entries read per queue page
    #[serde(default = "default_batch_size")]
    pub batch_size: u64,
    /// Overlap re-read behind the watermark
    #[serde(default = "default_clock_skew_tolerance_ms")]
    pub clock_skew_tolerance_ms: u64,
}

fn default_poll_interval_ms() -> u64 {
    1000
}

fn default_max_queue_len() -> u64 {
    1000
}

fn default_batch_size() -> u64 {
    100
}

fn default_clock_skew_tolerance_ms() -> u64 {
    2000
}

impl Default for InvalidationConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: default_poll_interval_ms(),
            max_queue_len: default_max_queue_len(),
            batch_size: default_batch_size(),
            clock_skew_tolerance_ms: default_clock_skew_tolerance_ms(),
        }
    }
}

impl InvalidationConfig {
    pub fn listener_options(&self) -> ListenerOptions {
        ListenerOptions {
            poll_interval: Duration::from_millis(self.poll_interval_ms),
            max_queue_len: self.max_queue_len,
            batch_size: self.batch_size,
            clock_skew_tolerance: Duration::from_millis(self.clock_skew_tolerance_ms),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
}
fn default_log_level() -> String {
    "info".into()
}
impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

pub mod loader {
    use super::LayeringConfig;
    use config::{Config, Environment, File};
    use std::path::PathBuf;

    pub fn load_config(path: Option<&str>) -> Result<LayeringConfig, String> {
        let mut builder = Config::builder();
        match path {
            Some(p) => {
                let pathbuf = PathBuf::from(p);
                if pathbuf.exists() {
                    builder = builder.add_source(File::from(pathbuf));
                }
            }
            None => {
                let default_path = PathBuf::from("layercache.toml");
                if default_path.exists() {
                    builder = builder.add_source(File::from(default_path));
                }
            }
        }
        // Environment variable overrides, e.g., LAYERCACHE__REDIS__ENABLED=true
        builder = builder.add_source(
            Environment::with_prefix("LAYERCACHE")
                .try_parsing(true)
                .separator("__"),
        );
        let cfg = builder
            .build()
            .map_err(|e| format!("config build error: {e}"))?;
        let merged: LayeringConfig = cfg
            .try_deserialize()
            .map_err(|e| format!("config deserialize error: {e}"))?;
        merged.validate()?;
        Ok(merged)
    }
}
