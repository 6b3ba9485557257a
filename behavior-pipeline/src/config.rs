use std::time::Duration;

use common_cache::{CacheConfig, LockConfig};
use common_kafka::config::{ConsumerConfig, KafkaConfig};
use envconfig::Envconfig;

use crate::aggregation::EmitMode;
use crate::event::ActionKind;

#[derive(Envconfig, Clone, Debug)]
pub struct Config {
    // HTTP server configuration
    #[envconfig(from = "BIND_HOST", default = "0.0.0.0")]
    pub host: String,

    #[envconfig(from = "BIND_PORT", default = "8080")]
    pub port: u16,

    #[envconfig(nested = true)]
    pub kafka: KafkaConfig,

    // "kafka" or "memory" (single-process broker, for local runs)
    #[envconfig(default = "kafka")]
    pub transport: String,

    #[envconfig(default = "user_behavior_events")]
    pub events_topic: String,

    #[envconfig(default = "behavior-apply")]
    pub apply_consumer_group: String,

    #[envconfig(default = "behavior-aggregation")]
    pub aggregation_consumer_group: String,

    #[envconfig(default = "earliest")]
    pub kafka_consumer_offset_reset: String,

    // Redis configuration
    #[envconfig(default = "redis://localhost:6379/")]
    pub redis_url: String,

    #[envconfig(default = "100")] // 0 disables the timeout
    pub redis_response_timeout_ms: u64,

    #[envconfig(default = "5000")] // 0 disables the timeout
    pub redis_connection_timeout_ms: u64,

    // Deduplication ledger
    #[envconfig(default = "processed_message_ids")]
    pub dedup_set_key: String,

    #[envconfig(default = "604800")] // 7 days
    pub dedup_retention_secs: u64,

    // Behavior store
    #[envconfig(default = "604800")] // 7 days
    pub behavior_retention_secs: u64,

    #[envconfig(default = "2592000")] // 30 days
    pub daily_stats_retention_secs: u64,

    // Windowed aggregation
    #[envconfig(default = "5000")]
    pub window_size_ms: i64,

    #[envconfig(default = "0")]
    pub window_epoch_ms: i64,

    // on_close, continuous
    #[envconfig(default = "on_close")]
    pub emit_mode: String,

    // Comma separated, matched case-insensitively
    #[envconfig(default = "view")]
    pub action_kinds_of_interest: String,

    #[envconfig(default = "1000")]
    pub aggregation_tick_ms: u64,

    // Ranking store
    #[envconfig(default = "article:ranking:")]
    pub ranking_key_prefix: String,

    #[envconfig(default = "86400")] // 24 hours
    pub ranking_window_retention_secs: u64,

    #[envconfig(default = "0")] // 0 keeps every entity
    pub ranking_current_max_entries: u64,

    // Cache-aside layer
    #[envconfig(default = "article:")]
    pub cache_prefix: String,

    #[envconfig(default = "3600")]
    pub cache_ttl_secs: u64,

    #[envconfig(default = "0.2")]
    pub cache_ttl_jitter_ratio: f64,

    #[envconfig(default = "300")]
    pub cache_null_ttl_secs: u64,

    #[envconfig(default = "60")]
    pub cache_null_jitter_secs: u64,

    #[envconfig(default = "5000")]
    pub cache_lock_wait_ms: u64,

    #[envconfig(default = "30000")]
    pub cache_lock_lease_ms: u64,

    #[envconfig(default = "3")]
    pub cache_max_retries: u32,

    #[envconfig(default = "100")]
    pub cache_retry_interval_ms: u64,

    // Consumer loops
    #[envconfig(default = "500")]
    pub consumer_retry_backoff_ms: u64,

    // A consumer loop that has not reported for this long fails readiness
    #[envconfig(default = "30")]
    pub readiness_deadline_secs: u64,

    #[envconfig(default = "4")]
    pub memory_partitions: usize,

    // Publishes a random event this often, 0 disables
    #[envconfig(default = "0")]
    pub demo_producer_interval_ms: u64,

    #[envconfig(default = "30")]
    pub shutdown_timeout_secs: u64,
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("window_size_ms must be positive, got {0}")]
    WindowSize(i64),
    #[error("unknown emit mode '{0}', expected on_close or continuous")]
    EmitMode(String),
    #[error("unknown transport '{0}', expected kafka or memory")]
    Transport(String),
    #[error("action_kinds_of_interest must name at least one action kind")]
    NoActionKinds,
    #[error("cache_ttl_jitter_ratio must be between 0 and 1, got {0}")]
    JitterRatio(f64),
    #[error("cache_lock_wait_ms must be positive")]
    LockWait,
    #[error("cache_lock_lease_ms must be positive")]
    LockLease,
    #[error("cache_lock_lease_ms ({lease_ms}) must not be shorter than cache_lock_wait_ms ({wait_ms})")]
    LeaseShorterThanWait { lease_ms: u64, wait_ms: u64 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportKind {
    Kafka,
    Memory,
}

impl Config {
    pub fn init_with_defaults() -> Result<Self, envconfig::Error> {
        Config::init_from_env()
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.window_size_ms <= 0 {
            return Err(ConfigError::WindowSize(self.window_size_ms));
        }
        self.emit_mode()?;
        self.transport_kind()?;
        if self.action_kinds().is_empty() {
            return Err(ConfigError::NoActionKinds);
        }
        if !(0.0..=1.0).contains(&self.cache_ttl_jitter_ratio) {
            return Err(ConfigError::JitterRatio(self.cache_ttl_jitter_ratio));
        }
        if self.cache_lock_wait_ms == 0 {
            return Err(ConfigError::LockWait);
        }
        if self.cache_lock_lease_ms == 0 {
            return Err(ConfigError::LockLease);
        }
        if self.cache_lock_lease_ms < self.cache_lock_wait_ms {
            return Err(ConfigError::LeaseShorterThanWait {
                lease_ms: self.cache_lock_lease_ms,
                wait_ms: self.cache_lock_wait_ms,
            });
        }
        Ok(())
    }

    /// Get server bind address
    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn emit_mode(&self) -> Result<EmitMode, ConfigError> {
        self.emit_mode
            .parse()
            .map_err(|_| ConfigError::EmitMode(self.emit_mode.clone()))
    }

    pub fn transport_kind(&self) -> Result<TransportKind, ConfigError> {
        match self.transport.to_ascii_lowercase().as_str() {
            "kafka" => Ok(TransportKind::Kafka),
            "memory" => Ok(TransportKind::Memory),
            other => Err(ConfigError::Transport(other.to_string())),
        }
    }

    pub fn action_kinds(&self) -> Vec<ActionKind> {
        self.action_kinds_of_interest
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(ActionKind::parse)
            .collect()
    }

    pub fn apply_consumer_config(&self) -> ConsumerConfig {
        self.consumer_config(&self.apply_consumer_group)
    }

    pub fn aggregation_consumer_config(&self) -> ConsumerConfig {
        self.consumer_config(&self.aggregation_consumer_group)
    }

    fn consumer_config(&self, group: &str) -> ConsumerConfig {
        let mut config = ConsumerConfig::new(group, &self.events_topic);
        config
            .kafka_consumer_offset_reset
            .clone_from(&self.kafka_consumer_offset_reset);
        config
    }

    pub fn redis_response_timeout(&self) -> Option<Duration> {
        non_zero_millis(self.redis_response_timeout_ms)
    }

    pub fn redis_connection_timeout(&self) -> Option<Duration> {
        non_zero_millis(self.redis_connection_timeout_ms)
    }

    pub fn dedup_retention(&self) -> Duration {
        Duration::from_secs(self.dedup_retention_secs)
    }

    pub fn aggregation_tick(&self) -> Duration {
        Duration::from_millis(self.aggregation_tick_ms.max(1))
    }

    pub fn ranking_window_retention(&self) -> Duration {
        Duration::from_secs(self.ranking_window_retention_secs)
    }

    pub fn consumer_retry_backoff(&self) -> Duration {
        Duration::from_millis(self.consumer_retry_backoff_ms)
    }

    pub fn readiness_deadline(&self) -> Duration {
        Duration::from_secs(self.readiness_deadline_secs)
    }

    pub fn demo_producer_interval(&self) -> Option<Duration> {
        non_zero_millis(self.demo_producer_interval_ms)
    }

    /// Get shutdown timeout as Duration
    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout_secs)
    }

    pub fn cache_config(&self) -> CacheConfig {
        CacheConfig::with_ttl(self.cache_prefix.clone(), self.cache_ttl_secs)
            .ttl_jitter_ratio(self.cache_ttl_jitter_ratio)
            .null_ttl(
                Duration::from_secs(self.cache_null_ttl_secs),
                Duration::from_secs(self.cache_null_jitter_secs),
            )
            .lock(LockConfig {
                wait: Duration::from_millis(self.cache_lock_wait_ms),
                lease: Duration::from_millis(self.cache_lock_lease_ms),
                ..LockConfig::default()
            })
            .retries(
                self.cache_max_retries,
                Duration::from_millis(self.cache_retry_interval_ms),
            )
    }
}

fn non_zero_millis(ms: u64) -> Option<Duration> {
    (ms > 0).then(|| Duration::from_millis(ms))
}
