//! Cache configuration types and cache operation results
//!
//! This module contains the core types used throughout the cache system:
//! - [`CacheConfig`]: Configuration for cache instances (prefix, TTLs, locking)
//! - [`CacheSource`]: Enum indicating where a value came from (for observability)
//! - [`CacheResult`]: Wrapper containing a value and its source

use std::fmt;
use std::time::Duration;

use crate::lock::LockConfig;

/// Value stored in place of a real entry when the source reported "does not exist".
///
/// Every real value is stored as JSON, and no JSON document serializes to this
/// literal, so the two can never be confused.
pub const NULL_SENTINEL: &str = "NULL";

/// Configuration for cache instances
#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// Redis key prefix for this cache instance (e.g., "article:", "item_stats:")
    pub cache_prefix: String,

    /// Base TTL for real values
    pub ttl: Duration,

    /// Real values live for `ttl + uniform(0, ttl * ttl_jitter_ratio)`
    pub ttl_jitter_ratio: f64,

    /// Base TTL for the NULL sentinel
    pub null_ttl: Duration,

    /// The NULL sentinel lives for `null_ttl + uniform(0, null_ttl_jitter)`
    pub null_ttl_jitter: Duration,

    pub lock: LockConfig,

    /// Cache re-checks after the lock wait expires, before loading directly
    pub max_retries: u32,
    pub retry_interval: Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            cache_prefix: String::new(),
            ttl: Duration::from_secs(3600),
            ttl_jitter_ratio: 0.2,
            null_ttl: Duration::from_secs(300),
            null_ttl_jitter: Duration::from_secs(60),
            lock: LockConfig::default(),
            max_retries: 3,
            retry_interval: Duration::from_millis(100),
        }
    }
}

impl CacheConfig {
    /// Create a cache configuration with a TTL and default locking behaviour
    pub fn with_ttl(cache_prefix: impl Into<String>, ttl_seconds: u64) -> Self {
        Self {
            cache_prefix: cache_prefix.into(),
            ttl: Duration::from_secs(ttl_seconds),
            ..Self::default()
        }
    }

    pub fn null_ttl(mut self, base: Duration, jitter: Duration) -> Self {
        self.null_ttl = base;
        self.null_ttl_jitter = jitter;
        self
    }

    pub fn ttl_jitter_ratio(mut self, ratio: f64) -> Self {
        self.ttl_jitter_ratio = ratio;
        self
    }

    pub fn lock(mut self, lock: LockConfig) -> Self {
        self.lock = lock;
        self
    }

    pub fn retries(mut self, max_retries: u32, retry_interval: Duration) -> Self {
        self.max_retries = max_retries;
        self.retry_interval = retry_interval;
        self
    }
}

/// Indicates where a cached value came from and what operations were performed
///
/// This type implements `Display` for use in logging and metrics:
/// ```
/// # use common_cache::CacheSource;
/// let source = CacheSource::PositiveCache;
/// println!("Cache result: {}", source); // "positive_cache"
/// ```
#[non_exhaustive]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheSource {
    // Value found cases
    /// Value was found in Redis cache
    PositiveCache,
    /// Cache miss - value loaded from loader function while holding the key lock
    LoaderCacheMiss,
    /// Cache data was corrupted - evicted, then loaded from loader function
    LoaderCacheCorrupted,
    /// Redis was unavailable - value loaded from loader function, nothing cached
    LoaderRedisUnavailable,
    /// Key lock could not be taken in time - value loaded directly, nothing cached
    LoaderLockContended,

    // Value not found cases
    /// NULL sentinel found in Redis (known to not exist)
    NegativeCache,
    /// Cache miss - loader function indicated value doesn't exist
    LoaderNotFoundCacheMiss,
    /// Cache was corrupted - loader function indicated value doesn't exist
    LoaderNotFoundCacheCorrupted,
    /// Redis was unavailable - loader function indicated value doesn't exist
    LoaderNotFoundRedisUnavailable,
    /// Key lock could not be taken in time - loader function indicated value doesn't exist
    LoaderNotFoundLockContended,
}

impl fmt::Display for CacheSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CacheSource::PositiveCache => write!(f, "positive_cache"),
            CacheSource::NegativeCache => write!(f, "negative_cache"),
            CacheSource::LoaderCacheMiss => write!(f, "loader_cache_miss"),
            CacheSource::LoaderCacheCorrupted => write!(f, "loader_cache_corrupted"),
            CacheSource::LoaderRedisUnavailable => write!(f, "loader_redis_unavailable"),
            CacheSource::LoaderLockContended => write!(f, "loader_lock_contended"),
            CacheSource::LoaderNotFoundCacheMiss => write!(f, "loader_not_found_cache_miss"),
            CacheSource::LoaderNotFoundCacheCorrupted => {
                write!(f, "loader_not_found_cache_corrupted")
            }
            CacheSource::LoaderNotFoundRedisUnavailable => {
                write!(f, "loader_not_found_redis_unavailable")
            }
            CacheSource::LoaderNotFoundLockContended => {
                write!(f, "loader_not_found_lock_contended")
            }
        }
    }
}

/// How a miss was reached, used to pick the final [`CacheSource`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum MissKind {
    Miss,
    Corrupted,
    RedisUnavailable,
    LockContended,
}

impl MissKind {
    pub(crate) fn source(self, found: bool) -> CacheSource {
        match (self, found) {
            (MissKind::Miss, true) => CacheSource::LoaderCacheMiss,
            (MissKind::Corrupted, true) => CacheSource::LoaderCacheCorrupted,
            (MissKind::RedisUnavailable, true) => CacheSource::LoaderRedisUnavailable,
            (MissKind::LockContended, true) => CacheSource::LoaderLockContended,
            (MissKind::Miss, false) => CacheSource::LoaderNotFoundCacheMiss,
            (MissKind::Corrupted, false) => CacheSource::LoaderNotFoundCacheCorrupted,
            (MissKind::RedisUnavailable, false) => CacheSource::LoaderNotFoundRedisUnavailable,
            (MissKind::LockContended, false) => CacheSource::LoaderNotFoundLockContended,
        }
    }
}

/// Result of a cache operation with detailed source information
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheResult<V> {
    /// The value, if found. None indicates the item doesn't exist (negative result)
    pub value: Option<V>,

    /// Where the result came from - provides context for observability
    pub source: CacheSource,
}

impl<V> CacheResult<V> {
    /// Create a cache result with a value
    pub fn found(value: V, source: CacheSource) -> Self {
        Self {
            value: Some(value),
            source,
        }
    }

    /// Create a cache result indicating the value was not found
    pub fn not_found(source: CacheSource) -> Self {
        Self {
            value: None,
            source,
        }
    }

    pub(crate) fn from_loaded(value: Option<V>, kind: MissKind) -> Self {
        let source = kind.source(value.is_some());
        Self { value, source }
    }

    /// Check if this was a cache hit (real value or NULL sentinel)
    pub fn was_cached(&self) -> bool {
        matches!(
            self.source,
            CacheSource::PositiveCache | CacheSource::NegativeCache
        )
    }

    /// Check if the loader function was invoked
    pub fn invoked_loader(&self) -> bool {
        !self.was_cached()
    }

    /// Check if there was a cache infrastructure problem
    pub fn had_cache_problem(&self) -> bool {
        matches!(
            self.source,
            CacheSource::LoaderCacheCorrupted
                | CacheSource::LoaderRedisUnavailable
                | CacheSource::LoaderNotFoundCacheCorrupted
                | CacheSource::LoaderNotFoundRedisUnavailable
        )
    }

    /// Check if the key lock was contended long enough to bypass the cache
    pub fn was_lock_contended(&self) -> bool {
        matches!(
            self.source,
            CacheSource::LoaderLockContended | CacheSource::LoaderNotFoundLockContended
        )
    }
}
