//! Read-through cache implementation with Redis backing
//!
//! This module provides the main [`ReadThroughCache`] type that implements the cache-aside
//! pattern with support for:
//! - NULL-sentinel caching of "does not exist" results
//! - Jittered TTLs
//! - A per-key distributed lock so only one caller rebuilds a cold key
//! - Cache corruption handling
//! - Graceful Redis degradation

use crate::lock::{LockGuard, RedisMutex};
use crate::ttl::{as_px, jittered_ttl, ttl_with_extra};
use crate::types::{MissKind, NULL_SENTINEL};
use crate::{CacheConfig, CacheResult, CacheSource};
use common_redis::{Client as RedisClient, CustomRedisError};
use serde::{de::DeserializeOwned, Serialize};
use std::fmt::Display;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Outcome of a single cache read.
enum Lookup<V> {
    Hit(V),
    Null,
    Miss,
    Corrupted(String),
    Unavailable(CustomRedisError),
}

/// A generic read-through cache.
///
/// The read path for a key:
/// 1. Read Redis. A real value or the NULL sentinel is returned as is.
///    Undecodable data is deleted and treated as a miss. If Redis can't be
///    reached, the loader is called directly and nothing is written.
/// 2. On a miss, take the key's lock (waiting up to `lock.wait`).
/// 3. With the lock held, read Redis again, since another caller may have just
///    filled it. Still a miss: call the loader, store the value (or the NULL
///    sentinel) with a jittered TTL, release the lock.
/// 4. If the lock wait ran out, re-check the cache `max_retries` times and
///    then call the loader directly without caching.
///
/// Loader errors are returned after the lock is released; nothing is cached.
///
/// # Example
/// ```rust,ignore
/// use common_cache::{ReadThroughCache, CacheConfig, CacheSource};
///
/// let cache = ReadThroughCache::new(
///     redis_reader,
///     redis_writer,
///     CacheConfig::with_ttl("article:", 3600),
/// );
///
/// let result = cache
///     .get_or_load(&article_id, |id| async move {
///         repository.find(*id).await
///     })
///     .await?;
///
/// match result.source {
///     CacheSource::PositiveCache => println!("Cache hit!"),
///     CacheSource::LoaderCacheMiss => println!("Loaded from source"),
///     _ => {}
/// }
/// ```
pub struct ReadThroughCache {
    redis_reader: Arc<dyn RedisClient + Send + Sync>,
    redis_writer: Arc<dyn RedisClient + Send + Sync>,
    config: CacheConfig,
    mutex: RedisMutex,
}

impl ReadThroughCache {
    /// Create a new read-through cache instance
    ///
    /// # Arguments
    /// * `redis_reader` - Redis client for reading cached data
    /// * `redis_writer` - Redis client for writing cached data and holding locks
    /// * `config` - Cache configuration (prefix, TTLs, locking)
    pub fn new(
        redis_reader: Arc<dyn RedisClient + Send + Sync>,
        redis_writer: Arc<dyn RedisClient + Send + Sync>,
        config: CacheConfig,
    ) -> Self {
        let mutex = RedisMutex::new(redis_writer.clone(), config.lock.clone());
        Self {
            redis_reader,
            redis_writer,
            config,
            mutex,
        }
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    /// Get a value from cache or load it using the loader function, caching
    /// real values for the configured TTL.
    ///
    /// The loader should return `Ok(Some(value))` when the item exists and
    /// `Ok(None)` when it doesn't; the latter is cached as the NULL sentinel.
    pub async fn get_or_load<K, V, E, F, Fut>(
        &self,
        key: &K,
        loader: F,
    ) -> Result<CacheResult<V>, E>
    where
        K: Display + Send + Sync,
        V: Serialize + DeserializeOwned + Send + Sync,
        F: FnOnce(&K) -> Fut,
        Fut: Future<Output = Result<Option<V>, E>>,
    {
        self.get_or_load_with_ttl(key, self.config.ttl, loader)
            .await
    }

    /// Same as [`ReadThroughCache::get_or_load`] with an explicit base TTL for real values.
    pub async fn get_or_load_with_ttl<K, V, E, F, Fut>(
        &self,
        key: &K,
        ttl: Duration,
        loader: F,
    ) -> Result<CacheResult<V>, E>
    where
        K: Display + Send + Sync,
        V: Serialize + DeserializeOwned + Send + Sync,
        F: FnOnce(&K) -> Fut,
        Fut: Future<Output = Result<Option<V>, E>>,
    {
        let cache_key = self.build_cache_key(key);

        let mut miss_kind = MissKind::Miss;
        match self.read(&cache_key).await {
            Lookup::Hit(value) => {
                debug!(key = %cache_key, "positive cache hit");
                return Ok(CacheResult::found(value, CacheSource::PositiveCache));
            }
            Lookup::Null => {
                debug!(key = %cache_key, "negative cache hit");
                return Ok(CacheResult::not_found(CacheSource::NegativeCache));
            }
            Lookup::Miss => {}
            Lookup::Corrupted(err) => {
                warn!(
                    key = %cache_key,
                    error = %err,
                    "cache corruption detected, evicting and reloading from source"
                );
                self.evict(&cache_key).await;
                miss_kind = MissKind::Corrupted;
            }
            Lookup::Unavailable(err) => {
                warn!(key = %cache_key, error = %err, "redis unavailable, operating without cache");
                return self
                    .load_uncached(key, loader, MissKind::RedisUnavailable)
                    .await;
            }
        }

        let guard = match self.mutex.acquire(&cache_key).await {
            Ok(Some(guard)) => guard,
            Ok(None) => return self.after_lock_timeout(key, &cache_key, loader).await,
            Err(err) => {
                warn!(key = %cache_key, error = %err, "failed to take cache lock, operating without cache");
                return self
                    .load_uncached(key, loader, MissKind::RedisUnavailable)
                    .await;
            }
        };

        // Someone else may have filled the key while we waited for the lock.
        match self.read::<V>(&cache_key).await {
            Lookup::Hit(value) => {
                self.release(guard).await;
                return Ok(CacheResult::found(value, CacheSource::PositiveCache));
            }
            Lookup::Null => {
                self.release(guard).await;
                return Ok(CacheResult::not_found(CacheSource::NegativeCache));
            }
            Lookup::Corrupted(err) => {
                warn!(
                    key = %cache_key,
                    error = %err,
                    "cache corruption detected under lock, evicting and reloading from source"
                );
                self.evict(&cache_key).await;
                miss_kind = MissKind::Corrupted;
            }
            Lookup::Miss | Lookup::Unavailable(_) => {}
        }

        let loaded = loader(key).await;
        if let Ok(value) = &loaded {
            self.store(&cache_key, value.as_ref(), ttl).await;
        }
        self.release(guard).await;

        Ok(CacheResult::from_loaded(loaded?, miss_kind))
    }

    /// Write-path population, e.g. right after the entity was created.
    pub async fn populate<K, V>(&self, key: &K, value: &V) -> Result<(), CustomRedisError>
    where
        K: Display,
        V: Serialize,
    {
        let cache_key = self.build_cache_key(key);
        self.write_value(&cache_key, value, self.config.ttl).await
    }

    /// Remove a key so the next read goes to the source. Used after updates and deletes.
    pub async fn invalidate<K>(&self, key: &K) -> Result<(), CustomRedisError>
    where
        K: Display,
    {
        let cache_key = self.build_cache_key(key);
        self.redis_writer.del(cache_key).await
    }

    /// Build the full Redis cache key from the user key
    fn build_cache_key<K>(&self, key: &K) -> String
    where
        K: Display,
    {
        format!("{}{}", self.config.cache_prefix, key)
    }

    async fn read<V>(&self, cache_key: &str) -> Lookup<V>
    where
        V: DeserializeOwned,
    {
        match self.redis_reader.get(cache_key.to_string()).await {
            Ok(raw) if raw == NULL_SENTINEL => Lookup::Null,
            Ok(raw) => match serde_json::from_str(&raw) {
                Ok(value) => Lookup::Hit(value),
                Err(e) => Lookup::Corrupted(format!("Failed to deserialize cached value: {e}")),
            },
            Err(CustomRedisError::NotFound) => Lookup::Miss,
            Err(CustomRedisError::ParseError(err)) => Lookup::Corrupted(err),
            Err(err) => Lookup::Unavailable(err),
        }
    }

    async fn after_lock_timeout<K, V, E, F, Fut>(
        &self,
        key: &K,
        cache_key: &str,
        loader: F,
    ) -> Result<CacheResult<V>, E>
    where
        K: Display + Send + Sync,
        V: DeserializeOwned,
        F: FnOnce(&K) -> Fut,
        Fut: Future<Output = Result<Option<V>, E>>,
    {
        warn!(key = %cache_key, "timed out waiting for cache lock, retrying reads");

        for attempt in 1..=self.config.max_retries {
            tokio::time::sleep(self.config.retry_interval).await;
            match self.read(cache_key).await {
                Lookup::Hit(value) => {
                    return Ok(CacheResult::found(value, CacheSource::PositiveCache))
                }
                Lookup::Null => return Ok(CacheResult::not_found(CacheSource::NegativeCache)),
                Lookup::Corrupted(err) => {
                    warn!(
                        key = %cache_key,
                        attempt,
                        error = %err,
                        "cache corruption detected while waiting on lock holder, evicting"
                    );
                    self.evict(cache_key).await;
                }
                Lookup::Miss | Lookup::Unavailable(_) => {
                    debug!(key = %cache_key, attempt, "cache still empty after lock timeout")
                }
            }
        }

        self.load_uncached(key, loader, MissKind::LockContended)
            .await
    }

    async fn load_uncached<K, V, E, F, Fut>(
        &self,
        key: &K,
        loader: F,
        kind: MissKind,
    ) -> Result<CacheResult<V>, E>
    where
        F: FnOnce(&K) -> Fut,
        Fut: Future<Output = Result<Option<V>, E>>,
    {
        let value = loader(key).await?;
        Ok(CacheResult::from_loaded(value, kind))
    }

    async fn store<V>(&self, cache_key: &str, value: Option<&V>, ttl: Duration)
    where
        V: Serialize,
    {
        let result = match value {
            Some(value) => self.write_value(cache_key, value, ttl).await,
            None => self.write_null(cache_key).await,
        };
        if let Err(err) = result {
            warn!(key = %cache_key, error = %err, "failed to update cache");
        }
    }

    async fn write_value<V>(
        &self,
        cache_key: &str,
        value: &V,
        ttl: Duration,
    ) -> Result<(), CustomRedisError>
    where
        V: Serialize,
    {
        let serialized_value = serde_json::to_string(value).map_err(|e| {
            CustomRedisError::ParseError(format!("Failed to serialize value for cache: {e}"))
        })?;
        let ttl = jittered_ttl(ttl, self.config.ttl_jitter_ratio);

        self.redis_writer
            .psetex(cache_key.to_string(), serialized_value, as_px(ttl))
            .await
    }

    async fn write_null(&self, cache_key: &str) -> Result<(), CustomRedisError> {
        let ttl = ttl_with_extra(self.config.null_ttl, self.config.null_ttl_jitter);
        self.redis_writer
            .psetex(cache_key.to_string(), NULL_SENTINEL.to_string(), as_px(ttl))
            .await
    }

    async fn evict(&self, cache_key: &str) {
        if let Err(err) = self.redis_writer.del(cache_key.to_string()).await {
            warn!(key = %cache_key, error = %err, "failed to evict corrupted cache entry");
        }
    }

    async fn release(&self, guard: LockGuard) {
        let lock_key = guard.key().to_string();
        if let Err(err) = guard.release().await {
            warn!(lock = %lock_key, error = %err, "failed to release cache lock");
        }
    }
}
