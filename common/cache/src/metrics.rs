//! Metrics wrapper for ReadThroughCache
//!
//! Wraps [`ReadThroughCache`] and emits Prometheus counters for every read,
//! keeping the core cache independent of metrics.

use crate::{CacheResult, ReadThroughCache};
use common_metrics::inc;
use common_redis::CustomRedisError;
use serde::{de::DeserializeOwned, Serialize};
use std::fmt::Display;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

pub const CACHE_READS: &str = "read_through_cache_reads_total";
pub const CACHE_HITS: &str = "read_through_cache_hit_total";
pub const CACHE_LOADER_INVOKED: &str = "read_through_cache_loader_invoked_total";
pub const CACHE_ERRORS: &str = "read_through_cache_errors_total";
pub const CACHE_LOCK_CONTENDED: &str = "read_through_cache_lock_contended_total";
pub const CACHE_INVALIDATIONS: &str = "read_through_cache_invalidations_total";

/// Wrapper around [`ReadThroughCache`] that emits Prometheus metrics
///
/// # Metrics Emitted
///
/// All metrics carry the labels `namespace`, `cache_name`, plus any additional labels
///
/// - `read_through_cache_reads_total` - Total cache read attempts
/// - `read_through_cache_hit_total{cache_hit="true|false"}` - Cache hit/miss tracking
/// - `read_through_cache_loader_invoked_total` - Times the loader function was called
/// - `read_through_cache_errors_total{reason="..."}` - Corruption and Redis outages
/// - `read_through_cache_lock_contended_total` - Reads that gave up on the key lock
/// - `read_through_cache_invalidations_total` - Write-path evictions
pub struct ReadThroughCacheWithMetrics {
    inner: Arc<ReadThroughCache>,
    namespace: &'static str,
    cache_name: &'static str,
    additional_labels: Vec<(String, String)>,
}

impl ReadThroughCacheWithMetrics {
    pub fn new(
        inner: Arc<ReadThroughCache>,
        namespace: &'static str,
        cache_name: &'static str,
        additional_labels: &[(String, String)],
    ) -> Self {
        Self {
            inner,
            namespace,
            cache_name,
            additional_labels: additional_labels.to_vec(),
        }
    }

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
        let result = self.inner.get_or_load(key, loader).await?;
        self.emit_metrics(&result);
        Ok(result)
    }

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
        let result = self.inner.get_or_load_with_ttl(key, ttl, loader).await?;
        self.emit_metrics(&result);
        Ok(result)
    }

    pub async fn populate<K, V>(&self, key: &K, value: &V) -> Result<(), CustomRedisError>
    where
        K: Display,
        V: Serialize,
    {
        self.inner.populate(key, value).await
    }

    pub async fn invalidate<K>(&self, key: &K) -> Result<(), CustomRedisError>
    where
        K: Display,
    {
        self.inner.invalidate(key).await?;
        inc(CACHE_INVALIDATIONS, &self.base_labels(), 1);
        Ok(())
    }

    fn base_labels(&self) -> Vec<(String, String)> {
        let mut labels = vec![
            ("namespace".to_string(), self.namespace.to_string()),
            ("cache_name".to_string(), self.cache_name.to_string()),
        ];
        labels.extend(self.additional_labels.clone());
        labels
    }

    fn emit_metrics<V>(&self, result: &CacheResult<V>) {
        let base_labels = self.base_labels();

        inc(CACHE_READS, &base_labels, 1);

        let mut hit_labels = base_labels.clone();
        hit_labels.push(("cache_hit".to_string(), result.was_cached().to_string()));
        inc(CACHE_HITS, &hit_labels, 1);

        if result.invoked_loader() {
            inc(CACHE_LOADER_INVOKED, &base_labels, 1);
        }

        if result.was_lock_contended() {
            inc(CACHE_LOCK_CONTENDED, &base_labels, 1);
        }

        if result.had_cache_problem() {
            let mut error_labels = base_labels;
            error_labels.push(("reason".to_string(), result.source.to_string()));
            inc(CACHE_ERRORS, &error_labels, 1);
        }
    }
}
