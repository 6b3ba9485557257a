//! Entity reads through the cache-aside layer, with the write path keeping
//! the cache honest: populate on create, invalidate on update and delete.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use common_cache::ReadThroughCacheWithMetrics;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::PipelineError;

type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// The system of record behind the cache.
#[async_trait]
pub trait Source: Send + Sync {
    type Item: Serialize + DeserializeOwned + Clone + Send + Sync + 'static;

    fn id_of(item: &Self::Item) -> String;

    async fn find(&self, id: &str) -> Result<Option<Self::Item>, BoxError>;
    async fn save(&self, item: &Self::Item) -> Result<(), BoxError>;
    /// Returns whether anything was removed.
    async fn remove(&self, id: &str) -> Result<bool, BoxError>;
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Article {
    pub id: String,
    pub title: String,
    pub author: String,
    pub like_count: u64,
}

/// In-process source, counting reads so tests can see when the cache was bypassed.
pub struct InMemorySource<T> {
    items: RwLock<HashMap<String, T>>,
    finds: AtomicUsize,
}

impl<T> Default for InMemorySource<T> {
    fn default() -> Self {
        Self {
            items: RwLock::new(HashMap::new()),
            finds: AtomicUsize::new(0),
        }
    }
}

impl<T> InMemorySource<T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn find_calls(&self) -> usize {
        self.finds.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Source for InMemorySource<Article> {
    type Item = Article;

    fn id_of(item: &Article) -> String {
        item.id.clone()
    }

    async fn find(&self, id: &str) -> Result<Option<Article>, BoxError> {
        self.finds.fetch_add(1, Ordering::SeqCst);
        let items = self.items.read().map_err(|e| e.to_string())?;
        Ok(items.get(id).cloned())
    }

    async fn save(&self, item: &Article) -> Result<(), BoxError> {
        let mut items = self.items.write().map_err(|e| e.to_string())?;
        items.insert(item.id.clone(), item.clone());
        Ok(())
    }

    async fn remove(&self, id: &str) -> Result<bool, BoxError> {
        let mut items = self.items.write().map_err(|e| e.to_string())?;
        Ok(items.remove(id).is_some())
    }
}

pub struct CachedRepository<S> {
    source: Arc<S>,
    cache: ReadThroughCacheWithMetrics,
}

impl<S: Source> CachedRepository<S> {
    pub fn new(source: Arc<S>, cache: ReadThroughCacheWithMetrics) -> Self {
        Self { source, cache }
    }

    pub fn source(&self) -> &S {
        &self.source
    }

    pub async fn get(&self, id: &str) -> Result<Option<S::Item>, PipelineError> {
        let id = id.to_string();
        let source = &self.source;
        let result = self
            .cache
            .get_or_load(&id, |id| {
                let id = id.clone();
                async move {
                    source
                        .find(&id)
                        .await
                        .map_err(|source| PipelineError::LoadError { key: id, source })
                }
            })
            .await?;

        if result.was_lock_contended() {
            let timeout = PipelineError::LockTimeout { key: id.clone() };
            warn!(error = ?timeout, "served without the cache");
        }
        debug!(id = %id, source = %result.source, "repository read");
        Ok(result.value)
    }

    /// Save a new item and put it straight into the cache.
    pub async fn create(&self, item: &S::Item) -> Result<(), PipelineError> {
        self.save(item).await?;
        let id = S::id_of(item);
        if let Err(e) = self.cache.populate(&id, item).await {
            // The next read loads it from the source instead.
            warn!(id = %id, error = ?e, "failed to populate cache after create");
        }
        Ok(())
    }

    pub async fn update(&self, item: &S::Item) -> Result<(), PipelineError> {
        self.save(item).await?;
        self.cache.invalidate(&S::id_of(item)).await?;
        Ok(())
    }

    pub async fn delete(&self, id: &str) -> Result<bool, PipelineError> {
        let removed = self
            .source
            .remove(id)
            .await
            .map_err(|source| PipelineError::SourceWrite {
                key: id.to_string(),
                source,
            })?;
        self.cache.invalidate(&id).await?;
        Ok(removed)
    }

    async fn save(&self, item: &S::Item) -> Result<(), PipelineError> {
        self.source
            .save(item)
            .await
            .map_err(|source| PipelineError::SourceWrite {
                key: S::id_of(item),
                source,
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use common_cache::{CacheConfig, ReadThroughCache};
    use common_redis::{Client, CustomRedisError, MockRedisClient};

    fn repository(redis: &MockRedisClient) -> CachedRepository<InMemorySource<Article>> {
        let redis = Arc::new(redis.clone());
        let cache = ReadThroughCache::new(
            redis.clone(),
            redis,
            CacheConfig::with_ttl("article:", 3600),
        );
        CachedRepository::new(
            Arc::new(InMemorySource::new()),
            ReadThroughCacheWithMetrics::new(Arc::new(cache), "behavior", "article", &[]),
        )
    }

    fn article(id: &str, likes: u64) -> Article {
        Article {
            id: id.to_string(),
            title: format!("Article {id}"),
            author: "ada".to_string(),
            like_count: likes,
        }
    }

    #[tokio::test]
    async fn test_create_populates_cache() {
        let redis = MockRedisClient::new();
        let repo = repository(&redis);

        repo.create(&article("1", 0)).await.unwrap();
        assert!(redis.contains_key("article:1"));

        assert_eq!(repo.get("1").await.unwrap(), Some(article("1", 0)));
        assert_eq!(repo.source().find_calls(), 0);
    }

    #[tokio::test]
    async fn test_update_invalidates_and_next_read_reloads() {
        let redis = MockRedisClient::new();
        let repo = repository(&redis);

        repo.create(&article("1", 0)).await.unwrap();
        repo.update(&article("1", 5)).await.unwrap();
        assert!(!redis.contains_key("article:1"));

        assert_eq!(repo.get("1").await.unwrap().unwrap().like_count, 5);
        assert_eq!(repo.source().find_calls(), 1);
        assert_eq!(repo.get("1").await.unwrap().unwrap().like_count, 5);
        assert_eq!(repo.source().find_calls(), 1);
    }

    #[tokio::test]
    async fn test_delete_invalidates() {
        let redis = MockRedisClient::new();
        let repo = repository(&redis);

        repo.create(&article("2", 1)).await.unwrap();
        assert!(repo.delete("2").await.unwrap());
        assert!(!repo.delete("2").await.unwrap());
        assert_eq!(repo.get("2").await.unwrap(), None);
        let cached = Client::get(&redis, "article:2".to_string()).await.unwrap();
        assert_eq!(cached, common_cache::NULL_SENTINEL);
    }

    #[tokio::test]
    async fn test_create_survives_cache_outage() {
        let mut redis = MockRedisClient::new();
        redis.fail_op("psetex", CustomRedisError::Timeout);
        let repo = repository(&redis);

        repo.create(&article("3", 0)).await.unwrap();
        assert_eq!(repo.get("3").await.unwrap(), Some(article("3", 0)));
        assert_eq!(repo.source().find_calls(), 1);
    }

    #[tokio::test]
    async fn test_invalidate_failure_surfaces_on_update() {
        let mut redis = MockRedisClient::new();
        let repo = repository(&redis);
        repo.create(&article("4", 0)).await.unwrap();

        redis.fail_op("del", CustomRedisError::Timeout);
        let err = repo.update(&article("4", 1)).await.unwrap_err();
        assert!(matches!(err, PipelineError::Store(CustomRedisError::Timeout)));
    }
}
