use common_cache::{CacheConfig, CacheSource, ReadThroughCache};
use common_redis::MockRedisClient;
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct Article {
    id: u64,
    title: String,
    likes: u64,
}

fn cache(redis: &MockRedisClient) -> Arc<ReadThroughCache> {
    Arc::new(ReadThroughCache::new(
        Arc::new(redis.clone()),
        Arc::new(redis.clone()),
        CacheConfig::with_ttl("article:", 3600),
    ))
}

#[tokio::test(start_paused = true)]
async fn concurrent_cold_reads_invoke_loader_once() {
    let redis = MockRedisClient::new();
    let cache = cache(&redis);
    let loads = Arc::new(AtomicUsize::new(0));

    let readers = (0..64).map(|_| {
        let cache = cache.clone();
        let loads = loads.clone();
        tokio::spawn(async move {
            cache
                .get_or_load(&42u64, |id| {
                    let id = *id;
                    async move {
                        loads.fetch_add(1, Ordering::SeqCst);
                        // slow backing store
                        tokio::time::sleep(Duration::from_millis(200)).await;
                        Ok::<_, String>(Some(Article {
                            id,
                            title: "hello".to_string(),
                            likes: 3,
                        }))
                    }
                })
                .await
        })
    });

    let results = join_all(readers).await;

    assert_eq!(loads.load(Ordering::SeqCst), 1);
    let mut loaded_by_lock_holder = 0;
    for result in results {
        let result = result.unwrap().unwrap();
        assert_eq!(result.value.as_ref().map(|a| a.id), Some(42));
        match result.source {
            CacheSource::LoaderCacheMiss => loaded_by_lock_holder += 1,
            CacheSource::PositiveCache => {}
            other => panic!("unexpected source {other}"),
        }
    }
    assert_eq!(loaded_by_lock_holder, 1);
    assert!(!redis.contains_key("lock:article:42"));
}

#[tokio::test(start_paused = true)]
async fn missing_article_is_cached_as_null_within_null_ttl() {
    let redis = MockRedisClient::new();
    let cache = cache(&redis);
    let loads = Arc::new(AtomicUsize::new(0));

    let load_missing = |loads: Arc<AtomicUsize>| {
        move |_id: &u64| async move {
            loads.fetch_add(1, Ordering::SeqCst);
            Ok::<Option<Article>, String>(None)
        }
    };

    let first = cache
        .get_or_load(&7u64, load_missing(loads.clone()))
        .await
        .unwrap();
    assert_eq!(first.value, None);
    assert_eq!(redis.get_calls().iter().filter(|c| c.key == "article:7").count(), 3);

    let ttl = redis.ttl("article:7").unwrap();
    assert!(ttl >= Duration::from_secs(299) && ttl <= Duration::from_secs(360));

    // one minute later the sentinel still answers
    tokio::time::advance(Duration::from_secs(60)).await;
    let second = cache
        .get_or_load(&7u64, load_missing(loads.clone()))
        .await
        .unwrap();
    assert_eq!(second.value, None);
    assert_eq!(second.source, CacheSource::NegativeCache);
    assert_eq!(loads.load(Ordering::SeqCst), 1);

    // after the longest possible null TTL the source is asked again
    tokio::time::advance(Duration::from_secs(301)).await;
    let third = cache
        .get_or_load(&7u64, load_missing(loads.clone()))
        .await
        .unwrap();
    assert_eq!(third.source, CacheSource::LoaderNotFoundCacheMiss);
    assert_eq!(loads.load(Ordering::SeqCst), 2);
}

#[tokio::test(start_paused = true)]
async fn update_then_read_sees_fresh_value() {
    let redis = MockRedisClient::new();
    let cache = cache(&redis);

    let original = Article {
        id: 1,
        title: "v1".to_string(),
        likes: 0,
    };
    cache.populate(&1u64, &original).await.unwrap();

    // the row changes, then the write path evicts
    let updated = Article {
        title: "v2".to_string(),
        ..original.clone()
    };
    cache.invalidate(&1u64).await.unwrap();

    let read = cache
        .get_or_load(&1u64, |_| {
            let updated = updated.clone();
            async move { Ok::<_, String>(Some(updated)) }
        })
        .await
        .unwrap();
    assert_eq!(read.value.map(|a| a.title), Some("v2".to_string()));
}
