use std::sync::Arc;
use std::time::Duration;

use behavior_pipeline::aggregation::{
    window_label, AggregationEngine, EmitMode, TumblingWindows, WindowAggregator,
};
use behavior_pipeline::behavior_store::BehaviorStore;
use behavior_pipeline::cached_repository::{Article, CachedRepository, InMemorySource};
use behavior_pipeline::clock::ManualClock;
use behavior_pipeline::consumer::ApplyConsumer;
use behavior_pipeline::dedup::{ApplyOutcome, DedupLedger};
use behavior_pipeline::metrics::{Counter, RecordingMetrics, Stage};
use behavior_pipeline::ranking::{RankingScope, RankingStore};
use behavior_pipeline::transport::{MemoryBroker, MemoryRecordSource, Publisher, RecordSource};
use behavior_pipeline::{ActionKind, BehaviorEvent};
use common_cache::{CacheConfig, ReadThroughCache, ReadThroughCacheWithMetrics};
use common_redis::MockRedisClient;
use tokio_util::sync::CancellationToken;

const TOPIC: &str = "user_behavior_events";
const APPLY_GROUP: &str = "behavior-apply";
const WEEK: Duration = Duration::from_secs(604_800);

fn event(message_id: &str, occurred_at: i64) -> BehaviorEvent {
    BehaviorEvent {
        entity_id: "A42".to_string(),
        actor_id: "u1".to_string(),
        action_kind: ActionKind::View,
        occurred_at,
        message_id: message_id.to_string(),
    }
}

async fn publish(broker: &MemoryBroker, event: &BehaviorEvent) {
    broker
        .publish(TOPIC, Some(&event.actor_id), &event.to_json().unwrap())
        .await
        .unwrap();
}

fn apply_consumer(
    broker: &MemoryBroker,
    redis: &MockRedisClient,
    metrics: Arc<RecordingMetrics>,
) -> (ApplyConsumer<MemoryRecordSource>, Arc<DedupLedger>) {
    let redis = Arc::new(redis.clone());
    let ledger = Arc::new(DedupLedger::new(
        redis.clone(),
        "processed_message_ids",
        WEEK,
    ));
    let store = Arc::new(BehaviorStore::new(
        redis,
        WEEK,
        Duration::from_secs(2_592_000),
    ));
    let consumer = ApplyConsumer::new(
        broker.subscribe(TOPIC, APPLY_GROUP),
        ledger.clone(),
        store,
        metrics,
    )
    .with_retry_backoff(Duration::from_millis(1));
    (consumer, ledger)
}

async fn wait_for(mut done: impl FnMut() -> bool) {
    for _ in 0..200 {
        if done() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached in time");
}

#[tokio::test]
async fn test_redelivered_message_is_skipped_across_consumer_restart() {
    let broker = MemoryBroker::new(2);
    let redis = MockRedisClient::new();
    let metrics = Arc::new(RecordingMetrics::new());

    publish(&broker, &event("m1", 1_000)).await;

    let (consumer, ledger) = apply_consumer(&broker, &redis, metrics.clone());
    let shutdown = CancellationToken::new();
    let handle = tokio::spawn(consumer.run(shutdown.clone()));
    wait_for(|| metrics.get(Stage::Apply, Counter::Applied) == 1).await;
    shutdown.cancel();
    handle.await.unwrap().unwrap();

    // The producer retries m1 after a lost ack; a fresh consumer picks it up.
    publish(&broker, &event("m1", 1_000)).await;
    let (consumer, _) = apply_consumer(&broker, &redis, metrics.clone());
    let shutdown = CancellationToken::new();
    let handle = tokio::spawn(consumer.run(shutdown.clone()));
    wait_for(|| metrics.get(Stage::Apply, Counter::SkippedDuplicate) == 1).await;
    shutdown.cancel();
    handle.await.unwrap().unwrap();

    assert_eq!(metrics.get(Stage::Apply, Counter::Applied), 1);
    assert_eq!(ledger.processed_count().await.unwrap(), 1);
    assert_eq!(redis.count_calls("atomic_write"), 1);

    let partition = broker.partition_for("u1");
    assert_eq!(broker.committed_offset(APPLY_GROUP, TOPIC, partition), Some(2));

    let outcome = ledger
        .apply_once("m1", || async { Ok::<_, std::io::Error>(()) })
        .await
        .unwrap();
    assert_eq!(outcome, ApplyOutcome::Skipped);
}

#[tokio::test]
async fn test_windows_close_into_ranking() {
    let broker = MemoryBroker::new(1);
    let redis = Arc::new(MockRedisClient::new());
    let clock = Arc::new(ManualClock::new(0));
    let metrics = Arc::new(RecordingMetrics::new());
    let ranking = Arc::new(RankingStore::new(
        redis,
        "article:ranking:",
        Duration::from_secs(86_400),
    ));

    let mut aggregator = WindowAggregator::new(
        AggregationEngine::new(
            TumblingWindows::new(5_000, 0),
            vec![ActionKind::View],
            EmitMode::OnClose,
        ),
        ranking.clone(),
        clock.clone(),
        metrics.clone(),
    );
    let mut source = broker.subscribe(TOPIC, "behavior-aggregation");

    for (message_id, at) in [("m1", 1_000), ("m2", 4_999), ("m3", 6_000)] {
        clock.set(at);
        publish(&broker, &event(message_id, at)).await;
        let record = source.next().await.unwrap();
        aggregator.handle(&record.payload).await.unwrap();
        source.commit(&record).await.unwrap();
    }

    // The third event pushed the clock past the first window's end.
    let first = window_label(0, 5_000);
    assert_eq!(first, "1970-01-01 00:00:00 - 1970-01-01 00:00:05");
    assert_eq!(ranking.window_score_of(&first, "A42").await.unwrap(), Some(2.0));
    assert_eq!(ranking.score_of("A42").await.unwrap(), Some(2.0));
    assert_eq!(aggregator.engine().count_of("A42", 6_000), Some(1));

    clock.set(10_000);
    assert_eq!(aggregator.tick().await, 1);

    let second = window_label(5_000, 10_000);
    let top = ranking.top_n(RankingScope::Window(&second), 10).await.unwrap();
    assert_eq!(top.len(), 1);
    assert_eq!(top[0].entity_id, "A42");
    assert_eq!(top[0].score, 1.0);
    assert_eq!(top[0].rank, 1);
    // `current` holds the most recent window's count.
    assert_eq!(ranking.score_of("A42").await.unwrap(), Some(1.0));
    assert_eq!(metrics.get(Stage::Aggregate, Counter::WindowsEmitted), 2);
    assert_eq!(aggregator.engine().open_windows(), 0);
}

#[tokio::test]
async fn test_continuous_counts_overwrite_current_score() {
    let broker = MemoryBroker::new(1);
    let redis = Arc::new(MockRedisClient::new());
    let clock = Arc::new(ManualClock::new(0));
    let metrics = Arc::new(RecordingMetrics::new());
    let ranking = Arc::new(RankingStore::new(
        redis,
        "article:ranking:",
        Duration::from_secs(86_400),
    ));

    let mut aggregator = WindowAggregator::new(
        AggregationEngine::new(
            TumblingWindows::new(5_000, 0),
            vec![ActionKind::View],
            EmitMode::Continuous,
        ),
        ranking.clone(),
        clock.clone(),
        metrics.clone(),
    );
    let mut source = broker.subscribe(TOPIC, "behavior-aggregation");
    let first = window_label(0, 5_000);
    let second = window_label(5_000, 10_000);

    let mut current = Vec::new();
    for (message_id, at) in [("m1", 1_000), ("m2", 2_000), ("m3", 6_000)] {
        clock.set(at);
        publish(&broker, &event(message_id, at)).await;
        let record = source.next().await.unwrap();
        aggregator.handle(&record.payload).await.unwrap();
        source.commit(&record).await.unwrap();
        current.push(ranking.score_of("A42").await.unwrap());
    }

    // Each running count replaces the last one, even when it is lower.
    assert_eq!(current, vec![Some(1.0), Some(2.0), Some(1.0)]);
    assert_eq!(ranking.window_score_of(&first, "A42").await.unwrap(), Some(2.0));
    assert_eq!(ranking.window_score_of(&second, "A42").await.unwrap(), Some(1.0));
    assert_eq!(metrics.get(Stage::Aggregate, Counter::WindowsEmitted), 3);

    // Closing adds nothing in continuous mode.
    clock.set(10_000);
    assert_eq!(aggregator.tick().await, 0);
    assert_eq!(ranking.score_of("A42").await.unwrap(), Some(1.0));
    assert_eq!(metrics.get(Stage::Aggregate, Counter::WindowsEmitted), 3);
}

#[tokio::test]
async fn test_unknown_article_is_negatively_cached() {
    let redis = Arc::new(MockRedisClient::new());
    let cache = ReadThroughCache::new(
        redis.clone(),
        redis.clone(),
        CacheConfig::with_ttl("article:", 30),
    );
    let repository = CachedRepository::new(
        Arc::new(InMemorySource::<Article>::new()),
        ReadThroughCacheWithMetrics::new(Arc::new(cache), "behavior_pipeline", "article", &[]),
    );

    assert_eq!(repository.get("7").await.unwrap(), None);
    assert_eq!(repository.get("7").await.unwrap(), None);
    assert_eq!(repository.source().find_calls(), 1);
    assert!(redis.contains_key("article:7"));
}
