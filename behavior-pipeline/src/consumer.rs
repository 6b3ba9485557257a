use std::sync::Arc;
use std::time::{Duration, Instant};

use common_health::{ComponentStatus, HealthHandle};
use tokio::time::{Interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::aggregation::WindowAggregator;
use crate::behavior_store::BehaviorStore;
use crate::dedup::{ApplyOutcome, DedupLedger};
use crate::error::{Disposition, PipelineError};
use crate::event::BehaviorEvent;
use crate::metrics::{Counter, PipelineMetrics, Stage};
use crate::transport::{Record, RecordSource, TransportError};

/// Pause after a transport error or a rewind, so a persistent failure does
/// not spin the loop.
pub const DEFAULT_RETRY_BACKOFF: Duration = Duration::from_millis(500);

/// Keeps a consumer's readiness component fresh while its loop runs.
struct Heartbeat {
    handle: Option<HealthHandle>,
    interval: Interval,
}

impl Heartbeat {
    fn new(handle: Option<HealthHandle>) -> Self {
        // Three reports per deadline; an idle hour when nobody listens.
        let period = handle
            .as_ref()
            .map(|h| h.deadline() / 3)
            .unwrap_or(Duration::from_secs(3600))
            .max(Duration::from_millis(10));
        let mut interval = tokio::time::interval(period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        Self { handle, interval }
    }

    async fn tick(&mut self) {
        self.interval.tick().await;
        if let Some(handle) = &self.handle {
            handle.report_healthy();
        }
    }

    fn stopped(&self) {
        if let Some(handle) = &self.handle {
            handle.report_status(ComponentStatus::Stopped);
        }
    }
}

/// Sleep for `backoff`, returning false if shutdown fired first.
async fn pause(shutdown: &CancellationToken, backoff: Duration) -> bool {
    tokio::select! {
        biased;
        _ = shutdown.cancelled() => false,
        _ = tokio::time::sleep(backoff) => true,
    }
}

/// Applies each event to the behavior store exactly once per message id.
pub struct ApplyConsumer<S> {
    source: S,
    ledger: Arc<DedupLedger>,
    store: Arc<BehaviorStore>,
    metrics: Arc<dyn PipelineMetrics>,
    retry_backoff: Duration,
    health: Option<HealthHandle>,
}

impl<S: RecordSource> ApplyConsumer<S> {
    pub fn new(
        source: S,
        ledger: Arc<DedupLedger>,
        store: Arc<BehaviorStore>,
        metrics: Arc<dyn PipelineMetrics>,
    ) -> Self {
        Self {
            source,
            ledger,
            store,
            metrics,
            retry_backoff: DEFAULT_RETRY_BACKOFF,
            health: None,
        }
    }

    pub fn with_retry_backoff(mut self, backoff: Duration) -> Self {
        self.retry_backoff = backoff;
        self
    }

    /// Report loop liveness to a readiness component.
    pub fn with_health(mut self, handle: HealthHandle) -> Self {
        self.health = Some(handle);
        self
    }

    /// Decode a record and apply it unless its message id was seen before.
    pub async fn process(&self, record: &Record) -> Result<ApplyOutcome, PipelineError> {
        let event = BehaviorEvent::from_payload(&record.payload)?;
        let store = &self.store;
        self.ledger
            .apply_once(&event.message_id, || store.record(&event))
            .await
    }

    /// Consume until `shutdown` fires. Shutdown is only observed between
    /// records, so an in-flight record is always settled.
    pub async fn run(mut self, shutdown: CancellationToken) -> Result<(), TransportError> {
        info!("apply consumer started");
        let mut heartbeat = Heartbeat::new(self.health.take());
        loop {
            let next = tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                _ = heartbeat.tick() => continue,
                next = self.source.next() => next,
            };

            match next {
                Ok(record) => self.handle(record).await,
                Err(e) => {
                    error!(error = ?e, "failed to receive record");
                    if !pause(&shutdown, self.retry_backoff).await {
                        break;
                    }
                }
            }
        }
        heartbeat.stopped();
        info!("apply consumer stopped");
        Ok(())
    }

    /// Process one record and settle it with the transport.
    pub async fn handle(&mut self, record: Record) {
        self.metrics.increment(Stage::Apply, Counter::Received, 1);
        let started = Instant::now();
        let result = self.process(&record).await;
        self.metrics
            .record_processing_ms(Stage::Apply, started.elapsed().as_secs_f64() * 1000.0);

        let disposition = match result {
            Ok(ApplyOutcome::Applied) => {
                self.metrics.increment(Stage::Apply, Counter::Applied, 1);
                Disposition::Commit
            }
            Ok(ApplyOutcome::Skipped) => {
                debug!(partition = record.partition, offset = record.offset, "duplicate skipped");
                self.metrics
                    .increment(Stage::Apply, Counter::SkippedDuplicate, 1);
                Disposition::Commit
            }
            Err(e) => {
                let disposition = e.disposition();
                match disposition {
                    Disposition::Commit => warn!(
                        partition = record.partition,
                        offset = record.offset,
                        error = ?e,
                        "dropping record"
                    ),
                    Disposition::Redeliver => error!(
                        partition = record.partition,
                        offset = record.offset,
                        error = ?e,
                        "failed to apply record, will redeliver"
                    ),
                }
                self.metrics
                    .increment(Stage::Apply, Counter::Failed { reason: e.reason() }, 1);
                disposition
            }
        };

        settle(
            &mut self.source,
            &record,
            disposition,
            self.metrics.as_ref(),
            Stage::Apply,
            self.retry_backoff,
        )
        .await;
    }
}

/// Feeds every record into the window aggregator and closes windows on a timer.
///
/// Records are committed as soon as they are counted; open windows live only
/// in memory.
pub struct AggregationConsumer<S> {
    source: S,
    aggregator: WindowAggregator,
    metrics: Arc<dyn PipelineMetrics>,
    tick: Duration,
    retry_backoff: Duration,
    health: Option<HealthHandle>,
}

impl<S: RecordSource> AggregationConsumer<S> {
    pub fn new(
        source: S,
        aggregator: WindowAggregator,
        metrics: Arc<dyn PipelineMetrics>,
        tick: Duration,
    ) -> Self {
        Self {
            source,
            aggregator,
            metrics,
            tick,
            retry_backoff: DEFAULT_RETRY_BACKOFF,
            health: None,
        }
    }

    pub fn with_retry_backoff(mut self, backoff: Duration) -> Self {
        self.retry_backoff = backoff;
        self
    }

    pub fn with_health(mut self, handle: HealthHandle) -> Self {
        self.health = Some(handle);
        self
    }

    pub fn aggregator(&self) -> &WindowAggregator {
        &self.aggregator
    }

    pub async fn run(mut self, shutdown: CancellationToken) -> Result<(), TransportError> {
        info!("aggregation consumer started");
        let mut ticker = tokio::time::interval(self.tick);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut heartbeat = Heartbeat::new(self.health.take());

        loop {
            tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                _ = heartbeat.tick() => {}
                _ = ticker.tick() => {
                    let emitted = self.aggregator.tick().await;
                    if emitted > 0 {
                        debug!(emitted, "closed windows");
                    }
                }
                next = self.source.next() => match next {
                    Ok(record) => self.handle(record).await,
                    Err(e) => {
                        error!(error = ?e, "failed to receive record");
                        if !pause(&shutdown, self.retry_backoff).await {
                            break;
                        }
                    }
                },
            }
        }

        self.aggregator.shutdown();
        heartbeat.stopped();
        info!("aggregation consumer stopped");
        Ok(())
    }

    pub async fn handle(&mut self, record: Record) {
        self.metrics
            .increment(Stage::Aggregate, Counter::Received, 1);
        // Drops are already logged and counted by the aggregator, and
        // replaying them would not change the outcome.
        let _outcome = self.aggregator.handle(&record.payload).await;
        settle(
            &mut self.source,
            &record,
            Disposition::Commit,
            self.metrics.as_ref(),
            Stage::Aggregate,
            self.retry_backoff,
        )
        .await;
    }
}

async fn settle<S: RecordSource>(
    source: &mut S,
    record: &Record,
    disposition: Disposition,
    metrics: &dyn PipelineMetrics,
    stage: Stage,
    backoff: Duration,
) {
    match disposition {
        Disposition::Commit => {
            if let Err(e) = source.commit(record).await {
                error!(
                    partition = record.partition,
                    offset = record.offset,
                    error = ?e,
                    "failed to commit record"
                );
            }
        }
        Disposition::Redeliver => {
            metrics.increment(stage, Counter::Redelivered, 1);
            if let Err(e) = source.redeliver(record).await {
                error!(
                    partition = record.partition,
                    offset = record.offset,
                    error = ?e,
                    "failed to rewind record"
                );
            }
            tokio::time::sleep(backoff).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::ActionKind;
    use crate::metrics::RecordingMetrics;
    use crate::transport::{MemoryBroker, Publisher};
    use common_health::HealthRegistry;
    use common_redis::{CustomRedisError, MockRedisClient};
    use std::sync::atomic::{AtomicUsize, Ordering};

    const TOPIC: &str = "user_behavior_events";

    struct Setup {
        broker: MemoryBroker,
        redis: MockRedisClient,
        metrics: Arc<RecordingMetrics>,
    }

    impl Setup {
        fn new() -> Self {
            Self {
                broker: MemoryBroker::new(2),
                redis: MockRedisClient::new(),
                metrics: Arc::new(RecordingMetrics::new()),
            }
        }

        fn consumer(&self) -> ApplyConsumer<crate::transport::MemoryRecordSource> {
            let redis = Arc::new(self.redis.clone());
            ApplyConsumer::new(
                self.broker.subscribe(TOPIC, "behavior-apply"),
                Arc::new(DedupLedger::new(
                    redis.clone(),
                    "processed_message_ids",
                    Duration::from_secs(604_800),
                )),
                Arc::new(BehaviorStore::new(
                    redis,
                    Duration::from_secs(604_800),
                    Duration::from_secs(2_592_000),
                )),
                self.metrics.clone(),
            )
            .with_retry_backoff(Duration::from_millis(1))
        }
    }

    /// A source whose broker is gone: every receive fails.
    struct BrokenSource {
        attempts: Arc<AtomicUsize>,
    }

    #[async_trait::async_trait]
    impl RecordSource for BrokenSource {
        async fn next(&mut self) -> Result<Record, TransportError> {
            self.attempts.fetch_add(1, Ordering::SeqCst);
            Err(TransportError::UnknownTopic(TOPIC.to_string()))
        }

        async fn commit(&mut self, _record: &Record) -> Result<(), TransportError> {
            Ok(())
        }

        async fn redeliver(&mut self, _record: &Record) -> Result<(), TransportError> {
            Ok(())
        }
    }

    async fn wait_until(mut done: impl FnMut() -> bool) {
        for _ in 0..200 {
            if done() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not reached in time");
    }

    async fn publish(broker: &MemoryBroker, event: &BehaviorEvent) {
        broker
            .publish(TOPIC, Some(&event.actor_id), &event.to_json().unwrap())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_handle_applies_then_skips_duplicate() {
        let setup = Setup::new();
        let event = BehaviorEvent::new("A1", "u1", ActionKind::View, 1_000);
        publish(&setup.broker, &event).await;
        publish(&setup.broker, &event).await;

        let mut consumer = setup.consumer();
        for _ in 0..2 {
            let record = consumer.source.next().await.unwrap();
            consumer.handle(record).await;
        }

        assert_eq!(setup.metrics.get(Stage::Apply, Counter::Applied), 1);
        assert_eq!(setup.metrics.get(Stage::Apply, Counter::SkippedDuplicate), 1);
        assert_eq!(setup.redis.count_calls("atomic_write"), 1);
        let partition = setup.broker.partition_for("u1");
        assert_eq!(
            setup
                .broker
                .committed_offset("behavior-apply", TOPIC, partition),
            Some(2)
        );
    }

    #[tokio::test]
    async fn test_malformed_record_is_committed() {
        let setup = Setup::new();
        setup.broker.append(TOPIC, Some("k"), b"{not json".to_vec());

        let mut consumer = setup.consumer();
        let record = consumer.source.next().await.unwrap();
        consumer.handle(record.clone()).await;

        assert_eq!(
            setup
                .metrics
                .get(Stage::Apply, Counter::Failed { reason: "malformed" }),
            1
        );
        assert_eq!(
            setup
                .broker
                .committed_offset("behavior-apply", TOPIC, record.partition),
            Some(1)
        );
    }

    #[tokio::test]
    async fn test_failed_effect_is_redelivered() {
        let mut setup = Setup::new();
        let event = BehaviorEvent::new("A1", "u1", ActionKind::Like, 1_000);
        publish(&setup.broker, &event).await;
        setup.redis.fail_op("atomic_write", CustomRedisError::Timeout);

        let mut consumer = setup.consumer();
        let record = consumer.source.next().await.unwrap();
        consumer.handle(record.clone()).await;
        assert_eq!(setup.metrics.get(Stage::Apply, Counter::Redelivered), 1);

        setup.redis.clear_failures();
        let again = consumer.source.next().await.unwrap();
        assert_eq!(again, record);
        consumer.handle(again).await;
        assert_eq!(setup.metrics.get(Stage::Apply, Counter::Applied), 1);
    }

    #[tokio::test]
    async fn test_run_stops_on_cancel() {
        let setup = Setup::new();
        let shutdown = CancellationToken::new();
        let handle = tokio::spawn(setup.consumer().run(shutdown.clone()));

        let event = BehaviorEvent::new("A1", "u1", ActionKind::View, 1_000);
        publish(&setup.broker, &event).await;
        for _ in 0..100 {
            if setup.metrics.get(Stage::Apply, Counter::Applied) == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        shutdown.cancel();

        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .expect("consumer did not stop")
            .unwrap()
            .unwrap();
        assert_eq!(setup.metrics.get(Stage::Apply, Counter::Applied), 1);
    }

    #[tokio::test]
    async fn test_receive_backoff_is_interrupted_by_shutdown() {
        let setup = Setup::new();
        let attempts = Arc::new(AtomicUsize::new(0));
        let redis = Arc::new(setup.redis.clone());
        let consumer = ApplyConsumer::new(
            BrokenSource {
                attempts: attempts.clone(),
            },
            Arc::new(DedupLedger::new(
                redis.clone(),
                "processed_message_ids",
                Duration::from_secs(604_800),
            )),
            Arc::new(BehaviorStore::new(
                redis,
                Duration::from_secs(604_800),
                Duration::from_secs(2_592_000),
            )),
            setup.metrics.clone(),
        )
        .with_retry_backoff(Duration::from_secs(60));

        let shutdown = CancellationToken::new();
        let handle = tokio::spawn(consumer.run(shutdown.clone()));
        wait_until(|| attempts.load(Ordering::SeqCst) >= 1).await;
        shutdown.cancel();

        tokio::time::timeout(Duration::from_secs(2), handle)
            .await
            .expect("backoff held the consumer past shutdown")
            .unwrap()
            .unwrap();
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_aggregation_backoff_is_interrupted_by_shutdown() {
        let setup = Setup::new();
        let attempts = Arc::new(AtomicUsize::new(0));
        let aggregator = WindowAggregator::new(
            crate::aggregation::AggregationEngine::new(
                crate::aggregation::TumblingWindows::new(5_000, 0),
                vec![ActionKind::View],
                crate::aggregation::EmitMode::OnClose,
            ),
            Arc::new(crate::ranking::RankingStore::new(
                Arc::new(setup.redis.clone()),
                "article:ranking:",
                Duration::from_secs(86_400),
            )),
            Arc::new(crate::clock::ManualClock::new(0)),
            setup.metrics.clone(),
        );
        let consumer = AggregationConsumer::new(
            BrokenSource {
                attempts: attempts.clone(),
            },
            aggregator,
            setup.metrics.clone(),
            Duration::from_secs(3600),
        )
        .with_retry_backoff(Duration::from_secs(60));

        let shutdown = CancellationToken::new();
        let handle = tokio::spawn(consumer.run(shutdown.clone()));
        wait_until(|| attempts.load(Ordering::SeqCst) >= 1).await;
        shutdown.cancel();

        tokio::time::timeout(Duration::from_secs(2), handle)
            .await
            .expect("backoff held the consumer past shutdown")
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn test_readiness_follows_consumer_loop() {
        let setup = Setup::new();
        let readiness = HealthRegistry::new("readiness");
        let consumer = setup
            .consumer()
            .with_health(readiness.register("apply_consumer", Duration::from_secs(30)));
        assert!(!readiness.get_status().healthy);

        let shutdown = CancellationToken::new();
        let handle = tokio::spawn(consumer.run(shutdown.clone()));
        wait_until(|| readiness.get_status().healthy).await;

        shutdown.cancel();
        handle.await.unwrap().unwrap();

        let status = readiness.get_status();
        assert!(!status.healthy);
        assert_eq!(
            status.components.get("apply_consumer"),
            Some(&ComponentStatus::Stopped)
        );
    }
}
