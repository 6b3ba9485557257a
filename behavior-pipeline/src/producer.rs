use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::clock::Clock;
use crate::error::PipelineError;
use crate::event::{ActionKind, BehaviorEvent};
use crate::metrics::{Counter, PipelineMetrics, Stage};
use crate::transport::Publisher;

/// Which field becomes the message key, and so decides the partition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PartitionKey {
    #[default]
    Actor,
    Entity,
}

pub struct EventProducer {
    publisher: Arc<dyn Publisher>,
    topic: String,
    key_by: PartitionKey,
    clock: Arc<dyn Clock>,
    metrics: Arc<dyn PipelineMetrics>,
}

impl EventProducer {
    pub fn new(
        publisher: Arc<dyn Publisher>,
        topic: impl Into<String>,
        clock: Arc<dyn Clock>,
        metrics: Arc<dyn PipelineMetrics>,
    ) -> Self {
        Self {
            publisher,
            topic: topic.into(),
            key_by: PartitionKey::default(),
            clock,
            metrics,
        }
    }

    pub fn key_by(mut self, key_by: PartitionKey) -> Self {
        self.key_by = key_by;
        self
    }

    /// Create an event with a fresh message id, stamped with the current time, and publish it.
    pub async fn emit(
        &self,
        entity_id: &str,
        actor_id: &str,
        action_kind: ActionKind,
    ) -> Result<BehaviorEvent, PipelineError> {
        let event = BehaviorEvent::new(entity_id, actor_id, action_kind, self.clock.now_millis());
        self.publish(&event).await?;
        Ok(event)
    }

    /// Publish an existing event as is. Retrying a failed publish through
    /// here keeps the message id, so consumers deduplicate the retry.
    pub async fn publish(&self, event: &BehaviorEvent) -> Result<(), PipelineError> {
        let payload = event.to_json()?;
        let key = match self.key_by {
            PartitionKey::Actor => event.actor_id.as_str(),
            PartitionKey::Entity => event.entity_id.as_str(),
        };

        match self.publisher.publish(&self.topic, Some(key), &payload).await {
            Ok(()) => {
                self.metrics.increment(Stage::Produce, Counter::Produced, 1);
                Ok(())
            }
            Err(e) => {
                error!(message_id = %event.message_id, error = ?e, "failed to publish event");
                self.metrics
                    .increment(Stage::Produce, Counter::ProduceFailed, 1);
                Err(e.into())
            }
        }
    }

    /// Publish `count` like events for one entity, one per synthetic actor.
    /// Results are in send order.
    pub async fn emit_batch(
        &self,
        entity_id: &str,
        count: usize,
    ) -> Vec<Result<BehaviorEvent, PipelineError>> {
        let mut results = Vec::with_capacity(count);
        for i in 0..count {
            let actor_id = format!("user_{}", i + 1);
            results.push(self.emit(entity_id, &actor_id, ActionKind::Like).await);
        }
        let sent = results.iter().filter(|r| r.is_ok()).count();
        info!(entity_id, sent, failed = count - sent, "batch published");
        results
    }

    /// Publish a random event every `interval` until cancelled. Returns how many were sent.
    pub async fn run_generator(&self, interval: Duration, shutdown: CancellationToken) -> u64 {
        let mut ticker = tokio::time::interval(interval);
        let mut sent = 0u64;
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {}
            }
            let (entity_id, actor_id, action_kind) = random_event_fields();
            if self.emit(&entity_id, &actor_id, action_kind).await.is_ok() {
                sent += 1;
                if sent % 100 == 0 {
                    info!(sent, "generated events");
                }
            }
        }
        sent
    }
}

fn random_event_fields() -> (String, String, ActionKind) {
    let mut rng = rand::thread_rng();
    let action_kind = match rng.gen_range(0..4) {
        0 => ActionKind::Click,
        1 => ActionKind::View,
        2 => ActionKind::AddToCart,
        _ => ActionKind::Purchase,
    };
    (
        format!("item_{}", rng.gen_range(0..500)),
        format!("user_{}", rng.gen_range(0..1000)),
        action_kind,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::metrics::RecordingMetrics;
    use crate::transport::{MemoryBroker, TransportError};
    use async_trait::async_trait;

    const TOPIC: &str = "user_behavior_events";

    struct FailingPublisher;

    #[async_trait]
    impl Publisher for FailingPublisher {
        async fn publish(&self, topic: &str, _: Option<&str>, _: &str) -> Result<(), TransportError> {
            Err(TransportError::UnknownTopic(topic.to_string()))
        }
    }

    fn producer(publisher: Arc<dyn Publisher>, metrics: Arc<RecordingMetrics>) -> EventProducer {
        EventProducer::new(publisher, TOPIC, Arc::new(ManualClock::new(42_000)), metrics)
    }

    #[tokio::test]
    async fn test_emit_publishes_keyed_by_actor() {
        let broker = MemoryBroker::new(4);
        let metrics = Arc::new(RecordingMetrics::new());
        let producer = producer(Arc::new(broker.clone()), metrics.clone());

        let event = producer.emit("A42", "u1", ActionKind::View).await.unwrap();
        assert_eq!(event.occurred_at, 42_000);

        let records = broker.records(TOPIC);
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].key.as_deref(), Some("u1"));
        assert_eq!(records[0].partition, broker.partition_for("u1"));
        assert_eq!(BehaviorEvent::from_payload(&records[0].payload).unwrap(), event);
        assert_eq!(metrics.get(Stage::Produce, Counter::Produced), 1);
    }

    #[tokio::test]
    async fn test_key_by_entity_and_republish_keeps_message_id() {
        let broker = MemoryBroker::new(4);
        let producer = producer(Arc::new(broker.clone()), Arc::new(RecordingMetrics::new()))
            .key_by(PartitionKey::Entity);

        let event = producer.emit("A42", "u1", ActionKind::Like).await.unwrap();
        producer.publish(&event).await.unwrap();

        let records = broker.records(TOPIC);
        assert_eq!(records.len(), 2);
        assert!(records.iter().all(|r| r.key.as_deref() == Some("A42")));
        assert_eq!(records[0].payload, records[1].payload);
    }

    #[tokio::test]
    async fn test_emit_batch_counts_failures() {
        let metrics = Arc::new(RecordingMetrics::new());
        let producer = producer(Arc::new(FailingPublisher), metrics.clone());

        let results = producer.emit_batch("A1", 3).await;
        assert_eq!(results.len(), 3);
        assert!(results
            .iter()
            .all(|r| matches!(r, Err(PipelineError::Transport(_)))));
        assert_eq!(metrics.get(Stage::Produce, Counter::ProduceFailed), 3);
    }

    #[tokio::test]
    async fn test_emit_batch_uses_distinct_actors() {
        let broker = MemoryBroker::new(1);
        let producer = producer(Arc::new(broker.clone()), Arc::new(RecordingMetrics::new()));

        let events: Vec<_> = producer
            .emit_batch("A1", 3)
            .await
            .into_iter()
            .map(Result::unwrap)
            .collect();
        let actors: Vec<_> = events.iter().map(|e| e.actor_id.as_str()).collect();
        assert_eq!(actors, vec!["user_1", "user_2", "user_3"]);
        assert!(events.iter().all(|e| e.action_kind == ActionKind::Like));
    }

    #[tokio::test(start_paused = true)]
    async fn test_generator_publishes_until_cancelled() {
        let broker = MemoryBroker::new(2);
        let producer = producer(Arc::new(broker.clone()), Arc::new(RecordingMetrics::new()));
        let shutdown = CancellationToken::new();

        let canceller = shutdown.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(450)).await;
            canceller.cancel();
        });

        let sent = producer
            .run_generator(Duration::from_millis(100), shutdown)
            .await;
        // Ticks at 0, 100, 200, 300 and 400 ms.
        assert_eq!(sent, 5);
        let records = broker.records(TOPIC);
        assert_eq!(records.len(), 5);
        let event = BehaviorEvent::from_payload(&records[0].payload).unwrap();
        assert!(event.entity_id.starts_with("item_"));
        assert!(event.actor_id.starts_with("user_"));
    }
}
