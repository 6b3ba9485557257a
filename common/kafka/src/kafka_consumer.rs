use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use rdkafka::{
    consumer::{BaseConsumer, Consumer, ConsumerContext, Rebalance, StreamConsumer},
    error::KafkaError,
    ClientContext, Message, Statistics, TopicPartitionList,
};
use tracing::{debug, error, info};

use crate::config::{ConsumerConfig, KafkaConfig};
use crate::kafka_producer::KafkaContext;

const SEEK_TIMEOUT: Duration = Duration::from_secs(5);

pub const DEFAULT_REBALANCE_METRIC: &str = "kafka_consumer_rebalances_total";

/// Rebalance counts and current partition ownership of one consumer.
#[derive(Debug, Default)]
pub struct ConsumerStats {
    assignments: AtomicU64,
    revocations: AtomicU64,
    owned: Mutex<BTreeMap<String, BTreeSet<i32>>>,
}

impl ConsumerStats {
    /// Non-empty assign and revoke events seen so far.
    pub fn rebalances(&self) -> u64 {
        self.assignments() + self.revocations()
    }

    pub fn assignments(&self) -> u64 {
        self.assignments.load(Ordering::Relaxed)
    }

    pub fn revocations(&self) -> u64 {
        self.revocations.load(Ordering::Relaxed)
    }

    /// Partitions currently owned, per topic.
    pub fn owned_partitions(&self) -> BTreeMap<String, BTreeSet<i32>> {
        self.owned
            .lock()
            .map(|owned| owned.clone())
            .unwrap_or_default()
    }

    fn apply(&self, partitions: &TopicPartitionList, assigned: bool) {
        let counter = match assigned {
            true => &self.assignments,
            false => &self.revocations,
        };
        counter.fetch_add(1, Ordering::Relaxed);

        let Ok(mut owned) = self.owned.lock() else {
            return;
        };
        for elem in partitions.elements() {
            let topic = owned.entry(elem.topic().to_string()).or_default();
            match assigned {
                true => topic.insert(elem.partition()),
                false => topic.remove(&elem.partition()),
            };
        }
        owned.retain(|_, partitions| !partitions.is_empty());
    }
}

/// `orders[0,1,4] payments[2]`
fn summarize(partitions: &TopicPartitionList) -> String {
    let mut by_topic: BTreeMap<String, Vec<i32>> = BTreeMap::new();
    for elem in partitions.elements() {
        by_topic.entry(elem.topic().to_string()).or_default().push(elem.partition());
    }

    let mut summary = String::new();
    for (topic, mut ids) in by_topic {
        ids.sort_unstable();
        let ids: Vec<String> = ids.iter().map(i32::to_string).collect();
        if !summary.is_empty() {
            summary.push(' ');
        }
        summary.push_str(&format!("{topic}[{}]", ids.join(",")));
    }
    summary
}

/// Consumer context that logs and counts partition assignments and revocations.
pub struct RebalanceContext {
    client: KafkaContext,
    group: String,
    metric: &'static str,
    stats: Arc<ConsumerStats>,
}

impl RebalanceContext {
    pub fn new(group: impl Into<String>, metric: &'static str) -> Self {
        Self {
            client: KafkaContext::new("consumer"),
            group: group.into(),
            metric,
            stats: Arc::default(),
        }
    }

    pub fn consumer_stats(&self) -> Arc<ConsumerStats> {
        self.stats.clone()
    }

    fn record(&self, partitions: &TopicPartitionList, event_type: &'static str) {
        self.stats.apply(partitions, event_type == "assign");
        metrics::counter!(
            self.metric,
            "group" => self.group.clone(),
            "event_type" => event_type
        )
        .increment(1);
    }
}

impl ClientContext for RebalanceContext {
    fn stats(&self, statistics: Statistics) {
        self.client.stats(statistics)
    }
}

impl ConsumerContext for RebalanceContext {
    fn pre_rebalance(&self, _base_consumer: &BaseConsumer<Self>, rebalance: &Rebalance) {
        match rebalance {
            Rebalance::Revoke(partitions) => {
                if partitions.count() == 0 {
                    debug!(group = %self.group, "skipping empty revoke");
                    return;
                }
                info!(
                    group = %self.group,
                    count = partitions.count(),
                    partitions = %summarize(partitions),
                    "revoking partitions"
                );
                self.record(partitions, "revoke");
            }
            Rebalance::Assign(partitions) => {
                debug!(group = %self.group, count = partitions.count(), "pre-rebalance assign");
            }
            Rebalance::Error(e) => {
                error!(group = %self.group, error = %e, "rebalance error");
            }
        }
    }

    fn post_rebalance(&self, _base_consumer: &BaseConsumer<Self>, rebalance: &Rebalance) {
        match rebalance {
            Rebalance::Assign(partitions) => {
                if partitions.count() == 0 {
                    debug!(group = %self.group, "skipping empty assign");
                    return;
                }
                self.record(partitions, "assign");
                info!(
                    group = %self.group,
                    count = partitions.count(),
                    partitions = %summarize(partitions),
                    rebalances = self.stats.rebalances(),
                    "assigned partitions"
                );
            }
            Rebalance::Revoke(_) => {
                debug!(
                    group = %self.group,
                    owned = ?self.stats.owned_partitions(),
                    "partitions revoked"
                );
            }
            Rebalance::Error(e) => {
                error!(group = %self.group, error = %e, "rebalance error");
            }
        }
    }
}

#[derive(Clone)]
pub struct SingleTopicConsumer {
    inner: Arc<Inner>,
}

struct Inner {
    consumer: StreamConsumer<RebalanceContext>,
    topic: String,
}

#[derive(Debug, thiserror::Error)]
pub enum RecvErr {
    #[error("Kafka error: {0}")]
    Kafka(#[from] KafkaError),
}

#[derive(Debug, thiserror::Error)]
pub enum OffsetErr {
    #[error("Kafka error: {0}")]
    Kafka(#[from] KafkaError),
    #[error("Consumer gone")]
    Gone,
}

/// An owned copy of a received message.
#[derive(Debug, Clone)]
pub struct RawMessage {
    pub key: Option<String>,
    pub payload: Option<Vec<u8>>,
    pub partition: i32,
    pub offset: i64,
}

impl SingleTopicConsumer {
    pub fn new(
        common_config: &KafkaConfig,
        consumer_config: ConsumerConfig,
    ) -> Result<Self, KafkaError> {
        Self::with_rebalance_metric(common_config, consumer_config, DEFAULT_REBALANCE_METRIC)
    }

    /// Like `new`, counting rebalances under the given metric name.
    pub fn with_rebalance_metric(
        common_config: &KafkaConfig,
        consumer_config: ConsumerConfig,
        rebalance_metric: &'static str,
    ) -> Result<Self, KafkaError> {
        let mut client_config = common_config.client_config();
        client_config
            .set("group.id", &consumer_config.kafka_consumer_group)
            .set(
                "auto.offset.reset",
                &consumer_config.kafka_consumer_offset_reset,
            )
            .set("enable.auto.commit", "true")
            .set(
                "auto.commit.interval.ms",
                consumer_config
                    .kafka_consumer_auto_commit_interval_ms
                    .to_string(),
            );

        // Offsets are only stored once a message has been fully handled.
        client_config.set("enable.auto.offset.store", "false");

        let context = RebalanceContext::new(
            consumer_config.kafka_consumer_group.clone(),
            rebalance_metric,
        );
        let consumer: StreamConsumer<RebalanceContext> =
            client_config.create_with_context(context)?;
        consumer.subscribe(&[consumer_config.kafka_consumer_topic.as_str()])?;

        let inner = Inner {
            consumer,
            topic: consumer_config.kafka_consumer_topic,
        };
        Ok(Self {
            inner: Arc::new(inner),
        })
    }

    pub fn topic(&self) -> &str {
        &self.inner.topic
    }

    pub fn stats(&self) -> Arc<ConsumerStats> {
        self.inner.consumer.context().consumer_stats()
    }

    pub async fn recv(&self) -> Result<(RawMessage, Offset), RecvErr> {
        let message = self.inner.consumer.recv().await?;

        let raw = RawMessage {
            key: message
                .key()
                .map(|key| String::from_utf8_lossy(key).into_owned()),
            payload: message.payload().map(|payload| payload.to_vec()),
            partition: message.partition(),
            offset: message.offset(),
        };

        let offset = Offset {
            handle: Arc::downgrade(&self.inner),
            partition: raw.partition,
            offset: raw.offset,
        };

        Ok((raw, offset))
    }
}

pub struct Offset {
    handle: Weak<Inner>,
    partition: i32,
    offset: i64,
}

impl Offset {
    pub fn partition(&self) -> i32 {
        self.partition
    }

    pub fn offset(&self) -> i64 {
        self.offset
    }

    /// Mark the message as handled. The stored value is the next offset to consume.
    pub fn store(self) -> Result<(), OffsetErr> {
        let inner = self.handle.upgrade().ok_or(OffsetErr::Gone)?;
        inner
            .consumer
            .store_offset(&inner.topic, self.partition, self.offset + 1)?;
        Ok(())
    }

    /// Seek the partition back to this message so it is delivered again.
    pub fn rewind(self) -> Result<(), OffsetErr> {
        let inner = self.handle.upgrade().ok_or(OffsetErr::Gone)?;
        inner.consumer.seek(
            &inner.topic,
            self.partition,
            rdkafka::Offset::Offset(self.offset),
            SEEK_TIMEOUT,
        )?;
        Ok(())
    }
}
