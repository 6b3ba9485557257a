use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use common_kafka::kafka_consumer::{ConsumerStats, Offset, SingleTopicConsumer};
use common_kafka::kafka_producer::{send_keyed_to_kafka, KafkaContext};
use rdkafka::producer::FutureProducer;

use super::{Publisher, Record, RecordSource, TransportError};

pub struct KafkaPublisher {
    producer: FutureProducer<KafkaContext>,
}

impl KafkaPublisher {
    pub fn new(producer: FutureProducer<KafkaContext>) -> Self {
        Self { producer }
    }
}

#[async_trait]
impl Publisher for KafkaPublisher {
    async fn publish(
        &self,
        topic: &str,
        key: Option<&str>,
        payload: &str,
    ) -> Result<(), TransportError> {
        send_keyed_to_kafka(&self.producer, topic, key, payload).await?;
        Ok(())
    }
}

/// Offsets are stored only on commit; redelivery seeks the partition back.
pub struct KafkaRecordSource {
    consumer: SingleTopicConsumer,
    pending: HashMap<(i32, i64), Offset>,
}

impl KafkaRecordSource {
    pub fn new(consumer: SingleTopicConsumer) -> Self {
        Self {
            consumer,
            pending: HashMap::new(),
        }
    }

    /// Rebalance counts and owned partitions of the underlying consumer.
    pub fn consumer_stats(&self) -> Arc<ConsumerStats> {
        self.consumer.stats()
    }

    fn take_pending(&mut self, record: &Record) -> Result<Offset, TransportError> {
        self.pending
            .remove(&(record.partition, record.offset))
            .ok_or(TransportError::UnknownRecord {
                partition: record.partition,
                offset: record.offset,
            })
    }
}

#[async_trait]
impl RecordSource for KafkaRecordSource {
    async fn next(&mut self) -> Result<Record, TransportError> {
        let (message, offset) = self.consumer.recv().await?;
        let record = Record {
            topic: self.consumer.topic().to_string(),
            key: message.key,
            payload: message.payload.unwrap_or_default(),
            partition: message.partition,
            offset: message.offset,
        };
        self.pending.insert((record.partition, record.offset), offset);
        Ok(record)
    }

    async fn commit(&mut self, record: &Record) -> Result<(), TransportError> {
        self.take_pending(record)?.store()?;
        Ok(())
    }

    async fn redeliver(&mut self, record: &Record) -> Result<(), TransportError> {
        let offset = self.take_pending(record)?;
        // Anything read after this record on the same partition will come again.
        self.pending.retain(|(partition, _), _| *partition != record.partition);
        offset.rewind()?;
        Ok(())
    }
}
