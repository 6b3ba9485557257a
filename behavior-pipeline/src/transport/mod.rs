//! Publish/subscribe seam between the pipeline and its message log.
//!
//! The pipeline only needs keyed publishes and a pull-based record source
//! with per-record commit or redelivery. [`kafka`] backs both with rdkafka,
//! [`memory`] with an in-process partitioned log.

pub mod kafka;
pub mod memory;

use async_trait::async_trait;
use common_kafka::kafka_consumer::{OffsetErr, RecvErr};
use common_kafka::kafka_producer::KafkaProduceError;
use thiserror::Error;

pub use kafka::{KafkaPublisher, KafkaRecordSource};
pub use memory::{MemoryBroker, MemoryRecordSource};

/// One delivered message. `payload` is empty when the message had none.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    pub topic: String,
    pub key: Option<String>,
    pub payload: Vec<u8>,
    pub partition: i32,
    pub offset: i64,
}

#[derive(Error, Debug)]
pub enum TransportError {
    #[error(transparent)]
    Produce(#[from] KafkaProduceError),
    #[error(transparent)]
    Recv(#[from] RecvErr),
    #[error(transparent)]
    Offset(#[from] OffsetErr),
    #[error("no pending delivery for partition {partition} offset {offset}")]
    UnknownRecord { partition: i32, offset: i64 },
    #[error("topic {0} does not exist")]
    UnknownTopic(String),
}

#[async_trait]
pub trait Publisher: Send + Sync {
    /// Resolves once the transport has acknowledged the message.
    async fn publish(
        &self,
        topic: &str,
        key: Option<&str>,
        payload: &str,
    ) -> Result<(), TransportError>;
}

/// A consumer-group member reading one topic.
///
/// Every record returned by `next` must be settled with `commit` or
/// `redeliver` before the next call.
#[async_trait]
pub trait RecordSource: Send {
    /// Waits until a record is available. Cancel-safe.
    async fn next(&mut self) -> Result<Record, TransportError>;

    /// Mark the record handled; the group resumes after it.
    async fn commit(&mut self, record: &Record) -> Result<(), TransportError>;

    /// Deliver the record (and everything after it in its partition) again.
    async fn redeliver(&mut self, record: &Record) -> Result<(), TransportError>;
}
