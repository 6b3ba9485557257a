use rdkafka::mocking::MockCluster;
use rdkafka::producer::{DefaultProducerContext, FutureProducer};

use crate::config::KafkaConfig;
use crate::kafka_producer::{create_kafka_producer, KafkaContext};

/// In-process broker for tests. Keep the cluster alive for as long as the producer is used.
pub async fn create_mock_kafka() -> (
    MockCluster<'static, DefaultProducerContext>,
    FutureProducer<KafkaContext>,
) {
    let cluster = MockCluster::new(1).expect("failed to create mock brokers");

    let config = mock_kafka_config(&cluster);

    (
        cluster,
        create_kafka_producer(&config)
            .await
            .expect("failed to create mocked kafka producer"),
    )
}

pub fn mock_kafka_config(cluster: &MockCluster<'static, DefaultProducerContext>) -> KafkaConfig {
    KafkaConfig {
        kafka_producer_linger_ms: 0,
        kafka_producer_queue_mib: 50,
        kafka_message_timeout_ms: 5000,
        kafka_compression_codec: "none".to_string(),
        kafka_hosts: cluster.bootstrap_servers(),
        kafka_tls: false,
        kafka_producer_queue_messages: 1000,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ConsumerConfig;
    use crate::kafka_consumer::SingleTopicConsumer;
    use crate::kafka_producer::send_keyed_to_kafka;
    use std::time::Duration;

    #[tokio::test]
    async fn test_produce_then_consume_and_rewind() {
        let (cluster, producer) = create_mock_kafka().await;
        cluster
            .create_topic("events", 1, 1)
            .expect("failed to create topic");

        send_keyed_to_kafka(&producer, "events", Some("u1"), "{\"a\":1}")
            .await
            .expect("send failed");

        let consumer = SingleTopicConsumer::new(
            &mock_kafka_config(&cluster),
            ConsumerConfig::new("test-group", "events"),
        )
        .expect("consumer");

        let (first, offset) = tokio::time::timeout(Duration::from_secs(10), consumer.recv())
            .await
            .expect("timed out")
            .expect("recv failed");
        assert_eq!(first.key.as_deref(), Some("u1"));
        assert_eq!(first.payload.as_deref(), Some(b"{\"a\":1}".as_slice()));

        offset.rewind().expect("rewind failed");
        let (again, offset) = tokio::time::timeout(Duration::from_secs(10), consumer.recv())
            .await
            .expect("timed out")
            .expect("recv failed");
        assert_eq!(again.offset, first.offset);
        offset.store().expect("store failed");
    }
}
