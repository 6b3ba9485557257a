use crate::config::KafkaConfig;

use metrics::gauge;
use rdkafka::error::KafkaError;
use rdkafka::producer::{FutureProducer, FutureRecord, Producer};
use rdkafka::ClientContext;
use thiserror::Error;
use tracing::{debug, error, info};

/// Client context that exports librdkafka statistics as gauges.
pub struct KafkaContext {
    client: &'static str,
}

impl KafkaContext {
    pub fn new(client: &'static str) -> Self {
        Self { client }
    }
}

impl ClientContext for KafkaContext {
    fn stats(&self, stats: rdkafka::Statistics) {
        gauge!("kafka_callback_queue_depth", "client" => self.client).set(stats.replyq as f64);
        gauge!("kafka_producer_queue_depth", "client" => self.client).set(stats.msg_cnt as f64);
        gauge!("kafka_producer_queue_depth_limit", "client" => self.client)
            .set(stats.msg_max as f64);

        for (_, stats) in stats.brokers {
            let id_string = format!("{}", stats.nodeid);
            if let Some(rtt) = stats.rtt {
                gauge!(
                    "kafka_rtt_latency_us",
                    "client" => self.client,
                    "quantile" => "p50",
                    "broker" => id_string.clone()
                )
                .set(rtt.p50 as f64);
                gauge!(
                    "kafka_rtt_latency_us",
                    "client" => self.client,
                    "quantile" => "p99",
                    "broker" => id_string.clone()
                )
                .set(rtt.p99 as f64);
            }
            gauge!(
                "kafka_broker_requests_pending",
                "client" => self.client,
                "broker" => id_string
            )
            .set(stats.outbuf_cnt as f64);
        }
    }
}

pub async fn create_kafka_producer(
    config: &KafkaConfig,
) -> Result<FutureProducer<KafkaContext>, KafkaError> {
    let mut client_config = config.client_config();
    client_config
        .set("linger.ms", config.kafka_producer_linger_ms.to_string())
        .set(
            "message.timeout.ms",
            config.kafka_message_timeout_ms.to_string(),
        )
        .set(
            "compression.codec",
            config.kafka_compression_codec.to_owned(),
        )
        .set(
            "queue.buffering.max.kbytes",
            (config.kafka_producer_queue_mib * 1024).to_string(),
        )
        .set(
            "queue.buffering.max.messages",
            config.kafka_producer_queue_messages.to_string(),
        );

    debug!("rdkafka configuration: {:?}", client_config);
    let api: FutureProducer<KafkaContext> =
        client_config.create_with_context(KafkaContext::new("producer"))?;

    // "Ping" the Kafka brokers by requesting metadata
    match api
        .client()
        .fetch_metadata(None, std::time::Duration::from_secs(15))
    {
        Ok(metadata) => {
            info!(
                "Successfully connected to Kafka brokers. Found {} topics.",
                metadata.topics().len()
            );
        }
        Err(error) => {
            error!("Failed to fetch metadata from Kafka brokers: {:?}", error);
            return Err(error);
        }
    }

    Ok(api)
}

#[derive(Error, Debug)]
pub enum KafkaProduceError {
    #[error("failed to produce to kafka: {error}")]
    KafkaProduceError { error: KafkaError },
    #[error("failed to produce to kafka (timeout)")]
    KafkaProduceCanceled,
}

/// Send one pre-serialized payload and wait for the broker ack.
pub async fn send_keyed_to_kafka<C: ClientContext + 'static>(
    kafka_producer: &FutureProducer<C>,
    topic: &str,
    key: Option<&str>,
    payload: &str,
) -> Result<(), KafkaProduceError> {
    let record = FutureRecord {
        topic,
        key,
        payload: Some(payload),
        timestamp: None,
        partition: None,
        headers: None,
    };

    let future_handle = kafka_producer
        .send_result(record)
        .map_err(|(e, _)| KafkaProduceError::KafkaProduceError { error: e })?;

    match future_handle.await {
        Ok(Ok(_)) => Ok(()),
        Ok(Err((e, _))) => Err(KafkaProduceError::KafkaProduceError { error: e }),
        Err(_) => Err(KafkaProduceError::KafkaProduceCanceled),
    }
}
