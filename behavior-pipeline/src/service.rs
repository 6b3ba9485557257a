use std::future::Future;
use std::sync::Arc;

use anyhow::{Context, Result};
use common_cache::{ReadThroughCache, ReadThroughCacheWithMetrics};
use common_health::HealthRegistry;
use common_kafka::kafka_consumer::SingleTopicConsumer;
use common_kafka::kafka_producer::create_kafka_producer;
use common_redis::{Client as RedisClientTrait, RedisClient};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::aggregation::{AggregationEngine, TumblingWindows, WindowAggregator};
use crate::behavior_store::BehaviorStore;
use crate::clock::{Clock, SystemClock};
use crate::config::{Config, TransportKind};
use crate::consumer::{AggregationConsumer, ApplyConsumer};
use crate::dedup::DedupLedger;
use crate::metrics::{PipelineMetrics, PrometheusMetrics};
use crate::metrics_consts::CONSUMER_REBALANCES;
use crate::producer::EventProducer;
use crate::ranking::RankingStore;
use crate::transport::{
    KafkaPublisher, KafkaRecordSource, MemoryBroker, Publisher, RecordSource, TransportError,
};

const METRICS_NAMESPACE: &str = "behavior_pipeline";

/// Wires the apply and aggregation consumers to Redis and the transport.
pub struct BehaviorPipelineService {
    config: Config,
    redis: Arc<dyn RedisClientTrait + Send + Sync>,
    clock: Arc<dyn Clock>,
    metrics: Arc<dyn PipelineMetrics>,
    readiness: HealthRegistry,
}

impl BehaviorPipelineService {
    /// Connect to Redis and prepare the service from configuration.
    pub async fn new(config: Config) -> Result<Self> {
        config.validate().with_context(|| {
            format!(
                "Configuration validation failed for topic '{}'",
                config.events_topic
            )
        })?;

        let redis = RedisClient::with_config(
            config.redis_url.clone(),
            config.redis_response_timeout(),
            config.redis_connection_timeout(),
        )
        .await
        .with_context(|| format!("Failed to connect to redis at {}", config.redis_url))?;

        Ok(Self {
            config,
            redis: Arc::new(redis),
            clock: Arc::new(SystemClock),
            metrics: Arc::new(PrometheusMetrics),
            readiness: HealthRegistry::new("readiness"),
        })
    }

    /// Create a service over caller-provided collaborators (useful for testing)
    pub fn with_components(
        config: Config,
        redis: Arc<dyn RedisClientTrait + Send + Sync>,
        clock: Arc<dyn Clock>,
        metrics: Arc<dyn PipelineMetrics>,
    ) -> Result<Self> {
        config
            .validate()
            .context("Configuration validation failed for service with custom components")?;
        Ok(Self {
            config,
            redis,
            clock,
            metrics,
            readiness: HealthRegistry::new("readiness"),
        })
    }

    /// Healthy while both consumer loops are running and reporting.
    pub fn readiness(&self) -> HealthRegistry {
        self.readiness.clone()
    }

    pub fn dedup_ledger(&self) -> DedupLedger {
        DedupLedger::new(
            self.redis.clone(),
            self.config.dedup_set_key.clone(),
            self.config.dedup_retention(),
        )
    }

    pub fn behavior_store(&self) -> BehaviorStore {
        BehaviorStore::new(
            self.redis.clone(),
            std::time::Duration::from_secs(self.config.behavior_retention_secs),
            std::time::Duration::from_secs(self.config.daily_stats_retention_secs),
        )
    }

    pub fn ranking_store(&self) -> RankingStore {
        RankingStore::new(
            self.redis.clone(),
            self.config.ranking_key_prefix.clone(),
            self.config.ranking_window_retention(),
        )
        .with_current_max_entries(self.config.ranking_current_max_entries)
    }

    pub fn aggregator(&self) -> Result<WindowAggregator> {
        let engine = AggregationEngine::new(
            TumblingWindows::new(self.config.window_size_ms, self.config.window_epoch_ms),
            self.config.action_kinds(),
            self.config.emit_mode()?,
        );
        Ok(WindowAggregator::new(
            engine,
            Arc::new(self.ranking_store()),
            self.clock.clone(),
            self.metrics.clone(),
        ))
    }

    /// A metrics-emitting read-through cache over this service's Redis.
    pub fn cache(&self, cache_name: &'static str) -> ReadThroughCacheWithMetrics {
        let cache = ReadThroughCache::new(
            self.redis.clone(),
            self.redis.clone(),
            self.config.cache_config(),
        );
        ReadThroughCacheWithMetrics::new(Arc::new(cache), METRICS_NAMESPACE, cache_name, &[])
    }

    pub fn producer(&self, publisher: Arc<dyn Publisher>) -> EventProducer {
        EventProducer::new(
            publisher,
            self.config.events_topic.clone(),
            self.clock.clone(),
            self.metrics.clone(),
        )
    }

    /// Run the service until ctrl-c.
    pub async fn run(self) -> Result<()> {
        self.run_with_shutdown(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!("Failed to listen for ctrl+c signal: {e:#}");
            }
        })
        .await
    }

    /// Build the configured transport and run until `shutdown` resolves.
    pub async fn run_with_shutdown(self, shutdown: impl Future<Output = ()>) -> Result<()> {
        match self.config.transport_kind()? {
            TransportKind::Kafka => {
                let apply = SingleTopicConsumer::with_rebalance_metric(
                    &self.config.kafka,
                    self.config.apply_consumer_config(),
                    CONSUMER_REBALANCES,
                )
                .context("Failed to create the apply consumer")?;
                let aggregate = SingleTopicConsumer::with_rebalance_metric(
                    &self.config.kafka,
                    self.config.aggregation_consumer_config(),
                    CONSUMER_REBALANCES,
                )
                .context("Failed to create the aggregation consumer")?;

                let publisher: Option<Arc<dyn Publisher>> =
                    match self.config.demo_producer_interval() {
                        Some(_) => Some(Arc::new(KafkaPublisher::new(
                            create_kafka_producer(&self.config.kafka)
                                .await
                                .context("Failed to create the kafka producer")?,
                        ))),
                        None => None,
                    };

                self.run_with_sources(
                    KafkaRecordSource::new(apply),
                    KafkaRecordSource::new(aggregate),
                    publisher,
                    shutdown,
                )
                .await
            }
            TransportKind::Memory => {
                let broker = MemoryBroker::new(self.config.memory_partitions);
                let apply = broker.subscribe(
                    &self.config.events_topic,
                    &self.config.apply_consumer_group,
                );
                let aggregate = broker.subscribe(
                    &self.config.events_topic,
                    &self.config.aggregation_consumer_group,
                );
                self.run_with_sources(apply, aggregate, Some(Arc::new(broker)), shutdown)
                    .await
            }
        }
    }

    /// Run both consumers (and the demo producer, when configured and a
    /// publisher is given) over the given sources until `shutdown` resolves.
    pub async fn run_with_sources<A, G>(
        self,
        apply_source: A,
        aggregation_source: G,
        publisher: Option<Arc<dyn Publisher>>,
        shutdown: impl Future<Output = ()>,
    ) -> Result<()>
    where
        A: RecordSource + Sync + 'static,
        G: RecordSource + Sync + 'static,
    {
        let token = CancellationToken::new();

        let apply = ApplyConsumer::new(
            apply_source,
            Arc::new(self.dedup_ledger()),
            Arc::new(self.behavior_store()),
            self.metrics.clone(),
        )
        .with_retry_backoff(self.config.consumer_retry_backoff())
        .with_health(
            self.readiness
                .register("apply_consumer", self.config.readiness_deadline()),
        );
        let aggregation = AggregationConsumer::new(
            aggregation_source,
            self.aggregator()?,
            self.metrics.clone(),
            self.config.aggregation_tick(),
        )
        .with_retry_backoff(self.config.consumer_retry_backoff())
        .with_health(
            self.readiness
                .register("aggregation_consumer", self.config.readiness_deadline()),
        );

        info!(
            topic = %self.config.events_topic,
            emit_mode = %self.config.emit_mode,
            window_size_ms = self.config.window_size_ms,
            "Starting behavior pipeline"
        );
        let apply_handle = tokio::spawn(apply.run(token.child_token()));
        let aggregation_handle = tokio::spawn(aggregation.run(token.child_token()));

        let producer_handle = match (self.config.demo_producer_interval(), publisher) {
            (Some(interval), Some(publisher)) => {
                let producer = self.producer(publisher);
                let cancel = token.child_token();
                info!(?interval, "Starting demo producer");
                Some(tokio::spawn(async move {
                    producer.run_generator(interval, cancel).await
                }))
            }
            _ => None,
        };

        shutdown.await;
        info!("Received shutdown signal, shutting down gracefully...");
        token.cancel();

        self.join("apply consumer", apply_handle).await;
        self.join("aggregation consumer", aggregation_handle).await;
        if let Some(handle) = producer_handle {
            match tokio::time::timeout(self.config.shutdown_timeout(), handle).await {
                Ok(Ok(sent)) => info!(sent, "Demo producer stopped"),
                Ok(Err(e)) => error!("Demo producer task panicked: {e:#}"),
                Err(_) => error!("Demo producer shutdown timed out"),
            }
        }

        info!("Behavior pipeline stopped");
        Ok(())
    }

    async fn join(&self, name: &str, handle: JoinHandle<Result<(), TransportError>>) {
        match tokio::time::timeout(self.config.shutdown_timeout(), handle).await {
            Ok(Ok(Ok(()))) => info!("{name} stopped normally"),
            Ok(Ok(Err(e))) => error!("{name} stopped with error: {e:#}"),
            Ok(Err(e)) => error!("{name} task panicked: {e:#}"),
            Err(_) => error!(
                "{name} shutdown timed out after {:?}",
                self.config.shutdown_timeout()
            ),
        }
    }
}
