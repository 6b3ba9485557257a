//! Tumbling-window counting of behavior events, and the stage that hands
//! window counts to the ranking store.

mod engine;
mod window;

use std::sync::Arc;

use tracing::{debug, error, warn};

use crate::clock::Clock;
use crate::error::PipelineError;
use crate::metrics::{Counter, PipelineMetrics, Stage};
use crate::ranking::RankingStore;

pub use engine::{AggregationEngine, EmitMode, IngestOutcome};
pub use window::{window_label, TumblingWindows, WindowCount, WindowKey};

/// Owns an [`AggregationEngine`] and writes what it emits to the ranking store.
///
/// Ranking write failures are logged and counted; they never stop consumption.
pub struct WindowAggregator {
    engine: AggregationEngine,
    ranking: Arc<RankingStore>,
    clock: Arc<dyn Clock>,
    metrics: Arc<dyn PipelineMetrics>,
}

impl WindowAggregator {
    pub fn new(
        engine: AggregationEngine,
        ranking: Arc<RankingStore>,
        clock: Arc<dyn Clock>,
        metrics: Arc<dyn PipelineMetrics>,
    ) -> Self {
        Self {
            engine,
            ranking,
            clock,
            metrics,
        }
    }

    pub fn engine(&self) -> &AggregationEngine {
        &self.engine
    }

    /// Count one payload, then close whatever the clock says has ended.
    pub async fn handle(&mut self, payload: &[u8]) -> Result<IngestOutcome, PipelineError> {
        let now = self.clock.now_millis();
        let outcome = self.engine.ingest(payload, now);

        match &outcome {
            Ok(IngestOutcome::Counted {
                emitted: Some(count),
                ..
            }) => {
                self.emit(std::slice::from_ref(count)).await;
            }
            Ok(IngestOutcome::Counted { key, count, .. }) => {
                debug!(entity_id = %key.entity_id, window_start = key.window_start, count, "counted");
            }
            Ok(IngestOutcome::Filtered) => {
                self.metrics
                    .increment(Stage::Aggregate, Counter::Filtered, 1);
            }
            Err(e) => {
                warn!(error = ?e, "dropping event from aggregation");
                self.metrics.increment(
                    Stage::Aggregate,
                    Counter::Failed { reason: e.reason() },
                    1,
                );
            }
        }

        self.close_expired_at(now).await;
        outcome
    }

    /// Close windows that ended before the current clock reading. Returns how many counts were emitted.
    pub async fn tick(&mut self) -> usize {
        let now = self.clock.now_millis();
        self.close_expired_at(now).await
    }

    async fn close_expired_at(&mut self, now: i64) -> usize {
        let closed = self.engine.close_expired(now);
        self.metrics.set_open_windows(self.engine.open_windows());
        if closed.is_empty() {
            return 0;
        }
        self.emit(&closed).await;
        closed.len()
    }

    async fn emit(&self, counts: &[WindowCount]) {
        for count in counts {
            match self
                .ranking
                .update(&count.entity_id, count.count as f64, &count.window_label)
                .await
            {
                Ok(()) => {
                    self.metrics
                        .increment(Stage::Aggregate, Counter::WindowsEmitted, 1);
                }
                Err(e) => {
                    error!(
                        entity_id = %count.entity_id,
                        window = %count.window_label,
                        error = ?e,
                        "failed to write window count to ranking store"
                    );
                    self.metrics
                        .increment(Stage::Aggregate, Counter::RankingWriteFailed, 1);
                }
            }
        }
    }

    /// Drop open windows on shutdown. Their partial counts are lost.
    pub fn shutdown(&mut self) -> usize {
        let dropped = self.engine.drain_open();
        if dropped > 0 {
            warn!(dropped, "discarding open windows on shutdown");
            self.metrics.increment(
                Stage::Aggregate,
                Counter::WindowsDroppedOnShutdown,
                dropped as u64,
            );
        }
        self.metrics.set_open_windows(0);
        dropped
    }
}
