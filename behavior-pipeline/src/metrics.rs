use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use common_metrics::{gauge, histogram, inc};

use crate::metrics_consts::{
    EVENTS_APPLIED, EVENTS_FAILED, EVENTS_FILTERED, EVENTS_PRODUCED, EVENTS_SKIPPED_DUPLICATE,
    OPEN_WINDOWS, RANKING_WRITE_FAILURES, RECORDS_RECEIVED, RECORDS_REDELIVERED,
    RECORD_PROCESSING_MS, WINDOWS_DROPPED_ON_SHUTDOWN, WINDOWS_EMITTED,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Stage {
    Apply,
    Aggregate,
    Produce,
}

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Apply => "apply",
            Stage::Aggregate => "aggregate",
            Stage::Produce => "produce",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Counter {
    Received,
    Applied,
    SkippedDuplicate,
    Failed { reason: &'static str },
    Redelivered,
    Filtered,
    WindowsEmitted,
    RankingWriteFailed,
    WindowsDroppedOnShutdown,
    Produced,
    ProduceFailed,
}

/// Sink for pipeline counters. Injected so tests can assert on what the
/// consumers counted without a global recorder.
pub trait PipelineMetrics: Send + Sync {
    fn increment(&self, stage: Stage, counter: Counter, by: u64);

    fn set_open_windows(&self, open: usize);

    fn record_processing_ms(&self, _stage: Stage, _millis: f64) {}
}

/// Forwards to the global `metrics` recorder installed by the HTTP server.
#[derive(Debug, Default, Clone, Copy)]
pub struct PrometheusMetrics;

impl PipelineMetrics for PrometheusMetrics {
    fn increment(&self, stage: Stage, counter: Counter, by: u64) {
        let mut labels = vec![("stage".to_string(), stage.as_str().to_string())];
        let name = match counter {
            Counter::Received => RECORDS_RECEIVED,
            Counter::Applied => EVENTS_APPLIED,
            Counter::SkippedDuplicate => EVENTS_SKIPPED_DUPLICATE,
            Counter::Failed { reason } => {
                labels.push(("reason".to_string(), reason.to_string()));
                EVENTS_FAILED
            }
            Counter::Redelivered => RECORDS_REDELIVERED,
            Counter::Filtered => EVENTS_FILTERED,
            Counter::WindowsEmitted => WINDOWS_EMITTED,
            Counter::RankingWriteFailed => RANKING_WRITE_FAILURES,
            Counter::WindowsDroppedOnShutdown => WINDOWS_DROPPED_ON_SHUTDOWN,
            Counter::Produced => {
                labels.push(("outcome".to_string(), "success".to_string()));
                EVENTS_PRODUCED
            }
            Counter::ProduceFailed => {
                labels.push(("outcome".to_string(), "failure".to_string()));
                EVENTS_PRODUCED
            }
        };
        inc(name, &labels, by);
    }

    fn set_open_windows(&self, open: usize) {
        gauge(OPEN_WINDOWS, &[], open as f64);
    }

    fn record_processing_ms(&self, stage: Stage, millis: f64) {
        let labels = [("stage".to_string(), stage.as_str().to_string())];
        histogram(RECORD_PROCESSING_MS, &labels, millis);
    }
}

/// Keeps counts in memory.
#[derive(Debug, Default)]
pub struct RecordingMetrics {
    counts: Mutex<HashMap<(Stage, Counter), u64>>,
    open_windows: AtomicUsize,
}

impl RecordingMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, stage: Stage, counter: Counter) -> u64 {
        self.counts
            .lock()
            .map(|counts| counts.get(&(stage, counter)).copied().unwrap_or(0))
            .unwrap_or(0)
    }

    /// Failures for a stage across every reason.
    pub fn failures(&self, stage: Stage) -> u64 {
        self.counts
            .lock()
            .map(|counts| {
                counts
                    .iter()
                    .filter(|((s, c), _)| *s == stage && matches!(c, Counter::Failed { .. }))
                    .map(|(_, n)| n)
                    .sum()
            })
            .unwrap_or(0)
    }

    pub fn open_windows(&self) -> usize {
        self.open_windows.load(Ordering::SeqCst)
    }
}

impl PipelineMetrics for RecordingMetrics {
    fn increment(&self, stage: Stage, counter: Counter, by: u64) {
        if let Ok(mut counts) = self.counts.lock() {
            *counts.entry((stage, counter)).or_insert(0) += by;
        }
    }

    fn set_open_windows(&self, open: usize) {
        self.open_windows.store(open, Ordering::SeqCst);
    }
}
