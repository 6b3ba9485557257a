use chrono::{DateTime, Utc};
use serde::Serialize;

const LABEL_TIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// Fixed-size, non-overlapping windows aligned to `epoch_ms`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TumblingWindows {
    size_ms: i64,
    epoch_ms: i64,
}

impl TumblingWindows {
    /// `size_ms` must be positive; config validation guarantees it.
    pub fn new(size_ms: i64, epoch_ms: i64) -> Self {
        Self {
            size_ms: size_ms.max(1),
            epoch_ms,
        }
    }

    pub fn size_ms(&self) -> i64 {
        self.size_ms
    }

    /// Floor division, so timestamps before the epoch land in the window
    /// that contains them rather than the one after.
    pub fn window_start(&self, occurred_at: i64) -> i64 {
        self.epoch_ms + (occurred_at - self.epoch_ms).div_euclid(self.size_ms) * self.size_ms
    }

    pub fn bounds(&self, occurred_at: i64) -> (i64, i64) {
        let start = self.window_start(occurred_at);
        (start, start + self.size_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct WindowKey {
    pub entity_id: String,
    pub window_start: i64,
    pub window_end: i64,
}

/// A count handed to the ranking store.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WindowCount {
    pub entity_id: String,
    pub count: u64,
    pub window_start: i64,
    pub window_end: i64,
    pub window_label: String,
}

impl WindowCount {
    pub fn new(key: &WindowKey, count: u64) -> Self {
        Self {
            entity_id: key.entity_id.clone(),
            count,
            window_start: key.window_start,
            window_end: key.window_end,
            window_label: window_label(key.window_start, key.window_end),
        }
    }
}

/// `"YYYY-MM-DD HH:MM:SS - YYYY-MM-DD HH:MM:SS"` in UTC.
pub fn window_label(start_ms: i64, end_ms: i64) -> String {
    format!("{} - {}", format_millis(start_ms), format_millis(end_ms))
}

fn format_millis(ms: i64) -> String {
    match DateTime::<Utc>::from_timestamp_millis(ms) {
        Some(at) => at.format(LABEL_TIME_FORMAT).to_string(),
        None => ms.to_string(),
    }
}
