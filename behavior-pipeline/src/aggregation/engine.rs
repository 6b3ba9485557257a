use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::str::FromStr;

use crate::error::PipelineError;
use crate::event::{ActionKind, KeyedAction, RawEvent};

use super::window::{TumblingWindows, WindowCount, WindowKey};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum EmitMode {
    /// One final count per window, when it closes.
    #[default]
    OnClose,
    /// The running count on every increment; closing emits nothing more.
    Continuous,
}

impl FromStr for EmitMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "on_close" => Ok(EmitMode::OnClose),
            "continuous" => Ok(EmitMode::Continuous),
            other => Err(other.to_string()),
        }
    }
}

impl fmt::Display for EmitMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EmitMode::OnClose => f.write_str("on_close"),
            EmitMode::Continuous => f.write_str("continuous"),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum IngestOutcome {
    Counted {
        key: WindowKey,
        count: u64,
        /// Set in continuous mode only.
        emitted: Option<WindowCount>,
    },
    Filtered,
}

/// In-memory tumbling-window counter.
///
/// Time only moves forward: the watermark is the highest `now` seen. A
/// window is closed once `window_end <= watermark`, and events for closed
/// windows are rejected as late.
pub struct AggregationEngine {
    windows: TumblingWindows,
    interest: HashSet<ActionKind>,
    mode: EmitMode,
    // Keyed by (window_start, entity_id) so closing walks windows oldest first.
    open: BTreeMap<(i64, String), u64>,
    watermark: i64,
}

impl AggregationEngine {
    pub fn new(
        windows: TumblingWindows,
        interest: impl IntoIterator<Item = ActionKind>,
        mode: EmitMode,
    ) -> Self {
        Self {
            windows,
            interest: interest.into_iter().collect(),
            mode,
            open: BTreeMap::new(),
            watermark: i64::MIN,
        }
    }

    pub fn mode(&self) -> EmitMode {
        self.mode
    }

    pub fn watermark(&self) -> i64 {
        self.watermark
    }

    pub fn open_windows(&self) -> usize {
        self.open.len()
    }

    /// Current count of an open window.
    pub fn count_of(&self, entity_id: &str, occurred_at: i64) -> Option<u64> {
        let start = self.windows.window_start(occurred_at);
        self.open.get(&(start, entity_id.to_string())).copied()
    }

    fn advance(&mut self, now: i64) {
        self.watermark = self.watermark.max(now);
    }

    /// Deserialize, validate, filter and count one payload.
    pub fn ingest(&mut self, payload: &[u8], now: i64) -> Result<IngestOutcome, PipelineError> {
        let action = RawEvent::from_payload(payload)?.into_keyed_action()?;
        self.ingest_action(action, now)
    }

    pub fn ingest_action(
        &mut self,
        action: KeyedAction,
        now: i64,
    ) -> Result<IngestOutcome, PipelineError> {
        self.advance(now);

        if !self.interest.contains(&action.action_kind) {
            return Ok(IngestOutcome::Filtered);
        }

        let (window_start, window_end) = self.windows.bounds(action.occurred_at);
        if window_end <= self.watermark {
            return Err(PipelineError::LateEvent {
                entity_id: action.entity_id,
                window_end,
            });
        }

        let count = self
            .open
            .entry((window_start, action.entity_id.clone()))
            .or_insert(0);
        *count += 1;
        let count = *count;

        let key = WindowKey {
            entity_id: action.entity_id,
            window_start,
            window_end,
        };
        let emitted = match self.mode {
            EmitMode::Continuous => Some(WindowCount::new(&key, count)),
            EmitMode::OnClose => None,
        };
        Ok(IngestOutcome::Counted {
            key,
            count,
            emitted,
        })
    }

    /// Close every window with `window_end <= now`. Returns the final counts
    /// to emit, oldest window first; empty in continuous mode.
    pub fn close_expired(&mut self, now: i64) -> Vec<WindowCount> {
        self.advance(now);
        let size = self.windows.size_ms();
        let watermark = self.watermark;

        let closed_before = match self
            .open
            .keys()
            .find(|(start, _)| start.saturating_add(size) > watermark)
        {
            Some(first_open) => {
                let first_open = first_open.clone();
                let still_open = self.open.split_off(&first_open);
                std::mem::replace(&mut self.open, still_open)
            }
            None => std::mem::take(&mut self.open),
        };

        match self.mode {
            EmitMode::Continuous => Vec::new(),
            EmitMode::OnClose => closed_before
                .into_iter()
                .map(|((window_start, entity_id), count)| {
                    let key = WindowKey {
                        entity_id,
                        window_start,
                        window_end: window_start + size,
                    };
                    WindowCount::new(&key, count)
                })
                .collect(),
        }
    }

    /// Discard every open window, returning how many there were.
    pub fn drain_open(&mut self) -> usize {
        let dropped = self.open.len();
        self.open.clear();
        dropped
    }
}
