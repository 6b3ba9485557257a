//! The effect applied once per behavior event: a copy of the event, a
//! per-actor recent list, and per-day counters.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, NaiveDate, Utc};
use common_redis::{Client as RedisClient, CustomRedisError, WriteOp};
use serde::Serialize;
use tracing::warn;

use crate::clock::Clock;
use crate::error::PipelineError;
use crate::event::BehaviorEvent;

pub const BEHAVIOR_KEY_PREFIX: &str = "user_behavior:";
pub const BEHAVIOR_LIST_KEY_PREFIX: &str = "user_behavior_list:";
pub const DAILY_STATS_KEY_PREFIX: &str = "daily_stats:";

const TOTAL_COUNT_FIELD: &str = "total_count";
const ACTION_FIELD_PREFIX: &str = "action:";
const ACTOR_FIELD_PREFIX: &str = "actor:";

#[derive(Debug, Default, Clone, PartialEq, Serialize)]
pub struct DailyStats {
    pub date: String,
    pub total_count: u64,
    pub by_action: BTreeMap<String, u64>,
    pub by_actor: BTreeMap<String, u64>,
}

pub struct BehaviorStore {
    redis: Arc<dyn RedisClient + Send + Sync>,
    behavior_retention: Duration,
    stats_retention: Duration,
}

impl BehaviorStore {
    pub fn new(
        redis: Arc<dyn RedisClient + Send + Sync>,
        behavior_retention: Duration,
        stats_retention: Duration,
    ) -> Self {
        Self {
            redis,
            behavior_retention,
            stats_retention,
        }
    }

    /// Writes all three parts in one transaction, so a failure leaves none
    /// of them behind and redelivery starts clean.
    ///
    /// Not idempotent on its own: the list push and counters must run once
    /// per message, which the dedup ledger guarantees.
    pub async fn record(&self, event: &BehaviorEvent) -> Result<(), PipelineError> {
        let json = event.to_json()?;
        let behavior_secs = self.behavior_retention.as_secs().max(1);

        let ops = vec![
            WriteOp::SetEx {
                key: format!("{BEHAVIOR_KEY_PREFIX}{}", event.message_id),
                value: json.clone(),
                seconds: behavior_secs,
            },
            WriteOp::LPushExpire {
                key: format!("{BEHAVIOR_LIST_KEY_PREFIX}{}", event.actor_id),
                value: json,
                seconds: behavior_secs,
            },
            WriteOp::HIncrByExpire {
                key: daily_stats_key(&event_date(event.occurred_at)),
                increments: vec![
                    (TOTAL_COUNT_FIELD.to_string(), 1),
                    (format!("{ACTION_FIELD_PREFIX}{}", event.action_kind), 1),
                    (format!("{ACTOR_FIELD_PREFIX}{}", event.actor_id), 1),
                ],
                seconds: self.stats_retention.as_secs().max(1),
            },
        ];
        self.redis.atomic_write(ops).await?;
        Ok(())
    }

    pub async fn behavior(&self, message_id: &str) -> Result<Option<BehaviorEvent>, PipelineError> {
        match self
            .redis
            .get(format!("{BEHAVIOR_KEY_PREFIX}{message_id}"))
            .await
        {
            Ok(json) => Ok(Some(serde_json::from_str(&json)?)),
            Err(CustomRedisError::NotFound) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Newest first. Entries that no longer decode are skipped.
    pub async fn recent_behaviors(
        &self,
        actor_id: &str,
        limit: usize,
    ) -> Result<Vec<BehaviorEvent>, PipelineError> {
        if limit == 0 {
            return Ok(Vec::new());
        }
        let stop = isize::try_from(limit).unwrap_or(isize::MAX) - 1;
        let raw = self
            .redis
            .lrange(format!("{BEHAVIOR_LIST_KEY_PREFIX}{actor_id}"), 0, stop)
            .await?;

        Ok(raw
            .iter()
            .filter_map(|json| match serde_json::from_str(json) {
                Ok(event) => Some(event),
                Err(e) => {
                    warn!(actor_id, error = ?e, "skipping undecodable behavior entry");
                    None
                }
            })
            .collect())
    }

    pub async fn daily_stats(&self, date: NaiveDate) -> Result<DailyStats, PipelineError> {
        let day = date.format("%Y-%m-%d").to_string();
        let fields = self.redis.hgetall(daily_stats_key(&day)).await?;

        let mut stats = DailyStats {
            date: day,
            ..DailyStats::default()
        };
        for (field, value) in fields {
            let Ok(count) = value.parse::<u64>() else {
                warn!(field = %field, value = %value, "non-numeric daily stats field");
                continue;
            };
            if field == TOTAL_COUNT_FIELD {
                stats.total_count = count;
            } else if let Some(action) = field.strip_prefix(ACTION_FIELD_PREFIX) {
                stats.by_action.insert(action.to_string(), count);
            } else if let Some(actor) = field.strip_prefix(ACTOR_FIELD_PREFIX) {
                stats.by_actor.insert(actor.to_string(), count);
            }
        }
        Ok(stats)
    }

    pub async fn today_stats(&self, clock: &dyn Clock) -> Result<DailyStats, PipelineError> {
        let today = DateTime::<Utc>::from_timestamp_millis(clock.now_millis())
            .unwrap_or_default()
            .date_naive();
        self.daily_stats(today).await
    }
}

fn daily_stats_key(day: &str) -> String {
    format!("{DAILY_STATS_KEY_PREFIX}{day}")
}

/// UTC calendar day of an epoch-millis timestamp.
fn event_date(occurred_at: i64) -> String {
    DateTime::<Utc>::from_timestamp_millis(occurred_at)
        .unwrap_or_default()
        .format("%Y-%m-%d")
        .to_string()
}
