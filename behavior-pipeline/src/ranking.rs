use std::sync::Arc;
use std::time::Duration;

use common_redis::{Client as RedisClient, CustomRedisError};
use serde::{Deserialize, Serialize};

/// Name of the structure holding the latest score of every entity.
pub const CURRENT: &str = "current";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RankingScope<'a> {
    Window(&'a str),
    Current,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RankingEntry {
    pub entity_id: String,
    pub score: f64,
    /// 1-based
    pub rank: u64,
}

/// Sorted-set rankings: one set per window plus `current`.
///
/// Scores overwrite, they are never summed. Ties come back in descending
/// entity id order, which is what ZREVRANGE does.
pub struct RankingStore {
    redis: Arc<dyn RedisClient + Send + Sync>,
    key_prefix: String,
    window_retention: Duration,
    current_max_entries: u64,
}

impl RankingStore {
    pub fn new(
        redis: Arc<dyn RedisClient + Send + Sync>,
        key_prefix: impl Into<String>,
        window_retention: Duration,
    ) -> Self {
        Self {
            redis,
            key_prefix: key_prefix.into(),
            window_retention,
            current_max_entries: 0,
        }
    }

    /// Trim `current` to this many entries after every update. 0 keeps everything.
    pub fn with_current_max_entries(mut self, max_entries: u64) -> Self {
        self.current_max_entries = max_entries;
        self
    }

    pub fn window_key(&self, window_label: &str) -> String {
        format!(
            "{}{}",
            self.key_prefix,
            window_label.replace(' ', "_").replace(':', "-")
        )
    }

    pub fn current_key(&self) -> String {
        format!("{}{}", self.key_prefix, CURRENT)
    }

    fn key_for(&self, scope: RankingScope<'_>) -> String {
        match scope {
            RankingScope::Window(label) => self.window_key(label),
            RankingScope::Current => self.current_key(),
        }
    }

    pub async fn update(
        &self,
        entity_id: &str,
        score: f64,
        window_label: &str,
    ) -> Result<(), CustomRedisError> {
        let window_key = self.window_key(window_label);
        self.redis
            .zadd(window_key.clone(), entity_id.to_string(), score)
            .await?;
        self.redis
            .expire(window_key, self.window_retention.as_secs().max(1))
            .await?;
        self.redis
            .zadd(self.current_key(), entity_id.to_string(), score)
            .await?;

        if self.current_max_entries > 0 {
            self.trim_current(self.current_max_entries).await?;
        }
        Ok(())
    }

    pub async fn top_n(
        &self,
        scope: RankingScope<'_>,
        n: usize,
    ) -> Result<Vec<RankingEntry>, CustomRedisError> {
        if n == 0 {
            return Ok(Vec::new());
        }
        let stop = isize::try_from(n).unwrap_or(isize::MAX) - 1;
        let entries = self
            .redis
            .zrevrange_withscores(self.key_for(scope), 0, stop)
            .await?;

        Ok(entries
            .into_iter()
            .zip(1u64..)
            .map(|((entity_id, score), rank)| RankingEntry {
                entity_id,
                score,
                rank,
            })
            .collect())
    }

    /// 1-based rank in `current`.
    pub async fn rank_of(&self, entity_id: &str) -> Result<Option<u64>, CustomRedisError> {
        let rank = self
            .redis
            .zrevrank(self.current_key(), entity_id.to_string())
            .await?;
        Ok(rank.map(|r| r + 1))
    }

    /// Score in `current`.
    pub async fn score_of(&self, entity_id: &str) -> Result<Option<f64>, CustomRedisError> {
        self.redis
            .zscore(self.current_key(), entity_id.to_string())
            .await
    }

    pub async fn window_score_of(
        &self,
        window_label: &str,
        entity_id: &str,
    ) -> Result<Option<f64>, CustomRedisError> {
        self.redis
            .zscore(self.window_key(window_label), entity_id.to_string())
            .await
    }

    pub async fn clear_window(&self, window_label: &str) -> Result<(), CustomRedisError> {
        self.redis.del(self.window_key(window_label)).await
    }

    /// Keep only the `max_entries` highest scores in `current`. Returns how many were removed.
    pub async fn trim_current(&self, max_entries: u64) -> Result<u64, CustomRedisError> {
        if max_entries == 0 {
            return Ok(0);
        }
        // Ascending ranks: drop everything below the top `max_entries`.
        let keep = isize::try_from(max_entries).unwrap_or(isize::MAX);
        self.redis
            .zremrangebyrank(self.current_key(), 0, -keep - 1)
            .await
    }
}
