use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use common_redis::Client as RedisClient;
use tracing::{debug, error};

use crate::error::PipelineError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyOutcome {
    Applied,
    Skipped,
}

/// Set of message ids whose effects have been applied.
///
/// All ids live in one Redis set whose TTL is pushed out on every mark, so
/// an id disappears at the latest `retention` after the most recent mark.
/// Absence from the set does not prove an id was never seen.
pub struct DedupLedger {
    redis: Arc<dyn RedisClient + Send + Sync>,
    set_key: String,
    retention: Duration,
}

impl DedupLedger {
    pub fn new(
        redis: Arc<dyn RedisClient + Send + Sync>,
        set_key: impl Into<String>,
        retention: Duration,
    ) -> Self {
        Self {
            redis,
            set_key: set_key.into(),
            retention,
        }
    }

    pub async fn is_processed(&self, message_id: &str) -> Result<bool, PipelineError> {
        Ok(self
            .redis
            .sismember(self.set_key.clone(), message_id.to_string())
            .await?)
    }

    /// Idempotent.
    pub async fn mark_processed(&self, message_id: &str) -> Result<(), PipelineError> {
        self.redis
            .sadd_expire(
                self.set_key.clone(),
                message_id.to_string(),
                self.retention.as_secs().max(1),
            )
            .await?;
        Ok(())
    }

    /// Run `effect` unless `message_id` is already in the ledger, then mark it.
    ///
    /// A failed effect leaves the id unmarked and surfaces as `ApplyFailed`
    /// so the record is redelivered. If the effect succeeds but the mark
    /// fails, the error is returned and a redelivery applies the effect again.
    pub async fn apply_once<T, E, F, Fut>(
        &self,
        message_id: &str,
        effect: F,
    ) -> Result<ApplyOutcome, PipelineError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Into<Box<dyn std::error::Error + Send + Sync>>,
    {
        if self.is_processed(message_id).await? {
            debug!(message_id, "message already processed, skipping");
            return Ok(ApplyOutcome::Skipped);
        }

        effect()
            .await
            .map_err(|e| PipelineError::ApplyFailed {
                message_id: message_id.to_string(),
                source: e.into(),
            })?;

        if let Err(e) = self.mark_processed(message_id).await {
            error!(message_id, error = ?e, "effect applied but the ledger mark failed");
            return Err(e);
        }
        Ok(ApplyOutcome::Applied)
    }

    pub async fn processed_count(&self) -> Result<u64, PipelineError> {
        Ok(self.redis.scard(self.set_key.clone()).await?)
    }
}
