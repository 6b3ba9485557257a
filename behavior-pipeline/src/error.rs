use common_redis::CustomRedisError;
use thiserror::Error;

use crate::transport::TransportError;

type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// What the consumer loop does with the record that produced an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// Store the offset and move on. Retrying would fail the same way.
    Commit,
    /// Rewind so the transport delivers the record again.
    Redeliver,
}

#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("malformed event: {reason}")]
    MalformedEvent { reason: String },

    #[error("applying message {message_id} failed: {source}")]
    ApplyFailed {
        message_id: String,
        #[source]
        source: BoxError,
    },

    #[error("late event for entity {entity_id}: window ending at {window_end} is closed")]
    LateEvent { entity_id: String, window_end: i64 },

    #[error("timed out waiting for the cache lock on {key}")]
    LockTimeout { key: String },

    #[error("loading {key} from the source failed: {source}")]
    LoadError {
        key: String,
        #[source]
        source: BoxError,
    },

    #[error("writing {key} to the source failed: {source}")]
    SourceWrite {
        key: String,
        #[source]
        source: BoxError,
    },

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("store error: {0}")]
    Store(#[from] CustomRedisError),

    #[error("transport error: {0}")]
    Transport(#[from] TransportError),
}

impl PipelineError {
    pub fn malformed(reason: impl Into<String>) -> Self {
        PipelineError::MalformedEvent {
            reason: reason.into(),
        }
    }

    pub fn disposition(&self) -> Disposition {
        match self {
            PipelineError::MalformedEvent { .. }
            | PipelineError::LateEvent { .. }
            | PipelineError::Serialization(_) => Disposition::Commit,
            PipelineError::ApplyFailed { .. }
            | PipelineError::LockTimeout { .. }
            | PipelineError::LoadError { .. }
            | PipelineError::SourceWrite { .. }
            | PipelineError::Store(_)
            | PipelineError::Transport(_) => Disposition::Redeliver,
        }
    }

    /// Short label for metrics.
    pub fn reason(&self) -> &'static str {
        match self {
            PipelineError::MalformedEvent { .. } => "malformed",
            PipelineError::ApplyFailed { .. } => "apply_failed",
            PipelineError::LateEvent { .. } => "late",
            PipelineError::LockTimeout { .. } => "lock_timeout",
            PipelineError::LoadError { .. } => "load_error",
            PipelineError::SourceWrite { .. } => "source_write",
            PipelineError::Serialization(_) => "serialization",
            PipelineError::Store(_) => "store",
            PipelineError::Transport(_) => "transport",
        }
    }
}
