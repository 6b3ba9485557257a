use std::fmt;

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use uuid::Uuid;

use crate::error::PipelineError;

/// What a user did to an entity. Unknown kinds are kept verbatim so they
/// still reach the behavior store and daily stats.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ActionKind {
    View,
    Click,
    Like,
    Unlike,
    AddToCart,
    Purchase,
    Other(String),
}

impl ActionKind {
    /// Case-insensitive; never fails.
    pub fn parse(raw: &str) -> Self {
        match raw.trim().to_ascii_lowercase().as_str() {
            "view" => ActionKind::View,
            "click" => ActionKind::Click,
            "like" => ActionKind::Like,
            "unlike" => ActionKind::Unlike,
            "add_to_cart" => ActionKind::AddToCart,
            "purchase" => ActionKind::Purchase,
            _ => ActionKind::Other(raw.trim().to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            ActionKind::View => "view",
            ActionKind::Click => "click",
            ActionKind::Like => "like",
            ActionKind::Unlike => "unlike",
            ActionKind::AddToCart => "add_to_cart",
            ActionKind::Purchase => "purchase",
            ActionKind::Other(raw) => raw,
        }
    }
}

impl fmt::Display for ActionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Serialize for ActionKind {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for ActionKind {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        Ok(ActionKind::parse(&raw))
    }
}

/// A single user behavior event as it travels over the transport.
///
/// `message_id` is assigned once when the event is created and identifies the
/// logical event across redeliveries.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BehaviorEvent {
    pub entity_id: String,
    pub actor_id: String,
    pub action_kind: ActionKind,
    /// Epoch milliseconds
    pub occurred_at: i64,
    pub message_id: String,
}

impl BehaviorEvent {
    pub fn new(
        entity_id: impl Into<String>,
        actor_id: impl Into<String>,
        action_kind: ActionKind,
        occurred_at: i64,
    ) -> Self {
        Self {
            entity_id: entity_id.into(),
            actor_id: actor_id.into(),
            action_kind,
            occurred_at,
            message_id: Uuid::now_v7().to_string(),
        }
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// Decode and validate a payload carrying every field.
    pub fn from_payload(payload: &[u8]) -> Result<Self, PipelineError> {
        RawEvent::from_payload(payload)?.into_event()
    }
}

/// The fields the aggregation stage needs. Actor and message id are not required there.
#[derive(Debug, Clone, PartialEq)]
pub struct KeyedAction {
    pub entity_id: String,
    pub action_kind: ActionKind,
    pub occurred_at: i64,
}

/// Loosely typed wire shape, so validation can name the missing field
/// instead of surfacing a serde message.
#[derive(Debug, Default, Deserialize)]
pub struct RawEvent {
    entity_id: Option<String>,
    actor_id: Option<String>,
    action_kind: Option<String>,
    occurred_at: Option<i64>,
    message_id: Option<String>,
}

impl RawEvent {
    pub fn from_payload(payload: &[u8]) -> Result<Self, PipelineError> {
        if payload.is_empty() {
            return Err(PipelineError::malformed("empty payload"));
        }
        serde_json::from_slice(payload)
            .map_err(|e| PipelineError::malformed(format!("invalid json: {e}")))
    }

    pub fn into_event(mut self) -> Result<BehaviorEvent, PipelineError> {
        let actor_id = self.actor_id.take();
        let message_id = self.message_id.take();
        let keyed = self.into_keyed_action()?;
        Ok(BehaviorEvent {
            entity_id: keyed.entity_id,
            actor_id: required(actor_id, "actor_id")?,
            action_kind: keyed.action_kind,
            occurred_at: keyed.occurred_at,
            message_id: required(message_id, "message_id")?,
        })
    }

    pub fn into_keyed_action(self) -> Result<KeyedAction, PipelineError> {
        Ok(KeyedAction {
            entity_id: required(self.entity_id, "entity_id")?,
            action_kind: ActionKind::parse(&required(self.action_kind, "action_kind")?),
            occurred_at: self
                .occurred_at
                .ok_or_else(|| PipelineError::malformed("missing occurred_at"))?,
        })
    }
}

fn required(value: Option<String>, field: &str) -> Result<String, PipelineError> {
    match value {
        Some(v) if !v.trim().is_empty() => Ok(v),
        _ => Err(PipelineError::malformed(format!("missing {field}"))),
    }
}
