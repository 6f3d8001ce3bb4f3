use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use super::EntityId;

/// Lifecycle and config-change signal routed to one campaign's actor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrchestrationEvent {
    #[serde(alias = "campaign_id", alias = "slug")]
    pub entity_id: EntityId,
    #[serde(rename = "type")]
    pub kind: EventKind,
    #[serde(default)]
    pub payload: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Value>,
}

impl OrchestrationEvent {
    pub fn new(entity_id: impl Into<EntityId>, kind: EventKind) -> Self {
        Self {
            entity_id: entity_id.into(),
            kind,
            payload: Value::Null,
            metadata: None,
        }
    }

    pub fn with_payload(mut self, payload: Value) -> Self {
        self.payload = payload;
        self
    }

    pub fn with_metadata(mut self, metadata: Value) -> Self {
        self.metadata = Some(metadata);
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum EventKind {
    Created,
    Updated,
    MetadataUpdated,
    Trigger,
    UserJoined,
    Deactivated,
    Deleted,
    Ended,
    Other(String),
}

impl EventKind {
    /// Topics the ingest subscribes to by default.
    pub const DEFAULT_TOPICS: [&'static str; 8] = [
        "campaign.created",
        "campaign.updated",
        "campaign.metadata_updated",
        "campaign.trigger",
        "user.joined",
        "campaign.deactivated",
        "campaign.deleted",
        "campaign.ended",
    ];

    pub fn as_str(&self) -> &str {
        match self {
            Self::Created => "campaign.created",
            Self::Updated => "campaign.updated",
            Self::MetadataUpdated => "campaign.metadata_updated",
            Self::Trigger => "campaign.trigger",
            Self::UserJoined => "user.joined",
            Self::Deactivated => "campaign.deactivated",
            Self::Deleted => "campaign.deleted",
            Self::Ended => "campaign.ended",
            Self::Other(raw) => raw,
        }
    }

    /// Events that stop the campaign's actor.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Deactivated | Self::Deleted | Self::Ended)
    }

    /// Events after which metadata must be re-read before broadcasting.
    pub fn refreshes_metadata(&self) -> bool {
        matches!(self, Self::Updated | Self::MetadataUpdated)
    }
}

impl From<String> for EventKind {
    fn from(raw: String) -> Self {
        match raw.as_str() {
            "campaign.created" => Self::Created,
            "campaign.updated" => Self::Updated,
            "campaign.metadata_updated" => Self::MetadataUpdated,
            "campaign.trigger" | "campaign.broadcast" => Self::Trigger,
            "user.joined" => Self::UserJoined,
            "campaign.deactivated" => Self::Deactivated,
            "campaign.deleted" => Self::Deleted,
            "campaign.ended" => Self::Ended,
            _ => Self::Other(raw),
        }
    }
}

impl From<&str> for EventKind {
    fn from(raw: &str) -> Self {
        Self::from(raw.to_string())
    }
}

impl From<EventKind> for String {
    fn from(kind: EventKind) -> Self {
        kind.as_str().to_string()
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Observability signal published back onto the bus.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEvent {
    pub id: Uuid,
    #[serde(rename = "type")]
    pub kind: String,
    pub entity_id: EntityId,
    pub occurred_at: DateTime<Utc>,
    #[serde(default)]
    pub payload: Value,
}

impl AuditEvent {
    pub fn new(kind: impl Into<String>, entity_id: EntityId, payload: Value) -> Self {
        Self {
            id: Uuid::now_v7(),
            kind: kind.into(),
            entity_id,
            occurred_at: Utc::now(),
            payload,
        }
    }
}

/// Raw message as it arrives from the bus.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BusMessage {
    pub topic: String,
    pub payload: String,
}

impl BusMessage {
    pub fn new(topic: impl Into<String>, payload: impl Into<String>) -> Self {
        Self {
            topic: topic.into(),
            payload: payload.into(),
        }
    }
}
