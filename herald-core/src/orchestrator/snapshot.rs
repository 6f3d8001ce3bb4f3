//! Per-tick state assembled by the orchestrator and its wire encoding.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde_json::{Map, Value, json};

use crate::error::Result;
use crate::ports::Frame;
use crate::types::{EntityId, EntityStatus, LeaderboardEntry};

pub const FRAME_TYPE: &str = "campaign_update";

#[derive(Debug, Clone)]
pub struct StateSnapshot {
    pub entity_id: EntityId,
    pub status: EntityStatus,
    pub sequence: u64,
    pub features: Vec<String>,
    pub leaderboard: Arc<Vec<LeaderboardEntry>>,
    pub extension: Map<String, Value>,
    pub subscribers: usize,
    pub generated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Section {
    Campaign,
    Features,
    Leaderboard,
    Extension,
    Subscribers,
    Timestamp,
}

impl Section {
    pub const ALL: [Section; 6] = [
        Section::Campaign,
        Section::Features,
        Section::Leaderboard,
        Section::Extension,
        Section::Subscribers,
        Section::Timestamp,
    ];

    pub fn key(&self) -> &'static str {
        match self {
            Self::Campaign => "campaign",
            Self::Features => "features",
            Self::Leaderboard => "leaderboard",
            Self::Extension => "extension",
            Self::Subscribers => "subscribers",
            Self::Timestamp => "timestamp",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|section| section.key() == raw)
    }
}

/// Which sections a frame carries.
///
/// `fields` wins over `changed`. A `changed` list that covers at least
/// `threshold` of all sections falls back to the full state.
#[derive(Debug, Clone, PartialEq)]
pub struct Projection {
    fields: Vec<Section>,
    changed: Vec<Section>,
    threshold: f64,
}

impl Default for Projection {
    fn default() -> Self {
        Self::full()
    }
}

impl Projection {
    pub const DEFAULT_THRESHOLD: f64 = 0.6;

    pub fn full() -> Self {
        Self {
            fields: Vec::new(),
            changed: Vec::new(),
            threshold: Self::DEFAULT_THRESHOLD,
        }
    }

    pub fn with_fields(mut self, fields: impl IntoIterator<Item = Section>) -> Self {
        self.fields = dedup(fields);
        self
    }

    pub fn with_changed(mut self, changed: impl IntoIterator<Item = Section>) -> Self {
        self.changed = dedup(changed);
        self
    }

    /// Reads `fields` / `changed` string arrays from an event payload.
    /// Unknown section names are ignored.
    pub fn from_payload(payload: &Value) -> Self {
        let sections = |key: &str| -> Vec<Section> {
            payload
                .get(key)
                .and_then(Value::as_array)
                .map(|names| {
                    names
                        .iter()
                        .filter_map(Value::as_str)
                        .filter_map(Section::parse)
                        .collect()
                })
                .unwrap_or_default()
        };
        Self::full()
            .with_fields(sections("fields"))
            .with_changed(sections("changed"))
    }

    /// `None` means every section.
    pub fn selected(&self) -> Option<&[Section]> {
        if !self.fields.is_empty() {
            return Some(&self.fields);
        }
        if self.changed.is_empty() {
            return None;
        }
        let share = self.changed.len() as f64 / Section::ALL.len() as f64;
        if share >= self.threshold {
            None
        } else {
            Some(&self.changed)
        }
    }

    pub fn is_full(&self) -> bool {
        self.selected().is_none()
    }
}

fn dedup(sections: impl IntoIterator<Item = Section>) -> Vec<Section> {
    let mut out = Vec::new();
    for section in sections {
        if !out.contains(&section) {
            out.push(section);
        }
    }
    out
}

impl StateSnapshot {
    fn section(&self, section: Section) -> Result<Value> {
        Ok(match section {
            Section::Campaign => json!({
                "id": self.entity_id,
                "status": self.status,
                "sequence": self.sequence,
            }),
            Section::Features => json!(self.features),
            Section::Leaderboard => serde_json::to_value(self.leaderboard.as_ref())?,
            Section::Extension => Value::Object(self.extension.clone()),
            Section::Subscribers => json!(self.subscribers),
            Section::Timestamp => json!(self.generated_at),
        })
    }

    pub fn payload(&self, projection: &Projection) -> Result<Value> {
        let sections = projection.selected().unwrap_or(&Section::ALL);
        let mut payload = Map::with_capacity(sections.len());
        for section in sections {
            payload.insert(section.key().to_string(), self.section(*section)?);
        }
        Ok(Value::Object(payload))
    }

    /// Encodes once per tick; every subscriber shares the same frame.
    pub fn encode(&self, projection: &Projection) -> Result<Frame> {
        let envelope = json!({
            "type": FRAME_TYPE,
            "payload": self.payload(projection)?,
        });
        Ok(Arc::from(serde_json::to_string(&envelope)?))
    }
}
