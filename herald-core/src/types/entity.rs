use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{EntityId, Metadata};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntityStatus {
    Active,
    Inactive,
    Scheduled,
    Completed,
    Archived,
}

impl EntityStatus {
    pub const ALL: [&'static str; 5] =
        ["active", "inactive", "scheduled", "completed", "archived"];

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "active" => Some(Self::Active),
            "inactive" => Some(Self::Inactive),
            "scheduled" => Some(Self::Scheduled),
            "completed" => Some(Self::Completed),
            "archived" => Some(Self::Archived),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Inactive => "inactive",
            Self::Scheduled => "scheduled",
            Self::Completed => "completed",
            Self::Archived => "archived",
        }
    }

    /// Statuses that end orchestration for the campaign.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Inactive | Self::Completed | Self::Archived)
    }
}

/// Campaign run window. Open bounds are unbounded.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActiveWindow {
    pub start: Option<DateTime<Utc>>,
    pub end: Option<DateTime<Utc>>,
}

impl ActiveWindow {
    pub fn new(
        start: Option<DateTime<Utc>>,
        end: Option<DateTime<Utc>>,
    ) -> Self {
        Self { start, end }
    }

    pub fn unbounded() -> Self {
        Self::default()
    }

    pub fn contains(&self, now: DateTime<Utc>) -> bool {
        self.start.is_none_or(|start| start <= now)
            && self.end.is_none_or(|end| end >= now)
    }

    pub fn has_ended(&self, now: DateTime<Utc>) -> bool {
        self.end.is_some_and(|end| end < now)
    }
}

/// Bootstrap view of a campaign as handed over by persistence. Once an
/// orchestrator exists it owns the live copy.
#[derive(Debug, Clone)]
pub struct EntityHandle {
    pub id: EntityId,
    pub status: EntityStatus,
    pub window: ActiveWindow,
    pub ranking_formula: Option<String>,
    pub metadata: Arc<Metadata>,
}

impl EntityHandle {
    pub fn new(id: impl Into<EntityId>, metadata: Metadata) -> Self {
        Self {
            id: id.into(),
            status: EntityStatus::Active,
            window: ActiveWindow::unbounded(),
            ranking_formula: None,
            metadata: Arc::new(metadata),
        }
    }

    pub fn with_window(mut self, window: ActiveWindow) -> Self {
        self.window = window;
        self
    }

    pub fn with_status(mut self, status: EntityStatus) -> Self {
        self.status = status;
        self
    }

    pub fn with_ranking_formula(mut self, formula: impl Into<String>) -> Self {
        self.ranking_formula = Some(formula.into());
        self
    }

    pub fn is_live(&self, now: DateTime<Utc>) -> bool {
        !self.status.is_terminal() && self.window.contains(now)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn window_bounds_are_inclusive() {
        let now = Utc::now();
        let window = ActiveWindow::new(Some(now), Some(now));
        assert!(window.contains(now));
        assert!(!window.has_ended(now));
        assert!(window.has_ended(now + Duration::seconds(1)));
        assert!(!window.contains(now - Duration::seconds(1)));
    }

    #[test]
    fn unbounded_window_never_ends() {
        let window = ActiveWindow::unbounded();
        assert!(window.contains(Utc::now()));
        assert!(!window.has_ended(Utc::now() + Duration::days(3650)));
    }

    #[test]
    fn terminal_status_is_not_live() {
        let handle = EntityHandle::new("spring", Metadata::default())
            .with_status(EntityStatus::Archived);
        assert!(!handle.is_live(Utc::now()));
    }
}
