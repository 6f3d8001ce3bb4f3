pub mod entity;
pub mod events;
pub mod ids;
pub mod leaderboard;
pub mod metadata;

pub use entity::{ActiveWindow, EntityHandle, EntityStatus};
pub use events::{AuditEvent, BusMessage, EventKind, OrchestrationEvent};
pub use ids::{EntityId, JobHandleId};
pub use leaderboard::{LeaderboardEntry, MetricValue, RawMetricRow};
pub use metadata::{
    CommerceInfo, CommunityInfo, JobSpec, LeaderboardSettings,
    LocalizationInfo, Metadata, SchedulingInfo,
};
