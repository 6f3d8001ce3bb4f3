//! Seams to the external collaborators: event bus, metadata source,
//! subscriber registry and persistence.

use std::{fmt, sync::Arc};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::stream::BoxStream;

use crate::error::Result;
use crate::ranking::ColumnFormula;
use crate::types::{
    AuditEvent, BusMessage, EntityHandle, EntityId, Metadata, RawMetricRow,
};

/// Encoded broadcast frame, shared by every delivery attempt of one tick.
pub type Frame = Arc<str>;

#[async_trait]
pub trait EventBus: Send + Sync {
    /// Subscribes to the given topics. The stream ends when the bus closes.
    async fn subscribe(
        &self,
        topics: &[String],
    ) -> Result<BoxStream<'static, BusMessage>>;

    async fn publish(&self, event: AuditEvent) -> Result<()>;
}

#[async_trait]
pub trait MetadataSource: Send + Sync {
    /// Current snapshot. `HeraldError::NotFound` means the campaign is gone.
    async fn get(&self, entity: &EntityId) -> Result<Arc<Metadata>>;

    /// One item per change notification. Items carry no payload; callers
    /// re-read with [`MetadataSource::get`].
    async fn watch(&self, entity: &EntityId) -> Result<BoxStream<'static, ()>>;
}

/// Delivery handle owned by the external connection registry.
pub trait SubscriberTarget: Send + Sync + fmt::Debug {
    fn id(&self) -> &str;

    /// Non-blocking send. Returns false when the frame was not accepted.
    fn try_send(&self, frame: &Frame) -> bool;
}

#[async_trait]
pub trait SubscriberRegistry: Send + Sync {
    async fn list_active(
        &self,
        entity: &EntityId,
    ) -> Result<Vec<Arc<dyn SubscriberTarget>>>;
}

#[async_trait]
pub trait EntityRepository: Send + Sync {
    async fn list_active_within_window(
        &self,
        now: DateTime<Utc>,
    ) -> Result<Vec<EntityHandle>>;

    async fn find_entity(&self, entity: &EntityId) -> Result<Option<EntityHandle>>;

    /// Participant rows for ranking. `order` is an already validated column
    /// formula the store may push down; `limit` is only set together with it.
    async fn fetch_leaderboard_rows(
        &self,
        entity: &EntityId,
        order: Option<ColumnFormula>,
        limit: Option<usize>,
    ) -> Result<Vec<RawMetricRow>>;
}
