use std::{
    fmt,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use futures::{StreamExt, stream::BoxStream};
use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::{broadcast, mpsc, watch};
use tokio_stream::wrappers::BroadcastStream;
use tracing::warn;

use crate::error::{HeraldError, Result};
use crate::ports::{
    EntityRepository, EventBus, Frame, MetadataSource, SubscriberRegistry, SubscriberTarget,
};
use crate::ranking::ColumnFormula;
use crate::types::{
    AuditEvent, BusMessage, EntityHandle, EntityId, Metadata, OrchestrationEvent, RawMetricRow,
};

/// Topic-filtered broadcast bus. Published audit events are retained for
/// inspection.
pub struct InMemoryEventBus {
    tx: broadcast::Sender<BusMessage>,
    published: Mutex<Vec<AuditEvent>>,
}

impl fmt::Debug for InMemoryEventBus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InMemoryEventBus")
            .field("subscribers", &self.tx.receiver_count())
            .field("published", &self.published.lock().len())
            .finish()
    }
}

impl Default for InMemoryEventBus {
    fn default() -> Self {
        Self::new(1024)
    }
}

impl InMemoryEventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self {
            tx,
            published: Mutex::new(Vec::new()),
        }
    }

    /// Sends a raw message. Returns the number of subscribers reached.
    pub fn emit(&self, topic: &str, payload: &Value) -> usize {
        self.tx
            .send(BusMessage::new(topic, payload.to_string()))
            .unwrap_or(0)
    }

    pub fn emit_event(&self, event: &OrchestrationEvent) -> Result<usize> {
        let body = serde_json::to_string(event)?;
        Ok(self
            .tx
            .send(BusMessage::new(event.kind.as_str(), body))
            .unwrap_or(0))
    }

    pub fn published(&self) -> Vec<AuditEvent> {
        self.published.lock().clone()
    }

    pub fn published_of(&self, kind: &str) -> Vec<AuditEvent> {
        self.published
            .lock()
            .iter()
            .filter(|event| event.kind == kind)
            .cloned()
            .collect()
    }
}

#[async_trait]
impl EventBus for InMemoryEventBus {
    async fn subscribe(&self, topics: &[String]) -> Result<BoxStream<'static, BusMessage>> {
        let topics = topics.to_vec();
        let stream = BroadcastStream::new(self.tx.subscribe()).filter_map(move |item| {
            let keep = match item {
                Ok(message) if topics.iter().any(|topic| *topic == message.topic) => Some(message),
                Ok(_) => None,
                Err(err) => {
                    warn!(target: "herald::ingest", error = %err, "in-memory bus lagged");
                    None
                }
            };
            futures::future::ready(keep)
        });
        Ok(stream.boxed())
    }

    async fn publish(&self, event: AuditEvent) -> Result<()> {
        self.published.lock().push(event);
        Ok(())
    }
}

/// Metadata documents keyed by campaign, with change notifications.
///
/// `hold` closes a gate that makes every `get` wait until `release`, which
/// lets callers freeze an orchestrator in its start-up phase.
pub struct InMemoryMetadataSource {
    documents: DashMap<EntityId, Arc<Metadata>>,
    changes: broadcast::Sender<EntityId>,
    gate: watch::Sender<bool>,
}

impl fmt::Debug for InMemoryMetadataSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InMemoryMetadataSource")
            .field("documents", &self.documents.len())
            .field("open", &*self.gate.borrow())
            .finish()
    }
}

impl Default for InMemoryMetadataSource {
    fn default() -> Self {
        let (changes, _) = broadcast::channel(256);
        let (gate, _) = watch::channel(true);
        Self {
            documents: DashMap::new(),
            changes,
            gate,
        }
    }
}

impl InMemoryMetadataSource {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stores a document without notifying watchers.
    pub fn insert(&self, entity: impl Into<EntityId>, metadata: Metadata) {
        self.documents.insert(entity.into(), Arc::new(metadata));
    }

    /// Stores a document and notifies watchers of the campaign.
    pub fn update(&self, entity: impl Into<EntityId>, metadata: Metadata) {
        let entity = entity.into();
        self.documents.insert(entity.clone(), Arc::new(metadata));
        let _ = self.changes.send(entity);
    }

    /// Forgets the campaign; watchers are notified and will find it gone.
    pub fn remove(&self, entity: &EntityId) {
        self.documents.remove(entity);
        let _ = self.changes.send(entity.clone());
    }

    pub fn hold(&self) {
        self.gate.send_replace(false);
    }

    pub fn release(&self) {
        self.gate.send_replace(true);
    }

    /// Open change subscriptions across all campaigns.
    pub fn watchers(&self) -> usize {
        self.changes.receiver_count()
    }
}

#[async_trait]
impl MetadataSource for InMemoryMetadataSource {
    async fn get(&self, entity: &EntityId) -> Result<Arc<Metadata>> {
        let mut gate = self.gate.subscribe();
        if gate.wait_for(|open| *open).await.is_err() {
            return Err(HeraldError::unavailable("metadata", "source closed"));
        }
        self.documents
            .get(entity)
            .map(|document| Arc::clone(document.value()))
            .ok_or_else(|| HeraldError::NotFound(format!("metadata for {entity}")))
    }

    async fn watch(&self, entity: &EntityId) -> Result<BoxStream<'static, ()>> {
        let entity = entity.clone();
        let stream = BroadcastStream::new(self.changes.subscribe()).filter_map(move |item| {
            // A lagged receiver still signals that something changed.
            let hit = match item {
                Ok(changed) => (changed == entity).then_some(()),
                Err(_) => Some(()),
            };
            futures::future::ready(hit)
        });
        Ok(stream.boxed())
    }
}

/// Subscriber backed by a bounded channel; a full channel drops frames.
#[derive(Debug)]
pub struct ChannelSubscriber {
    id: String,
    tx: mpsc::Sender<Frame>,
}

impl ChannelSubscriber {
    pub fn new(id: impl Into<String>, capacity: usize) -> (Arc<Self>, mpsc::Receiver<Frame>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Arc::new(Self { id: id.into(), tx }), rx)
    }
}

impl SubscriberTarget for ChannelSubscriber {
    fn id(&self) -> &str {
        &self.id
    }

    fn try_send(&self, frame: &Frame) -> bool {
        self.tx.try_send(Arc::clone(frame)).is_ok()
    }
}

#[derive(Debug, Default)]
pub struct InMemorySubscriberRegistry {
    targets: DashMap<EntityId, Vec<Arc<dyn SubscriberTarget>>>,
}

impl InMemorySubscriberRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn attach(&self, entity: impl Into<EntityId>, target: Arc<dyn SubscriberTarget>) {
        self.targets.entry(entity.into()).or_default().push(target);
    }

    /// Returns true when a target with that id was attached.
    pub fn detach(&self, entity: &EntityId, target_id: &str) -> bool {
        let Some(mut targets) = self.targets.get_mut(entity) else {
            return false;
        };
        let before = targets.len();
        targets.retain(|target| target.id() != target_id);
        before != targets.len()
    }

    pub fn count(&self, entity: &EntityId) -> usize {
        self.targets.get(entity).map_or(0, |targets| targets.len())
    }
}

#[async_trait]
impl SubscriberRegistry for InMemorySubscriberRegistry {
    async fn list_active(&self, entity: &EntityId) -> Result<Vec<Arc<dyn SubscriberTarget>>> {
        Ok(self
            .targets
            .get(entity)
            .map(|targets| targets.clone())
            .unwrap_or_default())
    }
}

/// Campaigns and participant rows held in memory.
#[derive(Debug, Default)]
pub struct InMemoryEntityRepository {
    campaigns: DashMap<EntityId, EntityHandle>,
    rows: DashMap<EntityId, Vec<RawMetricRow>>,
    row_fetches: AtomicU64,
    fetch_delay: Mutex<Option<Duration>>,
}

impl InMemoryEntityRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, handle: EntityHandle) {
        self.campaigns.insert(handle.id.clone(), handle);
    }

    pub fn remove(&self, entity: &EntityId) -> Option<EntityHandle> {
        self.campaigns.remove(entity).map(|(_, handle)| handle)
    }

    pub fn set_rows(&self, entity: impl Into<EntityId>, rows: Vec<RawMetricRow>) {
        self.rows.insert(entity.into(), rows);
    }

    /// Simulated latency for leaderboard row fetches.
    pub fn set_fetch_delay(&self, delay: Option<Duration>) {
        *self.fetch_delay.lock() = delay;
    }

    pub fn row_fetches(&self) -> u64 {
        self.row_fetches.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl EntityRepository for InMemoryEntityRepository {
    async fn list_active_within_window(&self, now: DateTime<Utc>) -> Result<Vec<EntityHandle>> {
        let mut live: Vec<EntityHandle> = self
            .campaigns
            .iter()
            .filter(|entry| entry.value().is_live(now))
            .map(|entry| entry.value().clone())
            .collect();
        live.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(live)
    }

    async fn find_entity(&self, entity: &EntityId) -> Result<Option<EntityHandle>> {
        Ok(self.campaigns.get(entity).map(|entry| entry.value().clone()))
    }

    async fn fetch_leaderboard_rows(
        &self,
        entity: &EntityId,
        order: Option<ColumnFormula>,
        limit: Option<usize>,
    ) -> Result<Vec<RawMetricRow>> {
        self.row_fetches.fetch_add(1, Ordering::Relaxed);
        let delay = *self.fetch_delay.lock();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let mut rows = self
            .rows
            .get(entity)
            .map(|rows| rows.clone())
            .unwrap_or_default();
        if let Some(order) = &order {
            rows.sort_by(|a, b| order.compare(a, b).then_with(|| a.identity.cmp(&b.identity)));
        }
        if let Some(limit) = limit {
            rows.truncate(limit);
        }
        Ok(rows)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::EventKind;
    use serde_json::json;

    #[tokio::test]
    async fn bus_filters_by_topic() {
        let bus = InMemoryEventBus::default();
        let mut stream = bus
            .subscribe(&["campaign.created".to_string()])
            .await
            .unwrap();

        bus.emit("campaign.updated", &json!({ "entity_id": "a" }));
        bus.emit_event(&OrchestrationEvent::new("b", EventKind::Created))
            .unwrap();

        let message = stream.next().await.unwrap();
        assert_eq!(message.topic, "campaign.created");
        assert!(message.payload.contains("\"b\""));
    }

    #[tokio::test]
    async fn held_metadata_waits_for_release() {
        let source = Arc::new(InMemoryMetadataSource::new());
        source.insert("spring", Metadata::default());
        source.hold();

        let reader = {
            let source = Arc::clone(&source);
            tokio::spawn(async move { source.get(&EntityId::from("spring")).await })
        };
        tokio::task::yield_now().await;
        assert!(!reader.is_finished());

        source.release();
        assert!(reader.await.unwrap().is_ok());
        assert!(
            source
                .get(&EntityId::from("autumn"))
                .await
                .unwrap_err()
                .is_gone()
        );
    }

    #[tokio::test]
    async fn column_order_is_pushed_down() {
        let repo = InMemoryEntityRepository::new();
        repo.set_rows(
            "spring",
            vec![
                RawMetricRow::new("bob").with_column("referral_count", 2i64),
                RawMetricRow::new("alice").with_column("referral_count", 5i64),
                RawMetricRow::new("carol").with_column("referral_count", 1i64),
            ],
        );
        let order = ColumnFormula::parse("referral_count DESC").unwrap();
        let rows = repo
            .fetch_leaderboard_rows(&EntityId::from("spring"), Some(order), Some(2))
            .await
            .unwrap();
        let names: Vec<_> = rows.iter().map(|row| row.identity.as_str()).collect();
        assert_eq!(names, vec!["alice", "bob"]);
        assert_eq!(repo.row_fetches(), 1);
    }
}
