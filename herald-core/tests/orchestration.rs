use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;

use herald_core::adapters::{
    ChannelSubscriber, InMemoryEntityRepository, InMemoryEventBus, InMemoryMetadataSource,
    InMemorySubscriberRegistry,
};
use herald_core::dispatcher::EnsureOutcome;
use herald_core::fanout::{TickObserver, TickSummary};
use herald_core::orchestrator::Lifecycle;
use herald_core::ports::Frame;
use herald_core::types::{
    ActiveWindow, EntityHandle, EntityId, EntityStatus, EventKind, Metadata, OrchestrationEvent,
    SchedulingInfo,
};
use herald_core::{EngineConfig, HeraldRuntime, RouteOutcome};
use serde_json::{Value, json};
use tokio::sync::{Barrier, mpsc};
use tokio::time::Instant;
use tracing::field::{Field, Visit};
use tracing::{Event, Level, Subscriber};
use tracing_subscriber::layer::{Context, Layer, SubscriberExt};

struct Harness {
    runtime: HeraldRuntime,
    bus: Arc<InMemoryEventBus>,
    metadata: Arc<InMemoryMetadataSource>,
    registry: Arc<InMemorySubscriberRegistry>,
    repository: Arc<InMemoryEntityRepository>,
}

impl Harness {
    fn new(config: EngineConfig) -> Self {
        Self::with_observers(config, Vec::new())
    }

    fn with_observers(config: EngineConfig, observers: Vec<Arc<dyn TickObserver>>) -> Self {
        let bus = Arc::new(InMemoryEventBus::default());
        let metadata = Arc::new(InMemoryMetadataSource::new());
        let registry = Arc::new(InMemorySubscriberRegistry::new());
        let repository = Arc::new(InMemoryEntityRepository::new());
        let mut builder = HeraldRuntime::builder()
            .with_config(config)
            .with_event_bus(bus.clone())
            .with_metadata_source(metadata.clone())
            .with_subscriber_registry(registry.clone())
            .with_repository(repository.clone());
        for observer in observers {
            builder = builder.with_tick_observer(observer);
        }
        let runtime = builder.build().expect("runtime builds");
        Self {
            runtime,
            bus,
            metadata,
            registry,
            repository,
        }
    }

    fn campaign(&self, id: &str, metadata: Metadata) {
        self.repository
            .insert(EntityHandle::new(id, metadata.clone()));
        self.metadata.insert(id, metadata);
    }

    fn subscribe(&self, id: &str, conn: &str) -> mpsc::Receiver<Frame> {
        let (target, rx) = ChannelSubscriber::new(conn, 64);
        self.registry.attach(id, target);
        rx
    }

    fn route(&self, id: &str, kind: EventKind) -> RouteOutcome {
        self.runtime
            .dispatcher()
            .route(OrchestrationEvent::new(id, kind))
    }
}

fn with_frequency(hz: f64) -> Metadata {
    Metadata {
        scheduling: Some(SchedulingInfo {
            frequency: Some(hz),
            ..SchedulingInfo::default()
        }),
        ..Metadata::default()
    }
}

fn with_digest_job() -> Metadata {
    Metadata {
        scheduling: Some(SchedulingInfo {
            jobs: vec![herald_core::types::JobSpec::new("digest").with_cron("0 0 * * *")],
            ..SchedulingInfo::default()
        }),
        ..Metadata::default()
    }
}

/// Holds the orchestrator inside its tick for `delay`.
struct SlowObserver {
    delay: Duration,
}

#[async_trait]
impl TickObserver for SlowObserver {
    fn name(&self) -> &'static str {
        "slow"
    }

    async fn after_tick(&self, _tick: &TickSummary) -> herald_core::Result<()> {
        tokio::time::sleep(self.delay).await;
        Ok(())
    }
}

/// Collects `(target, message)` of every warning emitted while installed.
#[derive(Clone, Default)]
struct Warnings(Arc<Mutex<Vec<(String, String)>>>);

impl Warnings {
    fn contains(&self, target: &str, message: &str) -> bool {
        self.0
            .lock()
            .iter()
            .any(|(t, m)| t == target && m == message)
    }
}

#[derive(Default)]
struct MessageVisitor(String);

impl Visit for MessageVisitor {
    fn record_debug(&mut self, field: &Field, value: &dyn fmt::Debug) {
        if field.name() == "message" {
            self.0 = format!("{value:?}");
        }
    }
}

impl<S: Subscriber> Layer<S> for Warnings {
    fn on_event(&self, event: &Event<'_>, _ctx: Context<'_, S>) {
        if *event.metadata().level() != Level::WARN {
            return;
        }
        let mut message = MessageVisitor::default();
        event.record(&mut message);
        self.0
            .lock()
            .push((event.metadata().target().to_string(), message.0));
    }
}

fn decode(frame: &Frame) -> Value {
    serde_json::from_str(frame).expect("frame is json")
}

async fn eventually(mut check: impl FnMut() -> bool, within: Duration) -> bool {
    let deadline = Instant::now() + within;
    while Instant::now() < deadline {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    check()
}

#[tokio::test(start_paused = true)]
async fn ticks_without_subscribers_deliver_nothing() {
    let harness = Harness::new(EngineConfig::default());
    harness.campaign("quiet", Metadata::default());

    assert_eq!(harness.route("quiet", EventKind::Created), RouteOutcome::Created);
    tokio::time::sleep(Duration::from_millis(3_500)).await;

    let handle = harness
        .runtime
        .dispatcher()
        .handle(&EntityId::from("quiet"))
        .expect("orchestrator running");
    assert!(handle.broadcasts() >= 3, "broadcasts = {}", handle.broadcasts());
    assert_eq!(handle.delivered(), 0);

    harness.runtime.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn subscribers_receive_full_and_projected_frames() {
    let harness = Harness::new(EngineConfig::default());
    harness.campaign(
        "spring",
        Metadata {
            features: vec!["referrals".into()],
            ..Metadata::default()
        },
    );
    let mut rx = harness.subscribe("spring", "conn-1");

    harness.route("spring", EventKind::Created);
    let frame = decode(&rx.recv().await.expect("frame"));
    assert_eq!(frame["type"], "campaign_update");
    assert_eq!(frame["payload"]["campaign"]["id"], "spring");
    assert_eq!(frame["payload"]["features"], json!(["referrals"]));
    assert_eq!(frame["payload"]["subscribers"], 1);

    harness.runtime.dispatcher().route(
        OrchestrationEvent::new("spring", EventKind::Trigger)
            .with_payload(json!({ "fields": ["features"] })),
    );
    let frame = decode(&rx.recv().await.expect("frame"));
    let keys: Vec<_> = frame["payload"]
        .as_object()
        .expect("payload object")
        .keys()
        .cloned()
        .collect();
    assert_eq!(keys, vec!["features".to_string()]);

    harness.runtime.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_first_events_create_one_orchestrator() {
    let harness = Arc::new(Harness::new(EngineConfig::default()));
    harness.campaign("launch", Metadata::default());

    let barrier = Arc::new(Barrier::new(32));
    let mut tasks = Vec::new();
    for _ in 0..32 {
        let harness = Arc::clone(&harness);
        let barrier = Arc::clone(&barrier);
        tasks.push(tokio::spawn(async move {
            barrier.wait().await;
            harness.route("launch", EventKind::Trigger)
        }));
    }

    let mut created = 0;
    for task in tasks {
        if task.await.expect("route task") == RouteOutcome::Created {
            created += 1;
        }
    }
    assert_eq!(created, 1);
    assert_eq!(harness.runtime.dispatcher().creations(), 1);
    assert_eq!(harness.runtime.dispatcher().active_count(), 1);

    harness.runtime.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn frequency_change_retimes_the_ticker() {
    let harness = Harness::new(EngineConfig::default());
    harness.campaign("flash", with_frequency(1.0));
    let mut rx = harness.subscribe("flash", "conn-1");

    harness.route("flash", EventKind::Created);
    rx.recv().await.expect("creation frame");

    let first = {
        rx.recv().await.expect("tick");
        Instant::now()
    };
    rx.recv().await.expect("tick");
    assert_eq!(Instant::now() - first, Duration::from_secs(1));

    harness.metadata.update("flash", with_frequency(5.0));
    tokio::time::sleep(Duration::from_millis(300)).await;
    while rx.try_recv().is_ok() {}

    let mut stamps = Vec::new();
    for _ in 0..3 {
        rx.recv().await.expect("tick");
        stamps.push(Instant::now());
    }
    for pair in stamps.windows(2) {
        assert_eq!(pair[1] - pair[0], Duration::from_millis(200));
    }

    harness.runtime.shutdown().await;
}

#[tokio::test]
async fn full_inbox_drops_without_blocking() {
    let warnings = Warnings::default();
    let _subscriber =
        tracing::subscriber::set_default(tracing_subscriber::registry().with(warnings.clone()));
    let harness = Harness::new(EngineConfig::default());
    harness.campaign("crowded", Metadata::default());
    harness.metadata.hold();

    assert_eq!(harness.route("crowded", EventKind::Trigger), RouteOutcome::Created);
    for _ in 1..256 {
        assert_eq!(harness.route("crowded", EventKind::Trigger), RouteOutcome::Delivered);
    }
    assert!(!warnings.contains("herald::dispatch", "orchestrator inbox full; event dropped"));
    assert_eq!(harness.route("crowded", EventKind::Trigger), RouteOutcome::Dropped);
    assert!(warnings.contains("herald::dispatch", "orchestrator inbox full; event dropped"));
    assert_eq!(harness.runtime.dispatcher().creations(), 1);

    harness.metadata.release();
    harness.runtime.shutdown().await;
}

#[tokio::test]
async fn terminal_event_stops_and_cleans_up() {
    let harness = Harness::new(EngineConfig::default());
    harness.campaign("spring", with_digest_job());
    let id = EntityId::from("spring");

    harness.route("spring", EventKind::Created);
    let scheduler = harness.runtime.scheduler().clone();
    assert!(eventually(|| scheduler.jobs_for(&id).len() == 1, Duration::from_secs(2)).await);

    assert_eq!(harness.route("spring", EventKind::Deleted), RouteOutcome::Stopped);
    assert!(!harness.runtime.dispatcher().is_running(&id));
    assert!(eventually(|| scheduler.jobs_for(&id).is_empty(), Duration::from_secs(2)).await);

    let bus = Arc::clone(&harness.bus);
    assert!(
        eventually(
            || !bus.published_of("campaign.broadcast_stopped").is_empty(),
            Duration::from_secs(2)
        )
        .await
    );
    assert_eq!(harness.bus.published_of("campaign.broadcast_started").len(), 1);

    // Stopping again is a no-op.
    assert_eq!(harness.route("spring", EventKind::Deleted), RouteOutcome::Ignored);
    assert!(!harness.runtime.dispatcher().stop(&id));

    harness.runtime.shutdown().await;
}

#[tokio::test]
async fn terminal_status_and_removal_retire_the_orchestrator() {
    let harness = Harness::new(EngineConfig::default());
    harness.campaign("ending", Metadata::default());
    harness.campaign("vanishing", Metadata::default());
    let dispatcher = Arc::clone(harness.runtime.dispatcher());

    harness.route("ending", EventKind::Created);
    harness.route("vanishing", EventKind::Created);
    let ending = EntityId::from("ending");
    let vanishing = EntityId::from("vanishing");
    assert!(
        eventually(
            || dispatcher.broadcasts(&ending) >= Some(1) && dispatcher.broadcasts(&vanishing) >= Some(1),
            Duration::from_secs(2)
        )
        .await
    );
    tokio::time::sleep(Duration::from_millis(50)).await;

    harness.metadata.update(
        "ending",
        Metadata {
            status: Some("completed".into()),
            ..Metadata::default()
        },
    );
    harness.metadata.remove(&vanishing);

    assert!(eventually(|| !dispatcher.is_running(&ending), Duration::from_secs(2)).await);
    assert!(eventually(|| !dispatcher.is_running(&vanishing), Duration::from_secs(2)).await);
    assert!(eventually(|| dispatcher.active_count() == 0, Duration::from_secs(2)).await);

    harness.runtime.shutdown().await;
}

#[tokio::test]
async fn unknown_campaigns_never_start() {
    let harness = Harness::new(EngineConfig::default());
    let dispatcher = Arc::clone(harness.runtime.dispatcher());
    let ghost = EntityId::from("ghost");

    assert_eq!(harness.route("ghost", EventKind::Trigger), RouteOutcome::Created);
    assert!(eventually(|| dispatcher.active_count() == 0, Duration::from_secs(2)).await);
    assert!(harness.bus.published_of("campaign.broadcast_started").is_empty());
    assert!(!dispatcher.is_running(&ghost));

    harness.runtime.shutdown().await;
}

#[tokio::test]
async fn sweep_starts_each_live_campaign_once() {
    let harness = Harness::new(EngineConfig::default());
    harness.campaign("alpha", Metadata::default());
    harness.campaign("beta", Metadata::default());
    harness.repository.insert(
        EntityHandle::new("archived", Metadata::default()).with_status(EntityStatus::Archived),
    );
    harness.repository.insert(EntityHandle::new(
        "broken",
        Metadata {
            campaign_type: Some("mystery".into()),
            ..Metadata::default()
        },
    ));
    let past = chrono::Utc::now() - chrono::Duration::days(2);
    harness.repository.insert(
        EntityHandle::new("expired", Metadata::default())
            .with_window(ActiveWindow::new(Some(past), Some(past + chrono::Duration::days(1)))),
    );

    let report = harness
        .runtime
        .orchestrate_active(2)
        .await
        .expect("sweep succeeds");
    assert_eq!(report.discovered, 3);
    assert_eq!(report.created, 2);
    assert_eq!(report.rejected, 1);

    let again = harness
        .runtime
        .orchestrate_active(0)
        .await
        .expect("sweep succeeds");
    assert_eq!(again.already_running, 2);
    assert_eq!(again.created, 0);
    assert_eq!(harness.runtime.dispatcher().creations(), 2);

    assert_eq!(
        harness
            .runtime
            .dispatcher()
            .ensure(EntityHandle::new("alpha", Metadata::default())),
        EnsureOutcome::AlreadyRunning
    );

    harness.runtime.shutdown().await;
}

#[tokio::test]
async fn ingest_routes_bus_events() {
    let harness = Harness::new(EngineConfig::default());
    harness.campaign("spring", Metadata::default());
    harness.runtime.start().await;
    harness.runtime.spawn_ingest(Vec::new());

    let dispatcher = Arc::clone(harness.runtime.dispatcher());
    let id = EntityId::from("spring");
    // The ingest subscribes asynchronously; keep emitting until it is live.
    let bus = Arc::clone(&harness.bus);
    let started = eventually(
        || {
            bus.emit("campaign.created", &json!({ "campaign_id": "spring" }));
            bus.emit("campaign.created", &json!("not an object"));
            dispatcher.is_running(&id)
        },
        Duration::from_secs(2),
    )
    .await;
    assert!(started);
    assert_eq!(dispatcher.creations(), 1);

    harness.bus.emit("campaign.ended", &json!({ "campaign_id": "spring" }));
    assert!(eventually(|| !dispatcher.is_running(&id), Duration::from_secs(2)).await);

    harness.runtime.shutdown().await;
}

#[tokio::test]
async fn shutdown_stops_everything() {
    let harness = Harness::new(EngineConfig::default());
    for id in ["a", "b", "c"] {
        harness.campaign(id, Metadata::default());
        harness.route(id, EventKind::Created);
    }
    assert_eq!(harness.runtime.dispatcher().active_count(), 3);
    let metadata = Arc::clone(&harness.metadata);
    assert!(eventually(|| metadata.watchers() == 3, Duration::from_secs(2)).await);

    harness.runtime.shutdown().await;
    assert_eq!(harness.runtime.dispatcher().active_count(), 0);
    assert_eq!(harness.metadata.watchers(), 0);
    assert_eq!(harness.route("a", EventKind::Trigger), RouteOutcome::Rejected);
}

#[tokio::test(start_paused = true)]
async fn replacement_keeps_its_jobs_when_predecessor_tears_down_late() {
    let observer: Arc<dyn TickObserver> = Arc::new(SlowObserver {
        delay: Duration::from_secs(1),
    });
    let harness = Harness::with_observers(EngineConfig::default(), vec![observer]);
    harness.campaign("spring", with_digest_job());
    let mut rx = harness.subscribe("spring", "conn-1");
    let id = EntityId::from("spring");
    let dispatcher = Arc::clone(harness.runtime.dispatcher());
    let scheduler = harness.runtime.scheduler().clone();

    assert_eq!(harness.route("spring", EventKind::Created), RouteOutcome::Created);
    // The frame is out; the first orchestrator now sits in the slow observer.
    rx.recv().await.expect("creation frame");
    let first = scheduler.jobs_for(&id);
    assert_eq!(first.len(), 1);

    assert!(dispatcher.stop(&id));
    assert_eq!(harness.route("spring", EventKind::Trigger), RouteOutcome::Created);
    assert!(
        eventually(
            || dispatcher
                .handle(&id)
                .is_some_and(|handle| handle.lifecycle() == Lifecycle::Running),
            Duration::from_millis(500)
        )
        .await
    );

    let bus = Arc::clone(&harness.bus);
    assert!(
        eventually(
            || !bus.published_of("campaign.broadcast_stopped").is_empty(),
            Duration::from_secs(3)
        )
        .await
    );
    assert!(dispatcher.is_running(&id));
    let live = scheduler.jobs_for(&id);
    assert_eq!(live.len(), 1);
    assert_ne!(live[0].id, first[0].id);

    harness.runtime.shutdown().await;
    assert!(scheduler.jobs_for(&id).is_empty());
}

/// Parks the orchestrator in a metadata read, queues `backlog` triggers
/// behind it, releases it and returns the tick spacing that follows.
async fn tick_gap_after_backlog(config: EngineConfig, backlog: usize) -> Duration {
    let harness = Harness::new(config);
    harness.campaign("busy", with_frequency(5.0));
    let mut rx = harness.subscribe("busy", "conn-1");

    harness.route("busy", EventKind::Created);
    rx.recv().await.expect("creation frame");

    harness.metadata.hold();
    harness.route("busy", EventKind::MetadataUpdated);
    tokio::time::sleep(Duration::from_millis(50)).await;
    for _ in 0..backlog {
        assert_eq!(harness.route("busy", EventKind::Trigger), RouteOutcome::Delivered);
    }
    // Long enough for a tick to be overdue once the read returns.
    tokio::time::sleep(Duration::from_millis(500)).await;
    harness.metadata.release();

    tokio::time::sleep(Duration::from_millis(100)).await;
    while rx.try_recv().is_ok() {}

    let mut stamps = Vec::new();
    for _ in 0..3 {
        rx.recv().await.expect("tick");
        stamps.push(Instant::now());
    }
    harness.runtime.shutdown().await;
    assert_eq!(stamps[1] - stamps[0], stamps[2] - stamps[1]);
    stamps[2] - stamps[1]
}

#[tokio::test(start_paused = true)]
async fn backlog_throttles_the_broadcast_rate() {
    // 225 of 256 queued is inside the throttle band.
    let gap = tick_gap_after_backlog(EngineConfig::default(), 225).await;
    assert_eq!(gap, Duration::from_millis(250));
}

#[tokio::test(start_paused = true)]
async fn disabled_throttle_only_advises() {
    let mut config = EngineConfig::default();
    config.load.throttle_enabled = false;
    let gap = tick_gap_after_backlog(config, 225).await;
    assert_eq!(gap, Duration::from_millis(200));
}

#[tokio::test]
async fn sweep_holds_workers_through_bootstrap() {
    let harness = Harness::new(EngineConfig::default());
    for id in ["one", "two", "three"] {
        harness.campaign(id, Metadata::default());
    }
    harness.metadata.hold();

    let sweeper = Arc::clone(harness.runtime.sweeper());
    let sweep = tokio::spawn(async move { sweeper.orchestrate_active(1).await });
    let dispatcher = Arc::clone(harness.runtime.dispatcher());
    assert!(eventually(|| dispatcher.creations() == 1, Duration::from_secs(2)).await);
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(dispatcher.creations(), 1);

    harness.metadata.release();
    let report = sweep
        .await
        .expect("sweep task")
        .expect("sweep succeeds");
    assert_eq!(report.created, 3);
    assert_eq!(dispatcher.creations(), 3);

    harness.runtime.shutdown().await;
}
