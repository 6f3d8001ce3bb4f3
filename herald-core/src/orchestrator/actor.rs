use std::{
    fmt,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
};

use chrono::Utc;
use serde_json::{Value, json};
use tokio::{
    sync::{mpsc, watch},
    time::{self, Instant, Interval, MissedTickBehavior},
};
use tokio_util::{sync::CancellationToken, task::TaskTracker};
use tracing::{debug, error, info, trace, warn};

use super::rate::{LoadAction, LoadMonitor, coerce_rate, tick_period};
use super::snapshot::{Projection, Section, StateSnapshot};
use super::{Lifecycle, OrchestratorDeps, StopReason, watcher};
use crate::fanout::TickSummary;
use crate::scheduler::ScheduledJobHandle;
use crate::types::{
    ActiveWindow, AuditEvent, EntityHandle, EntityId, EntityStatus, EventKind, JobSpec,
    LeaderboardEntry, Metadata, OrchestrationEvent,
};

pub const BROADCAST_STARTED: &str = "campaign.broadcast_started";
pub const BROADCAST_STOPPED: &str = "campaign.broadcast_stopped";

/// The per-campaign actor. Created by [`super::build`], driven by
/// [`Orchestrator::run`] until it stops or retires.
pub struct Orchestrator {
    entity_id: EntityId,
    seed: Option<EntityHandle>,
    inbox: mpsc::Receiver<OrchestrationEvent>,
    stop: CancellationToken,
    tasks: TaskTracker,
    lifecycle: watch::Sender<Lifecycle>,
    broadcasts: Arc<AtomicU64>,
    delivered: Arc<AtomicU64>,
    deps: OrchestratorDeps,
    load: LoadMonitor,
    rate_tx: watch::Sender<f64>,
    rate_rx: watch::Receiver<f64>,
    rate_hz: f64,
    metadata: Arc<Metadata>,
    status: EntityStatus,
    window: ActiveWindow,
    ranking_formula: Option<String>,
    applied_jobs: Vec<JobSpec>,
    /// Registrations this actor owns on the shared scheduler. Another
    /// orchestrator of the same campaign may hold registrations of its own.
    job_handles: Vec<ScheduledJobHandle>,
    sequence: u64,
    last_active: Instant,
    started: bool,
}

impl fmt::Debug for Orchestrator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Orchestrator")
            .field("entity_id", &self.entity_id)
            .field("status", &self.status)
            .field("window", &self.window)
            .field("rate_hz", &self.rate_hz)
            .field("sequence", &self.sequence)
            .field("jobs", &self.job_handles.len())
            .field("started", &self.started)
            .finish_non_exhaustive()
    }
}

fn new_ticker(rate_hz: f64) -> Interval {
    let period = tick_period(rate_hz);
    let mut ticker = time::interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    ticker
}

impl Orchestrator {
    pub(super) fn new(
        entity_id: EntityId,
        seed: Option<EntityHandle>,
        inbox: mpsc::Receiver<OrchestrationEvent>,
        stop: CancellationToken,
        tasks: TaskTracker,
        lifecycle: watch::Sender<Lifecycle>,
        broadcasts: Arc<AtomicU64>,
        delivered: Arc<AtomicU64>,
        deps: OrchestratorDeps,
    ) -> Self {
        let rate_hz = coerce_rate(deps.config.broadcast.default_rate_hz, &deps.config.broadcast);
        let (rate_tx, rate_rx) = watch::channel(rate_hz);
        Self {
            entity_id,
            seed,
            inbox,
            stop,
            tasks,
            lifecycle,
            broadcasts,
            delivered,
            load: LoadMonitor::new(deps.config.load),
            deps,
            rate_tx,
            rate_rx,
            rate_hz,
            metadata: Arc::default(),
            status: EntityStatus::Active,
            window: ActiveWindow::unbounded(),
            ranking_formula: None,
            applied_jobs: Vec::new(),
            job_handles: Vec::new(),
            sequence: 0,
            last_active: Instant::now(),
            started: false,
        }
    }

    pub fn entity_id(&self) -> &EntityId {
        &self.entity_id
    }

    /// Runs until stopped or retired. Cleanup always happens before this
    /// returns, whichever way the actor ended.
    pub async fn run(mut self) -> StopReason {
        let reason = match self.bootstrap().await {
            Ok(()) => self.event_loop().await,
            Err(reason) => reason,
        };
        self.teardown(&reason).await;
        reason
    }

    async fn bootstrap(&mut self) -> Result<(), StopReason> {
        let stop = self.stop.clone();
        tokio::select! {
            biased;
            _ = stop.cancelled() => Err(StopReason::Requested),
            loaded = self.load_state() => loaded,
        }
    }

    async fn load_state(&mut self) -> Result<(), StopReason> {
        let handle = match self.seed.take() {
            Some(seed) => Some(seed),
            None => match self.deps.repository.find_entity(&self.entity_id).await {
                Ok(Some(handle)) => Some(handle),
                Ok(None) => return Err(StopReason::Gone),
                Err(err) => {
                    warn!(
                        target: "herald::orchestrator",
                        entity = %self.entity_id,
                        error = %err,
                        "campaign lookup failed; starting from metadata only"
                    );
                    None
                }
            },
        };
        if let Some(handle) = handle {
            self.status = handle.status;
            self.window = handle.window;
            self.ranking_formula = handle.ranking_formula;
            self.metadata = handle.metadata;
        }

        match self.deps.metadata.get(&self.entity_id).await {
            Ok(metadata) => {
                self.adopt_metadata(metadata);
            }
            Err(err) if err.is_gone() => return Err(StopReason::Gone),
            Err(err) => {
                warn!(
                    target: "herald::orchestrator",
                    entity = %self.entity_id,
                    error = %err,
                    "metadata unavailable at start; using persisted document"
                );
            }
        }

        match self.retirement() {
            Some(reason) => Err(reason),
            None => Ok(()),
        }
    }

    async fn event_loop(&mut self) -> StopReason {
        let requested = self
            .metadata
            .broadcast_frequency()
            .unwrap_or(self.deps.config.broadcast.default_rate_hz);
        self.rate_hz = coerce_rate(requested, &self.deps.config.broadcast);
        // Rate pushes made while loading are already reflected above.
        let _ = self.rate_rx.borrow_and_update();

        let (metadata_tx, mut metadata_rx) = watch::channel(Some(Arc::clone(&self.metadata)));
        let watcher_stop = self.stop.child_token();
        self.tasks.spawn(watcher::watch_metadata(
            self.entity_id.clone(),
            Arc::clone(&self.deps.metadata),
            self.rate_tx.clone(),
            metadata_tx,
            watcher_stop.clone(),
        ));

        self.reconcile_jobs();
        self.started = true;
        self.lifecycle.send_replace(Lifecycle::Running);
        self.last_active = Instant::now();
        info!(
            target: "herald::orchestrator",
            entity = %self.entity_id,
            rate_hz = self.rate_hz,
            jobs = self.job_handles.len(),
            "orchestrator started"
        );
        self.publish_audit(BROADCAST_STARTED, json!({ "rate_hz": self.rate_hz }))
            .await;

        let mut ticker = new_ticker(self.rate_hz);
        let reason = loop {
            tokio::select! {
                biased;
                _ = self.stop.cancelled() => break StopReason::Requested,
                Ok(()) = self.rate_rx.changed() => {
                    let requested = *self.rate_rx.borrow_and_update();
                    self.apply_rate(requested, &mut ticker);
                }
                Ok(()) = metadata_rx.changed() => {
                    let update = metadata_rx.borrow_and_update().clone();
                    match update {
                        Some(metadata) => self.on_metadata(metadata),
                        None => break StopReason::Gone,
                    }
                    if let Some(reason) = self.retirement() {
                        break reason;
                    }
                }
                _ = ticker.tick() => {
                    self.broadcast(&Projection::full()).await;
                    self.monitor_load();
                    if let Some(reason) = self.retirement() {
                        break reason;
                    }
                }
                Some(event) = self.inbox.recv() => {
                    if let Some(reason) = self.handle_event(event).await {
                        break reason;
                    }
                }
            }
        };

        watcher_stop.cancel();
        reason
    }

    async fn handle_event(&mut self, event: OrchestrationEvent) -> Option<StopReason> {
        debug!(
            target: "herald::orchestrator",
            entity = %self.entity_id,
            kind = %event.kind,
            "event received"
        );
        if event.kind.is_terminal() {
            return Some(StopReason::TerminalEvent(event.kind.to_string()));
        }
        if event.kind.refreshes_metadata() {
            if let Some(reason) = self.refresh_metadata(event.metadata).await {
                return Some(reason);
            }
            if let Some(reason) = self.retirement() {
                return Some(reason);
            }
        }

        match event.kind {
            EventKind::Other(kind) => {
                debug!(target: "herald::orchestrator", entity = %self.entity_id, kind = %kind, "event ignored");
            }
            _ => {
                self.last_active = Instant::now();
                self.broadcast(&Projection::from_payload(&event.payload)).await;
            }
        }
        None
    }

    /// Prefers a document carried by the event; otherwise re-reads the source.
    async fn refresh_metadata(&mut self, carried: Option<Value>) -> Option<StopReason> {
        if let Some(raw) = carried {
            match Metadata::from_value(raw) {
                Ok(metadata) => {
                    self.on_metadata(Arc::new(metadata));
                    return None;
                }
                Err(err) => {
                    warn!(
                        target: "herald::orchestrator",
                        entity = %self.entity_id,
                        error = %err,
                        "event metadata rejected; re-reading source"
                    );
                }
            }
        }

        match self.deps.metadata.get(&self.entity_id).await {
            Ok(metadata) => {
                self.on_metadata(metadata);
                None
            }
            Err(err) if err.is_gone() => Some(StopReason::Gone),
            Err(err) => {
                warn!(
                    target: "herald::orchestrator",
                    entity = %self.entity_id,
                    error = %err,
                    "metadata refresh failed; keeping previous document"
                );
                None
            }
        }
    }

    fn on_metadata(&mut self, metadata: Arc<Metadata>) {
        let jobs_changed = metadata.jobs() != self.applied_jobs.as_slice();
        if self.adopt_metadata(metadata) && jobs_changed {
            self.reconcile_jobs();
        }
    }

    /// Returns false when the document is unchanged.
    fn adopt_metadata(&mut self, metadata: Arc<Metadata>) -> bool {
        if Arc::ptr_eq(&metadata, &self.metadata) || *metadata == *self.metadata {
            return false;
        }
        if let Some(status) = metadata.status.as_deref().and_then(EntityStatus::parse) {
            self.status = status;
        }
        if let Some(scheduling) = &metadata.scheduling {
            if scheduling.start.is_some() {
                self.window.start = scheduling.start;
            }
            if scheduling.end.is_some() {
                self.window.end = scheduling.end;
            }
        }
        if let Some(hz) = metadata.broadcast_frequency() {
            self.rate_tx.send_replace(hz);
        }
        self.metadata = metadata;
        self.deps.leaderboards.invalidate(&self.entity_id);
        true
    }

    fn reconcile_jobs(&mut self) {
        self.release_jobs();
        self.applied_jobs = self.metadata.jobs().to_vec();
        for spec in &self.applied_jobs {
            match self
                .deps
                .scheduler
                .schedule_job(&self.entity_id, spec, &self.stop)
            {
                Ok(handle) => self.job_handles.push(handle),
                Err(err) => {
                    warn!(
                        target: "herald::orchestrator",
                        entity = %self.entity_id,
                        job_type = %spec.job_type,
                        error = %err,
                        "job rejected"
                    );
                }
            }
        }
    }

    fn release_jobs(&mut self) -> usize {
        let ids: Vec<_> = self.job_handles.drain(..).map(|handle| handle.id).collect();
        self.deps.scheduler.unregister(&ids)
    }

    fn apply_rate(&mut self, requested: f64, ticker: &mut Interval) {
        let rate_hz = coerce_rate(requested, &self.deps.config.broadcast);
        if (rate_hz - self.rate_hz).abs() < f64::EPSILON {
            return;
        }
        info!(
            target: "herald::orchestrator",
            entity = %self.entity_id,
            from_hz = self.rate_hz,
            to_hz = rate_hz,
            "broadcast rate changed"
        );
        self.rate_hz = rate_hz;
        *ticker = new_ticker(rate_hz);
    }

    fn monitor_load(&self) {
        let load = LoadMonitor::load(self.inbox.len(), self.inbox.max_capacity());
        match self.load.assess(load, self.rate_hz) {
            LoadAction::Nominal => {}
            LoadAction::ScaleOut => {
                warn!(
                    target: "herald::orchestrator",
                    entity = %self.entity_id,
                    load,
                    "inbox near capacity; campaign should move to another node"
                );
            }
            LoadAction::Throttle { target_hz } if self.load.throttle_enabled() => {
                warn!(
                    target: "herald::orchestrator",
                    entity = %self.entity_id,
                    load,
                    from_hz = self.rate_hz,
                    to_hz = target_hz,
                    "throttling broadcasts"
                );
                self.rate_tx.send_replace(target_hz);
            }
            LoadAction::Throttle { target_hz } => {
                info!(
                    target: "herald::orchestrator",
                    entity = %self.entity_id,
                    load,
                    advised_hz = target_hz,
                    "throttle advised"
                );
            }
        }
    }

    fn retirement(&self) -> Option<StopReason> {
        if self.status.is_terminal() {
            return Some(StopReason::TerminalStatus);
        }
        if self.window.has_ended(Utc::now()) {
            return Some(StopReason::WindowEnded);
        }
        if let Some(idle) = self.deps.config.idle_timeout()
            && self.last_active.elapsed() >= idle
        {
            return Some(StopReason::Idle);
        }
        None
    }

    async fn broadcast(&mut self, projection: &Projection) {
        let targets = match self.deps.registry.list_active(&self.entity_id).await {
            Ok(targets) => targets,
            Err(err) => {
                warn!(
                    target: "herald::orchestrator",
                    entity = %self.entity_id,
                    error = %err,
                    "subscriber lookup failed; tick skipped"
                );
                return;
            }
        };
        self.sequence += 1;
        if !targets.is_empty() || !self.job_handles.is_empty() {
            self.last_active = Instant::now();
        }
        if targets.is_empty() {
            self.broadcasts.fetch_add(1, Ordering::Relaxed);
            trace!(target: "herald::orchestrator", entity = %self.entity_id, "no subscribers");
            return;
        }

        let wants_leaderboard = projection
            .selected()
            .is_none_or(|sections| sections.contains(&Section::Leaderboard));
        let leaderboard = if wants_leaderboard {
            self.leaderboard().await
        } else {
            Arc::default()
        };

        let snapshot = StateSnapshot {
            entity_id: self.entity_id.clone(),
            status: self.status,
            sequence: self.sequence,
            features: self.metadata.features.clone(),
            leaderboard,
            extension: self.metadata.custom.clone(),
            subscribers: targets.len(),
            generated_at: Utc::now(),
        };
        let frame = match snapshot.encode(projection) {
            Ok(frame) => frame,
            Err(err) => {
                error!(
                    target: "herald::orchestrator",
                    entity = %self.entity_id,
                    error = %err,
                    "snapshot encoding failed"
                );
                return;
            }
        };

        let report = self
            .deps
            .fanout
            .deliver(&self.entity_id, frame, targets)
            .await;
        self.broadcasts.fetch_add(1, Ordering::Relaxed);
        self.delivered
            .fetch_add(report.delivered as u64, Ordering::Relaxed);

        let tick = TickSummary {
            entity_id: self.entity_id.clone(),
            sequence: self.sequence,
            report,
            generated_at: snapshot.generated_at,
        };
        self.deps.fanout.notify_observers(&tick).await;
    }

    async fn leaderboard(&self) -> Arc<Vec<LeaderboardEntry>> {
        if !self.metadata.leaderboard_enabled() {
            return Arc::default();
        }
        let formula = self
            .metadata
            .leaderboard_formula()
            .or(self.ranking_formula.as_deref());
        let limit = self
            .metadata
            .leaderboard_limit()
            .unwrap_or(self.deps.config.ranking.default_limit);
        match self
            .deps
            .leaderboards
            .leaderboard(&self.entity_id, formula, limit)
            .await
        {
            Ok(entries) => entries,
            Err(err) => {
                warn!(
                    target: "herald::orchestrator",
                    entity = %self.entity_id,
                    error = %err,
                    "leaderboard unavailable for this tick"
                );
                Arc::default()
            }
        }
    }

    async fn publish_audit(&self, kind: &'static str, payload: Value) {
        let event = AuditEvent::new(kind, self.entity_id.clone(), payload);
        let budget = self.deps.config.broadcast.observer_timeout();
        match time::timeout(budget, self.deps.bus.publish(event)).await {
            Ok(Ok(())) => {}
            Ok(Err(err)) => {
                debug!(target: "herald::orchestrator", entity = %self.entity_id, kind, error = %err, "audit publish failed");
            }
            Err(_) => {
                debug!(target: "herald::orchestrator", entity = %self.entity_id, kind, "audit publish timed out");
            }
        }
    }

    async fn teardown(&mut self, reason: &StopReason) {
        self.stop.cancel();
        self.lifecycle.send_replace(Lifecycle::Stopped);
        let removed_jobs = self.release_jobs();
        self.deps.leaderboards.invalidate(&self.entity_id);

        self.inbox.close();
        let mut discarded = 0usize;
        while self.inbox.try_recv().is_ok() {
            discarded += 1;
        }

        info!(
            target: "herald::orchestrator",
            entity = %self.entity_id,
            reason = %reason,
            broadcasts = self.broadcasts.load(Ordering::Relaxed),
            removed_jobs,
            discarded,
            "orchestrator stopped"
        );
        if self.started {
            let payload = json!({
                "reason": reason.as_str(),
                "broadcasts": self.broadcasts.load(Ordering::Relaxed),
            });
            self.publish_audit(BROADCAST_STOPPED, payload).await;
        }
    }
}
