//! Process-wide cron scheduler shared by every campaign.
//!
//! One driver task, started on the first registration, sleeps until the
//! earliest due entry and spawns each firing into a `JoinSet`, so a job that
//! errors or panics is reported and forgotten without touching the driver or
//! anyone else's jobs. Registration and removal go through a single mutex;
//! firings run outside it.
//!
//! A registration never overlaps itself: while one firing is still running,
//! later due times of the same registration are skipped.

mod jobs;

pub use jobs::{AuditJobHandler, JobContext, JobHandler, JobRegistry};

use std::{
    collections::HashMap,
    fmt,
    str::FromStr,
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicU64, Ordering},
    },
    time::Duration,
};

use chrono::{DateTime, Utc};
use cron::Schedule;
use parking_lot::Mutex;
use serde_json::{Map, Value};
use tokio::{sync::Notify, task::JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::error::{HeraldError, Result};
use crate::types::{EntityId, JobHandleId, JobSpec};

/// Once daily at midnight.
pub const DEFAULT_CRON: &str = "0 0 * * *";

const IDLE_PARK: Duration = Duration::from_secs(60);

/// Parses a cron expression, accepting the classic 5-field form by pinning
/// seconds to zero. Returns the expression as written alongside the schedule.
pub fn parse_cron(raw: Option<&str>) -> Result<(String, Schedule)> {
    let raw = raw
        .map(str::trim)
        .filter(|expr| !expr.is_empty())
        .unwrap_or(DEFAULT_CRON);

    let normalized = match raw.split_whitespace().count() {
        5 => format!("0 {raw}"),
        6 | 7 => raw.to_string(),
        _ => {
            return Err(HeraldError::JobSpec(format!(
                "cron expression must have 5, 6 or 7 fields: {raw}"
            )));
        }
    };

    let schedule = Schedule::from_str(&normalized).map_err(|err| {
        HeraldError::JobSpec(format!("invalid cron expression {raw}: {err}"))
    })?;
    Ok((raw.to_string(), schedule))
}

/// A live registration on the shared scheduler.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScheduledJobHandle {
    pub entity_id: EntityId,
    pub id: JobHandleId,
    pub cron: String,
    pub job_type: String,
}

struct Entry {
    handle: ScheduledJobHandle,
    schedule: Schedule,
    params: Map<String, Value>,
    handler: Arc<dyn JobHandler>,
    next_fire: DateTime<Utc>,
    cancel: CancellationToken,
    in_flight: Arc<AtomicBool>,
}

/// Marks a registration busy for as long as its firing lives. Dropped on
/// completion, cancellation, abort or panic alike.
struct InFlight(Arc<AtomicBool>);

impl InFlight {
    fn claim(flag: &Arc<AtomicBool>) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| Self(Arc::clone(flag)))
    }
}

impl Drop for InFlight {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

#[derive(Default)]
struct State {
    entries: HashMap<JobHandleId, Entry>,
    by_entity: HashMap<EntityId, Vec<JobHandleId>>,
}

impl State {
    fn remove(&mut self, id: JobHandleId) -> Option<Entry> {
        let entry = self.entries.remove(&id)?;
        if let Some(ids) = self.by_entity.get_mut(&entry.handle.entity_id) {
            ids.retain(|candidate| *candidate != id);
            if ids.is_empty() {
                self.by_entity.remove(&entry.handle.entity_id);
            }
        }
        Some(entry)
    }
}

struct Firing {
    ctx: JobContext,
    handler: Arc<dyn JobHandler>,
    cancel: CancellationToken,
    _in_flight: InFlight,
}

struct Inner {
    state: Mutex<State>,
    registry: JobRegistry,
    wake: Notify,
    shutdown: CancellationToken,
    driver_started: AtomicBool,
    next_id: AtomicU64,
    fired: AtomicU64,
    skipped: AtomicU64,
}

#[derive(Clone)]
pub struct CronScheduler {
    inner: Arc<Inner>,
}

impl fmt::Debug for CronScheduler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.inner.state.lock();
        f.debug_struct("CronScheduler")
            .field("registry", &self.inner.registry)
            .field("entries", &state.entries.len())
            .field("entities", &state.by_entity.len())
            .field(
                "driver_started",
                &self.inner.driver_started.load(Ordering::Relaxed),
            )
            .field("fired", &self.inner.fired.load(Ordering::Relaxed))
            .field("skipped", &self.inner.skipped.load(Ordering::Relaxed))
            .finish()
    }
}

impl CronScheduler {
    pub fn new(registry: JobRegistry) -> Self {
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(State::default()),
                registry,
                wake: Notify::new(),
                shutdown: CancellationToken::new(),
                driver_started: AtomicBool::new(false),
                next_id: AtomicU64::new(1),
                fired: AtomicU64::new(0),
                skipped: AtomicU64::new(0),
            }),
        }
    }

    /// Registers a recurring job for `entity`.
    ///
    /// The registration is bound to a child of `owner`, so cancelling the
    /// owning orchestrator's stop token silences the job immediately, even
    /// before it is unregistered. Must be called from
    /// within a Tokio runtime.
    pub fn schedule_job(
        &self,
        entity: &EntityId,
        spec: &JobSpec,
        owner: &CancellationToken,
    ) -> Result<ScheduledJobHandle> {
        let job_type = spec.job_type.trim();
        if job_type.is_empty() {
            return Err(HeraldError::JobSpec(
                "job type must be a non-empty string".into(),
            ));
        }
        let (cron, schedule) = parse_cron(spec.cron.as_deref())?;
        let handler = self.inner.registry.resolve(job_type).ok_or_else(|| {
            HeraldError::JobSpec(format!(
                "no handler registered for job type {job_type}"
            ))
        })?;
        if self.inner.shutdown.is_cancelled() {
            return Err(HeraldError::Internal("scheduler is shut down".into()));
        }
        let next_fire = schedule.after(&Utc::now()).next().ok_or_else(|| {
            HeraldError::JobSpec(format!("cron expression {cron} never fires"))
        })?;

        let handle = ScheduledJobHandle {
            entity_id: entity.clone(),
            id: JobHandleId(self.inner.next_id.fetch_add(1, Ordering::Relaxed)),
            cron,
            job_type: job_type.to_string(),
        };

        {
            let mut state = self.inner.state.lock();
            state
                .by_entity
                .entry(entity.clone())
                .or_default()
                .push(handle.id);
            state.entries.insert(
                handle.id,
                Entry {
                    handle: handle.clone(),
                    schedule,
                    params: spec.params.clone(),
                    handler,
                    next_fire,
                    cancel: owner.child_token(),
                    in_flight: Arc::new(AtomicBool::new(false)),
                },
            );
        }

        self.ensure_driver();
        self.inner.wake.notify_one();

        info!(
            target: "herald::scheduler",
            entity = %entity,
            handle = %handle.id,
            job_type = %handle.job_type,
            cron = %handle.cron,
            next_fire = %next_fire,
            "job scheduled"
        );
        Ok(handle)
    }

    /// Unregisters every job of `entity`, whoever registered it. Returns how
    /// many were removed; zero when the entity had none.
    pub fn stop_jobs(&self, entity: &EntityId) -> usize {
        let removed: Vec<Entry> = {
            let mut state = self.inner.state.lock();
            let ids = state.by_entity.remove(entity).unwrap_or_default();
            ids.into_iter()
                .filter_map(|id| state.entries.remove(&id))
                .collect()
        };

        for entry in &removed {
            entry.cancel.cancel();
        }
        if !removed.is_empty() {
            info!(
                target: "herald::scheduler",
                entity = %entity,
                removed = removed.len(),
                "jobs stopped"
            );
        }
        removed.len()
    }

    /// Unregisters exactly the given registrations, leaving any other job of
    /// the same entity in place. Ids that are already gone are ignored.
    pub fn unregister(&self, ids: &[JobHandleId]) -> usize {
        let removed: Vec<Entry> = {
            let mut state = self.inner.state.lock();
            ids.iter().filter_map(|id| state.remove(*id)).collect()
        };
        for entry in &removed {
            entry.cancel.cancel();
        }
        if !removed.is_empty() {
            debug!(
                target: "herald::scheduler",
                removed = removed.len(),
                "registrations removed"
            );
        }
        removed.len()
    }

    pub fn jobs_for(&self, entity: &EntityId) -> Vec<ScheduledJobHandle> {
        let state = self.inner.state.lock();
        state
            .by_entity
            .get(entity)
            .map(|ids| {
                ids.iter()
                    .filter_map(|id| state.entries.get(id))
                    .map(|entry| entry.handle.clone())
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn job_count(&self) -> usize {
        self.inner.state.lock().entries.len()
    }

    /// Firings that reached their handler.
    pub fn fired(&self) -> u64 {
        self.inner.fired.load(Ordering::Relaxed)
    }

    /// Due times passed over because the previous firing was still running.
    pub fn skipped(&self) -> u64 {
        self.inner.skipped.load(Ordering::Relaxed)
    }

    pub fn shutdown(&self) {
        self.inner.shutdown.cancel();
        let mut state = self.inner.state.lock();
        for entry in state.entries.values() {
            entry.cancel.cancel();
        }
        state.entries.clear();
        state.by_entity.clear();
    }

    fn ensure_driver(&self) {
        if !self.inner.driver_started.swap(true, Ordering::AcqRel) {
            let inner = Arc::clone(&self.inner);
            tokio::spawn(drive(inner));
        }
    }
}

impl Inner {
    fn next_due(&self) -> Option<DateTime<Utc>> {
        let state = self.state.lock();
        state.entries.values().map(|entry| entry.next_fire).min()
    }

    /// Collects due firings and advances their schedules. Cancelled and
    /// exhausted entries are dropped on the way.
    fn take_due(&self, now: DateTime<Utc>) -> Vec<Firing> {
        let mut state = self.state.lock();
        let mut firings = Vec::new();
        let mut finished = Vec::new();

        for (id, entry) in state.entries.iter_mut() {
            if entry.cancel.is_cancelled() {
                finished.push(*id);
                continue;
            }
            if entry.next_fire > now {
                continue;
            }

            let claimed = InFlight::claim(&entry.in_flight);
            match entry.schedule.after(&now).next() {
                Some(next) => entry.next_fire = next,
                None => finished.push(*id),
            }
            let Some(claimed) = claimed else {
                self.skipped.fetch_add(1, Ordering::Relaxed);
                debug!(
                    target: "herald::scheduler",
                    entity = %entry.handle.entity_id,
                    handle = %entry.handle.id,
                    "previous firing still running; skipped"
                );
                continue;
            };

            firings.push(Firing {
                ctx: JobContext {
                    entity_id: entry.handle.entity_id.clone(),
                    handle_id: entry.handle.id,
                    job_type: entry.handle.job_type.clone(),
                    cron: entry.handle.cron.clone(),
                    params: entry.params.clone(),
                    fired_at: now,
                },
                handler: Arc::clone(&entry.handler),
                cancel: entry.cancel.clone(),
                _in_flight: claimed,
            });
        }

        for id in finished {
            state.remove(id);
        }
        firings
    }
}

type FiringResult = (EntityId, String, Option<Result<()>>);

async fn drive(inner: Arc<Inner>) {
    let mut running: JoinSet<FiringResult> = JoinSet::new();
    debug!(target: "herald::scheduler", "scheduler driver started");

    loop {
        let sleep_for = inner
            .next_due()
            .map(|due| (due - Utc::now()).to_std().unwrap_or(Duration::ZERO))
            .unwrap_or(IDLE_PARK);

        tokio::select! {
            _ = inner.shutdown.cancelled() => break,
            _ = inner.wake.notified() => {}
            _ = tokio::time::sleep(sleep_for) => {}
            Some(joined) = running.join_next(), if !running.is_empty() => {
                report(joined);
                continue;
            }
        }

        for firing in inner.take_due(Utc::now()) {
            if firing.cancel.is_cancelled() {
                continue;
            }
            inner.fired.fetch_add(1, Ordering::Relaxed);
            let Firing {
                ctx,
                handler,
                cancel,
                _in_flight: in_flight,
            } = firing;
            running.spawn(async move {
                let _in_flight = in_flight;
                let entity = ctx.entity_id.clone();
                let job_type = ctx.job_type.clone();
                let outcome = tokio::select! {
                    biased;
                    _ = cancel.cancelled() => None,
                    result = handler.run(ctx) => Some(result),
                };
                (entity, job_type, outcome)
            });
        }
    }

    running.abort_all();
    while let Some(joined) = running.join_next().await {
        if let Err(err) = joined
            && err.is_panic()
        {
            error!(target: "herald::scheduler", "job panicked during shutdown");
        }
    }
    debug!(target: "herald::scheduler", "scheduler driver stopped");
}

fn report(joined: std::result::Result<FiringResult, tokio::task::JoinError>) {
    match joined {
        Ok((entity, job_type, Some(Ok(())))) => {
            debug!(target: "herald::scheduler", entity = %entity, job_type = %job_type, "job completed");
        }
        Ok((entity, job_type, Some(Err(err)))) => {
            warn!(
                target: "herald::scheduler",
                entity = %entity,
                job_type = %job_type,
                error = %err,
                "job failed"
            );
        }
        Ok((entity, job_type, None)) => {
            debug!(target: "herald::scheduler", entity = %entity, job_type = %job_type, "job cancelled mid-run");
        }
        Err(err) if err.is_panic() => {
            error!(target: "herald::scheduler", "job panicked");
        }
        Err(_) => {}
    }
}
