//! Routes events to per-campaign orchestrators, creating each at most once.
//!
//! The map entry is the creation lock: the first event for an unknown id
//! takes the vacant entry, spawns the actor and inserts its handle before
//! the shard lock is released, so concurrent first events for the same id
//! observe exactly one creation. Actors remove their own entry on exit, but
//! only if the entry still holds their generation.

use std::{
    fmt,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};

use dashmap::{DashMap, mapref::entry::Entry};
use tokio::sync::{Mutex, mpsc};
use tokio_util::{sync::CancellationToken, task::TaskTracker};
use tracing::{debug, info, warn};

use crate::orchestrator::{self, OrchestratorDeps, OrchestratorHandle};
use crate::types::{EntityHandle, EntityId, OrchestrationEvent};

/// What happened to a routed event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteOutcome {
    /// Accepted by an already running orchestrator.
    Delivered,
    /// Accepted by an orchestrator created for this event.
    Created,
    /// The orchestrator's inbox was full; the event is lost.
    Dropped,
    /// Terminal event; the running orchestrator was told to stop.
    Stopped,
    /// Terminal event for a campaign with no orchestrator.
    Ignored,
    /// The dispatcher is shutting down.
    Rejected,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnsureOutcome {
    Created,
    AlreadyRunning,
    Rejected,
}

type Actors = DashMap<EntityId, Arc<OrchestratorHandle>>;

pub struct Dispatcher {
    actors: Arc<Actors>,
    deps: OrchestratorDeps,
    queue_tx: mpsc::Sender<OrchestrationEvent>,
    queue_rx: Mutex<Option<mpsc::Receiver<OrchestrationEvent>>>,
    tracker: TaskTracker,
    shutdown: CancellationToken,
    generation: AtomicU64,
    creations: AtomicU64,
}

impl fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Dispatcher")
            .field("active", &self.actors.len())
            .field("creations", &self.creations.load(Ordering::Relaxed))
            .field("tasks", &self.tracker.len())
            .field("shutting_down", &self.shutdown.is_cancelled())
            .finish()
    }
}

impl Dispatcher {
    pub fn new(deps: OrchestratorDeps) -> Arc<Self> {
        let (queue_tx, queue_rx) =
            mpsc::channel(deps.config.dispatcher.queue_capacity.max(1));
        Arc::new(Self {
            actors: Arc::new(DashMap::new()),
            deps,
            queue_tx,
            queue_rx: Mutex::new(Some(queue_rx)),
            tracker: TaskTracker::new(),
            shutdown: CancellationToken::new(),
            generation: AtomicU64::new(1),
            creations: AtomicU64::new(0),
        })
    }

    /// Starts the loop draining the ingest queue. Calling it twice is a no-op.
    pub async fn start(self: &Arc<Self>) {
        let Some(mut queue_rx) = self.queue_rx.lock().await.take() else {
            return;
        };
        let dispatcher = Arc::clone(self);
        self.tracker.spawn(async move {
            loop {
                tokio::select! {
                    biased;
                    _ = dispatcher.shutdown.cancelled() => break,
                    next = queue_rx.recv() => match next {
                        Some(event) => {
                            dispatcher.route(event);
                        }
                        None => break,
                    },
                }
            }
            debug!(target: "herald::dispatch", "dispatch loop finished");
        });
    }

    /// Hands an event to the dispatch loop. Never blocks: when the queue is
    /// full the event is dropped with a warning and `false` is returned.
    pub fn enqueue(&self, event: OrchestrationEvent) -> bool {
        match self.queue_tx.try_send(event) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(event)) => {
                warn!(
                    target: "herald::dispatch",
                    entity = %event.entity_id,
                    kind = %event.kind,
                    "dispatch queue full; event dropped"
                );
                false
            }
            Err(mpsc::error::TrySendError::Closed(event)) => {
                debug!(
                    target: "herald::dispatch",
                    entity = %event.entity_id,
                    "dispatch queue closed; event dropped"
                );
                false
            }
        }
    }

    /// Delivers an event to its campaign's orchestrator, creating one when
    /// none is running. Never blocks on a slow orchestrator.
    pub fn route(&self, event: OrchestrationEvent) -> RouteOutcome {
        if self.shutdown.is_cancelled() {
            return RouteOutcome::Rejected;
        }
        if event.kind.is_terminal() {
            return self.route_terminal(event);
        }

        let entity = event.entity_id.clone();
        let mut pending = event;
        // A closed inbox means the actor exited but has not yet removed its
        // entry; evict it and try once more with a fresh actor.
        for _ in 0..2 {
            let (handle, created) = self.resolve(&entity, &mut None);
            match handle.try_deliver(pending) {
                Ok(()) => {
                    return if created {
                        RouteOutcome::Created
                    } else {
                        RouteOutcome::Delivered
                    };
                }
                Err(mpsc::error::TrySendError::Full(event)) => {
                    warn!(
                        target: "herald::dispatch",
                        entity = %entity,
                        kind = %event.kind,
                        pending = handle.pending(),
                        "orchestrator inbox full; event dropped"
                    );
                    return RouteOutcome::Dropped;
                }
                Err(mpsc::error::TrySendError::Closed(event)) => {
                    let generation = handle.generation();
                    self.actors
                        .remove_if(&entity, |_, current| current.generation() == generation);
                    pending = event;
                }
            }
        }

        warn!(
            target: "herald::dispatch",
            entity = %entity,
            kind = %pending.kind,
            "orchestrator kept closing; event dropped"
        );
        RouteOutcome::Dropped
    }

    fn route_terminal(&self, event: OrchestrationEvent) -> RouteOutcome {
        match self.actors.remove(&event.entity_id) {
            Some((_, handle)) => {
                info!(
                    target: "herald::dispatch",
                    entity = %event.entity_id,
                    kind = %event.kind,
                    "terminal event; stopping orchestrator"
                );
                // Let the actor see the event when there is room; the stop
                // signal below ends it regardless.
                let _ = handle.try_deliver(event);
                handle.stop();
                RouteOutcome::Stopped
            }
            None => {
                debug!(
                    target: "herald::dispatch",
                    entity = %event.entity_id,
                    kind = %event.kind,
                    "terminal event for idle campaign"
                );
                RouteOutcome::Ignored
            }
        }
    }

    /// Starts an orchestrator for a campaign discovered by the sweep.
    pub fn ensure(&self, handle: EntityHandle) -> EnsureOutcome {
        if self.shutdown.is_cancelled() {
            return EnsureOutcome::Rejected;
        }
        let entity = handle.id.clone();
        let mut seed = Some(handle);
        for _ in 0..2 {
            let (running, created) = self.resolve(&entity, &mut seed);
            if created {
                return EnsureOutcome::Created;
            }
            if !running.is_stopped() {
                return EnsureOutcome::AlreadyRunning;
            }
            let generation = running.generation();
            self.actors
                .remove_if(&entity, |_, current| current.generation() == generation);
        }
        EnsureOutcome::AlreadyRunning
    }

    fn resolve(
        &self,
        entity: &EntityId,
        seed: &mut Option<EntityHandle>,
    ) -> (Arc<OrchestratorHandle>, bool) {
        match self.actors.entry(entity.clone()) {
            Entry::Occupied(occupied) => (Arc::clone(occupied.get()), false),
            Entry::Vacant(vacant) => {
                let handle = self.spawn(entity.clone(), seed.take());
                vacant.insert(Arc::clone(&handle));
                (handle, true)
            }
        }
    }

    fn spawn(&self, entity: EntityId, seed: Option<EntityHandle>) -> Arc<OrchestratorHandle> {
        let generation = self.generation.fetch_add(1, Ordering::Relaxed);
        let (actor, handle) = orchestrator::build(
            entity.clone(),
            seed,
            generation,
            self.shutdown.child_token(),
            self.tracker.clone(),
            self.deps.clone(),
        );
        self.creations.fetch_add(1, Ordering::Relaxed);

        let actors = Arc::clone(&self.actors);
        self.tracker.spawn(async move {
            let reason = actor.run().await;
            let evicted = actors
                .remove_if(&entity, |_, current| current.generation() == generation)
                .is_some();
            debug!(
                target: "herald::dispatch",
                entity = %entity,
                generation,
                reason = %reason,
                evicted,
                "orchestrator exited"
            );
        });

        debug!(target: "herald::dispatch", entity = %handle.entity_id(), generation, "orchestrator spawned");
        handle
    }

    /// Stops one campaign's orchestrator. Returns false when none was running.
    pub fn stop(&self, entity: &EntityId) -> bool {
        match self.actors.remove(entity) {
            Some((_, handle)) => {
                handle.stop();
                true
            }
            None => false,
        }
    }

    pub fn is_running(&self, entity: &EntityId) -> bool {
        self.actors
            .get(entity)
            .is_some_and(|handle| !handle.is_stopped())
    }

    pub fn active_count(&self) -> usize {
        self.actors.len()
    }

    pub fn active_ids(&self) -> Vec<EntityId> {
        self.actors.iter().map(|entry| entry.key().clone()).collect()
    }

    /// Orchestrators created since start.
    pub fn creations(&self) -> u64 {
        self.creations.load(Ordering::Relaxed)
    }

    /// Broadcast ticks completed by the running orchestrator of `entity`.
    pub fn broadcasts(&self, entity: &EntityId) -> Option<u64> {
        self.actors.get(entity).map(|handle| handle.broadcasts())
    }

    pub fn handle(&self, entity: &EntityId) -> Option<Arc<OrchestratorHandle>> {
        self.actors.get(entity).map(|handle| Arc::clone(handle.value()))
    }

    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Stops every orchestrator and waits up to `timeout` for them to finish
    /// cleanup. Returns true when everything finished in time.
    pub async fn shutdown(&self, timeout: Duration) -> bool {
        let active = self.actors.len();
        self.shutdown.cancel();
        self.tracker.close();
        self.actors.clear();

        let finished = tokio::time::timeout(timeout, self.tracker.wait())
            .await
            .is_ok();
        if finished {
            info!(target: "herald::dispatch", active, "dispatcher shut down");
        } else {
            warn!(
                target: "herald::dispatch",
                active,
                remaining = self.tracker.len(),
                "dispatcher shutdown timed out"
            );
        }
        finished
    }
}
