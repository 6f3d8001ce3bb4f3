//! One actor per live campaign.
//!
//! The actor owns everything mutable about its campaign: metadata, rate,
//! ticker, job registrations and the broadcast sequence. Other components
//! talk to it through an [`OrchestratorHandle`]: a bounded inbox for events
//! and a cancellation token for stop. Rate and metadata changes arrive over
//! `watch` channels, so only the latest value is ever applied.

mod actor;
pub mod rate;
pub mod snapshot;
mod watcher;

use std::{
    fmt,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
};

use tokio::sync::{
    mpsc::{self, error::TrySendError},
    watch,
};
use tokio_util::{sync::CancellationToken, task::TaskTracker};

use crate::config::EngineConfig;
use crate::fanout::BroadcastFanout;
use crate::ports::{EntityRepository, EventBus, MetadataSource, SubscriberRegistry};
use crate::ranking::LeaderboardService;
use crate::scheduler::CronScheduler;
use crate::types::{EntityHandle, EntityId, OrchestrationEvent};

pub use actor::Orchestrator;
pub use rate::{LoadAction, LoadMonitor};
pub use snapshot::{Projection, Section, StateSnapshot};

/// Shared collaborators handed to every orchestrator.
#[derive(Clone)]
pub struct OrchestratorDeps {
    pub bus: Arc<dyn EventBus>,
    pub metadata: Arc<dyn MetadataSource>,
    pub registry: Arc<dyn SubscriberRegistry>,
    pub repository: Arc<dyn EntityRepository>,
    pub scheduler: CronScheduler,
    pub leaderboards: Arc<LeaderboardService>,
    pub fanout: Arc<BroadcastFanout>,
    pub config: Arc<EngineConfig>,
}

impl fmt::Debug for OrchestratorDeps {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OrchestratorDeps")
            .field("scheduler", &self.scheduler)
            .field("leaderboards", &self.leaderboards)
            .field("fanout", &self.fanout)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

/// Why an orchestrator exited.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StopReason {
    /// Explicit stop or runtime shutdown.
    Requested,
    /// A terminal lifecycle event was routed.
    TerminalEvent(String),
    /// Metadata or persistence moved the campaign to a terminal status.
    TerminalStatus,
    WindowEnded,
    /// Persistence or the metadata source no longer knows the campaign.
    Gone,
    Idle,
}

impl StopReason {
    pub fn as_str(&self) -> &str {
        match self {
            Self::Requested => "requested",
            Self::TerminalEvent(kind) => kind,
            Self::TerminalStatus => "terminal_status",
            Self::WindowEnded => "window_ended",
            Self::Gone => "gone",
            Self::Idle => "idle",
        }
    }
}

impl fmt::Display for StopReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Where an orchestrator is in its life.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lifecycle {
    /// Loading persisted state and metadata.
    Starting,
    Running,
    Stopped,
}

/// Everything the dispatcher keeps about a running orchestrator.
#[derive(Debug)]
pub struct OrchestratorHandle {
    entity_id: EntityId,
    generation: u64,
    inbox: mpsc::Sender<OrchestrationEvent>,
    stop: CancellationToken,
    broadcasts: Arc<AtomicU64>,
    delivered: Arc<AtomicU64>,
    lifecycle: watch::Receiver<Lifecycle>,
}

impl OrchestratorHandle {
    pub fn entity_id(&self) -> &EntityId {
        &self.entity_id
    }

    /// Distinguishes successive orchestrators of the same campaign.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Non-blocking; a full inbox hands the event back.
    pub fn try_deliver(
        &self,
        event: OrchestrationEvent,
    ) -> Result<(), TrySendError<OrchestrationEvent>> {
        self.inbox.try_send(event)
    }

    /// Idempotent.
    pub fn stop(&self) {
        self.stop.cancel();
    }

    pub fn is_stopped(&self) -> bool {
        self.stop.is_cancelled() || self.inbox.is_closed()
    }

    /// Events waiting in the inbox.
    pub fn pending(&self) -> usize {
        self.inbox.max_capacity() - self.inbox.capacity()
    }

    /// Completed broadcast ticks, including ticks with no subscribers.
    pub fn broadcasts(&self) -> u64 {
        self.broadcasts.load(Ordering::Relaxed)
    }

    /// Frames accepted by subscribers across all ticks.
    pub fn delivered(&self) -> u64 {
        self.delivered.load(Ordering::Relaxed)
    }

    pub fn lifecycle(&self) -> Lifecycle {
        *self.lifecycle.borrow()
    }

    /// Waits until bootstrap is over. True when the actor reached its loop,
    /// false when it stopped first.
    pub async fn started(&self) -> bool {
        let mut lifecycle = self.lifecycle.clone();
        match lifecycle.wait_for(|state| *state != Lifecycle::Starting).await {
            Ok(state) => *state == Lifecycle::Running,
            Err(_) => false,
        }
    }
}

/// Builds the actor and its handle. The caller decides where the actor runs;
/// helper tasks the actor starts are spawned on `tasks`.
pub fn build(
    entity_id: EntityId,
    seed: Option<EntityHandle>,
    generation: u64,
    stop: CancellationToken,
    tasks: TaskTracker,
    deps: OrchestratorDeps,
) -> (Orchestrator, Arc<OrchestratorHandle>) {
    let (tx, rx) = mpsc::channel(deps.config.dispatcher.inbox_capacity.max(1));
    let (lifecycle_tx, lifecycle_rx) = watch::channel(Lifecycle::Starting);
    let broadcasts = Arc::new(AtomicU64::new(0));
    let delivered = Arc::new(AtomicU64::new(0));
    let handle = Arc::new(OrchestratorHandle {
        entity_id: entity_id.clone(),
        generation,
        inbox: tx,
        stop: stop.clone(),
        broadcasts: Arc::clone(&broadcasts),
        delivered: Arc::clone(&delivered),
        lifecycle: lifecycle_rx,
    });
    let orchestrator = Orchestrator::new(
        entity_id,
        seed,
        rx,
        stop,
        tasks,
        lifecycle_tx,
        broadcasts,
        delivered,
        deps,
    );
    (orchestrator, handle)
}
