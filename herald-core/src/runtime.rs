//! Wiring for a complete engine instance.

use std::{fmt, sync::Arc, time::Duration};

use tokio_util::{sync::CancellationToken, task::TaskTracker};
use tracing::{info, warn};

use crate::config::EngineConfig;
use crate::dispatcher::Dispatcher;
use crate::error::{HeraldError, Result};
use crate::fanout::{AuditTickObserver, BroadcastFanout, TickObserver};
use crate::ingest::{EventIngest, SweepReport, Sweeper};
use crate::orchestrator::OrchestratorDeps;
use crate::ports::{EntityRepository, EventBus, MetadataSource, SubscriberRegistry};
use crate::ranking::{LeaderboardService, validate_formula};
use crate::scheduler::{AuditJobHandler, CronScheduler, JobHandler, JobRegistry};

#[derive(Default)]
pub struct HeraldRuntimeBuilder {
    config: EngineConfig,
    bus: Option<Arc<dyn EventBus>>,
    metadata: Option<Arc<dyn MetadataSource>>,
    registry: Option<Arc<dyn SubscriberRegistry>>,
    repository: Option<Arc<dyn EntityRepository>>,
    jobs: JobRegistry,
    fallback: Option<Arc<dyn JobHandler>>,
    observers: Vec<Arc<dyn TickObserver>>,
}

impl fmt::Debug for HeraldRuntimeBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HeraldRuntimeBuilder")
            .field("config", &self.config)
            .field("bus", &self.bus.is_some())
            .field("metadata", &self.metadata.is_some())
            .field("registry", &self.registry.is_some())
            .field("repository", &self.repository.is_some())
            .field("jobs", &self.jobs)
            .field("observers", &self.observers.len())
            .finish()
    }
}

impl HeraldRuntimeBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_event_bus(mut self, bus: Arc<dyn EventBus>) -> Self {
        self.bus = Some(bus);
        self
    }

    pub fn with_metadata_source(mut self, metadata: Arc<dyn MetadataSource>) -> Self {
        self.metadata = Some(metadata);
        self
    }

    pub fn with_subscriber_registry(mut self, registry: Arc<dyn SubscriberRegistry>) -> Self {
        self.registry = Some(registry);
        self
    }

    pub fn with_repository(mut self, repository: Arc<dyn EntityRepository>) -> Self {
        self.repository = Some(repository);
        self
    }

    pub fn with_job_handler(
        mut self,
        job_type: impl Into<String>,
        handler: Arc<dyn JobHandler>,
    ) -> Self {
        self.jobs.register(job_type, handler);
        self
    }

    /// Replaces the default fallback, which publishes `campaign.job_executed`.
    pub fn with_fallback_job_handler(mut self, handler: Arc<dyn JobHandler>) -> Self {
        self.fallback = Some(handler);
        self
    }

    pub fn with_tick_observer(mut self, observer: Arc<dyn TickObserver>) -> Self {
        self.observers.push(observer);
        self
    }

    pub fn build(self) -> Result<HeraldRuntime> {
        let bus = self.bus.ok_or_else(|| missing("event bus"))?;
        let metadata = self.metadata.ok_or_else(|| missing("metadata source"))?;
        let registry = self.registry.ok_or_else(|| missing("subscriber registry"))?;
        let repository = self.repository.ok_or_else(|| missing("entity repository"))?;
        let config = Arc::new(self.config);
        validate_formula(&config.ranking.default_formula)?;

        let mut jobs = self.jobs;
        let fallback = self
            .fallback
            .unwrap_or_else(|| Arc::new(AuditJobHandler::new(Arc::clone(&bus))));
        jobs.set_fallback(fallback);
        let scheduler = CronScheduler::new(jobs);

        let leaderboards = Arc::new(LeaderboardService::new(
            Arc::clone(&repository),
            config.ranking.cache_ttl(),
            config.ranking.default_formula.clone(),
        ));

        let mut fanout = BroadcastFanout::new(
            config.broadcast.batch_size,
            config.broadcast.observer_timeout(),
        );
        if config.broadcast.audit_ticks {
            fanout = fanout.with_observer(Arc::new(AuditTickObserver::new(Arc::clone(&bus))));
        }
        for observer in self.observers {
            fanout = fanout.with_observer(observer);
        }

        let deps = OrchestratorDeps {
            bus: Arc::clone(&bus),
            metadata,
            registry,
            repository: Arc::clone(&repository),
            scheduler: scheduler.clone(),
            leaderboards: Arc::clone(&leaderboards),
            fanout: Arc::new(fanout),
            config: Arc::clone(&config),
        };
        let dispatcher = Dispatcher::new(deps);
        let sweeper = Arc::new(Sweeper::new(repository, Arc::clone(&dispatcher)));

        Ok(HeraldRuntime {
            config,
            bus,
            dispatcher,
            scheduler,
            leaderboards,
            sweeper,
            shutdown: CancellationToken::new(),
            tasks: TaskTracker::new(),
        })
    }
}

fn missing(what: &str) -> HeraldError {
    HeraldError::Validation(format!("runtime is missing its {what}"))
}

/// A running engine: dispatcher, shared scheduler, leaderboard service and
/// background ingest/sweep tasks.
pub struct HeraldRuntime {
    config: Arc<EngineConfig>,
    bus: Arc<dyn EventBus>,
    dispatcher: Arc<Dispatcher>,
    scheduler: CronScheduler,
    leaderboards: Arc<LeaderboardService>,
    sweeper: Arc<Sweeper>,
    shutdown: CancellationToken,
    tasks: TaskTracker,
}

impl fmt::Debug for HeraldRuntime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HeraldRuntime")
            .field("dispatcher", &self.dispatcher)
            .field("scheduler", &self.scheduler)
            .field("leaderboards", &self.leaderboards)
            .field("tasks", &self.tasks.len())
            .finish_non_exhaustive()
    }
}

impl HeraldRuntime {
    pub fn builder() -> HeraldRuntimeBuilder {
        HeraldRuntimeBuilder::new()
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn dispatcher(&self) -> &Arc<Dispatcher> {
        &self.dispatcher
    }

    pub fn scheduler(&self) -> &CronScheduler {
        &self.scheduler
    }

    pub fn leaderboards(&self) -> &Arc<LeaderboardService> {
        &self.leaderboards
    }

    pub fn sweeper(&self) -> &Arc<Sweeper> {
        &self.sweeper
    }

    /// Starts the dispatch loop. Events routed with
    /// [`Dispatcher::route`] work without it; queued events need it.
    pub async fn start(&self) {
        self.dispatcher.start().await;
    }

    /// One sweep of all campaigns active now.
    pub async fn orchestrate_active(&self, max_workers: usize) -> Result<SweepReport> {
        self.sweeper.orchestrate_active(max_workers).await
    }

    /// Consumes lifecycle events in the background. An empty topic list
    /// means the default lifecycle topics.
    pub fn spawn_ingest(&self, topics: Vec<String>) {
        let ingest = EventIngest::new(Arc::clone(&self.bus), Arc::clone(&self.dispatcher))
            .with_topics(topics);
        let shutdown = self.shutdown.child_token();
        self.tasks.spawn(async move {
            if let Err(err) = ingest.run(shutdown).await {
                warn!(target: "herald::ingest", error = %err, "event ingest could not start");
            }
        });
    }

    /// Re-sweeps on the configured interval in the background.
    pub fn spawn_sweeps(&self) {
        let sweeper = Arc::clone(&self.sweeper);
        let period = self.config.sweep.interval();
        let max_workers = self.config.sweep.max_workers;
        let shutdown = self.shutdown.child_token();
        self.tasks.spawn(async move {
            sweeper.run_every(period, max_workers, shutdown).await;
        });
    }

    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Stops background tasks, every orchestrator and the scheduler.
    pub async fn shutdown(&self) {
        let timeout = self.config.shutdown_timeout();
        self.shutdown.cancel();
        self.tasks.close();

        let clean = self.dispatcher.shutdown(timeout).await;
        self.scheduler.shutdown();
        let tasks_done = tokio::time::timeout(Duration::from_secs(1).min(timeout), self.tasks.wait())
            .await
            .is_ok();

        info!(
            target: "herald::dispatch",
            clean,
            tasks_done,
            "runtime stopped"
        );
    }
}
