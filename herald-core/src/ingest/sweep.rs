use std::{sync::Arc, time::Duration};

use chrono::Utc;
use serde::Serialize;
use tokio::{
    sync::Semaphore,
    task::JoinSet,
    time::{self, MissedTickBehavior},
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::dispatcher::{Dispatcher, EnsureOutcome};
use crate::error::Result;
use crate::ports::EntityRepository;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    /// Campaigns returned by persistence for the current window.
    pub discovered: usize,
    pub created: usize,
    pub already_running: usize,
    /// Campaigns skipped for invalid metadata or during shutdown.
    pub rejected: usize,
}

/// Makes sure every campaign active right now has an orchestrator.
pub struct Sweeper {
    repository: Arc<dyn EntityRepository>,
    dispatcher: Arc<Dispatcher>,
}

impl std::fmt::Debug for Sweeper {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Sweeper")
            .field("dispatcher", &self.dispatcher)
            .finish_non_exhaustive()
    }
}

impl Sweeper {
    pub fn new(repository: Arc<dyn EntityRepository>, dispatcher: Arc<Dispatcher>) -> Self {
        Self {
            repository,
            dispatcher,
        }
    }

    /// Fails only when the initial listing fails. Per-campaign problems are
    /// logged and counted.
    pub async fn orchestrate_active(&self, max_workers: usize) -> Result<SweepReport> {
        let campaigns = self.repository.list_active_within_window(Utc::now()).await?;
        let mut report = SweepReport {
            discovered: campaigns.len(),
            ..SweepReport::default()
        };

        let permits = Arc::new(Semaphore::new(max_workers.max(1)));
        let mut workers = JoinSet::new();
        for campaign in campaigns {
            if let Err(err) = campaign.metadata.validate() {
                warn!(
                    target: "herald::sweep",
                    entity = %campaign.id,
                    error = %err,
                    "campaign metadata rejected"
                );
                report.rejected += 1;
                continue;
            }

            let permits = Arc::clone(&permits);
            let dispatcher = Arc::clone(&self.dispatcher);
            workers.spawn(async move {
                // The permit covers the orchestrator's bootstrap reads, not
                // only its creation.
                let _permit = permits.acquire_owned().await.ok();
                let id = campaign.id.clone();
                let outcome = dispatcher.ensure(campaign);
                if outcome == EnsureOutcome::Created
                    && let Some(handle) = dispatcher.handle(&id)
                    && !handle.started().await
                {
                    debug!(target: "herald::sweep", entity = %id, "orchestrator stopped during bootstrap");
                }
                outcome
            });
        }

        while let Some(joined) = workers.join_next().await {
            match joined {
                Ok(EnsureOutcome::Created) => report.created += 1,
                Ok(EnsureOutcome::AlreadyRunning) => report.already_running += 1,
                Ok(EnsureOutcome::Rejected) => report.rejected += 1,
                Err(err) => {
                    error!(target: "herald::sweep", error = %err, "sweep worker failed");
                    report.rejected += 1;
                }
            }
        }

        info!(
            target: "herald::sweep",
            discovered = report.discovered,
            created = report.created,
            already_running = report.already_running,
            rejected = report.rejected,
            "sweep finished"
        );
        Ok(report)
    }

    /// Sweeps immediately and then every `period` until `shutdown` fires.
    pub async fn run_every(
        &self,
        period: Duration,
        max_workers: usize,
        shutdown: CancellationToken,
    ) {
        let mut ticker = time::interval(period.max(Duration::from_secs(1)));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    if let Err(err) = self.orchestrate_active(max_workers).await {
                        warn!(target: "herald::sweep", error = %err, "sweep failed; retrying next period");
                    }
                }
            }
        }
    }
}
