//! Delivery of one encoded snapshot to every subscriber of a campaign.
//!
//! Subscribers are split into fixed-size batches with one worker per batch.
//! Every send is a non-blocking `try_send`; a full or closed target loses the
//! frame and is not retried, because the next tick supersedes it. `deliver`
//! returns only after every batch finished, so ticks of one campaign never
//! overlap.

use std::{fmt, sync::Arc, time::Duration};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::json;
use tokio::task::JoinSet;
use tracing::{debug, error, trace, warn};

use crate::error::Result;
use crate::ports::{EventBus, Frame, SubscriberTarget};
use crate::types::{AuditEvent, EntityId};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct FanoutReport {
    pub attempted: usize,
    pub delivered: usize,
    pub dropped: usize,
    pub batches: usize,
}

/// What observers learn about a finished tick.
#[derive(Debug, Clone)]
pub struct TickSummary {
    pub entity_id: EntityId,
    pub sequence: u64,
    pub report: FanoutReport,
    pub generated_at: DateTime<Utc>,
}

/// Best-effort side call after delivery (metrics, audit, cache refresh).
/// Failures are logged and never fail the tick.
#[async_trait]
pub trait TickObserver: Send + Sync {
    fn name(&self) -> &'static str;

    async fn after_tick(&self, tick: &TickSummary) -> Result<()>;
}

pub struct BroadcastFanout {
    batch_size: usize,
    observer_timeout: Duration,
    observers: Vec<Arc<dyn TickObserver>>,
}

impl fmt::Debug for BroadcastFanout {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let observers: Vec<_> = self.observers.iter().map(|o| o.name()).collect();
        f.debug_struct("BroadcastFanout")
            .field("batch_size", &self.batch_size)
            .field("observer_timeout", &self.observer_timeout)
            .field("observers", &observers)
            .finish()
    }
}

impl BroadcastFanout {
    pub fn new(batch_size: usize, observer_timeout: Duration) -> Self {
        Self {
            batch_size: batch_size.max(1),
            observer_timeout,
            observers: Vec::new(),
        }
    }

    pub fn with_observer(mut self, observer: Arc<dyn TickObserver>) -> Self {
        self.observers.push(observer);
        self
    }

    pub async fn deliver(
        &self,
        entity: &EntityId,
        frame: Frame,
        targets: Vec<Arc<dyn SubscriberTarget>>,
    ) -> FanoutReport {
        let mut report = FanoutReport {
            attempted: targets.len(),
            ..FanoutReport::default()
        };
        if targets.is_empty() {
            return report;
        }

        let mut workers = JoinSet::new();
        let mut remaining = targets.into_iter();
        loop {
            let batch: Vec<_> = remaining.by_ref().take(self.batch_size).collect();
            if batch.is_empty() {
                break;
            }
            report.batches += 1;
            let frame = Arc::clone(&frame);
            workers.spawn(async move {
                let mut delivered = 0usize;
                for target in &batch {
                    if target.try_send(&frame) {
                        delivered += 1;
                    } else {
                        trace!(target: "herald::fanout", subscriber = target.id(), "frame dropped");
                    }
                }
                delivered
            });
        }

        while let Some(joined) = workers.join_next().await {
            match joined {
                Ok(delivered) => report.delivered += delivered,
                Err(err) => {
                    error!(target: "herald::fanout", entity = %entity, error = %err, "fan-out batch failed");
                }
            }
        }
        report.dropped = report.attempted - report.delivered;

        if report.dropped > 0 {
            debug!(
                target: "herald::fanout",
                entity = %entity,
                attempted = report.attempted,
                dropped = report.dropped,
                "slow or closed subscribers skipped"
            );
        }
        report
    }

    /// Runs every observer with its own timeout. Never fails.
    pub async fn notify_observers(&self, tick: &TickSummary) {
        for observer in &self.observers {
            match tokio::time::timeout(self.observer_timeout, observer.after_tick(tick)).await {
                Ok(Ok(())) => {}
                Ok(Err(err)) => {
                    warn!(
                        target: "herald::fanout",
                        entity = %tick.entity_id,
                        observer = observer.name(),
                        error = %err,
                        "tick observer failed"
                    );
                }
                Err(_) => {
                    warn!(
                        target: "herald::fanout",
                        entity = %tick.entity_id,
                        observer = observer.name(),
                        "tick observer timed out"
                    );
                }
            }
        }
    }
}

/// Publishes `campaign.broadcast_tick` for every delivered tick.
pub struct AuditTickObserver {
    bus: Arc<dyn EventBus>,
}

impl fmt::Debug for AuditTickObserver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AuditTickObserver").finish_non_exhaustive()
    }
}

impl AuditTickObserver {
    pub const EVENT_TYPE: &'static str = "campaign.broadcast_tick";

    pub fn new(bus: Arc<dyn EventBus>) -> Self {
        Self { bus }
    }
}

#[async_trait]
impl TickObserver for AuditTickObserver {
    fn name(&self) -> &'static str {
        "audit"
    }

    async fn after_tick(&self, tick: &TickSummary) -> Result<()> {
        let payload = json!({
            "sequence": tick.sequence,
            "attempted": tick.report.attempted,
            "delivered": tick.report.delivered,
            "dropped": tick.report.dropped,
            "generated_at": tick.generated_at,
        });
        self.bus
            .publish(AuditEvent::new(Self::EVENT_TYPE, tick.entity_id.clone(), payload))
            .await
    }
}
