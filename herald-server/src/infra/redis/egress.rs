use std::{fmt, sync::Arc, time::Duration};

use async_trait::async_trait;
use dashmap::{DashMap, mapref::entry::Entry};
use herald_core::{
    Result,
    ports::{Frame, SubscriberRegistry, SubscriberTarget},
    types::EntityId,
};
use redis::{AsyncCommands, aio::ConnectionManager};
use tokio::{sync::mpsc, time};
use tokio_util::{sync::CancellationToken, task::TaskTracker};
use tracing::{debug, warn};

/// Pumps with no frames for this long retire and are recreated on demand.
const PUMP_IDLE_TIMEOUT: Duration = Duration::from_secs(300);

/// Bounded hand-off from the fan-out to one campaign's egress channel.
#[derive(Debug)]
pub struct RedisEgressTarget {
    id: String,
    tx: mpsc::Sender<Frame>,
}

impl SubscriberTarget for RedisEgressTarget {
    fn id(&self) -> &str {
        &self.id
    }

    fn try_send(&self, frame: &Frame) -> bool {
        self.tx.try_send(Arc::clone(frame)).is_ok()
    }
}

/// Subscriber registry for deployments where WebSocket gateways consume
/// `{prefix}{campaign}` and hold the actual connections.
///
/// Each campaign is represented by a single target whose frames a
/// background pump publishes in order. A full buffer drops the frame at the
/// fan-out instead of stalling the orchestrator.
pub struct RedisEgressRegistry {
    conn: ConnectionManager,
    channel_prefix: String,
    buffer: usize,
    targets: Arc<DashMap<EntityId, Arc<RedisEgressTarget>>>,
    pumps: TaskTracker,
    shutdown: CancellationToken,
}

impl fmt::Debug for RedisEgressRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RedisEgressRegistry")
            .field("channel_prefix", &self.channel_prefix)
            .field("buffer", &self.buffer)
            .field("targets", &self.targets.len())
            .finish_non_exhaustive()
    }
}

impl RedisEgressRegistry {
    pub fn new(
        conn: ConnectionManager,
        channel_prefix: impl Into<String>,
        buffer: usize,
    ) -> Self {
        Self {
            conn,
            channel_prefix: channel_prefix.into(),
            buffer: buffer.max(1),
            targets: Arc::new(DashMap::new()),
            pumps: TaskTracker::new(),
            shutdown: CancellationToken::new(),
        }
    }

    pub fn active_pumps(&self) -> usize {
        self.targets.len()
    }

    /// Stops every pump after it publishes what is already buffered.
    pub async fn shutdown(&self, timeout: Duration) {
        self.shutdown.cancel();
        self.pumps.close();
        self.targets.clear();
        if time::timeout(timeout, self.pumps.wait()).await.is_err() {
            warn!(target: "herald::fanout", "egress pumps did not drain in time");
        }
    }

    fn target_for(&self, entity: &EntityId) -> Arc<RedisEgressTarget> {
        match self.targets.entry(entity.clone()) {
            Entry::Occupied(occupied) => Arc::clone(occupied.get()),
            Entry::Vacant(vacant) => {
                let channel = format!("{}{}", self.channel_prefix, entity);
                let (tx, rx) = mpsc::channel(self.buffer);
                let target = Arc::new(RedisEgressTarget {
                    id: channel.clone(),
                    tx,
                });
                vacant.insert(Arc::clone(&target));

                let pump = Pump {
                    entity: entity.clone(),
                    channel,
                    conn: self.conn.clone(),
                    targets: Arc::clone(&self.targets),
                    target: Arc::clone(&target),
                };
                self.pumps.spawn(pump.run(rx, self.shutdown.child_token()));
                target
            }
        }
    }
}

#[async_trait]
impl SubscriberRegistry for RedisEgressRegistry {
    async fn list_active(
        &self,
        entity: &EntityId,
    ) -> Result<Vec<Arc<dyn SubscriberTarget>>> {
        if self.shutdown.is_cancelled() {
            return Ok(Vec::new());
        }
        let target: Arc<dyn SubscriberTarget> = self.target_for(entity);
        Ok(vec![target])
    }
}

struct Pump {
    entity: EntityId,
    channel: String,
    conn: ConnectionManager,
    targets: Arc<DashMap<EntityId, Arc<RedisEgressTarget>>>,
    target: Arc<RedisEgressTarget>,
}

impl Pump {
    async fn run(mut self, mut rx: mpsc::Receiver<Frame>, shutdown: CancellationToken) {
        debug!(target: "herald::fanout", channel = %self.channel, "egress pump started");
        loop {
            tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                next = time::timeout(PUMP_IDLE_TIMEOUT, rx.recv()) => match next {
                    Ok(Some(frame)) => self.publish(&frame).await,
                    Ok(None) => break,
                    Err(_) => {
                        let target = &self.target;
                        self.targets
                            .remove_if(&self.entity, |_, current| Arc::ptr_eq(current, target));
                        break;
                    }
                },
            }
        }

        rx.close();
        while let Ok(frame) = rx.try_recv() {
            self.publish(&frame).await;
        }
        debug!(target: "herald::fanout", channel = %self.channel, "egress pump stopped");
    }

    async fn publish(&mut self, frame: &Frame) {
        if let Err(err) = self
            .conn
            .publish::<_, _, ()>(&self.channel, &**frame)
            .await
        {
            warn!(
                target: "herald::fanout",
                channel = %self.channel,
                error = %err,
                "egress publish failed"
            );
        }
    }
}
