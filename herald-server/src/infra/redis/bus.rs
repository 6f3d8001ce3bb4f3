use std::fmt;

use async_trait::async_trait;
use futures::{StreamExt, stream::BoxStream};
use herald_core::{
    HeraldError, Result,
    ports::EventBus,
    types::{AuditEvent, BusMessage},
};
use redis::{AsyncCommands, aio::ConnectionManager};
use tracing::{debug, warn};

use super::SERVICE;

/// Lifecycle events arrive as pub/sub messages whose channel is the topic.
/// Audit events are published as JSON to a single channel.
#[derive(Clone)]
pub struct RedisEventBus {
    client: redis::Client,
    conn: ConnectionManager,
    audit_channel: String,
}

impl fmt::Debug for RedisEventBus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RedisEventBus")
            .field("connection", &"ConnectionManager")
            .field("audit_channel", &self.audit_channel)
            .finish()
    }
}

impl RedisEventBus {
    pub fn new(
        client: redis::Client,
        conn: ConnectionManager,
        audit_channel: impl Into<String>,
    ) -> Self {
        Self {
            client,
            conn,
            audit_channel: audit_channel.into(),
        }
    }
}

#[async_trait]
impl EventBus for RedisEventBus {
    async fn subscribe(
        &self,
        topics: &[String],
    ) -> Result<BoxStream<'static, BusMessage>> {
        let mut pubsub = self
            .client
            .get_async_pubsub()
            .await
            .map_err(|e| HeraldError::unavailable(SERVICE, e))?;
        for topic in topics {
            pubsub
                .subscribe(topic.as_str())
                .await
                .map_err(|e| HeraldError::unavailable(SERVICE, e))?;
        }
        debug!(target: "herald::ingest", topics = topics.len(), "subscribed to Redis topics");

        let stream = pubsub.into_on_message().filter_map(|msg| async move {
            let topic = match msg.get_channel::<String>() {
                Ok(topic) => topic,
                Err(err) => {
                    warn!(target: "herald::ingest", error = %err, "unreadable channel name");
                    return None;
                }
            };
            match msg.get_payload::<String>() {
                Ok(payload) => Some(BusMessage::new(topic, payload)),
                Err(err) => {
                    warn!(target: "herald::ingest", %topic, error = %err, "non-text payload skipped");
                    None
                }
            }
        });
        Ok(stream.boxed())
    }

    async fn publish(&self, event: AuditEvent) -> Result<()> {
        let body = serde_json::to_string(&event)?;
        let mut conn = self.conn.clone();
        conn.publish::<_, _, ()>(&self.audit_channel, body)
            .await
            .map_err(|e| HeraldError::unavailable(SERVICE, format!("PUBLISH failed: {e}")))
    }
}
