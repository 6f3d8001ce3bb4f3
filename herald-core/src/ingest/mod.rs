//! Bus consumption and the periodic sweep of active campaigns.

mod sweep;

pub use sweep::{SweepReport, Sweeper};

use std::sync::Arc;

use futures::StreamExt;
use serde::Serialize;
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::dispatcher::Dispatcher;
use crate::error::{HeraldError, Result};
use crate::ports::EventBus;
use crate::types::{BusMessage, EventKind, OrchestrationEvent};

/// Decodes a bus message. The message body wins; the topic fills in a
/// missing `type`.
pub fn parse_event(message: &BusMessage) -> Result<OrchestrationEvent> {
    let mut value: Value = serde_json::from_str(&message.payload)
        .map_err(|err| HeraldError::Validation(format!("malformed event on {}: {err}", message.topic)))?;
    let Some(object) = value.as_object_mut() else {
        return Err(HeraldError::Validation(format!(
            "event on {} is not a JSON object",
            message.topic
        )));
    };
    if !object.contains_key("type") {
        object.insert("type".into(), Value::String(message.topic.clone()));
    }
    serde_json::from_value(value)
        .map_err(|err| HeraldError::Validation(format!("invalid event on {}: {err}", message.topic)))
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct IngestStats {
    pub received: u64,
    pub enqueued: u64,
    pub malformed: u64,
    pub dropped: u64,
}

/// Pumps lifecycle events from the bus into the dispatcher queue.
pub struct EventIngest {
    bus: Arc<dyn EventBus>,
    dispatcher: Arc<Dispatcher>,
    topics: Vec<String>,
}

impl std::fmt::Debug for EventIngest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventIngest")
            .field("topics", &self.topics)
            .finish_non_exhaustive()
    }
}

impl EventIngest {
    pub fn new(bus: Arc<dyn EventBus>, dispatcher: Arc<Dispatcher>) -> Self {
        Self {
            bus,
            dispatcher,
            topics: EventKind::DEFAULT_TOPICS.iter().map(|t| t.to_string()).collect(),
        }
    }

    pub fn with_topics(mut self, topics: Vec<String>) -> Self {
        if !topics.is_empty() {
            self.topics = topics;
        }
        self
    }

    pub fn topics(&self) -> &[String] {
        &self.topics
    }

    /// Runs until `shutdown` fires or the bus stream ends. Only the initial
    /// subscription can fail.
    pub async fn run(self, shutdown: CancellationToken) -> Result<IngestStats> {
        let mut messages = self.bus.subscribe(&self.topics).await?;
        info!(target: "herald::ingest", topics = ?self.topics, "event ingest started");

        let mut stats = IngestStats::default();
        loop {
            let message = tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                next = messages.next() => match next {
                    Some(message) => message,
                    None => {
                        warn!(target: "herald::ingest", "event stream ended");
                        break;
                    }
                },
            };
            stats.received += 1;

            match parse_event(&message) {
                Ok(event) => {
                    debug!(
                        target: "herald::ingest",
                        entity = %event.entity_id,
                        kind = %event.kind,
                        "event received"
                    );
                    if self.dispatcher.enqueue(event) {
                        stats.enqueued += 1;
                    } else {
                        stats.dropped += 1;
                    }
                }
                Err(err) => {
                    stats.malformed += 1;
                    warn!(target: "herald::ingest", topic = %message.topic, error = %err, "skipping malformed event");
                }
            }
        }

        info!(
            target: "herald::ingest",
            received = stats.received,
            enqueued = stats.enqueued,
            malformed = stats.malformed,
            dropped = stats.dropped,
            "event ingest stopped"
        );
        Ok(stats)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn topic_fills_missing_type() {
        let message = BusMessage::new("campaign.trigger", r#"{"campaign_id":"spring"}"#);
        let event = parse_event(&message).unwrap();
        assert_eq!(event.entity_id.as_str(), "spring");
        assert_eq!(event.kind, EventKind::Trigger);
    }

    #[test]
    fn body_type_wins_over_topic() {
        let message = BusMessage::new(
            "campaign.updated",
            r#"{"entity_id":"spring","type":"campaign.deleted"}"#,
        );
        assert_eq!(parse_event(&message).unwrap().kind, EventKind::Deleted);
    }

    #[test]
    fn malformed_messages_are_rejected() {
        for body in ["not json", "[1,2]", r#"{"type":"campaign.created"}"#] {
            let err = parse_event(&BusMessage::new("campaign.created", body)).unwrap_err();
            assert!(err.is_validation(), "{body}");
        }
    }
}
