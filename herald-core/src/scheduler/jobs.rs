use std::{collections::HashMap, fmt, sync::Arc};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::{Map, Value, json};
use tracing::info;

use crate::error::Result;
use crate::ports::EventBus;
use crate::types::{AuditEvent, EntityId, JobHandleId};

/// Everything a handler learns about one firing.
#[derive(Debug, Clone)]
pub struct JobContext {
    pub entity_id: EntityId,
    pub handle_id: JobHandleId,
    pub job_type: String,
    pub cron: String,
    pub params: Map<String, Value>,
    pub fired_at: DateTime<Utc>,
}

#[async_trait]
pub trait JobHandler: Send + Sync {
    async fn run(&self, ctx: JobContext) -> Result<()>;
}

/// Maps job type tags to handlers.
#[derive(Clone, Default)]
pub struct JobRegistry {
    handlers: HashMap<String, Arc<dyn JobHandler>>,
    fallback: Option<Arc<dyn JobHandler>>,
}

impl fmt::Debug for JobRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut types: Vec<_> = self.handlers.keys().collect();
        types.sort();
        f.debug_struct("JobRegistry")
            .field("types", &types)
            .field("fallback", &self.fallback.is_some())
            .finish()
    }
}

impl JobRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(
        &mut self,
        job_type: impl Into<String>,
        handler: Arc<dyn JobHandler>,
    ) -> &mut Self {
        self.handlers.insert(job_type.into(), handler);
        self
    }

    /// Handler for types without a dedicated registration.
    pub fn set_fallback(&mut self, handler: Arc<dyn JobHandler>) -> &mut Self {
        self.fallback = Some(handler);
        self
    }

    pub fn resolve(&self, job_type: &str) -> Option<Arc<dyn JobHandler>> {
        self.handlers
            .get(job_type)
            .or(self.fallback.as_ref())
            .cloned()
    }
}

/// Announces each firing on the bus as `campaign.job_executed` so that the
/// service owning the job type can react.
pub struct AuditJobHandler {
    bus: Arc<dyn EventBus>,
}

impl fmt::Debug for AuditJobHandler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AuditJobHandler").finish_non_exhaustive()
    }
}

impl AuditJobHandler {
    pub const EVENT_TYPE: &'static str = "campaign.job_executed";

    pub fn new(bus: Arc<dyn EventBus>) -> Self {
        Self { bus }
    }
}

#[async_trait]
impl JobHandler for AuditJobHandler {
    async fn run(&self, ctx: JobContext) -> Result<()> {
        info!(
            target: "herald::scheduler",
            entity = %ctx.entity_id,
            job_type = %ctx.job_type,
            "running job"
        );
        let payload = json!({
            "job_type": ctx.job_type,
            "handle": ctx.handle_id.0,
            "cron": ctx.cron,
            "params": ctx.params,
            "fired_at": ctx.fired_at,
        });
        self.bus
            .publish(AuditEvent::new(Self::EVENT_TYPE, ctx.entity_id, payload))
            .await
    }
}
