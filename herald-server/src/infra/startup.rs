use std::{sync::Arc, time::Duration};

use anyhow::{Context, Result};
use herald_core::HeraldRuntime;
use tracing::info;

use super::{
    config::Config,
    postgres::PostgresEntityRepository,
    redis::{self, RedisEgressRegistry, RedisEventBus, RedisMetadataSource},
};

/// The engine plus the adapters that need their own shutdown.
#[derive(Debug)]
pub struct HeraldService {
    runtime: HeraldRuntime,
    egress: Arc<RedisEgressRegistry>,
}

impl HeraldService {
    /// Connects to PostgreSQL and Redis and builds the runtime. Nothing is
    /// started yet.
    pub async fn connect(config: &Config) -> Result<Self> {
        let database_url = config
            .database
            .url
            .as_deref()
            .context("DATABASE_URL is required to run the orchestrator")?;

        let repository =
            PostgresEntityRepository::connect(database_url, config.database.max_connections)
                .await
                .context("failed to connect to PostgreSQL")?;

        let (client, conn) = redis::connect(&config.redis.url)
            .await
            .context("failed to connect to Redis")?;
        let bus = RedisEventBus::new(client.clone(), conn.clone(), &config.redis.audit_channel);
        let metadata = RedisMetadataSource::new(
            client,
            conn.clone(),
            &config.redis.metadata_key_prefix,
            &config.redis.metadata_channel_prefix,
        );
        let egress = Arc::new(RedisEgressRegistry::new(
            conn,
            &config.redis.egress_channel_prefix,
            config.redis.egress_buffer,
        ));

        let runtime = HeraldRuntime::builder()
            .with_config(config.engine.clone())
            .with_event_bus(Arc::new(bus))
            .with_metadata_source(Arc::new(metadata))
            .with_subscriber_registry(egress.clone())
            .with_repository(Arc::new(repository))
            .build()
            .context("invalid engine configuration")?;

        Ok(Self { runtime, egress })
    }

    pub fn runtime(&self) -> &HeraldRuntime {
        &self.runtime
    }

    /// Starts dispatch, ingest and periodic sweeps, then runs one sweep
    /// right away so live campaigns do not wait for the first interval.
    pub async fn start(&self, topics: Vec<String>) -> Result<()> {
        self.runtime.start().await;
        self.runtime.spawn_ingest(topics);

        let report = self
            .runtime
            .orchestrate_active(self.runtime.config().sweep.max_workers)
            .await
            .context("initial sweep failed")?;
        info!(
            target: "herald::sweep",
            discovered = report.discovered,
            created = report.created,
            rejected = report.rejected,
            "initial sweep finished"
        );

        self.runtime.spawn_sweeps();
        Ok(())
    }

    pub async fn shutdown(&self) {
        self.runtime.shutdown().await;
        self.egress.shutdown(Duration::from_secs(2)).await;
    }
}
