//! Redis-backed ports: pub/sub event bus, cached metadata with change
//! notifications, and per-campaign egress channels.

mod bus;
mod egress;
mod metadata;

pub use bus::RedisEventBus;
pub use egress::{RedisEgressRegistry, RedisEgressTarget};
pub use metadata::RedisMetadataSource;

use herald_core::HeraldError;
use redis::aio::ConnectionManager;
use tracing::info;

pub(crate) const SERVICE: &str = "redis";

/// Opens a client and a managed connection for commands. Pub/sub
/// subscriptions open their own connections from the client.
pub async fn connect(
    redis_url: &str,
) -> Result<(redis::Client, ConnectionManager), HeraldError> {
    let client = redis::Client::open(redis_url)
        .map_err(|e| HeraldError::unavailable(SERVICE, format!("invalid Redis URL: {e}")))?;
    let conn = ConnectionManager::new(client.clone())
        .await
        .map_err(|e| HeraldError::unavailable(SERVICE, format!("failed to connect: {e}")))?;
    info!("Connected to Redis");
    Ok((client, conn))
}
