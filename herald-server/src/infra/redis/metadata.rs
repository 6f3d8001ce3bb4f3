use std::{fmt, sync::Arc};

use async_trait::async_trait;
use futures::{StreamExt, stream::BoxStream};
use herald_core::{
    HeraldError, Result,
    ports::MetadataSource,
    types::{EntityId, Metadata},
};
use redis::{AsyncCommands, aio::ConnectionManager};
use serde_json::Value;
use tracing::debug;

use super::SERVICE;

/// Reads campaign metadata from the shared cache.
///
/// The cache is a read-through copy maintained by the campaign service, so a
/// miss means "not cached right now" and is reported as
/// [`HeraldError::Unavailable`] rather than as a deleted campaign.
#[derive(Clone)]
pub struct RedisMetadataSource {
    client: redis::Client,
    conn: ConnectionManager,
    key_prefix: String,
    channel_prefix: String,
}

impl fmt::Debug for RedisMetadataSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RedisMetadataSource")
            .field("key_prefix", &self.key_prefix)
            .field("channel_prefix", &self.channel_prefix)
            .finish_non_exhaustive()
    }
}

impl RedisMetadataSource {
    pub fn new(
        client: redis::Client,
        conn: ConnectionManager,
        key_prefix: impl Into<String>,
        channel_prefix: impl Into<String>,
    ) -> Self {
        Self {
            client,
            conn,
            key_prefix: key_prefix.into(),
            channel_prefix: channel_prefix.into(),
        }
    }

    fn key(&self, entity: &EntityId) -> String {
        format!("{}{}", self.key_prefix, entity)
    }

    fn channel(&self, entity: &EntityId) -> String {
        format!("{}{}", self.channel_prefix, entity)
    }
}

/// Cached documents are either the metadata itself or a campaign record
/// carrying it under `metadata`.
pub(crate) fn decode_cached(raw: &str) -> Result<Metadata> {
    let value: Value = serde_json::from_str(raw)
        .map_err(|err| HeraldError::Validation(format!("cached metadata is not JSON: {err}")))?;
    let document = match value {
        Value::Object(mut record) if record.get("metadata").is_some_and(Value::is_object) => {
            record.remove("metadata").unwrap_or_default()
        }
        other => other,
    };
    Metadata::from_value(document)
}

#[async_trait]
impl MetadataSource for RedisMetadataSource {
    async fn get(&self, entity: &EntityId) -> Result<Arc<Metadata>> {
        let key = self.key(entity);
        let mut conn = self.conn.clone();
        let cached: Option<String> = conn
            .get(&key)
            .await
            .map_err(|e| HeraldError::unavailable(SERVICE, format!("GET {key} failed: {e}")))?;

        match cached {
            Some(raw) => decode_cached(&raw).map(Arc::new),
            None => {
                debug!(target: "herald::orchestrator", %entity, "metadata cache miss");
                Err(HeraldError::Unavailable {
                    service: "metadata-cache",
                    message: format!("no cached document for {entity}"),
                })
            }
        }
    }

    async fn watch(&self, entity: &EntityId) -> Result<BoxStream<'static, ()>> {
        let channel = self.channel(entity);
        let mut pubsub = self
            .client
            .get_async_pubsub()
            .await
            .map_err(|e| HeraldError::unavailable(SERVICE, e))?;
        pubsub
            .subscribe(channel.as_str())
            .await
            .map_err(|e| HeraldError::unavailable(SERVICE, e))?;
        Ok(pubsub.into_on_message().map(|_| ()).boxed())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_bare_and_wrapped_documents() {
        let bare = decode_cached(r#"{"features": ["leaderboard"]}"#).expect("bare");
        assert!(bare.leaderboard_enabled());

        let wrapped = decode_cached(
            r#"{"slug": "spring", "metadata": {"scheduling": {"frequency": 4}}}"#,
        )
        .expect("wrapped");
        assert_eq!(wrapped.broadcast_frequency(), Some(4.0));
    }

    #[test]
    fn invalid_documents_are_validation_errors() {
        let err = decode_cached(r#"{"campaign_type": "mystery"}"#).expect_err("invalid type");
        assert!(err.is_validation());
        assert!(decode_cached("not json").expect_err("garbage").is_validation());
    }
}
