use std::path::PathBuf;

use herald_core::EngineConfig;
use serde::Serialize;

pub const DEFAULT_REDIS_URL: &str = "redis://127.0.0.1:6379";
pub const DEFAULT_METADATA_KEY_PREFIX: &str = "cache:campaign:";
pub const DEFAULT_METADATA_CHANNEL_PREFIX: &str = "campaign:metadata:";
pub const DEFAULT_EGRESS_CHANNEL_PREFIX: &str = "ws:egress:campaign:";
pub const DEFAULT_AUDIT_CHANNEL: &str = "campaign:audit";
pub const DEFAULT_DB_MAX_CONNECTIONS: u32 = 8;

/// Fully resolved service configuration.
#[derive(Debug, Clone, Serialize)]
pub struct Config {
    pub database: DatabaseConfig,
    pub redis: RedisConfig,
    pub ingest: IngestConfig,
    pub engine: EngineConfig,
    #[serde(skip)]
    pub metadata: ConfigMetadata,
}

#[derive(Debug, Clone, Serialize)]
pub struct DatabaseConfig {
    /// Required by `serve` and `sweep`.
    #[serde(skip)]
    pub url: Option<String>,
    pub max_connections: u32,
}

#[derive(Debug, Clone, Serialize)]
pub struct RedisConfig {
    #[serde(skip)]
    pub url: String,
    /// `GET {prefix}{campaign}` returns the cached metadata document.
    pub metadata_key_prefix: String,
    /// Change notifications arrive on `{prefix}{campaign}`.
    pub metadata_channel_prefix: String,
    /// Broadcast frames are published to `{prefix}{campaign}`.
    pub egress_channel_prefix: String,
    pub audit_channel: String,
    /// Frames buffered per campaign between the fan-out and Redis.
    pub egress_buffer: usize,
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            url: DEFAULT_REDIS_URL.to_string(),
            metadata_key_prefix: DEFAULT_METADATA_KEY_PREFIX.to_string(),
            metadata_channel_prefix: DEFAULT_METADATA_CHANNEL_PREFIX.to_string(),
            egress_channel_prefix: DEFAULT_EGRESS_CHANNEL_PREFIX.to_string(),
            audit_channel: DEFAULT_AUDIT_CHANNEL.to_string(),
            egress_buffer: 64,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct IngestConfig {
    /// Empty means the default lifecycle topics.
    pub topics: Vec<String>,
}

/// Where the configuration came from.
#[derive(Debug, Clone, Default)]
pub struct ConfigMetadata {
    pub config_path: Option<PathBuf>,
    pub env_file_loaded: bool,
}
