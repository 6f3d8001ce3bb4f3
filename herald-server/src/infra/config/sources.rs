use std::{path::PathBuf, str::FromStr};

use herald_core::EngineConfig;
use serde::{Deserialize, Serialize};

/// Raw configuration as defined in a TOML file.
#[derive(Debug, Default, Clone, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub struct FileConfig {
    #[serde(default)]
    pub database: FileDatabaseConfig,
    pub redis: Option<FileRedisConfig>,
    #[serde(default)]
    pub ingest: FileIngestConfig,
    #[serde(default)]
    pub engine: EngineConfig,
}

#[derive(Debug, Default, Clone, Deserialize, Serialize)]
pub struct FileDatabaseConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_connections: Option<u32>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct FileRedisConfig {
    pub url: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata_key_prefix: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata_channel_prefix: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub egress_channel_prefix: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub audit_channel: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub egress_buffer: Option<usize>,
}

#[derive(Debug, Default, Clone, Deserialize, Serialize)]
pub struct FileIngestConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub topics: Option<Vec<String>>,
}

/// Environment-derived configuration values.
#[derive(Debug, Default, Clone)]
pub struct EnvConfig {
    pub config_path: Option<PathBuf>,
    pub database_url: Option<String>,
    pub database_max_connections: Option<u32>,
    pub redis_url: Option<String>,
    pub sweep_interval_secs: Option<u64>,
    pub sweep_max_workers: Option<usize>,
    pub throttle_enabled: Option<bool>,
    pub idle_timeout_secs: Option<u64>,
    pub ingest_topics: Option<Vec<String>>,
}

impl EnvConfig {
    pub fn gather() -> Self {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Same as [`EnvConfig::gather`] with a custom variable source.
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        Self {
            config_path: lookup("HERALD_CONFIG").map(PathBuf::from),
            database_url: lookup("DATABASE_URL"),
            database_max_connections: parse_var(&lookup, "DB_MAX_CONNECTIONS"),
            redis_url: lookup("REDIS_URL"),
            sweep_interval_secs: parse_var(&lookup, "HERALD_SWEEP_INTERVAL_SECS"),
            sweep_max_workers: parse_var(&lookup, "HERALD_SWEEP_MAX_WORKERS"),
            throttle_enabled: lookup("HERALD_THROTTLE_ENABLED")
                .and_then(|raw| parse_bool(&raw)),
            idle_timeout_secs: parse_var(&lookup, "HERALD_IDLE_TIMEOUT_SECS"),
            ingest_topics: lookup("HERALD_INGEST_TOPICS").map(|raw| parse_csv(&raw)),
        }
    }
}

fn parse_var<T, F>(lookup: &F, name: &str) -> Option<T>
where
    T: FromStr,
    F: Fn(&str) -> Option<String>,
{
    lookup(name).and_then(|raw| raw.trim().parse().ok())
}

fn parse_csv(raw: &str) -> Vec<String> {
    raw.split(',')
        .filter_map(|part| {
            let trimmed = part.trim();
            if trimmed.is_empty() {
                None
            } else {
                Some(trimmed.to_string())
            }
        })
        .collect()
}

fn parse_bool(raw: &str) -> Option<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn env(pairs: &[(&str, &str)]) -> EnvConfig {
        let vars: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        EnvConfig::from_lookup(|name| vars.get(name).cloned())
    }

    #[test]
    fn csv_and_bool_variables() {
        let config = env(&[
            ("HERALD_INGEST_TOPICS", " campaign.created, ,campaign.ended "),
            ("HERALD_THROTTLE_ENABLED", "off"),
            ("HERALD_SWEEP_MAX_WORKERS", "4"),
        ]);
        assert_eq!(
            config.ingest_topics,
            Some(vec!["campaign.created".to_string(), "campaign.ended".to_string()])
        );
        assert_eq!(config.throttle_enabled, Some(false));
        assert_eq!(config.sweep_max_workers, Some(4));
    }

    #[test]
    fn unparsable_values_are_ignored() {
        let config = env(&[
            ("HERALD_THROTTLE_ENABLED", "maybe"),
            ("HERALD_SWEEP_INTERVAL_SECS", "soon"),
        ]);
        assert_eq!(config.throttle_enabled, None);
        assert_eq!(config.sweep_interval_secs, None);
        assert!(config.database_url.is_none());
    }
}
