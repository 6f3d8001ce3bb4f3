use std::{collections::HashMap, fs};

use herald_server::infra::config::{ConfigLoadError, ConfigLoader, EnvConfig};
use tempfile::TempDir;

fn env(pairs: &[(&str, &str)]) -> EnvConfig {
    let vars: HashMap<String, String> = pairs
        .iter()
        .map(|(key, value)| (key.to_string(), value.to_string()))
        .collect();
    EnvConfig::from_lookup(|name| vars.get(name).cloned())
}

fn write_config(dir: &TempDir, contents: &str) -> std::path::PathBuf {
    let path = dir.path().join("herald.toml");
    fs::write(&path, contents).expect("write config");
    path
}

const SAMPLE: &str = r#"
[database]
url = "postgres://herald:secret@db/campaigns"
max_connections = 12

[redis]
url = "redis://cache:6379"
egress_channel_prefix = "egress:campaign:"

[ingest]
topics = ["campaign.created", "campaign.deleted"]

[engine.broadcast]
default_rate_hz = 2.0
batch_size = 32

[engine.sweep]
interval_secs = 30
max_workers = 4

[engine.ranking]
default_formula = "referral_count DESC"
"#;

#[test]
fn file_values_fill_the_config() {
    let dir = TempDir::new().expect("tempdir");
    let path = write_config(&dir, SAMPLE);

    let load = ConfigLoader::new()
        .with_config_path(&path)
        .with_env(EnvConfig::default())
        .load()
        .expect("load");
    let config = load.config;

    assert_eq!(config.database.url.as_deref(), Some("postgres://herald:secret@db/campaigns"));
    assert_eq!(config.database.max_connections, 12);
    assert_eq!(config.redis.url, "redis://cache:6379");
    assert_eq!(config.redis.egress_channel_prefix, "egress:campaign:");
    assert_eq!(config.redis.metadata_key_prefix, "cache:campaign:");
    assert_eq!(config.ingest.topics, vec!["campaign.created", "campaign.deleted"]);
    assert_eq!(config.engine.broadcast.default_rate_hz, 2.0);
    assert_eq!(config.engine.broadcast.batch_size, 32);
    assert_eq!(config.engine.broadcast.max_rate_hz, 60.0);
    assert_eq!(config.engine.sweep.max_workers, 4);
    assert_eq!(config.engine.dispatcher.inbox_capacity, 256);
    assert_eq!(config.metadata.config_path.as_deref(), Some(path.as_path()));
    assert!(load.warnings.is_empty(), "unexpected warnings: {:?}", load.warnings);
}

#[test]
fn environment_overrides_the_file() {
    let dir = TempDir::new().expect("tempdir");
    let path = write_config(&dir, SAMPLE);

    let config = ConfigLoader::new()
        .with_config_path(&path)
        .with_env(env(&[
            ("DATABASE_URL", "postgres://override/campaigns"),
            ("REDIS_URL", "redis://override:6379"),
            ("HERALD_SWEEP_INTERVAL_SECS", "5"),
            ("HERALD_SWEEP_MAX_WORKERS", "16"),
            ("HERALD_THROTTLE_ENABLED", "false"),
            ("HERALD_INGEST_TOPICS", "campaign.trigger"),
        ]))
        .load()
        .expect("load")
        .config;

    assert_eq!(config.database.url.as_deref(), Some("postgres://override/campaigns"));
    assert_eq!(config.redis.url, "redis://override:6379");
    assert_eq!(config.engine.sweep.interval_secs, 5);
    assert_eq!(config.engine.sweep.max_workers, 16);
    assert!(!config.engine.load.throttle_enabled);
    assert_eq!(config.ingest.topics, vec!["campaign.trigger"]);
}

#[test]
fn config_path_from_environment_is_honored() {
    let dir = TempDir::new().expect("tempdir");
    let path = write_config(&dir, SAMPLE);
    let path_str = path.to_string_lossy().to_string();

    let config = ConfigLoader::new()
        .with_env(env(&[("HERALD_CONFIG", &path_str)]))
        .load()
        .expect("load")
        .config;

    assert_eq!(config.database.max_connections, 12);
}

#[test]
fn explicit_missing_file_is_an_error() {
    let dir = TempDir::new().expect("tempdir");
    let err = ConfigLoader::new()
        .with_config_path(dir.path().join("absent.toml"))
        .with_env(EnvConfig::default())
        .load()
        .expect_err("missing explicit file");
    assert!(matches!(err, ConfigLoadError::MissingConfig { .. }));
}

#[test]
fn malformed_toml_reports_the_path() {
    let dir = TempDir::new().expect("tempdir");
    let path = write_config(&dir, "[engine.broadcast\nbatch_size = ");
    let err = ConfigLoader::new()
        .with_config_path(&path)
        .with_env(EnvConfig::default())
        .load()
        .expect_err("parse error");
    match err {
        ConfigLoadError::Parse { path: reported, .. } => assert_eq!(reported, path),
        other => panic!("expected parse error, got {other:?}"),
    }
}

#[test]
fn unsafe_engine_settings_fail_the_load() {
    let dir = TempDir::new().expect("tempdir");
    let path = write_config(
        &dir,
        r#"
[engine.ranking]
default_formula = "referral_count DESC; DROP TABLE service_user_master"
"#,
    );
    let err = ConfigLoader::new()
        .with_config_path(&path)
        .with_env(EnvConfig::default())
        .load()
        .expect_err("formula rejected");
    assert!(matches!(err, ConfigLoadError::GuardRail(_)));
}

#[test]
fn env_only_setup_warns_but_loads() {
    // The crate directory carries no herald.toml, so only the environment applies.
    let load = ConfigLoader::new()
        .with_env(env(&[("DATABASE_URL", "postgres://env/campaigns")]))
        .load()
        .expect("env-only load");

    assert_eq!(load.config.database.url.as_deref(), Some("postgres://env/campaigns"));
    assert_eq!(load.config.redis.url, "redis://127.0.0.1:6379");
    assert!(load.config.metadata.config_path.is_none());
    assert!(
        load.warnings
            .items
            .iter()
            .any(|warning| warning.message.contains("REDIS_URL"))
    );
}
