use once_cell::sync::Lazy;
use std::{fs, path::PathBuf};
use thiserror::Error;

use super::{
    models::{
        Config, ConfigMetadata, DEFAULT_DB_MAX_CONNECTIONS, DEFAULT_REDIS_URL,
        DatabaseConfig, IngestConfig, RedisConfig,
    },
    sources::{EnvConfig, FileConfig},
    validation::{self, ConfigGuardRailError, ConfigWarnings},
};

static DEFAULT_CONFIG_LOCATIONS: Lazy<Vec<PathBuf>> = Lazy::new(|| {
    vec![
        PathBuf::from("herald.toml"),
        PathBuf::from("config/herald.toml"),
    ]
});

#[derive(Debug, Default, Clone)]
pub struct ConfigLoaderOptions {
    pub config_path: Option<PathBuf>,
    pub env_file: Option<PathBuf>,
}

/// Resolves [`Config`] from a TOML file, an optional `.env` file and the
/// process environment. Environment wins over the file, the file wins over
/// built-in defaults.
#[derive(Debug, Default)]
pub struct ConfigLoader {
    options: ConfigLoaderOptions,
    env: Option<EnvConfig>,
}

#[derive(Debug)]
pub struct ConfigLoad {
    pub config: Config,
    pub warnings: ConfigWarnings,
}

impl ConfigLoader {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_options(options: ConfigLoaderOptions) -> Self {
        Self {
            options,
            env: None,
        }
    }

    pub fn with_config_path<P: Into<PathBuf>>(mut self, path: P) -> Self {
        self.options.config_path = Some(path.into());
        self
    }

    pub fn with_env_file<P: Into<PathBuf>>(mut self, path: P) -> Self {
        self.options.env_file = Some(path.into());
        self
    }

    /// Uses the given variables instead of reading `.env` and the process
    /// environment.
    pub fn with_env(mut self, env: EnvConfig) -> Self {
        self.env = Some(env);
        self
    }

    pub fn load(&self) -> Result<ConfigLoad, ConfigLoadError> {
        let (env_config, env_file_loaded) = match &self.env {
            Some(env) => (env.clone(), false),
            None => {
                let loaded = self.load_env_file()?;
                (EnvConfig::gather(), loaded)
            }
        };

        let (file_config, config_path) = self.load_file_config(&env_config)?;

        let (config, warnings) =
            compose_config(file_config, env_config, config_path, env_file_loaded)?;

        Ok(ConfigLoad { config, warnings })
    }

    fn load_env_file(&self) -> Result<bool, ConfigLoadError> {
        let loaded = match &self.options.env_file {
            Some(path) => dotenvy::from_path(path).map(|_| true),
            None => dotenvy::dotenv().map(|_| true),
        };
        match loaded {
            Ok(loaded) => Ok(loaded),
            Err(dotenvy::Error::Io(_)) => Ok(false),
            Err(err) => Err(err.into()),
        }
    }

    fn load_file_config(
        &self,
        env_config: &EnvConfig,
    ) -> Result<(Option<FileConfig>, Option<PathBuf>), ConfigLoadError> {
        let (path, explicit) = match (&self.options.config_path, &env_config.config_path) {
            (Some(path), _) | (None, Some(path)) => (Some(path.clone()), true),
            (None, None) => (
                DEFAULT_CONFIG_LOCATIONS
                    .iter()
                    .find(|candidate| candidate.exists())
                    .cloned(),
                false,
            ),
        };

        let Some(path) = path else {
            return Ok((None, None));
        };

        if !path.exists() {
            if explicit {
                return Err(ConfigLoadError::MissingConfig { path });
            }
            return Ok((None, None));
        }

        let contents = fs::read_to_string(&path).map_err(|source| ConfigLoadError::Io {
            path: path.clone(),
            source,
        })?;
        let file_config: FileConfig =
            toml::from_str(&contents).map_err(|source| ConfigLoadError::Parse {
                path: path.clone(),
                source,
            })?;

        Ok((Some(file_config), Some(path)))
    }
}

fn compose_config(
    file_config: Option<FileConfig>,
    env: EnvConfig,
    config_path: Option<PathBuf>,
    env_file_loaded: bool,
) -> Result<(Config, ConfigWarnings), ConfigLoadError> {
    let mut warnings = ConfigWarnings::default();

    if file_config.is_none() {
        warnings.push_with_hint(
            "No herald.toml detected; falling back to environment variables and defaults",
            "Copy herald.example.toml to herald.toml or pass --config",
        );
    }

    let FileConfig {
        database: file_database,
        redis: file_redis,
        ingest: file_ingest,
        engine: mut engine,
    } = file_config.unwrap_or_default();

    let database = DatabaseConfig {
        url: env
            .database_url
            .filter(|value| !value.trim().is_empty())
            .or(file_database.url.filter(|value| !value.trim().is_empty())),
        max_connections: env
            .database_max_connections
            .or(file_database.max_connections)
            .unwrap_or(DEFAULT_DB_MAX_CONNECTIONS),
    };

    let mut redis = RedisConfig::default();
    if let Some(file_redis) = file_redis {
        redis.url = file_redis.url;
        if let Some(prefix) = file_redis.metadata_key_prefix {
            redis.metadata_key_prefix = prefix;
        }
        if let Some(prefix) = file_redis.metadata_channel_prefix {
            redis.metadata_channel_prefix = prefix;
        }
        if let Some(prefix) = file_redis.egress_channel_prefix {
            redis.egress_channel_prefix = prefix;
        }
        if let Some(channel) = file_redis.audit_channel {
            redis.audit_channel = channel;
        }
        if let Some(buffer) = file_redis.egress_buffer {
            redis.egress_buffer = buffer;
        }
    }
    match env.redis_url {
        Some(url) => redis.url = url,
        None if redis.url == DEFAULT_REDIS_URL => warnings.push_with_hint(
            format!("REDIS_URL not configured; using {DEFAULT_REDIS_URL}"),
            "Set REDIS_URL or [redis].url in herald.toml",
        ),
        None => {}
    }

    let ingest = IngestConfig {
        topics: env
            .ingest_topics
            .or(file_ingest.topics)
            .unwrap_or_default(),
    };

    if let Some(secs) = env.sweep_interval_secs {
        engine.sweep.interval_secs = secs;
    }
    if let Some(workers) = env.sweep_max_workers {
        engine.sweep.max_workers = workers;
    }
    if let Some(enabled) = env.throttle_enabled {
        engine.load.throttle_enabled = enabled;
    }
    if let Some(secs) = env.idle_timeout_secs {
        engine.idle_timeout_secs = Some(secs);
    }

    let config = Config {
        database,
        redis,
        ingest,
        engine,
        metadata: ConfigMetadata {
            config_path,
            env_file_loaded,
        },
    };

    warnings.extend(validation::apply_guard_rails(&config)?);

    Ok((config, warnings))
}

#[derive(Debug, Error)]
pub enum ConfigLoadError {
    #[error("configuration file missing: {path}")]
    MissingConfig { path: PathBuf },
    #[error("failed to read configuration {path}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse configuration {path}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
    #[error(transparent)]
    GuardRail(#[from] ConfigGuardRailError),
    #[error(transparent)]
    EnvFile(#[from] dotenvy::Error),
}
