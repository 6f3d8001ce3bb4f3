use herald_core::{EngineConfig, ranking::validate_formula};
use thiserror::Error;

use super::models::Config;

#[derive(Debug, Error)]
pub enum ConfigGuardRailError {
    #[error("engine setting {field} {reason}")]
    InvalidEngineSetting { field: &'static str, reason: String },
    #[error("default ranking formula rejected: {0}")]
    DefaultFormula(String),
}

#[derive(Debug, Clone)]
pub struct ConfigWarning {
    pub message: String,
    pub hint: Option<String>,
}

#[derive(Debug, Default, Clone)]
pub struct ConfigWarnings {
    pub items: Vec<ConfigWarning>,
}

impl ConfigWarnings {
    pub fn push<S: Into<String>>(&mut self, message: S) {
        self.items.push(ConfigWarning {
            message: message.into(),
            hint: None,
        });
    }

    pub fn push_with_hint<S: Into<String>, H: Into<String>>(
        &mut self,
        message: S,
        hint: H,
    ) {
        self.items.push(ConfigWarning {
            message: message.into(),
            hint: Some(hint.into()),
        });
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn extend(&mut self, other: ConfigWarnings) {
        self.items.extend(other.items);
    }
}

pub fn apply_guard_rails(
    config: &Config,
) -> Result<ConfigWarnings, ConfigGuardRailError> {
    let mut warnings = ConfigWarnings::default();

    check_engine(&config.engine, &mut warnings)?;

    if config.database.url.is_none() {
        warnings.push_with_hint(
            "DATABASE_URL not configured; `serve` and `sweep` will refuse to start",
            "Set DATABASE_URL or [database].url in herald.toml",
        );
    }

    if config.redis.egress_buffer == 0 {
        return Err(ConfigGuardRailError::InvalidEngineSetting {
            field: "redis.egress_buffer",
            reason: "must be greater than zero".into(),
        });
    }

    Ok(warnings)
}

fn check_engine(
    engine: &EngineConfig,
    warnings: &mut ConfigWarnings,
) -> Result<(), ConfigGuardRailError> {
    let positive_count = [
        ("dispatcher.queue_capacity", engine.dispatcher.queue_capacity),
        ("dispatcher.inbox_capacity", engine.dispatcher.inbox_capacity),
        ("broadcast.batch_size", engine.broadcast.batch_size),
    ];
    for (field, value) in positive_count {
        if value == 0 {
            return Err(ConfigGuardRailError::InvalidEngineSetting {
                field,
                reason: "must be greater than zero".into(),
            });
        }
    }

    let broadcast = &engine.broadcast;
    if !(broadcast.default_rate_hz.is_finite() && broadcast.default_rate_hz > 0.0) {
        return Err(ConfigGuardRailError::InvalidEngineSetting {
            field: "broadcast.default_rate_hz",
            reason: format!("must be a positive rate, got {}", broadcast.default_rate_hz),
        });
    }
    if !(broadcast.max_rate_hz.is_finite() && broadcast.max_rate_hz >= broadcast.default_rate_hz) {
        return Err(ConfigGuardRailError::InvalidEngineSetting {
            field: "broadcast.max_rate_hz",
            reason: format!(
                "must be at least the default rate {}, got {}",
                broadcast.default_rate_hz, broadcast.max_rate_hz
            ),
        });
    }

    let load = &engine.load;
    let in_unit = |value: f64| value > 0.0 && value <= 1.0;
    if !in_unit(load.throttle_threshold)
        || !in_unit(load.scale_out_threshold)
        || load.throttle_threshold > load.scale_out_threshold
    {
        return Err(ConfigGuardRailError::InvalidEngineSetting {
            field: "load",
            reason: format!(
                "thresholds must satisfy 0 < throttle ({}) <= scale_out ({}) <= 1",
                load.throttle_threshold, load.scale_out_threshold
            ),
        });
    }
    if !(load.throttle_factor > 0.0 && load.throttle_factor < 1.0) {
        return Err(ConfigGuardRailError::InvalidEngineSetting {
            field: "load.throttle_factor",
            reason: format!("must be between 0 and 1, got {}", load.throttle_factor),
        });
    }
    if !(load.floor_hz.is_finite() && load.floor_hz > 0.0) {
        return Err(ConfigGuardRailError::InvalidEngineSetting {
            field: "load.floor_hz",
            reason: format!("must be a positive rate, got {}", load.floor_hz),
        });
    }

    validate_formula(&engine.ranking.default_formula)
        .map_err(|err| ConfigGuardRailError::DefaultFormula(err.to_string()))?;

    if engine.sweep.max_workers == 0 {
        warnings.push("sweep.max_workers is 0; sweeps will run with a single worker");
    }
    if !load.throttle_enabled {
        warnings.push(
            "load.throttle_enabled is false; overloaded campaigns keep their broadcast rate",
        );
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infra::config::models::{
        ConfigMetadata, DatabaseConfig, IngestConfig, RedisConfig,
    };

    fn config(engine: EngineConfig) -> Config {
        Config {
            database: DatabaseConfig {
                url: Some("postgres://herald@localhost/herald".into()),
                max_connections: 4,
            },
            redis: RedisConfig::default(),
            ingest: IngestConfig::default(),
            engine,
            metadata: ConfigMetadata::default(),
        }
    }

    #[test]
    fn defaults_pass_without_warnings() {
        let warnings = apply_guard_rails(&config(EngineConfig::default())).expect("valid");
        assert!(warnings.is_empty());
    }

    #[test]
    fn inverted_thresholds_are_rejected() {
        let mut engine = EngineConfig::default();
        engine.load.throttle_threshold = 0.99;
        let err = apply_guard_rails(&config(engine)).expect_err("inverted");
        assert!(matches!(
            err,
            ConfigGuardRailError::InvalidEngineSetting { field: "load", .. }
        ));
    }

    #[test]
    fn default_formula_goes_through_the_whitelist() {
        let mut engine = EngineConfig::default();
        engine.ranking.default_formula = "password DESC".into();
        let err = apply_guard_rails(&config(engine)).expect_err("column not allowed");
        assert!(err.to_string().contains("password"));
    }

    #[test]
    fn zero_workers_only_warns() {
        let mut engine = EngineConfig::default();
        engine.sweep.max_workers = 0;
        let warnings = apply_guard_rails(&config(engine)).expect("valid");
        assert_eq!(warnings.items.len(), 1);
    }
}
