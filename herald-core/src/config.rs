use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Engine tunables.
///
/// Every field carries a default, so a deployment only spells out what it
/// wants to change.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Queue and inbox sizing.
    pub dispatcher: DispatcherConfig,
    /// Broadcast rate bounds and fan-out batching.
    pub broadcast: BroadcastConfig,
    /// Inbox pressure thresholds.
    pub load: LoadMonitorConfig,
    /// Leaderboard cache and defaults.
    pub ranking: RankingConfig,
    /// Periodic full-campaign sweep.
    pub sweep: SweepConfig,
    /// Retire orchestrators that have had neither subscribers nor jobs for
    /// this long. Disabled when unset.
    pub idle_timeout_secs: Option<u64>,
    /// Grace period for orchestrators to finish on shutdown.
    pub shutdown_timeout_secs: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            dispatcher: DispatcherConfig::default(),
            broadcast: BroadcastConfig::default(),
            load: LoadMonitorConfig::default(),
            ranking: RankingConfig::default(),
            sweep: SweepConfig::default(),
            idle_timeout_secs: None,
            shutdown_timeout_secs: 10,
        }
    }
}

impl EngineConfig {
    pub fn idle_timeout(&self) -> Option<Duration> {
        self.idle_timeout_secs.map(Duration::from_secs)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout_secs.max(1))
    }
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatcherConfig {
    /// Bounded queue between ingest and the dispatch loop.
    pub queue_capacity: usize,
    /// Bounded inbox of each orchestrator.
    pub inbox_capacity: usize,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            queue_capacity: 1024,
            inbox_capacity: 256,
        }
    }
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct BroadcastConfig {
    /// Rate used until metadata says otherwise, and for non-positive requests.
    pub default_rate_hz: f64,
    /// Upper clamp for requested rates.
    pub max_rate_hz: f64,
    /// Subscribers handled by one fan-out worker.
    pub batch_size: usize,
    /// Budget for each post-delivery observer call.
    pub observer_timeout_ms: u64,
    /// Publish a `campaign.broadcast_tick` audit event after every tick.
    pub audit_ticks: bool,
}

impl Default for BroadcastConfig {
    fn default() -> Self {
        Self {
            default_rate_hz: 1.0,
            max_rate_hz: 60.0,
            batch_size: 64,
            observer_timeout_ms: 2_000,
            audit_ticks: false,
        }
    }
}

impl BroadcastConfig {
    pub fn observer_timeout(&self) -> Duration {
        Duration::from_millis(self.observer_timeout_ms)
    }
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct LoadMonitorConfig {
    /// Above this inbox fill ratio the broadcast rate is reduced.
    pub throttle_threshold: f64,
    /// Above this ratio a scale-out is recommended.
    pub scale_out_threshold: f64,
    /// Multiplier applied to the current rate when throttling.
    pub throttle_factor: f64,
    /// Throttling never goes below this rate.
    pub floor_hz: f64,
    /// When false the throttle decision is only logged.
    pub throttle_enabled: bool,
}

impl Default for LoadMonitorConfig {
    fn default() -> Self {
        Self {
            throttle_threshold: 0.85,
            scale_out_threshold: 0.95,
            throttle_factor: 0.8,
            floor_hz: 1.0,
            throttle_enabled: true,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct RankingConfig {
    pub cache_ttl_secs: u64,
    pub default_limit: usize,
    /// Used for campaigns that do not configure a formula.
    pub default_formula: String,
}

impl Default for RankingConfig {
    fn default() -> Self {
        Self {
            cache_ttl_secs: 60,
            default_limit: 10,
            default_formula: "referral_count DESC, username ASC".to_string(),
        }
    }
}

impl RankingConfig {
    pub fn cache_ttl(&self) -> Duration {
        Duration::from_secs(self.cache_ttl_secs)
    }
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct SweepConfig {
    pub interval_secs: u64,
    pub max_workers: usize,
}

impl Default for SweepConfig {
    fn default() -> Self {
        Self {
            interval_secs: 60,
            max_workers: 8,
        }
    }
}

impl SweepConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs.max(1))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_documents_keep_defaults() {
        let config: EngineConfig = serde_json::from_str(
            r#"{"broadcast": {"batch_size": 16}, "idle_timeout_secs": 300}"#,
        )
        .expect("parse");
        assert_eq!(config.broadcast.batch_size, 16);
        assert_eq!(config.broadcast.default_rate_hz, 1.0);
        assert_eq!(config.dispatcher.inbox_capacity, 256);
        assert_eq!(config.idle_timeout(), Some(Duration::from_secs(300)));
        assert_eq!(config.ranking.cache_ttl(), Duration::from_secs(60));
    }
}
