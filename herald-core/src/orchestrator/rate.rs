//! Broadcast rate coercion and inbox pressure assessment.

use std::time::Duration;

use crate::config::{BroadcastConfig, LoadMonitorConfig};

/// Maps a requested rate onto a usable one: non-finite or non-positive
/// requests fall back to the default, everything is capped at the maximum.
pub fn coerce_rate(requested: f64, config: &BroadcastConfig) -> f64 {
    let rate = if requested.is_finite() && requested > 0.0 {
        requested
    } else {
        config.default_rate_hz
    };
    rate.min(config.max_rate_hz)
}

pub fn tick_period(rate_hz: f64) -> Duration {
    Duration::from_secs_f64(1.0 / rate_hz)
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum LoadAction {
    Nominal,
    Throttle { target_hz: f64 },
    ScaleOut,
}

#[derive(Debug, Clone, Copy)]
pub struct LoadMonitor {
    config: LoadMonitorConfig,
}

impl LoadMonitor {
    pub fn new(config: LoadMonitorConfig) -> Self {
        Self { config }
    }

    /// Inbox fill ratio in `[0, 1]`.
    pub fn load(pending: usize, capacity: usize) -> f64 {
        if capacity == 0 {
            return 0.0;
        }
        (pending as f64 / capacity as f64).min(1.0)
    }

    pub fn assess(&self, load: f64, current_hz: f64) -> LoadAction {
        if load > self.config.scale_out_threshold {
            return LoadAction::ScaleOut;
        }
        if load > self.config.throttle_threshold {
            let target_hz = (current_hz * self.config.throttle_factor).max(self.config.floor_hz);
            if target_hz < current_hz {
                return LoadAction::Throttle { target_hz };
            }
        }
        LoadAction::Nominal
    }

    pub fn throttle_enabled(&self) -> bool {
        self.config.throttle_enabled
    }
}
