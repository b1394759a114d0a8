use std::net::SocketAddr;
use std::time::Duration;

use warden_model::RolloutThresholds;

use crate::env;
use crate::error::{ConfigError, Result};

/// Rollout orchestrator configuration. One environment binding per option.
#[derive(Debug, Clone, PartialEq)]
pub struct RolloutConfig {
    /// WARDEN_HTTP_ADDR — admin surface bind address.
    pub http_addr: SocketAddr,
    /// WARDEN_BUS_URL
    pub bus_url: String,
    /// WARDEN_OBSERVATION_WINDOW_SEC
    pub observation_window: Duration,
    /// WARDEN_OBSERVATION_CHECK_INTERVAL_SEC — checkpoint cadence inside a
    /// window.
    pub check_interval: Duration,
    /// WARDEN_BATCH_SIZE — gradual rollback batch size.
    pub batch_size: usize,
    /// WARDEN_INTER_BATCH_PAUSE_SEC
    pub inter_batch_pause: Duration,
    /// WARDEN_CANARY_FRACTION — fraction of targets in the canary subset.
    pub canary_fraction: f64,
    /// WARDEN_GRADUAL_FAILURE_TOLERANCE — per-batch failures tolerated
    /// before the remaining batches are abandoned.
    pub gradual_failure_tolerance: usize,
    /// WARDEN_TARGET_TIMEOUT_SEC — per-target rollback ack timeout.
    pub target_timeout: Duration,
    /// WARDEN_ROLLOUT_MAX_* thresholds.
    pub thresholds: RolloutThresholds,
}

impl RolloutConfig {
    pub fn from_env() -> Result<Self> {
        let http_addr_raw = env::string("WARDEN_HTTP_ADDR", "0.0.0.0:8083");
        let http_addr = http_addr_raw
            .parse::<SocketAddr>()
            .map_err(|e| ConfigError::InvalidVar {
                var: "WARDEN_HTTP_ADDR",
                reason: format!("{http_addr_raw:?}: {e}"),
            })?;

        let defaults = RolloutThresholds::default();
        let thresholds = RolloutThresholds {
            max_violations: env::parsed("WARDEN_ROLLOUT_MAX_VIOLATIONS", defaults.max_violations)?,
            max_error_rate: env::parsed("WARDEN_ROLLOUT_MAX_ERROR_RATE", defaults.max_error_rate)?,
            max_latency_ms: env::parsed("WARDEN_ROLLOUT_MAX_LATENCY_MS", defaults.max_latency_ms)?,
            min_success_rate: env::parsed(
                "WARDEN_ROLLOUT_MIN_SUCCESS_RATE",
                defaults.min_success_rate,
            )?,
        };

        let config = Self {
            http_addr,
            bus_url: env::string("WARDEN_BUS_URL", "nats://localhost:4222"),
            observation_window: Duration::from_secs(env::parsed(
                "WARDEN_OBSERVATION_WINDOW_SEC",
                120u64,
            )?),
            check_interval: Duration::from_secs(env::parsed(
                "WARDEN_OBSERVATION_CHECK_INTERVAL_SEC",
                10u64,
            )?),
            batch_size: env::parsed("WARDEN_BATCH_SIZE", 3usize)?,
            inter_batch_pause: Duration::from_secs(env::parsed(
                "WARDEN_INTER_BATCH_PAUSE_SEC",
                5u64,
            )?),
            canary_fraction: env::parsed("WARDEN_CANARY_FRACTION", 0.1f64)?,
            gradual_failure_tolerance: env::parsed("WARDEN_GRADUAL_FAILURE_TOLERANCE", 0usize)?,
            target_timeout: Duration::from_secs(env::parsed("WARDEN_TARGET_TIMEOUT_SEC", 30u64)?),
            thresholds,
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        self.thresholds.validate()?;
        if !(0.0..=1.0).contains(&self.canary_fraction) || self.canary_fraction == 0.0 {
            return Err(ConfigError::InvalidVar {
                var: "WARDEN_CANARY_FRACTION",
                reason: format!("{} outside (0, 1]", self.canary_fraction),
            });
        }
        if self.batch_size == 0 {
            return Err(ConfigError::InvalidVar {
                var: "WARDEN_BATCH_SIZE",
                reason: "must be at least 1".into(),
            });
        }
        if self.observation_window.is_zero() || self.check_interval.is_zero() {
            return Err(ConfigError::InvalidVar {
                var: "WARDEN_OBSERVATION_WINDOW_SEC",
                reason: "observation window and check interval must be positive".into(),
            });
        }
        if self.check_interval > self.observation_window {
            return Err(ConfigError::InvalidVar {
                var: "WARDEN_OBSERVATION_CHECK_INTERVAL_SEC",
                reason: "check interval must fit inside the observation window".into(),
            });
        }
        Ok(())
    }
}
