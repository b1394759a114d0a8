use std::path::PathBuf;
use std::time::Duration;

use warden_model::{HostId, ThresholdConfig};

use crate::env;
use crate::error::{ConfigError, Result};

/// Host agent configuration. One environment binding per option.
#[derive(Debug, Clone, PartialEq)]
pub struct AgentConfig {
    /// WARDEN_HOST_ID — identity of this host in the fleet.
    pub host_id: HostId,
    /// WARDEN_REGISTRY_URL — base URL of the artifact catalog.
    pub registry_url: String,
    /// WARDEN_POLL_INTERVAL_SEC
    pub poll_interval: Duration,
    /// WARDEN_BUS_URL
    pub bus_url: String,
    /// WARDEN_CACHE_DIR — on-disk artifact byte cache.
    pub cache_dir: PathBuf,
    /// WARDEN_MAX_PROGRAMS — probe table capacity.
    pub max_programs: usize,
    /// WARDEN_DEFAULT_LIFETIME_SEC — applied when a descriptor has no lifetime.
    pub default_lifetime: Duration,
    /// WARDEN_TELEMETRY_SUBJECT
    pub telemetry_subject: String,
    /// WARDEN_HTTP_PORT — admin surface port.
    pub http_port: u16,
    /// WARDEN_SIGNING_KEY — shared key for artifact signature verification.
    pub signing_key: String,
    /// WARDEN_TELEMETRY_QUEUE_CAPACITY — bounded telemetry channel size.
    pub telemetry_queue_capacity: usize,
    /// WARDEN_HEARTBEAT_INTERVAL_SEC
    pub heartbeat_interval: Duration,
    /// WARDEN_ROLLBACK_CHECK_INTERVAL_SEC — expiry scan cadence.
    pub rollback_check_interval: Duration,
    /// WARDEN_MAX_* / WARDEN_CHECK_INTERVAL_SEC / WARDEN_ACTION_DELAY_SEC
    pub thresholds: ThresholdConfig,
}

impl AgentConfig {
    pub fn from_env() -> Result<Self> {
        let defaults = ThresholdConfig::default();
        let thresholds = ThresholdConfig {
            max_errors: env::parsed("WARDEN_MAX_ERRORS", defaults.max_errors)?,
            max_violations: env::parsed("WARDEN_MAX_VIOLATIONS", defaults.max_violations)?,
            max_cpu_percent: env::parsed("WARDEN_MAX_CPU_PERCENT", defaults.max_cpu_percent)?,
            max_latency_ms: env::parsed("WARDEN_MAX_LATENCY_MS", defaults.max_latency_ms)?,
            max_mem_kb: env::parsed("WARDEN_MAX_MEM_KB", defaults.max_mem_kb)?,
            verifier_failure_is_fatal: env::boolean(
                "WARDEN_VERIFIER_FAILURE_IS_FATAL",
                defaults.verifier_failure_is_fatal,
            )?,
            check_interval_secs: env::parsed(
                "WARDEN_CHECK_INTERVAL_SEC",
                defaults.check_interval_secs,
            )?,
            action_delay_secs: env::parsed(
                "WARDEN_ACTION_DELAY_SEC",
                defaults.action_delay_secs,
            )?,
        };

        let config = Self {
            host_id: HostId::new(env::required("WARDEN_HOST_ID")?),
            registry_url: env::string("WARDEN_REGISTRY_URL", "http://localhost:8090"),
            poll_interval: Duration::from_secs(env::parsed("WARDEN_POLL_INTERVAL_SEC", 30u64)?),
            bus_url: env::string("WARDEN_BUS_URL", "nats://localhost:4222"),
            cache_dir: PathBuf::from(env::string("WARDEN_CACHE_DIR", "/var/cache/warden")),
            max_programs: env::parsed("WARDEN_MAX_PROGRAMS", 16usize)?,
            default_lifetime: Duration::from_secs(env::parsed(
                "WARDEN_DEFAULT_LIFETIME_SEC",
                3600u64,
            )?),
            telemetry_subject: env::string("WARDEN_TELEMETRY_SUBJECT", "telemetry"),
            http_port: env::parsed("WARDEN_HTTP_PORT", 8081u16)?,
            signing_key: env::required("WARDEN_SIGNING_KEY")?,
            telemetry_queue_capacity: env::parsed("WARDEN_TELEMETRY_QUEUE_CAPACITY", 1024usize)?,
            heartbeat_interval: Duration::from_secs(env::parsed(
                "WARDEN_HEARTBEAT_INTERVAL_SEC",
                60u64,
            )?),
            rollback_check_interval: Duration::from_secs(env::parsed(
                "WARDEN_ROLLBACK_CHECK_INTERVAL_SEC",
                5u64,
            )?),
            thresholds,
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        self.thresholds.validate()?;
        if self.poll_interval.is_zero() {
            return Err(ConfigError::InvalidVar {
                var: "WARDEN_POLL_INTERVAL_SEC",
                reason: "must be strictly positive".into(),
            });
        }
        if self.max_programs == 0 {
            return Err(ConfigError::InvalidVar {
                var: "WARDEN_MAX_PROGRAMS",
                reason: "must be at least 1".into(),
            });
        }
        if self.telemetry_queue_capacity == 0 {
            return Err(ConfigError::InvalidVar {
                var: "WARDEN_TELEMETRY_QUEUE_CAPACITY",
                reason: "must be at least 1".into(),
            });
        }
        url::Url::parse(&self.registry_url).map_err(|e| ConfigError::InvalidVar {
            var: "WARDEN_REGISTRY_URL",
            reason: e.to_string(),
        })?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_config() -> AgentConfig {
        AgentConfig {
            host_id: HostId::from("web-1"),
            registry_url: "http://localhost:8090".into(),
            poll_interval: Duration::from_secs(30),
            bus_url: "nats://localhost:4222".into(),
            cache_dir: PathBuf::from("/tmp/warden-cache"),
            max_programs: 16,
            default_lifetime: Duration::from_secs(3600),
            telemetry_subject: "telemetry".into(),
            http_port: 8081,
            signing_key: "secret".into(),
            telemetry_queue_capacity: 1024,
            heartbeat_interval: Duration::from_secs(60),
            rollback_check_interval: Duration::from_secs(5),
            thresholds: ThresholdConfig::default(),
        }
    }

    #[test]
    fn valid_config_passes() {
        base_config().validate().expect("validates");
    }

    #[test]
    fn zero_poll_interval_rejected() {
        let mut cfg = base_config();
        cfg.poll_interval = Duration::ZERO;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn zero_threshold_check_interval_rejected() {
        let mut cfg = base_config();
        cfg.thresholds.check_interval_secs = 0;
        assert_eq!(cfg.validate().expect_err("fails").kind(), "invalid_config");
    }
}
