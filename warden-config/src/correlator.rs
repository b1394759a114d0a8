use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use crate::env;
use crate::error::{ConfigError, Result};

/// Correlator configuration. One environment binding per option.
#[derive(Debug, Clone, PartialEq)]
pub struct CorrelatorConfig {
    /// WARDEN_HTTP_ADDR — admin surface bind address.
    pub http_addr: SocketAddr,
    /// WARDEN_BUS_URL
    pub bus_url: String,
    /// WARDEN_CONFIG_API_URL — optional source of initial tunables.
    pub config_api_url: Option<String>,
    /// WARDEN_MAX_FINDINGS — finding ring capacity.
    pub max_findings: usize,
    /// WARDEN_DEDUPE_CAP — dedupe fingerprint LRU capacity.
    pub dedupe_cap: usize,
    /// WARDEN_RULES_DIR
    pub rules_dir: PathBuf,
    /// WARDEN_HOT_RELOAD — watch the rules dir for changes.
    pub hot_reload: bool,
    /// WARDEN_DEBOUNCE_MS — reload debounce window.
    pub debounce: Duration,
    /// WARDEN_RULE_WINDOW_SEC — default prior-event window.
    pub rule_window: Duration,
    /// WARDEN_LABEL_TTL_SEC
    pub label_ttl: Duration,
    /// WARDEN_NEVER_BLOCK_LABELS — hosts carrying one of these labels are
    /// exempt from evaluation.
    pub never_block_labels: Vec<String>,
    /// WARDEN_WINDOW_GC_INTERVAL_SEC — window buffer sweep cadence.
    pub window_gc_interval: Duration,
}

impl CorrelatorConfig {
    pub fn from_env() -> Result<Self> {
        let http_addr_raw = env::string("WARDEN_HTTP_ADDR", "0.0.0.0:8082");
        let http_addr = http_addr_raw
            .parse::<SocketAddr>()
            .map_err(|e| ConfigError::InvalidVar {
                var: "WARDEN_HTTP_ADDR",
                reason: format!("{http_addr_raw:?}: {e}"),
            })?;

        let config = Self {
            http_addr,
            bus_url: env::string("WARDEN_BUS_URL", "nats://localhost:4222"),
            config_api_url: env::optional("WARDEN_CONFIG_API_URL"),
            max_findings: env::parsed("WARDEN_MAX_FINDINGS", 10_000usize)?,
            dedupe_cap: env::parsed("WARDEN_DEDUPE_CAP", 50_000usize)?,
            rules_dir: PathBuf::from(env::string("WARDEN_RULES_DIR", "/etc/warden/rules")),
            hot_reload: env::boolean("WARDEN_HOT_RELOAD", true)?,
            debounce: Duration::from_millis(env::parsed("WARDEN_DEBOUNCE_MS", 500u64)?),
            rule_window: Duration::from_secs(env::parsed("WARDEN_RULE_WINDOW_SEC", 60u64)?),
            label_ttl: Duration::from_secs(env::parsed("WARDEN_LABEL_TTL_SEC", 600u64)?),
            never_block_labels: env::list("WARDEN_NEVER_BLOCK_LABELS"),
            window_gc_interval: Duration::from_secs(env::parsed(
                "WARDEN_WINDOW_GC_INTERVAL_SEC",
                30u64,
            )?),
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_findings == 0 {
            return Err(ConfigError::InvalidVar {
                var: "WARDEN_MAX_FINDINGS",
                reason: "must be at least 1".into(),
            });
        }
        if self.dedupe_cap == 0 {
            return Err(ConfigError::InvalidVar {
                var: "WARDEN_DEDUPE_CAP",
                reason: "must be at least 1".into(),
            });
        }
        if self.rule_window.is_zero() {
            return Err(ConfigError::InvalidVar {
                var: "WARDEN_RULE_WINDOW_SEC",
                reason: "must be strictly positive".into(),
            });
        }
        Ok(())
    }
}
