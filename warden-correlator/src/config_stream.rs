//! Live correlator tunables, updated from the `config.changed` stream.
//!
//! Changes are applied eventually; readers clone the current values per
//! event, so an in-flight evaluation finishes under the tunables it
//! started with.

use std::collections::HashSet;
use std::fmt;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use warden_config::CorrelatorConfig;
use warden_core::bus::Bus;
use warden_core::metrics::Metrics;
use warden_core::subjects;
use warden_model::{ConfigChange, CorrelatorTunables};

use crate::findings::FindingStore;

/// Current values of the hot-swappable knobs.
#[derive(Debug, Clone, PartialEq)]
pub struct Tunables {
    pub rule_window: Duration,
    pub label_ttl: Duration,
    pub debounce: Duration,
    pub max_findings: usize,
    pub dedupe_cap: usize,
    pub never_block_labels: HashSet<String>,
}

impl Tunables {
    pub fn from_config(config: &CorrelatorConfig) -> Self {
        Self {
            rule_window: config.rule_window,
            label_ttl: config.label_ttl,
            debounce: config.debounce,
            max_findings: config.max_findings,
            dedupe_cap: config.dedupe_cap,
            never_block_labels: config.never_block_labels.iter().cloned().collect(),
        }
    }
}

/// Shared holder for the live tunables.
pub struct LiveConfig {
    inner: RwLock<Tunables>,
}

impl fmt::Debug for LiveConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LiveConfig").field("tunables", &self.get()).finish()
    }
}

impl LiveConfig {
    pub fn new(tunables: Tunables) -> Self {
        Self { inner: RwLock::new(tunables) }
    }

    pub fn get(&self) -> Tunables {
        self.inner.read().unwrap_or_else(|p| p.into_inner()).clone()
    }

    /// Layer a change notice onto the current values and propagate capacity
    /// changes into the finding store.
    pub fn apply(&self, change: &CorrelatorTunables, findings: &FindingStore) {
        let mut inner = self.inner.write().unwrap_or_else(|p| p.into_inner());
        if let Some(secs) = change.rule_window_secs {
            inner.rule_window = Duration::from_secs(secs.max(1));
        }
        if let Some(secs) = change.label_ttl_secs {
            inner.label_ttl = Duration::from_secs(secs);
        }
        if let Some(ms) = change.debounce_ms {
            inner.debounce = Duration::from_millis(ms);
        }
        if let Some(max_findings) = change.max_findings {
            inner.max_findings = max_findings.max(1);
        }
        if let Some(dedupe_cap) = change.dedupe_cap {
            inner.dedupe_cap = dedupe_cap.max(1);
        }
        if let Some(labels) = &change.never_block_labels {
            inner.never_block_labels = labels.iter().cloned().collect();
        }
        findings.set_caps(inner.max_findings, inner.dedupe_cap);
        info!(?inner, "correlator tunables updated");
    }
}

/// Consume `config.changed` until cancelled.
pub async fn listen(
    bus: Arc<dyn Bus>,
    live: Arc<LiveConfig>,
    findings: Arc<FindingStore>,
    metrics: Arc<Metrics>,
    cancel: CancellationToken,
) {
    let mut subscription = match bus.subscribe(subjects::CONFIG_CHANGED).await {
        Ok(subscription) => subscription,
        Err(e) => {
            warn!("config stream subscription failed: {e}");
            return;
        }
    };
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            message = subscription.recv() => {
                let Some(message) = message else { break };
                match message.json::<ConfigChange>() {
                    Ok(change) => {
                        if let Some(correlator) = change.correlator {
                            live.apply(&correlator, &findings);
                            metrics.incr("config_updates_applied");
                        }
                    }
                    Err(e) => {
                        debug!("malformed config change dropped: {e}");
                        metrics.incr("malformed_config_changes");
                    }
                }
            }
        }
    }
    debug!("config stream stopped");
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base() -> Tunables {
        Tunables {
            rule_window: Duration::from_secs(60),
            label_ttl: Duration::from_secs(600),
            debounce: Duration::from_millis(500),
            max_findings: 100,
            dedupe_cap: 1000,
            never_block_labels: HashSet::new(),
        }
    }

    #[test]
    fn apply_layers_only_present_fields() {
        let live = LiveConfig::new(base());
        let findings = FindingStore::new(100, 1000);
        live.apply(
            &CorrelatorTunables {
                rule_window_secs: Some(120),
                never_block_labels: Some(vec!["env:exempt".into()]),
                ..CorrelatorTunables::default()
            },
            &findings,
        );
        let current = live.get();
        assert_eq!(current.rule_window, Duration::from_secs(120));
        assert!(current.never_block_labels.contains("env:exempt"));
        // Untouched knobs keep their values.
        assert_eq!(current.max_findings, 100);
    }
}
