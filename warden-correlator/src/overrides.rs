//! Admin-registered rule overrides, layered at evaluation time.
//!
//! Overrides never touch the snapshot. There is exactly one layering path;
//! metrics observe it passively.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex};

use chrono::Utc;
use tracing::info;
use warden_core::error::{CoreError, Result};
use warden_core::metrics::Metrics;
use warden_model::{OverrideId, Rule, RuleId, RuleOverride};

#[derive(Default)]
pub struct OverrideStore {
    overrides: Mutex<HashMap<OverrideId, RuleOverride>>,
    metrics: Option<Arc<Metrics>>,
}

impl fmt::Debug for OverrideStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let count = self.overrides.lock().map(|o| o.len()).unwrap_or(0);
        f.debug_struct("OverrideStore").field("overrides", &count).finish()
    }
}

impl OverrideStore {
    pub fn new(metrics: Arc<Metrics>) -> Self {
        Self {
            overrides: Mutex::new(HashMap::new()),
            metrics: Some(metrics),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<OverrideId, RuleOverride>> {
        self.overrides.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Register or replace an override after boundary validation.
    pub fn upsert(&self, mut entry: RuleOverride) -> Result<OverrideId> {
        entry.validate().map_err(CoreError::Validation)?;
        entry.updated_at = Utc::now();
        let id = entry.id;
        info!(override_id = %id, rule = %entry.rule_id, "override registered");
        self.lock().insert(id, entry);
        Ok(id)
    }

    /// Remove an override; false when it never existed.
    pub fn remove(&self, id: &OverrideId) -> bool {
        let removed = self.lock().remove(id).is_some();
        if removed {
            info!(override_id = %id, "override removed");
        }
        removed
    }

    pub fn list(&self) -> Vec<RuleOverride> {
        let mut entries: Vec<_> = self.lock().values().cloned().collect();
        entries.sort_by_key(|e| e.updated_at);
        entries
    }

    /// The single layering path: the most recently updated override for
    /// this rule wins; its non-nil fields shadow the rule's own values.
    pub fn apply(&self, rule: &Rule) -> Rule {
        let Some(active) = self.latest_for(&rule.id) else {
            return rule.clone();
        };
        if let Some(metrics) = &self.metrics {
            metrics.incr("overrides_applied");
        }
        let mut effective = rule.clone();
        if let Some(enabled) = active.enabled {
            effective.enabled = enabled;
        }
        if let Some(severity) = active.severity {
            effective.outcome.severity = severity;
        }
        if let Some(confidence) = active.confidence {
            effective.outcome.confidence = confidence;
        }
        if let Some(lifetime) = active.lifetime_secs {
            effective.lifetime_secs = lifetime;
        }
        effective
    }

    fn latest_for(&self, rule_id: &RuleId) -> Option<RuleOverride> {
        self.lock()
            .values()
            .filter(|o| &o.rule_id == rule_id)
            .max_by_key(|o| o.updated_at)
            .cloned()
    }
}
