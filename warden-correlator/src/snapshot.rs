//! Immutable, versioned rule snapshots published by atomic replacement.
//!
//! Readers grab the current `Arc` and keep evaluating against it even while
//! a newer snapshot lands; no lock sits on the hot path.

use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;

use arc_swap::ArcSwap;
use globset::{Glob, GlobSet, GlobSetBuilder};
use warden_model::{HostId, ModelError, Rule};

/// A rule plus its compiled host-glob matcher.
pub struct CompiledRule {
    pub rule: Rule,
    globs: Option<GlobSet>,
}

impl fmt::Debug for CompiledRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CompiledRule")
            .field("id", &self.rule.id)
            .field("globs", &self.rule.selector.host_globs)
            .finish()
    }
}

impl CompiledRule {
    /// Validate and compile one rule. Invalid globs are a validation
    /// failure, surfaced before the rule is admitted into a snapshot.
    pub fn compile(rule: Rule) -> Result<Self, ModelError> {
        rule.validate()?;
        let globs = if rule.selector.host_globs.is_empty() {
            None
        } else {
            let mut builder = GlobSetBuilder::new();
            for pattern in &rule.selector.host_globs {
                let glob = Glob::new(pattern).map_err(|e| ModelError::InvalidField {
                    field: "selector.host_globs",
                    reason: format!("{pattern:?}: {e}"),
                })?;
                builder.add(glob);
            }
            Some(builder.build().map_err(|e| ModelError::InvalidField {
                field: "selector.host_globs",
                reason: e.to_string(),
            })?)
        };
        Ok(Self { rule, globs })
    }

    /// Selector semantics: exclusion vetoes first; then id/glob/label
    /// positives union; no positives at all means every host matches.
    pub fn selects(&self, host: &HostId, labels: &HashSet<String>) -> bool {
        let selector = &self.rule.selector;
        if selector.exclude_host_ids.contains(host) {
            return false;
        }
        if selector.is_catch_all() {
            return true;
        }
        if selector.host_ids.contains(host) {
            return true;
        }
        if let Some(globs) = &self.globs
            && globs.is_match(host.as_str())
        {
            return true;
        }
        // Labels compose by intersection: every listed label must be live.
        if !selector.labels.is_empty()
            && selector.labels.iter().all(|label| labels.contains(label))
        {
            return true;
        }
        false
    }
}

/// Ordered rule set with a strictly increasing version stamp.
#[derive(Debug)]
pub struct RuleSnapshot {
    pub version: u64,
    pub rules: Vec<CompiledRule>,
}

impl RuleSnapshot {
    pub fn empty() -> Self {
        Self { version: 0, rules: Vec::new() }
    }

    /// Rules whose selector admits `(host, labels)`, in snapshot order.
    pub fn effective_rules(&self, host: &HostId, labels: &HashSet<String>) -> Vec<&CompiledRule> {
        self.rules
            .iter()
            .filter(|rule| rule.rule.enabled && rule.selects(host, labels))
            .collect()
    }

    /// Longest prior-event window any rule asks for, used to size the
    /// window buffer's retention.
    pub fn max_window(&self, default_secs: u64) -> u64 {
        self.rules
            .iter()
            .filter_map(|r| r.rule.condition.window_secs)
            .chain(std::iter::once(default_secs))
            .max()
            .unwrap_or(default_secs)
    }
}

/// Publish-by-replacement holder for the current snapshot.
pub struct SnapshotHolder {
    current: ArcSwap<RuleSnapshot>,
}

impl fmt::Debug for SnapshotHolder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SnapshotHolder")
            .field("version", &self.current().version)
            .finish()
    }
}

impl Default for SnapshotHolder {
    fn default() -> Self {
        Self::new()
    }
}

impl SnapshotHolder {
    pub fn new() -> Self {
        Self {
            current: ArcSwap::from_pointee(RuleSnapshot::empty()),
        }
    }

    pub fn current(&self) -> Arc<RuleSnapshot> {
        self.current.load_full()
    }

    pub fn publish(&self, snapshot: RuleSnapshot) {
        self.current.store(Arc::new(snapshot));
    }
}
