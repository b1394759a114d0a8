use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{ModelError, Result};
use crate::event::Event;
use crate::finding::Severity;
use crate::ids::{HostId, OverrideId, RuleId};

/// Host targeting for a rule.
///
/// Positive selectors (`host_ids`, `host_globs`, `labels`) union/intersect as
/// documented on [`Rule`]; `exclude_host_ids` is a hard veto. No positive
/// selector means the rule applies to every host.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RuleSelector {
    #[serde(default)]
    pub host_ids: BTreeSet<HostId>,
    #[serde(default)]
    pub host_globs: Vec<String>,
    /// `key:value` labels; every listed label must be present on the host.
    #[serde(default)]
    pub labels: BTreeSet<String>,
    #[serde(default)]
    pub exclude_host_ids: BTreeSet<HostId>,
}

impl RuleSelector {
    /// True when no positive selector is present, i.e. the rule targets all
    /// hosts (exclusions still apply).
    pub fn is_catch_all(&self) -> bool {
        self.host_ids.is_empty() && self.host_globs.is_empty() && self.labels.is_empty()
    }
}

/// Structural pattern matched against a single event.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EventPattern {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub event_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub binary_path: Option<String>,
    /// Every listed arg must be present with exactly this value.
    #[serde(default)]
    pub args: BTreeMap<String, String>,
    /// Every listed context key must be present with this string value.
    #[serde(default)]
    pub context: BTreeMap<String, String>,
}

impl EventPattern {
    pub fn matches(&self, event: &Event) -> bool {
        if let Some(ty) = &self.event_type
            && ty != &event.event_type
        {
            return false;
        }
        if let Some(path) = &self.binary_path
            && path != &event.binary_path
        {
            return false;
        }
        for (key, expected) in &self.args {
            if event.args.get(key) != Some(expected) {
                return false;
            }
        }
        for (key, expected) in &self.context {
            let Some(actual) = event.context.get(key) else {
                return false;
            };
            let matched = match actual {
                serde_json::Value::String(s) => s == expected,
                other => &other.to_string() == expected,
            };
            if !matched {
                return false;
            }
        }
        true
    }
}

/// When a rule fires: the `when` pattern must match the current event, and
/// if `requires_prior` is set at least one earlier event in the host's
/// window must match it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuleCondition {
    pub when: EventPattern,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub requires_prior: Option<EventPattern>,
    /// Sliding window for prior-event lookups; the correlator default
    /// applies when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub window_secs: Option<u64>,
}

/// What a firing rule produces.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuleOutcome {
    pub severity: Severity,
    #[serde(default = "default_confidence")]
    pub confidence: f64,
    /// Evidence templates rendered with the placeholder vocabulary.
    #[serde(default)]
    pub evidence: Vec<String>,
}

fn default_confidence() -> f64 {
    0.5
}

/// Dedupe key template plus cooldown window.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuleDedupe {
    #[serde(default = "default_dedupe_key")]
    pub key_template: String,
    #[serde(default = "default_cooldown_secs")]
    pub cooldown_secs: u64,
}

fn default_dedupe_key() -> String {
    "{rule.id}:{host_id}".to_owned()
}

fn default_cooldown_secs() -> u64 {
    300
}

impl Default for RuleDedupe {
    fn default() -> Self {
        Self {
            key_template: default_dedupe_key(),
            cooldown_secs: default_cooldown_secs(),
        }
    }
}

fn default_version() -> String {
    "1".to_owned()
}

fn default_enabled() -> bool {
    true
}

fn default_lifetime_secs() -> u64 {
    3600
}

/// Declarative correlation rule as authored in rule files.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Rule {
    pub id: RuleId,
    pub name: String,
    #[serde(default = "default_version")]
    pub version: String,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default)]
    pub selector: RuleSelector,
    pub condition: RuleCondition,
    pub outcome: RuleOutcome,
    #[serde(default)]
    pub dedupe: RuleDedupe,
    #[serde(default = "default_lifetime_secs")]
    pub lifetime_secs: u64,
}

impl Rule {
    /// Boundary validation applied by the rule loader before a rule is
    /// admitted into a snapshot.
    pub fn validate(&self) -> Result<()> {
        if self.id.as_str().is_empty() {
            return Err(ModelError::MissingField("id"));
        }
        if self.name.is_empty() {
            return Err(ModelError::MissingField("name"));
        }
        if !(0.0..=1.0).contains(&self.outcome.confidence) {
            return Err(ModelError::InvalidField {
                field: "outcome.confidence",
                reason: format!("{} outside [0, 1]", self.outcome.confidence),
            });
        }
        if self.lifetime_secs == 0 {
            return Err(ModelError::InvalidField {
                field: "lifetime_secs",
                reason: "must be positive".into(),
            });
        }
        if let Some(0) = self.condition.window_secs {
            return Err(ModelError::InvalidField {
                field: "condition.window_secs",
                reason: "must be positive when present".into(),
            });
        }
        Ok(())
    }
}

/// Admin-registered override layered over a rule at evaluation time.
///
/// Overrides never mutate the snapshot; non-nil fields shadow the rule's own
/// values on the evaluation path.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuleOverride {
    pub id: OverrideId,
    pub rule_id: RuleId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub enabled: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub severity: Option<Severity>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub confidence: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lifetime_secs: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl RuleOverride {
    pub fn validate(&self) -> Result<()> {
        if let Some(confidence) = self.confidence
            && !(0.0..=1.0).contains(&confidence)
        {
            return Err(ModelError::InvalidField {
                field: "confidence",
                reason: format!("{confidence} outside [0, 1]"),
            });
        }
        if let Some(0) = self.lifetime_secs {
            return Err(ModelError::InvalidField {
                field: "lifetime_secs",
                reason: "must be positive when present".into(),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn minimal_rule(id: &str) -> Rule {
        Rule {
            id: RuleId::new(id),
            name: "suspicious exec".into(),
            version: default_version(),
            enabled: true,
            selector: RuleSelector::default(),
            condition: RuleCondition {
                when: EventPattern {
                    event_type: Some("process_exec".into()),
                    ..EventPattern::default()
                },
                requires_prior: None,
                window_secs: None,
            },
            outcome: RuleOutcome {
                severity: Severity::Medium,
                confidence: 0.7,
                evidence: vec![],
            },
            dedupe: RuleDedupe::default(),
            lifetime_secs: 3600,
        }
    }

    #[test]
    fn pattern_matches_on_type_args_and_context() {
        let mut event = Event::new(HostId::from("web-1"), "process_exec");
        event.args.insert("argv0".into(), "/usr/bin/curl".into());
        event
            .context
            .insert("user".into(), serde_json::Value::String("root".into()));

        let mut pattern = EventPattern {
            event_type: Some("process_exec".into()),
            ..EventPattern::default()
        };
        assert!(pattern.matches(&event));

        pattern.args.insert("argv0".into(), "/usr/bin/curl".into());
        pattern.context.insert("user".into(), "root".into());
        assert!(pattern.matches(&event));

        pattern.context.insert("user".into(), "nobody".into());
        assert!(!pattern.matches(&event));
    }

    #[test]
    fn confidence_outside_unit_interval_rejected() {
        let mut rule = minimal_rule("r-1");
        rule.outcome.confidence = 1.5;
        assert!(rule.validate().is_err());
    }

    #[test]
    fn empty_selector_is_catch_all() {
        assert!(minimal_rule("r-2").selector.is_catch_all());
    }
}
