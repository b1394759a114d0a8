//! Host label cache, refreshed from event context with a TTL.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Mutex;
use std::time::Duration;

use warden_model::Event;
use warden_model::HostId;

/// Context keys that carry whole label lists rather than single values.
const LABEL_LIST_KEYS: [&str; 2] = ["labels", "tags"];

/// Extract the label set an event implies for its host.
///
/// Explicit `labels`/`tags` fields are split on whitespace and commas;
/// every other string-valued context field contributes `key:value`.
pub fn extract_labels(event: &Event) -> HashSet<String> {
    let mut labels = HashSet::new();
    for key in LABEL_LIST_KEYS {
        match event.context.get(key) {
            Some(serde_json::Value::String(raw)) => {
                labels.extend(
                    raw.split([' ', '\t', ','])
                        .map(str::trim)
                        .filter(|s| !s.is_empty())
                        .map(str::to_owned),
                );
            }
            Some(serde_json::Value::Array(items)) => {
                labels.extend(
                    items
                        .iter()
                        .filter_map(|v| v.as_str())
                        .map(str::to_owned),
                );
            }
            _ => {}
        }
    }
    for (key, value) in &event.context {
        if LABEL_LIST_KEYS.contains(&key.as_str()) {
            continue;
        }
        if let serde_json::Value::String(value) = value {
            labels.insert(format!("{key}:{value}"));
        }
    }
    labels
}

#[derive(Debug, Default)]
struct HostLabels {
    /// label → expiry instant (monotonic).
    entries: HashMap<String, Duration>,
}

/// TTL-bounded label cache; one lock, O(labels) per operation.
#[derive(Default)]
pub struct HostLabelsCache {
    hosts: Mutex<HashMap<HostId, HostLabels>>,
}

impl fmt::Debug for HostLabelsCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let hosts = self.hosts.lock().map(|h| h.len()).unwrap_or(0);
        f.debug_struct("HostLabelsCache").field("hosts", &hosts).finish()
    }
}

impl HostLabelsCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Refresh labels seen on an event; each gets `ttl` from `now`.
    pub fn refresh(&self, host: &HostId, labels: &HashSet<String>, now: Duration, ttl: Duration) {
        if labels.is_empty() {
            return;
        }
        let mut hosts = self.hosts.lock().unwrap_or_else(|p| p.into_inner());
        let entry = hosts.entry(host.clone()).or_default();
        for label in labels {
            entry.entries.insert(label.clone(), now + ttl);
        }
    }

    /// Current (unexpired) labels for a host. Expired entries are dropped
    /// on read; hosts with nothing left are evicted.
    pub fn labels_for(&self, host: &HostId, now: Duration) -> HashSet<String> {
        let mut hosts = self.hosts.lock().unwrap_or_else(|p| p.into_inner());
        let Some(entry) = hosts.get_mut(host) else {
            return HashSet::new();
        };
        entry.entries.retain(|_, expires| *expires > now);
        let labels: HashSet<String> = entry.entries.keys().cloned().collect();
        if labels.is_empty() {
            hosts.remove(host);
        }
        labels
    }
}
