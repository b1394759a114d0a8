//! Process-wide operational counters backing `GET /metrics`.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;

/// Named monotonic counters. Cloneable handles share the same registry via
/// the caller wrapping it in `Arc`.
#[derive(Default)]
pub struct Metrics {
    counters: DashMap<&'static str, AtomicU64>,
}

impl fmt::Debug for Metrics {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Metrics")
            .field("counters", &self.counters.len())
            .finish()
    }
}

impl Metrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn incr(&self, name: &'static str) {
        self.add(name, 1);
    }

    pub fn add(&self, name: &'static str, delta: u64) {
        self.counters
            .entry(name)
            .or_insert_with(|| AtomicU64::new(0))
            .fetch_add(delta, Ordering::Relaxed);
    }

    pub fn get(&self, name: &'static str) -> u64 {
        self.counters
            .get(name)
            .map(|c| c.load(Ordering::Relaxed))
            .unwrap_or(0)
    }

    /// Stable-ordered snapshot for the admin surface.
    pub fn snapshot(&self) -> BTreeMap<String, u64> {
        self.counters
            .iter()
            .map(|entry| ((*entry.key()).to_owned(), entry.value().load(Ordering::Relaxed)))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_accumulate() {
        let metrics = Metrics::new();
        metrics.incr("detach_failures");
        metrics.add("detach_failures", 2);
        assert_eq!(metrics.get("detach_failures"), 3);
        assert_eq!(metrics.get("unknown"), 0);
        assert_eq!(metrics.snapshot().get("detach_failures"), Some(&3));
    }
}
