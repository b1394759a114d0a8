//! Finding sink: a bounded ring of recent findings plus an LRU-bounded
//! dedupe cache of fingerprints with cooldowns.
//!
//! Eviction at the cap can only widen what gets emitted (a forgotten
//! fingerprint re-emits); it never suppresses a genuinely new finding.

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::Mutex;
use std::time::Duration;

use warden_model::{Finding, HostId, Severity};

/// Dedupe fingerprint cache: key → last emission instant, LRU-bounded.
#[derive(Debug)]
struct DedupeCache {
    cap: usize,
    last_emitted: HashMap<String, Duration>,
    /// Touch order, oldest first. Stale entries are skipped on eviction.
    order: VecDeque<(String, Duration)>,
}

impl DedupeCache {
    fn new(cap: usize) -> Self {
        Self {
            cap: cap.max(1),
            last_emitted: HashMap::new(),
            order: VecDeque::new(),
        }
    }

    /// True when `key` may emit (outside its cooldown); records the
    /// emission instant when it does.
    fn check_and_record(&mut self, key: &str, now: Duration, cooldown: Duration) -> bool {
        if let Some(last) = self.last_emitted.get(key)
            && now.saturating_sub(*last) < cooldown
        {
            return false;
        }
        self.last_emitted.insert(key.to_owned(), now);
        self.order.push_back((key.to_owned(), now));
        while self.last_emitted.len() > self.cap {
            let Some((oldest, touched)) = self.order.pop_front() else {
                break;
            };
            // Only evict if this order entry still reflects the key's
            // latest touch.
            if self.last_emitted.get(&oldest) == Some(&touched) {
                self.last_emitted.remove(&oldest);
            }
        }
        true
    }

    fn set_cap(&mut self, cap: usize) {
        self.cap = cap.max(1);
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct FindingStats {
    pub emitted: u64,
    pub deduplicated: u64,
}

/// Bounded store of the most recent findings.
pub struct FindingStore {
    inner: Mutex<Inner>,
}

struct Inner {
    max_findings: usize,
    ring: VecDeque<Finding>,
    dedupe: DedupeCache,
    stats: FindingStats,
}

impl fmt::Debug for FindingStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.lock();
        f.debug_struct("FindingStore")
            .field("stored", &inner.ring.len())
            .field("stats", &inner.stats)
            .finish()
    }
}

impl FindingStore {
    pub fn new(max_findings: usize, dedupe_cap: usize) -> Self {
        Self {
            inner: Mutex::new(Inner {
                max_findings: max_findings.max(1),
                ring: VecDeque::new(),
                dedupe: DedupeCache::new(dedupe_cap),
                stats: FindingStats::default(),
            }),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Live-tune the ring and dedupe capacities.
    pub fn set_caps(&self, max_findings: usize, dedupe_cap: usize) {
        let mut inner = self.lock();
        inner.max_findings = max_findings.max(1);
        inner.dedupe.set_cap(dedupe_cap);
        while inner.ring.len() > inner.max_findings {
            inner.ring.pop_front();
        }
    }

    /// Insert one finding unless its dedupe key is cooling down. Returns
    /// whether the finding was new (stored and emittable).
    pub fn insert(&self, finding: Finding, dedupe_key: &str, now: Duration, cooldown: Duration) -> bool {
        let mut inner = self.lock();
        if !inner.dedupe.check_and_record(dedupe_key, now, cooldown) {
            inner.stats.deduplicated += 1;
            return false;
        }
        if inner.ring.len() == inner.max_findings {
            inner.ring.pop_front();
        }
        inner.ring.push_back(finding);
        inner.stats.emitted += 1;
        true
    }

    /// Most-recent-first read, optionally filtered by host and minimum
    /// severity.
    pub fn query(&self, host: Option<&HostId>, min_severity: Option<Severity>) -> Vec<Finding> {
        let inner = self.lock();
        inner
            .ring
            .iter()
            .rev()
            .filter(|f| host.is_none_or(|h| &f.host_id == h))
            .filter(|f| min_severity.is_none_or(|s| f.severity >= s))
            .cloned()
            .collect()
    }

    pub fn stats(&self) -> FindingStats {
        self.lock().stats
    }

    pub fn len(&self) -> usize {
        self.lock().ring.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
