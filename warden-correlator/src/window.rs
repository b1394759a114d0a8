//! Per-host sliding window of recent events.
//!
//! Two-level locking: public operations take only the per-host lock; the GC
//! sweep takes the table lock to walk and evict hosts, never both at once
//! during iteration. Events are cloned out; no reference escapes a lock.

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use tracing::debug;
use warden_model::{Event, HostId};

type HostRing = Arc<Mutex<VecDeque<(Event, Duration)>>>;

pub struct WindowBuffer {
    hosts: RwLock<HashMap<HostId, HostRing>>,
    max_age: Mutex<Duration>,
}

impl fmt::Debug for WindowBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let hosts = self.hosts.read().map(|h| h.len()).unwrap_or(0);
        f.debug_struct("WindowBuffer").field("hosts", &hosts).finish()
    }
}

impl WindowBuffer {
    pub fn new(max_age: Duration) -> Self {
        Self {
            hosts: RwLock::new(HashMap::new()),
            max_age: Mutex::new(max_age),
        }
    }

    /// Raise or lower the retention ceiling. Must cover the largest rule
    /// window or prior-event lookups silently shrink.
    pub fn set_max_age(&self, max_age: Duration) {
        *self.max_age.lock().unwrap_or_else(|p| p.into_inner()) = max_age;
    }

    pub fn max_age(&self) -> Duration {
        *self.max_age.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn ring(&self, host: &HostId) -> HostRing {
        if let Some(ring) = self
            .hosts
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .get(host)
        {
            return Arc::clone(ring);
        }
        let mut hosts = self.hosts.write().unwrap_or_else(|p| p.into_inner());
        Arc::clone(hosts.entry(host.clone()).or_default())
    }

    /// Append one event with its arrival instant.
    pub fn push(&self, event: Event, arrived: Duration) {
        let ring = self.ring(&event.host_id);
        let mut ring = ring.lock().unwrap_or_else(|p| p.into_inner());
        ring.push_back((event, arrived));
    }

    /// Events for `host` that arrived within `within` of `now`, oldest
    /// first.
    pub fn recent_events(&self, host: &HostId, within: Duration, now: Duration) -> Vec<Event> {
        let cutoff = now.saturating_sub(within);
        let ring = self.ring(host);
        let ring = ring.lock().unwrap_or_else(|p| p.into_inner());
        ring.iter()
            .filter(|(_, arrived)| *arrived >= cutoff)
            .map(|(event, _)| event.clone())
            .collect()
    }

    /// Same as [`recent_events`](Self::recent_events), filtered by type tag.
    pub fn recent_by_type(
        &self,
        host: &HostId,
        event_type: &str,
        within: Duration,
        now: Duration,
    ) -> Vec<Event> {
        self.recent_events(host, within, now)
            .into_iter()
            .filter(|event| event.event_type == event_type)
            .collect()
    }

    /// Drop entries older than the max age and evict empty hosts.
    pub fn gc(&self, now: Duration) {
        let cutoff = now.saturating_sub(self.max_age());

        // Pass 1: trim each ring under its own lock.
        let rings: Vec<(HostId, HostRing)> = {
            let hosts = self.hosts.read().unwrap_or_else(|p| p.into_inner());
            hosts
                .iter()
                .map(|(host, ring)| (host.clone(), Arc::clone(ring)))
                .collect()
        };
        let mut empties = Vec::new();
        for (host, ring) in rings {
            let mut ring = ring.lock().unwrap_or_else(|p| p.into_inner());
            while matches!(ring.front(), Some((_, arrived)) if *arrived < cutoff) {
                ring.pop_front();
            }
            if ring.is_empty() {
                empties.push(host);
            }
        }

        // Pass 2: evict hosts that stayed empty, under the table lock.
        if !empties.is_empty() {
            let mut hosts = self.hosts.write().unwrap_or_else(|p| p.into_inner());
            for host in empties {
                let still_empty = hosts
                    .get(&host)
                    .is_some_and(|ring| ring.lock().unwrap_or_else(|p| p.into_inner()).is_empty());
                if still_empty {
                    hosts.remove(&host);
                }
            }
            debug!(remaining = hosts.len(), "window buffer GC swept");
        }
    }

    pub fn host_count(&self) -> usize {
        self.hosts.read().unwrap_or_else(|p| p.into_inner()).len()
    }
}
