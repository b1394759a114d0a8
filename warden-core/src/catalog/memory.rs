use std::collections::HashMap;
use std::fmt;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use warden_model::{ArtifactDescriptor, ArtifactId, HostId};

use super::{Catalog, HostArtifacts};
use crate::error::{CoreError, Result};

/// Deterministic in-memory catalog for tests and demos.
#[derive(Default)]
pub struct MemoryCatalog {
    healthy: AtomicBool,
    state: Mutex<State>,
}

#[derive(Default)]
struct State {
    assignments: HashMap<HostId, Vec<ArtifactDescriptor>>,
    binaries: HashMap<ArtifactId, Vec<u8>>,
    next_poll_secs: Option<u64>,
}

impl fmt::Debug for MemoryCatalog {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryCatalog")
            .field("healthy", &self.healthy.load(Ordering::Relaxed))
            .finish()
    }
}

impl MemoryCatalog {
    pub fn new() -> Self {
        Self {
            healthy: AtomicBool::new(true),
            state: Mutex::new(State::default()),
        }
    }

    pub fn set_healthy(&self, healthy: bool) {
        self.healthy.store(healthy, Ordering::Relaxed);
    }

    pub fn set_next_poll_secs(&self, hint: Option<u64>) {
        self.lock().next_poll_secs = hint;
    }

    /// Assign an artifact (descriptor + bytes) to a host.
    pub fn assign(&self, host: &HostId, descriptor: ArtifactDescriptor, binary: Vec<u8>) {
        let mut state = self.lock();
        state.binaries.insert(descriptor.id.clone(), binary);
        state
            .assignments
            .entry(host.clone())
            .or_default()
            .push(descriptor);
    }

    /// Drop an artifact from a host's assignment list (bytes stay fetchable).
    pub fn unassign(&self, host: &HostId, id: &ArtifactId) {
        if let Some(list) = self.lock().assignments.get_mut(host) {
            list.retain(|d| &d.id != id);
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, State> {
        // Poisoning only happens if a test panicked while holding the lock.
        self.state.lock().unwrap_or_else(|poison| poison.into_inner())
    }
}

#[async_trait]
impl Catalog for MemoryCatalog {
    async fn health(&self) -> Result<()> {
        if self.healthy.load(Ordering::Relaxed) {
            Ok(())
        } else {
            Err(CoreError::Catalog("catalog marked unhealthy".into()))
        }
    }

    async fn for_host(&self, host: &HostId) -> Result<HostArtifacts> {
        if !self.healthy.load(Ordering::Relaxed) {
            return Err(CoreError::Catalog("catalog marked unhealthy".into()));
        }
        let state = self.lock();
        let artifacts = state.assignments.get(host).cloned().unwrap_or_default();
        Ok(HostArtifacts {
            total: artifacts.len(),
            artifacts,
            next_poll_secs: state.next_poll_secs,
        })
    }

    async fn fetch(&self, id: &ArtifactId) -> Result<Vec<u8>> {
        self.lock()
            .binaries
            .get(id)
            .cloned()
            .ok_or_else(|| CoreError::NotFound(format!("artifact {id}")))
    }
}
