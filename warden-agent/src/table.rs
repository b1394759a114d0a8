//! The probe table: exclusive owner of every probe loaded on this host.
//!
//! Invariants enforced here:
//! - at most one probe per artifact id,
//! - a `Gone` probe has had its kernel handle released before the
//!   transition returns,
//! - unload is idempotent,
//! - no lock is held across a kernel call.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::RwLock;
use tracing::{error, info, warn};
use warden_core::clock::Clock;
use warden_core::error::{CoreError, Result};
use warden_core::kernel::{KernelLoader, ProbeHandle};
use warden_core::metrics::Metrics;
use warden_model::{
    ArtifactDescriptor, ArtifactId, ProbeSnapshot, ProbeStatus, RollbackReason, Telemetry,
    TelemetryKind,
};

use crate::telemetry::TelemetrySender;

/// One loaded probe. Exclusively owned by the table; destroyed on unload.
#[derive(Debug, Clone)]
pub struct Probe {
    pub artifact_id: ArtifactId,
    pub name: String,
    pub version: String,
    pub handle: Option<ProbeHandle>,
    pub status: ProbeStatus,
    /// Monotonic lifetime deadline.
    pub deadline: Duration,
    pub loaded_at: DateTime<Utc>,
    pub last_telemetry: Option<Telemetry>,
}

/// Result of an unload request; all outcomes leave the table consistent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnloadOutcome {
    /// The probe was present and is now gone.
    Unloaded,
    /// Another unload owns the probe; nothing to do.
    InFlight,
    /// No such probe.
    NotFound,
}

pub struct ProbeTable {
    clock: Arc<dyn Clock>,
    loader: Arc<dyn KernelLoader>,
    telemetry: TelemetrySender,
    metrics: Arc<Metrics>,
    probes: RwLock<HashMap<ArtifactId, Probe>>,
}

impl fmt::Debug for ProbeTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProbeTable").finish_non_exhaustive()
    }
}

impl ProbeTable {
    pub fn new(
        clock: Arc<dyn Clock>,
        loader: Arc<dyn KernelLoader>,
        telemetry: TelemetrySender,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            clock,
            loader,
            telemetry,
            metrics,
            probes: RwLock::new(HashMap::new()),
        }
    }

    /// Insert a freshly attached probe in `Running` state.
    ///
    /// The caller attached the handle; on a duplicate id this returns an
    /// invariant error and the caller must release that handle itself.
    pub async fn insert_running(
        &self,
        descriptor: &ArtifactDescriptor,
        handle: ProbeHandle,
        lifetime: Duration,
    ) -> Result<()> {
        let deadline = self.clock.monotonic() + lifetime;
        let mut probes = self.probes.write().await;
        if probes.contains_key(&descriptor.id) {
            self.metrics.incr("duplicate_insert_rejected");
            return Err(CoreError::Invariant(format!(
                "probe for artifact {} already present",
                descriptor.id
            )));
        }
        probes.insert(
            descriptor.id.clone(),
            Probe {
                artifact_id: descriptor.id.clone(),
                name: descriptor.name.clone(),
                version: descriptor.version.clone(),
                handle: Some(handle),
                status: ProbeStatus::Running,
                deadline,
                loaded_at: self.clock.wall(),
                last_telemetry: None,
            },
        );
        drop(probes);

        info!(artifact = %descriptor.id, %handle, "probe loaded");
        self.metrics.incr("probes_loaded_total");
        self.telemetry
            .lifecycle(TelemetryKind::ProgramLoaded, &descriptor.id, None);
        Ok(())
    }

    /// Unload one probe: `Running → Unloading → Gone`.
    ///
    /// Detach happens at the `Unloading` edge with no lock held; the handle
    /// is released before the entry is removed and before this returns.
    /// Idempotent: concurrent and repeated calls converge on one detach.
    pub async fn unload(
        &self,
        artifact_id: &ArtifactId,
        reason: RollbackReason,
        detail: Option<&str>,
    ) -> UnloadOutcome {
        let handle = {
            let mut probes = self.probes.write().await;
            let Some(probe) = probes.get_mut(artifact_id) else {
                return UnloadOutcome::NotFound;
            };
            if matches!(probe.status, ProbeStatus::Unloading | ProbeStatus::Gone) {
                return UnloadOutcome::InFlight;
            }
            probe.status = ProbeStatus::Unloading;
            probe.handle.take()
        };

        if let Some(handle) = handle {
            if let Err(e) = self.loader.detach(handle).await {
                // The kernel may already have dropped the program; wedging
                // the table on a detach failure is worse than leaking the
                // handle. Operators see the counter.
                error!(artifact = %artifact_id, %handle, "detach failed: {e}");
                self.metrics.incr("detach_failures");
            }
        }

        {
            let mut probes = self.probes.write().await;
            if let Some(probe) = probes.get_mut(artifact_id) {
                probe.status = ProbeStatus::Gone;
            }
            probes.remove(artifact_id);
        }

        info!(artifact = %artifact_id, ?reason, "probe unloaded");
        self.metrics.incr("probes_unloaded_total");
        let kind = match reason {
            RollbackReason::Manual | RollbackReason::ThresholdBreach => {
                TelemetryKind::ProgramRolledBack
            }
            RollbackReason::Expired | RollbackReason::Shutdown => TelemetryKind::ProgramUnloaded,
        };
        let reason_tag = match reason {
            RollbackReason::Expired => "expired",
            RollbackReason::Manual => "manual",
            RollbackReason::ThresholdBreach => "threshold_breach",
            RollbackReason::Shutdown => "shutdown",
        };
        let detail = match detail {
            Some(detail) => format!("{reason_tag}: {detail}"),
            None => reason_tag.to_owned(),
        };
        self.telemetry.lifecycle(kind, artifact_id, Some(&detail));
        UnloadOutcome::Unloaded
    }

    /// Unload everything, best-effort, for shutdown.
    pub async fn unload_all(&self, reason: RollbackReason) {
        let ids: Vec<ArtifactId> = {
            let probes = self.probes.read().await;
            probes.keys().cloned().collect()
        };
        for id in ids {
            self.unload(&id, reason, None).await;
        }
    }

    /// Record a telemetry sample against its probe. Returns false for
    /// unknown artifacts.
    pub async fn update_telemetry(&self, telemetry: &Telemetry) -> bool {
        let mut probes = self.probes.write().await;
        match probes.get_mut(&telemetry.artifact_id) {
            Some(probe) => {
                probe.last_telemetry = Some(telemetry.clone());
                true
            }
            None => false,
        }
    }

    /// Flip a probe between `Running` and `Failing` as breach intents open
    /// and clear. Probes already unloading are left alone.
    pub async fn mark_health(&self, artifact_id: &ArtifactId, failing: bool) {
        let mut probes = self.probes.write().await;
        if let Some(probe) = probes.get_mut(artifact_id) {
            match (probe.status, failing) {
                (ProbeStatus::Running, true) => probe.status = ProbeStatus::Failing,
                (ProbeStatus::Failing, false) => probe.status = ProbeStatus::Running,
                _ => {}
            }
        }
    }

    pub async fn contains(&self, artifact_id: &ArtifactId) -> bool {
        self.probes.read().await.contains_key(artifact_id)
    }

    pub async fn active_count(&self) -> usize {
        self.probes.read().await.len()
    }

    /// Artifacts whose lifetime deadline has passed.
    pub async fn expired(&self) -> Vec<ArtifactId> {
        let now = self.clock.monotonic();
        let probes = self.probes.read().await;
        probes
            .values()
            .filter(|p| {
                matches!(p.status, ProbeStatus::Running | ProbeStatus::Failing)
                    && p.deadline <= now
            })
            .map(|p| p.artifact_id.clone())
            .collect()
    }

    /// Read-only snapshot for the admin surface.
    pub async fn snapshot(&self) -> Vec<ProbeSnapshot> {
        let now = self.clock.monotonic();
        let probes = self.probes.read().await;
        let mut rows: Vec<ProbeSnapshot> = probes
            .values()
            .map(|p| ProbeSnapshot {
                artifact_id: p.artifact_id.clone(),
                name: p.name.clone(),
                version: p.version.clone(),
                status: p.status,
                remaining_lifetime_secs: p.deadline.saturating_sub(now).as_secs(),
                loaded_at: p.loaded_at,
                last_telemetry: p.last_telemetry.clone(),
            })
            .collect();
        rows.sort_by(|a, b| a.artifact_id.cmp(&b.artifact_id));
        rows
    }

    /// Current probe counts keyed by status wire name.
    pub async fn counts(&self) -> BTreeMap<&'static str, usize> {
        let probes = self.probes.read().await;
        let mut counts = BTreeMap::new();
        for probe in probes.values() {
            let key = match probe.status {
                ProbeStatus::Loading => "loading",
                ProbeStatus::Running => "running",
                ProbeStatus::Failing => "failing",
                ProbeStatus::Unloading => "unloading",
                ProbeStatus::Gone => "gone",
            };
            *counts.entry(key).or_insert(0) += 1;
        }
        counts
    }
}

impl ProbeTable {
    /// Warn-once helper for the reconciler's capacity gate.
    pub async fn at_capacity(&self, max_programs: usize) -> bool {
        let at_cap = self.active_count().await >= max_programs;
        if at_cap {
            warn!(max_programs, "probe table at capacity");
            self.metrics.incr("capacity_reached");
        }
        at_cap
    }
}
