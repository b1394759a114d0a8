//! Catalog reconciliation loop.
//!
//! Every tick compares the catalog's authoritative list for this host with
//! the probe table and loads what is missing. Disappearance from the list
//! does NOT unload: lifetime and explicit rollback own unloads, so a
//! transient catalog blip cannot nuke the host.

use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use warden_core::catalog::Catalog;
use warden_core::kernel::KernelLoader;
use warden_core::metrics::Metrics;
use warden_core::signature::{SignatureVerifier, sha256_hex};
use warden_model::{ArtifactDescriptor, ArtifactId, HostId, TelemetryKind};

use crate::cache::ArtifactCache;
use crate::table::ProbeTable;
use crate::telemetry::TelemetrySender;

pub struct Reconciler {
    pub host_id: HostId,
    pub poll_interval: Duration,
    pub max_programs: usize,
    pub default_lifetime: Duration,
    pub signing_key: String,

    pub catalog: Arc<dyn Catalog>,
    pub verifier: Arc<dyn SignatureVerifier>,
    pub loader: Arc<dyn KernelLoader>,
    pub table: Arc<ProbeTable>,
    pub cache: ArtifactCache,
    pub telemetry: TelemetrySender,
    pub metrics: Arc<Metrics>,

    /// `(artifact, checksum)` pairs whose signature failed; the same bytes
    /// are never retried.
    rejected: Mutex<HashSet<(ArtifactId, String)>>,
}

impl fmt::Debug for Reconciler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Reconciler")
            .field("host_id", &self.host_id)
            .field("poll_interval", &self.poll_interval)
            .field("max_programs", &self.max_programs)
            .finish_non_exhaustive()
    }
}

#[allow(clippy::too_many_arguments)]
impl Reconciler {
    pub fn new(
        host_id: HostId,
        poll_interval: Duration,
        max_programs: usize,
        default_lifetime: Duration,
        signing_key: String,
        catalog: Arc<dyn Catalog>,
        verifier: Arc<dyn SignatureVerifier>,
        loader: Arc<dyn KernelLoader>,
        table: Arc<ProbeTable>,
        cache: ArtifactCache,
        telemetry: TelemetrySender,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            host_id,
            poll_interval,
            max_programs,
            default_lifetime,
            signing_key,
            catalog,
            verifier,
            loader,
            table,
            cache,
            telemetry,
            metrics,
            rejected: Mutex::new(HashSet::new()),
        }
    }

    /// One reconciliation pass. Returns the catalog's next-poll hint, if it
    /// sent one.
    pub async fn tick(&self) -> Option<Duration> {
        if let Err(e) = self.catalog.health().await {
            warn!(kind = e.kind(), "catalog unavailable, skipping tick: {e}");
            self.metrics.incr("catalog_unavailable_ticks");
            return None;
        }

        let list = match self.catalog.for_host(&self.host_id).await {
            Ok(list) => list,
            Err(e) => {
                warn!(kind = e.kind(), "catalog list failed, skipping tick: {e}");
                self.metrics.incr("catalog_unavailable_ticks");
                return None;
            }
        };

        debug!(total = list.total, "catalog list fetched");
        for descriptor in &list.artifacts {
            self.converge(descriptor).await;
        }

        list.next_poll_secs.map(Duration::from_secs)
    }

    /// Bring one descriptor into the table, if it is not there already.
    async fn converge(&self, descriptor: &ArtifactDescriptor) {
        if let Err(e) = descriptor.validate() {
            warn!(artifact = %descriptor.id, "invalid descriptor rejected: {e}");
            self.metrics.incr("invalid_descriptors");
            return;
        }
        if self.table.contains(&descriptor.id).await {
            return;
        }
        let fingerprint = (descriptor.id.clone(), descriptor.checksum.clone());
        if self.rejected.lock().await.contains(&fingerprint) {
            debug!(artifact = %descriptor.id, "skipping signature-rejected bytes");
            return;
        }
        if self.table.at_capacity(self.max_programs).await {
            return;
        }

        let bytes = match self.obtain_bytes(descriptor).await {
            Some(bytes) => bytes,
            None => return,
        };

        if !self
            .verifier
            .verify(&bytes, &descriptor.signature, &self.signing_key)
        {
            warn!(artifact = %descriptor.id, "signature verification failed");
            self.metrics.incr("signature_rejected");
            self.telemetry.lifecycle(
                TelemetryKind::ProgramError,
                &descriptor.id,
                Some("signature verification failed"),
            );
            self.rejected.lock().await.insert(fingerprint);
            return;
        }

        let handle = match self.loader.attach(&bytes, &descriptor.parameters).await {
            Ok(handle) => handle,
            Err(e) => {
                warn!(artifact = %descriptor.id, "attach failed: {e}");
                self.metrics.incr("attach_failures");
                let detail = match e.verifier_diagnostic() {
                    Some(diagnostic) => format!("verifier: {diagnostic}"),
                    None => format!("attach: {e}"),
                };
                self.telemetry
                    .lifecycle(TelemetryKind::ProgramError, &descriptor.id, Some(&detail));
                return;
            }
        };

        let lifetime = descriptor
            .lifetime_secs
            .map(Duration::from_secs)
            .unwrap_or(self.default_lifetime);
        if let Err(e) = self
            .table
            .insert_running(descriptor, handle, lifetime)
            .await
        {
            // Lost a race with another load of the same artifact; release
            // the handle we are holding.
            warn!(artifact = %descriptor.id, "insert rejected: {e}");
            if let Err(detach_err) = self.loader.detach(handle).await {
                warn!(artifact = %descriptor.id, "detach of raced handle failed: {detach_err}");
            }
        }
    }

    /// Artifact bytes from cache or catalog, checksum-verified either way.
    async fn obtain_bytes(&self, descriptor: &ArtifactDescriptor) -> Option<Vec<u8>> {
        if let Some(bytes) = self.cache.get(&descriptor.checksum).await {
            return Some(bytes);
        }
        let bytes = match self.catalog.fetch(&descriptor.id).await {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!(artifact = %descriptor.id, kind = e.kind(), "fetch failed: {e}");
                self.metrics.incr("fetch_failures");
                return None;
            }
        };
        if sha256_hex(&bytes) != descriptor.checksum {
            warn!(artifact = %descriptor.id, "checksum mismatch on fetched bytes");
            self.metrics.incr("checksum_mismatches");
            self.telemetry.lifecycle(
                TelemetryKind::ProgramError,
                &descriptor.id,
                Some("checksum mismatch"),
            );
            return None;
        }
        if let Err(e) = self.cache.put(&descriptor.checksum, &bytes).await {
            warn!(artifact = %descriptor.id, "cache write failed: {e}");
        }
        Some(bytes)
    }

    /// Poll until cancelled, honoring next-poll hints for the following
    /// tick only.
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        info!(host = %self.host_id, interval = ?self.poll_interval, "reconciler started");
        loop {
            let hint = self.tick().await;
            let sleep = hint.unwrap_or(self.poll_interval);
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(sleep) => {}
            }
        }
        info!("reconciler stopped");
    }
}
