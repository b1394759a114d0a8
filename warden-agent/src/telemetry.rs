//! Bounded telemetry emission pipeline.
//!
//! Senders never block: when the queue is full the record is dropped and
//! `telemetry_queue_full` increments, because stalling a hot publisher
//! would skew every downstream aggregate view.

use std::collections::VecDeque;
use std::fmt;
use std::sync::{Arc, Mutex};

use serde_json::json;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use warden_core::bus::Bus;
use warden_core::metrics::Metrics;
use warden_model::{ArtifactId, HostId, Telemetry, TelemetryEnvelope, TelemetryKind};

/// How many recently emitted records `GET /telemetry` serves.
const RECENT_RING_CAP: usize = 256;

/// Shared ring of recently emitted envelopes.
pub type RecentTelemetry = Arc<Mutex<VecDeque<TelemetryEnvelope>>>;

/// Cheap cloneable handle used by every task that emits telemetry.
#[derive(Clone)]
pub struct TelemetrySender {
    tx: mpsc::Sender<TelemetryEnvelope>,
    host_id: HostId,
    metrics: Arc<Metrics>,
}

impl fmt::Debug for TelemetrySender {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TelemetrySender")
            .field("host_id", &self.host_id)
            .finish()
    }
}

impl TelemetrySender {
    pub fn emit(&self, envelope: TelemetryEnvelope) {
        if self.tx.try_send(envelope).is_err() {
            self.metrics.incr("telemetry_queue_full");
        }
    }

    /// Emit a lifecycle record for one artifact.
    pub fn lifecycle(&self, kind: TelemetryKind, artifact_id: &ArtifactId, detail: Option<&str>) {
        let mut data = json!({
            "artifact_id": artifact_id,
            "host_id": self.host_id,
        });
        if let Some(detail) = detail {
            data["detail"] = json!(detail);
        }
        self.emit(TelemetryEnvelope::new(kind, data));
    }

    /// Forward a probe telemetry sample downstream.
    pub fn sample(&self, telemetry: &Telemetry) {
        match serde_json::to_value(telemetry) {
            Ok(data) => self.emit(TelemetryEnvelope::new(TelemetryKind::ProgramTelemetry, data)),
            Err(e) => warn!("telemetry sample not serializable: {e}"),
        }
    }

    pub fn heartbeat(&self, data: serde_json::Value) {
        self.emit(TelemetryEnvelope::new(TelemetryKind::AgentHeartbeat, data));
    }
}

/// Drains the bounded queue onto the bus and mirrors records into the
/// recent ring.
pub struct TelemetryPublisher {
    rx: mpsc::Receiver<TelemetryEnvelope>,
    bus: Arc<dyn Bus>,
    subject: String,
    recent: RecentTelemetry,
}

impl fmt::Debug for TelemetryPublisher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TelemetryPublisher")
            .field("subject", &self.subject)
            .finish()
    }
}

impl TelemetryPublisher {
    pub async fn run(mut self, cancel: CancellationToken) {
        loop {
            tokio::select! {
                message = self.rx.recv() => {
                    let Some(envelope) = message else { break };
                    self.publish(envelope).await;
                }
                _ = cancel.cancelled() => {
                    // Drain whatever is already queued, then stop.
                    while let Ok(envelope) = self.rx.try_recv() {
                        self.publish(envelope).await;
                    }
                    break;
                }
            }
        }
        debug!("telemetry publisher stopped");
    }

    async fn publish(&self, envelope: TelemetryEnvelope) {
        {
            let mut ring = self.recent.lock().unwrap_or_else(|p| p.into_inner());
            if ring.len() == RECENT_RING_CAP {
                ring.pop_front();
            }
            ring.push_back(envelope.clone());
        }
        if let Err(e) = warden_core::bus::publish_json(self.bus.as_ref(), &self.subject, &envelope).await
        {
            if e.is_transient() {
                warn!(kind = e.kind(), "telemetry publish failed: {e}");
            } else {
                tracing::error!(kind = e.kind(), "telemetry publish failed: {e}");
            }
        }
    }
}

/// Build the sender/publisher pair plus the shared recent ring.
pub fn channel(
    capacity: usize,
    host_id: HostId,
    bus: Arc<dyn Bus>,
    subject: String,
    metrics: Arc<Metrics>,
) -> (TelemetrySender, TelemetryPublisher, RecentTelemetry) {
    let (tx, rx) = mpsc::channel(capacity);
    let recent: RecentTelemetry = Arc::new(Mutex::new(VecDeque::with_capacity(RECENT_RING_CAP)));
    let sender = TelemetrySender { tx, host_id, metrics };
    let publisher = TelemetryPublisher {
        rx,
        bus,
        subject,
        recent: Arc::clone(&recent),
    };
    (sender, publisher, recent)
}
