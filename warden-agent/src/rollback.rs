//! Out-of-band rollback handling: the `rollback.<host_id>` subscription and
//! the admin-surface request path share one coordinator, so every rollback
//! lands in the same history ring with the same semantics.

use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use warden_core::bus::Bus;
use warden_core::clock::Clock;
use warden_core::metrics::Metrics;
use warden_core::subjects;
use warden_model::{ArtifactId, HostId, HostRollbackCommand, RollbackReason};

use crate::table::{ProbeTable, UnloadOutcome};

const HISTORY_CAP: usize = 128;

/// One processed rollback request.
#[derive(Debug, Clone, Serialize)]
pub struct RollbackEntry {
    pub artifact_id: ArtifactId,
    pub reason: String,
    /// `ok`, `in_flight`, or `not_found`.
    pub outcome: &'static str,
    pub at: DateTime<Utc>,
}

pub struct RollbackCoordinator {
    table: Arc<ProbeTable>,
    clock: Arc<dyn Clock>,
    metrics: Arc<Metrics>,
    history: Mutex<VecDeque<RollbackEntry>>,
}

impl fmt::Debug for RollbackCoordinator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RollbackCoordinator").finish_non_exhaustive()
    }
}

impl RollbackCoordinator {
    pub fn new(table: Arc<ProbeTable>, clock: Arc<dyn Clock>, metrics: Arc<Metrics>) -> Self {
        Self {
            table,
            clock,
            metrics,
            history: Mutex::new(VecDeque::with_capacity(HISTORY_CAP)),
        }
    }

    /// Unload `artifact_id` with reason `Manual` and record the outcome.
    /// Unknown artifacts are recorded and reported, never fatal.
    pub async fn request(&self, artifact_id: &ArtifactId, reason: &str) -> UnloadOutcome {
        let outcome = self
            .table
            .unload(artifact_id, RollbackReason::Manual, Some(reason))
            .await;
        let tag = match outcome {
            UnloadOutcome::Unloaded => "ok",
            UnloadOutcome::InFlight => "in_flight",
            UnloadOutcome::NotFound => "not_found",
        };
        if outcome == UnloadOutcome::NotFound {
            warn!(artifact = %artifact_id, "rollback for unknown artifact");
            self.metrics.incr("rollback_not_found");
        } else {
            self.metrics.incr("rollbacks_processed");
        }

        let mut history = self.history.lock().await;
        if history.len() == HISTORY_CAP {
            history.pop_front();
        }
        history.push_back(RollbackEntry {
            artifact_id: artifact_id.clone(),
            reason: reason.to_owned(),
            outcome: tag,
            at: self.clock.wall(),
        });
        outcome
    }

    pub async fn history(&self) -> Vec<RollbackEntry> {
        self.history.lock().await.iter().cloned().collect()
    }

    /// Consume `rollback.<host_id>` until cancelled.
    pub async fn listen(
        self: Arc<Self>,
        bus: Arc<dyn Bus>,
        host_id: HostId,
        cancel: CancellationToken,
    ) {
        let subject = subjects::rollback_for(&host_id);
        let mut subscription = match bus.subscribe(&subject).await {
            Ok(subscription) => subscription,
            Err(e) => {
                warn!(subject = %subject, "rollback subscription failed: {e}");
                return;
            }
        };
        info!(subject = %subject, "rollback listener started");

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                message = subscription.recv() => {
                    let Some(message) = message else { break };
                    match message.json::<HostRollbackCommand>() {
                        Ok(command) => {
                            let reason = if command.reason.is_empty() {
                                "bus rollback"
                            } else {
                                command.reason.as_str()
                            };
                            self.request(&command.artifact_id, reason).await;
                        }
                        Err(e) => {
                            debug!("malformed rollback command dropped: {e}");
                            self.metrics.incr("malformed_rollback_commands");
                        }
                    }
                }
            }
        }
        debug!("rollback listener stopped");
    }
}
