//! Rollback execution per strategy.
//!
//! Every per-target rollback publishes the wire command and the direct
//! per-host command, then waits for the agent's rolled-back ack (or a
//! per-target timeout). Idempotent by `(request_id, target_id)`: a repeat
//! request converges on the same end-state without republishing.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use tokio::sync::Mutex;
use tracing::{info, warn};
use warden_core::bus::{Bus, publish_json};
use warden_core::clock::Clock;
use warden_core::metrics::Metrics;
use warden_core::subjects;
use warden_model::{
    ArtifactId, HostId, HostRollbackCommand, RequestId, RollbackAction, RollbackStrategy,
    TargetState,
};

/// Per-target result of a rollback pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RollbackOutcome {
    pub target_id: HostId,
    pub state: TargetState,
}

pub struct RollbackPlanner {
    pub bus: Arc<dyn Bus>,
    pub aggregate: Arc<crate::aggregate::AggregateView>,
    pub clock: Arc<dyn Clock>,
    pub metrics: Arc<Metrics>,
    pub batch_size: usize,
    pub inter_batch_pause: Duration,
    pub failure_tolerance: usize,
    pub target_timeout: Duration,
    /// Final state per `(request_id, target)`; repeat requests converge on
    /// the recorded end-state.
    ledger: Mutex<HashMap<(RequestId, HostId), TargetState>>,
}

impl fmt::Debug for RollbackPlanner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RollbackPlanner")
            .field("batch_size", &self.batch_size)
            .field("target_timeout", &self.target_timeout)
            .finish_non_exhaustive()
    }
}

impl RollbackPlanner {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        bus: Arc<dyn Bus>,
        aggregate: Arc<crate::aggregate::AggregateView>,
        clock: Arc<dyn Clock>,
        metrics: Arc<Metrics>,
        batch_size: usize,
        inter_batch_pause: Duration,
        failure_tolerance: usize,
        target_timeout: Duration,
    ) -> Self {
        Self {
            bus,
            aggregate,
            clock,
            metrics,
            batch_size: batch_size.max(1),
            inter_batch_pause,
            failure_tolerance,
            target_timeout,
            ledger: Mutex::new(HashMap::new()),
        }
    }

    /// Execute a rollback over `targets` with the given strategy. The
    /// caller has already narrowed the target list (selective strategy
    /// narrows to failed/rolling-back targets).
    pub async fn execute(
        &self,
        request_id: RequestId,
        artifact_id: &ArtifactId,
        strategy: RollbackStrategy,
        targets: Vec<HostId>,
        timeout: Duration,
    ) -> Vec<RollbackOutcome> {
        info!(%request_id, ?strategy, targets = targets.len(), "rollback started");
        self.metrics.incr("rollbacks_started");
        match strategy {
            RollbackStrategy::Immediate | RollbackStrategy::Selective => {
                // All targets in parallel, bounded by the tighter of the
                // per-target and overall timeouts.
                let per_target = self.target_timeout.min(timeout);
                let futures = targets.into_iter().map(|target| async move {
                    let state = self.rollback_one(request_id, artifact_id, &target, per_target).await;
                    RollbackOutcome { target_id: target, state }
                });
                join_all(futures).await
            }
            RollbackStrategy::Gradual => self.gradual(request_id, artifact_id, targets).await,
        }
    }

    /// Batches of `batch_size` with a settle pause between them; remaining
    /// batches are abandoned once a batch exceeds the failure tolerance.
    async fn gradual(
        &self,
        request_id: RequestId,
        artifact_id: &ArtifactId,
        targets: Vec<HostId>,
    ) -> Vec<RollbackOutcome> {
        let mut outcomes = Vec::with_capacity(targets.len());
        let mut batches = targets.chunks(self.batch_size).peekable();
        while let Some(batch) = batches.next() {
            let futures = batch.iter().map(|target| async move {
                let state = self
                    .rollback_one(request_id, artifact_id, target, self.target_timeout)
                    .await;
                RollbackOutcome { target_id: target.clone(), state }
            });
            let batch_outcomes = join_all(futures).await;
            let failures = batch_outcomes
                .iter()
                .filter(|o| o.state == TargetState::Failed)
                .count();
            outcomes.extend(batch_outcomes);

            if failures > self.failure_tolerance {
                warn!(%request_id, failures, "gradual rollback aborted, batch exceeded tolerance");
                self.metrics.incr("gradual_rollbacks_aborted");
                for target in batches.flatten() {
                    outcomes.push(RollbackOutcome {
                        target_id: target.clone(),
                        state: TargetState::Failed,
                    });
                }
                break;
            }
            if batches.peek().is_some() {
                tokio::time::sleep(self.inter_batch_pause).await;
            }
        }
        outcomes
    }

    /// Roll back one target: publish, then wait for the agent ack.
    async fn rollback_one(
        &self,
        request_id: RequestId,
        artifact_id: &ArtifactId,
        target: &HostId,
        timeout: Duration,
    ) -> TargetState {
        let key = (request_id, target.clone());
        if let Some(state) = self.ledger.lock().await.get(&key) {
            self.metrics.incr("rollbacks_deduplicated");
            return *state;
        }

        let since = self.clock.monotonic();
        let action = RollbackAction::new(request_id, Some(artifact_id.clone()), vec![target.clone()]);
        let wire = publish_json(self.bus.as_ref(), subjects::ACTIONS_ROLLBACK_EBPF, &action).await;
        let direct = publish_json(
            self.bus.as_ref(),
            &subjects::rollback_for(target),
            &HostRollbackCommand {
                artifact_id: artifact_id.clone(),
                reason: format!("rollout {request_id}"),
            },
        )
        .await;

        let state = if let Err(e) = wire.and(direct) {
            warn!(%request_id, %target, "rollback publish failed: {e}");
            self.metrics.incr("rollback_publish_failures");
            TargetState::Failed
        } else {
            let deadline = tokio::time::Instant::now() + timeout;
            loop {
                if self.aggregate.acked_since(target, artifact_id, since) {
                    self.metrics.incr("rollbacks_acked");
                    break TargetState::RolledBack;
                }
                if tokio::time::Instant::now() >= deadline {
                    warn!(%request_id, %target, "rollback ack timed out");
                    self.metrics.incr("rollback_ack_timeouts");
                    break TargetState::Failed;
                }
                tokio::time::sleep(Duration::from_millis(50)).await;
            }
        };
        self.ledger.lock().await.insert(key, state);
        state
    }
}
