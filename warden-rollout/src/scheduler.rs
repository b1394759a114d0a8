//! The rollout scheduler: one owning task per active rollout drives the
//! phase machine; external readers see periodic status snapshots.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::{Mutex, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use warden_core::bus::{Bus, publish_json};
use warden_core::clock::Clock;
use warden_core::error::{CoreError, Result};
use warden_core::metrics::Metrics;
use warden_core::subjects;
use warden_model::{
    ApplyAction, ArtifactId, HostId, RequestId, RollbackStrategy, RolloutFailureReason,
    RolloutPhase, RolloutSnapshot, RolloutThresholds, TargetState, TargetStatus,
};

use crate::aggregate::{AggregateView, ObservationVerdict};
use crate::rollback::{RollbackOutcome, RollbackPlanner};

/// Accepted shape of `POST /apply/ebpf`.
#[derive(Debug, Clone, serde::Deserialize)]
pub struct ApplyRequest {
    pub plan_id: String,
    pub artifact_id: ArtifactId,
    pub targets: Vec<HostId>,
    #[serde(default)]
    pub lifetime_secs: Option<u64>,
    #[serde(default = "default_canary")]
    pub canary: bool,
}

fn default_canary() -> bool {
    true
}

/// Accepted shape of `POST /apply/ebpf/{request_id}/rollback`.
#[derive(Debug, Clone, serde::Deserialize)]
pub struct RollbackRequest {
    pub strategy: RollbackStrategy,
    #[serde(default)]
    pub targets: Option<Vec<HostId>>,
    #[serde(default)]
    pub reason: String,
    #[serde(default)]
    pub timeout_secs: Option<u64>,
}

#[derive(Debug, Clone)]
struct TargetEntry {
    host: HostId,
    state: TargetState,
    canary: bool,
}

#[derive(Debug)]
struct RolloutState {
    request_id: RequestId,
    plan_id: String,
    artifact_id: ArtifactId,
    phase: RolloutPhase,
    targets: Vec<TargetEntry>,
    failure_reason: Option<RolloutFailureReason>,
    started_at: chrono::DateTime<Utc>,
    finished_at: Option<chrono::DateTime<Utc>>,
}

impl RolloutState {
    fn snapshot(&self) -> RolloutSnapshot {
        RolloutSnapshot {
            request_id: self.request_id,
            plan_id: self.plan_id.clone(),
            artifact_id: self.artifact_id.clone(),
            phase: self.phase,
            targets: self
                .targets
                .iter()
                .map(|t| TargetStatus {
                    target_id: t.host.clone(),
                    state: t.state,
                    canary: t.canary,
                    detail: None,
                })
                .collect(),
            failure_reason: self.failure_reason,
            started_at: self.started_at,
            finished_at: self.finished_at,
        }
    }

    fn mark(&mut self, hosts: &[HostId], state: TargetState) {
        for entry in &mut self.targets {
            if hosts.contains(&entry.host) {
                entry.state = state;
            }
        }
    }

    fn hosts(&self, canary: Option<bool>) -> Vec<HostId> {
        self.targets
            .iter()
            .filter(|t| canary.is_none_or(|c| t.canary == c))
            .map(|t| t.host.clone())
            .collect()
    }

    fn finish(&mut self, phase: RolloutPhase) {
        // Terminal states are absorbing.
        if self.phase.is_terminal() {
            return;
        }
        self.phase = phase;
        self.finished_at = Some(Utc::now());
    }
}

type SharedState = Arc<Mutex<RolloutState>>;

pub struct RolloutScheduler {
    pub bus: Arc<dyn Bus>,
    pub clock: Arc<dyn Clock>,
    pub metrics: Arc<Metrics>,
    pub aggregate: Arc<AggregateView>,
    pub planner: Arc<RollbackPlanner>,

    observation_window: RwLock<Duration>,
    check_interval: Duration,
    canary_fraction: f64,
    thresholds: RwLock<RolloutThresholds>,
    default_rollback_timeout: Duration,
    active: Mutex<HashMap<RequestId, SharedState>>,
    /// Pauses new phases on shutdown; in-flight observe cycles finish.
    pause: CancellationToken,
}

impl fmt::Debug for RolloutScheduler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RolloutScheduler")
            .field("canary_fraction", &self.canary_fraction)
            .finish_non_exhaustive()
    }
}

impl RolloutScheduler {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        bus: Arc<dyn Bus>,
        clock: Arc<dyn Clock>,
        metrics: Arc<Metrics>,
        aggregate: Arc<AggregateView>,
        planner: Arc<RollbackPlanner>,
        observation_window: Duration,
        check_interval: Duration,
        canary_fraction: f64,
        thresholds: RolloutThresholds,
        default_rollback_timeout: Duration,
        pause: CancellationToken,
    ) -> Self {
        Self {
            bus,
            clock,
            metrics,
            aggregate,
            planner,
            observation_window: RwLock::new(observation_window),
            check_interval,
            canary_fraction,
            thresholds: RwLock::new(thresholds),
            default_rollback_timeout,
            active: Mutex::new(HashMap::new()),
            pause,
        }
    }

    pub async fn set_thresholds(&self, thresholds: RolloutThresholds) -> Result<()> {
        thresholds.validate()?;
        info!("rollout thresholds replaced");
        *self.thresholds.write().await = thresholds;
        Ok(())
    }

    pub async fn thresholds(&self) -> RolloutThresholds {
        self.thresholds.read().await.clone()
    }

    pub async fn set_observation_window(&self, window: Duration) -> Result<()> {
        if window.is_zero() || window < self.check_interval {
            return Err(CoreError::Validation(warden_model::ModelError::InvalidField {
                field: "observation_window",
                reason: "must be positive and cover at least one check interval".into(),
            }));
        }
        info!(?window, "observation window replaced");
        *self.observation_window.write().await = window;
        Ok(())
    }

    pub async fn observation_window(&self) -> Duration {
        *self.observation_window.read().await
    }

    /// Accept a phased deployment and run it asynchronously. Returns the
    /// initial snapshot; progress is visible through `status`.
    pub async fn apply(self: Arc<Self>, request: ApplyRequest) -> Result<RolloutSnapshot> {
        if request.targets.is_empty() {
            return Err(CoreError::Validation(warden_model::ModelError::InvalidField {
                field: "targets",
                reason: "target list is empty".into(),
            }));
        }
        if request.artifact_id.as_str().is_empty() {
            return Err(CoreError::Validation(warden_model::ModelError::MissingField(
                "artifact_id",
            )));
        }

        // De-duplicate while preserving order; a target is never in both
        // the canary subset and the remainder.
        let mut seen = std::collections::HashSet::new();
        let targets: Vec<HostId> = request
            .targets
            .iter()
            .filter(|t| seen.insert((*t).clone()))
            .cloned()
            .collect();

        let canary_count = if request.canary {
            let by_fraction = (targets.len() as f64 * self.canary_fraction).ceil() as usize;
            by_fraction.clamp(1, targets.len())
        } else {
            targets.len()
        };

        let request_id = RequestId::new();
        let entries: Vec<TargetEntry> = targets
            .iter()
            .enumerate()
            .map(|(i, host)| TargetEntry {
                host: host.clone(),
                state: TargetState::Pending,
                canary: request.canary && i < canary_count,
            })
            .collect();
        let state = Arc::new(Mutex::new(RolloutState {
            request_id,
            plan_id: request.plan_id.clone(),
            artifact_id: request.artifact_id.clone(),
            phase: RolloutPhase::Pending,
            targets: entries,
            failure_reason: None,
            started_at: self.clock.wall(),
            finished_at: None,
        }));
        let snapshot = state.lock().await.snapshot();
        self.active.lock().await.insert(request_id, Arc::clone(&state));
        self.metrics.incr("rollouts_accepted");
        info!(%request_id, plan = %request.plan_id, targets = targets.len(), canary_count, "rollout accepted");

        let scheduler = Arc::clone(&self);
        let initial: Vec<HostId> = targets[..canary_count].to_vec();
        let remainder: Vec<HostId> = targets[canary_count..].to_vec();
        tokio::spawn(async move {
            scheduler
                .run(state, request, initial, remainder)
                .await;
        });
        Ok(snapshot)
    }

    pub async fn status(&self, request_id: &RequestId) -> Option<RolloutSnapshot> {
        let active = self.active.lock().await;
        match active.get(request_id) {
            Some(state) => Some(state.lock().await.snapshot()),
            None => None,
        }
    }

    pub async fn list_active(&self) -> Vec<RolloutSnapshot> {
        let states: Vec<SharedState> = self.active.lock().await.values().cloned().collect();
        let mut snapshots = Vec::with_capacity(states.len());
        for state in states {
            snapshots.push(state.lock().await.snapshot());
        }
        snapshots.sort_by_key(|s| s.started_at);
        snapshots
    }

    /// Out-of-band rollback of one rollout, per the requested strategy.
    pub async fn rollback(
        &self,
        request_id: &RequestId,
        request: RollbackRequest,
    ) -> Result<Vec<RollbackOutcome>> {
        let state = {
            let active = self.active.lock().await;
            active
                .get(request_id)
                .cloned()
                .ok_or_else(|| CoreError::NotFound(format!("rollout {request_id}")))?
        };
        info!(%request_id, strategy = ?request.strategy, reason = %request.reason, "rollback requested");

        let (known, selected) = {
            let guard = state.lock().await;
            let known: Vec<HostId> = guard.hosts(None);
            let selected: Vec<HostId> = match request.strategy {
                RollbackStrategy::Selective => guard
                    .targets
                    .iter()
                    .filter(|t| {
                        matches!(t.state, TargetState::Failed | TargetState::RollingBack)
                    })
                    .map(|t| t.host.clone())
                    .collect(),
                _ => match &request.targets {
                    Some(explicit) => explicit.clone(),
                    None => known.clone(),
                },
            };
            (known, selected)
        };

        // Orphans are reported, never fatal.
        let (in_rollout, orphans): (Vec<HostId>, Vec<HostId>) =
            selected.into_iter().partition(|t| known.contains(t));
        for orphan in &orphans {
            warn!(%request_id, target = %orphan, "rollback target not part of rollout");
            self.metrics.incr("rollback_orphan_targets");
        }

        let timeout = request
            .timeout_secs
            .map(Duration::from_secs)
            .unwrap_or(self.default_rollback_timeout);
        let mut outcomes = self
            .execute_rollback(
                &state,
                in_rollout,
                request.strategy,
                Some(RolloutFailureReason::Requested),
                timeout,
            )
            .await;
        outcomes.extend(orphans.into_iter().map(|target_id| RollbackOutcome {
            target_id,
            state: TargetState::UnknownOutcome,
        }));
        Ok(outcomes)
    }

    /// Shared rollback path for the automatic and requested flavors.
    async fn execute_rollback(
        &self,
        state: &SharedState,
        targets: Vec<HostId>,
        strategy: RollbackStrategy,
        reason: Option<RolloutFailureReason>,
        timeout: Duration,
    ) -> Vec<RollbackOutcome> {
        let (request_id, artifact_id) = {
            let mut guard = state.lock().await;
            if !guard.phase.is_terminal() {
                guard.phase = RolloutPhase::RollingBack;
                guard.failure_reason = guard.failure_reason.or(reason);
            }
            guard.mark(&targets, TargetState::RollingBack);
            (guard.request_id, guard.artifact_id.clone())
        };

        let outcomes = self
            .planner
            .execute(request_id, &artifact_id, strategy, targets, timeout)
            .await;

        let mut guard = state.lock().await;
        for outcome in &outcomes {
            guard.mark(std::slice::from_ref(&outcome.target_id), outcome.state);
        }
        guard.finish(RolloutPhase::RolledBack);
        outcomes
    }

    /// One checkpointed observation pass over `targets`.
    async fn observe(&self, targets: &[HostId]) -> ObservationVerdict {
        let window = *self.observation_window.read().await;
        let started = tokio::time::Instant::now();
        loop {
            tokio::time::sleep(self.check_interval.min(window)).await;
            let thresholds = self.thresholds.read().await.clone();
            let final_checkpoint = started.elapsed() >= window;
            let verdict = self
                .aggregate
                .evaluate(targets, window, &thresholds, final_checkpoint);
            if verdict != ObservationVerdict::Pass {
                return verdict;
            }
            if final_checkpoint {
                return ObservationVerdict::Pass;
            }
        }
    }

    async fn publish_apply(
        &self,
        request_id: RequestId,
        artifact_id: &ArtifactId,
        lifetime_secs: Option<u64>,
        targets: &[HostId],
    ) -> Result<()> {
        let action = ApplyAction::new(
            request_id,
            artifact_id.clone(),
            lifetime_secs,
            targets.to_vec(),
        );
        publish_json(self.bus.as_ref(), subjects::ACTIONS_APPLY_EBPF, &action).await
    }

    /// The phase machine for one rollout. Strict order; terminal states
    /// absorb; automatic rollback never starts another rollout.
    async fn run(
        self: Arc<Self>,
        state: SharedState,
        request: ApplyRequest,
        initial: Vec<HostId>,
        remainder: Vec<HostId>,
    ) {
        let request_id = { state.lock().await.request_id };

        // Phase 1: canary apply.
        if self.pause.is_cancelled() {
            return;
        }
        {
            state.lock().await.phase = RolloutPhase::CanaryApplying;
        }
        if let Err(e) = self
            .publish_apply(request_id, &request.artifact_id, request.lifetime_secs, &initial)
            .await
        {
            warn!(%request_id, "apply publish failed: {e}");
            self.metrics.incr("apply_publish_failures");
            let mut guard = state.lock().await;
            guard.failure_reason = Some(RolloutFailureReason::PublishFailed);
            guard.finish(RolloutPhase::Failed);
            return;
        }
        {
            let mut guard = state.lock().await;
            guard.mark(&initial, TargetState::Applying);
            guard.phase = RolloutPhase::CanaryObserving;
        }

        // Phase 2: canary observe.
        if let ObservationVerdict::Breach(breach) = self.observe(&initial).await {
            warn!(%request_id, breach, "canary validation failed");
            self.metrics.incr("canary_validation_failures");
            self.execute_rollback(
                &state,
                initial,
                RollbackStrategy::Immediate,
                Some(RolloutFailureReason::CanaryValidationFailed),
                self.default_rollback_timeout,
            )
            .await;
            return;
        }
        {
            state.lock().await.mark(&initial, TargetState::Applied);
        }

        // Phase 3: fanout (skipped when the canary subset was everything).
        if remainder.is_empty() {
            let mut guard = state.lock().await;
            guard.phase = RolloutPhase::Success;
            guard.finish(RolloutPhase::Done);
            info!(%request_id, "rollout complete");
            self.metrics.incr("rollouts_succeeded");
            return;
        }
        if self.pause.is_cancelled() {
            info!(%request_id, "pausing before fanout");
            return;
        }
        {
            state.lock().await.phase = RolloutPhase::Fanout;
        }
        if let Err(e) = self
            .publish_apply(request_id, &request.artifact_id, request.lifetime_secs, &remainder)
            .await
        {
            warn!(%request_id, "fanout publish failed: {e}");
            self.metrics.incr("apply_publish_failures");
            let mut guard = state.lock().await;
            guard.failure_reason = Some(RolloutFailureReason::PublishFailed);
            guard.finish(RolloutPhase::Failed);
            return;
        }
        let all_targets = {
            let mut guard = state.lock().await;
            guard.mark(&remainder, TargetState::Applying);
            guard.phase = RolloutPhase::FanoutObserving;
            guard.hosts(None)
        };

        // Phase 4: final observe across the full target set.
        if let ObservationVerdict::Breach(breach) = self.observe(&all_targets).await {
            warn!(%request_id, breach, "final validation failed");
            self.metrics.incr("final_validation_failures");
            self.execute_rollback(
                &state,
                all_targets,
                RollbackStrategy::Immediate,
                Some(RolloutFailureReason::FinalValidationFailed),
                self.default_rollback_timeout,
            )
            .await;
            return;
        }
        {
            let mut guard = state.lock().await;
            guard.mark(&remainder, TargetState::Applied);
            guard.phase = RolloutPhase::Success;
            guard.finish(RolloutPhase::Done);
        }
        info!(%request_id, "rollout complete");
        self.metrics.incr("rollouts_succeeded");
    }
}
