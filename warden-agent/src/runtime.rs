//! Task wiring for the agent: builds the probe table and its satellite
//! tasks, and owns orderly shutdown (workers stop, every probe unloads,
//! queued telemetry flushes).

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde_json::json;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use warden_config::AgentConfig;
use warden_core::bus::Bus;
use warden_core::catalog::Catalog;
use warden_core::clock::Clock;
use warden_core::error::Result;
use warden_core::kernel::KernelLoader;
use warden_core::metrics::Metrics;
use warden_core::signature::SignatureVerifier;
use warden_core::subjects;
use warden_model::{ConfigChange, HostId, RollbackReason, Telemetry};

use crate::cache::ArtifactCache;
use crate::monitor::ThresholdMonitor;
use crate::reconciler::Reconciler;
use crate::rollback::RollbackCoordinator;
use crate::table::ProbeTable;
use crate::telemetry::{RecentTelemetry, TelemetrySender, channel};

/// Builder for a running agent.
pub struct AgentRuntime {
    pub config: AgentConfig,
    pub bus: Arc<dyn Bus>,
    pub catalog: Arc<dyn Catalog>,
    pub verifier: Arc<dyn SignatureVerifier>,
    pub loader: Arc<dyn KernelLoader>,
    pub clock: Arc<dyn Clock>,
}

impl fmt::Debug for AgentRuntime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AgentRuntime")
            .field("host_id", &self.config.host_id)
            .finish_non_exhaustive()
    }
}

/// Handle to a started agent; the admin surface reads through this.
pub struct AgentHandle {
    pub host_id: HostId,
    pub started_at: DateTime<Utc>,
    pub table: Arc<ProbeTable>,
    pub monitor: Arc<ThresholdMonitor>,
    pub rollbacks: Arc<RollbackCoordinator>,
    pub recent_telemetry: RecentTelemetry,
    pub metrics: Arc<Metrics>,
    telemetry: TelemetrySender,
    workers: CancellationToken,
    publisher: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
}

impl fmt::Debug for AgentHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AgentHandle")
            .field("host_id", &self.host_id)
            .field("tasks", &self.tasks.len())
            .finish_non_exhaustive()
    }
}

impl AgentRuntime {
    pub async fn start(self) -> Result<AgentHandle> {
        let AgentRuntime {
            config,
            bus,
            catalog,
            verifier,
            loader,
            clock,
        } = self;

        let metrics = Arc::new(Metrics::new());
        let workers = CancellationToken::new();
        let publisher_cancel = CancellationToken::new();

        let (telemetry, publisher, recent_telemetry) = channel(
            config.telemetry_queue_capacity,
            config.host_id.clone(),
            Arc::clone(&bus),
            config.telemetry_subject.clone(),
            Arc::clone(&metrics),
        );

        let table = Arc::new(ProbeTable::new(
            Arc::clone(&clock),
            Arc::clone(&loader),
            telemetry.clone(),
            Arc::clone(&metrics),
        ));
        let cache = ArtifactCache::new(config.cache_dir.clone())?;
        let reconciler = Arc::new(Reconciler::new(
            config.host_id.clone(),
            config.poll_interval,
            config.max_programs,
            config.default_lifetime,
            config.signing_key.clone(),
            Arc::clone(&catalog),
            Arc::clone(&verifier),
            Arc::clone(&loader),
            Arc::clone(&table),
            cache,
            telemetry.clone(),
            Arc::clone(&metrics),
        ));
        let monitor = Arc::new(ThresholdMonitor::new(
            config.thresholds.clone(),
            Arc::clone(&table),
            Arc::clone(&clock),
            Arc::clone(&metrics),
        ));
        let rollbacks = Arc::new(RollbackCoordinator::new(
            Arc::clone(&table),
            Arc::clone(&clock),
            Arc::clone(&metrics),
        ));

        let mut tasks = Vec::new();
        tasks.push(tokio::spawn(publisher.run(publisher_cancel.clone())));
        tasks.push(tokio::spawn(
            Arc::clone(&reconciler).run(workers.child_token()),
        ));
        tasks.push(tokio::spawn(Arc::clone(&monitor).run(workers.child_token())));
        tasks.push(tokio::spawn(Arc::clone(&rollbacks).listen(
            Arc::clone(&bus),
            config.host_id.clone(),
            workers.child_token(),
        )));
        tasks.push(tokio::spawn(expiry_scan(
            Arc::clone(&table),
            config.rollback_check_interval,
            workers.child_token(),
        )));
        tasks.push(tokio::spawn(heartbeat(
            telemetry.clone(),
            Arc::clone(&table),
            config.host_id.clone(),
            config.heartbeat_interval,
            workers.child_token(),
        )));
        tasks.push(tokio::spawn(config_stream(
            Arc::clone(&bus),
            Arc::clone(&monitor),
            workers.child_token(),
        )));

        info!(host = %config.host_id, "agent runtime started");
        Ok(AgentHandle {
            host_id: config.host_id,
            started_at: Utc::now(),
            table,
            monitor,
            rollbacks,
            recent_telemetry,
            metrics,
            telemetry,
            workers,
            publisher: publisher_cancel,
            tasks,
        })
    }
}

impl AgentHandle {
    /// Feed one probe telemetry sample into the monitor and forward it to
    /// the bus.
    pub async fn ingest(&self, telemetry: Telemetry) {
        self.telemetry.sample(&telemetry);
        self.monitor.observe(telemetry).await;
    }

    /// Graceful shutdown: stop the workers, unload every probe, flush the
    /// telemetry queue.
    pub async fn shutdown(mut self) {
        info!("agent shutting down");
        self.workers.cancel();
        self.table.unload_all(RollbackReason::Shutdown).await;
        self.publisher.cancel();
        for task in self.tasks.drain(..) {
            if let Err(e) = task.await {
                warn!("agent task aborted: {e}");
            }
        }
        info!("agent shutdown complete");
    }
}

/// Periodic lifetime-deadline scan; either this or a bus rollback is how a
/// probe leaves the table.
async fn expiry_scan(table: Arc<ProbeTable>, interval: Duration, cancel: CancellationToken) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tokio::time::sleep(interval) => {
                for artifact_id in table.expired().await {
                    info!(artifact = %artifact_id, "lifetime expired");
                    table
                        .unload(&artifact_id, RollbackReason::Expired, None)
                        .await;
                }
            }
        }
    }
    debug!("expiry scanner stopped");
}

async fn heartbeat(
    telemetry: TelemetrySender,
    table: Arc<ProbeTable>,
    host_id: HostId,
    interval: Duration,
    cancel: CancellationToken,
) {
    let started = Utc::now();
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tokio::time::sleep(interval) => {
                let counts = table.counts().await;
                let uptime = (Utc::now() - started).num_seconds();
                telemetry.heartbeat(json!({
                    "host_id": host_id,
                    "uptime_secs": uptime,
                    "probes": counts,
                }));
            }
        }
    }
}

/// Apply threshold updates arriving on `config.changed`.
async fn config_stream(bus: Arc<dyn Bus>, monitor: Arc<ThresholdMonitor>, cancel: CancellationToken) {
    let mut subscription = match bus.subscribe(subjects::CONFIG_CHANGED).await {
        Ok(subscription) => subscription,
        Err(e) => {
            warn!("config stream subscription failed: {e}");
            return;
        }
    };
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            message = subscription.recv() => {
                let Some(message) = message else { break };
                match message.json::<ConfigChange>() {
                    Ok(change) => {
                        if let Some(thresholds) = change.thresholds {
                            if let Err(e) = monitor.set_thresholds(thresholds).await {
                                warn!(kind = e.kind(), "rejected threshold update: {e}");
                            }
                        }
                    }
                    Err(e) => debug!("malformed config change dropped: {e}"),
                }
            }
        }
    }
}
