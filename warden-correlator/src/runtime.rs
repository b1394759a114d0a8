//! Task wiring for the correlator: event intake, rule hot reload, window
//! GC, and the live-config stream.

use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use warden_config::CorrelatorConfig;
use warden_core::bus::Bus;
use warden_core::clock::Clock;
use warden_core::error::Result;
use warden_core::metrics::Metrics;
use warden_core::subjects;

use crate::config_stream::{self, LiveConfig, Tunables};
use crate::evaluator::Evaluator;
use crate::findings::FindingStore;
use crate::labels::HostLabelsCache;
use crate::loader::RuleLoader;
use crate::overrides::OverrideStore;
use crate::snapshot::SnapshotHolder;
use crate::window::WindowBuffer;

/// Builder for a running correlator.
pub struct CorrelatorRuntime {
    pub config: CorrelatorConfig,
    pub bus: Arc<dyn Bus>,
    pub clock: Arc<dyn Clock>,
}

impl fmt::Debug for CorrelatorRuntime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CorrelatorRuntime")
            .field("rules_dir", &self.config.rules_dir)
            .finish_non_exhaustive()
    }
}

/// Handle to a started correlator; the admin surface reads through this.
pub struct CorrelatorHandle {
    pub started_at: DateTime<Utc>,
    pub evaluator: Arc<Evaluator>,
    pub snapshots: Arc<SnapshotHolder>,
    pub overrides: Arc<OverrideStore>,
    pub findings: Arc<FindingStore>,
    pub live: Arc<LiveConfig>,
    pub metrics: Arc<Metrics>,
    workers: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
}

impl fmt::Debug for CorrelatorHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CorrelatorHandle")
            .field("tasks", &self.tasks.len())
            .finish_non_exhaustive()
    }
}

impl CorrelatorRuntime {
    pub async fn start(self) -> Result<CorrelatorHandle> {
        let CorrelatorRuntime { config, bus, clock } = self;

        let metrics = Arc::new(Metrics::new());
        let workers = CancellationToken::new();

        let snapshots = Arc::new(SnapshotHolder::new());
        let window = Arc::new(WindowBuffer::new(config.rule_window));
        let labels = Arc::new(HostLabelsCache::new());
        let findings = Arc::new(FindingStore::new(config.max_findings, config.dedupe_cap));
        let live = Arc::new(LiveConfig::new(Tunables::from_config(&config)));
        let overrides = Arc::new(OverrideStore::new(Arc::clone(&metrics)));

        let loader = Arc::new(
            RuleLoader::new(
                config.rules_dir.clone(),
                Arc::clone(&snapshots),
                Arc::clone(&metrics),
            )
            .resize_window(Arc::clone(&window), config.rule_window),
        );
        // A missing or unreadable rules dir is survivable: the empty
        // snapshot stands until the operator fixes the directory.
        if let Err(e) = loader.load_once() {
            warn!(dir = %config.rules_dir.display(), "initial rule load failed: {e}");
        }

        // Seed tunables from the config API when one is configured; the
        // config stream takes over from there.
        if let Some(url) = &config.config_api_url {
            match fetch_initial_tunables(url).await {
                Ok(change) => live.apply(&change, &findings),
                Err(e) => warn!(url = %url, "initial tunables fetch failed: {e}"),
            }
        }

        let evaluator = Arc::new(Evaluator {
            window: Arc::clone(&window),
            labels,
            snapshots: Arc::clone(&snapshots),
            overrides: Arc::clone(&overrides),
            findings: Arc::clone(&findings),
            live: Arc::clone(&live),
            clock: Arc::clone(&clock),
            bus: Arc::clone(&bus),
            metrics: Arc::clone(&metrics),
        });

        let mut tasks = Vec::new();
        for subject in [subjects::EVENTS_ENRICHED, subjects::EVENTS_RAW] {
            tasks.push(tokio::spawn(intake(
                Arc::clone(&bus),
                Arc::clone(&evaluator),
                subject,
                workers.child_token(),
            )));
        }
        tasks.push(tokio::spawn(config_stream::listen(
            Arc::clone(&bus),
            Arc::clone(&live),
            Arc::clone(&findings),
            Arc::clone(&metrics),
            workers.child_token(),
        )));
        tasks.push(tokio::spawn(window_gc(
            Arc::clone(&window),
            Arc::clone(&clock),
            config.window_gc_interval,
            workers.child_token(),
        )));
        if config.hot_reload {
            tasks.push(tokio::spawn(
                Arc::clone(&loader).watch(config.debounce, workers.child_token()),
            ));
        }

        info!("correlator runtime started");
        Ok(CorrelatorHandle {
            started_at: Utc::now(),
            evaluator,
            snapshots,
            overrides,
            findings,
            live,
            metrics,
            workers,
            tasks,
        })
    }
}

impl CorrelatorHandle {
    pub async fn shutdown(mut self) {
        info!("correlator shutting down");
        self.workers.cancel();
        for task in self.tasks.drain(..) {
            if let Err(e) = task.await {
                warn!("correlator task aborted: {e}");
            }
        }
        info!("correlator shutdown complete");
    }
}

async fn fetch_initial_tunables(
    url: &str,
) -> std::result::Result<warden_model::CorrelatorTunables, reqwest::Error> {
    reqwest::Client::builder()
        .timeout(std::time::Duration::from_secs(5))
        .build()?
        .get(url)
        .send()
        .await?
        .error_for_status()?
        .json()
        .await
}

/// Pull events off one subject and feed the evaluator, in arrival order.
async fn intake(
    bus: Arc<dyn Bus>,
    evaluator: Arc<Evaluator>,
    subject: &'static str,
    cancel: CancellationToken,
) {
    let mut subscription = match bus.subscribe(subject).await {
        Ok(subscription) => subscription,
        Err(e) => {
            warn!(subject, "event subscription failed: {e}");
            return;
        }
    };
    info!(subject, "event intake started");
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            message = subscription.recv() => {
                let Some(message) = message else { break };
                evaluator.process_message(&message).await;
            }
        }
    }
    debug!(subject, "event intake stopped");
}

async fn window_gc(
    window: Arc<WindowBuffer>,
    clock: Arc<dyn Clock>,
    interval: std::time::Duration,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tokio::time::sleep(interval) => window.gc(clock.monotonic()),
        }
    }
}
