//! Warden rollout orchestrator binary.

use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;
use warden_config::RolloutConfig;
use warden_core::bus::{Bus, NatsBus};
use warden_core::clock::SystemClock;
use warden_core::metrics::Metrics;
use warden_core::shutdown::spawn_signal_listener;
use warden_rollout::aggregate::AggregateView;
use warden_rollout::http::{self, AppState};
use warden_rollout::rollback::RollbackPlanner;
use warden_rollout::scheduler::RolloutScheduler;

/// Command line arguments for the Warden rollout orchestrator.
#[derive(Parser, Debug)]
#[command(name = "warden-rollout")]
#[command(about = "Canary-aware phased deployment with guarded rollback")]
struct Args {
    /// Admin bind address (overrides WARDEN_HTTP_ADDR)
    #[arg(long, env = "WARDEN_HTTP_ADDR_OVERRIDE")]
    http_addr: Option<std::net::SocketAddr>,
}

#[tokio::main]
async fn main() -> ExitCode {
    let _ = dotenvy::dotenv();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let args = Args::parse();
    match run(args).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("fatal: {e}");
            ExitCode::FAILURE
        }
    }
}

async fn run(args: Args) -> anyhow::Result<()> {
    let config = RolloutConfig::from_env()?;
    let addr = args.http_addr.unwrap_or(config.http_addr);

    let bus: Arc<dyn Bus> = Arc::new(NatsBus::connect(&config.bus_url).await?);
    let clock = Arc::new(SystemClock::new());
    let metrics = Arc::new(Metrics::new());

    let aggregate = Arc::new(AggregateView::new(
        Arc::clone(&clock) as _,
        Arc::clone(&metrics),
    ));
    let planner = Arc::new(RollbackPlanner::new(
        Arc::clone(&bus),
        Arc::clone(&aggregate),
        Arc::clone(&clock) as _,
        Arc::clone(&metrics),
        config.batch_size,
        config.inter_batch_pause,
        config.gradual_failure_tolerance,
        config.target_timeout,
    ));

    let shutdown = CancellationToken::new();
    spawn_signal_listener(shutdown.clone());

    let scheduler = Arc::new(RolloutScheduler::new(
        Arc::clone(&bus),
        Arc::clone(&clock) as _,
        Arc::clone(&metrics),
        Arc::clone(&aggregate),
        planner,
        config.observation_window,
        config.check_interval,
        config.canary_fraction,
        config.thresholds.clone(),
        config.target_timeout,
        shutdown.child_token(),
    ));

    let intake = tokio::spawn(
        Arc::clone(&aggregate).run(Arc::clone(&bus), shutdown.child_token()),
    );

    let state = AppState {
        started_at: chrono::Utc::now(),
        scheduler,
        aggregate,
        metrics,
    };

    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(%addr, "admin surface listening");

    let server_shutdown = shutdown.clone();
    axum::serve(listener, http::router(state))
        .with_graceful_shutdown(async move { server_shutdown.cancelled().await })
        .await?;

    if let Err(e) = intake.await {
        error!("telemetry intake aborted: {e}");
    }
    info!("rollout orchestrator stopped");
    Ok(())
}
