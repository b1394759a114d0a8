//! Warden correlator binary.

use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;
use warden_config::CorrelatorConfig;
use warden_core::bus::NatsBus;
use warden_core::clock::SystemClock;
use warden_core::shutdown::spawn_signal_listener;
use warden_correlator::http::{self, AppState};
use warden_correlator::runtime::CorrelatorRuntime;

/// Command line arguments for the Warden correlator.
#[derive(Parser, Debug)]
#[command(name = "warden-correlator")]
#[command(about = "Streaming rule engine over enriched host events")]
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
    let config = CorrelatorConfig::from_env()?;
    let addr = args.http_addr.unwrap_or(config.http_addr);

    let bus = Arc::new(NatsBus::connect(&config.bus_url).await?);
    let runtime = CorrelatorRuntime {
        config,
        bus,
        clock: Arc::new(SystemClock::new()),
    };
    let handle = runtime.start().await?;

    let state = AppState {
        started_at: handle.started_at,
        snapshots: Arc::clone(&handle.snapshots),
        overrides: Arc::clone(&handle.overrides),
        findings: Arc::clone(&handle.findings),
        live: Arc::clone(&handle.live),
        metrics: Arc::clone(&handle.metrics),
    };

    let shutdown = CancellationToken::new();
    spawn_signal_listener(shutdown.clone());

    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(%addr, "admin surface listening");

    let server_shutdown = shutdown.clone();
    axum::serve(listener, http::router(state))
        .with_graceful_shutdown(async move { server_shutdown.cancelled().await })
        .await?;

    handle.shutdown().await;
    Ok(())
}
