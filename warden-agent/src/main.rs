//! Warden host agent binary: loads configuration from the environment,
//! connects the bus and catalog, starts the lifecycle runtime, and serves
//! the admin surface until SIGINT/SIGTERM.

use std::net::SocketAddr;
use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;
use warden_agent::http::{self, AppState};
use warden_agent::runtime::AgentRuntime;
use warden_config::AgentConfig;
use warden_core::bus::NatsBus;
use warden_core::catalog::HttpCatalog;
use warden_core::clock::SystemClock;
use warden_core::kernel::FakeKernelLoader;
use warden_core::shutdown::spawn_signal_listener;
use warden_core::signature::HmacSha256Verifier;

/// Command line arguments for the Warden host agent.
#[derive(Parser, Debug)]
#[command(name = "warden-agent")]
#[command(about = "Host agent for signed kernel probes: load, observe, retract")]
struct Args {
    /// Admin HTTP port (overrides WARDEN_HTTP_PORT)
    #[arg(short, long, env = "WARDEN_HTTP_PORT_OVERRIDE")]
    port: Option<u16>,
}

#[tokio::main]
async fn main() -> ExitCode {
    // Load .env before reading any config from the environment.
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
    let config = AgentConfig::from_env()?;
    let port = args.port.unwrap_or(config.http_port);

    let bus = Arc::new(NatsBus::connect(&config.bus_url).await?);
    let catalog = Arc::new(HttpCatalog::new(&config.registry_url)?);

    // The kernel loader is an injected capability; the deterministic
    // loader stands in until a platform loader is wired up.
    // TODO: select a real loader behind a feature flag once the eBPF
    // backend lands.
    let runtime = AgentRuntime {
        config: config.clone(),
        bus,
        catalog,
        verifier: Arc::new(HmacSha256Verifier),
        loader: Arc::new(FakeKernelLoader::new()),
        clock: Arc::new(SystemClock::new()),
    };
    let handle = runtime.start().await?;

    let state = AppState {
        host_id: handle.host_id.clone(),
        started_at: handle.started_at,
        table: Arc::clone(&handle.table),
        monitor: Arc::clone(&handle.monitor),
        rollbacks: Arc::clone(&handle.rollbacks),
        recent_telemetry: Arc::clone(&handle.recent_telemetry),
        metrics: Arc::clone(&handle.metrics),
    };

    let shutdown = CancellationToken::new();
    spawn_signal_listener(shutdown.clone());

    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(%addr, host = %state.host_id, "admin surface listening");

    let server_shutdown = shutdown.clone();
    axum::serve(listener, http::router(state))
        .with_graceful_shutdown(async move { server_shutdown.cancelled().await })
        .await?;

    handle.shutdown().await;
    Ok(())
}
