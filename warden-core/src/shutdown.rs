//! Process-wide cancellation wiring shared by the three service binaries.

use tokio_util::sync::CancellationToken;
use tracing::info;

/// Cancel `token` on SIGINT or SIGTERM.
///
/// Spawned once per binary; every long-lived task holds a child of the same
/// token and drains when it fires.
pub fn spawn_signal_listener(token: CancellationToken) {
    tokio::spawn(async move {
        let ctrl_c = tokio::signal::ctrl_c();
        #[cfg(unix)]
        {
            let mut term = match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
                Ok(term) => term,
                Err(e) => {
                    tracing::error!("failed to install SIGTERM handler: {e}");
                    return;
                }
            };
            tokio::select! {
                _ = ctrl_c => info!("SIGINT received, shutting down"),
                _ = term.recv() => info!("SIGTERM received, shutting down"),
            }
        }
        #[cfg(not(unix))]
        {
            let _ = ctrl_c.await;
            info!("SIGINT received, shutting down");
        }
        token.cancel();
    });
}
