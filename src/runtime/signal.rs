//! Shutdown signal handling.

use log::info;
use tokio::signal::unix::{signal, SignalKind};

/// Resolve when SIGINT or SIGTERM arrives. The caller then runs the
/// shutdown chain: sigterm listeners, `state=offline`, task cancellation.
pub async fn wait_for_shutdown() {
    let mut sigterm = match signal(SignalKind::terminate()) {
        Ok(stream) => stream,
        Err(err) => {
            // No signal handling available; fall back to ctrl-c only.
            log::warn!("Cannot install SIGTERM handler: {err}");
            let _ = tokio::signal::ctrl_c().await;
            return;
        }
    };
    tokio::select! {
        _ = tokio::signal::ctrl_c() => info!("SIGINT received."),
        _ = sigterm.recv() => info!("SIGTERM received."),
    }
}
