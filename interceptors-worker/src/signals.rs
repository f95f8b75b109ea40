use tokio::signal::unix::SignalKind;
use tracing::{info, warn};

/// Resolves on SIGINT or SIGTERM.
pub async fn wait_for_shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();
    let mut sigterm = match tokio::signal::unix::signal(SignalKind::terminate()) {
        Ok(sigterm) => sigterm,
        Err(e) => {
            warn!("failed to install SIGTERM handler, only SIGINT will stop the worker: {}", e);
            if let Err(e) = ctrl_c.await {
                warn!("failed to listen for SIGINT: {}", e);
                std::future::pending::<()>().await;
            }
            info!("received SIGINT");
            return;
        }
    };

    tokio::select! {
        _ = ctrl_c => info!("received SIGINT"),
        _ = sigterm.recv() => info!("received SIGTERM"),
    }
}
