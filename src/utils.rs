use tokio::signal;
use tracing::{error, warn};

/// Resolve on Ctrl+C or SIGTERM.
///
/// If one handler cannot be installed, the other still triggers shutdown;
/// the failure is logged rather than aborting a running server.
pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to install Ctrl+C handler: {e}");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!("Failed to install SIGTERM handler: {e}");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            warn!("Received Ctrl+C, draining in-flight webhook work...");
        }
        _ = terminate => {
            warn!("Received SIGTERM, draining in-flight webhook work...");
        }
    }
}
