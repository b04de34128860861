/// Signal handling for graceful shutdown.
///
/// Resolves on the first SIGINT (Ctrl-C) or SIGTERM. If the handlers cannot
/// be installed the future never resolves and the console's `quit` command
/// remains the only way out.
use tokio::signal::unix::{signal, SignalKind};

pub async fn shutdown_requested() {
    let mut term = match signal(SignalKind::terminate()) {
        Ok(s) => s,
        Err(e) => {
            tracing::warn!(error = %e, "failed to install SIGTERM handler");
            return std::future::pending().await;
        }
    };

    tokio::select! {
        result = tokio::signal::ctrl_c() => {
            if let Err(e) = result {
                tracing::warn!(error = %e, "failed to listen for SIGINT");
                return std::future::pending().await;
            }
            tracing::info!("received SIGINT");
        }
        _ = term.recv() => tracing::info!("received SIGTERM"),
    }
}
