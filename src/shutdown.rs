use tokio_util::sync::CancellationToken;

/// Cancel `shutdown` on SIGINT or SIGTERM; returns early if it is cancelled
/// for another reason
pub async fn cancel_on_signal(shutdown: CancellationToken) {
    tokio::select! {
        _ = tokio::signal::ctrl_c() => tracing::info!("interrupted"),
        _ = sigterm() => tracing::info!("terminated"),
        _ = shutdown.cancelled() => return,
    }
    shutdown.cancel();
}

#[cfg(unix)]
async fn sigterm() {
    use tokio::signal::unix::{SignalKind, signal};

    match signal(SignalKind::terminate()) {
        Ok(mut sig) => {
            sig.recv().await;
        }
        // Without a handler only SIGINT stops us.
        Err(_) => std::future::pending().await,
    }
}

#[cfg(not(unix))]
async fn sigterm() {
    std::future::pending().await
}
