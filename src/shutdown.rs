use tokio_util::sync::CancellationToken;

/// Install a handler that cancels `token` when SIGTERM or SIGINT arrives.
///
/// The node host drains its control server and exits once the token fires;
/// the same token is cancelled by a remotely requested shutdown.
#[cfg(unix)]
pub fn install_shutdown_handler(token: CancellationToken) {
    use tokio::signal::unix::{signal, SignalKind};

    tokio::spawn(async move {
        let mut sigterm =
            signal(SignalKind::terminate()).expect("failed to install SIGTERM handler");
        let mut sigint = signal(SignalKind::interrupt()).expect("failed to install SIGINT handler");

        tokio::select! {
            _ = sigterm.recv() => {
                tracing::info!("Received SIGTERM, initiating node shutdown");
            }
            _ = sigint.recv() => {
                tracing::info!("Received SIGINT, initiating node shutdown");
            }
        }

        token.cancel();
    });
}

#[cfg(not(unix))]
pub fn install_shutdown_handler(token: CancellationToken) {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("Received Ctrl-C, initiating node shutdown");
            token.cancel();
        }
    });
}
