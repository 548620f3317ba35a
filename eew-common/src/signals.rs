use std::future::Future;

use tokio::signal::unix::{signal, SignalKind};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

/// Cancel `shutdown` on SIGINT or SIGTERM. Meant to be spawned next to the
/// service's main loop.
pub async fn wait_for_shutdown_signal(shutdown: CancellationToken) {
    let received = async {
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => info!("received SIGINT"),
                    _ = sigterm.recv() => info!("received SIGTERM"),
                }
                true
            }
            Err(e) => {
                error!("failed to install SIGTERM handler: {e}");
                match tokio::signal::ctrl_c().await {
                    Ok(()) => {
                        info!("received SIGINT");
                        true
                    }
                    Err(e) => {
                        error!("failed to install SIGINT handler: {e}");
                        false
                    }
                }
            }
        }
    };

    cancel_on(received, shutdown).await;
}

/// Cancel `shutdown` once `signal` resolves to true.
async fn cancel_on(signal: impl Future<Output = bool>, shutdown: CancellationToken) {
    if signal.await {
        shutdown.cancel();
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[tokio::test]
    async fn test_signal_cancels_token() {
        let shutdown = CancellationToken::new();
        cancel_on(std::future::ready(true), shutdown.clone()).await;
        assert!(shutdown.is_cancelled());
    }

    #[tokio::test]
    async fn test_failed_handler_leaves_token() {
        let shutdown = CancellationToken::new();
        cancel_on(std::future::ready(false), shutdown.clone()).await;
        assert!(!shutdown.is_cancelled());
    }

    #[tokio::test(start_paused = true)]
    async fn test_token_untouched_until_signal() {
        let shutdown = CancellationToken::new();
        let pending = cancel_on(std::future::pending(), shutdown.clone());

        assert!(tokio::time::timeout(Duration::from_secs(60), pending)
            .await
            .is_err());
        assert!(!shutdown.is_cancelled());
    }
}
