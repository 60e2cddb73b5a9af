//! Graceful shutdown coordinator.
//!
//! Listens for SIGINT (Ctrl+C), SIGTERM, and SIGHUP, then cancels a
//! [`tokio_util::sync::CancellationToken`] so running surfaces and uploads
//! can stop cleanly and the feed hub can release its subscription. A second
//! signal force-exits.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use tokio_util::sync::CancellationToken;

#[cfg(unix)]
use tokio::signal::unix::{signal, Signal, SignalKind};

#[cfg(unix)]
fn register(kind: SignalKind, name: &str) -> Option<Signal> {
    match signal(kind) {
        Ok(sig) => Some(sig),
        Err(e) => {
            tracing::warn!(signal = name, error = %e, "Failed to register signal handler");
            None
        }
    }
}

#[cfg(unix)]
async fn recv_or_pending(sig: &mut Option<Signal>) {
    match sig {
        Some(sig) => {
            sig.recv().await;
        }
        None => std::future::pending::<()>().await,
    }
}

/// Install signal handlers and return a [`CancellationToken`] that is
/// cancelled on the first SIGINT / SIGTERM / SIGHUP.  A second signal
/// force-exits the process.
pub(crate) fn install_signal_handler() -> CancellationToken {
    let token = CancellationToken::new();
    let count = Arc::new(AtomicU32::new(0));

    let handler_token = token.clone();
    tokio::spawn(async move {
        #[cfg(unix)]
        let (mut sigterm, mut sighup) = (
            register(SignalKind::terminate(), "SIGTERM"),
            register(SignalKind::hangup(), "SIGHUP"),
        );

        loop {
            #[cfg(unix)]
            let received = tokio::select! {
                r = tokio::signal::ctrl_c() => r,
                _ = recv_or_pending(&mut sigterm) => Ok(()),
                _ = recv_or_pending(&mut sighup) => Ok(()),
            };

            #[cfg(not(unix))]
            let received = tokio::signal::ctrl_c().await;

            if let Err(e) = received {
                tracing::warn!(error = %e, "Failed to listen for Ctrl+C");
                return;
            }

            let prev = count.fetch_add(1, Ordering::SeqCst);
            if prev == 0 {
                tracing::info!("Received shutdown signal, stopping...");
                tracing::info!("Press Ctrl+C again to force exit");
                handler_token.cancel();
            } else {
                tracing::warn!("Force exit requested");
                std::process::exit(130);
            }
        }
    });

    token
}
