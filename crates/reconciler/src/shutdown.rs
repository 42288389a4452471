//! OS signal handling.
//!
//! SIGTERM and SIGINT (Ctrl+C elsewhere) cancel the token handed to the
//! manager, which then drains its controllers.

use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

/// Signal that triggered shutdown.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ShutdownSignal {
    Sigterm,
    Sigint,
}

impl std::fmt::Display for ShutdownSignal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Sigterm => write!(f, "SIGTERM"),
            Self::Sigint => write!(f, "SIGINT"),
        }
    }
}

/// Wait for the next termination signal.
///
/// Returns `None` if the handlers could not be installed.
#[cfg(unix)]
pub async fn wait_for_signal() -> Option<ShutdownSignal> {
    use tokio::signal::unix::{SignalKind, signal};

    let mut sigterm = match signal(SignalKind::terminate()) {
        Ok(s) => s,
        Err(e) => {
            error!(error = %e, "Failed to install SIGTERM handler");
            return None;
        }
    };
    let mut sigint = match signal(SignalKind::interrupt()) {
        Ok(s) => s,
        Err(e) => {
            error!(error = %e, "Failed to install SIGINT handler");
            return None;
        }
    };

    tokio::select! {
        _ = sigterm.recv() => Some(ShutdownSignal::Sigterm),
        _ = sigint.recv() => Some(ShutdownSignal::Sigint),
    }
}

/// Wait for Ctrl+C. Windows has no SIGTERM.
#[cfg(not(unix))]
pub async fn wait_for_signal() -> Option<ShutdownSignal> {
    match tokio::signal::ctrl_c().await {
        Ok(()) => Some(ShutdownSignal::Sigint),
        Err(e) => {
            error!(error = %e, "Failed to listen for Ctrl+C");
            None
        }
    }
}

/// Cancel `token` on the first termination signal.
///
/// The task resolves to the signal received, or `None` if `token` was
/// cancelled by someone else first.
pub fn install_signal_handlers(token: CancellationToken) -> JoinHandle<Option<ShutdownSignal>> {
    info!("Installing OS signal handlers");
    tokio::spawn(async move {
        tokio::select! {
            () = token.cancelled() => None,
            received = wait_for_signal() => {
                if let Some(signal) = received {
                    info!(signal = %signal, "Received shutdown signal");
                    token.cancel();
                }
                received
            }
        }
    })
}
