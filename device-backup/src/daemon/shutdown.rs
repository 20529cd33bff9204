//! Signal handling for SIGTERM and SIGINT.
//!
//! A signal during a backup cancels the run, which terminates the backup
//! tool and lets the orchestrator report a cancelled result before exit.

use tokio::signal;
use tokio::sync::broadcast;
use tracing::{info, warn};

/// Shutdown coordinator
pub struct ShutdownCoordinator {
    shutdown_tx: broadcast::Sender<()>,
}

impl ShutdownCoordinator {
    /// Create a new shutdown coordinator
    pub fn new() -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);
        Self { shutdown_tx }
    }

    /// Get a shutdown receiver
    pub fn subscribe(&self) -> broadcast::Receiver<()> {
        self.shutdown_tx.subscribe()
    }

    /// Notifies all subscribers, as if a signal had arrived. Returns how
    /// many were notified.
    pub fn trigger(&self) -> usize {
        match self.shutdown_tx.send(()) {
            Ok(notified) => notified,
            Err(_) => {
                warn!("Shutdown requested with no subscribers");
                0
            }
        }
    }

    /// Wait for a shutdown signal (SIGTERM or SIGINT), then notify subscribers
    pub async fn wait_for_signal(&self) {
        let ctrl_c = async {
            if let Err(e) = signal::ctrl_c().await {
                warn!("Failed to install Ctrl+C handler: {}", e);
                std::future::pending::<()>().await;
            }
        };

        #[cfg(unix)]
        let terminate = async {
            match signal::unix::signal(signal::unix::SignalKind::terminate()) {
                Ok(mut stream) => {
                    stream.recv().await;
                }
                Err(e) => {
                    warn!("Failed to install SIGTERM handler: {}", e);
                    std::future::pending::<()>().await;
                }
            }
        };

        #[cfg(not(unix))]
        let terminate = std::future::pending::<()>();

        tokio::select! {
            _ = ctrl_c => {
                info!("Received SIGINT (Ctrl+C), cancelling...");
            }
            _ = terminate => {
                info!("Received SIGTERM, cancelling...");
            }
        }

        self.trigger();
    }
}

impl Default for ShutdownCoordinator {
    fn default() -> Self {
        Self::new()
    }
}
