//! Graceful shutdown coordination.
//!
//! One coordinator owns the shutdown flag; the serve loop and every
//! background sweep subscribe to it. Shutdown fires on SIGINT/SIGTERM or a
//! manual trigger, whichever comes first.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::signal;
use tokio::sync::broadcast;
use tracing::{info, warn};

/// Coordinates graceful shutdown across the server and background tasks.
#[derive(Debug, Clone)]
pub struct ShutdownCoordinator {
    shutdown_initiated: Arc<AtomicBool>,
    shutdown_tx: broadcast::Sender<()>,
}

impl Default for ShutdownCoordinator {
    fn default() -> Self {
        Self::new()
    }
}

impl ShutdownCoordinator {
    pub fn new() -> Self {
        let (shutdown_tx, _) = broadcast::channel(16);
        Self {
            shutdown_initiated: Arc::new(AtomicBool::new(false)),
            shutdown_tx,
        }
    }

    pub fn is_shutdown_initiated(&self) -> bool {
        self.shutdown_initiated.load(Ordering::Relaxed)
    }

    /// Create a shutdown receiver for a background task.
    pub fn subscribe(&self) -> broadcast::Receiver<()> {
        self.shutdown_tx.subscribe()
    }

    /// Initiate graceful shutdown. Idempotent.
    pub fn initiate_shutdown(&self) {
        if !self.shutdown_initiated.swap(true, Ordering::Relaxed) {
            info!("Initiating graceful shutdown...");
            if let Err(e) = self.shutdown_tx.send(()) {
                warn!("Failed to send shutdown signal: {}", e);
            }
        }
    }

    /// Block until SIGINT/SIGTERM arrives, then initiate shutdown.
    pub async fn wait_for_shutdown_signal(&self) {
        let ctrl_c = async {
            signal::ctrl_c()
                .await
                .expect("Failed to install Ctrl+C handler");
        };

        #[cfg(unix)]
        let terminate = async {
            signal::unix::signal(signal::unix::SignalKind::terminate())
                .expect("Failed to install SIGTERM handler")
                .recv()
                .await;
        };

        #[cfg(not(unix))]
        let terminate = std::future::pending::<()>();

        tokio::select! {
            _ = ctrl_c => {
                info!("Received Ctrl+C signal");
            }
            _ = terminate => {
                info!("Received SIGTERM signal");
            }
        }

        self.initiate_shutdown();
    }
}

/// Handle held by a background task so its sleep can be interrupted.
pub struct ShutdownAwareTask {
    shutdown_rx: broadcast::Receiver<()>,
}

impl ShutdownAwareTask {
    pub fn new(coordinator: &ShutdownCoordinator) -> Self {
        Self {
            shutdown_rx: coordinator.subscribe(),
        }
    }

    /// Sleep for `duration` or until shutdown, returning true on shutdown.
    pub async fn wait_or_shutdown(&mut self, duration: tokio::time::Duration) -> bool {
        tokio::select! {
            _ = self.shutdown_rx.recv() => true,
            _ = tokio::time::sleep(duration) => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::{Duration, sleep};

    #[tokio::test]
    async fn coordinator_starts_clean() {
        let coordinator = ShutdownCoordinator::new();
        assert!(!coordinator.is_shutdown_initiated());
    }

    #[tokio::test]
    async fn initiation_reaches_subscribers() {
        let coordinator = ShutdownCoordinator::new();
        let mut receiver = coordinator.subscribe();

        coordinator.initiate_shutdown();

        assert!(coordinator.is_shutdown_initiated());
        assert!(receiver.recv().await.is_ok());
    }

    #[tokio::test]
    async fn wait_or_shutdown_returns_true_on_shutdown() {
        let coordinator = ShutdownCoordinator::new();
        let mut task = ShutdownAwareTask::new(&coordinator);

        let handle =
            tokio::spawn(async move { task.wait_or_shutdown(Duration::from_secs(10)).await });

        tokio::spawn(async move {
            sleep(Duration::from_millis(50)).await;
            coordinator.initiate_shutdown();
        });

        assert!(handle.await.unwrap());
    }

    #[tokio::test]
    async fn wait_or_shutdown_returns_false_on_timeout() {
        let coordinator = ShutdownCoordinator::new();
        let mut task = ShutdownAwareTask::new(&coordinator);

        assert!(!task.wait_or_shutdown(Duration::from_millis(50)).await);
    }
}
