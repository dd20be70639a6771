//! Graceful shutdown handling
//!
//! - Signal handling (SIGTERM, SIGINT)
//! - Cancellation of the change stream wait and the detector loop
//! - HTTP server draining

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tokio::sync::watch;
use tracing::{error, info};

/// Shutdown signal that can be cloned and shared
#[derive(Clone)]
pub struct ShutdownSignal {
    shutdown: Arc<AtomicBool>,
    watch_rx: watch::Receiver<bool>,
}

impl ShutdownSignal {
    /// A signal that never fires (tests, one-shot tools)
    pub fn never() -> Self {
        ShutdownCoordinator::new().signal()
    }

    /// Check if shutdown has been initiated
    pub fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::SeqCst)
    }

    /// Wait for shutdown signal
    pub async fn wait(&self) {
        let mut rx = self.watch_rx.clone();
        // Err means the coordinator is gone; nothing can signal any more
        if rx.wait_for(|stopped| *stopped).await.is_err() {
            std::future::pending::<()>().await;
        }
    }

    /// Sleep for `duration` unless shutdown arrives first.
    ///
    /// Returns false if interrupted by shutdown.
    pub async fn sleep(&self, duration: Duration) -> bool {
        tokio::select! {
            _ = self.wait() => false,
            _ = tokio::time::sleep(duration) => true,
        }
    }
}

/// Shutdown coordinator that owns the shutdown state
pub struct ShutdownCoordinator {
    shutdown: Arc<AtomicBool>,
    watch_tx: watch::Sender<bool>,
    hooks: tokio::sync::Mutex<Vec<Box<dyn FnOnce() + Send + 'static>>>,
}

impl ShutdownCoordinator {
    pub fn new() -> Self {
        let (watch_tx, _) = watch::channel(false);

        Self {
            shutdown: Arc::new(AtomicBool::new(false)),
            watch_tx,
            hooks: tokio::sync::Mutex::new(Vec::new()),
        }
    }

    /// Get a shutdown signal that can be cloned
    pub fn signal(&self) -> ShutdownSignal {
        ShutdownSignal {
            shutdown: self.shutdown.clone(),
            watch_rx: self.watch_tx.subscribe(),
        }
    }

    /// Register a shutdown hook
    pub async fn register_hook<F>(&self, hook: F)
    where
        F: FnOnce() + Send + 'static,
    {
        let mut hooks = self.hooks.lock().await;
        hooks.push(Box::new(hook));
    }

    /// Initiate shutdown
    pub async fn shutdown(&self) {
        if self.shutdown.swap(true, Ordering::SeqCst) {
            return;
        }

        info!("Initiating graceful shutdown...");

        self.watch_tx.send_replace(true);

        let mut hooks = self.hooks.lock().await;
        for hook in hooks.drain(..) {
            hook();
        }
    }

    pub fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::SeqCst)
    }
}

impl Default for ShutdownCoordinator {
    fn default() -> Self {
        Self::new()
    }
}

/// Completes on SIGINT or SIGTERM
pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to install Ctrl+C handler");
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
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, initiating shutdown...");
        }
        _ = terminate => {
            info!("Received SIGTERM, initiating shutdown...");
        }
    }
}

/// Serve the router until the coordinator signals shutdown
pub async fn serve_with_shutdown(
    listener: tokio::net::TcpListener,
    router: axum::Router,
    coordinator: Arc<ShutdownCoordinator>,
) -> std::result::Result<(), std::io::Error> {
    let signal = coordinator.signal();

    axum::serve(listener, router)
        .with_graceful_shutdown(async move {
            signal.wait().await;
            info!("Shutdown signal received, draining HTTP connections");
        })
        .await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_shutdown_signal() {
        let coordinator = ShutdownCoordinator::new();
        let signal = coordinator.signal();

        assert!(!signal.is_shutdown());

        coordinator.shutdown().await;

        assert!(signal.is_shutdown());
        // Already-fired signal resolves immediately
        signal.wait().await;
    }

    #[tokio::test]
    async fn test_wait_wakes_on_shutdown() {
        let coordinator = ShutdownCoordinator::new();
        let signal = coordinator.signal();

        let waiter = tokio::spawn(async move { signal.wait().await });
        tokio::time::sleep(Duration::from_millis(10)).await;

        coordinator.shutdown().await;
        waiter.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_sleep_interrupted() {
        let coordinator = ShutdownCoordinator::new();
        let signal = coordinator.signal();

        assert!(signal.sleep(Duration::from_millis(5)).await);

        coordinator.shutdown().await;
        assert!(!signal.sleep(Duration::from_secs(60)).await);
    }

    #[tokio::test]
    async fn test_shutdown_hook() {
        let coordinator = ShutdownCoordinator::new();
        let hook_called = Arc::new(AtomicBool::new(false));
        let hook_called2 = hook_called.clone();

        coordinator
            .register_hook(move || {
                hook_called2.store(true, Ordering::SeqCst);
            })
            .await;

        coordinator.shutdown().await;

        assert!(hook_called.load(Ordering::SeqCst));
    }
}
