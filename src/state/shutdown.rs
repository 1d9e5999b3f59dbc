use super::request_registry::RequestRegistry;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{info, warn};

/// Fans a shutdown request out to every in-flight request.
///
/// It only raises abort signals. Stopping the listener, unloading the model
/// and exiting the process are left to the server loop.
#[derive(Clone)]
pub struct ShutdownCoordinator {
    registry: RequestRegistry,
    requested: Arc<AtomicBool>,
}

impl ShutdownCoordinator {
    pub fn new(registry: RequestRegistry) -> Self {
        Self {
            registry,
            requested: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Signal every registered request and return immediately. Returns how
    /// many requests were signalled. Safe to call repeatedly.
    pub fn request_shutdown(&self) -> usize {
        if self.requested.swap(true, Ordering::AcqRel) {
            info!("Shutdown already requested, re-signalling active requests...");
        } else {
            info!("Shutdown signal received, aborting active requests...");
        }
        let signalled = self.registry.signal_all();
        info!("{signalled} active request(s) signalled");
        signalled
    }

    pub fn is_shutdown_requested(&self) -> bool {
        self.requested.load(Ordering::Acquire)
    }
}

/// Resolves on Ctrl-C or SIGTERM after signalling every in-flight request.
/// Meant for `axum::serve(..).with_graceful_shutdown(..)`.
pub async fn shutdown_signal(coordinator: ShutdownCoordinator) {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("Failed to install Ctrl-C handler: {e}");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                warn!("Failed to install SIGTERM handler: {e}");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    coordinator.request_shutdown();
}
