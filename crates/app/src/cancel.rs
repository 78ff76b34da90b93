use std::sync::Arc;

use tokio::sync::watch;
use tracing::{debug, warn};

use crate::error::CliError;

/// Process-wide cancellation sentinel. Cloned into every long-running
/// operation; flipping it once stops all of them.
#[derive(Clone, Debug)]
pub struct Shutdown {
    tx: Arc<watch::Sender<bool>>,
}

impl Default for Shutdown {
    fn default() -> Self {
        Self::new()
    }
}

impl Shutdown {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self { tx: Arc::new(tx) }
    }

    pub fn cancel(&self) {
        self.tx.send_replace(true);
    }

    pub fn is_cancelled(&self) -> bool {
        *self.tx.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.tx.subscribe()
    }

    /// Resolves once `cancel` has been called.
    pub async fn cancelled(&self) {
        let mut rx = self.tx.subscribe();
        // The sender lives as long as `self`, so wait_for only fails if it is dropped.
        let _ = rx.wait_for(|flag| *flag).await;
    }

    pub fn check(&self) -> Result<(), CliError> {
        if self.is_cancelled() {
            Err(CliError::Cancelled)
        } else {
            Ok(())
        }
    }

    /// Flip the sentinel on SIGINT, SIGTERM or SIGQUIT.
    pub fn install_signal_handlers(&self) {
        let shutdown = self.clone();
        tokio::spawn(async move {
            wait_for_signal().await;
            debug!("termination signal received");
            shutdown.cancel();
        });
    }
}

#[cfg(unix)]
async fn wait_for_signal() {
    use tokio::signal::unix::{SignalKind, signal};

    let kinds = [
        SignalKind::interrupt(),
        SignalKind::terminate(),
        SignalKind::quit(),
    ];
    let mut streams = Vec::new();
    for kind in kinds {
        match signal(kind) {
            Ok(stream) => streams.push(stream),
            Err(err) => warn!(?err, "failed to register signal handler"),
        }
    }
    if streams.is_empty() {
        std::future::pending::<()>().await;
    }
    let waits = streams
        .iter_mut()
        .map(|stream| Box::pin(async move { stream.recv().await }));
    futures::future::select_all(waits).await;
}

#[cfg(not(unix))]
async fn wait_for_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        warn!(?err, "failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn cancel_wakes_waiters() {
        let shutdown = Shutdown::new();
        let waiter = {
            let shutdown = shutdown.clone();
            tokio::spawn(async move { shutdown.cancelled().await })
        };
        assert!(!shutdown.is_cancelled());
        shutdown.cancel();
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("waiter woke")
            .unwrap();
        assert!(matches!(shutdown.check(), Err(CliError::Cancelled)));
    }

    #[tokio::test]
    async fn late_subscribers_see_cancellation() {
        let shutdown = Shutdown::new();
        shutdown.cancel();
        let rx = shutdown.subscribe();
        assert!(*rx.borrow());
        shutdown.cancelled().await;
    }
}
