//! Cooperative shutdown signal
//!
//! Every long-lived task in the pipeline is parameterised by a [`Shutdown`]
//! handle. Requesting shutdown is idempotent and fans out to all clones;
//! tasks either poll [`Shutdown::is_shutdown_requested`] on their hot loop
//! or await [`Shutdown::cancelled`] inside a `select!`.

use std::sync::Arc;
use tokio::sync::watch;

/// Clonable cancellation signal backed by a watch channel.
#[derive(Debug, Clone)]
pub struct Shutdown {
    tx: Arc<watch::Sender<bool>>,
    rx: watch::Receiver<bool>,
}

impl Shutdown {
    pub fn new() -> Self {
        let (tx, rx) = watch::channel(false);
        Self {
            tx: Arc::new(tx),
            rx,
        }
    }

    /// Signal all holders. Idempotent.
    pub fn request_shutdown(&self) {
        // send only fails with no receivers; we always hold one.
        let _ = self.tx.send(true);
    }

    /// Non-blocking check for hot loops.
    pub fn is_shutdown_requested(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolves once shutdown has been requested.
    pub async fn cancelled(&self) {
        let mut rx = self.rx.clone();
        // wait_for returns immediately if the value is already true.
        let _ = rx.wait_for(|requested| *requested).await;
    }
}

impl Default for Shutdown {
    fn default() -> Self {
        Self::new()
    }
}
