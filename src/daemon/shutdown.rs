//! Cooperative shutdown signalling.
//!
//! One [`ShutdownCoordinator`] per daemon hands out [`ShutdownHandle`]s to every
//! task. Any holder may trigger shutdown; every holder can await it. The signal
//! is level-triggered: waiting after it fired returns immediately.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

/// Overall bound on orderly shutdown before the daemon exits regardless.
pub const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(15);

pub struct ShutdownCoordinator {
    tx: Arc<watch::Sender<bool>>,
    rx: watch::Receiver<bool>,
}

#[derive(Clone)]
pub struct ShutdownHandle {
    tx: Arc<watch::Sender<bool>>,
    rx: watch::Receiver<bool>,
}

impl ShutdownCoordinator {
    pub fn new() -> Self {
        let (tx, rx) = watch::channel(false);
        Self {
            tx: Arc::new(tx),
            rx,
        }
    }

    pub fn handle(&self) -> ShutdownHandle {
        ShutdownHandle {
            tx: Arc::clone(&self.tx),
            rx: self.tx.subscribe(),
        }
    }

    pub fn is_shutdown(&self) -> bool {
        *self.rx.borrow()
    }

    pub async fn wait(&mut self) {
        wait_for(&mut self.rx).await;
    }
}

impl Default for ShutdownCoordinator {
    fn default() -> Self {
        Self::new()
    }
}

impl ShutdownHandle {
    pub fn shutdown(&self) {
        self.tx.send_replace(true);
    }

    pub fn is_shutdown(&self) -> bool {
        *self.rx.borrow()
    }

    pub async fn wait(&mut self) {
        wait_for(&mut self.rx).await;
    }
}

async fn wait_for(rx: &mut watch::Receiver<bool>) {
    // The sender lives as long as any handle, so an error here means every
    // other party is gone; treat that as shutdown too.
    let _ = rx.wait_for(|stopped| *stopped).await;
}
