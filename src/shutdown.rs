//! Cooperative shutdown on Ctrl-C.
//!
//! The first interrupt flips a shared flag: drivers and workers stop claiming new
//! chapters, in-flight calls finish, and retry waits are cut short. A second interrupt
//! exits immediately; persisted files are always consistent because every write is atomic.

use std::sync::Arc;

use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::errors::EXIT_INTERRUPTED;

#[derive(Debug, Clone)]
pub struct Shutdown {
    tx: Arc<watch::Sender<bool>>,
    rx: watch::Receiver<bool>,
}

impl Default for Shutdown {
    fn default() -> Self {
        Self::new()
    }
}

impl Shutdown {
    pub fn new() -> Self {
        let (tx, rx) = watch::channel(false);
        Self {
            tx: Arc::new(tx),
            rx,
        }
    }

    pub fn trigger(&self) {
        self.tx.send_replace(true);
    }

    pub fn is_triggered(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolve once shutdown has been requested.
    pub async fn triggered(&self) {
        let mut rx = self.rx.clone();
        // The sender lives as long as `self`, so this only returns once the flag is set.
        let _ = rx.wait_for(|stop| *stop).await;
    }

    /// Install the Ctrl-C handler. Must be called from within a Tokio runtime.
    pub fn listen_for_ctrl_c(&self) -> JoinHandle<()> {
        let shutdown = self.clone();
        tokio::spawn(async move {
            loop {
                if tokio::signal::ctrl_c().await.is_err() {
                    return;
                }
                if shutdown.is_triggered() {
                    tracing::warn!("Second interrupt received; exiting immediately");
                    std::process::exit(i32::from(EXIT_INTERRUPTED));
                }
                tracing::warn!(
                    "Interrupt received; finishing in-flight chapters (Ctrl-C again to exit now)"
                );
                shutdown.trigger();
            }
        })
    }
}
