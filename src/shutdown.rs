//! Shutdown signal shared by all the tasks of a vehicle connection

use crate::{Error, Result};
use std::future::Future;
use tokio::sync::watch;

/// Create a connected trigger/token pair
pub fn channel() -> (ShutdownTrigger, Shutdown) {
    let (tx, rx) = watch::channel(false);
    (ShutdownTrigger { tx }, Shutdown { rx })
}

/// Owner side of the shutdown signal
///
/// Dropping the trigger is equivalent to triggering it.
#[derive(Debug)]
pub struct ShutdownTrigger {
    tx: watch::Sender<bool>,
}

impl ShutdownTrigger {
    /// Wake every task waiting on a [Shutdown] token
    pub fn trigger(&self) {
        self.tx.send_replace(true);
    }

    /// Get a new token observing this trigger
    pub fn token(&self) -> Shutdown {
        Shutdown {
            rx: self.tx.subscribe(),
        }
    }
}

/// Cancellation token
#[derive(Debug, Clone)]
pub struct Shutdown {
    rx: watch::Receiver<bool>,
}

impl Shutdown {
    /// True once shutdown has been requested
    pub fn is_triggered(&self) -> bool {
        *self.rx.borrow() || self.rx.has_changed().is_err()
    }

    /// Wait until shutdown is requested
    pub async fn triggered(&mut self) {
        // Err means the trigger was dropped, which counts as a shutdown
        let _ = self.rx.wait_for(|stop| *stop).await;
    }

    /// Run `fut` to completion unless shutdown is requested first
    pub async fn run_until<F: Future>(&self, fut: F) -> Result<F::Output> {
        let mut token = self.clone();
        if token.is_triggered() {
            return Err(Error::Cancelled);
        }
        tokio::select! {
            biased;
            _ = token.triggered() => Err(Error::Cancelled),
            output = fut => Ok(output),
        }
    }
}
