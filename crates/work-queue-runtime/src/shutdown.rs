//! Cooperative shutdown signal shared between a process and its workers.

use std::sync::Arc;
use tokio::sync::watch;

#[cfg(test)]
#[path = "shutdown_tests.rs"]
mod tests;

/// One-shot signal; clones observe the same trigger.
///
/// Once triggered it stays triggered.
///
/// ```
/// use work_queue_runtime::Shutdown;
///
/// # tokio_test::block_on(async {
/// let shutdown = Shutdown::new();
/// let observer = shutdown.clone();
///
/// shutdown.trigger();
/// observer.cancelled().await;
/// assert!(observer.is_triggered());
/// # });
/// ```
#[derive(Debug, Clone)]
pub struct Shutdown {
    sender: Arc<watch::Sender<bool>>,
    receiver: watch::Receiver<bool>,
}

impl Shutdown {
    pub fn new() -> Self {
        let (sender, receiver) = watch::channel(false);
        Self {
            sender: Arc::new(sender),
            receiver,
        }
    }

    /// Ask every holder of this signal to stop
    pub fn trigger(&self) {
        self.sender.send_replace(true);
    }

    pub fn is_triggered(&self) -> bool {
        *self.receiver.borrow()
    }

    /// Resolve once the signal has been triggered
    pub async fn cancelled(&self) {
        let mut receiver = self.receiver.clone();
        // The sender lives as long as `self`, so waiting cannot fail
        let _ = receiver.wait_for(|triggered| *triggered).await;
    }
}

impl Default for Shutdown {
    fn default() -> Self {
        Self::new()
    }
}
