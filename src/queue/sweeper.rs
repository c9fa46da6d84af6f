//! Background lease sweep.
//!
//! The sweeper owns timing only. What a sweep does is passed in, normally
//! [`ReliableQueue::expire_claimed_messages`](super::ReliableQueue::expire_claimed_messages)
//! or [`QueueManager::expire_claimed_messages`](super::QueueManager::expire_claimed_messages)
//! for a given address.

use std::future::Future;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

use crate::address::Address;
use crate::error::Result;

/// Handle to a running lease sweeper.
pub struct SweeperHandle {
    cancel: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl SweeperHandle {
    /// Signal the sweeper to stop. A sweep already in progress finishes first.
    pub fn stop(&self) {
        let _ = self.cancel.send(true);
    }

    /// Stop the sweeper and wait for it to exit.
    pub async fn shutdown(self) {
        self.stop();
        let _ = self.task.await;
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}

/// Spawn a task that runs `sweep` every `interval` until stopped.
///
/// Sweep failures are logged and the loop carries on.
pub fn spawn_lease_sweeper<F, Fut>(address: Address, interval: Duration, sweep: F) -> SweeperHandle
where
    F: Fn() -> Fut + Send + 'static,
    Fut: Future<Output = Result<usize>> + Send + 'static,
{
    let (cancel_tx, mut cancel_rx) = watch::channel(false);

    let task = tokio::spawn(async move {
        info!(
            queue = %address,
            interval_ms = interval.as_millis() as u64,
            "Lease sweeper started"
        );

        loop {
            tokio::select! {
                _ = tokio::time::sleep(interval) => {
                    match sweep().await {
                        Ok(0) => {}
                        Ok(requeued) => debug!(queue = %address, requeued, "Lease sweep requeued messages"),
                        Err(e) => error!(queue = %address, error = %e, "Lease sweep failed"),
                    }
                }
                changed = cancel_rx.changed() => {
                    // A dropped handle also stops the sweeper
                    if changed.is_err() || *cancel_rx.borrow() {
                        info!(queue = %address, "Lease sweeper stopped");
                        break;
                    }
                }
            }
        }
    });

    SweeperHandle {
        cancel: cancel_tx,
        task,
    }
}
