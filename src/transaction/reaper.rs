//! Expired Transaction Reaper
//!
//! A background task that periodically rolls back transactions whose
//! deadline passed while no caller was driving them. Without it an abandoned
//! `Serializable` transaction keeps its target locks until someone touches it
//! again.

use std::sync::{Arc, Weak};
use std::time::Duration;

use log::{debug, info, warn};
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::TransactionCoordinator;

pub struct TransactionReaper {
    coordinator: Weak<TransactionCoordinator>,
    interval: Duration,
    cancel: CancellationToken,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl TransactionReaper {
    /// The reaper only holds the coordinator weakly and exits once it is gone
    pub fn new(coordinator: &Arc<TransactionCoordinator>) -> Arc<Self> {
        Arc::new(Self {
            coordinator: Arc::downgrade(coordinator),
            interval: coordinator.config().reap_interval,
            cancel: CancellationToken::new(),
            task: Mutex::new(None),
        })
    }

    /// Spawn the reap loop on the current runtime; false if already started
    pub fn start(self: &Arc<Self>) -> bool {
        if self.cancel.is_cancelled() {
            return false;
        }
        let mut task = self.task.lock();
        if task.is_some() {
            return false;
        }
        let reaper = Arc::clone(self);
        *task = Some(tokio::spawn(async move { reaper.run().await }));
        debug!("Transaction reaper started (interval {:?})", self.interval);
        true
    }

    async fn run(self: Arc<Self>) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = ticker.tick() => {
                    let coordinator = match self.coordinator.upgrade() {
                        Some(coordinator) => coordinator,
                        None => break,
                    };
                    let reaped = coordinator.reap_expired().await;
                    if reaped > 0 {
                        info!("Rolled back {} expired transaction(s)", reaped);
                    }
                }
            }
        }
        debug!("Transaction reaper loop exited");
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Stop the loop and wait for an in-flight pass
    pub async fn stop(&self) {
        self.cancel();
        let task = self.task.lock().take();
        if let Some(task) = task {
            if let Err(e) = task.await {
                warn!("Transaction reaper ended abnormally: {}", e);
            }
        }
    }

    pub fn is_running(&self) -> bool {
        self.task.lock().as_ref().map_or(false, |t| !t.is_finished())
    }
}
