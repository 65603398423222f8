// src/core/tasks/idle_reaper.rs

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast;
use tracing::info;

use crate::core::scheduler::Scheduler;

/// The floor for the reaper period; reaping more often than once a second
/// buys nothing and churns pool locks.
const MIN_REAP_INTERVAL: Duration = Duration::from_secs(1);

/// A task that periodically reaps idle instances above each pool's warm
/// floor and expires stale sticky bindings on the same tick.
///
/// Pools whose floor is zero are reaped immediately after they go idle,
/// regardless of their configured idle age: an on-demand pool keeps no
/// warmth between calls.
pub struct IdleReaper {
    scheduler: Arc<Scheduler>,
    period: Duration,
}

impl IdleReaper {
    pub fn new(scheduler: Arc<Scheduler>, period: Duration) -> Self {
        Self {
            scheduler,
            period: period.max(MIN_REAP_INTERVAL),
        }
    }

    /// Runs the main loop for the idle reaper.
    pub async fn run(self, mut shutdown_rx: broadcast::Receiver<()>) {
        info!("Idle reaper started. Check interval: {:?}", self.period);
        let mut interval = tokio::time::interval(self.period);

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    self.scheduler.reap_idle_once().await;
                }
                _ = shutdown_rx.recv() => {
                    info!("Idle reaper shutting down.");
                    return;
                }
            }
        }
    }
}
