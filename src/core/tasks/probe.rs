// src/core/tasks/probe.rs

use std::sync::Arc;

use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::core::scheduler::Scheduler;
use crate::core::traits::HealthProbe;

/// A task that periodically pings every routable instance. Healthy
/// instances get their heartbeat refreshed; unhealthy ones are removed from
/// their pool and stopped.
pub struct PingProbe {
    scheduler: Arc<Scheduler>,
    probe: Arc<dyn HealthProbe>,
}

impl PingProbe {
    pub fn new(scheduler: Arc<Scheduler>, probe: Arc<dyn HealthProbe>) -> Self {
        Self { scheduler, probe }
    }

    /// Runs the main loop for the liveness probe. The interval comes from
    /// the runtime config; an interval of zero disables probing entirely.
    pub async fn run(self, mut shutdown_rx: broadcast::Receiver<()>) {
        let period = self.scheduler.probe_interval();
        if period.is_zero() {
            info!("Liveness probe disabled (probe_interval_seconds is 0).");
            return;
        }
        info!("Liveness probe started. Ping interval: {:?}", period);
        let mut interval = tokio::time::interval(period);
        let cancel = CancellationToken::new();

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    self.scheduler.probe_once(&self.probe, &cancel).await;
                }
                _ = shutdown_rx.recv() => {
                    info!("Liveness probe shutting down.");
                    cancel.cancel();
                    return;
                }
            }
        }
    }
}
