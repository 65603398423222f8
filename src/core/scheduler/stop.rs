// src/core/scheduler/stop.rs

//! Stop paths: per-spec shutdown with cooperative draining, whole-system
//! shutdown, and catalog-driven reconfiguration.

use super::Scheduler;
use super::pool::Pool;
use crate::config::{CatalogDiff, SpecRegistry};
use crate::core::errors::ProcmuxError;
use crate::core::traits::{Lifecycle, Metrics};
use crate::core::types::{Instance, InstanceState, SpecKey};
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

impl Scheduler {
    /// Stops every instance of a spec: the warm floor drops to zero, any
    /// in-flight start is invalidated and canceled, idle instances stop in
    /// parallel, and busy instances drain under their per-spec timeout.
    ///
    /// Late calls for pools whose spec already left the registry are
    /// allowed; a spec key that never had a pool is `UnknownSpecKey`.
    pub async fn stop_spec(
        self: &Arc<Self>,
        spec_key: &SpecKey,
        reason: &str,
    ) -> Result<(), ProcmuxError> {
        let pool = self.pool_for(spec_key)?;
        let mut inner = pool.inner.lock().await;
        inner.min_ready = 0;
        inner.generation += 1;
        let start_cancel =
            std::mem::replace(&mut inner.start_cancel, CancellationToken::new());
        start_cancel.cancel();

        let mut idle = Vec::new();
        let mut to_drain = Vec::new();
        for inst in inner.instances.drain(..) {
            if inst.busy_count() == 0 {
                idle.push(inst);
            } else {
                inst.set_state(InstanceState::Draining);
                to_drain.push(inst);
            }
        }
        inner.draining.extend(to_drain.iter().cloned());
        for (_, binding) in inner.sticky.drain() {
            binding.instance.set_sticky_key(None);
        }
        let server = inner.spec.name.clone();
        let drain_timeout = Duration::from_secs(inner.spec.drain_timeout_seconds);
        pool.signal_waiters_locked(&mut inner);
        drop(inner);

        info!(
            spec_key = %spec_key,
            reason,
            idle = idle.len(),
            draining = to_drain.len(),
            "Stopping spec."
        );
        self.metrics().set_pool_size(&server, 0);

        for inst in idle {
            let pool = pool.clone();
            let lifecycle = self.lifecycle().clone();
            let metrics = self.metrics().clone();
            let reason = reason.to_string();
            tokio::spawn(async move {
                stop_pooled_instance(&pool, &lifecycle, &metrics, &inst, &reason).await;
            });
        }
        for inst in to_drain {
            tokio::spawn(drain_instance(
                pool.clone(),
                self.lifecycle().clone(),
                self.metrics().clone(),
                inst,
                drain_timeout,
            ));
        }
        Ok(())
    }

    /// `stop_spec` applied to every pool.
    pub async fn stop_all(self: &Arc<Self>) {
        let pools = self.all_pools();
        info!(pools = pools.len(), "Stopping all pools.");
        for pool in pools {
            let key = pool.key.clone();
            if let Err(err) = self.stop_spec(&key, "shutdown").await {
                warn!(spec_key = %key, error = %err, "Failed to stop pool during shutdown.");
            }
        }
    }

    /// Installs a new spec registry, refreshes every surviving pool's spec,
    /// and stops pools whose specs were removed or replaced. Replaced specs
    /// restart lazily: the next acquire against the new fingerprint creates
    /// a fresh pool.
    pub async fn apply_catalog_diff(
        self: &Arc<Self>,
        diff: &CatalogDiff,
        new_registry: SpecRegistry,
    ) -> Result<(), ProcmuxError> {
        info!(
            added = diff.added_spec_keys.len(),
            removed = diff.removed_spec_keys.len(),
            replaced = diff.replaced_spec_keys.len(),
            "Applying catalog diff."
        );
        {
            let registry = Arc::new(new_registry);
            self.install_registry(registry.clone());
            for pool in self.all_pools() {
                if let Some(spec) = registry.get(&pool.key) {
                    let mut inner = pool.inner.lock().await;
                    inner.spec = spec.clone();
                }
            }
        }
        for key in diff
            .removed_spec_keys
            .iter()
            .chain(diff.replaced_spec_keys.iter())
        {
            match self.stop_spec(key, "catalog update").await {
                Ok(()) => {}
                Err(ProcmuxError::UnknownSpecKey(_)) => {
                    debug!(spec_key = %key, "Catalog removed a spec that never ran.");
                }
                Err(err) => return Err(err.with_op("scheduler apply catalog diff")),
            }
            self.remove_pool(key);
        }
        Ok(())
    }
}

/// Stops an instance that was removed from `instances` while idle, then
/// accounts for it.
pub(super) async fn stop_pooled_instance(
    pool: &Arc<Pool>,
    lifecycle: &Arc<dyn Lifecycle>,
    metrics: &Arc<dyn Metrics>,
    inst: &Arc<Instance>,
    reason: &str,
) {
    inst.set_state(InstanceState::Stopped);
    if let Err(err) = lifecycle.stop_instance(inst, reason).await {
        warn!(instance = %inst.id, error = %err, "Failed to stop instance.");
    }
    let mut inner = pool.inner.lock().await;
    inner.stop_count += 1;
    let server = inner.spec.name.clone();
    pool.signal_waiters_locked(&mut inner);
    drop(inner);
    metrics.on_instance_stopped(&server, reason);
    debug!(instance = %inst.id, reason, "Instance stopped.");
}

/// One drain timer per draining instance: waits for the busy count to reach
/// zero (signaled from `release`) or the drain timeout, whichever comes
/// first, then performs the final stop exactly once.
pub(super) async fn drain_instance(
    pool: Arc<Pool>,
    lifecycle: Arc<dyn Lifecycle>,
    metrics: Arc<dyn Metrics>,
    inst: Arc<Instance>,
    timeout: Duration,
) {
    let reason = tokio::select! {
        _ = inst.drain_done.notified() => "caller inactive",
        _ = tokio::time::sleep(timeout) => "drain timeout",
    };
    if inst.drain_fired.swap(true, Ordering::SeqCst) {
        return;
    }
    {
        let mut inner = pool.inner.lock().await;
        inner.draining.retain(|d| !Arc::ptr_eq(d, &inst));
        pool.signal_waiters_locked(&mut inner);
    }
    stop_pooled_instance(&pool, &lifecycle, &metrics, &inst, reason).await;
}
