// src/core/scheduler/maintenance.rs

//! Periodic maintenance passes invoked by the background tasks: idle
//! reaping, stale sticky-binding reaping, and the liveness probe sweep.

use super::Scheduler;
use super::stop::stop_pooled_instance;
use crate::config::Strategy;
use crate::core::traits::HealthProbe;
use crate::core::types::{Instance, InstanceState, now_millis};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

impl Scheduler {
    /// One idle-reap pass over every pool, followed by stale-binding reap on
    /// the same tick.
    ///
    /// Pools with `min_ready == 0` reap ready instances immediately,
    /// regardless of their idle age: an on-demand pool holds no warmth.
    /// Pools with a floor only reap above it, and only instances idle for at
    /// least `idle_seconds`.
    pub(crate) async fn reap_idle_once(self: &Arc<Self>) {
        let now = now_millis();
        for pool in self.all_pools() {
            let mut inner = pool.inner.lock().await;
            let strategy = inner.spec.strategy;
            let mut reaped: Vec<Arc<Instance>> = Vec::new();

            if !matches!(strategy, Strategy::Persistent | Strategy::Singleton) {
                let min_ready = inner.min_ready;
                let idle_ms = inner.spec.idle_seconds.saturating_mul(1000);
                let mut ready_count = inner.ready_count();
                let mut kept = Vec::with_capacity(inner.instances.len());
                for inst in std::mem::take(&mut inner.instances) {
                    let pinned_by_sticky =
                        strategy == Strategy::Stateful && inner.is_sticky_target(&inst);
                    let eligible = inst.state() == InstanceState::Ready
                        && !pinned_by_sticky
                        && ready_count > min_ready
                        && (min_ready == 0
                            || now.saturating_sub(inst.last_active_ms()) >= idle_ms);
                    if eligible {
                        ready_count -= 1;
                        inst.set_state(InstanceState::Draining);
                        inner.draining.push(inst.clone());
                        reaped.push(inst);
                    } else {
                        kept.push(inst);
                    }
                }
                inner.instances = kept;
                if !reaped.is_empty() {
                    pool.signal_waiters_locked(&mut inner);
                }
            }
            let pool_gauge = if reaped.is_empty() {
                None
            } else {
                Some((inner.spec.name.clone(), inner.instances.len()))
            };

            if strategy == Strategy::Stateful && inner.spec.session_ttl_seconds > 0 {
                let ttl_ms = inner.spec.session_ttl_seconds.saturating_mul(1000);
                let before = inner.sticky.len();
                inner.sticky.retain(|_, binding| {
                    if now.saturating_sub(binding.last_access_ms) >= ttl_ms {
                        binding.instance.set_sticky_key(None);
                        false
                    } else {
                        true
                    }
                });
                let removed = before - inner.sticky.len();
                if removed > 0 {
                    debug!(
                        spec_key = %pool.key,
                        removed,
                        "Reaped stale sticky bindings."
                    );
                }
            }
            drop(inner);
            if let Some((server, size)) = pool_gauge {
                self.metrics().set_pool_size(&server, size);
            }

            for inst in reaped {
                debug!(spec_key = %pool.key, instance = %inst.id, "Reaping idle instance.");
                let pool = pool.clone();
                let lifecycle = self.lifecycle().clone();
                let metrics = self.metrics().clone();
                tokio::spawn(async move {
                    {
                        let mut inner = pool.inner.lock().await;
                        inner.draining.retain(|d| !Arc::ptr_eq(d, &inst));
                    }
                    stop_pooled_instance(&pool, &lifecycle, &metrics, &inst, "idle").await;
                });
            }
        }
    }

    /// One liveness sweep: pings every routable instance. A failed ping
    /// marks the instance Failed, removes it (and any sticky bindings
    /// targeting it) from its pool, and stops the child.
    pub(crate) async fn probe_once(
        self: &Arc<Self>,
        probe: &Arc<dyn HealthProbe>,
        cancel: &CancellationToken,
    ) {
        for pool in self.all_pools() {
            let routable: Vec<Arc<Instance>> = {
                let inner = pool.inner.lock().await;
                inner
                    .instances
                    .iter()
                    .filter(|inst| inst.is_routable())
                    .cloned()
                    .collect()
            };
            for inst in routable {
                match probe.ping(cancel, &inst).await {
                    Ok(()) => inst.mark_heartbeat(),
                    Err(err) => {
                        warn!(
                            spec_key = %pool.key,
                            instance = %inst.id,
                            error = %err,
                            "Liveness probe failed; removing instance."
                        );
                        let (server, pool_size) = {
                            let mut inner = pool.inner.lock().await;
                            inner.instances.retain(|i| !Arc::ptr_eq(i, &inst));
                            let dead_keys: Vec<String> = inner
                                .sticky
                                .iter()
                                .filter(|(_, b)| Arc::ptr_eq(&b.instance, &inst))
                                .map(|(k, _)| k.clone())
                                .collect();
                            for key in dead_keys {
                                inner.unbind_sticky_locked(&key);
                            }
                            inst.set_state(InstanceState::Failed);
                            pool.signal_waiters_locked(&mut inner);
                            (inner.spec.name.clone(), inner.instances.len())
                        };
                        self.metrics().set_pool_size(&server, pool_size);
                        if let Err(stop_err) =
                            self.lifecycle().stop_instance(&inst, "probe failed").await
                        {
                            warn!(
                                instance = %inst.id,
                                error = %stop_err,
                                "Failed to stop unhealthy instance."
                            );
                        }
                        let mut inner = pool.inner.lock().await;
                        inner.stop_count += 1;
                        drop(inner);
                        self.metrics().on_instance_stopped(&server, "probe failed");
                    }
                }
            }
        }
    }
}
