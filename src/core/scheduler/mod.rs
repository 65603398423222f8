// src/core/scheduler/mod.rs

//! The pool scheduler: one instance pool per spec key, with
//! acquire/release placement under strategy, capacity, and affinity
//! constraints, warm-pool maintenance, draining, and catalog-driven
//! reconfiguration.

mod acquire;
mod maintenance;
mod pool;
mod stop;

use crate::config::{RuntimeConfig, SpecRegistry};
use crate::core::errors::ProcmuxError;
use crate::core::traits::{Lifecycle, Metrics};
use crate::core::types::{Instance, InstanceState, PoolInfo, SpecKey};
use dashmap::DashMap;
use parking_lot::RwLock;
use pool::Pool;
use std::sync::Arc;
use tracing::debug;

/// The concurrent instance-pool manager. One `Scheduler` owns every pool,
/// every instance, and the exactly-once obligation to stop each instance it
/// started.
pub struct Scheduler {
    pools: DashMap<SpecKey, Arc<Pool>>,
    registry: RwLock<Arc<SpecRegistry>>,
    runtime: RwLock<RuntimeConfig>,
    lifecycle: Arc<dyn Lifecycle>,
    metrics: Arc<dyn Metrics>,
}

impl Scheduler {
    pub fn new(
        lifecycle: Arc<dyn Lifecycle>,
        registry: SpecRegistry,
        runtime: RuntimeConfig,
        metrics: Arc<dyn Metrics>,
    ) -> Arc<Self> {
        Arc::new(Self {
            pools: DashMap::new(),
            registry: RwLock::new(Arc::new(registry)),
            runtime: RwLock::new(runtime),
            lifecycle,
            metrics,
        })
    }

    /// The currently installed spec registry.
    pub fn registry(&self) -> Arc<SpecRegistry> {
        self.registry.read().clone()
    }

    pub(crate) fn install_registry(&self, registry: Arc<SpecRegistry>) {
        *self.registry.write() = registry;
    }

    /// Installs a new runtime config; only the scheduler-relevant knobs
    /// (failure threshold, probe interval) are consulted from here.
    pub fn apply_runtime_config(&self, runtime: RuntimeConfig) {
        *self.runtime.write() = runtime;
    }

    pub(crate) fn start_failure_threshold(&self) -> u32 {
        self.runtime.read().start_failure_threshold
    }

    pub(crate) fn probe_interval(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.runtime.read().probe_interval_seconds)
    }

    /// Resolves the pool for a spec key, creating it on first use when the
    /// registry knows the spec. A pool that outlived its registry entry is
    /// still returned so late stop/release traffic can reach it.
    pub(crate) fn pool_for(&self, spec_key: &SpecKey) -> Result<Arc<Pool>, ProcmuxError> {
        if let Some(pool) = self.pools.get(spec_key) {
            return Ok(pool.clone());
        }
        let registry = self.registry();
        let Some(spec) = registry.get(spec_key) else {
            return Err(ProcmuxError::UnknownSpecKey(spec_key.to_string()));
        };
        let pool = self
            .pools
            .entry(spec_key.clone())
            .or_insert_with(|| Arc::new(Pool::new(spec_key.clone(), spec.clone())))
            .clone();
        Ok(pool)
    }

    /// Like `acquire`, but never starts a new instance; fails with
    /// `NoReadyInstance` when nothing is available. Never suspends. Used by
    /// the aggregator for pull-based listings that must not spawn children.
    pub async fn acquire_ready(
        &self,
        spec_key: &SpecKey,
        routing_key: &str,
    ) -> Result<Arc<Instance>, ProcmuxError> {
        let pool = self.pool_for(spec_key)?;
        let mut inner = pool.inner.lock().await;
        match inner
            .acquire_ready_locked(routing_key)
            .map_err(|e| e.with_op("scheduler acquire ready"))?
        {
            Some(inst) => {
                inner.mark_busy_locked(&inst);
                let server = inner.spec.name.clone();
                drop(inner);
                self.metrics.on_acquire(&server);
                Ok(inst)
            }
            None => Err(ProcmuxError::NoReadyInstance(spec_key.to_string())),
        }
    }

    /// Returns an instance after a call completes. Busy count decrements;
    /// hitting zero on a Busy instance transitions it back to Ready and
    /// wakes waiters, hitting zero on a Draining instance completes its
    /// drain. Saturating, so a duplicate release is harmless.
    pub async fn release(&self, instance: &Arc<Instance>) -> Result<(), ProcmuxError> {
        let pool = self.pools.get(&instance.spec_key).map(|p| Arc::clone(p.value()));
        let server = match &pool {
            Some(pool) => {
                let mut inner = pool.inner.lock().await;
                let remaining = instance.decrement_busy();
                instance.touch();
                match instance.state() {
                    InstanceState::Busy if remaining == 0 => {
                        instance.set_state(InstanceState::Ready);
                        pool.signal_waiters_locked(&mut inner);
                    }
                    InstanceState::Draining if remaining == 0 => {
                        instance.drain_done.notify_one();
                    }
                    _ => {}
                }
                inner.spec.name.clone()
            }
            None => {
                // The pool was removed by a catalog update while this call
                // was in flight; the instance can only be draining now.
                debug!(
                    instance = %instance.id,
                    "Release for an instance whose pool is gone."
                );
                let remaining = instance.decrement_busy();
                if instance.state() == InstanceState::Draining && remaining == 0 {
                    instance.drain_done.notify_one();
                }
                instance.spec_key.to_string()
            }
        };
        self.metrics.on_release(&server);
        Ok(())
    }

    /// Reads a consistent snapshot of every pool's instances and counters.
    /// Locks pools one at a time; the result is per-pool consistent.
    pub async fn get_pool_status(&self) -> Vec<PoolInfo> {
        let pools: Vec<Arc<Pool>> = self.pools.iter().map(|e| e.value().clone()).collect();
        let mut out = Vec::with_capacity(pools.len());
        for pool in pools {
            let inner = pool.inner.lock().await;
            out.push(PoolInfo {
                spec_key: pool.key.clone(),
                server_name: inner.spec.name.clone(),
                strategy: inner.spec.strategy,
                min_ready: inner.min_ready,
                starting: inner.starting,
                generation: inner.generation,
                start_count: inner.start_count,
                stop_count: inner.stop_count,
                sticky_bindings: inner.sticky.len(),
                instances: inner.instances.iter().map(|i| i.info()).collect(),
                draining: inner.draining.iter().map(|i| i.info()).collect(),
            });
        }
        out.sort_by(|a, b| a.server_name.cmp(&b.server_name));
        out
    }

    pub(crate) fn lifecycle(&self) -> &Arc<dyn Lifecycle> {
        &self.lifecycle
    }

    pub(crate) fn metrics(&self) -> &Arc<dyn Metrics> {
        &self.metrics
    }

    pub(crate) fn all_pools(&self) -> Vec<Arc<Pool>> {
        self.pools.iter().map(|e| e.value().clone()).collect()
    }

    pub(crate) fn remove_pool(&self, spec_key: &SpecKey) {
        self.pools.remove(spec_key);
    }
}
