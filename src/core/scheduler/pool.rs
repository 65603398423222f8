// src/core/scheduler/pool.rs

//! Per-spec pool state and the locked selection helpers. Everything in
//! `PoolInner` is guarded by the pool's single async mutex; helpers suffixed
//! `_locked` must only be called while it is held.

use crate::config::{ServerSpec, Strategy};
use crate::core::errors::ProcmuxError;
use crate::core::types::{Instance, InstanceState, SpecKey, now_millis};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, Notify};
use tokio_util::sync::CancellationToken;

/// A sticky binding from a routing key to the instance serving it.
#[derive(Debug)]
pub(crate) struct StickyBinding {
    pub instance: Arc<Instance>,
    pub last_access_ms: u64,
}

/// One pool per spec key. The `Notify` is the pool's condition variable;
/// `PoolInner::signal_seq` is bumped under the lock by every mutation that
/// could unblock a waiter, then waiters are woken through the `Notify`.
#[derive(Debug)]
pub(crate) struct Pool {
    pub key: SpecKey,
    pub inner: Mutex<PoolInner>,
    pub notify: Notify,
}

#[derive(Debug)]
pub(crate) struct PoolInner {
    pub spec: ServerSpec,
    /// Active instances; membership changes always bump `signal_seq`.
    pub instances: Vec<Arc<Instance>>,
    /// Instances in cooperative drain. Never returned from selection.
    pub draining: Vec<Arc<Instance>>,
    pub sticky: HashMap<String, StickyBinding>,
    /// Current desired warm floor; starts at the spec's static floor.
    pub min_ready: usize,
    /// Reservation count: StartInstance calls currently executing.
    pub starting: usize,
    /// Singleflight flag: a start is executing for this pool.
    pub start_in_flight: bool,
    /// Pool-owned cancellation for the in-flight start. Only stop paths
    /// invoke it; caller cancellation never reaches the start.
    pub start_cancel: CancellationToken,
    /// Bumped on every stop so a start that finishes late can detect it was
    /// superseded and must not publish its instance.
    pub generation: u64,
    /// Wakeup sequence; incremented under the lock with every broadcast.
    pub signal_seq: u64,
    /// Round-robin cursor for least-loaded tie-breaking.
    pub rr_index: usize,
    pub start_count: u64,
    pub stop_count: u64,
    /// Consecutive StartInstance failures; gates maintenance starts once it
    /// crosses the configured threshold.
    pub consecutive_start_failures: u32,
}

impl Pool {
    pub fn new(key: SpecKey, spec: ServerSpec) -> Self {
        let min_ready = spec.min_ready;
        Self {
            key,
            inner: Mutex::new(PoolInner {
                spec,
                instances: Vec::new(),
                draining: Vec::new(),
                sticky: HashMap::new(),
                min_ready,
                starting: 0,
                start_in_flight: false,
                start_cancel: CancellationToken::new(),
                generation: 0,
                signal_seq: 0,
                rr_index: 0,
                start_count: 0,
                stop_count: 0,
                consecutive_start_failures: 0,
            }),
            notify: Notify::new(),
        }
    }

    /// Bumps the wakeup sequence and broadcasts to all waiters. Must be
    /// called while the pool lock is held so membership changes and their
    /// signals stay atomic.
    pub fn signal_waiters_locked(&self, inner: &mut PoolInner) {
        inner.signal_seq = inner.signal_seq.wrapping_add(1);
        self.notify.notify_waiters();
    }
}

impl PoolInner {
    /// Strategy-specific ready-instance selection. Returns `Ok(None)` when
    /// nothing is currently acquirable (the caller decides whether to start
    /// or wait); `StickyBusy` is the only error surfaced from here.
    pub fn acquire_ready_locked(
        &mut self,
        routing_key: &str,
    ) -> Result<Option<Arc<Instance>>, ProcmuxError> {
        match self.spec.strategy {
            Strategy::Singleton => Ok(self.select_singleton()),
            Strategy::Stateful => {
                if let Some(found) = self.select_sticky(routing_key)? {
                    return Ok(Some(found));
                }
                Ok(self.select_least_loaded())
            }
            Strategy::Stateless | Strategy::Persistent => Ok(self.select_least_loaded()),
        }
    }

    fn select_singleton(&self) -> Option<Arc<Instance>> {
        let inst = self.instances.first()?;
        if inst.is_routable() && inst.busy_count() < self.spec.max_concurrent {
            Some(inst.clone())
        } else {
            None
        }
    }

    /// Sticky lookup. A bound, routable instance under its ceiling is
    /// returned with its binding touched; a bound instance at the ceiling is
    /// `StickyBusy`; a dead binding is removed and the caller falls through
    /// to least-loaded selection.
    fn select_sticky(&mut self, routing_key: &str) -> Result<Option<Arc<Instance>>, ProcmuxError> {
        if routing_key.is_empty() {
            return Ok(None);
        }
        let Some(binding) = self.sticky.get_mut(routing_key) else {
            return Ok(None);
        };
        if binding.instance.is_routable() {
            if binding.instance.busy_count() < self.spec.max_concurrent {
                binding.last_access_ms = now_millis();
                return Ok(Some(binding.instance.clone()));
            }
            return Err(ProcmuxError::StickyBusy(routing_key.to_string()));
        }
        self.unbind_sticky_locked(routing_key);
        Ok(None)
    }

    /// Least-loaded selection among routable instances under their ceiling,
    /// tie-broken round-robin starting at `rr_index`; the cursor advances
    /// past the chosen slot.
    fn select_least_loaded(&mut self) -> Option<Arc<Instance>> {
        let candidates: Vec<(usize, u32)> = self
            .instances
            .iter()
            .enumerate()
            .filter(|(_, inst)| inst.is_routable() && inst.busy_count() < self.spec.max_concurrent)
            .map(|(i, inst)| (i, inst.busy_count()))
            .collect();
        let min_busy = candidates.iter().map(|(_, busy)| *busy).min()?;
        let tied: Vec<usize> = candidates
            .iter()
            .filter(|(_, busy)| *busy == min_busy)
            .map(|(i, _)| *i)
            .collect();
        // Candidates are non-empty here, so the pool has at least one slot.
        let len = self.instances.len();
        let rr = self.rr_index % len;
        let chosen = tied
            .iter()
            .copied()
            .min_by_key(|&i| (i + len - rr) % len)
            .unwrap_or(tied[0]);
        self.rr_index = (chosen + 1) % len;
        Some(self.instances[chosen].clone())
    }

    /// Marks the instance acquired: busy count up, state Busy, activity
    /// touched.
    pub fn mark_busy_locked(&mut self, inst: &Arc<Instance>) {
        inst.increment_busy();
        inst.set_state(InstanceState::Busy);
        inst.touch();
    }

    /// Binds a routing key to an instance, replacing any previous binding
    /// for the key.
    pub fn bind_sticky_locked(&mut self, routing_key: &str, inst: &Arc<Instance>) {
        inst.set_sticky_key(Some(routing_key.to_string()));
        self.sticky.insert(
            routing_key.to_string(),
            StickyBinding {
                instance: inst.clone(),
                last_access_ms: now_millis(),
            },
        );
    }

    pub fn unbind_sticky_locked(&mut self, routing_key: &str) {
        if let Some(binding) = self.sticky.remove(routing_key) {
            binding.instance.set_sticky_key(None);
        }
    }

    /// Whether any sticky binding currently targets the given instance.
    pub fn is_sticky_target(&self, inst: &Arc<Instance>) -> bool {
        self.sticky
            .values()
            .any(|b| Arc::ptr_eq(&b.instance, inst))
    }

    pub fn ready_count(&self) -> usize {
        self.instances
            .iter()
            .filter(|inst| inst.state() == InstanceState::Ready)
            .count()
    }
}
