// src/core/scheduler/acquire.rs

//! The acquire path: strategy-aware selection, the singleflight start
//! protocol, and warm-pool growth via `set_desired_min_ready`.

use super::Scheduler;
use super::pool::Pool;
use crate::config::{ServerSpec, Strategy};
use crate::core::errors::ProcmuxError;
use crate::core::traits::{Lifecycle, Metrics};
use crate::core::types::{Instance, InstanceState, SpecKey, StartCause};
use futures::FutureExt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

/// What a detached start task reports back to the acquire that initiated it.
enum StartOutcome {
    /// The instance was published into the pool and waiters were signaled.
    Started,
    /// The lifecycle driver failed; the reservation was released.
    Failed(ProcmuxError),
    /// A stop bumped the generation mid-start; the fresh instance was
    /// stopped again and never published.
    Superseded,
    /// A concurrent start won the singleton slot; the extra was stopped.
    SingletonExists,
}

impl Scheduler {
    /// Acquires an instance for the spec, starting one if the pool has no
    /// capacity and nothing is already starting. On success the returned
    /// instance is Busy with its busy count incremented; it must be paired
    /// with exactly one `release`.
    ///
    /// Never returns a Draining, Stopped, or Failed instance.
    pub async fn acquire(
        self: &Arc<Self>,
        cancel: &CancellationToken,
        spec_key: &SpecKey,
        routing_key: &str,
    ) -> Result<Arc<Instance>, ProcmuxError> {
        let pool = self.pool_for(spec_key)?;
        loop {
            if cancel.is_cancelled() {
                return Err(ProcmuxError::Canceled);
            }
            let mut inner = pool.inner.lock().await;
            match inner
                .acquire_ready_locked(routing_key)
                .map_err(|e| e.with_op("scheduler acquire"))?
            {
                Some(inst) => {
                    inner.mark_busy_locked(&inst);
                    let server = inner.spec.name.clone();
                    drop(inner);
                    self.metrics().on_acquire(&server);
                    return Ok(inst);
                }
                None => {}
            }

            let singleton_occupied =
                inner.spec.strategy == Strategy::Singleton && !inner.instances.is_empty();
            if inner.start_in_flight || singleton_occupied {
                // Somebody else is producing capacity; park until the pool
                // broadcasts a state change.
                let notified = pool.notify.notified();
                tokio::pin!(notified);
                notified.as_mut().enable();
                drop(inner);
                tokio::select! {
                    _ = &mut notified => continue,
                    _ = cancel.cancelled() => return Err(ProcmuxError::Canceled),
                }
            }

            // Initiate the singleflight start. The reservation and flag are
            // taken under the lock; the start itself runs detached so a
            // canceled caller cannot abort capacity other waiters need.
            let generation0 = inner.generation;
            inner.start_in_flight = true;
            inner.starting += 1;
            inner.start_cancel = CancellationToken::new();
            let start_token = inner.start_cancel.clone();
            let spec = inner.spec.clone();
            drop(inner);

            let mut handle = spawn_start(
                pool.clone(),
                self.lifecycle().clone(),
                self.metrics().clone(),
                spec,
                generation0,
                start_token,
                StartCause::OnDemand,
                routing_key.to_string(),
            );

            let outcome = tokio::select! {
                joined = &mut handle => joined,
                _ = cancel.cancelled() => {
                    // The start task keeps running and will publish its
                    // instance for the remaining waiters.
                    return Err(ProcmuxError::Canceled);
                }
            };

            match outcome {
                Err(join_err) if join_err.is_panic() => {
                    // The start task already released the reservation and
                    // signaled waiters before resuming the panic.
                    std::panic::resume_unwind(join_err.into_panic());
                }
                Err(_) => {
                    return Err(ProcmuxError::Internal(
                        "start task aborted before completion".to_string(),
                    )
                    .with_op("scheduler acquire"));
                }
                Ok(StartOutcome::Started) => continue,
                Ok(StartOutcome::Superseded) => {
                    return Err(ProcmuxError::NoCapacity(spec_key.to_string())
                        .with_op("scheduler acquire"));
                }
                Ok(StartOutcome::SingletonExists) => {
                    // One retry against the surviving instance.
                    let mut inner = pool.inner.lock().await;
                    match inner.acquire_ready_locked(routing_key) {
                        Ok(Some(inst)) => {
                            inner.mark_busy_locked(&inst);
                            let server = inner.spec.name.clone();
                            drop(inner);
                            self.metrics().on_acquire(&server);
                            return Ok(inst);
                        }
                        _ => {
                            return Err(ProcmuxError::NoCapacity(spec_key.to_string())
                                .with_op("scheduler acquire"));
                        }
                    }
                }
                Ok(StartOutcome::Failed(err)) => {
                    return Err(err.with_op("scheduler acquire"));
                }
            }
        }
    }

    /// Updates the pool's desired warm floor and synchronously grows the
    /// pool until `n` instances exist or are starting. Shrinking is left to
    /// the idle reaper.
    pub async fn set_desired_min_ready(
        self: &Arc<Self>,
        cancel: &CancellationToken,
        spec_key: &SpecKey,
        n: usize,
    ) -> Result<(), ProcmuxError> {
        let pool = self.pool_for(spec_key)?;
        let threshold = self.start_failure_threshold();
        loop {
            if cancel.is_cancelled() {
                return Err(ProcmuxError::Canceled);
            }
            let mut inner = pool.inner.lock().await;
            inner.min_ready = n;
            let covered = inner.instances.len() + inner.starting;
            if covered >= n {
                return Ok(());
            }
            if threshold > 0 && inner.consecutive_start_failures >= threshold {
                warn!(
                    spec_key = %spec_key,
                    failures = inner.consecutive_start_failures,
                    "Start circuit breaker open; skipping warm-pool growth."
                );
                return Err(
                    ProcmuxError::NoReadyInstance(spec_key.to_string())
                        .with_op("scheduler min ready"),
                );
            }

            let singleton_occupied =
                inner.spec.strategy == Strategy::Singleton && !inner.instances.is_empty();
            if inner.start_in_flight || singleton_occupied {
                let notified = pool.notify.notified();
                tokio::pin!(notified);
                notified.as_mut().enable();
                drop(inner);
                tokio::select! {
                    _ = &mut notified => continue,
                    _ = cancel.cancelled() => return Err(ProcmuxError::Canceled),
                }
            }

            let generation0 = inner.generation;
            inner.start_in_flight = true;
            inner.starting += 1;
            inner.start_cancel = CancellationToken::new();
            let start_token = inner.start_cancel.clone();
            let spec = inner.spec.clone();
            drop(inner);

            let mut handle = spawn_start(
                pool.clone(),
                self.lifecycle().clone(),
                self.metrics().clone(),
                spec,
                generation0,
                start_token,
                StartCause::MinReady,
                String::new(),
            );

            let outcome = tokio::select! {
                joined = &mut handle => joined,
                _ = cancel.cancelled() => return Err(ProcmuxError::Canceled),
            };

            match outcome {
                Err(join_err) if join_err.is_panic() => {
                    std::panic::resume_unwind(join_err.into_panic());
                }
                Err(_) => {
                    return Err(ProcmuxError::Internal(
                        "start task aborted before completion".to_string(),
                    )
                    .with_op("scheduler min ready"));
                }
                Ok(StartOutcome::Started) => continue,
                Ok(StartOutcome::Superseded) | Ok(StartOutcome::SingletonExists) => {
                    // A concurrent stop or singleton start changed the
                    // ground under us; re-evaluate against the fresh state.
                    continue;
                }
                Ok(StartOutcome::Failed(err)) => {
                    return Err(err.with_op("scheduler min ready"));
                }
            }
        }
    }
}

/// Runs one `Lifecycle::start_instance` on a detached task, then publishes
/// the result into the pool under its lock. The task owns the reservation
/// cleanup on every path, including panics.
#[allow(clippy::too_many_arguments)]
fn spawn_start(
    pool: Arc<Pool>,
    lifecycle: Arc<dyn Lifecycle>,
    metrics: Arc<dyn Metrics>,
    spec: ServerSpec,
    generation0: u64,
    start_token: CancellationToken,
    cause: StartCause,
    routing_key: String,
) -> JoinHandle<StartOutcome> {
    tokio::spawn(async move {
        let key = pool.key.clone();
        let started = AssertUnwindSafe(lifecycle.start_instance(&start_token, &key, &spec))
            .catch_unwind()
            .await;

        let mut inner = pool.inner.lock().await;
        inner.starting -= 1;
        inner.start_in_flight = false;

        let inst = match started {
            Err(panic) => {
                // Release the reservation and wake waiters before letting
                // the panic continue to the initiating caller.
                pool.signal_waiters_locked(&mut inner);
                drop(inner);
                error!(spec_key = %key, "Panic inside start_instance; reservation released.");
                std::panic::resume_unwind(panic);
            }
            Ok(Err(err)) => {
                inner.consecutive_start_failures += 1;
                pool.signal_waiters_locked(&mut inner);
                let server = inner.spec.name.clone();
                drop(inner);
                metrics.on_start_failure(&server);
                warn!(spec_key = %key, error = %err, "Instance start failed.");
                return StartOutcome::Failed(err);
            }
            Ok(Ok(inst)) => inst,
        };

        if inner.generation != generation0 {
            pool.signal_waiters_locked(&mut inner);
            drop(inner);
            debug!(
                spec_key = %key,
                instance = %inst.id,
                "Start finished under a stale generation; discarding instance."
            );
            stop_discarded(&pool, &lifecycle, &metrics, &inst, "superseded").await;
            return StartOutcome::Superseded;
        }

        if spec.strategy == Strategy::Singleton && !inner.instances.is_empty() {
            pool.signal_waiters_locked(&mut inner);
            drop(inner);
            debug!(
                spec_key = %key,
                instance = %inst.id,
                "Singleton already exists; discarding the extra instance."
            );
            stop_discarded(&pool, &lifecycle, &metrics, &inst, "singleton exists").await;
            return StartOutcome::SingletonExists;
        }

        inst.set_state(InstanceState::Ready);
        inst.set_start_cause(cause);
        inst.touch();
        inner.instances.push(inst.clone());
        inner.start_count += 1;
        inner.consecutive_start_failures = 0;
        if spec.strategy == Strategy::Stateful && !routing_key.is_empty() {
            inner.bind_sticky_locked(&routing_key, &inst);
        }
        let server = inner.spec.name.clone();
        let pool_size = inner.instances.len();
        pool.signal_waiters_locked(&mut inner);
        drop(inner);

        metrics.on_instance_started(&server, cause);
        metrics.set_pool_size(&server, pool_size);
        debug!(spec_key = %key, instance = %inst.id, cause = %cause, "Instance started.");
        StartOutcome::Started
    })
}

/// Stops an instance that lost a publish race and was never pooled.
async fn stop_discarded(
    pool: &Arc<Pool>,
    lifecycle: &Arc<dyn Lifecycle>,
    metrics: &Arc<dyn Metrics>,
    inst: &Arc<Instance>,
    reason: &str,
) {
    inst.set_state(InstanceState::Stopped);
    if let Err(err) = lifecycle.stop_instance(inst, reason).await {
        warn!(instance = %inst.id, error = %err, "Failed to stop discarded instance.");
    }
    let mut inner = pool.inner.lock().await;
    inner.stop_count += 1;
    let server = inner.spec.name.clone();
    drop(inner);
    metrics.on_instance_stopped(&server, reason);
}
