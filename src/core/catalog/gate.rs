// src/core/catalog/gate.rs

//! The refresh gate: a single-slot semaphore serializing refresh work across
//! all catalog indexes, so transient backend pressure cannot trigger
//! simultaneous fanouts to every server.
//!
//! The gate is passed explicitly to each index at construction; it is never
//! an ambient singleton.

use crate::core::errors::ProcmuxError;
use tokio::sync::{Semaphore, SemaphorePermit};
use tokio_util::sync::CancellationToken;

#[derive(Debug)]
pub struct RefreshGate {
    slot: Semaphore,
}

impl Default for RefreshGate {
    fn default() -> Self {
        Self::new()
    }
}

impl RefreshGate {
    pub fn new() -> Self {
        Self {
            slot: Semaphore::new(1),
        }
    }

    /// Acquires the single slot, waiting until it frees up or the caller's
    /// token fires. The permit releases the slot on drop.
    pub async fn acquire(
        &self,
        cancel: &CancellationToken,
    ) -> Result<SemaphorePermit<'_>, ProcmuxError> {
        tokio::select! {
            permit = self.slot.acquire() => {
                permit.map_err(|_| ProcmuxError::Internal("refresh gate closed".to_string()))
            }
            _ = cancel.cancelled() => Err(ProcmuxError::Canceled),
        }
    }

    /// Acquires the slot without waiting; `None` when it is taken.
    pub fn try_acquire(&self) -> Option<SemaphorePermit<'_>> {
        self.slot.try_acquire().ok()
    }
}
