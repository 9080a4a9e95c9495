//! Admission control: bounded in-flight work with bounded waiting.
//!
//! A [`ConcurrencyLimiter`] owns `capacity` slots. Entering takes a slot
//! immediately when one is free; otherwise the caller queues for at most
//! `max_wait` and is rejected with [`Error::ServiceOverloaded`] if no slot
//! frees up in time. A rejected caller never held a slot.
//!
//! Waiters are admitted first-come first-served: the slots are a tokio
//! [`Semaphore`], which queues acquirers in FIFO order.
//!
//! The slot is an [`Admission`] guard. Dropping it gives the slot back, so
//! release happens exactly once on every exit path, including a handler
//! error and a cancelled (dropped) request future.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{OwnedSemaphorePermit, Semaphore};

use crate::error::Error;

/// One admission scope (global, or a single route).
///
/// Cheap to clone; clones share the same slots.
#[derive(Clone, Debug)]
pub struct ConcurrencyLimiter {
    slots: Arc<Semaphore>,
    capacity: usize,
    max_wait: Duration,
}

impl ConcurrencyLimiter {
    /// `capacity` of zero admits nothing.
    pub fn new(capacity: usize, max_wait: Duration) -> Self {
        Self { slots: Arc::new(Semaphore::new(capacity)), capacity, max_wait }
    }

    /// Takes a slot, waiting at most `max_wait` for one.
    pub async fn acquire(&self) -> Result<Admission, Error> {
        match tokio::time::timeout(self.max_wait, Arc::clone(&self.slots).acquire_owned()).await {
            Ok(Ok(permit)) => Ok(Admission { _permit: permit }),
            // Elapsed, or the semaphore was closed. Either way nothing was taken.
            Ok(Err(_)) | Err(_) => {
                tracing::debug!(
                    capacity = self.capacity,
                    max_wait_ms = self.max_wait.as_millis() as u64,
                    "admission rejected",
                );
                Err(Error::ServiceOverloaded)
            }
        }
    }

    /// Requests currently holding a slot.
    pub fn in_flight(&self) -> usize {
        self.capacity - self.slots.available_permits()
    }

    pub fn capacity(&self) -> usize { self.capacity }
    pub fn max_wait(&self) -> Duration { self.max_wait }
}

/// A held slot. Released on drop.
#[derive(Debug)]
pub struct Admission {
    _permit: OwnedSemaphorePermit,
}
