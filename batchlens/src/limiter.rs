//! Admission control for analyzer calls.
use std::sync::Arc;

use thiserror::Error;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

/// A counting gate bounding how many analyses run at the same time.
///
/// Cloning is cheap; all clones share the same slots.
#[derive(Debug, Clone)]
pub struct ConcurrencyLimiter {
    semaphore: Arc<Semaphore>,
    capacity: usize,
}

/// One unit of admission capacity.
///
/// The slot is returned to its [`ConcurrencyLimiter`] when dropped, so it is released on every
/// exit path of the holder, including panics and cancellation.
#[derive(Debug)]
pub struct Slot {
    _permit: OwnedSemaphorePermit,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum LimiterError {
    #[error("Concurrency limiter is closed")]
    Closed,
}

/// Clamps a requested capacity into `1..=Semaphore::MAX_PERMITS`.
///
/// A limiter without slots would never admit an analysis.
pub(crate) const fn clamp_capacity(capacity: usize) -> usize {
    if capacity == 0 {
        1
    } else if capacity > Semaphore::MAX_PERMITS {
        Semaphore::MAX_PERMITS
    } else {
        capacity
    }
}

impl ConcurrencyLimiter {
    /// Capacities of 0 are treated as 1, capacities above [`Semaphore::MAX_PERMITS`] as the
    /// maximum.
    pub fn new(capacity: usize) -> Self {
        let capacity = clamp_capacity(capacity);
        Self {
            semaphore: Arc::new(Semaphore::new(capacity)),
            capacity,
        }
    }

    /// Wait for a free slot.
    ///
    /// Waiters are admitted in the order in which they started waiting.
    pub async fn acquire(&self) -> Result<Slot, LimiterError> {
        self.semaphore
            .clone()
            .acquire_owned()
            .await
            .map(|permit| Slot { _permit: permit })
            .map_err(|_| LimiterError::Closed)
    }

    /// Take a free slot without waiting, if there is one.
    pub fn try_acquire(&self) -> Option<Slot> {
        self.semaphore
            .clone()
            .try_acquire_owned()
            .ok()
            .map(|permit| Slot { _permit: permit })
    }

    /// Fail every pending and future [`ConcurrencyLimiter::acquire`].
    ///
    /// Slots already handed out stay valid until dropped.
    pub fn close(&self) {
        self.semaphore.close();
    }

    pub fn is_closed(&self) -> bool {
        self.semaphore.is_closed()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn available(&self) -> usize {
        self.semaphore.available_permits()
    }

    pub fn in_use(&self) -> usize {
        self.capacity.saturating_sub(self.available())
    }
}
