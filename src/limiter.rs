//! Concurrency limiter with a bounded FIFO admission queue.
//!
//! Built on `tokio::sync::Semaphore`, whose waiters are served in arrival
//! order. A request that cannot get a slot immediately takes a queue
//! position; when the queue is full it fails fast instead of waiting.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use tokio::sync::{OwnedSemaphorePermit, Semaphore};

use crate::error::EngineError;

/// Permit to run one execution. Released exactly once, when dropped.
#[derive(Debug)]
pub struct ConcurrencySlot {
    _permit: OwnedSemaphorePermit,
}

/// Bounds simultaneous executions to `max_concurrent`.
#[derive(Debug)]
pub struct ConcurrencyLimiter {
    semaphore: Arc<Semaphore>,
    max_concurrent: usize,
    max_queue_depth: usize,
    queued: Arc<AtomicUsize>,
}

/// Decrements the queue count when the waiter is admitted or gives up.
struct QueuePosition(Arc<AtomicUsize>);

impl Drop for QueuePosition {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

impl ConcurrencyLimiter {
    pub fn new(max_concurrent: usize, max_queue_depth: usize) -> Self {
        Self {
            semaphore: Arc::new(Semaphore::new(max_concurrent)),
            max_concurrent,
            max_queue_depth,
            queued: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Acquire a slot, waiting in FIFO order if none is free.
    ///
    /// Every request goes through the semaphore's wait list, so a newcomer
    /// can never take a permit released to an earlier waiter. The queue
    /// bound only rejects when no permit is free.
    ///
    /// # Cancel Safety
    /// Cancel safe. Dropping the future gives up the queue position.
    pub async fn acquire(&self) -> Result<ConcurrencySlot, EngineError> {
        let depth = self.queued.fetch_add(1, Ordering::SeqCst);
        let position = QueuePosition(Arc::clone(&self.queued));
        if depth >= self.max_queue_depth && self.semaphore.available_permits() == 0 {
            return Err(EngineError::QueueFull { depth });
        }

        let permit = Arc::clone(&self.semaphore)
            .acquire_owned()
            .await
            .map_err(|_| EngineError::LimiterClosed)?;
        drop(position);
        Ok(ConcurrencySlot { _permit: permit })
    }

    /// Slots currently held.
    pub fn in_flight(&self) -> usize {
        self.max_concurrent
            .saturating_sub(self.semaphore.available_permits())
    }

    /// Requests waiting for a slot.
    pub fn queued(&self) -> usize {
        self.queued.load(Ordering::SeqCst)
    }

    pub const fn max_concurrent(&self) -> usize {
        self.max_concurrent
    }

    /// Stop admitting; every waiter fails with `LimiterClosed`.
    pub fn close(&self) {
        self.semaphore.close();
    }
}
