//! Bounded multi-producer/multi-consumer FIFO
//!
//! The hand-off primitive between pipeline stages: the worker pool's task
//! queue, the capture frame queues, the pipeline output queue, and the
//! per-connection send queues are all instances of [`Fifo`].
//!
//! Semaphore permits track items and free slots, so waiting pushers and
//! poppers park without spinning. `shutdown()` closes both semaphores,
//! which wakes every waiter; poppers then drain whatever remains before
//! observing the closed state.

use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Duration;

use tokio::sync::{Semaphore, TryAcquireError};

/// Error returned by the non-blocking push.
#[derive(Debug, PartialEq, Eq)]
pub enum TryPushError<T> {
    /// The queue is at capacity; the item is handed back.
    Full(T),
    /// The queue has been shut down; the item is handed back.
    Shutdown(T),
}

/// Multi-producer/multi-consumer FIFO with optional capacity.
///
/// Ordering is strict FIFO per producer; each item is delivered to exactly
/// one consumer. Fairness across consumers is not guaranteed.
pub struct Fifo<T> {
    inner: Mutex<VecDeque<T>>,
    items: Semaphore,
    space: Semaphore,
    capacity: Option<usize>,
}

impl<T> Fifo<T> {
    /// Create a queue that never blocks pushers.
    pub fn unbounded() -> Self {
        Self {
            inner: Mutex::new(VecDeque::new()),
            items: Semaphore::new(0),
            space: Semaphore::new(Semaphore::MAX_PERMITS),
            capacity: None,
        }
    }

    /// Create a queue holding at most `capacity` items.
    pub fn bounded(capacity: usize) -> Self {
        assert!(capacity > 0, "fifo capacity must be non-zero");
        Self {
            inner: Mutex::new(VecDeque::with_capacity(capacity)),
            items: Semaphore::new(0),
            space: Semaphore::new(capacity),
            capacity: Some(capacity),
        }
    }

    /// Append an item, waiting for space if the queue is at capacity.
    ///
    /// Returns the item back if the queue was shut down.
    pub async fn push(&self, item: T) -> Result<(), T> {
        match self.space.acquire().await {
            Ok(permit) => {
                permit.forget();
                self.inner.lock().unwrap().push_back(item);
                self.items.add_permits(1);
                Ok(())
            }
            Err(_) => Err(item),
        }
    }

    /// Append an item without waiting.
    pub fn try_push(&self, item: T) -> Result<(), TryPushError<T>> {
        match self.space.try_acquire() {
            Ok(permit) => {
                permit.forget();
                self.inner.lock().unwrap().push_back(item);
                self.items.add_permits(1);
                Ok(())
            }
            Err(TryAcquireError::NoPermits) => Err(TryPushError::Full(item)),
            Err(TryAcquireError::Closed) => Err(TryPushError::Shutdown(item)),
        }
    }

    /// Append an item, evicting the oldest one when at capacity.
    ///
    /// Returns the evicted item, if any. Intended for a single producer
    /// (drop-oldest capture backpressure); after shutdown the item is
    /// silently discarded.
    pub fn push_evicting(&self, item: T) -> Option<T> {
        let mut item = item;
        loop {
            match self.try_push(item) {
                Ok(()) => return None,
                Err(TryPushError::Shutdown(_)) => return None,
                Err(TryPushError::Full(back)) => {
                    item = back;
                    let mut queue = self.inner.lock().unwrap();
                    if self.capacity.map_or(false, |cap| queue.len() >= cap) {
                        // Swap oldest for newest; item and space permit
                        // counts are unchanged.
                        let evicted = queue.pop_front();
                        queue.push_back(item);
                        return evicted;
                    }
                    // A consumer freed a slot between the failed push and
                    // taking the lock; retry the normal path.
                }
            }
        }
    }

    /// Wait for the next item.
    ///
    /// After [`shutdown`](Self::shutdown), remaining items are drained and
    /// then `None` is returned.
    pub async fn pop(&self) -> Option<T> {
        match self.items.acquire().await {
            Ok(permit) => {
                permit.forget();
                let item = self.inner.lock().unwrap().pop_front();
                self.space.add_permits(1);
                item
            }
            // Closed: hand out whatever is left, then None.
            Err(_) => self.inner.lock().unwrap().pop_front(),
        }
    }

    /// Take the next item without waiting.
    pub fn try_pop(&self) -> Option<T> {
        match self.items.try_acquire() {
            Ok(permit) => {
                permit.forget();
                let item = self.inner.lock().unwrap().pop_front();
                self.space.add_permits(1);
                item
            }
            Err(TryAcquireError::Closed) => self.inner.lock().unwrap().pop_front(),
            Err(TryAcquireError::NoPermits) => None,
        }
    }

    /// Wait up to `timeout` for the next item.
    pub async fn pop_for(&self, timeout: Duration) -> Option<T> {
        tokio::time::timeout(timeout, self.pop()).await.ok().flatten()
    }

    /// Close the queue, waking every waiting pusher and popper.
    ///
    /// Idempotent. Buffered items remain poppable; pushes fail from this
    /// point on.
    pub fn shutdown(&self) {
        self.items.close();
        self.space.close();
    }

    pub fn is_shutdown(&self) -> bool {
        self.items.is_closed()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
