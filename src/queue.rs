//! Fixed-capacity blocking queue.
//!
//! [`BoundedQueue`] is the backpressure mechanism of the stack: a slow
//! consumer throttles its producer instead of buffering unbounded memory.
//! Multiple producers and consumers may share one queue; delivery order
//! equals enqueue order.

use std::collections::VecDeque;
use std::sync::Mutex;

use tokio::sync::Notify;

use crate::core::QueueClosed;

struct Inner<T> {
    items: VecDeque<T>,
    closed: bool,
}

/// Fixed-capacity multi-producer / multi-consumer FIFO queue.
///
/// `push` suspends while the queue is full, `pop` suspends while it is empty.
/// [`close`](BoundedQueue::close) wakes every blocked caller: subsequent
/// `push` calls fail with [`QueueClosed`], while `pop` drains the remaining
/// items before failing.
pub struct BoundedQueue<T> {
    inner: Mutex<Inner<T>>,
    capacity: usize,
    not_full: Notify,
    not_empty: Notify,
}

impl<T> BoundedQueue<T> {
    /// Create a queue holding at most `capacity` items.
    ///
    /// # Panics
    ///
    /// Panics if `capacity` is zero.
    pub fn new(capacity: usize) -> Self {
        assert!(capacity >= 1, "queue capacity must be at least 1");
        Self {
            inner: Mutex::new(Inner {
                items: VecDeque::with_capacity(capacity),
                closed: false,
            }),
            capacity,
            not_full: Notify::new(),
            not_empty: Notify::new(),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner<T>> {
        // A poisoned mutex only means a panic elsewhere; the queue state
        // itself is always consistent.
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Enqueue an item, suspending while the queue is at capacity.
    ///
    /// Wakes one blocked consumer on success.
    pub async fn push(&self, item: T) -> Result<(), QueueClosed> {
        let mut slot = Some(item);
        loop {
            // Register interest before checking, so a close() or pop()
            // between the check and the await cannot be missed.
            let notified = self.not_full.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let mut q = self.lock();
                if q.closed {
                    return Err(QueueClosed);
                }
                if q.items.len() < self.capacity {
                    if let Some(v) = slot.take() {
                        q.items.push_back(v);
                    }
                    drop(q);
                    self.not_empty.notify_one();
                    return Ok(());
                }
            }

            notified.await;
        }
    }

    /// Dequeue the next item in FIFO order, suspending while the queue is
    /// empty.
    ///
    /// After [`close`](BoundedQueue::close), remaining items are still
    /// drained; only an empty closed queue fails.
    pub async fn pop(&self) -> Result<T, QueueClosed> {
        loop {
            let notified = self.not_empty.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let mut q = self.lock();
                if let Some(v) = q.items.pop_front() {
                    drop(q);
                    self.not_full.notify_one();
                    return Ok(v);
                }
                if q.closed {
                    return Err(QueueClosed);
                }
            }

            notified.await;
        }
    }

    /// Close the queue, waking every blocked `push` and `pop`.
    pub fn close(&self) {
        {
            let mut q = self.lock();
            q.closed = true;
        }
        self.not_full.notify_waiters();
        self.not_empty.notify_waiters();
    }

    /// Whether the queue has been closed.
    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    /// Number of items currently queued.
    pub fn len(&self) -> usize {
        self.lock().items.len()
    }

    /// Whether the queue is currently empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether the queue is currently at capacity.
    pub fn is_full(&self) -> bool {
        self.len() >= self.capacity
    }
}

impl<T> std::fmt::Debug for BoundedQueue<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let q = self.lock();
        f.debug_struct("BoundedQueue")
            .field("len", &q.items.len())
            .field("capacity", &self.capacity)
            .field("closed", &q.closed)
            .finish()
    }
}
