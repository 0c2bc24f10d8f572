//! Bounded multi-producer/multi-consumer queue used between pipeline stages.
//!
//! Every stage boundary in the correction pipeline is an [`AsyncQueue`]:
//! producers block when the queue is full (structural backpressure) and
//! consumers block when it is empty. A queue can be terminated exactly once
//! the upstream stage is done; consumers then drain whatever is still queued
//! before observing [`PopResult::Terminated`].
//!
//! # Contract
//!
//! - `push` blocks while the queue is full, unless the queue has been
//!   terminated, in which case it fails and hands the item back.
//! - `pop` blocks while the queue is empty and returns the next item, or
//!   `Terminated` once the queue is terminated *and* drained.
//! - `pop_deadline` additionally returns `Timeout` if no item arrives within
//!   the deadline, letting consumers flush partial batches.
//! - `terminate` is idempotent and wakes all blocked callers.
//! - No item is ever lost between a successful `push` and a later `pop`.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

/// Outcome of a pop operation.
#[derive(Debug, PartialEq, Eq)]
pub enum PopResult<T> {
    /// The next queued item.
    Item(T),
    /// No item arrived within the deadline; the queue is still live.
    Timeout,
    /// The queue is terminated and fully drained.
    Terminated,
}

/// Returned by [`AsyncQueue::push`] when the queue has been terminated.
/// Carries the rejected item back to the caller.
#[derive(Debug, PartialEq, Eq)]
pub struct PushError<T>(pub T);

struct Inner<T> {
    items: VecDeque<T>,
    terminated: bool,
}

/// A bounded blocking MPMC queue with a terminate signal.
pub struct AsyncQueue<T> {
    inner: Mutex<Inner<T>>,
    not_empty: Condvar,
    not_full: Condvar,
    capacity: usize,
}

impl<T> AsyncQueue<T> {
    /// Create a queue holding at most `capacity` items.
    ///
    /// # Panics
    ///
    /// Panics if `capacity` is zero.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0, "queue capacity must be non-zero");
        Self {
            inner: Mutex::new(Inner { items: VecDeque::with_capacity(capacity), terminated: false }),
            not_empty: Condvar::new(),
            not_full: Condvar::new(),
            capacity,
        }
    }

    /// Push an item, blocking while the queue is full.
    ///
    /// # Errors
    ///
    /// Returns the item back if the queue has been terminated.
    pub fn push(&self, item: T) -> Result<(), PushError<T>> {
        let mut inner = self.inner.lock();
        while inner.items.len() >= self.capacity && !inner.terminated {
            self.not_full.wait(&mut inner);
        }
        if inner.terminated {
            return Err(PushError(item));
        }
        inner.items.push_back(item);
        drop(inner);
        self.not_empty.notify_one();
        Ok(())
    }

    /// Pop the next item, blocking while the queue is empty.
    ///
    /// Returns `Terminated` once the queue is terminated and drained;
    /// already-queued items are always delivered first.
    pub fn pop(&self) -> PopResult<T> {
        let mut inner = self.inner.lock();
        loop {
            if let Some(item) = inner.items.pop_front() {
                drop(inner);
                self.not_full.notify_one();
                return PopResult::Item(item);
            }
            if inner.terminated {
                return PopResult::Terminated;
            }
            self.not_empty.wait(&mut inner);
        }
    }

    /// Pop the next item, waiting at most `timeout`.
    ///
    /// Returns `Timeout` if the queue stayed empty (and live) for the whole
    /// wait.
    pub fn pop_deadline(&self, timeout: Duration) -> PopResult<T> {
        let deadline = Instant::now() + timeout;
        let mut inner = self.inner.lock();
        loop {
            if let Some(item) = inner.items.pop_front() {
                drop(inner);
                self.not_full.notify_one();
                return PopResult::Item(item);
            }
            if inner.terminated {
                return PopResult::Terminated;
            }
            if self.not_empty.wait_until(&mut inner, deadline).timed_out() {
                // One last check: an item may have been pushed right as the
                // deadline expired.
                return match inner.items.pop_front() {
                    Some(item) => {
                        drop(inner);
                        self.not_full.notify_one();
                        PopResult::Item(item)
                    }
                    None if inner.terminated => PopResult::Terminated,
                    None => PopResult::Timeout,
                };
            }
        }
    }

    /// Terminate the queue. Idempotent; wakes all blocked producers and
    /// consumers. Queued items remain poppable.
    pub fn terminate(&self) {
        let mut inner = self.inner.lock();
        inner.terminated = true;
        drop(inner);
        self.not_empty.notify_all();
        self.not_full.notify_all();
    }

    /// Whether `terminate` has been called.
    pub fn is_terminated(&self) -> bool {
        self.inner.lock().terminated
    }

    /// Number of queued items.
    pub fn len(&self) -> usize {
        self.inner.lock().items.len()
    }

    /// Whether the queue is currently empty.
    pub fn is_empty(&self) -> bool {
        self.inner.lock().items.is_empty()
    }

    /// Maximum number of queued items.
    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_fifo_order() {
        let queue = AsyncQueue::new(8);
        for i in 0..5 {
            queue.push(i).unwrap();
        }
        for i in 0..5 {
            assert_eq!(queue.pop(), PopResult::Item(i));
        }
    }

    #[test]
    fn test_terminate_drains_before_signalling() {
        let queue = AsyncQueue::new(8);
        queue.push(1).unwrap();
        queue.push(2).unwrap();
        queue.terminate();

        // Queued items are still delivered in order.
        assert_eq!(queue.pop(), PopResult::Item(1));
        assert_eq!(queue.pop(), PopResult::Item(2));
        assert_eq!(queue.pop(), PopResult::Terminated);
        // And the signal is sticky.
        assert_eq!(queue.pop(), PopResult::Terminated);
    }

    #[test]
    fn test_push_fails_after_terminate() {
        let queue = AsyncQueue::new(4);
        queue.terminate();
        assert_eq!(queue.push(42), Err(PushError(42)));
    }

    #[test]
    fn test_terminate_is_idempotent() {
        let queue: AsyncQueue<u32> = AsyncQueue::new(4);
        queue.terminate();
        queue.terminate();
        assert_eq!(queue.pop(), PopResult::Terminated);
    }

    #[test]
    fn test_pop_deadline_times_out() {
        let queue: AsyncQueue<u32> = AsyncQueue::new(4);
        let result = queue.pop_deadline(Duration::from_millis(50));
        assert_eq!(result, PopResult::Timeout);
    }

    #[test]
    fn test_pop_deadline_returns_item() {
        let queue = Arc::new(AsyncQueue::new(4));
        let producer = {
            let queue = Arc::clone(&queue);
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(20));
                queue.push(7u32).unwrap();
            })
        };
        assert_eq!(queue.pop_deadline(Duration::from_secs(5)), PopResult::Item(7));
        producer.join().unwrap();
    }

    /// A full queue blocks the next push until a pop makes room.
    #[test]
    fn test_backpressure_blocks_push() {
        let capacity = 4;
        let queue = Arc::new(AsyncQueue::new(capacity));
        for i in 0..capacity {
            queue.push(i).unwrap();
        }

        let (started_tx, started_rx) = std::sync::mpsc::channel();
        let (done_tx, done_rx) = std::sync::mpsc::channel();
        let blocked_pusher = {
            let queue = Arc::clone(&queue);
            thread::spawn(move || {
                started_tx.send(()).unwrap();
                queue.push(capacity).unwrap();
                done_tx.send(()).unwrap();
            })
        };

        started_rx.recv().unwrap();
        // The extra push must not complete while the queue is full.
        assert!(done_rx.recv_timeout(Duration::from_millis(100)).is_err());

        assert_eq!(queue.pop(), PopResult::Item(0));
        done_rx.recv_timeout(Duration::from_secs(5)).unwrap();
        blocked_pusher.join().unwrap();
        assert_eq!(queue.len(), capacity);
    }

    /// Items pushed by several producers are all delivered exactly once.
    #[test]
    fn test_no_items_lost_across_threads() {
        let queue = Arc::new(AsyncQueue::new(16));
        let producers: Vec<_> = (0..4)
            .map(|p| {
                let queue = Arc::clone(&queue);
                thread::spawn(move || {
                    for i in 0..100u32 {
                        queue.push(p * 100 + i).unwrap();
                    }
                })
            })
            .collect();

        let consumers: Vec<_> = (0..2)
            .map(|_| {
                let queue = Arc::clone(&queue);
                thread::spawn(move || {
                    let mut seen = Vec::new();
                    loop {
                        match queue.pop() {
                            PopResult::Item(v) => seen.push(v),
                            PopResult::Terminated => break,
                            PopResult::Timeout => unreachable!(),
                        }
                    }
                    seen
                })
            })
            .collect();

        for p in producers {
            p.join().unwrap();
        }
        queue.terminate();

        let mut all: Vec<u32> = consumers.into_iter().flat_map(|c| c.join().unwrap()).collect();
        all.sort_unstable();
        let expected: Vec<u32> = (0..4).flat_map(|p| (0..100).map(move |i| p * 100 + i)).collect();
        assert_eq!(all, expected);
    }
}
