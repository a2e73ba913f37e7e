//! Bounded blocking queues
//!
//! The server moves work between its thread pools through two instances of
//! the generic queue below: accepted sockets travel from the accept loop to
//! the client handlers, and parsed tasks travel from the handlers to the
//! workers. Both directions must apply back-pressure (the queue blocks when
//! full) and both must drain cleanly on shutdown.

use std::collections::VecDeque;

use parking_lot::{Condvar, Mutex};

/// Error returned by [`BoundedQueue::push`] and [`BoundedQueue::try_push`].
/// The rejected item is handed back so the caller can dispose of it.
#[derive(Debug)]
pub enum PushError<T> {
    /// The queue has been shut down; no further items are accepted.
    Shutdown(T),
    /// The queue is at capacity (returned by `try_push` only).
    Full(T),
}

struct Inner<T> {
    items: VecDeque<T>,
    shutdown: bool,
}

/// A capacity-bounded FIFO shared between producer and consumer threads.
///
/// `pop` keeps returning queued items after shutdown until the queue is
/// empty, so work accepted before the shutdown signal is never dropped.
pub struct BoundedQueue<T> {
    capacity: usize,
    inner: Mutex<Inner<T>>,
    not_empty: Condvar,
    not_full: Condvar,
}

impl<T> BoundedQueue<T> {
    /// Create a queue holding at most `capacity` items.
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0, "queue capacity must be non-zero");
        BoundedQueue {
            capacity,
            inner: Mutex::new(Inner {
                items: VecDeque::with_capacity(capacity),
                shutdown: false,
            }),
            not_empty: Condvar::new(),
            not_full: Condvar::new(),
        }
    }

    /// Append an item, blocking while the queue is full.
    ///
    /// Returns the item back inside [`PushError::Shutdown`] if the queue was
    /// shut down before space became available.
    pub fn push(&self, item: T) -> Result<(), PushError<T>> {
        let mut inner = self.inner.lock();
        while inner.items.len() == self.capacity && !inner.shutdown {
            self.not_full.wait(&mut inner);
        }
        if inner.shutdown {
            return Err(PushError::Shutdown(item));
        }
        inner.items.push_back(item);
        self.not_empty.notify_one();
        Ok(())
    }

    /// Append an item without blocking.
    ///
    /// Used by the accept loop, which must answer "server busy" rather than
    /// stall new connections behind slow handlers.
    pub fn try_push(&self, item: T) -> Result<(), PushError<T>> {
        let mut inner = self.inner.lock();
        if inner.shutdown {
            return Err(PushError::Shutdown(item));
        }
        if inner.items.len() == self.capacity {
            return Err(PushError::Full(item));
        }
        inner.items.push_back(item);
        self.not_empty.notify_one();
        Ok(())
    }

    /// Remove the oldest item, blocking while the queue is empty.
    ///
    /// Returns `None` once the queue is both empty and shut down; any items
    /// still queued at shutdown are handed out first.
    pub fn pop(&self) -> Option<T> {
        let mut inner = self.inner.lock();
        while inner.items.is_empty() && !inner.shutdown {
            self.not_empty.wait(&mut inner);
        }
        match inner.items.pop_front() {
            Some(item) => {
                self.not_full.notify_one();
                Some(item)
            }
            None => None,
        }
    }

    /// Set the shutdown flag and wake every blocked producer and consumer.
    pub fn signal_shutdown(&self) {
        let mut inner = self.inner.lock();
        inner.shutdown = true;
        self.not_empty.notify_all();
        self.not_full.notify_all();
    }

    /// Number of items currently queued.
    pub fn len(&self) -> usize {
        self.inner.lock().items.len()
    }

    /// True if no items are queued.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
