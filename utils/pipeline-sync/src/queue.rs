use std::{
    collections::VecDeque,
    time::{Duration, Instant},
};

use parking_lot::{Condvar, Mutex, MutexGuard};

struct Inner<T> {
    items: VecDeque<T>,
    /// Incremented by every call to `signal_not_empty`.
    wakes: u64,
}

/// A FIFO queue protected by a mutex with a "not empty" condition.
///
/// `push` never blocks. The blocking pops return `None` when they are woken by
/// [Self::signal_not_empty] (or time out) while the queue is still empty. It is
/// up to the caller to decide whether that means "stop".
pub struct SynchronizedQueue<T> {
    inner: Mutex<Inner<T>>,
    not_empty: Condvar,
}

impl<T> Default for SynchronizedQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> std::fmt::Debug for SynchronizedQueue<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "SynchronizedQueue {{ len: {} }}", self.len())
    }
}

impl<T> SynchronizedQueue<T> {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                items: VecDeque::new(),
                wakes: 0,
            }),
            not_empty: Condvar::new(),
        }
    }

    /// Append an item and wake one waiting consumer.
    pub fn push(&self, item: T) {
        self.inner.lock().items.push_back(item);
        self.not_empty.notify_one();
    }

    /// Remove the front item without waiting.
    pub fn try_pop(&self) -> Option<T> {
        self.inner.lock().items.pop_front()
    }

    /// Wait until an item is available or the queue is signaled.
    pub fn pop(&self) -> Option<T> {
        let mut inner = self.inner.lock();
        let wakes = inner.wakes;
        while inner.items.is_empty() && inner.wakes == wakes {
            self.not_empty.wait(&mut inner);
        }
        inner.items.pop_front()
    }

    /// Like [Self::pop] but gives up after `timeout`.
    ///
    /// Workers use this in their main loop so that a stop request is observed
    /// within one `timeout` even if the wake signal raced with the wait.
    pub fn pop_timeout(&self, timeout: Duration) -> Option<T> {
        let deadline = Instant::now() + timeout;
        let mut inner = self.inner.lock();
        let wakes = inner.wakes;
        while inner.items.is_empty() && inner.wakes == wakes {
            if self.not_empty.wait_until(&mut inner, deadline).timed_out() {
                break;
            }
        }
        inner.items.pop_front()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().items.is_empty()
    }

    /// Discard all pending items without delivering them.
    pub fn clear(&self) {
        self.inner.lock().items.clear();
    }

    /// Wake every blocked consumer even though nothing was pushed.
    pub fn signal_not_empty(&self) {
        let mut inner = self.inner.lock();
        inner.wakes = inner.wakes.wrapping_add(1);
        drop(inner);
        self.not_empty.notify_all();
    }

    /// Hold the queue lock for a compound check-then-act sequence.
    ///
    /// The lock is released when the returned guard is dropped.
    pub fn acquire(&self) -> QueueGuard<'_, T> {
        QueueGuard {
            inner: self.inner.lock(),
            not_empty: &self.not_empty,
        }
    }
}

/// Exclusive access to a [SynchronizedQueue], obtained with
/// [SynchronizedQueue::acquire].
pub struct QueueGuard<'a, T> {
    inner: MutexGuard<'a, Inner<T>>,
    not_empty: &'a Condvar,
}

impl<T> QueueGuard<'_, T> {
    pub fn push(&mut self, item: T) {
        self.inner.items.push_back(item);
        self.not_empty.notify_one();
    }

    pub fn is_empty(&self) -> bool {
        self.inner.items.is_empty()
    }

    pub fn clear(&mut self) {
        self.inner.items.clear();
    }
}
