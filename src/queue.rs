//! Bounded ingress buffer feeding the admission gate.
//!
//! `tokio::sync::mpsc` cannot evict queued elements, which the
//! `DropOldest` and `DropBuffer` overflow policies require, so the buffer
//! is a mutex-guarded deque with `Notify`-based wakeups. Producers pick
//! the push flavour matching the configured policy; displaced items are
//! handed back so the caller can answer their owners.

use std::collections::VecDeque;
use std::sync::Mutex;

use tokio::sync::Notify;

pub(crate) struct IngressQueue<T> {
    inner: Mutex<Inner<T>>,
    capacity: usize,
    /// Signalled when an item lands or the queue closes.
    readable: Notify,
    /// Signalled when space frees up or the queue closes.
    writable: Notify,
}

struct Inner<T> {
    items: VecDeque<T>,
    closed: bool,
}

impl<T> IngressQueue<T> {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(Inner { items: VecDeque::new(), closed: false }),
            capacity,
            readable: Notify::new(),
            writable: Notify::new(),
        }
    }

    /// Enqueue, waiting for space (the `Backpressure` policy). Returns the
    /// item when the queue closed instead.
    pub async fn push_wait(&self, item: T) -> Result<(), T> {
        let mut item = item;
        loop {
            let notified = self.writable.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            match self.try_push(item) {
                Ok(()) => return Ok(()),
                Err(PushFull::Closed(rejected)) => return Err(rejected),
                Err(PushFull::Full(rejected)) => item = rejected,
            }
            notified.await;
        }
    }

    /// Enqueue only if there is room (`DropNewest` / `Fail`).
    pub fn try_push(&self, item: T) -> Result<(), PushFull<T>> {
        let mut inner = self.lock();
        if inner.closed {
            return Err(PushFull::Closed(item));
        }
        if inner.items.len() >= self.capacity {
            return Err(PushFull::Full(item));
        }
        inner.items.push_back(item);
        drop(inner);
        self.readable.notify_waiters();
        Ok(())
    }

    /// Enqueue, evicting the oldest item when full (`DropOldest`).
    pub fn push_evict_oldest(&self, item: T) -> Result<Option<T>, T> {
        let mut inner = self.lock();
        if inner.closed {
            return Err(item);
        }
        let displaced = if inner.items.len() >= self.capacity {
            inner.items.pop_front()
        } else {
            None
        };
        inner.items.push_back(item);
        drop(inner);
        self.readable.notify_waiters();
        Ok(displaced)
    }

    /// Enqueue after clearing the whole buffer (`DropBuffer`).
    pub fn push_clearing(&self, item: T) -> Result<Vec<T>, T> {
        let mut inner = self.lock();
        if inner.closed {
            return Err(item);
        }
        let displaced: Vec<T> = if inner.items.len() >= self.capacity {
            inner.items.drain(..).collect()
        } else {
            Vec::new()
        };
        inner.items.push_back(item);
        drop(inner);
        self.readable.notify_waiters();
        Ok(displaced)
    }

    /// Dequeue the next item, waiting for one. `None` once the queue is
    /// closed and drained.
    pub async fn pop(&self) -> Option<T> {
        loop {
            let notified = self.readable.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            {
                let mut inner = self.lock();
                if let Some(item) = inner.items.pop_front() {
                    drop(inner);
                    self.writable.notify_waiters();
                    return Some(item);
                }
                if inner.closed {
                    return None;
                }
            }
            notified.await;
        }
    }

    /// Close ingress. Queued items still drain; new pushes are rejected.
    pub fn close(&self) {
        let mut inner = self.lock();
        inner.closed = true;
        drop(inner);
        self.readable.notify_waiters();
        self.writable.notify_waiters();
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner<T>> {
        // A poisoned buffer mutex means a panic mid-push; propagating the
        // poison here would only mask the original panic.
        match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

/// Why a non-blocking push failed.
pub(crate) enum PushFull<T> {
    Full(T),
    Closed(T),
}
