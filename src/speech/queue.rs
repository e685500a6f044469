//! Bounded FIFO shared by the synthesis and playback stages.
//!
//! Capacity is enforced by a [`Semaphore`] of free slots; the items
//! themselves sit behind a short synchronous lock so that draining,
//! atomic replacement, and popping can run arbitrary bookkeeping while
//! no other producer can interleave.

use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard};

use tokio::sync::{Notify, Semaphore, SemaphorePermit};

/// Why an item could not be queued. The item is handed back.
#[derive(Debug, PartialEq, Eq)]
pub enum PushError<T> {
    Full(T),
    Closed(T),
}

impl<T> PushError<T> {
    pub fn into_inner(self) -> T {
        match self {
            PushError::Full(item) | PushError::Closed(item) => item,
        }
    }
}

struct Inner<T> {
    items: VecDeque<T>,
    /// Items admitted without a slot (see [`BoundedQueue::replace`]).
    overflow: usize,
    closed: bool,
}

/// Bounded multi-producer, single-consumer queue.
pub struct BoundedQueue<T> {
    inner: Mutex<Inner<T>>,
    slots: Semaphore,
    ready: Notify,
    capacity: usize,
}

/// A reserved slot. Pushing through it never waits.
pub struct Slot<'a, T> {
    queue: &'a BoundedQueue<T>,
    permit: SemaphorePermit<'a>,
}

impl<T> Slot<'_, T> {
    pub fn push(self, item: T) -> Result<(), T> {
        let mut inner = self.queue.lock();
        if inner.closed {
            return Err(item);
        }
        self.permit.forget();
        inner.items.push_back(item);
        drop(inner);
        self.queue.ready.notify_one();
        Ok(())
    }
}

impl<T> BoundedQueue<T> {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            inner: Mutex::new(Inner {
                items: VecDeque::with_capacity(capacity),
                overflow: 0,
                closed: false,
            }),
            slots: Semaphore::new(capacity),
            ready: Notify::new(),
            capacity,
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner<T>> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Return `n` slots, first paying back any overflow.
    fn release(&self, inner: &mut Inner<T>, n: usize) {
        let repaid = n.min(inner.overflow);
        inner.overflow -= repaid;
        if n > repaid {
            self.slots.add_permits(n - repaid);
        }
    }

    /// Push without waiting.
    pub fn try_push(&self, item: T) -> Result<(), PushError<T>> {
        let permit = match self.slots.try_acquire() {
            Ok(p) => p,
            Err(tokio::sync::TryAcquireError::Closed) => return Err(PushError::Closed(item)),
            Err(tokio::sync::TryAcquireError::NoPermits) => return Err(PushError::Full(item)),
        };
        Slot {
            queue: self,
            permit,
        }
        .push(item)
        .map_err(PushError::Closed)
    }

    /// Wait for a free slot. Fails only once the queue is closed.
    pub async fn reserve(&self) -> Option<Slot<'_, T>> {
        let permit = self.slots.acquire().await.ok()?;
        Some(Slot {
            queue: self,
            permit,
        })
    }

    /// Push, waiting while the queue is full.
    pub async fn push(&self, item: T) -> Result<(), PushError<T>> {
        match self.reserve().await {
            Some(slot) => slot.push(item).map_err(PushError::Closed),
            None => Err(PushError::Closed(item)),
        }
    }

    /// Atomically drain everything and queue `item` alone.
    ///
    /// `under_lock` runs before the drain while producers and the
    /// consumer are excluded. The new item never waits for a slot; if
    /// none is free it is admitted as overflow and repaid on pop.
    pub fn replace(&self, item: T, under_lock: impl FnOnce()) -> Result<Vec<T>, T> {
        let mut inner = self.lock();
        if inner.closed {
            return Err(item);
        }
        under_lock();
        let drained: Vec<T> = inner.items.drain(..).collect();
        if drained.is_empty() {
            match self.slots.try_acquire() {
                Ok(permit) => permit.forget(),
                Err(_) => inner.overflow += 1,
            }
        } else {
            self.release(&mut inner, drained.len() - 1);
        }
        inner.items.push_back(item);
        drop(inner);
        self.ready.notify_one();
        Ok(drained)
    }

    /// Wait for the next item and hand it to `f` while still holding the
    /// queue lock. Returns `None` once the queue is closed.
    pub async fn pop_with<R>(&self, f: impl FnOnce(T) -> R) -> Option<R> {
        let mut f = Some(f);
        loop {
            let notified = self.ready.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let mut inner = self.lock();
                if inner.closed {
                    return None;
                }
                if let Some(item) = inner.items.pop_front() {
                    self.release(&mut inner, 1);
                    return f.take().map(|f| f(item));
                }
            }

            notified.await;
        }
    }

    /// Remove every queued item, running `under_lock` first.
    pub fn drain_with(&self, under_lock: impl FnOnce()) -> Vec<T> {
        let mut inner = self.lock();
        under_lock();
        let drained: Vec<T> = inner.items.drain(..).collect();
        self.release(&mut inner, drained.len());
        drained
    }

    pub fn drain(&self) -> Vec<T> {
        self.drain_with(|| {})
    }

    /// Close the queue, wake the consumer, and return what was pending.
    pub fn close(&self) -> Vec<T> {
        let mut inner = self.lock();
        inner.closed = true;
        let drained: Vec<T> = inner.items.drain(..).collect();
        drop(inner);
        self.slots.close();
        self.ready.notify_waiters();
        drained
    }

    pub fn len(&self) -> usize {
        self.lock().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}
