use std::collections::VecDeque;
use std::fmt;
use std::sync::{Mutex, MutexGuard, PoisonError};
use tokio::sync::Notify;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BufferError {
    ExceedsCapacity { requested: usize, capacity: usize },
    InsufficientRoom { requested: usize, free: usize },
}

impl fmt::Display for BufferError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BufferError::ExceedsCapacity {
                requested,
                capacity,
            } => write!(
                f,
                "batch of {requested} items can never fit a buffer of capacity {capacity}"
            ),
            BufferError::InsufficientRoom { requested, free } => {
                write!(f, "batch of {requested} items does not fit the {free} free slots")
            }
        }
    }
}

impl std::error::Error for BufferError {}

/// FIFO buffer with a hard capacity ceiling.
///
/// Producers suspend in [`BoundedBuffer::put`] / [`BoundedBuffer::put_all`] until enough room is
/// free, consumers suspend in [`BoundedBuffer::take`] until an item exists. Items are never
/// dropped except through [`BoundedBuffer::clear`].
pub struct BoundedBuffer<T> {
    items: Mutex<VecDeque<T>>,
    not_empty: Notify,
    not_full: Notify,
    capacity: usize,
}

impl<T> BoundedBuffer<T> {
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0, "capacity must be greater than zero");
        Self {
            items: Mutex::new(VecDeque::with_capacity(capacity)),
            not_empty: Notify::new(),
            not_full: Notify::new(),
            capacity,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Snapshot of the number of buffered items.
    pub fn size(&self) -> usize {
        self.lock().len()
    }

    /// Snapshot of the remaining room before producers start to wait.
    pub fn free_size(&self) -> usize {
        self.capacity.saturating_sub(self.size())
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    pub async fn put(&self, item: T) {
        let mut pending = Some(item);
        loop {
            let notified = self.not_full.notified();
            {
                let mut items = self.lock();
                if items.len() < self.capacity {
                    if let Some(item) = pending.take() {
                        items.push_back(item);
                    }
                    drop(items);
                    self.not_empty.notify_waiters();
                    return;
                }
            }
            notified.await;
        }
    }

    /// Inserts the whole batch at once, waiting until the buffer has room for all of it.
    ///
    /// A batch larger than the capacity could never be admitted and is rejected up front.
    pub async fn put_all(&self, batch: Vec<T>) -> Result<(), BufferError> {
        if batch.is_empty() {
            return Ok(());
        }
        if batch.len() > self.capacity {
            return Err(BufferError::ExceedsCapacity {
                requested: batch.len(),
                capacity: self.capacity,
            });
        }

        let mut pending = Some(batch);
        loop {
            let notified = self.not_full.notified();
            {
                let mut items = self.lock();
                let needed = pending.as_ref().map(Vec::len).unwrap_or(0);
                if self.capacity - items.len() >= needed {
                    if let Some(batch) = pending.take() {
                        items.extend(batch);
                    }
                    drop(items);
                    self.not_empty.notify_waiters();
                    return Ok(());
                }
            }
            notified.await;
        }
    }

    /// Inserts the whole batch without waiting, or nothing if it does not fit right now.
    pub fn try_put_all(&self, batch: Vec<T>) -> Result<(), BufferError> {
        if batch.is_empty() {
            return Ok(());
        }
        {
            let mut items = self.lock();
            let free = self.capacity - items.len();
            if batch.len() > free {
                return Err(BufferError::InsufficientRoom {
                    requested: batch.len(),
                    free,
                });
            }
            items.extend(batch);
        }
        self.not_empty.notify_waiters();
        Ok(())
    }

    /// Removes the oldest item, waiting until one is available.
    pub async fn take(&self) -> T {
        loop {
            let notified = self.not_empty.notified();
            let next = self.lock().pop_front();
            if let Some(item) = next {
                self.not_full.notify_waiters();
                return item;
            }
            notified.await;
        }
    }

    /// Removes up to `max` of the oldest items without waiting.
    pub fn take_all(&self, max: usize) -> Vec<T> {
        let taken: Vec<T> = {
            let mut items = self.lock();
            let count = max.min(items.len());
            items.drain(..count).collect()
        };
        if !taken.is_empty() {
            self.not_full.notify_waiters();
        }
        taken
    }

    /// Drops every buffered item and returns how many were discarded.
    pub fn clear(&self) -> usize {
        let dropped = {
            let mut items = self.lock();
            let dropped = items.len();
            items.clear();
            dropped
        };
        self.not_full.notify_waiters();
        dropped
    }

    fn lock(&self) -> MutexGuard<'_, VecDeque<T>> {
        self.items.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
