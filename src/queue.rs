//! Bounded FIFO channels connecting the gateway, workers, and correlator.
//!
//! Capacity is the admission-control limit: once a queue is full, `put`
//! waits at most its timeout and then hands the item back as [`QueueFull`].

use std::time::Duration;

use crossbeam_channel::{
    bounded, Receiver, RecvTimeoutError, SendTimeoutError, Sender, TrySendError,
};

/// Returned by [`BoundedQueue::put`] when no slot frees up in time.
#[derive(Debug)]
pub struct QueueFull<T>(pub T);

/// Capacity-limited multi-producer, multi-consumer FIFO.
#[derive(Debug)]
pub struct BoundedQueue<T> {
    tx: Sender<T>,
    rx: Receiver<T>,
}

impl<T> Clone for BoundedQueue<T> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
            rx: self.rx.clone(),
        }
    }
}

impl<T> BoundedQueue<T> {
    pub fn new(capacity: usize) -> Self {
        let (tx, rx) = bounded(capacity);
        Self { tx, rx }
    }

    pub fn len(&self) -> usize {
        self.rx.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rx.is_empty()
    }

    /// Enqueues without blocking.
    pub fn try_put(&self, item: T) -> Result<(), QueueFull<T>> {
        self.tx.try_send(item).map_err(|err| match err {
            TrySendError::Full(item) | TrySendError::Disconnected(item) => QueueFull(item),
        })
    }

    /// Enqueues, blocking up to `timeout` for a free slot.
    pub fn put(&self, item: T, timeout: Duration) -> Result<(), QueueFull<T>> {
        self.tx.send_timeout(item, timeout).map_err(|err| match err {
            SendTimeoutError::Timeout(item) | SendTimeoutError::Disconnected(item) => {
                QueueFull(item)
            }
        })
    }

    /// Enqueues, blocking for as long as the queue stays full.
    pub fn put_blocking(&self, item: T) -> Result<(), QueueFull<T>> {
        self.tx.send(item).map_err(|err| QueueFull(err.into_inner()))
    }

    /// Blocks until an item is available.
    ///
    /// Never returns `None` while this queue handle is alive, since it holds
    /// a sender itself; callers stop on a sentinel item instead.
    pub fn get(&self) -> Option<T> {
        self.rx.recv().ok()
    }

    /// Blocks up to `timeout` for an item.
    pub fn get_timeout(&self, timeout: Duration) -> Option<T> {
        match self.rx.recv_timeout(timeout) {
            Ok(item) => Some(item),
            Err(RecvTimeoutError::Timeout | RecvTimeoutError::Disconnected) => None,
        }
    }

    /// Removes every item currently buffered without blocking.
    pub fn drain(&self) -> Vec<T> {
        self.rx.try_iter().collect()
    }
}
