//! Table of callers waiting for a worker result.
//!
//! The mutex only guards map mutation. Handles are always taken out of the
//! map first and resolved after the guard is dropped.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

use tokio::sync::oneshot;

use crate::error::AppError;
use crate::job::{JobId, ResultItem};

/// Value delivered to a waiting caller.
pub type Resolution = Result<ResultItem, AppError>;

#[derive(Default)]
struct Table {
    entries: HashMap<JobId, oneshot::Sender<Resolution>>,
    closed: bool,
}

/// Map from job id to a resolve-once handle.
#[derive(Default)]
pub struct PendingTable {
    inner: Mutex<Table>,
}

impl PendingTable {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Table> {
        // Each mutation is a single map call, so a poisoned guard is still consistent.
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Registers a waiter for `id` and returns the receiving half.
    ///
    /// Fails with [`AppError::ShuttingDown`] once [`fail_all`](Self::fail_all)
    /// has run, so nothing can register after the table was drained.
    pub fn register(&self, id: JobId) -> Result<oneshot::Receiver<Resolution>, AppError> {
        let (tx, rx) = oneshot::channel();
        let mut table = self.lock();
        if table.closed {
            return Err(AppError::ShuttingDown);
        }
        table.entries.insert(id, tx);
        Ok(rx)
    }

    /// Removes the entry for `id`. Returns whether an entry was present;
    /// removing twice is a no-op.
    pub fn remove(&self, id: &JobId) -> bool {
        self.lock().entries.remove(id).is_some()
    }

    /// Resolves and removes the waiter for the result's id.
    ///
    /// Returns `false` when no waiter exists, meaning the caller already gave
    /// up; the result is dropped.
    pub fn resolve(&self, item: ResultItem) -> bool {
        let waiter = self.lock().entries.remove(&item.id);
        match waiter {
            // The receiver may have been dropped between removal and send.
            Some(tx) => tx.send(Ok(item)).is_ok(),
            None => false,
        }
    }

    /// Closes the table and resolves every waiter with `err`.
    ///
    /// Returns the number of waiters released.
    pub fn fail_all(&self, err: AppError) -> usize {
        let drained = {
            let mut table = self.lock();
            table.closed = true;
            std::mem::take(&mut table.entries)
        };
        let count = drained.len();
        for (_, tx) in drained {
            let _ = tx.send(Err(err.clone()));
        }
        count
    }

    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
