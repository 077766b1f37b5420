//! Delivery of apply results to local waiters

use fxhash::FxHashMap;
use std::sync::{Mutex, MutexGuard};
use tokio::sync::oneshot;

use crate::machines::{ApplyResult, ResultCallback};

#[derive(Debug, Default)]
pub struct ProgressTracker {
    waiters: Mutex<FxHashMap<u64, oneshot::Sender<ApplyResult>>>,
}

impl ProgressTracker {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, FxHashMap<u64, oneshot::Sender<ApplyResult>>> {
        self.waiters.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Registers interest in the result at `index`. Must happen before the entry is
    /// applied; a later registration replaces an earlier one for the same index.
    pub fn register(&self, index: u64) -> oneshot::Receiver<ApplyResult> {
        let (tx, rx) = oneshot::channel();
        self.lock().insert(index, tx);
        rx
    }

    /// Result callback for the command at `index`.
    ///
    /// The waiter is taken out right away: if the callback is dropped unused (the
    /// command was skipped on replay) the waiter observes a closed channel.
    pub fn callback(&self, index: u64) -> ResultCallback {
        let waiter = self.lock().remove(&index);
        Box::new(move |result| {
            if let Some(waiter) = waiter {
                let _ = waiter.send(result);
            }
        })
    }

    /// Drops the waiter of an index that produces no result
    pub fn discard(&self, index: u64) {
        self.lock().remove(&index);
    }

    /// Drops every waiter, they all observe a closed channel
    pub fn abort_all(&self) {
        let dropped = std::mem::take(&mut *self.lock());
        if !dropped.is_empty() {
            log::warn!("abandoning {} waiters", dropped.len());
        }
    }

    #[cfg(test)]
    pub(crate) fn pending(&self) -> usize {
        self.lock().len()
    }
}
