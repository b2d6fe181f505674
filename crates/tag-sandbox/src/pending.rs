//! Per-execution table of callback calls awaiting a reply.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use tokio::sync::oneshot;

/// Correlates outstanding calls with their replies by a unique id.
///
/// One table belongs to one execution. Ids are `<prefix>-<n>` with `n` drawn
/// from a counter, so two concurrent calls to the same operation never share
/// an entry. An entry is removed the moment it is resolved; dropping the
/// table (or calling [`abandon_all`](Self::abandon_all)) drops every waiting
/// sender, which wakes each waiter with a receive error.
pub struct PendingCalls<T> {
    next_id: AtomicU64,
    waiting: Mutex<HashMap<String, oneshot::Sender<T>>>,
}

impl<T> PendingCalls<T> {
    /// An empty table.
    pub fn new() -> Self {
        Self {
            next_id: AtomicU64::new(1),
            waiting: Mutex::new(HashMap::new()),
        }
    }

    /// Register a new call and return its id with the receiver for its reply.
    pub fn register(&self, prefix: &str) -> (String, oneshot::Receiver<T>) {
        let n = self.next_id.fetch_add(1, Ordering::Relaxed);
        let id = format!("{prefix}-{n}");
        let (tx, rx) = oneshot::channel();
        self.lock().insert(id.clone(), tx);
        (id, rx)
    }

    /// Deliver a reply. Returns `false` if no call with this id is waiting.
    pub fn resolve(&self, id: &str, value: T) -> bool {
        let Some(tx) = self.lock().remove(id) else {
            return false;
        };
        // The waiter may have given up; that still consumes the entry.
        let _ = tx.send(value);
        true
    }

    /// Forget one call without replying (the caller stopped waiting).
    pub fn forget(&self, id: &str) {
        self.lock().remove(id);
    }

    /// Number of calls still waiting.
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    /// Whether no call is waiting.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop every waiting call. Returns how many were abandoned.
    pub fn abandon_all(&self) -> usize {
        let mut waiting = self.lock();
        let n = waiting.len();
        waiting.clear();
        n
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, oneshot::Sender<T>>> {
        // A panic while holding this lock cannot leave the map inconsistent.
        self.waiting
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

impl<T> Default for PendingCalls<T> {
    fn default() -> Self {
        Self::new()
    }
}
