//! Per-key load status tracking.

use std::collections::HashMap;
use std::hash::Hash;

use crate::error::DbmxError;

/// Status of the most recent asynchronous operation on one key.
#[derive(Debug, Clone, Default)]
pub enum LoadStatus {
    /// Nothing has run, or the last run was abandoned
    #[default]
    Idle,
    /// An operation is in flight
    Pending,
    /// The last operation succeeded
    Succeeded,
    /// The last operation failed
    Failed(DbmxError),
}

impl LoadStatus {
    /// Check if an operation is in flight.
    pub fn is_pending(&self) -> bool {
        matches!(self, Self::Pending)
    }

    /// Get the error of the last failed operation.
    pub fn error(&self) -> Option<&DbmxError> {
        match self {
            Self::Failed(err) => Some(err),
            _ => None,
        }
    }
}

/// Load statuses keyed by connection or database.
///
/// A key with no entry is `Idle`.
#[derive(Debug)]
pub struct LoadTracker<K> {
    entries: HashMap<K, LoadStatus>,
}

impl<K> Default for LoadTracker<K> {
    fn default() -> Self {
        Self { entries: HashMap::new() }
    }
}

impl<K: Eq + Hash + Clone> LoadTracker<K> {
    /// Create an empty tracker.
    pub fn new() -> Self {
        Self::default()
    }

    /// Current status of `key`.
    pub fn status(&self, key: &K) -> LoadStatus {
        self.entries.get(key).cloned().unwrap_or_default()
    }

    /// Check if `key` has an operation in flight.
    pub fn is_pending(&self, key: &K) -> bool {
        self.entries.get(key).is_some_and(LoadStatus::is_pending)
    }

    /// Mark `key` pending. Returns false if it already was.
    pub fn begin(&mut self, key: &K) -> bool {
        if self.is_pending(key) {
            return false;
        }
        self.entries.insert(key.clone(), LoadStatus::Pending);
        true
    }

    /// Record success for `key`.
    pub fn succeed(&mut self, key: &K) {
        self.entries.insert(key.clone(), LoadStatus::Succeeded);
    }

    /// Record failure for `key`.
    pub fn fail(&mut self, key: &K, err: DbmxError) {
        self.entries.insert(key.clone(), LoadStatus::Failed(err));
    }

    /// Return `key` to idle if it is still pending.
    ///
    /// Used when every caller abandoned the operation.
    pub fn abandon(&mut self, key: &K) -> bool {
        if self.is_pending(key) {
            self.entries.remove(key);
            return true;
        }
        false
    }

    /// Return `key` to idle whatever its status.
    pub fn clear(&mut self, key: &K) {
        self.entries.remove(key);
    }

    /// Forget `key` unless an operation on it is in flight.
    pub fn forget(&mut self, key: &K) {
        if !self.is_pending(key) {
            self.entries.remove(key);
        }
    }

    /// Keys with an operation in flight.
    pub fn pending_keys(&self) -> Vec<K> {
        self.entries
            .iter()
            .filter(|(_, status)| status.is_pending())
            .map(|(key, _)| key.clone())
            .collect()
    }
}

/// Runs a cleanup closure on drop unless disarmed.
///
/// Guards a tracker entry across an `.await` so a dropped caller cannot leave
/// it pending.
pub struct PendingGuard<F: FnOnce()> {
    cleanup: Option<F>,
}

impl<F: FnOnce()> PendingGuard<F> {
    /// Arm a guard.
    pub fn new(cleanup: F) -> Self {
        Self { cleanup: Some(cleanup) }
    }

    /// The operation settled; skip the cleanup.
    pub fn disarm(mut self) {
        self.cleanup = None;
    }
}

impl<F: FnOnce()> Drop for PendingGuard<F> {
    fn drop(&mut self) {
        if let Some(cleanup) = self.cleanup.take() {
            cleanup();
        }
    }
}
