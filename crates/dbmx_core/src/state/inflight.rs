//! Deduplication of in-flight loads by key.
//!
//! The first caller for a key starts the operation; later callers attach to
//! the same shared future and observe the same terminal result. Entries hold
//! only weak handles, so an operation every caller has dropped is dropped
//! too and its key is free again.

use std::collections::HashMap;
use std::hash::Hash;
use std::sync::atomic::{AtomicU64, Ordering};

use futures_util::future::{BoxFuture, FutureExt, Shared, WeakShared};
use parking_lot::Mutex;

use crate::error::DbmxResult;

/// Boxed operation producing a cloneable result.
pub type OpFuture<T> = BoxFuture<'static, DbmxResult<T>>;

/// Handle to an operation that may have other callers attached.
pub type SharedOp<T> = Shared<OpFuture<T>>;

/// Identifies one started operation, so a finished operation cannot evict
/// a newer one on the same key.
pub type Ticket = u64;

struct Entry<T> {
    ticket: Ticket,
    op: WeakShared<OpFuture<T>>,
}

/// In-flight operations keyed by `K`.
pub struct InFlight<K, T> {
    entries: Mutex<HashMap<K, Entry<T>>>,
    next_ticket: AtomicU64,
}

impl<K, T> Default for InFlight<K, T> {
    fn default() -> Self {
        Self { entries: Mutex::new(HashMap::new()), next_ticket: AtomicU64::new(1) }
    }
}

impl<K, T> InFlight<K, T>
where
    K: Eq + Hash,
    T: Clone + Send + Sync + 'static,
{
    /// Create an empty set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach to the live operation on `key`, or start one with `start`.
    ///
    /// `start` runs while the set is locked, so two racing callers cannot
    /// both start. It may refuse by returning an error, in which case
    /// nothing is registered.
    pub fn join_or_start<F>(&self, key: K, start: F) -> DbmxResult<SharedOp<T>>
    where
        F: FnOnce(Ticket) -> DbmxResult<OpFuture<T>>,
    {
        let mut entries = self.entries.lock();
        if let Some(op) = entries.get(&key).and_then(|entry| entry.op.upgrade()) {
            return Ok(op);
        }

        let ticket = self.next_ticket.fetch_add(1, Ordering::Relaxed);
        let op = start(ticket)?.shared();
        if let Some(weak) = op.downgrade() {
            entries.insert(key, Entry { ticket, op: weak });
        }
        Ok(op)
    }

    /// Forget the operation `ticket` on `key`, if it is still registered.
    pub fn finish(&self, key: &K, ticket: Ticket) {
        let mut entries = self.entries.lock();
        if entries.get(key).is_some_and(|entry| entry.ticket == ticket) {
            entries.remove(key);
        }
    }

    /// Check if an operation on `key` is registered.
    pub fn contains(&self, key: &K) -> bool {
        self.entries.lock().contains_key(key)
    }

    /// Number of registered operations.
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    /// Check if nothing is in flight.
    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::DbmxError;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Arc;
    use tokio::sync::oneshot;

    #[tokio::test]
    async fn test_second_caller_joins_first() {
        let set: Arc<InFlight<&'static str, u32>> = Arc::new(InFlight::new());
        let starts = Arc::new(AtomicUsize::new(0));
        let (tx, rx) = oneshot::channel::<u32>();

        let first = {
            let set_ref = set.clone();
            let starts = starts.clone();
            set.join_or_start("k", move |ticket| {
                starts.fetch_add(1, Ordering::SeqCst);
                Ok(async move {
                    let value = rx.await.map_err(|_| DbmxError::internal("gate dropped"))?;
                    set_ref.finish(&"k", ticket);
                    Ok(value)
                }
                .boxed())
            })
            .unwrap()
        };
        let second = set
            .join_or_start("k", |_| panic!("second caller must not start"))
            .unwrap();

        tx.send(42).unwrap();
        let (a, b) = tokio::join!(first, second);
        assert_eq!(a.unwrap(), 42);
        assert_eq!(b.unwrap(), 42);
        assert_eq!(starts.load(Ordering::SeqCst), 1);
        assert!(set.is_empty());
    }

    #[tokio::test]
    async fn test_refused_start_registers_nothing() {
        let set: InFlight<u8, ()> = InFlight::new();
        let result = set.join_or_start(1, |_| Err(DbmxError::not_connected("x")));
        assert!(result.is_err());
        assert!(!set.contains(&1));
    }

    #[tokio::test]
    async fn test_dropped_operation_frees_key() {
        let set: InFlight<u8, u8> = InFlight::new();
        let op = set
            .join_or_start(1, |_| Ok(futures_util::future::pending().boxed()))
            .unwrap();
        assert!(set.contains(&1));
        drop(op);

        let again = set.join_or_start(1, |_| Ok(async { Ok(7) }.boxed())).unwrap();
        assert_eq!(again.await.unwrap(), 7);
    }

    #[test]
    fn test_finish_ignores_stale_ticket() {
        let set: InFlight<u8, u8> = InFlight::new();
        let _op = set.join_or_start(1, |_| Ok(futures_util::future::pending().boxed())).unwrap();
        set.finish(&1, 999);
        assert!(set.contains(&1));
    }
}
