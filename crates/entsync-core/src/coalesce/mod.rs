//! Request coalescing: at most one in-flight remote call per logical
//! resource, with the result fanned out to every waiter.
//!
//! Concurrent callers asking for the same [`CacheKey`] are merged into one
//! underlying operation. The first caller creates the pending group and
//! launches the operation on the runtime; later callers append themselves
//! as waiters and never invoke the operation. When the operation completes
//! the group is removed atomically and each waiter receives a clone of the
//! result in registration order, so a request arriving after completion
//! starts a fresh in-flight call.
//!
//! # Thread Safety
//!
//! The group map sits behind a single async mutex, making
//! "group absent → create and launch" one atomic step under arbitrary
//! concurrent callers. Completion delivery happens on a spawned task, never
//! on a caller's stack, so no caller blocks another.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;

use tokio::sync::{Mutex, oneshot};
use tracing::{debug, trace};

use crate::error::SyncError;
use crate::ledger::PurchaseFingerprint;

// =============================================================================
// CacheKey
// =============================================================================

/// Opaque key identifying one logical remote request.
///
/// Derived from the request's parameters so that semantically identical
/// requests collide and coalesce, while distinct requests never share an
/// in-flight call.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey(String);

impl CacheKey {
    /// Key for a snapshot fetch scoped to one user identity.
    #[must_use]
    pub fn snapshot_fetch(user_id: &str) -> Self {
        Self(format!("snapshot/{user_id}"))
    }

    /// Key for posting one purchase record: same token + product + user +
    /// restore flag always lands on the same in-flight post.
    #[must_use]
    pub fn receipt_post(
        fingerprint: &PurchaseFingerprint,
        product_id: &str,
        user_id: &str,
        is_restore: bool,
    ) -> Self {
        Self(format!(
            "receipt/{}/{product_id}/{user_id}/{is_restore}",
            fingerprint.as_str()
        ))
    }

    /// The raw key text.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

// =============================================================================
// RequestCoalescer
// =============================================================================

/// Marker for an in-flight operation torn down without delivering a result.
/// Error types used with the coalescer convert it into their own aborted
/// variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Aborted;

impl From<Aborted> for SyncError {
    fn from(_: Aborted) -> Self {
        Self::Aborted
    }
}

/// Waiters registered for one key while its operation is in flight.
struct PendingRequestGroup<T, E> {
    waiters: Vec<oneshot::Sender<Result<T, E>>>,
}

/// Deduplicates concurrent logical fetches keyed by [`CacheKey`].
pub struct RequestCoalescer<T, E = SyncError> {
    groups: Mutex<HashMap<CacheKey, PendingRequestGroup<T, E>>>,
}

impl<T, E> Default for RequestCoalescer<T, E> {
    fn default() -> Self {
        Self {
            groups: Mutex::new(HashMap::new()),
        }
    }
}

impl<T, E> RequestCoalescer<T, E>
where
    T: Clone + Send + 'static,
    E: Clone + Send + From<Aborted> + 'static,
{
    /// Creates an empty coalescer.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of keys with an operation currently in flight.
    pub async fn in_flight(&self) -> usize {
        self.groups.lock().await.len()
    }

    /// Runs `operation` for `key`, or joins the in-flight call for that key.
    ///
    /// Exactly one invocation of `operation` is outstanding per key at any
    /// time; every caller awaiting the same key receives a clone of the same
    /// result. The operation's error propagates verbatim to all waiters —
    /// there is no partial delivery.
    pub async fn run<F>(self: &Arc<Self>, key: CacheKey, operation: F) -> Result<T, E>
    where
        F: Future<Output = Result<T, E>> + Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        let launch = {
            let mut groups = self.groups.lock().await;
            match groups.get_mut(&key) {
                Some(group) => {
                    group.waiters.push(tx);
                    trace!(key = %key, waiters = group.waiters.len(), "joined in-flight request");
                    false
                }
                None => {
                    groups.insert(
                        key.clone(),
                        PendingRequestGroup { waiters: vec![tx] },
                    );
                    true
                }
            }
        };

        if launch {
            let coalescer = Arc::clone(self);
            let task_key = key.clone();
            tokio::spawn(async move {
                let result = operation.await;
                coalescer.complete(&task_key, result).await;
            });
        }

        // A dropped sender means the runtime tore the operation down before
        // completion; surface that as the error type's aborted variant.
        rx.await.unwrap_or_else(|_| Err(E::from(Aborted)))
    }

    /// Removes the group for `key` and delivers `result` to every waiter in
    /// registration order.
    async fn complete(&self, key: &CacheKey, result: Result<T, E>) {
        let waiters = {
            let mut groups = self.groups.lock().await;
            groups
                .remove(key)
                .map(|group| group.waiters)
                .unwrap_or_default()
        };
        debug!(
            key = %key,
            waiters = waiters.len(),
            ok = result.is_ok(),
            "coalesced operation completed"
        );
        for waiter in waiters {
            // A waiter that stopped listening is not an error for the rest.
            let _ = waiter.send(result.clone());
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    fn key() -> CacheKey {
        CacheKey::snapshot_fetch("u1")
    }

    #[tokio::test]
    async fn single_caller_gets_operation_result() {
        let coalescer: Arc<RequestCoalescer<u32>> = Arc::new(RequestCoalescer::new());
        let result = coalescer.run(key(), async { Ok(7) }).await;
        assert_eq!(result, Ok(7));
        assert_eq!(coalescer.in_flight().await, 0);
    }

    #[tokio::test]
    async fn concurrent_callers_share_one_invocation() {
        let coalescer: Arc<RequestCoalescer<u32>> = Arc::new(RequestCoalescer::new());
        let invocations = Arc::new(AtomicUsize::new(0));
        let (release_tx, release_rx) = oneshot::channel::<()>();

        // First caller launches an operation that blocks until released, so
        // the rest observably join while it is in flight.
        let first = {
            let coalescer = Arc::clone(&coalescer);
            let invocations = Arc::clone(&invocations);
            tokio::spawn(async move {
                coalescer
                    .run(key(), async move {
                        invocations.fetch_add(1, Ordering::SeqCst);
                        let _ = release_rx.await;
                        Ok(42)
                    })
                    .await
            })
        };

        // Wait for the group to exist before piling on.
        while coalescer.in_flight().await == 0 {
            tokio::task::yield_now().await;
        }

        let mut joiners = Vec::new();
        for _ in 0..9 {
            let coalescer = Arc::clone(&coalescer);
            let invocations = Arc::clone(&invocations);
            joiners.push(tokio::spawn(async move {
                coalescer
                    .run(key(), async move {
                        invocations.fetch_add(1, Ordering::SeqCst);
                        Ok(0)
                    })
                    .await
            }));
        }

        // Let every joiner register, then release the operation.
        tokio::task::yield_now().await;
        release_tx.send(()).expect("operation still waiting");

        assert_eq!(first.await.expect("join"), Ok(42));
        for joiner in joiners {
            assert_eq!(joiner.await.expect("join"), Ok(42));
        }
        assert_eq!(invocations.load(Ordering::SeqCst), 1);
        assert_eq!(coalescer.in_flight().await, 0);
    }

    #[tokio::test]
    async fn distinct_keys_run_independent_operations() {
        let coalescer: Arc<RequestCoalescer<&'static str>> = Arc::new(RequestCoalescer::new());
        let a = coalescer.run(CacheKey::snapshot_fetch("a"), async { Ok("a") });
        let b = coalescer.run(CacheKey::snapshot_fetch("b"), async { Ok("b") });
        let (a, b) = tokio::join!(a, b);
        assert_eq!(a, Ok("a"));
        assert_eq!(b, Ok("b"));
    }

    #[tokio::test]
    async fn errors_propagate_to_every_waiter() {
        let coalescer: Arc<RequestCoalescer<u32>> = Arc::new(RequestCoalescer::new());
        let (release_tx, release_rx) = oneshot::channel::<()>();

        let first = {
            let coalescer = Arc::clone(&coalescer);
            tokio::spawn(async move {
                coalescer
                    .run(key(), async move {
                        let _ = release_rx.await;
                        Err(SyncError::network("socket reset"))
                    })
                    .await
            })
        };
        while coalescer.in_flight().await == 0 {
            tokio::task::yield_now().await;
        }
        let second = {
            let coalescer = Arc::clone(&coalescer);
            tokio::spawn(async move { coalescer.run(key(), async { Ok(1) }).await })
        };
        tokio::task::yield_now().await;
        release_tx.send(()).expect("operation still waiting");

        let expected = Err(SyncError::network("socket reset"));
        assert_eq!(first.await.expect("join"), expected);
        assert_eq!(second.await.expect("join"), expected);
    }

    #[tokio::test]
    async fn completed_key_starts_fresh_call() {
        let coalescer: Arc<RequestCoalescer<u32>> = Arc::new(RequestCoalescer::new());
        let invocations = Arc::new(AtomicUsize::new(0));

        for round in 0..2 {
            let invocations = Arc::clone(&invocations);
            let result = coalescer
                .run(key(), async move {
                    invocations.fetch_add(1, Ordering::SeqCst);
                    Ok(round)
                })
                .await;
            assert_eq!(result, Ok(round));
        }
        assert_eq!(invocations.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn receipt_keys_separate_restore_flag_and_user() {
        let fp = PurchaseFingerprint::from_hex("aa11");
        let base = CacheKey::receipt_post(&fp, "monthly", "u1", false);
        assert_eq!(base, CacheKey::receipt_post(&fp, "monthly", "u1", false));
        assert_ne!(base, CacheKey::receipt_post(&fp, "monthly", "u1", true));
        assert_ne!(base, CacheKey::receipt_post(&fp, "monthly", "u2", false));
        assert_ne!(base, CacheKey::receipt_post(&fp, "annual", "u1", false));
    }
}
