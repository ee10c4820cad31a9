//! Idempotent purchase-receipt synchronization.
//!
//! [`ReceiptSyncPipeline`] reconciles locally-observed purchases with the
//! remote ledger: it filters out records whose fingerprints are already in
//! the [`PurchaseFingerprintLedger`], posts the remainder through the
//! request coalescer (so duplicate concurrent syncs of the same record
//! share one call), and folds per-record outcomes into a single aggregate
//! result for the batch.
//!
//! # Failure model
//!
//! Each record resolves independently:
//!
//! - success → fingerprint recorded, returned snapshot cached, listener
//!   notified;
//! - should-be-consumed → fingerprint recorded (no retry would ever
//!   succeed), error reported;
//! - backend outage → an offline snapshot computed from locally-known
//!   active purchases stands in as the record's effective result, and the
//!   fingerprint is *not* recorded so a later pass retries;
//! - transient → error reported, retried only by the next externally
//!   triggered pass;
//! - payment pending → never posted, always reported as payment-pending.
//!
//! The batch succeeds only when every record succeeded. Otherwise the
//! first error in record-processing order is surfaced as the batch error
//! while successful records keep their side effects — each record's ledger
//! entry is independently idempotent, so partial application is safe and a
//! retried batch simply skips the records that already landed.

use std::collections::BTreeSet;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};

use crate::backend::{
    BackendFailure, ErrorBehavior, LedgerBackend, PostReceiptRequest, PostReceiptResponse,
};
use crate::coalesce::{CacheKey, RequestCoalescer};
use crate::error::SyncError;
use crate::ledger::{PurchaseFingerprint, PurchaseFingerprintLedger};
use crate::notify::ListenerNotifier;
use crate::offline::OfflineSnapshotCalculator;
use crate::purchase::PurchaseRecord;
use crate::snapshot::EntitlementSnapshot;
use crate::store::EntitlementSnapshotStore;

// =============================================================================
// Outcomes
// =============================================================================

/// Terminal result for one record in a batch.
#[derive(Debug, Clone)]
pub struct RecordOutcome {
    /// Fingerprint of the record's token.
    pub fingerprint: PurchaseFingerprint,
    /// Product the record was reported for.
    pub product_id: String,
    /// The record's effective result: a snapshot (remote or offline) or a
    /// typed error.
    pub result: Result<EntitlementSnapshot, SyncError>,
}

/// Aggregate outcome of one sync pass.
#[derive(Debug, Clone)]
pub struct SyncReport {
    /// Per-record outcomes in processing order.
    pub records: Vec<RecordOutcome>,
    /// Batch outcome: the final snapshot when every record succeeded,
    /// otherwise the first per-record error. Successful records keep their
    /// cache and ledger side effects either way.
    pub aggregate: Result<EntitlementSnapshot, SyncError>,
}

// =============================================================================
// ReceiptSyncPipeline
// =============================================================================

/// Orchestrates posting purchase batches to the remote ledger.
pub struct ReceiptSyncPipeline {
    backend: Arc<dyn LedgerBackend>,
    ledger: Arc<PurchaseFingerprintLedger>,
    snapshots: Arc<EntitlementSnapshotStore>,
    offline: Arc<dyn OfflineSnapshotCalculator>,
    notifier: Arc<ListenerNotifier>,
    fetch_coalescer: Arc<RequestCoalescer<EntitlementSnapshot, SyncError>>,
    post_coalescer: Arc<RequestCoalescer<PostReceiptResponse, BackendFailure>>,
}

impl ReceiptSyncPipeline {
    /// Wires a pipeline from its collaborators.
    #[must_use]
    pub fn new(
        backend: Arc<dyn LedgerBackend>,
        ledger: Arc<PurchaseFingerprintLedger>,
        snapshots: Arc<EntitlementSnapshotStore>,
        offline: Arc<dyn OfflineSnapshotCalculator>,
        notifier: Arc<ListenerNotifier>,
        fetch_coalescer: Arc<RequestCoalescer<EntitlementSnapshot, SyncError>>,
    ) -> Self {
        Self {
            backend,
            ledger,
            snapshots,
            offline,
            notifier,
            fetch_coalescer,
            post_coalescer: Arc::new(RequestCoalescer::new()),
        }
    }

    /// Full reconciliation pass: prunes the fingerprint ledger down to the
    /// fingerprints of currently-active purchases, then syncs whatever is
    /// not yet reported.
    pub async fn reconcile(
        &self,
        user_id: &str,
        records: Vec<PurchaseRecord>,
        is_restore: bool,
        now: DateTime<Utc>,
    ) -> SyncReport {
        let active: BTreeSet<PurchaseFingerprint> = records
            .iter()
            .map(|record| record.fingerprint().clone())
            .collect();
        self.ledger.reconcile(&active);
        self.sync_records(user_id, records, is_restore, now).await
    }

    /// Syncs a batch of observed purchase records.
    pub async fn sync_records(
        &self,
        user_id: &str,
        records: Vec<PurchaseRecord>,
        is_restore: bool,
        now: DateTime<Utc>,
    ) -> SyncReport {
        let unsynced = self.ledger.unsynced_of(&records);
        if unsynced.is_empty() {
            debug!(
                user_id,
                observed = records.len(),
                "all observed purchases already reported"
            );
            return SyncReport {
                records: Vec::new(),
                aggregate: self.current_snapshot(user_id, now).await,
            };
        }

        info!(
            user_id,
            unsynced = unsynced.len(),
            observed = records.len(),
            is_restore,
            "syncing unreported purchases"
        );

        let mut outcomes = Vec::with_capacity(unsynced.len());
        for record in &unsynced {
            let outcome = self
                .sync_one(user_id, record, &records, is_restore, now)
                .await;
            outcomes.push(outcome);
        }

        let aggregate = Self::aggregate(user_id, &outcomes);
        SyncReport {
            records: outcomes,
            aggregate,
        }
    }

    /// Resolves one record to its terminal outcome, applying side effects.
    async fn sync_one(
        &self,
        user_id: &str,
        record: &PurchaseRecord,
        all_records: &[PurchaseRecord],
        is_restore: bool,
        now: DateTime<Utc>,
    ) -> RecordOutcome {
        let fingerprint = record.fingerprint().clone();
        let product_id = record.primary_product_id().to_string();

        // Pending purchases are never posted: the platform has not
        // finalized payment yet.
        if record.is_pending() {
            debug!(user_id, %fingerprint, product_id, "skipping payment-pending purchase");
            return RecordOutcome {
                fingerprint,
                product_id: product_id.clone(),
                result: Err(SyncError::PaymentPending { product_id }),
            };
        }

        let key = CacheKey::receipt_post(&fingerprint, &product_id, user_id, is_restore);
        let request = PostReceiptRequest {
            user_id: user_id.to_string(),
            token: record.token().clone(),
            product_id: product_id.clone(),
            is_restore,
            offer_context: record.offer_context().cloned(),
            attributes: std::collections::BTreeMap::new(),
        };
        let backend = Arc::clone(&self.backend);
        let posted = self
            .post_coalescer
            .run(key, async move { backend.post_receipt(request).await })
            .await;

        let result = match posted {
            Ok(response) => {
                self.ledger.add(&fingerprint);
                self.snapshots.put(user_id, &response.snapshot, now);
                self.notifier.notify(response.snapshot.clone());
                debug!(user_id, %fingerprint, product_id, "purchase reported");
                Ok(response.snapshot)
            }
            Err(failure) => self.resolve_failure(
                user_id,
                &fingerprint,
                &product_id,
                all_records,
                failure,
                now,
            ),
        };

        RecordOutcome {
            fingerprint,
            product_id,
            result,
        }
    }

    /// Applies the backend-directed handling behavior to a failed post.
    fn resolve_failure(
        &self,
        user_id: &str,
        fingerprint: &PurchaseFingerprint,
        product_id: &str,
        all_records: &[PurchaseRecord],
        failure: BackendFailure,
        now: DateTime<Utc>,
    ) -> Result<EntitlementSnapshot, SyncError> {
        match failure.behavior {
            ErrorBehavior::ShouldBeConsumed => {
                // No retry would ever succeed; record the fingerprint so
                // later passes skip this purchase.
                warn!(
                    user_id, %fingerprint, product_id, error = %failure.error,
                    "purchase rejected terminally, marking as reported"
                );
                self.ledger.add(fingerprint);
                Err(failure.error)
            }
            ErrorBehavior::UseOfflineEntitlements if failure.error.is_server_class() => {
                warn!(
                    user_id, %fingerprint, product_id, error = %failure.error,
                    "remote ledger unreachable, substituting offline entitlements"
                );
                let finalized: Vec<PurchaseRecord> = all_records
                    .iter()
                    .filter(|record| !record.is_pending())
                    .cloned()
                    .collect();
                let snapshot = self.offline.compute(user_id, &finalized, now);
                // Not marked synced and not cached: the next pass against a
                // healthy backend must supply authoritative state.
                self.notifier.notify(snapshot.clone());
                Ok(snapshot)
            }
            ErrorBehavior::UseOfflineEntitlements | ErrorBehavior::RetryLater => {
                warn!(
                    user_id, %fingerprint, product_id, error = %failure.error,
                    "purchase report failed, leaving for a later sync pass"
                );
                Err(failure.error)
            }
        }
    }

    /// Aggregate rule: all success → last successful snapshot; otherwise
    /// the first error in processing order, with successful side effects
    /// left in place.
    fn aggregate(
        user_id: &str,
        outcomes: &[RecordOutcome],
    ) -> Result<EntitlementSnapshot, SyncError> {
        let mut last_snapshot = None;
        for outcome in outcomes {
            match &outcome.result {
                Ok(snapshot) => last_snapshot = Some(snapshot.clone()),
                Err(error) => {
                    warn!(
                        user_id,
                        fingerprint = %outcome.fingerprint,
                        product_id = %outcome.product_id,
                        %error,
                        "sync batch failed on record"
                    );
                    return Err(error.clone());
                }
            }
        }
        // An empty batch returns before aggregation, so a snapshot exists
        // whenever every outcome succeeded.
        last_snapshot.ok_or(SyncError::Aborted)
    }

    /// The cached snapshot, or a coalesced fetch when no cache exists.
    async fn current_snapshot(
        &self,
        user_id: &str,
        now: DateTime<Utc>,
    ) -> Result<EntitlementSnapshot, SyncError> {
        if let Some(snapshot) = self.snapshots.get(user_id) {
            return Ok(snapshot);
        }
        fetch_and_cache(
            &self.backend,
            &self.snapshots,
            &self.notifier,
            &self.fetch_coalescer,
            user_id,
            now,
        )
        .await
    }
}

/// Coalesced blocking fetch of a user's snapshot, with the shared side
/// effects: the fetch clock is set before the call so concurrent callers do
/// not re-trigger it, a success is cached and propagated to the listener,
/// and a failure clears the clock so the next eligible call retries.
pub(crate) async fn fetch_and_cache(
    backend: &Arc<dyn LedgerBackend>,
    snapshots: &Arc<EntitlementSnapshotStore>,
    notifier: &Arc<ListenerNotifier>,
    coalescer: &Arc<RequestCoalescer<EntitlementSnapshot, SyncError>>,
    user_id: &str,
    now: DateTime<Utc>,
) -> Result<EntitlementSnapshot, SyncError> {
    snapshots.mark_fetch_started(user_id, now);
    let task_backend = Arc::clone(backend);
    let owned_user = user_id.to_string();
    let fetched = coalescer
        .run(CacheKey::snapshot_fetch(user_id), async move {
            task_backend.fetch_snapshot(&owned_user).await
        })
        .await;
    match fetched {
        Ok(snapshot) => {
            snapshots.put(user_id, &snapshot, now);
            notifier.notify(snapshot.clone());
            Ok(snapshot)
        }
        Err(error) => {
            warn!(user_id, %error, "snapshot fetch failed, clearing freshness clock");
            snapshots.clear_fetch_clock(user_id);
            Err(error)
        }
    }
}
