//! Shared doubles for the end-to-end tests: a scriptable remote ledger, a
//! scriptable commerce store, and a delivery-counting listener.

#![allow(dead_code)] // Each test target uses a subset of these helpers.

use std::collections::HashMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use chrono::{TimeZone, Utc};
use entsync_core::backend::{
    BackendFailure, LedgerBackend, PostReceiptRequest, PostReceiptResponse, ResponseMetadata,
};
use entsync_core::purchase::{CommerceStoreClient, PurchaseRecord, PurchaseState, StoreKind};
use entsync_core::snapshot::{EntitlementRecord, EntitlementSnapshot};
use entsync_core::{SnapshotListener, SyncError};
use secrecy::SecretString;
use std::sync::Arc;

/// Fixed reference instant for test data.
pub fn base_time() -> chrono::DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap()
}

/// Snapshot granting exactly one active entitlement named after `product`.
pub fn granting(product: &str) -> EntitlementSnapshot {
    let mut snapshot = EntitlementSnapshot::empty(base_time());
    snapshot.entitlements.insert(
        product.to_string(),
        EntitlementRecord {
            is_active: true,
            expires_at: None,
            purchased_at: Some(base_time()),
            product_id: product.to_string(),
        },
    );
    snapshot
}

/// A finalized purchase record for one product.
pub fn finalized(token: &str, product: &str) -> PurchaseRecord {
    PurchaseRecord::new(
        SecretString::from(token.to_string()),
        vec![product.to_string()],
        base_time(),
        PurchaseState::Finalized,
    )
}

/// A payment-pending purchase record for one product.
pub fn pending(token: &str, product: &str) -> PurchaseRecord {
    PurchaseRecord::new(
        SecretString::from(token.to_string()),
        vec![product.to_string()],
        base_time(),
        PurchaseState::Pending,
    )
}

// =============================================================================
// ScriptedBackend
// =============================================================================

/// Remote ledger double. Fetches return a snapshot granting `"fetched"`;
/// posts succeed per product unless a failure is scripted. Both call kinds
/// are counted, and fetches can be slowed down to keep them observably
/// in flight.
pub struct ScriptedBackend {
    fetches: AtomicUsize,
    posts: AtomicUsize,
    fetch_delay: Mutex<Duration>,
    post_failures: Mutex<HashMap<String, BackendFailure>>,
}

impl ScriptedBackend {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            fetches: AtomicUsize::new(0),
            posts: AtomicUsize::new(0),
            fetch_delay: Mutex::new(Duration::ZERO),
            post_failures: Mutex::new(HashMap::new()),
        })
    }

    pub fn set_fetch_delay(&self, delay: Duration) {
        *self.fetch_delay.lock().expect("delay lock") = delay;
    }

    pub fn fail_product(&self, product: &str, failure: BackendFailure) {
        self.post_failures
            .lock()
            .expect("failures lock")
            .insert(product.to_string(), failure);
    }

    pub fn heal_product(&self, product: &str) {
        self.post_failures
            .lock()
            .expect("failures lock")
            .remove(product);
    }

    pub fn fetch_count(&self) -> usize {
        self.fetches.load(Ordering::SeqCst)
    }

    pub fn post_count(&self) -> usize {
        self.posts.load(Ordering::SeqCst)
    }
}

#[async_trait::async_trait]
impl LedgerBackend for ScriptedBackend {
    async fn fetch_snapshot(&self, _user_id: &str) -> Result<EntitlementSnapshot, SyncError> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        let delay = *self.fetch_delay.lock().expect("delay lock");
        if delay > Duration::ZERO {
            tokio::time::sleep(delay).await;
        }
        Ok(granting("fetched"))
    }

    async fn post_receipt(
        &self,
        request: PostReceiptRequest,
    ) -> Result<PostReceiptResponse, BackendFailure> {
        self.posts.fetch_add(1, Ordering::SeqCst);
        if let Some(failure) = self
            .post_failures
            .lock()
            .expect("failures lock")
            .get(&request.product_id)
        {
            return Err(failure.clone());
        }
        Ok(PostReceiptResponse {
            snapshot: granting(&request.product_id),
            metadata: ResponseMetadata {
                request_id: Some(format!("req-{}", request.product_id)),
            },
        })
    }
}

// =============================================================================
// ScriptedCommerce
// =============================================================================

/// Commerce-store double whose observed purchases can be replaced between
/// sync passes.
pub struct ScriptedCommerce {
    records: Mutex<Vec<PurchaseRecord>>,
}

impl ScriptedCommerce {
    pub fn new(records: Vec<PurchaseRecord>) -> Arc<Self> {
        Arc::new(Self {
            records: Mutex::new(records),
        })
    }

    pub fn set_records(&self, records: Vec<PurchaseRecord>) {
        *self.records.lock().expect("records lock") = records;
    }
}

#[async_trait::async_trait]
impl CommerceStoreClient for ScriptedCommerce {
    fn store_kind(&self) -> StoreKind {
        StoreKind::GooglePlay
    }

    async fn query_purchases(&self) -> Result<Vec<PurchaseRecord>, SyncError> {
        Ok(self.records.lock().expect("records lock").clone())
    }
}

// =============================================================================
// CountingListener
// =============================================================================

/// Listener recording every delivered snapshot.
pub struct CountingListener {
    delivered: Mutex<Vec<EntitlementSnapshot>>,
}

impl CountingListener {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            delivered: Mutex::new(Vec::new()),
        })
    }

    pub fn count(&self) -> usize {
        self.delivered.lock().expect("delivered lock").len()
    }

    pub fn last(&self) -> Option<EntitlementSnapshot> {
        self.delivered.lock().expect("delivered lock").last().cloned()
    }
}

impl SnapshotListener for CountingListener {
    fn snapshot_changed(&self, snapshot: EntitlementSnapshot) {
        self.delivered.lock().expect("delivered lock").push(snapshot);
    }
}
