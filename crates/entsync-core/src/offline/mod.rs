//! Offline entitlement computation.
//!
//! When the remote ledger is unreachable with a server-class failure, the
//! sync pipeline substitutes a snapshot computed locally from the purchases
//! the device already knows about. Offline snapshots are marked with
//! [`SnapshotOrigin::OfflineComputed`] and are never written to the cache
//! or the fingerprint ledger, so the next pass against a healthy backend
//! replaces them with authoritative state.

use chrono::{DateTime, Utc};
use tracing::debug;

use crate::purchase::{PurchaseRecord, PurchaseState};
use crate::snapshot::{EntitlementRecord, EntitlementSnapshot, ProductDates, SnapshotOrigin};

/// Pure computation of an entitlement snapshot from locally-known active
/// purchases, without contacting the remote ledger.
pub trait OfflineSnapshotCalculator: Send + Sync {
    /// Computes a snapshot for `user_id` from the given records.
    fn compute(
        &self,
        user_id: &str,
        active_records: &[PurchaseRecord],
        now: DateTime<Utc>,
    ) -> EntitlementSnapshot;
}

/// Default calculator: each finalized record grants one active entitlement
/// per product id, named after the product. No expiration is assumed; a
/// later authoritative snapshot supplies real dates.
#[derive(Debug, Clone, Copy, Default)]
pub struct ProductGrantCalculator;

impl OfflineSnapshotCalculator for ProductGrantCalculator {
    fn compute(
        &self,
        user_id: &str,
        active_records: &[PurchaseRecord],
        now: DateTime<Utc>,
    ) -> EntitlementSnapshot {
        let mut snapshot = EntitlementSnapshot::empty(now);
        snapshot.origin = SnapshotOrigin::OfflineComputed;

        for record in active_records {
            if record.state() != PurchaseState::Finalized {
                continue;
            }
            for product_id in record.product_ids() {
                snapshot.entitlements.insert(
                    product_id.clone(),
                    EntitlementRecord {
                        is_active: true,
                        expires_at: None,
                        purchased_at: Some(record.purchased_at()),
                        product_id: product_id.clone(),
                    },
                );
                snapshot.product_dates.insert(
                    product_id.clone(),
                    ProductDates {
                        expires_at: None,
                        purchased_at: Some(record.purchased_at()),
                    },
                );
            }
        }

        debug!(
            user_id,
            entitlements = snapshot.entitlements.len(),
            "computed offline entitlement snapshot"
        );
        snapshot
    }
}
