//! Immutable entitlement snapshots.
//!
//! An [`EntitlementSnapshot`] is the complete picture of a user's
//! entitlements at a point in time. Snapshots are created by decoding a
//! remote ledger response or by the offline calculator, persisted by the
//! snapshot store, and superseded whenever a newer snapshot is cached; they
//! are never mutated in place.
//!
//! # Business equality
//!
//! Two snapshots that differ only in *when* they were produced describe the
//! same state. [`EntitlementSnapshot::same_state`] therefore ignores the
//! request timestamp and the provenance metadata (`origin`,
//! `loaded_from_cache`). The listener notifier uses this rule to suppress
//! redundant callbacks; plain `==` remains full structural equality.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Schema version written into every serialized snapshot.
///
/// Cached payloads carrying a different version are treated as cache
/// misses, not errors, so schema evolution never strands a device behind a
/// deserialization failure.
pub const SNAPSHOT_SCHEMA_VERSION: u32 = 3;

/// A single entitlement grant inside a snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntitlementRecord {
    /// Whether the entitlement currently unlocks access.
    pub is_active: bool,

    /// When the granting purchase expires, if it expires at all.
    pub expires_at: Option<DateTime<Utc>>,

    /// When the granting purchase was made.
    pub purchased_at: Option<DateTime<Utc>>,

    /// Product that granted this entitlement.
    pub product_id: String,
}

/// Purchase and expiration dates tracked per product.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProductDates {
    /// When the product's subscription expires, if known.
    pub expires_at: Option<DateTime<Utc>>,

    /// When the product was last purchased, if known.
    pub purchased_at: Option<DateTime<Utc>>,
}

/// Where a snapshot came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SnapshotOrigin {
    /// Decoded from a remote ledger response.
    Remote,
    /// Computed locally from known active purchases, without contacting the
    /// remote ledger.
    OfflineComputed,
}

/// The full state of a user's entitlements at a point in time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntitlementSnapshot {
    /// Entitlement identifier to grant record.
    pub entitlements: BTreeMap<String, EntitlementRecord>,

    /// Product id to its purchase/expiration dates.
    pub product_dates: BTreeMap<String, ProductDates>,

    /// When this snapshot was requested or computed.
    pub requested_at: DateTime<Utc>,

    /// Schema version of the serialized form.
    pub schema_version: u32,

    /// Opaque raw payload retained for forward compatibility. Unrecognized
    /// remote fields survive a cache round-trip through this value.
    pub raw: serde_json::Value,

    /// Provenance: remote response or offline computation.
    pub origin: SnapshotOrigin,

    /// Whether this instance was read back from the local cache.
    pub loaded_from_cache: bool,
}

impl EntitlementSnapshot {
    /// Creates an empty remote-origin snapshot.
    #[must_use]
    pub fn empty(requested_at: DateTime<Utc>) -> Self {
        Self {
            entitlements: BTreeMap::new(),
            product_dates: BTreeMap::new(),
            requested_at,
            schema_version: SNAPSHOT_SCHEMA_VERSION,
            raw: serde_json::Value::Null,
            origin: SnapshotOrigin::Remote,
            loaded_from_cache: false,
        }
    }

    /// Business-equality check: `true` when both snapshots describe the same
    /// entitlement state, ignoring the request timestamp and provenance
    /// metadata.
    #[must_use]
    pub fn same_state(&self, other: &Self) -> bool {
        self.entitlements == other.entitlements
            && self.product_dates == other.product_dates
            && self.schema_version == other.schema_version
    }

    /// Returns `true` if the named entitlement is present and active.
    #[must_use]
    pub fn is_entitled(&self, entitlement_id: &str) -> bool {
        self.entitlements
            .get(entitlement_id)
            .is_some_and(|record| record.is_active)
    }

    /// Identifiers of all currently active entitlements.
    #[must_use]
    pub fn active_entitlement_ids(&self) -> Vec<&str> {
        self.entitlements
            .iter()
            .filter(|(_, record)| record.is_active)
            .map(|(id, _)| id.as_str())
            .collect()
    }

    /// Returns a copy flagged as having been read from the local cache.
    #[must_use]
    pub fn flagged_from_cache(mut self) -> Self {
        self.loaded_from_cache = true;
        self
    }
}
