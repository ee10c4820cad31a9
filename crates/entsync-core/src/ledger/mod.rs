//! Purchase-fingerprint ledger: which purchase tokens have already been
//! durably reported to the remote ledger.
//!
//! Raw purchase tokens are never persisted. Each token is hashed to a
//! [`PurchaseFingerprint`] (SHA-256, hex) and the ledger stores only the
//! fingerprint set, bounding storage and keeping tokens out of the local
//! store. Entries are added only after a successful or
//! should-be-consumed terminal outcome, and a full reconciliation pass
//! prunes the set down to the fingerprints of purchases that are still
//! active.
//!
//! # Thread Safety
//!
//! Sync passes fire from several call sites at once (explicit sync,
//! app-foreground hook, post-purchase hook). Every read-modify-write of the
//! persisted set runs under one internal mutex.

use std::collections::BTreeSet;
use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};

use secrecy::{ExposeSecret, SecretString};
use sha2::{Digest, Sha256};
use tracing::{debug, trace};

use crate::purchase::PurchaseRecord;
use crate::store::KeyValueStore;

// =============================================================================
// PurchaseFingerprint
// =============================================================================

/// Collision-resistant hash of a purchase token, used as a ledger key in
/// place of the raw token.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PurchaseFingerprint(String);

impl PurchaseFingerprint {
    /// Hashes a raw purchase token. The token itself is never retained.
    #[must_use]
    pub fn of_token(token: &SecretString) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(token.expose_secret().as_bytes());
        Self(hex::encode(hasher.finalize()))
    }

    /// Wraps an already-computed hex digest.
    #[must_use]
    pub fn from_hex(digest: impl Into<String>) -> Self {
        Self(digest.into())
    }

    /// The lowercase hex digest.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PurchaseFingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

// =============================================================================
// PurchaseFingerprintLedger
// =============================================================================

/// Persisted set of fingerprints for tokens already reported, keyed by API
/// credential scope.
pub struct PurchaseFingerprintLedger {
    store: Arc<dyn KeyValueStore>,
    key: String,
    // Serializes read-modify-write cycles against the backing store.
    guard: Mutex<()>,
}

impl PurchaseFingerprintLedger {
    /// Creates a ledger persisted under the given namespace and credential
    /// scope.
    #[must_use]
    pub fn new(
        store: Arc<dyn KeyValueStore>,
        namespace: impl Into<String>,
        credential_scope: &str,
    ) -> Self {
        Self {
            store,
            key: format!("{}.synced_fingerprints.{credential_scope}", namespace.into()),
            guard: Mutex::new(()),
        }
    }

    fn load(&self) -> BTreeSet<String> {
        self.store.get_string_set(&self.key).unwrap_or_default()
    }

    /// Returns `true` if the fingerprint has already been reported.
    pub fn contains(&self, fingerprint: &PurchaseFingerprint) -> bool {
        let _guard = self.guard.lock().unwrap_or_else(PoisonError::into_inner);
        self.load().contains(fingerprint.as_str())
    }

    /// Records a fingerprint as durably reported.
    pub fn add(&self, fingerprint: &PurchaseFingerprint) {
        let _guard = self.guard.lock().unwrap_or_else(PoisonError::into_inner);
        let mut set = self.load();
        if set.insert(fingerprint.as_str().to_string()) {
            self.store.put_string_set(&self.key, &set);
            trace!(fingerprint = %fingerprint, "fingerprint added to ledger");
        }
    }

    /// Replaces the ledger with its intersection with `active`: fingerprints
    /// for purchases no longer active are purged, and nothing new is added.
    pub fn reconcile(&self, active: &BTreeSet<PurchaseFingerprint>) {
        let _guard = self.guard.lock().unwrap_or_else(PoisonError::into_inner);
        let current = self.load();
        let active: BTreeSet<&str> = active.iter().map(PurchaseFingerprint::as_str).collect();
        let before = current.len();
        let retained: BTreeSet<String> = current
            .into_iter()
            .filter(|fp| active.contains(fp.as_str()))
            .collect();
        if retained.len() != before {
            debug!(
                pruned = before - retained.len(),
                retained = retained.len(),
                "reconciled fingerprint ledger against active purchases"
            );
        }
        self.store.put_string_set(&self.key, &retained);
    }

    /// Filters `records` down to those whose fingerprint is not yet in the
    /// ledger, preserving order.
    pub fn unsynced_of(&self, records: &[PurchaseRecord]) -> Vec<PurchaseRecord> {
        let _guard = self.guard.lock().unwrap_or_else(PoisonError::into_inner);
        let set = self.load();
        records
            .iter()
            .filter(|record| !set.contains(record.fingerprint().as_str()))
            .cloned()
            .collect()
    }

    /// Number of fingerprints currently recorded.
    pub fn len(&self) -> usize {
        let _guard = self.guard.lock().unwrap_or_else(PoisonError::into_inner);
        self.load().len()
    }

    /// Returns `true` when no fingerprints are recorded.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
