//! Typed snapshot cache over the injected key/value store.
//!
//! One cache entry per user identity: the serialized snapshot under one key
//! and its fetch timestamp under a sibling key. The timestamp doubles as
//! the freshness clock consulted by the policy engine.
//!
//! The clock is set to *now* when a fetch starts, not when it completes, so
//! a slow in-flight fetch is not perceived as missing and re-triggered by a
//! concurrent caller. A failed fetch clears the clock entirely, making the
//! next eligible call retry instead of waiting out a freshness window that
//! never produced data.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{debug, warn};

use crate::policy::StalenessRule;
use crate::snapshot::{EntitlementSnapshot, SNAPSHOT_SCHEMA_VERSION};
use crate::store::KeyValueStore;

/// Typed read/write of the entitlement snapshot and its staleness clock.
pub struct EntitlementSnapshotStore {
    store: Arc<dyn KeyValueStore>,
    namespace: String,
}

impl EntitlementSnapshotStore {
    /// Creates a snapshot store namespaced under the given prefix.
    #[must_use]
    pub fn new(store: Arc<dyn KeyValueStore>, namespace: impl Into<String>) -> Self {
        Self {
            store,
            namespace: namespace.into(),
        }
    }

    fn snapshot_key(&self, user_id: &str) -> String {
        format!("{}.snapshot.{user_id}", self.namespace)
    }

    fn clock_key(&self, user_id: &str) -> String {
        format!("{}.snapshot_fetched_at.{user_id}", self.namespace)
    }

    /// Reads the cached snapshot for a user.
    ///
    /// Undecodable payloads and schema-version mismatches are cache misses,
    /// never errors. Returned snapshots carry `loaded_from_cache = true`.
    pub fn get(&self, user_id: &str) -> Option<EntitlementSnapshot> {
        let payload = self.store.get_string(&self.snapshot_key(user_id))?;
        let snapshot: EntitlementSnapshot = match serde_json::from_str(&payload) {
            Ok(snapshot) => snapshot,
            Err(err) => {
                warn!(user_id, error = %err, "discarding undecodable cached snapshot");
                return None;
            }
        };
        if snapshot.schema_version != SNAPSHOT_SCHEMA_VERSION {
            debug!(
                user_id,
                cached_version = snapshot.schema_version,
                current_version = SNAPSHOT_SCHEMA_VERSION,
                "cached snapshot schema mismatch, treating as miss"
            );
            return None;
        }
        Some(snapshot.flagged_from_cache())
    }

    /// Caches a snapshot and resets the freshness clock to `now`.
    pub fn put(&self, user_id: &str, snapshot: &EntitlementSnapshot, now: DateTime<Utc>) {
        match serde_json::to_string(snapshot) {
            Ok(payload) => {
                self.store.put_string(&self.snapshot_key(user_id), &payload);
                self.store
                    .put_string(&self.clock_key(user_id), &now.to_rfc3339());
                debug!(
                    user_id,
                    entitlements = snapshot.entitlements.len(),
                    "cached entitlement snapshot"
                );
            }
            Err(err) => {
                // Serialization of an in-memory snapshot cannot normally
                // fail; log and keep the previous cache entry.
                warn!(user_id, error = %err, "failed to serialize snapshot for caching");
            }
        }
    }

    /// When the cached snapshot for this user was fetched, if known.
    pub fn fetched_at(&self, user_id: &str) -> Option<DateTime<Utc>> {
        let raw = self.store.get_string(&self.clock_key(user_id))?;
        match DateTime::parse_from_rfc3339(&raw) {
            Ok(ts) => Some(ts.with_timezone(&Utc)),
            Err(err) => {
                warn!(user_id, error = %err, "discarding undecodable fetch clock");
                None
            }
        }
    }

    /// Sets the freshness clock to `now` before a network call completes,
    /// so concurrent callers do not re-trigger the in-flight fetch.
    pub fn mark_fetch_started(&self, user_id: &str, now: DateTime<Utc>) {
        self.store
            .put_string(&self.clock_key(user_id), &now.to_rfc3339());
    }

    /// Clears the freshness clock after a failed fetch so the next eligible
    /// call retries immediately.
    pub fn clear_fetch_clock(&self, user_id: &str) {
        self.store.remove(&self.clock_key(user_id));
    }

    /// Drops the cache entry for a user (sign-out / identity switch).
    pub fn invalidate(&self, user_id: &str) {
        self.store.remove(&self.snapshot_key(user_id));
        self.store.remove(&self.clock_key(user_id));
        debug!(user_id, "invalidated cached snapshot");
    }

    /// Whether the cached entry is stale under the given rule. A missing
    /// fetch clock always counts as stale.
    pub fn is_stale(
        &self,
        user_id: &str,
        rule: &StalenessRule,
        is_app_backgrounded: bool,
        now: DateTime<Utc>,
    ) -> bool {
        self.fetched_at(user_id)
            .is_none_or(|fetched_at| rule.is_stale(now - fetched_at, is_app_backgrounded))
    }
}
