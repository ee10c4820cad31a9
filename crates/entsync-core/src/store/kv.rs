//! Key/value persistence boundary.
//!
//! The engine never touches the disk directly; the composing application
//! injects a [`KeyValueStore`] (platform preference storage, a settings
//! database, or the in-memory implementation in tests). Operations are
//! infallible by contract: the backing stores this abstracts over report
//! writes as fire-and-forget, and a read that cannot be decoded is simply a
//! miss.

use std::collections::{BTreeSet, HashMap};
use std::sync::{PoisonError, RwLock};

/// Injected string-keyed persistence used for snapshots, cache clocks, and
/// the fingerprint ledger. Key namespacing is the caller's responsibility.
pub trait KeyValueStore: Send + Sync {
    /// Reads a string value, or `None` when absent.
    fn get_string(&self, key: &str) -> Option<String>;

    /// Writes a string value, replacing any existing value.
    fn put_string(&self, key: &str, value: &str);

    /// Reads a string set, or `None` when absent.
    fn get_string_set(&self, key: &str) -> Option<BTreeSet<String>>;

    /// Writes a string set, replacing any existing set.
    fn put_string_set(&self, key: &str, value: &BTreeSet<String>);

    /// Removes a key of either kind. Removing an absent key is a no-op.
    fn remove(&self, key: &str);
}

#[derive(Debug, Clone)]
enum Slot {
    Text(String),
    Set(BTreeSet<String>),
}

/// In-memory [`KeyValueStore`] for tests and ephemeral configurations.
#[derive(Debug, Default)]
pub struct MemoryKeyValueStore {
    slots: RwLock<HashMap<String, Slot>>,
}

impl MemoryKeyValueStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of keys currently stored.
    pub fn len(&self) -> usize {
        self.slots
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Returns `true` when no keys are stored.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl KeyValueStore for MemoryKeyValueStore {
    fn get_string(&self, key: &str) -> Option<String> {
        let slots = self.slots.read().unwrap_or_else(PoisonError::into_inner);
        match slots.get(key) {
            Some(Slot::Text(value)) => Some(value.clone()),
            _ => None,
        }
    }

    fn put_string(&self, key: &str, value: &str) {
        let mut slots = self.slots.write().unwrap_or_else(PoisonError::into_inner);
        slots.insert(key.to_string(), Slot::Text(value.to_string()));
    }

    fn get_string_set(&self, key: &str) -> Option<BTreeSet<String>> {
        let slots = self.slots.read().unwrap_or_else(PoisonError::into_inner);
        match slots.get(key) {
            Some(Slot::Set(value)) => Some(value.clone()),
            _ => None,
        }
    }

    fn put_string_set(&self, key: &str, value: &BTreeSet<String>) {
        let mut slots = self.slots.write().unwrap_or_else(PoisonError::into_inner);
        slots.insert(key.to_string(), Slot::Set(value.clone()));
    }

    fn remove(&self, key: &str) {
        let mut slots = self.slots.write().unwrap_or_else(PoisonError::into_inner);
        slots.remove(key);
    }
}
