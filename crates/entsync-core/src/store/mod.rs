//! Local persistence: the injected key/value store and the typed snapshot
//! cache layered on top of it.

mod kv;
mod snapshot_store;

pub use kv::{KeyValueStore, MemoryKeyValueStore};
pub use snapshot_store::EntitlementSnapshotStore;
