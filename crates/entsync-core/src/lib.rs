//! On-device entitlement reconciliation engine.
//!
//! `entsync-core` maintains a local snapshot of a user's
//! subscription/entitlement state, keeps it consistent with a remote
//! ledger service, and guarantees that every locally observed purchase is
//! reported durably and idempotently — under concurrent callers, process
//! restarts, transient network failures, and backend outages.
//!
//! # Architecture
//!
//! ```text
//! EntitlementClient
//!     ├── policy::evaluate          per-call freshness decision
//!     ├── EntitlementSnapshotStore  typed cache over the injected KV store
//!     ├── RequestCoalescer          one in-flight remote call per key
//!     ├── ReceiptSyncPipeline       idempotent purchase reporting
//!     │       ├── PurchaseFingerprintLedger
//!     │       └── OfflineSnapshotCalculator (backend-outage fallback)
//!     └── ListenerNotifier          change-aware, single-context delivery
//! ```
//!
//! The engine is an embedded library: transport, billing-service access,
//! and on-disk storage are injected collaborators
//! ([`backend::LedgerBackend`], [`purchase::CommerceStoreClient`],
//! [`store::KeyValueStore`]). It never initiates purchases and exposes no
//! process-wide state; the composing application owns the
//! [`client::EntitlementClient`] instance.

pub mod backend;
pub mod client;
pub mod coalesce;
pub mod config;
pub mod error;
pub mod ledger;
pub mod notify;
pub mod offline;
pub mod policy;
pub mod purchase;
pub mod snapshot;
pub mod store;
pub mod sync;

pub use backend::{
    BackendFailure, ErrorBehavior, LedgerBackend, PostReceiptRequest, PostReceiptResponse,
    ResponseMetadata,
};
pub use client::EntitlementClient;
pub use coalesce::{CacheKey, RequestCoalescer};
pub use config::EngineConfig;
pub use error::SyncError;
pub use ledger::{PurchaseFingerprint, PurchaseFingerprintLedger};
pub use notify::{Dispatcher, InlineDispatcher, ListenerNotifier, SerialDispatcher, SnapshotListener};
pub use offline::{OfflineSnapshotCalculator, ProductGrantCalculator};
pub use policy::{CacheAction, FetchPolicy, StalenessRule};
pub use purchase::{CommerceStoreClient, OfferContext, PurchaseRecord, PurchaseState, StoreKind};
pub use snapshot::{EntitlementRecord, EntitlementSnapshot, SnapshotOrigin};
pub use store::{EntitlementSnapshotStore, KeyValueStore, MemoryKeyValueStore};
pub use sync::{ReceiptSyncPipeline, RecordOutcome, SyncReport};
