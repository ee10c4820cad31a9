//! The composed reconciliation client.
//!
//! [`EntitlementClient`] wires the freshness policy, snapshot store,
//! request coalescer, receipt sync pipeline, and listener notifier into
//! the control flow the engine exposes to an application:
//!
//! ```text
//! snapshot(policy) ──▶ FreshnessPolicyEngine
//!                          │ serve cache ──────────────▶ caller
//!                          │ fetch blocking ─▶ RequestCoalescer ─▶ backend
//!                          │ serve + refresh ─▶ cache now, fetch in background
//!                          ▼
//!                      EntitlementSnapshotStore ──▶ ListenerNotifier
//!
//! sync_purchases() ─▶ CommerceStoreClient ─▶ ReceiptSyncPipeline
//! ```
//!
//! The client is cheap to clone; clones share all state. There is no
//! process-wide singleton — the composing application owns the instance
//! and passes it by reference.

use std::sync::{Arc, PoisonError, RwLock};

use chrono::Utc;
use tracing::{debug, info, warn};

use crate::backend::LedgerBackend;
use crate::coalesce::RequestCoalescer;
use crate::config::EngineConfig;
use crate::error::SyncError;
use crate::ledger::PurchaseFingerprintLedger;
use crate::notify::{Dispatcher, ListenerNotifier, SnapshotListener};
use crate::offline::{OfflineSnapshotCalculator, ProductGrantCalculator};
use crate::policy::{self, CacheAction, FetchPolicy};
use crate::purchase::CommerceStoreClient;
use crate::snapshot::EntitlementSnapshot;
use crate::store::{EntitlementSnapshotStore, KeyValueStore};
use crate::sync::{ReceiptSyncPipeline, SyncReport, fetch_and_cache};

struct ClientInner {
    config: EngineConfig,
    backend: Arc<dyn LedgerBackend>,
    commerce: Arc<dyn CommerceStoreClient>,
    snapshots: Arc<EntitlementSnapshotStore>,
    notifier: Arc<ListenerNotifier>,
    fetch_coalescer: Arc<RequestCoalescer<EntitlementSnapshot, SyncError>>,
    pipeline: ReceiptSyncPipeline,
    user_id: RwLock<String>,
}

impl ClientInner {
    fn user_id(&self) -> String {
        self.user_id
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

/// Local reconciliation engine for one application's entitlement state.
#[derive(Clone)]
pub struct EntitlementClient {
    inner: Arc<ClientInner>,
}

impl EntitlementClient {
    /// Builds a client with the default offline calculator.
    #[must_use]
    pub fn new(
        config: EngineConfig,
        initial_user_id: impl Into<String>,
        backend: Arc<dyn LedgerBackend>,
        commerce: Arc<dyn CommerceStoreClient>,
        store: Arc<dyn KeyValueStore>,
        dispatcher: Arc<dyn Dispatcher>,
    ) -> Self {
        Self::with_offline_calculator(
            config,
            initial_user_id,
            backend,
            commerce,
            store,
            dispatcher,
            Arc::new(ProductGrantCalculator),
        )
    }

    /// Builds a client with an explicit offline calculator.
    #[must_use]
    pub fn with_offline_calculator(
        config: EngineConfig,
        initial_user_id: impl Into<String>,
        backend: Arc<dyn LedgerBackend>,
        commerce: Arc<dyn CommerceStoreClient>,
        store: Arc<dyn KeyValueStore>,
        dispatcher: Arc<dyn Dispatcher>,
        offline: Arc<dyn OfflineSnapshotCalculator>,
    ) -> Self {
        if commerce.store_kind() != config.store_kind {
            warn!(
                configured = ?config.store_kind,
                injected = ?commerce.store_kind(),
                "commerce client does not match the configured store"
            );
        }
        let snapshots = Arc::new(EntitlementSnapshotStore::new(
            Arc::clone(&store),
            config.cache_namespace.clone(),
        ));
        let ledger = Arc::new(PurchaseFingerprintLedger::new(
            store,
            config.cache_namespace.clone(),
            &config.credential_scope,
        ));
        let notifier = Arc::new(ListenerNotifier::new(dispatcher));
        let fetch_coalescer = Arc::new(RequestCoalescer::new());
        let pipeline = ReceiptSyncPipeline::new(
            Arc::clone(&backend),
            ledger,
            Arc::clone(&snapshots),
            offline,
            Arc::clone(&notifier),
            Arc::clone(&fetch_coalescer),
        );
        Self {
            inner: Arc::new(ClientInner {
                config,
                backend,
                commerce,
                snapshots,
                notifier,
                fetch_coalescer,
                pipeline,
                user_id: RwLock::new(initial_user_id.into()),
            }),
        }
    }

    /// The user identity the client is currently scoped to.
    #[must_use]
    pub fn current_user_id(&self) -> String {
        self.inner.user_id()
    }

    /// Returns the entitlement snapshot under the given fetch policy.
    ///
    /// Depending on the policy, the cache's age, and the app context this
    /// serves the cache directly, blocks on a coalesced fetch, or serves
    /// the cache and refreshes it in the background. Successful fetches
    /// update the cache and propagate to the installed listener.
    ///
    /// # Errors
    ///
    /// [`SyncError::CacheMiss`] for a cache-only read with no cache;
    /// otherwise whatever the fetch surfaced.
    pub async fn snapshot(
        &self,
        fetch_policy: FetchPolicy,
        is_app_backgrounded: bool,
    ) -> Result<EntitlementSnapshot, SyncError> {
        let inner = &self.inner;
        let user_id = inner.user_id();
        let now = Utc::now();

        let cached = inner.snapshots.get(&user_id);
        let stale = inner.snapshots.is_stale(
            &user_id,
            &inner.config.staleness,
            is_app_backgrounded,
            now,
        );
        let action = policy::evaluate(fetch_policy, &user_id, cached.is_some(), stale)?;

        match action {
            CacheAction::ServeCache => cached.ok_or(SyncError::CacheMiss { user_id }),
            CacheAction::FetchBlocking => {
                fetch_and_cache(
                    &inner.backend,
                    &inner.snapshots,
                    &inner.notifier,
                    &inner.fetch_coalescer,
                    &user_id,
                    now,
                )
                .await
            }
            CacheAction::ServeCacheAndRefresh => {
                let snapshot = cached.ok_or(SyncError::CacheMiss {
                    user_id: user_id.clone(),
                })?;
                debug!(user_id, "serving stale cache, refreshing in background");
                let refresh_inner = Arc::clone(inner);
                tokio::spawn(async move {
                    let refresh_now = Utc::now();
                    let _ = fetch_and_cache(
                        &refresh_inner.backend,
                        &refresh_inner.snapshots,
                        &refresh_inner.notifier,
                        &refresh_inner.fetch_coalescer,
                        &refresh_inner.user_id(),
                        refresh_now,
                    )
                    .await;
                });
                Ok(snapshot)
            }
        }
    }

    /// Reconciles all currently-known purchases with the remote ledger and
    /// returns the resulting snapshot.
    pub async fn sync_purchases(&self) -> Result<EntitlementSnapshot, SyncError> {
        self.sync_pass(false).await.aggregate
    }

    /// Like [`Self::sync_purchases`], but posts records as restorations of
    /// existing purchases.
    pub async fn restore_purchases(&self) -> Result<EntitlementSnapshot, SyncError> {
        self.sync_pass(true).await.aggregate
    }

    /// Runs one full reconciliation pass and returns the per-record
    /// outcomes alongside the aggregate result.
    pub async fn sync_pass(&self, is_restore: bool) -> SyncReport {
        let inner = &self.inner;
        let user_id = inner.user_id();
        let records = match inner.commerce.query_purchases().await {
            Ok(records) => records,
            Err(error) => {
                return SyncReport {
                    records: Vec::new(),
                    aggregate: Err(error),
                };
            }
        };
        inner
            .pipeline
            .reconcile(&user_id, records, is_restore, Utc::now())
            .await
    }

    /// Installs the snapshot listener. Replacing an empty slot immediately
    /// replays the current cached snapshot, if any.
    pub fn set_listener(&self, listener: Arc<dyn SnapshotListener>) {
        let was_empty = self.inner.notifier.set_listener(listener);
        if was_empty {
            if let Some(cached) = self.inner.snapshots.get(&self.inner.user_id()) {
                self.inner.notifier.notify(cached);
            }
        }
    }

    /// Removes the snapshot listener.
    pub fn clear_listener(&self) {
        self.inner.notifier.clear_listener();
    }

    /// Switches the active user identity, invalidating the previous user's
    /// cached snapshot and delivery state.
    pub fn switch_user(&self, new_user_id: impl Into<String>) {
        let new_user_id = new_user_id.into();
        let previous = {
            let mut user = self
                .inner
                .user_id
                .write()
                .unwrap_or_else(PoisonError::into_inner);
            std::mem::replace(&mut *user, new_user_id.clone())
        };
        if previous != new_user_id {
            info!(previous, new = new_user_id, "switching user identity");
            self.inner.snapshots.invalidate(&previous);
            self.inner.notifier.reset_last_delivered();
        }
    }

    /// Drops the cached snapshot for the current user, forcing the next
    /// eligible read to fetch.
    pub fn invalidate_cache(&self) {
        self.inner.snapshots.invalidate(&self.inner.user_id());
    }
}
