//! Remote ledger client boundary.
//!
//! The engine never talks to the network itself; the composing application
//! injects a [`LedgerBackend`]. Transport, retries-at-the-wire, and timeout
//! semantics live behind this trait — the engine only reacts to success or
//! failure. Receipt-post failures carry an [`ErrorBehavior`] telling the
//! sync pipeline how to proceed: retry on a later pass, treat the purchase
//! as consumed anyway, or fall back to offline-computed entitlements.

use std::collections::BTreeMap;

use secrecy::SecretString;
use serde::{Deserialize, Serialize};

use crate::coalesce::Aborted;
use crate::error::SyncError;
use crate::purchase::OfferContext;
use crate::snapshot::EntitlementSnapshot;

/// How the sync pipeline should handle a failed receipt post.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorBehavior {
    /// Transient failure: surface the error and let a later sync pass
    /// retry. The engine never loops internally.
    RetryLater,
    /// The purchase is finished as far as the ledger is concerned; mark it
    /// synced even though the post failed.
    ShouldBeConsumed,
    /// Backend outage: compute entitlements offline and do not mark the
    /// purchase synced, so a later pass retries it.
    UseOfflineEntitlements,
}

/// A failed receipt post: the error plus how to handle it.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{error}")]
pub struct BackendFailure {
    /// The underlying failure.
    pub error: SyncError,
    /// How the pipeline should proceed.
    pub behavior: ErrorBehavior,
}

impl BackendFailure {
    /// Creates a failure with the given handling behavior.
    #[must_use]
    pub const fn new(error: SyncError, behavior: ErrorBehavior) -> Self {
        Self { error, behavior }
    }
}

impl From<Aborted> for BackendFailure {
    fn from(_: Aborted) -> Self {
        Self {
            error: SyncError::Aborted,
            behavior: ErrorBehavior::RetryLater,
        }
    }
}

/// One receipt to post to the remote ledger.
#[derive(Debug, Clone)]
pub struct PostReceiptRequest {
    /// User identity the purchase belongs to.
    pub user_id: String,
    /// Raw store token; exposed to the transport only.
    pub token: SecretString,
    /// Product being reported.
    pub product_id: String,
    /// Whether this post restores an existing purchase rather than
    /// reporting a new one.
    pub is_restore: bool,
    /// Originating-offer context, when one applies.
    pub offer_context: Option<OfferContext>,
    /// Subscriber attributes to attach to the post.
    pub attributes: BTreeMap<String, String>,
}

/// Metadata the remote ledger attaches to a successful post.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResponseMetadata {
    /// Backend request id, for support correlation.
    pub request_id: Option<String>,
}

/// Successful receipt post: the refreshed snapshot plus response metadata.
#[derive(Debug, Clone)]
pub struct PostReceiptResponse {
    /// Snapshot reflecting the posted purchase.
    pub snapshot: EntitlementSnapshot,
    /// Response metadata.
    pub metadata: ResponseMetadata,
}

/// Remote ledger service client.
#[async_trait::async_trait]
pub trait LedgerBackend: Send + Sync {
    /// Fetches the current entitlement snapshot for a user.
    async fn fetch_snapshot(&self, user_id: &str) -> Result<EntitlementSnapshot, SyncError>;

    /// Posts one purchase to the remote ledger.
    async fn post_receipt(
        &self,
        request: PostReceiptRequest,
    ) -> Result<PostReceiptResponse, BackendFailure>;
}
