//! Observed purchases and the commerce-store collaborator boundary.
//!
//! A [`PurchaseRecord`] is one purchase fact surfaced by the platform's
//! billing service. Records are read-only to this engine: it never
//! initiates a purchase, it only reconciles purchases that have already
//! been observed. The raw store token is held as a [`SecretString`] so it
//! cannot leak through `Debug` output or logs; everything persisted or
//! logged uses the derived fingerprint instead.

use chrono::{DateTime, Utc};
use secrecy::SecretString;
use serde::{Deserialize, Serialize};

use crate::error::SyncError;
use crate::ledger::PurchaseFingerprint;

/// Platform finalization state of a purchase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PurchaseState {
    /// Payment not yet finalized by the platform. Pending purchases are
    /// never posted to the remote ledger.
    Pending,
    /// Payment complete; the purchase is eligible for reporting.
    Finalized,
}

/// Context of the offer that produced a purchase, when one applies.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OfferContext {
    /// Identifier of the offering presented to the user.
    pub offering_id: String,

    /// Placement the offering was shown from, if any.
    pub placement_id: Option<String>,
}

/// One observed purchase, as supplied by the commerce-store collaborator.
#[derive(Clone)]
pub struct PurchaseRecord {
    token: SecretString,
    fingerprint: PurchaseFingerprint,
    product_ids: Vec<String>,
    purchased_at: DateTime<Utc>,
    state: PurchaseState,
    offer_context: Option<OfferContext>,
}

impl PurchaseRecord {
    /// Creates a record, deriving the fingerprint from the token.
    #[must_use]
    pub fn new(
        token: SecretString,
        product_ids: Vec<String>,
        purchased_at: DateTime<Utc>,
        state: PurchaseState,
    ) -> Self {
        let fingerprint = PurchaseFingerprint::of_token(&token);
        Self {
            token,
            fingerprint,
            product_ids,
            purchased_at,
            state,
            offer_context: None,
        }
    }

    /// Attaches the originating-offer context.
    #[must_use]
    pub fn with_offer_context(mut self, offer_context: OfferContext) -> Self {
        self.offer_context = Some(offer_context);
        self
    }

    /// The raw store token. Exposed only so the sync pipeline can hand it
    /// to the remote ledger client.
    #[must_use]
    pub fn token(&self) -> &SecretString {
        &self.token
    }

    /// Fingerprint of the token.
    #[must_use]
    pub fn fingerprint(&self) -> &PurchaseFingerprint {
        &self.fingerprint
    }

    /// Products covered by this purchase.
    #[must_use]
    pub fn product_ids(&self) -> &[String] {
        &self.product_ids
    }

    /// The product id used for reporting: the first listed product, or
    /// empty for a malformed record.
    #[must_use]
    pub fn primary_product_id(&self) -> &str {
        self.product_ids.first().map_or("", String::as_str)
    }

    /// When the purchase was made.
    #[must_use]
    pub const fn purchased_at(&self) -> DateTime<Utc> {
        self.purchased_at
    }

    /// Platform finalization state.
    #[must_use]
    pub const fn state(&self) -> PurchaseState {
        self.state
    }

    /// Returns `true` while the platform has not finalized payment.
    #[must_use]
    pub fn is_pending(&self) -> bool {
        self.state == PurchaseState::Pending
    }

    /// Originating-offer context, when one applies.
    #[must_use]
    pub const fn offer_context(&self) -> Option<&OfferContext> {
        self.offer_context.as_ref()
    }
}

impl std::fmt::Debug for PurchaseRecord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PurchaseRecord")
            .field("fingerprint", &self.fingerprint)
            .field("product_ids", &self.product_ids)
            .field("purchased_at", &self.purchased_at)
            .field("state", &self.state)
            .field("offer_context", &self.offer_context)
            .finish_non_exhaustive()
    }
}

/// Which platform billing service backs the commerce-store client.
///
/// The concrete client is a compile-time resolved strategy selected via
/// configuration and injected at construction; no dynamic lookup.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StoreKind {
    /// Google Play Billing.
    GooglePlay,
    /// Amazon Appstore.
    Amazon,
}

/// Collaborator supplying the currently-known purchases on demand.
#[async_trait::async_trait]
pub trait CommerceStoreClient: Send + Sync {
    /// The platform this client talks to.
    fn store_kind(&self) -> StoreKind;

    /// Queries the platform for all currently-known purchases and
    /// subscriptions.
    async fn query_purchases(&self) -> Result<Vec<PurchaseRecord>, SyncError>;
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use super::*;

    fn record() -> PurchaseRecord {
        PurchaseRecord::new(
            SecretString::from("raw-store-token".to_string()),
            vec!["monthly".to_string(), "monthly_family".to_string()],
            Utc.with_ymd_and_hms(2026, 2, 14, 9, 30, 0).unwrap(),
            PurchaseState::Finalized,
        )
    }

    #[test]
    fn debug_output_never_contains_raw_token() {
        let rendered = format!("{:?}", record());
        assert!(!rendered.contains("raw-store-token"));
        assert!(rendered.contains("fingerprint"));
    }

    #[test]
    fn primary_product_is_first_listed() {
        assert_eq!(record().primary_product_id(), "monthly");
    }

    #[test]
    fn pending_state_is_detected() {
        let pending = PurchaseRecord::new(
            SecretString::from("t".to_string()),
            vec!["p".to_string()],
            Utc.with_ymd_and_hms(2026, 2, 14, 9, 30, 0).unwrap(),
            PurchaseState::Pending,
        );
        assert!(pending.is_pending());
        assert!(!record().is_pending());
    }
}
