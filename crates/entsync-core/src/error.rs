//! Error taxonomy for the reconciliation engine.
//!
//! Every failure path in the engine reaches a caller as one of these
//! variants; nothing is silently swallowed. The taxonomy distinguishes
//! client-class failures (bad credentials, invalid data), which are surfaced
//! immediately, from server-class failures (transport, backend outage,
//! malformed payloads), which qualify for the offline-entitlement fallback
//! in the receipt sync pipeline.

use thiserror::Error;

/// Errors surfaced by snapshot fetches, cache reads, and receipt syncs.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[non_exhaustive]
pub enum SyncError {
    /// A cache-only read found no cached snapshot for the user.
    #[error("no cached entitlement snapshot for user {user_id}")]
    CacheMiss {
        /// The user identity the read was scoped to.
        user_id: String,
    },

    /// Transport-level failure reaching the remote ledger.
    #[error("network error: {detail}")]
    Network {
        /// Description of the transport failure.
        detail: String,
    },

    /// The configured API credentials were rejected by the remote ledger.
    #[error("invalid API credentials")]
    InvalidCredentials,

    /// The platform has not finalized payment for a purchase; the record is
    /// never posted and is retried by a later sync pass once finalized.
    #[error("payment pending for product {product_id}")]
    PaymentPending {
        /// Product the pending purchase is for.
        product_id: String,
    },

    /// The remote ledger returned an unrecognized failure.
    #[error("backend error {code}: {message}")]
    UnknownBackend {
        /// Backend-assigned error code.
        code: i32,
        /// Backend-supplied message.
        message: String,
    },

    /// A remote payload could not be decoded. Treated as network-equivalent
    /// for fallback classification.
    #[error("malformed remote payload: {detail}")]
    Parse {
        /// Description of the decode failure.
        detail: String,
    },

    /// An in-flight operation was torn down before delivering its result.
    /// Only reachable when the runtime is shutting down mid-call.
    #[error("in-flight operation aborted before completion")]
    Aborted,
}

impl SyncError {
    /// Convenience constructor for transport failures.
    pub fn network(detail: impl Into<String>) -> Self {
        Self::Network {
            detail: detail.into(),
        }
    }

    /// Convenience constructor for decode failures.
    pub fn parse(detail: impl Into<String>) -> Self {
        Self::Parse {
            detail: detail.into(),
        }
    }

    /// Returns `true` for server-class failures that qualify for the
    /// offline-entitlement fallback. Client-class failures (credentials,
    /// payment state) are surfaced without fallback.
    #[must_use]
    pub const fn is_server_class(&self) -> bool {
        matches!(
            self,
            Self::Network { .. } | Self::UnknownBackend { .. } | Self::Parse { .. } | Self::Aborted
        )
    }
}

impl From<serde_json::Error> for SyncError {
    fn from(err: serde_json::Error) -> Self {
        Self::Parse {
            detail: err.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn server_class_covers_fallback_qualifying_errors() {
        assert!(SyncError::network("timeout").is_server_class());
        assert!(SyncError::parse("truncated body").is_server_class());
        assert!(SyncError::UnknownBackend {
            code: 7110,
            message: "internal".to_string(),
        }
        .is_server_class());

        assert!(!SyncError::InvalidCredentials.is_server_class());
        assert!(!SyncError::PaymentPending {
            product_id: "monthly".to_string(),
        }
        .is_server_class());
        assert!(!SyncError::CacheMiss {
            user_id: "u1".to_string(),
        }
        .is_server_class());
    }

    #[test]
    fn json_errors_map_to_parse() {
        let err = serde_json::from_str::<serde_json::Value>("{not json").unwrap_err();
        assert!(matches!(SyncError::from(err), SyncError::Parse { .. }));
    }
}
