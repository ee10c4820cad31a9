//! Engine configuration.

use serde::{Deserialize, Serialize};

use crate::policy::StalenessRule;
use crate::purchase::StoreKind;

/// Default key namespace for persisted state.
pub const DEFAULT_CACHE_NAMESPACE: &str = "com.entsync";

/// Configuration for an [`EntitlementClient`](crate::client::EntitlementClient).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct EngineConfig {
    /// Which platform billing service the commerce collaborator targets.
    pub store_kind: StoreKind,

    /// Credential scope used to namespace the fingerprint ledger; one
    /// ledger entry exists per scope.
    pub credential_scope: String,

    /// Key namespace for all persisted state.
    pub cache_namespace: String,

    /// Staleness thresholds for the cached snapshot.
    pub staleness: StalenessRule,
}

impl EngineConfig {
    /// Creates a config for the given store and credential scope, with
    /// default cache namespace and staleness thresholds.
    #[must_use]
    pub fn new(store_kind: StoreKind, credential_scope: impl Into<String>) -> Self {
        Self {
            store_kind,
            credential_scope: credential_scope.into(),
            cache_namespace: DEFAULT_CACHE_NAMESPACE.to_string(),
            staleness: StalenessRule::default(),
        }
    }

    /// Overrides the key namespace.
    #[must_use]
    pub fn with_cache_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.cache_namespace = namespace.into();
        self
    }

    /// Overrides the staleness thresholds.
    #[must_use]
    pub const fn with_staleness(mut self, staleness: StalenessRule) -> Self {
        self.staleness = staleness;
        self
    }
}
