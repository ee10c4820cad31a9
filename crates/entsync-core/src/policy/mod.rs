//! Cache-freshness policy evaluation.
//!
//! [`evaluate`] is a pure function from `(policy, cache presence,
//! staleness)` to the action a caller must take: serve the cache, block on
//! a fresh fetch, or serve the cache immediately and refresh in the
//! background. It holds no state of its own; staleness is decided up front
//! by a [`StalenessRule`] over the cache age and the app's
//! foreground/background context.
//!
//! The foreground threshold is deliberately much shorter than the
//! background one: a foregrounded app should reflect billing changes
//! quickly, while a backgrounded app should not wake the device for minor
//! staleness.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::SyncError;

// =============================================================================
// Constants
// =============================================================================

/// Default staleness threshold while the app is foregrounded.
pub const DEFAULT_FOREGROUND_TTL: Duration = Duration::from_secs(60 * 5);

/// Default staleness threshold while the app is backgrounded.
pub const DEFAULT_BACKGROUND_TTL: Duration = Duration::from_secs(60 * 60 * 25);

// =============================================================================
// FetchPolicy
// =============================================================================

/// Caller-selected policy for how a snapshot read interacts with the cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FetchPolicy {
    /// Never fetch; error if no cached snapshot exists.
    CacheOnly,
    /// Always fetch, ignoring the cache as an input (the result still
    /// updates the cache as an output).
    FetchCurrent,
    /// Serve the cache when present, even if stale (refreshing stale data in
    /// the background); fetch blocking only when the cache is empty.
    CachedOrFetched,
    /// Behave like [`FetchPolicy::FetchCurrent`] when the cache is stale,
    /// otherwise like [`FetchPolicy::CachedOrFetched`].
    NotStaleCachedOrCurrent,
}

// =============================================================================
// CacheAction
// =============================================================================

/// Action produced by [`evaluate`] for a single snapshot read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheAction {
    /// Return the cached snapshot; no network activity.
    ServeCache,
    /// Block the caller on a fresh fetch.
    FetchBlocking,
    /// Return the cached snapshot immediately and refresh it with a
    /// non-blocking background fetch.
    ServeCacheAndRefresh,
}

// =============================================================================
// StalenessRule
// =============================================================================

/// Caller-supplied predicate deciding when a cache age counts as stale.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StalenessRule {
    /// Maximum acceptable cache age while foregrounded.
    pub foreground_ttl: Duration,

    /// Maximum acceptable cache age while backgrounded.
    pub background_ttl: Duration,
}

impl Default for StalenessRule {
    fn default() -> Self {
        Self {
            foreground_ttl: DEFAULT_FOREGROUND_TTL,
            background_ttl: DEFAULT_BACKGROUND_TTL,
        }
    }
}

impl StalenessRule {
    /// Creates a rule with explicit thresholds.
    #[must_use]
    pub const fn new(foreground_ttl: Duration, background_ttl: Duration) -> Self {
        Self {
            foreground_ttl,
            background_ttl,
        }
    }

    /// Returns `true` when a cache entry of the given age is stale in the
    /// given app context. A negative age (clock moved backwards since the
    /// fetch) never counts as stale.
    #[must_use]
    pub fn is_stale(&self, age: chrono::Duration, is_app_backgrounded: bool) -> bool {
        let ttl = if is_app_backgrounded {
            self.background_ttl
        } else {
            self.foreground_ttl
        };
        match chrono::Duration::from_std(ttl) {
            Ok(ttl) => age > ttl,
            // A TTL too large for chrono arithmetic can never be exceeded.
            Err(_) => false,
        }
    }
}

// =============================================================================
// evaluate
// =============================================================================

/// Decides the action for one snapshot read.
///
/// The transition table:
///
/// | policy                    | cache   | stale | action                 |
/// |---------------------------|---------|-------|------------------------|
/// | `CacheOnly`               | present | any   | `ServeCache`           |
/// | `CacheOnly`               | absent  | any   | `CacheMiss` error      |
/// | `FetchCurrent`            | any     | any   | `FetchBlocking`        |
/// | `CachedOrFetched`         | present | no    | `ServeCache`           |
/// | `CachedOrFetched`         | present | yes   | `ServeCacheAndRefresh` |
/// | `CachedOrFetched`         | absent  | any   | `FetchBlocking`        |
/// | `NotStaleCachedOrCurrent` | present | no    | `ServeCache`           |
/// | `NotStaleCachedOrCurrent` | present | yes   | `FetchBlocking`        |
/// | `NotStaleCachedOrCurrent` | absent  | any   | `FetchBlocking`        |
///
/// # Errors
///
/// Returns [`SyncError::CacheMiss`] for a cache-only read with no cached
/// snapshot; this is the policy's only terminal error.
pub fn evaluate(
    policy: FetchPolicy,
    user_id: &str,
    cache_present: bool,
    stale: bool,
) -> Result<CacheAction, SyncError> {
    let action = match policy {
        FetchPolicy::CacheOnly => {
            if cache_present {
                CacheAction::ServeCache
            } else {
                return Err(SyncError::CacheMiss {
                    user_id: user_id.to_string(),
                });
            }
        }
        FetchPolicy::FetchCurrent => CacheAction::FetchBlocking,
        FetchPolicy::CachedOrFetched => match (cache_present, stale) {
            (true, false) => CacheAction::ServeCache,
            (true, true) => CacheAction::ServeCacheAndRefresh,
            (false, _) => CacheAction::FetchBlocking,
        },
        FetchPolicy::NotStaleCachedOrCurrent => {
            if !cache_present || stale {
                CacheAction::FetchBlocking
            } else {
                // Fresh cache: delegate to the CachedOrFetched behavior.
                CacheAction::ServeCache
            }
        }
    };
    Ok(action)
}
