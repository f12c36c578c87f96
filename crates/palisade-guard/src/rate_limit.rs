//! Fixed-window rate limiting per tenant and credential.
//!
//! Windows are aligned to UTC minutes. Each request performs one atomic
//! upsert-and-increment on `(key, window_start)` and compares the returned
//! count with the ceiling. There is no separate read step; two concurrent
//! requests can never both observe the same count.
//!
//! A new window starts a new bucket at 1, so counts never carry over.
//!
//! # Example
//!
//! ```
//! use std::sync::Arc;
//!
//! use palisade_core::{RateLimitKey, TestClock};
//! use palisade_guard::{storage::mock::MockGuardStorage, FailureMode, RateLimiter};
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() {
//! let limiter = RateLimiter::new(
//!     Arc::new(MockGuardStorage::new()),
//!     Arc::new(TestClock::new()),
//!     FailureMode::Open,
//! );
//! let key = RateLimitKey::from_parts(Some("acme"), Some("sk_live_0123456789abcdef"));
//!
//! assert!(limiter.allow(&key, 2).await);
//! assert!(limiter.allow(&key, 2).await);
//! assert!(!limiter.allow(&key, 2).await);
//! # }
//! ```

use std::{fmt, str::FromStr, sync::Arc, time::Duration};

use palisade_core::{
    time::{minute_window_start, until_next_minute},
    Clock, RateLimitKey,
};
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument, warn};

use crate::{
    error::Result,
    storage::RateLimitStore,
    timeout::{bounded, DEFAULT_STORE_TIMEOUT},
};

/// Outcome when the counter store cannot be reached.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FailureMode {
    /// Let the request through.
    #[default]
    Open,
    /// Reject the request with the store error.
    Closed,
}

impl fmt::Display for FailureMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Open => write!(f, "open"),
            Self::Closed => write!(f, "closed"),
        }
    }
}

impl FromStr for FailureMode {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "open" => Ok(Self::Open),
            "closed" => Ok(Self::Closed),
            other => Err(format!("unknown rate limit failure mode: {other}")),
        }
    }
}

/// Result of a rate limit check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateDecision {
    /// Request is within the ceiling.
    Allowed {
        /// Ceiling for the window.
        limit: u64,
        /// Requests left in the current window.
        remaining: u64,
    },
    /// Ceiling exceeded for the current window.
    Limited {
        /// Ceiling for the window.
        limit: u64,
        /// Time until the next window opens.
        retry_after: Duration,
    },
}

impl RateDecision {
    /// Returns whether the request may proceed.
    pub const fn is_allowed(&self) -> bool {
        matches!(self, Self::Allowed { .. })
    }

    /// Ceiling the decision was made against.
    pub const fn limit(&self) -> u64 {
        match self {
            Self::Allowed { limit, .. } | Self::Limited { limit, .. } => *limit,
        }
    }

    /// Whole seconds to wait, rounded up and at least one.
    pub fn retry_after_secs(&self) -> Option<u64> {
        match self {
            Self::Allowed { .. } => None,
            Self::Limited { retry_after, .. } => {
                let secs = retry_after.as_secs() + u64::from(retry_after.subsec_nanos() > 0);
                Some(secs.max(1))
            },
        }
    }
}

/// Fixed-window counter over a [`RateLimitStore`].
#[derive(Clone)]
pub struct RateLimiter {
    store: Arc<dyn RateLimitStore>,
    clock: Arc<dyn Clock>,
    failure_mode: FailureMode,
    timeout: Duration,
}

impl RateLimiter {
    /// Creates a limiter with the default store deadline.
    pub fn new(
        store: Arc<dyn RateLimitStore>,
        clock: Arc<dyn Clock>,
        failure_mode: FailureMode,
    ) -> Self {
        Self { store, clock, failure_mode, timeout: DEFAULT_STORE_TIMEOUT }
    }

    /// Overrides the store deadline.
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Configured store-failure behaviour.
    pub fn failure_mode(&self) -> FailureMode {
        self.failure_mode
    }

    /// Counts one request for `key` and decides whether it is allowed.
    ///
    /// # Errors
    ///
    /// Only in [`FailureMode::Closed`], when the store fails or times out.
    /// In [`FailureMode::Open`] store failures yield `Allowed`.
    #[instrument(skip(self, key), fields(key = %key))]
    pub async fn check(&self, key: &RateLimitKey, max_per_window: u64) -> Result<RateDecision> {
        let now = self.clock.now_utc();
        let window_start = minute_window_start(now);

        let increment = self.store.increment(key.clone(), window_start);
        let count = match bounded(self.timeout, increment).await {
            Ok(count) => u64::try_from(count).unwrap_or(0),
            Err(err) => {
                warn!(error = %err, failure_mode = %self.failure_mode, "rate limit store failed");
                return match self.failure_mode {
                    FailureMode::Open => Ok(RateDecision::Allowed {
                        limit: max_per_window,
                        remaining: max_per_window,
                    }),
                    FailureMode::Closed => Err(err),
                };
            },
        };

        if count > max_per_window {
            debug!(count, limit = max_per_window, "rate limit exceeded");
            return Ok(RateDecision::Limited {
                limit: max_per_window,
                retry_after: until_next_minute(now),
            });
        }

        Ok(RateDecision::Allowed { limit: max_per_window, remaining: max_per_window - count })
    }

    /// Boolean form of [`RateLimiter::check`]; a closed-mode store failure
    /// is `false`.
    pub async fn allow(&self, key: &RateLimitKey, max_per_window: u64) -> bool {
        self.check(key, max_per_window).await.is_ok_and(|decision| decision.is_allowed())
    }
}

#[cfg(test)]
mod tests {
    use palisade_core::TestClock;

    use super::*;
    use crate::{error::GuardError, storage::mock::MockGuardStorage};

    // 20 seconds into a minute
    const START: u64 = 1_700_000_000;

    fn limiter(mode: FailureMode) -> (RateLimiter, MockGuardStorage, TestClock) {
        let storage = MockGuardStorage::new();
        let clock = TestClock::at_unix(START);
        let limiter = RateLimiter::new(Arc::new(storage.clone()), Arc::new(clock.clone()), mode);
        (limiter, storage, clock)
    }

    fn key() -> RateLimitKey {
        RateLimitKey::from_parts(Some("acme"), Some("sk_test_abcdefghijklmnop"))
    }

    #[tokio::test]
    async fn first_m_allowed_then_limited() {
        let (limiter, _, _) = limiter(FailureMode::Open);

        for expected_remaining in (0..3).rev() {
            let decision = limiter.check(&key(), 3).await.unwrap();
            assert_eq!(decision, RateDecision::Allowed { limit: 3, remaining: expected_remaining });
        }

        let decision = limiter.check(&key(), 3).await.unwrap();
        assert!(!decision.is_allowed());
        assert_eq!(decision.retry_after_secs(), Some(40));
    }

    #[tokio::test]
    async fn next_window_starts_from_one() {
        let (limiter, storage, clock) = limiter(FailureMode::Open);
        for _ in 0..5 {
            limiter.check(&key(), 2).await.unwrap();
        }

        clock.advance(Duration::from_secs(40));
        let decision = limiter.check(&key(), 2).await.unwrap();

        assert_eq!(decision, RateDecision::Allowed { limit: 2, remaining: 1 });
        let window = minute_window_start(clock.now_utc());
        assert_eq!(storage.bucket_count(&key(), window).await, Some(1));
    }

    #[tokio::test]
    async fn keys_are_counted_independently() {
        let (limiter, _, _) = limiter(FailureMode::Open);
        let other = RateLimitKey::from_parts(Some("globex"), None);

        assert!(limiter.allow(&key(), 1).await);
        assert!(!limiter.allow(&key(), 1).await);
        assert!(limiter.allow(&other, 1).await);
    }

    #[tokio::test]
    async fn fail_open_allows_when_store_is_down() {
        let (limiter, storage, _) = limiter(FailureMode::Open);
        storage.set_unavailable(Some("down")).await;

        let decision = limiter.check(&key(), 10).await.unwrap();
        assert!(decision.is_allowed());
    }

    #[tokio::test]
    async fn fail_closed_surfaces_store_error() {
        let (limiter, storage, _) = limiter(FailureMode::Closed);
        storage.set_unavailable(Some("down")).await;

        let err = limiter.check(&key(), 10).await.unwrap_err();
        assert!(matches!(err, GuardError::Store(_)));
        assert!(!limiter.allow(&key(), 10).await);
    }

    #[tokio::test]
    async fn fail_closed_times_out_slow_store() {
        let (limiter, storage, _) = limiter(FailureMode::Closed);
        storage.set_latency(Some(Duration::from_secs(5))).await;

        let limiter = limiter.with_timeout(Duration::from_millis(20));
        assert!(matches!(limiter.check(&key(), 10).await, Err(GuardError::Timeout(_))));
    }

    #[test]
    fn failure_mode_parses_case_insensitively() {
        assert_eq!("CLOSED".parse::<FailureMode>().unwrap(), FailureMode::Closed);
        assert_eq!(" open ".parse::<FailureMode>().unwrap(), FailureMode::Open);
        assert!("ajar".parse::<FailureMode>().is_err());
        assert_eq!(FailureMode::default(), FailureMode::Open);
    }

    #[test]
    fn retry_after_rounds_up() {
        let limited =
            RateDecision::Limited { limit: 1, retry_after: Duration::from_millis(1_200) };
        assert_eq!(limited.retry_after_secs(), Some(2));

        let edge = RateDecision::Limited { limit: 1, retry_after: Duration::ZERO };
        assert_eq!(edge.retry_after_secs(), Some(1));
    }
}
