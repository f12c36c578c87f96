//! Replay rejection for verified webhooks.
//!
//! The guard records each verified signature with a single insert-if-absent
//! before the request is processed. The first caller to insert wins; every
//! other caller, concurrent or later, is told the request is a duplicate.
//! Records never expire.

use std::{sync::Arc, time::Duration};

use palisade_core::Clock;
use palisade_crypto::VerifiedWebhook;
use tracing::{debug, instrument};

use crate::{
    error::Result,
    storage::IdempotencyStore,
    timeout::{bounded, DEFAULT_STORE_TIMEOUT},
};

/// Outcome of [`IdempotencyGuard::admit_once`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// First time this signature was seen; process the request.
    First,
    /// Already processed; skip processing but acknowledge the sender.
    Duplicate,
}

impl Admission {
    /// Returns whether the request was seen before.
    pub const fn is_duplicate(self) -> bool {
        matches!(self, Self::Duplicate)
    }
}

/// Rejects replays of already-processed webhooks.
#[derive(Clone)]
pub struct IdempotencyGuard {
    store: Arc<dyn IdempotencyStore>,
    clock: Arc<dyn Clock>,
    timeout: Duration,
}

impl IdempotencyGuard {
    /// Creates a guard with the default store deadline.
    pub fn new(store: Arc<dyn IdempotencyStore>, clock: Arc<dyn Clock>) -> Self {
        Self { store, clock, timeout: DEFAULT_STORE_TIMEOUT }
    }

    /// Overrides the store deadline.
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Admits a verified webhook at most once.
    ///
    /// Only a [`VerifiedWebhook`] can be admitted, so unauthenticated input
    /// never reaches the replay store.
    ///
    /// # Errors
    ///
    /// Returns a retryable `GuardError` when the store fails or times out;
    /// the request must then not be processed.
    #[instrument(skip_all, fields(timestamp = webhook.timestamp()))]
    pub async fn admit_once(&self, webhook: &VerifiedWebhook) -> Result<Admission> {
        let inserted = bounded(
            self.timeout,
            self.store.insert_if_absent(webhook.signature().to_string(), self.clock.now_utc()),
        )
        .await?;

        let admission = if inserted { Admission::First } else { Admission::Duplicate };
        debug!(duplicate = admission.is_duplicate(), "webhook admission decided");
        Ok(admission)
    }
}
