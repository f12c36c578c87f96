//! Store-backed request guards for the palisade middleware.
//!
//! Three guards sit between the HTTP surface and the backing store:
//!
//! 1. **Idempotency** - [`IdempotencyGuard::admit_once`] admits a verified
//!    webhook exactly once using an atomic insert-if-absent.
//! 2. **Rate limiting** - [`RateLimiter::check`] enforces a fixed-window
//!    ceiling per tenant and credential with an atomic upsert-and-count.
//! 3. **Audit** - [`AuditLogger`] validates and appends hash-chained audit
//!    entries.
//!
//! Every store call carries a deadline; a timeout is reported as a
//! retryable error, never as success. Store access goes through the traits
//! in [`storage`], with a PostgreSQL adapter for production and an
//! in-memory mock for tests.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod audit;
pub mod error;
pub mod idempotency;
pub mod rate_limit;
pub mod storage;
pub mod timeout;

pub use audit::{AuditLogger, AuditMode};
pub use error::{AuditError, GuardError, Result};
pub use idempotency::{Admission, IdempotencyGuard};
pub use rate_limit::{FailureMode, RateDecision, RateLimiter};
pub use storage::{AuditStore, IdempotencyStore, PostgresGuardStorage, RateLimitStore};
