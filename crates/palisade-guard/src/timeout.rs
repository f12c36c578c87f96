//! Deadline wrapper for store calls.

use std::{future::Future, time::Duration};

use palisade_core::CoreError;

use crate::error::{GuardError, Result};

/// Default deadline for a single store call.
pub const DEFAULT_STORE_TIMEOUT: Duration = Duration::from_millis(2_000);

/// Runs `operation` with a deadline.
///
/// A timed-out operation is dropped. Whether its write reached the store is
/// unknown, so a timeout is a retryable failure and never a success.
///
/// # Errors
///
/// Returns `GuardError::Timeout` when the deadline passes and
/// `GuardError::Store` when the operation itself fails.
pub async fn bounded<T, F>(timeout: Duration, operation: F) -> Result<T>
where
    F: Future<Output = std::result::Result<T, CoreError>>,
{
    match tokio::time::timeout(timeout, operation).await {
        Ok(result) => result.map_err(GuardError::from),
        Err(_) => Err(GuardError::Timeout(timeout)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn fast_operations_pass_through() {
        let value = bounded(Duration::from_secs(1), async { Ok::<_, CoreError>(7) }).await;
        assert_eq!(value.unwrap(), 7);
    }

    #[tokio::test]
    async fn store_errors_are_preserved() {
        let err = bounded(Duration::from_secs(1), async {
            Err::<(), _>(CoreError::Unavailable("pool closed".into()))
        })
        .await
        .unwrap_err();
        assert!(matches!(err, GuardError::Store(CoreError::Unavailable(_))));
    }

    #[tokio::test]
    async fn slow_operations_time_out() {
        let err = bounded(Duration::from_millis(10), async {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok::<_, CoreError>(())
        })
        .await
        .unwrap_err();
        assert!(matches!(err, GuardError::Timeout(d) if d == Duration::from_millis(10)));
    }
}
