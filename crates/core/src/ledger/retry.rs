//! Retrying ledger writes that lost a race.

use std::future::Future;

use tracing::warn;

use super::error::LedgerError;

/// Runs `operation` until it succeeds, fails with a non-retryable error, or
/// `max_attempts` attempts have been made.
///
/// Each attempt must open its own transaction; a conflicting attempt has
/// already been rolled back when its error reaches this loop.
pub async fn with_retry<T, F, Fut>(
    max_attempts: u32,
    label: &str,
    mut operation: F,
) -> Result<T, LedgerError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, LedgerError>>,
{
    let max_attempts = max_attempts.max(1);
    let mut attempt = 1;
    loop {
        match operation().await {
            Err(err) if err.is_retryable() && attempt < max_attempts => {
                warn!(
                    operation = label,
                    attempt,
                    error = %err,
                    "Ledger write conflicted, retrying"
                );
                attempt += 1;
            }
            result => return result,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test]
    async fn test_retries_conflicts_until_success() {
        let calls = &AtomicU32::new(0);
        let result = with_retry(3, "test", move || async move {
            if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                Err(LedgerError::ConcurrencyConflict("40001".into()))
            } else {
                Ok(7)
            }
        })
        .await;

        assert_eq!(result.unwrap(), 7);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_gives_up_after_max_attempts() {
        let calls = &AtomicU32::new(0);
        let result: Result<(), _> = with_retry(2, "test", move || async move {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(LedgerError::ConcurrencyConflict("40P01".into()))
        })
        .await;

        assert!(matches!(result, Err(LedgerError::ConcurrencyConflict(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_does_not_retry_other_errors() {
        let calls = &AtomicU32::new(0);
        let result: Result<(), _> = with_retry(5, "test", move || async move {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(LedgerError::MissingParty)
        })
        .await;

        assert!(matches!(result, Err(LedgerError::MissingParty)));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
