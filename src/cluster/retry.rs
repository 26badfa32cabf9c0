//! Retry policies built on `backon`.
//!
//! Only operations that fail with a retriable [`CoordinationError`] are
//! retried. Contention outcomes (`Ok(false)` / `Ok(None)`) are returned as-is:
//! whether to try again after losing a race is the caller's decision.
//!
//! | Policy | Min Delay | Max Delay | Retries | Use Case |
//! |--------|-----------|-----------|---------|----------|
//! | `store_policy` | 50ms | 2s | 5 | join / heartbeat writes |

use std::future::Future;
use std::time::Duration;

use backon::{ExponentialBuilder, Retryable};
use tracing::debug;

use super::error::{CoordinationError, CoordinationResult};
use super::metrics::RETRY_ATTEMPTS;

/// Policy for coordination store writes.
pub fn store_policy() -> ExponentialBuilder {
    ExponentialBuilder::default()
        .with_min_delay(Duration::from_millis(50))
        .with_max_delay(Duration::from_secs(2))
        .with_max_times(5)
        .with_jitter()
}

/// Run `operation` under `policy`, retrying only retriable errors.
pub async fn retry_retriable<F, Fut, T>(
    policy_name: &'static str,
    policy: ExponentialBuilder,
    operation: F,
) -> CoordinationResult<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = CoordinationResult<T>>,
{
    let result = operation
        .retry(policy)
        .when(|e: &CoordinationError| e.is_retriable())
        .notify(|e: &CoordinationError, delay: Duration| {
            RETRY_ATTEMPTS.with_label_values(&[policy_name, "attempt"]).inc();
            debug!(policy = policy_name, error = %e, ?delay, "Retrying after error");
        })
        .await;

    let outcome = if result.is_ok() { "success" } else { "exhausted" };
    RETRY_ATTEMPTS.with_label_values(&[policy_name, outcome]).inc();
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn quick_policy() -> ExponentialBuilder {
        ExponentialBuilder::default()
            .with_min_delay(Duration::from_millis(1))
            .with_max_delay(Duration::from_millis(5))
            .with_max_times(5)
    }

    #[tokio::test]
    async fn test_retries_retriable_until_success() {
        let attempts = Arc::new(AtomicU32::new(0));
        let a = attempts.clone();

        let result = retry_retriable("test", quick_policy(), || {
            let a = a.clone();
            async move {
                if a.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(CoordinationError::Store("unavailable".into()))
                } else {
                    Ok(7)
                }
            }
        })
        .await;

        assert_eq!(result.unwrap(), 7);
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_does_not_retry_misuse() {
        let attempts = Arc::new(AtomicU32::new(0));
        let a = attempts.clone();

        let result: CoordinationResult<()> = retry_retriable("test", quick_policy(), || {
            let a = a.clone();
            async move {
                a.fetch_add(1, Ordering::SeqCst);
                Err(CoordinationError::InvalidArgument("bad".into()))
            }
        })
        .await;

        assert!(matches!(result, Err(CoordinationError::InvalidArgument(_))));
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_policies_build() {
        let _ = store_policy();
    }
}
