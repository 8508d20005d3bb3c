//! Fixed-delay retry.
//!
//! Health checks and status queries against a local resource do not need
//! exponential backoff or jitter: the delay between attempts is constant.

use crate::config::QueueConfig;
use crate::error::{PlexusError, Result};
use std::future::Future;
use std::time::Duration;
use tracing::{debug, warn};

/// How many times an operation is tried and how long to wait in between.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total number of tries, including the first one. Never less than 1.
    pub attempts: u32,
    /// Constant delay between two tries.
    pub fixed_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::none()
    }
}

impl RetryPolicy {
    /// Run once, never retry.
    pub fn none() -> Self {
        Self {
            attempts: 1,
            fixed_delay: Duration::ZERO,
        }
    }

    /// Retry up to `attempts` total tries with a constant delay.
    pub fn fixed(attempts: u32, fixed_delay: Duration) -> Self {
        Self {
            attempts: attempts.max(1),
            fixed_delay,
        }
    }

    /// `attempts` tries using the default queue retry delay.
    pub fn attempts(attempts: u32) -> Self {
        Self::fixed(attempts, QueueConfig::DEFAULT_RETRY_DELAY)
    }
}

/// Statistics about a retried operation.
#[derive(Debug, Clone, Default)]
pub struct RetryStats {
    /// Number of attempts made.
    pub attempts: u32,
    /// Total delay spent sleeping between attempts.
    pub total_delay: Duration,
    /// Whether the operation ultimately succeeded.
    pub success: bool,
}

/// Run `operation` until it succeeds or the policy is exhausted.
///
/// When the policy allows more than one attempt and all of them fail, the
/// last observed error is wrapped in `PlexusError::RetriesExhausted`.
pub async fn retry_fixed<F, Fut, T>(policy: &RetryPolicy, mut operation: F) -> (Result<T>, RetryStats)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let attempts = policy.attempts.max(1);
    let mut stats = RetryStats::default();

    loop {
        stats.attempts += 1;

        match operation().await {
            Ok(value) => {
                stats.success = true;
                if stats.attempts > 1 {
                    debug!("Operation succeeded after {} attempts", stats.attempts);
                }
                return (Ok(value), stats);
            }
            Err(e) if stats.attempts >= attempts => {
                if attempts == 1 {
                    return (Err(e), stats);
                }
                warn!("All {} attempts exhausted. Last error: {}", attempts, e);
                return (
                    Err(PlexusError::RetriesExhausted {
                        attempts,
                        last_error: Box::new(e),
                    }),
                    stats,
                );
            }
            Err(e) => {
                debug!(
                    "Attempt {}/{} failed: {}. Retrying in {:?}",
                    stats.attempts, attempts, e, policy.fixed_delay
                );
                stats.total_delay += policy.fixed_delay;
                tokio::time::sleep(policy.fixed_delay).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    #[test]
    fn test_policy_never_below_one_attempt() {
        assert_eq!(RetryPolicy::fixed(0, Duration::from_millis(5)).attempts, 1);
        assert_eq!(RetryPolicy::default(), RetryPolicy::none());
    }

    #[tokio::test]
    async fn test_succeeds_first_try() {
        let (result, stats) =
            retry_fixed(&RetryPolicy::attempts(3), || async { Ok::<_, PlexusError>(42) }).await;

        assert_eq!(result.unwrap(), 42);
        assert_eq!(stats.attempts, 1);
        assert_eq!(stats.total_delay, Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn test_succeeds_after_failures() {
        let counter = Arc::new(AtomicU32::new(0));
        let policy = RetryPolicy::fixed(5, Duration::from_millis(100));

        let (result, stats) = retry_fixed(&policy, || {
            let counter = counter.clone();
            async move {
                if counter.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(PlexusError::Other("not ready".into()))
                } else {
                    Ok("ready")
                }
            }
        })
        .await;

        assert_eq!(result.unwrap(), "ready");
        assert_eq!(stats.attempts, 3);
        assert_eq!(stats.total_delay, Duration::from_millis(200));
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhausted_wraps_last_error() {
        let policy = RetryPolicy::fixed(3, Duration::from_millis(50));

        let (result, stats) = retry_fixed(&policy, || async {
            Err::<(), _>(PlexusError::Other("still down".into()))
        })
        .await;

        assert_eq!(stats.attempts, 3);
        assert!(!stats.success);
        match result.unwrap_err() {
            PlexusError::RetriesExhausted {
                attempts,
                last_error,
            } => {
                assert_eq!(attempts, 3);
                assert_eq!(last_error.to_string(), "still down");
            }
            other => panic!("expected RetriesExhausted, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_single_attempt_returns_raw_error() {
        let (result, _) = retry_fixed(&RetryPolicy::none(), || async {
            Err::<(), _>(PlexusError::BackendNotRunning)
        })
        .await;

        assert!(matches!(result, Err(PlexusError::BackendNotRunning)));
    }
}
