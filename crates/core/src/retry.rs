//! Retry policy + generic executor.
//!
//! Every retryable operation in the system (order-id generation, fail-safe
//! snapshot persistence) shares this policy shape: capped exponential backoff
//! with a hard attempt limit. Exhaustion is terminal and surfaces to the
//! caller, which decides how to escalate.

use std::time::Duration;

use thiserror::Error;
use tracing::warn;

/// Retry policy configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Maximum number of attempts (the first try counts).
    pub max_attempts: u32,
    /// Base delay between retries.
    pub base_delay: Duration,
    /// Maximum delay cap.
    pub max_delay: Duration,
}

impl RetryPolicy {
    pub fn exponential(max_attempts: u32, base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_attempts,
            base_delay,
            max_delay,
        }
    }

    /// The policy used by order-id generation and fail-safe recording:
    /// 20 attempts, `min(2^n * 10ms, 1s)` between them.
    pub fn standard() -> Self {
        Self::exponential(20, Duration::from_millis(10), Duration::from_secs(1))
    }

    /// Delay before retry number `attempt` (0-indexed): `min(base * 2^attempt, max)`.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let base_ms = self.base_delay.as_millis() as u64;
        let max_ms = self.max_delay.as_millis() as u64;
        let factor = 1u64.checked_shl(attempt).unwrap_or(u64::MAX);
        Duration::from_millis(base_ms.saturating_mul(factor).min(max_ms))
    }
}

/// Terminal outcome of a retried operation.
#[derive(Debug, Error)]
pub enum RetryError<E>
where
    E: std::error::Error + 'static,
{
    #[error("retries exhausted after {attempts} attempts: {source}")]
    Exhausted {
        attempts: u32,
        #[source]
        source: E,
    },
}

impl<E> RetryError<E>
where
    E: std::error::Error + 'static,
{
    pub fn into_source(self) -> E {
        match self {
            RetryError::Exhausted { source, .. } => source,
        }
    }
}

/// Run `op` under `policy`, sleeping between attempts.
///
/// `what` names the operation in retry logs.
pub async fn run_with_retry<T, E, F, Fut>(
    policy: &RetryPolicy,
    what: &str,
    mut op: F,
) -> Result<T, RetryError<E>>
where
    E: std::error::Error + 'static,
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    let mut attempt: u32 = 0;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(err) => {
                attempt += 1;
                if attempt >= policy.max_attempts {
                    return Err(RetryError::Exhausted {
                        attempts: attempt,
                        source: err,
                    });
                }
                let delay = policy.delay_for_attempt(attempt - 1);
                warn!(
                    operation = what,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    error = %err,
                    "operation failed, retrying"
                );
                tokio::time::sleep(delay).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[derive(Debug, Error)]
    #[error("boom")]
    struct Boom;

    #[test]
    fn backoff_is_capped_exponential() {
        let policy = RetryPolicy::standard();
        assert_eq!(policy.delay_for_attempt(0), Duration::from_millis(10));
        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(20));
        assert_eq!(policy.delay_for_attempt(3), Duration::from_millis(80));
        // 2^7 * 10ms = 1280ms, capped at 1s
        assert_eq!(policy.delay_for_attempt(7), Duration::from_secs(1));
        assert_eq!(policy.delay_for_attempt(19), Duration::from_secs(1));
        // shift overflow must not panic
        assert_eq!(policy.delay_for_attempt(64), Duration::from_secs(1));
    }

    #[tokio::test(start_paused = true)]
    async fn succeeds_after_transient_failures() {
        let calls = AtomicU32::new(0);
        let policy = RetryPolicy::exponential(5, Duration::from_millis(1), Duration::from_millis(4));

        let result = run_with_retry(&policy, "test-op", || {
            let calls = &calls;
            async move {
                if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(Boom)
                } else {
                    Ok(42u32)
                }
            }
        })
        .await;

        assert_eq!(result.unwrap(), 42);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn exhaustion_reports_attempt_count() {
        let policy = RetryPolicy::exponential(3, Duration::from_millis(1), Duration::from_millis(2));

        let result: Result<(), _> =
            run_with_retry(&policy, "test-op", || async { Err::<(), _>(Boom) }).await;

        match result {
            Err(RetryError::Exhausted { attempts, .. }) => assert_eq!(attempts, 3),
            other => panic!("expected exhaustion, got {other:?}"),
        }
    }
}
