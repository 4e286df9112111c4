//! Retry policy for establishing transactions
//!
//! Only temporary errors are retried. The delay doubles with every attempt
//! and is spread by a random jitter of at most the initial delay.

use crate::error::{CoordinatorError, Result};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::Duration;

/// Bounded exponential backoff
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Attempts including the first one
    pub max_attempts: u32,
    pub initial_delay: Duration,
    /// Upper bound of the random spread; capped at `initial_delay`
    pub jitter: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_delay: Duration::from_millis(10),
            jitter: Duration::from_millis(5),
        }
    }
}

impl RetryPolicy {
    pub fn for_testing() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_millis(1),
            jitter: Duration::from_millis(1),
        }
    }

    /// Delay before retry number `attempt` (zero-based)
    pub fn delay_for(&self, attempt: u32) -> Duration {
        exponential_delay_with_jitter(self.initial_delay, self.jitter, attempt)
    }

    /// Run `op` until it succeeds, fails permanently or runs out of attempts
    pub async fn run<T, F, Fut>(&self, mut op: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let max_attempts = self.max_attempts.max(1);
        let mut attempt = 0;
        loop {
            match op().await {
                Ok(value) => return Ok(value),
                Err(e) if e.is_retryable() => {
                    attempt += 1;
                    if attempt >= max_attempts {
                        return Err(CoordinatorError::Exhausted {
                            attempts: attempt,
                            last: Box::new(e),
                        });
                    }
                    let delay = self.delay_for(attempt - 1);
                    tracing::debug!(
                        "Attempt {} of {} failed ({}), retrying in {:?}",
                        attempt,
                        max_attempts,
                        e,
                        delay
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

/// `initial * 2^attempt`, moved up or down by a random amount of at most
/// `min(jitter, initial)`
pub fn exponential_delay_with_jitter(initial: Duration, jitter: Duration, attempt: u32) -> Duration {
    let base = initial.saturating_mul(2u32.saturating_pow(attempt.min(16)));
    let spread = jitter.min(initial).as_micros() as i64;
    if spread == 0 {
        return base;
    }
    let offset = rand::thread_rng().gen_range(-spread..=spread);
    if offset >= 0 {
        base.saturating_add(Duration::from_micros(offset as u64))
    } else {
        base.saturating_sub(Duration::from_micros(offset.unsigned_abs()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn test_delay_doubles_within_jitter() {
        let initial = Duration::from_millis(10);
        let jitter = Duration::from_millis(4);
        for attempt in 0..5 {
            let base = initial * 2u32.pow(attempt);
            for _ in 0..20 {
                let delay = exponential_delay_with_jitter(initial, jitter, attempt);
                assert!(delay >= base - jitter && delay <= base + jitter);
            }
        }
    }

    #[test]
    fn test_jitter_is_capped_at_initial_delay() {
        let initial = Duration::from_millis(2);
        for _ in 0..20 {
            let delay = exponential_delay_with_jitter(initial, Duration::from_secs(1), 0);
            assert!(delay <= Duration::from_millis(4));
        }
        assert_eq!(
            exponential_delay_with_jitter(initial, Duration::ZERO, 3),
            Duration::from_millis(16)
        );
    }

    #[tokio::test]
    async fn test_retries_temporary_errors_only() {
        let policy = RetryPolicy::for_testing();
        let calls = AtomicU32::new(0);

        let result: Result<()> = policy
            .run(|| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(CoordinatorError::PoolExhausted { capacity: 1 }) }
            })
            .await;
        assert!(matches!(
            result,
            Err(CoordinatorError::Exhausted { attempts: 3, .. })
        ));
        assert_eq!(calls.load(Ordering::SeqCst), 3);

        calls.store(0, Ordering::SeqCst);
        let result: Result<()> = policy
            .run(|| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(CoordinatorError::Halted("stopped".to_string())) }
            })
            .await;
        assert!(matches!(result, Err(CoordinatorError::Halted(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_succeeds_after_transient_failure() {
        let policy = RetryPolicy::for_testing();
        let calls = AtomicU32::new(0);
        let result = policy
            .run(|| {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    if n == 0 {
                        Err(CoordinatorError::ReplicaUnavailable(kestrel_common::NodeId(2)))
                    } else {
                        Ok(n)
                    }
                }
            })
            .await;
        assert_eq!(result, Ok(1));
    }
}
