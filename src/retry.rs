//! Bounded exponential backoff for transient failures.

use crate::errors::{ChainError, WagerError};
use rand::{Rng, RngCore};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::Duration;
use tracing::warn;

/// Retry budget for one logical operation.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
    /// Upper bound for a single external call.
    pub call_timeout_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_delay_ms: 200,
            max_delay_ms: 10_000,
            call_timeout_ms: 10_000,
        }
    }
}

impl RetryPolicy {
    pub fn call_timeout(&self) -> Duration {
        Duration::from_millis(self.call_timeout_ms)
    }

    /// Policy with no waiting between attempts, for tests.
    pub fn immediate(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            initial_delay_ms: 0,
            max_delay_ms: 0,
            call_timeout_ms: 5_000,
        }
    }
}

/// Errors that know whether another attempt may succeed.
pub trait Retryable {
    fn is_transient(&self) -> bool;
    fn timed_out(after_ms: u64) -> Self;
}

impl Retryable for ChainError {
    fn is_transient(&self) -> bool {
        ChainError::is_transient(self)
    }

    fn timed_out(after_ms: u64) -> Self {
        ChainError::Timeout(after_ms)
    }
}

impl Retryable for WagerError {
    fn is_transient(&self) -> bool {
        self.class().is_retryable()
    }

    fn timed_out(after_ms: u64) -> Self {
        WagerError::Chain(ChainError::Timeout(after_ms))
    }
}

/// "Equal jitter": the delay lands in `[backoff/2, backoff]`.
pub(crate) fn jittered_backoff(rng: &mut impl RngCore, backoff: Duration) -> Duration {
    let backoff_ms = backoff.as_millis() as u64;
    if backoff_ms <= 1 {
        return backoff;
    }

    let half_ms = backoff_ms / 2;
    let jitter_ms = rng.gen_range(0..=half_ms);
    Duration::from_millis(half_ms.saturating_add(jitter_ms))
}

/// Run one external call under the policy's timeout.
pub async fn with_timeout<T, E, Fut>(policy: &RetryPolicy, fut: Fut) -> Result<T, E>
where
    E: Retryable,
    Fut: Future<Output = Result<T, E>>,
{
    match tokio::time::timeout(policy.call_timeout(), fut).await {
        Ok(result) => result,
        Err(_) => Err(E::timed_out(policy.call_timeout_ms)),
    }
}

/// Retry `op` while it fails transiently, up to `policy.max_attempts`.
/// Non-transient failures are returned immediately.
pub async fn retry_transient<T, E, F, Fut>(policy: &RetryPolicy, operation: &str, mut op: F) -> Result<T, E>
where
    E: Retryable + std::fmt::Display,
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    let attempts = policy.max_attempts.max(1);
    let mut backoff = Duration::from_millis(policy.initial_delay_ms);
    let max_delay = Duration::from_millis(policy.max_delay_ms);

    let mut attempt = 1;
    loop {
        match with_timeout(policy, op()).await {
            Ok(value) => return Ok(value),
            Err(e) if e.is_transient() && attempt < attempts => {
                let delay = {
                    let mut rng = rand::thread_rng();
                    jittered_backoff(&mut rng, backoff)
                };
                warn!(
                    operation,
                    attempt,
                    max_attempts = attempts,
                    delay_ms = delay.as_millis() as u64,
                    error = %e,
                    "Transient failure, retrying"
                );
                tokio::time::sleep(delay).await;
                backoff = backoff.saturating_mul(2).min(max_delay);
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn test_jitter_bounds() {
        let mut rng = rand::thread_rng();
        for _ in 0..100 {
            let d = jittered_backoff(&mut rng, Duration::from_millis(100));
            assert!(d >= Duration::from_millis(50) && d <= Duration::from_millis(100));
        }
        assert_eq!(jittered_backoff(&mut rng, Duration::from_millis(1)), Duration::from_millis(1));
    }

    #[tokio::test]
    async fn test_retries_transient_until_success() {
        let calls = AtomicU32::new(0);
        let result: Result<u32, ChainError> = retry_transient(&RetryPolicy::immediate(5), "test", || {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if n < 2 {
                    Err(ChainError::Transport("reset".to_string()))
                } else {
                    Ok(n)
                }
            }
        })
        .await;
        assert_eq!(result.unwrap(), 2);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_budget_is_bounded() {
        let calls = AtomicU32::new(0);
        let result: Result<(), ChainError> = retry_transient(&RetryPolicy::immediate(3), "test", || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(ChainError::Timeout(1)) }
        })
        .await;
        assert_eq!(result.unwrap_err(), ChainError::Timeout(1));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_policy_failures_are_not_retried() {
        let calls = AtomicU32::new(0);
        let result: Result<(), ChainError> = retry_transient(&RetryPolicy::immediate(5), "test", || {
            calls.fetch_add(1, Ordering::SeqCst);
            async {
                Err(ChainError::NotOwner {
                    handle: 1,
                    caller: crate::types::Address::new("0x01"),
                })
            }
        })
        .await;
        assert!(matches!(result, Err(ChainError::NotOwner { .. })));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_slow_call_times_out() {
        let policy = RetryPolicy {
            call_timeout_ms: 10,
            ..RetryPolicy::immediate(1)
        };
        let result: Result<(), ChainError> = with_timeout(&policy, async {
            tokio::time::sleep(Duration::from_millis(200)).await;
            Ok(())
        })
        .await;
        assert_eq!(result.unwrap_err(), ChainError::Timeout(10));
    }
}
