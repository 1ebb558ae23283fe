//! Retry and timeout utilities.
//!
//! The helpers in this module are transport-agnostic. The stream client uses
//! them for bounded reconnect rounds and the refresh coordinator uses
//! [`with_timeout`] to cap the refresh call.

use std::future::Future;
use std::time::Duration;

use tracing::debug;

/// Policy controlling retry attempts with a fixed delay between them.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Maximum number of attempts including the first attempt.
    pub max_attempts: usize,
    /// Delay applied before every retry.
    pub delay: Duration,
}

impl RetryPolicy {
    /// Creates a policy with `max_attempts` attempts spaced by `delay`.
    pub fn fixed(max_attempts: usize, delay: Duration) -> Self {
        Self {
            max_attempts,
            delay,
        }
    }

    /// Default policy for websocket reconnect rounds.
    pub fn reconnect() -> Self {
        Self::fixed(5, Duration::from_secs(2))
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::reconnect()
    }
}

/// Executes an async operation with retry behavior controlled by `policy`.
///
/// `op` receives the 1-based attempt number and must return a future that
/// resolves to the operation result. `should_retry` determines whether each
/// error is retryable.
pub async fn retry_async<T, E, Op, Fut, ShouldRetry>(
    policy: &RetryPolicy,
    mut op: Op,
    mut should_retry: ShouldRetry,
) -> Result<T, E>
where
    Op: FnMut(usize) -> Fut,
    Fut: Future<Output = Result<T, E>>,
    ShouldRetry: FnMut(&E) -> bool,
{
    let max_attempts = policy.max_attempts.max(1);
    let mut attempt = 1;

    loop {
        match op(attempt).await {
            Ok(value) => return Ok(value),
            Err(error) => {
                if attempt >= max_attempts || !should_retry(&error) {
                    return Err(error);
                }

                debug!(
                    event = "retry_attempt_failed",
                    attempt,
                    max_attempts,
                    delay_ms = policy.delay.as_millis() as u64
                );
                if !policy.delay.is_zero() {
                    tokio::time::sleep(policy.delay).await;
                }
                attempt += 1;
            }
        }
    }
}

/// Applies a timeout to an async computation.
pub async fn with_timeout<T, Fut>(
    timeout: Duration,
    future: Fut,
) -> Result<T, tokio::time::error::Elapsed>
where
    Fut: Future<Output = T>,
{
    tokio::time::timeout(timeout, future).await
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    use tokio::time::Instant;

    use super::{retry_async, with_timeout, RetryPolicy};

    #[derive(Debug, PartialEq)]
    enum Dial {
        Refused,
        Forbidden,
    }

    #[tokio::test(start_paused = true)]
    async fn reconnect_round_waits_fixed_delay_between_attempts() {
        let attempts = Arc::new(Mutex::new(Vec::new()));
        let started = Instant::now();
        let policy = RetryPolicy::fixed(3, Duration::from_secs(2));

        let socket = retry_async(
            &policy,
            |attempt| {
                let attempts = Arc::clone(&attempts);
                async move {
                    attempts.lock().expect("lock").push(attempt);
                    if attempt < 3 {
                        Err(Dial::Refused)
                    } else {
                        Ok("socket")
                    }
                }
            },
            |_| true,
        )
        .await;

        assert_eq!(socket, Ok("socket"));
        assert_eq!(*attempts.lock().expect("lock"), vec![1, 2, 3]);
        assert_eq!(started.elapsed(), Duration::from_secs(4));
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_round_returns_last_error() {
        let policy = RetryPolicy::fixed(4, Duration::from_millis(10));
        let mut dials = 0;

        let result: Result<(), Dial> = retry_async(
            &policy,
            |_| {
                dials += 1;
                async { Err(Dial::Refused) }
            },
            |_| true,
        )
        .await;

        assert_eq!(result, Err(Dial::Refused));
        assert_eq!(dials, 4);
    }

    #[tokio::test]
    async fn non_retryable_error_ends_round_immediately() {
        let policy = RetryPolicy::fixed(5, Duration::from_secs(60));
        let mut dials = 0;

        let result: Result<(), Dial> = retry_async(
            &policy,
            |_| {
                dials += 1;
                async { Err(Dial::Forbidden) }
            },
            |err| *err == Dial::Refused,
        )
        .await;

        assert_eq!(result, Err(Dial::Forbidden));
        assert_eq!(dials, 1);
    }

    #[test]
    fn default_policy_is_the_reconnect_policy() {
        assert_eq!(RetryPolicy::default(), RetryPolicy::reconnect());
        assert_eq!(RetryPolicy::reconnect().max_attempts, 5);
    }

    #[tokio::test(start_paused = true)]
    async fn timeout_elapses_for_slow_future() {
        let result = with_timeout(
            Duration::from_millis(50),
            tokio::time::sleep(Duration::from_secs(1)),
        )
        .await;
        assert!(result.is_err());
    }
}
