// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Retry Policy
//!
//! A retry policy is a maximum number of attempts plus a backoff function. The
//! same driver is used for connecting to the broker and for publishing, so the
//! policy can be exercised without any I/O.

use std::{fmt::Display, future::Future, time::Duration};
use tracing::warn;

/// How long to wait after a failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backoff {
    /// `base * failed_attempts`
    Linear { base: Duration },
    /// `base * 2^(failed_attempts - 1)`, never longer than `cap`
    Exponential { base: Duration, cap: Duration },
}

impl Backoff {
    /// Returns the delay to apply after the given number of failed attempts (1-based).
    pub fn delay(&self, failed_attempts: u32) -> Duration {
        match *self {
            Backoff::Linear { base } => base.saturating_mul(failed_attempts),
            Backoff::Exponential { base, cap } => {
                let exponent = failed_attempts.saturating_sub(1).min(31);
                base.saturating_mul(1u32 << exponent).min(cap)
            }
        }
    }
}

/// Configuration for retrying an operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub backoff: Backoff,
}

impl RetryPolicy {
    /// Creates a new retry policy. At least one attempt is always made.
    pub fn new(max_attempts: u32, backoff: Backoff) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            backoff,
        }
    }

    /// Policy used when connecting to the broker: 5 attempts, 1s doubling up to 30s.
    pub fn connect_default() -> Self {
        Self::new(
            5,
            Backoff::Exponential {
                base: Duration::from_secs(1),
                cap: Duration::from_secs(30),
            },
        )
    }

    /// Policy used when publishing: 5 attempts, 500ms more after every failure.
    pub fn publish_default() -> Self {
        Self::new(
            5,
            Backoff::Linear {
                base: Duration::from_millis(500),
            },
        )
    }
}

/// The value produced by a successful attempt and how many attempts it took.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Attempted<T> {
    pub value: T,
    pub attempts: u32,
}

/// The last error seen once every attempt failed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Exhausted<E> {
    pub last_error: E,
    pub attempts: u32,
}

/// Runs `op` until it succeeds or the policy runs out of attempts.
///
/// `op` receives the 1-based attempt number. The backoff delay is applied
/// between attempts only, never after the last one.
pub async fn retry<T, E, F, Fut>(
    policy: &RetryPolicy,
    operation: &str,
    op: F,
) -> Result<Attempted<T>, Exhausted<E>>
where
    E: Display,
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    retry_if(policy, operation, |_| true, op).await
}

/// Like `retry`, but gives up as soon as `retryable` returns false for an error.
///
/// # Parameters
/// * `policy` - Maximum attempts and backoff between them
/// * `operation` - Name used in the retry logs
/// * `retryable` - Whether an error is worth another attempt
/// * `op` - The operation, called with the 1-based attempt number
///
/// # Returns
/// The first successful value, or the last error with the number of attempts made
pub async fn retry_if<T, E, P, F, Fut>(
    policy: &RetryPolicy,
    operation: &str,
    retryable: P,
    mut op: F,
) -> Result<Attempted<T>, Exhausted<E>>
where
    E: Display,
    P: Fn(&E) -> bool,
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    let mut attempt = 1;

    loop {
        match op(attempt).await {
            Ok(value) => {
                return Ok(Attempted {
                    value,
                    attempts: attempt,
                })
            }
            Err(err) if attempt >= policy.max_attempts || !retryable(&err) => {
                return Err(Exhausted {
                    last_error: err,
                    attempts: attempt,
                })
            }
            Err(err) => {
                let delay = policy.backoff.delay(attempt);
                warn!(
                    operation,
                    attempt,
                    max_attempts = policy.max_attempts,
                    error = %err,
                    "attempt failed, retrying in {:?}",
                    delay
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn fast_policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy::new(
            max_attempts,
            Backoff::Linear {
                base: Duration::from_millis(1),
            },
        )
    }

    #[test]
    fn linear_backoff_grows_with_each_failure() {
        let backoff = Backoff::Linear {
            base: Duration::from_millis(300),
        };
        assert_eq!(backoff.delay(1), Duration::from_millis(300));
        assert_eq!(backoff.delay(3), Duration::from_millis(900));
    }

    #[test]
    fn exponential_backoff_doubles_and_caps() {
        let backoff = Backoff::Exponential {
            base: Duration::from_secs(1),
            cap: Duration::from_secs(10),
        };
        assert_eq!(backoff.delay(1), Duration::from_secs(1));
        assert_eq!(backoff.delay(2), Duration::from_secs(2));
        assert_eq!(backoff.delay(4), Duration::from_secs(8));
        assert_eq!(backoff.delay(5), Duration::from_secs(10));
        assert_eq!(backoff.delay(64), Duration::from_secs(10));
    }

    #[test]
    fn policy_always_allows_one_attempt() {
        let policy = RetryPolicy::new(0, Backoff::Linear { base: Duration::ZERO });
        assert_eq!(policy.max_attempts, 1);
    }

    #[tokio::test]
    async fn succeeds_after_transient_failures() {
        let calls = AtomicU32::new(0);

        let result = retry(&fast_policy(5), "test", |_| {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if n < 2 {
                    Err("unreachable")
                } else {
                    Ok("done")
                }
            }
        })
        .await;

        assert_eq!(
            result,
            Ok(Attempted {
                value: "done",
                attempts: 3
            })
        );
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn stops_after_max_attempts_with_the_last_error() {
        let calls = AtomicU32::new(0);

        let result: Result<Attempted<()>, _> = retry(&fast_policy(4), "test", |attempt| {
            calls.fetch_add(1, Ordering::SeqCst);
            async move { Err(format!("failure #{attempt}")) }
        })
        .await;

        assert_eq!(
            result,
            Err(Exhausted {
                last_error: "failure #4".to_owned(),
                attempts: 4
            })
        );
        assert_eq!(calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn non_retryable_error_stops_at_the_first_attempt() {
        let calls = AtomicU32::new(0);

        let result: Result<Attempted<()>, _> = retry_if(
            &fast_policy(5),
            "test",
            |err: &String| err != "fatal",
            |_| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err("fatal".to_owned()) }
            },
        )
        .await;

        assert_eq!(
            result,
            Err(Exhausted {
                last_error: "fatal".to_owned(),
                attempts: 1
            })
        );
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
