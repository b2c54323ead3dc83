// Bounded retry with a fixed delay between attempts

use std::future::Future;
use std::time::{Duration, Instant};

use tracing::debug;

/// How many times to run an action and how long to wait in between
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts, including the first one. Zero is treated as one.
    pub max_attempts: u32,
    pub delay: Duration,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, delay: Duration) -> Self {
        RetryPolicy {
            max_attempts: max_attempts.max(1),
            delay,
        }
    }

    /// A single attempt, no waiting
    pub fn once() -> Self {
        RetryPolicy::new(1, Duration::ZERO)
    }
}

/// Decision taken after each attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    /// The attempt satisfied the success predicate
    Accept,
    /// Try again if attempts remain
    Retry,
    /// Stop now; further attempts cannot help
    GiveUp,
}

/// Result of a retried operation
#[derive(Debug)]
pub enum RetryOutcome<T, E> {
    Succeeded {
        value: T,
        attempts: u32,
        elapsed: Duration,
    },
    /// Every attempt was made and none was accepted
    Exhausted {
        last: Result<T, E>,
        attempts: u32,
        elapsed: Duration,
    },
    /// The verdict stopped retrying before attempts ran out
    Aborted {
        last: Result<T, E>,
        attempts: u32,
        elapsed: Duration,
    },
}

impl<T, E> RetryOutcome<T, E> {
    pub fn attempts(&self) -> u32 {
        match self {
            RetryOutcome::Succeeded { attempts, .. }
            | RetryOutcome::Exhausted { attempts, .. }
            | RetryOutcome::Aborted { attempts, .. } => *attempts,
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, RetryOutcome::Succeeded { .. })
    }

    /// The final attempt's result, whatever the outcome
    pub fn into_last(self) -> Result<T, E> {
        match self {
            RetryOutcome::Succeeded { value, .. } => Ok(value),
            RetryOutcome::Exhausted { last, .. } | RetryOutcome::Aborted { last, .. } => last,
        }
    }
}

/// Run `action` until `judge` accepts its result or attempts run out
///
/// `action` receives the 1-based attempt number. The delay is slept between
/// attempts only, never after the final one.
pub async fn retry<T, E, F, Fut, J>(
    policy: &RetryPolicy,
    mut action: F,
    mut judge: J,
) -> RetryOutcome<T, E>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, E>>,
    J: FnMut(&Result<T, E>) -> Verdict,
{
    let start = Instant::now();
    let max_attempts = policy.max_attempts.max(1);
    let mut attempt = 1;

    loop {
        let result = action(attempt).await;

        match judge(&result) {
            Verdict::Accept => {
                if let Ok(value) = result {
                    return RetryOutcome::Succeeded {
                        value,
                        attempts: attempt,
                        elapsed: start.elapsed(),
                    };
                }
                // An accepted error is still an error
                return RetryOutcome::Aborted {
                    last: result,
                    attempts: attempt,
                    elapsed: start.elapsed(),
                };
            }
            Verdict::GiveUp => {
                return RetryOutcome::Aborted {
                    last: result,
                    attempts: attempt,
                    elapsed: start.elapsed(),
                };
            }
            Verdict::Retry if attempt >= max_attempts => {
                return RetryOutcome::Exhausted {
                    last: result,
                    attempts: attempt,
                    elapsed: start.elapsed(),
                };
            }
            Verdict::Retry => {
                debug!(
                    attempt,
                    max_attempts,
                    delay_ms = policy.delay.as_millis() as u64,
                    "attempt not accepted, retrying"
                );
                if !policy.delay.is_zero() {
                    tokio::time::sleep(policy.delay).await;
                }
                attempt += 1;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    fn accept_ok<T, E>(result: &Result<T, E>) -> Verdict {
        if result.is_ok() {
            Verdict::Accept
        } else {
            Verdict::Retry
        }
    }

    #[tokio::test]
    async fn test_never_succeeding_action_runs_max_attempts() {
        let calls = Arc::new(AtomicU32::new(0));
        let policy = RetryPolicy::new(4, Duration::ZERO);

        let outcome = retry(
            &policy,
            |_| {
                let calls = calls.clone();
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Err::<(), _>("lock held")
                }
            },
            accept_ok,
        )
        .await;

        assert_eq!(calls.load(Ordering::SeqCst), 4);
        assert_eq!(outcome.attempts(), 4);
        assert!(matches!(
            outcome,
            RetryOutcome::Exhausted {
                last: Err("lock held"),
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_success_on_attempt_k_stops_early() {
        let calls = Arc::new(AtomicU32::new(0));
        let policy = RetryPolicy::new(5, Duration::ZERO);

        let outcome = retry(
            &policy,
            |attempt| {
                let calls = calls.clone();
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    if attempt == 3 {
                        Ok(attempt)
                    } else {
                        Err("not ready")
                    }
                }
            },
            accept_ok,
        )
        .await;

        assert_eq!(calls.load(Ordering::SeqCst), 3);
        match outcome {
            RetryOutcome::Succeeded {
                value, attempts, ..
            } => {
                assert_eq!(value, 3);
                assert_eq!(attempts, 3);
            }
            other => panic!("expected success, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_predicate_over_ok_values() {
        let policy = RetryPolicy::new(5, Duration::ZERO);

        let outcome = retry(
            &policy,
            |attempt| async move { Ok::<_, ()>(attempt * 10) },
            |result| match result {
                Ok(v) if *v >= 20 => Verdict::Accept,
                _ => Verdict::Retry,
            },
        )
        .await;

        assert!(outcome.is_success());
        assert_eq!(outcome.attempts(), 2);
    }

    #[tokio::test]
    async fn test_give_up_aborts_immediately() {
        let policy = RetryPolicy::new(5, Duration::from_secs(60));

        let outcome = retry(
            &policy,
            |_| async { Err::<(), _>("fatal") },
            |_| Verdict::GiveUp,
        )
        .await;

        assert_eq!(outcome.attempts(), 1);
        assert!(matches!(outcome, RetryOutcome::Aborted { .. }));
    }

    #[tokio::test]
    async fn test_fixed_delay_between_attempts_only() {
        let policy = RetryPolicy::new(3, Duration::from_millis(20));
        let start = Instant::now();

        let outcome = retry(&policy, |_| async { Err::<(), _>(()) }, accept_ok).await;

        let elapsed = start.elapsed();
        assert_eq!(outcome.attempts(), 3);
        // Two sleeps for three attempts
        assert!(elapsed >= Duration::from_millis(40));
        assert!(elapsed < Duration::from_millis(1000));
    }

    #[test]
    fn test_zero_attempts_means_one() {
        assert_eq!(RetryPolicy::new(0, Duration::ZERO).max_attempts, 1);
        assert_eq!(RetryPolicy::once().max_attempts, 1);
    }
}
