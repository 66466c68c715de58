//! # Retry policy for Http steps (§4.4)
//!
//! A retry policy is attached to an `HttpStep`, not to the scenario as a
//! whole — only Http calls retry; Wait already polls on its own schedule and
//! Assert/Branch never retry. Every attempt is recorded as an `AttemptRecord`
//! so the artifact store keeps a full trail even when the step eventually
//! succeeds.
//!
//! Two strategies: `fixed` waits `delay_ms` between every attempt; `exponential`
//! multiplies the delay by `factor` each time, capped at `cap_ms` when given.

use std::time::Duration;

use tokio::time::sleep;
use tracing::warn;

use crate::errors::ObservedError;
use crate::model::{AttemptRecord, RetryPolicy, RetryStrategy};

/// Runs `attempt` up to `policy.attempts` times (or once, if `policy` is
/// `None`), returning the last outcome and the full list of attempts made.
pub async fn run_with_retry<F, Fut, T>(
    policy: Option<&RetryPolicy>,
    mut attempt: F,
) -> (Result<T, ObservedError>, Vec<AttemptRecord>)
where
    F: FnMut(u32) -> Fut,
    Fut: std::future::Future<Output = (Result<T, ObservedError>, f64, Option<u16>)>,
{
    let max_attempts = policy.map(|p| p.attempts).unwrap_or(1).max(1);
    let mut delay_ms = policy.map(|p| p.delay_ms).unwrap_or(0);
    let mut records = Vec::new();

    for attempt_index in 0..max_attempts {
        let (result, latency_ms, status_code) = attempt(attempt_index).await;
        let ok = result.is_ok();
        records.push(AttemptRecord {
            attempt_index,
            ok,
            latency_ms,
            status_code,
            error: result.as_ref().err().cloned(),
        });

        if ok {
            return (result, records);
        }

        let is_last = attempt_index + 1 >= max_attempts;
        if is_last {
            return (result, records);
        }

        if let Some(policy) = policy {
            warn!(
                attempt = attempt_index,
                max_attempts,
                delay_ms,
                "http step attempt failed, retrying"
            );
            sleep(Duration::from_millis(delay_ms)).await;
            if matches!(policy.strategy, RetryStrategy::Exponential) {
                let factor = policy.factor.unwrap_or(2.0);
                let next = (delay_ms as f64 * factor) as u64;
                delay_ms = match policy.cap_ms {
                    Some(cap) => next.min(cap),
                    None => next,
                };
            }
        }
    }

    unreachable!("loop always returns on the final attempt")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::ErrorKind;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    fn policy(strategy: RetryStrategy, attempts: u32) -> RetryPolicy {
        RetryPolicy {
            strategy,
            attempts,
            delay_ms: 1,
            factor: Some(2.0),
            cap_ms: Some(10),
        }
    }

    #[tokio::test]
    async fn no_policy_attempts_exactly_once() {
        let calls = Arc::new(AtomicU32::new(0));
        let calls_clone = calls.clone();
        let (result, records) = run_with_retry(None, move |_i| {
            let calls = calls_clone.clone();
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                (Err::<(), ObservedError>(ObservedError::new(ErrorKind::Transport, "boom")), 1.0, None)
            }
        })
        .await;

        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(records.len(), 1);
    }

    #[tokio::test]
    async fn retries_until_success_and_records_every_attempt() {
        let calls = Arc::new(AtomicU32::new(0));
        let calls_clone = calls.clone();
        let p = policy(RetryStrategy::Fixed, 3);

        let (result, records) = run_with_retry(Some(&p), move |_i| {
            let calls = calls_clone.clone();
            async move {
                let current = calls.fetch_add(1, Ordering::SeqCst);
                if current < 2 {
                    (Err(ObservedError::new(ErrorKind::Transport, "boom")), 1.0, None)
                } else {
                    (Ok(()), 1.0, Some(200))
                }
            }
        })
        .await;

        assert!(result.is_ok());
        assert_eq!(records.len(), 3);
        assert!(records.last().unwrap().ok);
    }

    #[tokio::test]
    async fn exhausts_all_attempts_and_returns_last_error() {
        let p = policy(RetryStrategy::Exponential, 2);
        let (result, records) = run_with_retry(Some(&p), |_i| async {
            (
                Err::<(), ObservedError>(ObservedError::new(ErrorKind::Timeout, "still failing")),
                1.0,
                None,
            )
        })
        .await;

        assert!(result.is_err());
        assert_eq!(records.len(), 2);
    }
}
