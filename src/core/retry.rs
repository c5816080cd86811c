//! The one retry policy every network call goes through.

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use super::error::TransferError;

/// Decides whether a failed attempt may be repeated.
pub type RetryPredicate = fn(&TransferError) -> bool;

/// Exponential backoff with a capped delay and an attempt ceiling.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Total attempts including the first one.
    pub max_attempts: u32,
    /// Delay after the first failed attempt; doubled for each later one.
    pub base_delay: Duration,
    pub max_delay: Duration,
    /// Up to this fraction of the delay is added at random (0.0 disables).
    pub jitter_factor: f64,
    pub retryable: RetryPredicate,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(10),
            jitter_factor: 0.2,
            retryable: TransferError::is_retryable,
        }
    }
}

impl RetryPolicy {
    /// Delay before attempt `failed_attempt + 1`.
    pub fn delay_for(&self, failed_attempt: u32) -> Duration {
        let multiplier = 2u32
            .checked_pow(failed_attempt.saturating_sub(1))
            .unwrap_or(u32::MAX);
        let capped = self.base_delay.saturating_mul(multiplier).min(self.max_delay);

        if self.jitter_factor > 0.0 {
            let jitter = rand::rng().random_range(0.0..self.jitter_factor);
            capped + Duration::from_secs_f64(capped.as_secs_f64() * jitter)
        } else {
            capped
        }
    }

    /// Run `op` until it succeeds, fails permanently, runs out of attempts or
    /// `cancel` fires during a backoff wait. The last error is returned.
    ///
    /// `op` receives the 1-based attempt number.
    pub async fn run<T, F, Fut>(
        &self,
        operation: &str,
        cancel: &CancellationToken,
        mut op: F,
    ) -> Result<T, TransferError>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, TransferError>>,
    {
        let max_attempts = self.max_attempts.max(1);
        let mut attempt = 1;

        loop {
            match op(attempt).await {
                Ok(value) => return Ok(value),
                Err(err) if attempt < max_attempts && (self.retryable)(&err) => {
                    let delay = self.delay_for(attempt);
                    warn!(
                        operation,
                        attempt,
                        max_attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "Transient failure, retrying"
                    );

                    tokio::select! {
                        biased;
                        _ = cancel.cancelled() => return Err(TransferError::Cancelled),
                        _ = sleep(delay) => {}
                    }
                    attempt += 1;
                }
                Err(err) => return Err(err),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn fast_policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(5),
            jitter_factor: 0.0,
            ..Default::default()
        }
    }

    #[test]
    fn delays_double_and_cap() {
        let policy = RetryPolicy {
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(350),
            jitter_factor: 0.0,
            ..Default::default()
        };
        assert_eq!(policy.delay_for(1), Duration::from_millis(100));
        assert_eq!(policy.delay_for(2), Duration::from_millis(200));
        assert_eq!(policy.delay_for(3), Duration::from_millis(350));
        assert_eq!(policy.delay_for(40), Duration::from_millis(350));
    }

    #[test]
    fn jitter_stays_within_factor() {
        let policy = RetryPolicy {
            base_delay: Duration::from_millis(100),
            jitter_factor: 0.5,
            ..Default::default()
        };
        for _ in 0..50 {
            let delay = policy.delay_for(1);
            assert!(delay >= Duration::from_millis(100));
            assert!(delay <= Duration::from_millis(150));
        }
    }

    #[tokio::test]
    async fn transient_errors_are_retried_until_success() {
        let calls = Arc::new(AtomicU32::new(0));
        let result = fast_policy(3)
            .run("test", &CancellationToken::new(), |attempt| {
                let calls = calls.clone();
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    if attempt < 3 {
                        Err(TransferError::Remote {
                            status: 503,
                            message: "busy".into(),
                        })
                    } else {
                        Ok(attempt)
                    }
                }
            })
            .await;

        assert_eq!(result, Ok(3));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn last_error_is_kept_when_attempts_run_out() {
        let result: Result<(), _> = fast_policy(2)
            .run("test", &CancellationToken::new(), |attempt| async move {
                Err(TransferError::Network(format!("attempt {attempt}")))
            })
            .await;

        assert_eq!(result, Err(TransferError::Network("attempt 2".into())));
    }

    #[tokio::test]
    async fn permanent_errors_fail_immediately() {
        let calls = AtomicU32::new(0);
        let result: Result<(), _> = fast_policy(5)
            .run("test", &CancellationToken::new(), |_| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(TransferError::Unauthorized { status: 401 }) }
            })
            .await;

        assert_eq!(result, Err(TransferError::Unauthorized { status: 401 }));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn cancellation_interrupts_backoff() {
        let policy = RetryPolicy {
            base_delay: Duration::from_secs(60),
            jitter_factor: 0.0,
            ..Default::default()
        };
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            sleep(Duration::from_millis(10)).await;
            trigger.cancel();
        });

        let result: Result<(), _> = policy
            .run("test", &cancel, |_| async {
                Err(TransferError::Timeout { secs: 30 })
            })
            .await;
        assert_eq!(result, Err(TransferError::Cancelled));
    }
}
