//! Bounded retry with clamped exponential backoff.

use std::fmt;
use std::future::Future;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::errors::{ErrorCategory, TransferError, TransferResult};

/// Decides whether an error deserves another attempt.
pub type RetryPredicate = fn(&TransferError) -> bool;

#[derive(Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub retryable: RetryPredicate,
}

impl fmt::Debug for RetryPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RetryPolicy")
            .field("max_attempts", &self.max_attempts)
            .field("base_delay", &self.base_delay)
            .field("max_delay", &self.max_delay)
            .finish_non_exhaustive()
    }
}

impl RetryPolicy {
    /// Backoff for provider quota exhaustion.
    pub fn quota(max_attempts: u32, base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            base_delay,
            max_delay: max_delay.max(base_delay),
            retryable: TransferError::is_quota,
        }
    }

    /// One resubmission after a sink slow-down, waiting as long as the sink asked.
    pub fn rate_limit() -> Self {
        Self {
            max_attempts: 2,
            base_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            retryable: TransferError::is_rate_limited,
        }
    }

    pub fn never() -> Self {
        Self {
            max_attempts: 1,
            base_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            retryable: |_| false,
        }
    }

    /// Wait before attempt `attempt + 1`, where `attempt` counts from 1.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(31);
        let raw = self.base_delay.saturating_mul(1u32 << exponent);
        raw.clamp(self.base_delay, self.max_delay.max(self.base_delay))
    }

    /// The full backoff schedule, one entry per retry.
    pub fn delays(&self) -> impl Iterator<Item = Duration> + '_ {
        (1..self.max_attempts).map(|attempt| self.delay_for(attempt))
    }

    pub fn should_retry(&self, err: &TransferError, attempt: u32) -> bool {
        attempt < self.max_attempts
            && err.category() == ErrorCategory::Retryable
            && (self.retryable)(err)
    }

    /// Run `op` until it succeeds, fails with a non-retryable error or runs out of attempts.
    ///
    /// Errors carrying their own wait (sink rate limits) override the computed delay.
    /// Cancellation interrupts backoff sleeps.
    pub async fn run<T, F, Fut>(
        &self,
        label: &str,
        cancel: &CancellationToken,
        mut op: F,
    ) -> TransferResult<T>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = TransferResult<T>>,
    {
        let mut attempt = 1;
        loop {
            if cancel.is_cancelled() {
                return Err(TransferError::Cancelled);
            }
            let err = match op(attempt).await {
                Ok(value) => return Ok(value),
                Err(err) => err,
            };
            if !self.should_retry(&err, attempt) {
                return Err(err);
            }

            let wait = err.retry_after().unwrap_or_else(|| self.delay_for(attempt));
            log::warn!(
                "{label}: attempt {attempt}/{} failed ({err}); retrying in {wait:?}",
                self.max_attempts
            );
            tokio::select! {
                _ = cancel.cancelled() => return Err(TransferError::Cancelled),
                _ = tokio::time::sleep(wait) => {}
            }
            attempt += 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn delays_double_and_clamp() {
        let policy = RetryPolicy::quota(5, Duration::from_secs(60), Duration::from_secs(600));
        let delays: Vec<u64> = policy.delays().map(|d| d.as_secs()).collect();
        assert_eq!(delays, vec![60, 120, 240, 480]);

        let capped = RetryPolicy::quota(7, Duration::from_secs(60), Duration::from_secs(600));
        assert_eq!(capped.delay_for(6), Duration::from_secs(600));
        assert_eq!(capped.delay_for(40), Duration::from_secs(600));
    }

    #[test]
    fn predicate_filters_errors() {
        let policy = RetryPolicy::quota(3, Duration::ZERO, Duration::ZERO);
        assert!(policy.should_retry(&TransferError::QuotaExceeded("quota".into()), 1));
        assert!(!policy.should_retry(&TransferError::QuotaExceeded("quota".into()), 3));
        assert!(!policy.should_retry(&TransferError::retrieval("gone", None), 1));
        let limited = TransferError::RateLimited {
            retry_after: Duration::ZERO,
            message: "slow".into(),
        };
        assert!(!policy.should_retry(&limited, 1));
    }

    #[tokio::test]
    async fn run_retries_until_success() {
        let policy = RetryPolicy::quota(5, Duration::from_millis(1), Duration::from_millis(2));
        let calls = AtomicU32::new(0);
        let cancel = CancellationToken::new();
        let value = policy
            .run("fetch", &cancel, |attempt| {
                calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    if attempt < 3 {
                        Err(TransferError::QuotaExceeded("bandwidth".into()))
                    } else {
                        Ok(attempt)
                    }
                }
            })
            .await
            .unwrap();
        assert_eq!(value, 3);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn run_gives_up_after_max_attempts() {
        let policy = RetryPolicy::rate_limit();
        let calls = AtomicU32::new(0);
        let cancel = CancellationToken::new();
        let result: TransferResult<()> = policy
            .run("send", &cancel, |_| {
                calls.fetch_add(1, Ordering::SeqCst);
                async {
                    Err(TransferError::RateLimited {
                        retry_after: Duration::from_millis(1),
                        message: "flood".into(),
                    })
                }
            })
            .await;
        assert!(result.unwrap_err().is_rate_limited());
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn cancellation_interrupts_backoff() {
        let policy = RetryPolicy::quota(5, Duration::from_secs(3600), Duration::from_secs(3600));
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            trigger.cancel();
        });
        let result: TransferResult<()> = policy
            .run("fetch", &cancel, |_| async {
                Err(TransferError::QuotaExceeded("quota".into()))
            })
            .await;
        assert!(result.unwrap_err().is_cancelled());
    }
}
