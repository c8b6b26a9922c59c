use std::future::Future;
use std::time::Duration;

use rand::Rng;
use tokio_util::sync::CancellationToken;

use crate::error::AppError;
use crate::models::ScrapeConfig;

/// Bounded retries with exponential backoff and jitter.
///
/// Delay before retry `n` (0-indexed) is `base * 2^n` plus a uniform jitter
/// in `[0, base)`, capped at `max_delay`.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
        }
    }
}

/// Result of [`RetryPolicy::execute`] together with the attempts spent.
#[derive(Debug)]
pub struct RetryOutcome<T> {
    pub result: Result<T, AppError>,
    pub attempts: u32,
}

impl RetryPolicy {
    pub fn new(max_retries: u32, base_delay: Duration) -> Self {
        Self {
            max_retries,
            base_delay,
            ..Default::default()
        }
    }

    /// Policy for a job: retries and base delay from the job, cap from the engine.
    pub fn for_config(config: &ScrapeConfig, max_delay: Duration) -> Self {
        Self {
            max_retries: config.max_retries,
            base_delay: config.retry_base_delay(),
            max_delay,
        }
    }

    pub fn with_max_delay(mut self, max_delay: Duration) -> Self {
        self.max_delay = max_delay;
        self
    }

    /// Backoff before the retry following failed attempt `attempt` (0-indexed).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exponential = 2u32
            .checked_pow(attempt)
            .and_then(|factor| self.base_delay.checked_mul(factor))
            .unwrap_or(self.max_delay);
        let delay = exponential.saturating_add(self.jitter());
        delay.min(self.max_delay)
    }

    fn jitter(&self) -> Duration {
        let base_ms = self.base_delay.as_millis() as u64;
        if base_ms == 0 {
            return Duration::ZERO;
        }
        Duration::from_millis(rand::rng().random_range(0..base_ms))
    }

    /// Run `attempt_fn` up to `max_retries + 1` times.
    ///
    /// `attempt_fn` receives the 1-based attempt number. Non-retryable errors
    /// abort immediately; cancellation interrupts the backoff sleep.
    pub async fn execute<T, F, Fut>(
        &self,
        cancel: &CancellationToken,
        mut attempt_fn: F,
    ) -> RetryOutcome<T>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, AppError>>,
    {
        let mut attempts = 0;
        loop {
            if cancel.is_cancelled() {
                return RetryOutcome {
                    result: Err(AppError::Cancelled),
                    attempts,
                };
            }

            attempts += 1;
            let error = match attempt_fn(attempts).await {
                Ok(value) => {
                    return RetryOutcome {
                        result: Ok(value),
                        attempts,
                    };
                }
                Err(e) => e,
            };

            if !error.is_retryable() || attempts > self.max_retries {
                return RetryOutcome {
                    result: Err(error),
                    attempts,
                };
            }

            let delay = self.delay_for_attempt(attempts - 1);
            tracing::debug!(
                attempt = attempts,
                max_attempts = self.max_retries + 1,
                delay_ms = %delay.as_millis(),
                error = %error,
                "Retrying after transient error"
            );
            tokio::select! {
                biased;
                () = cancel.cancelled() => {
                    return RetryOutcome {
                        result: Err(AppError::Cancelled),
                        attempts,
                    };
                }
                () = tokio::time::sleep(delay) => {}
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Instant;

    use super::*;

    fn transient() -> AppError {
        AppError::TransientFetch {
            url: "http://a.test".into(),
            status: Some(503),
            message: "unavailable".into(),
        }
    }

    fn fast_policy(max_retries: u32) -> RetryPolicy {
        RetryPolicy::new(max_retries, Duration::from_millis(1))
    }

    #[test]
    fn test_delay_schedule_with_jitter_bounds() {
        let policy = RetryPolicy::new(5, Duration::from_millis(100))
            .with_max_delay(Duration::from_secs(60));
        for attempt in 0..4 {
            let floor = Duration::from_millis(100 * 2u64.pow(attempt));
            for _ in 0..50 {
                let d = policy.delay_for_attempt(attempt);
                assert!(d >= floor, "attempt {attempt}: {d:?} < {floor:?}");
                assert!(d < floor + Duration::from_millis(100));
            }
        }
    }

    #[test]
    fn test_delay_is_capped() {
        let policy =
            RetryPolicy::new(10, Duration::from_secs(1)).with_max_delay(Duration::from_secs(5));
        assert_eq!(policy.delay_for_attempt(8), Duration::from_secs(5));
        assert_eq!(policy.delay_for_attempt(40), Duration::from_secs(5));
    }

    #[tokio::test]
    async fn test_succeeds_after_k_transient_failures() {
        let calls = Arc::new(AtomicU32::new(0));
        let policy = fast_policy(3);

        let outcome = policy
            .execute(&CancellationToken::new(), |_| {
                let calls = calls.clone();
                async move {
                    if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                        Err(transient())
                    } else {
                        Ok("done")
                    }
                }
            })
            .await;

        assert_eq!(outcome.result.unwrap(), "done");
        assert_eq!(outcome.attempts, 3);
    }

    #[tokio::test]
    async fn test_fatal_error_aborts_after_one_attempt() {
        let policy = fast_policy(5);
        let outcome: RetryOutcome<()> = policy
            .execute(&CancellationToken::new(), |_| async {
                Err(AppError::from_status("http://a.test", 404))
            })
            .await;

        assert!(matches!(
            outcome.result,
            Err(AppError::FatalFetch {
                status: Some(404),
                ..
            })
        ));
        assert_eq!(outcome.attempts, 1);
    }

    #[tokio::test]
    async fn test_exhausted_retries_return_last_error() {
        let policy = fast_policy(2);
        let outcome: RetryOutcome<()> = policy
            .execute(&CancellationToken::new(), |n| async move {
                Err(AppError::TransientFetch {
                    url: "http://a.test".into(),
                    status: Some(500 + n as u16),
                    message: "boom".into(),
                })
            })
            .await;

        assert_eq!(outcome.attempts, 3);
        assert_eq!(outcome.result.unwrap_err().status(), Some(503));
    }

    #[tokio::test]
    async fn test_zero_retries_means_single_attempt() {
        let outcome: RetryOutcome<()> = fast_policy(0)
            .execute(&CancellationToken::new(), |_| async { Err(transient()) })
            .await;
        assert_eq!(outcome.attempts, 1);
    }

    #[tokio::test]
    async fn test_attempt_numbers_are_one_based() {
        let seen = Arc::new(std::sync::Mutex::new(Vec::new()));
        let _: RetryOutcome<()> = fast_policy(2)
            .execute(&CancellationToken::new(), |n| {
                seen.lock().unwrap().push(n);
                async { Err(transient()) }
            })
            .await;
        assert_eq!(*seen.lock().unwrap(), vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn test_cancellation_interrupts_backoff() {
        let policy = RetryPolicy::new(3, Duration::from_secs(10));
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            trigger.cancel();
        });

        let start = Instant::now();
        let outcome: RetryOutcome<()> = policy.execute(&cancel, |_| async { Err(transient()) }).await;

        assert!(matches!(outcome.result, Err(AppError::Cancelled)));
        assert_eq!(outcome.attempts, 1);
        assert!(start.elapsed() < Duration::from_secs(1));
    }
}
