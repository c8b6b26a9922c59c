//! Token-bucket pacing for outgoing fetches.
//!
//! One [`RateLimiter`] is shared by every fetch worker of a job. The bucket
//! holds at most `max(1, ceil(rate))` tokens and refills continuously at
//! `rate` tokens per second. It starts with a single token, so `n` acquires
//! on a fresh limiter never complete faster than `(n - 1) / rate` seconds;
//! bursts up to capacity are only possible after idle time.
//!
//! Waiters queue on a fair mutex and the head of the queue sleeps while
//! holding it, which gives FIFO ordering among concurrent callers.

use std::time::{Duration, Instant};

use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use crate::error::AppError;

#[derive(Debug)]
struct Bucket {
    tokens: f64,
    last_refill: Instant,
}

impl Bucket {
    fn refill(&mut self, rate: f64, capacity: f64) {
        let now = Instant::now();
        let elapsed = now.duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * rate).min(capacity);
        self.last_refill = now;
    }
}

/// Shared token bucket. See the module docs for the pacing guarantees.
#[derive(Debug)]
pub struct RateLimiter {
    rate: f64,
    capacity: f64,
    bucket: Mutex<Bucket>,
}

impl RateLimiter {
    /// Create a limiter allowing `rate` acquisitions per second.
    pub fn new(rate: f64) -> Result<Self, AppError> {
        if !rate.is_finite() || rate <= 0.0 {
            return Err(AppError::ValidationError(format!(
                "rate limit must be a positive number, got {rate}"
            )));
        }
        Ok(Self {
            rate,
            capacity: rate.ceil().max(1.0),
            bucket: Mutex::new(Bucket {
                tokens: 1.0,
                last_refill: Instant::now(),
            }),
        })
    }

    pub fn rate(&self) -> f64 {
        self.rate
    }

    pub fn capacity(&self) -> u32 {
        self.capacity as u32
    }

    /// Wait for one token.
    ///
    /// Returns [`AppError::Cancelled`] as soon as `cancel` fires; a cancelled
    /// caller never consumes a token.
    pub async fn acquire(&self, cancel: &CancellationToken) -> Result<(), AppError> {
        if cancel.is_cancelled() {
            return Err(AppError::Cancelled);
        }

        let mut bucket = tokio::select! {
            biased;
            () = cancel.cancelled() => return Err(AppError::Cancelled),
            guard = self.bucket.lock() => guard,
        };

        loop {
            bucket.refill(self.rate, self.capacity);
            if bucket.tokens >= 1.0 {
                bucket.tokens -= 1.0;
                return Ok(());
            }

            let wait = Duration::from_secs_f64((1.0 - bucket.tokens) / self.rate);
            tracing::trace!(wait_ms = %wait.as_millis(), "Waiting for rate limit token");
            tokio::select! {
                biased;
                () = cancel.cancelled() => return Err(AppError::Cancelled),
                () = tokio::time::sleep(wait) => {}
            }
        }
    }
}
