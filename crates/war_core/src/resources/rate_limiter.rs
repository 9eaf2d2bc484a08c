//! Token bucket.

use std::time::Duration;

use parking_lot::Mutex;
use tokio::time::Instant;

use crate::config::RateLimitConfig;
use crate::error::{Result, WarError};
use crate::lifecycle::CancelToken;

#[derive(Debug)]
struct Bucket {
    tokens: f64,
    last_refill: Instant,
}

/// Token bucket: up to `max_tokens` burst, refilled continuously.
#[derive(Debug)]
pub struct RateLimiter {
    bucket: Mutex<Bucket>,
    max_tokens: f64,
    refill_per_sec: f64,
}

impl RateLimiter {
    /// Create a full bucket.
    pub fn new(config: &RateLimitConfig) -> Result<Self> {
        if config.max_tokens == 0 || !(config.refill_per_sec > 0.0) {
            return Err(WarError::InvalidArgument(
                "rate limiter needs max_tokens > 0 and refill_per_sec > 0".into(),
            ));
        }
        let max_tokens = f64::from(config.max_tokens);
        Ok(Self {
            bucket: Mutex::new(Bucket {
                tokens: max_tokens,
                last_refill: Instant::now(),
            }),
            max_tokens,
            refill_per_sec: config.refill_per_sec,
        })
    }

    fn refill(&self, bucket: &mut Bucket, now: Instant) {
        let elapsed = now.saturating_duration_since(bucket.last_refill).as_secs_f64();
        bucket.tokens = (bucket.tokens + elapsed * self.refill_per_sec).min(self.max_tokens);
        bucket.last_refill = now;
    }

    /// Take a token if one is available.
    pub fn allow(&self) -> bool {
        let mut bucket = self.bucket.lock();
        self.refill(&mut bucket, Instant::now());
        if bucket.tokens >= 1.0 {
            bucket.tokens -= 1.0;
            true
        } else {
            false
        }
    }

    /// Tokens currently available (after refill).
    #[must_use]
    pub fn available(&self) -> f64 {
        let mut bucket = self.bucket.lock();
        self.refill(&mut bucket, Instant::now());
        bucket.tokens
    }

    /// Wait until a token is available, or fail when `cancel` fires.
    pub async fn wait(&self, cancel: &CancelToken) -> Result<()> {
        loop {
            let shortfall = {
                let mut bucket = self.bucket.lock();
                self.refill(&mut bucket, Instant::now());
                if bucket.tokens >= 1.0 {
                    bucket.tokens -= 1.0;
                    return Ok(());
                }
                1.0 - bucket.tokens
            };
            let pause = Duration::from_secs_f64(shortfall / self.refill_per_sec);
            tokio::select! {
                () = cancel.cancelled() => {
                    return Err(WarError::ShuttingDown("rate limiter".into()));
                }
                () = tokio::time::sleep(pause) => {}
            }
        }
    }
}
