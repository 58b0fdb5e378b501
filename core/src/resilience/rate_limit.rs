// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! Token-bucket rate limiting per named resource.

use parking_lot::Mutex;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::error::{Error, Result};

/// Rate limiter configuration
#[derive(Debug, Clone)]
pub struct RateLimiterConfig {
    /// Steady-state refill rate
    pub requests_per_second: f64,
    /// Bucket capacity
    pub burst_size: u32,
    /// Upper bound on a blocking wait
    pub wait_timeout: Duration,
}

impl Default for RateLimiterConfig {
    fn default() -> Self {
        Self {
            requests_per_second: 50.0,
            burst_size: 100,
            wait_timeout: Duration::from_secs(10),
        }
    }
}

struct BucketState {
    tokens: f64,
    last_refill: Instant,
}

/// Token bucket for one named resource
pub struct RateLimiter {
    name: String,
    config: RateLimiterConfig,
    state: Mutex<BucketState>,
}

impl RateLimiter {
    /// Create a limiter with a full bucket
    pub fn new(name: impl Into<String>, config: RateLimiterConfig) -> Self {
        let tokens = config.burst_size as f64;
        Self {
            name: name.into(),
            config,
            state: Mutex::new(BucketState {
                tokens,
                last_refill: Instant::now(),
            }),
        }
    }

    /// Non-blocking decision: take a token if one is available
    pub fn allow(&self) -> bool {
        let mut state = self.state.lock();
        self.refill(&mut state);
        if state.tokens >= 1.0 {
            state.tokens -= 1.0;
            true
        } else {
            false
        }
    }

    /// Block until a token is available, the wait timeout elapses, or the
    /// token is cancelled.
    pub async fn wait(&self, token: &CancellationToken) -> Result<()> {
        let deadline = Instant::now() + self.config.wait_timeout;
        loop {
            let next_token_in = {
                let mut state = self.state.lock();
                self.refill(&mut state);
                if state.tokens >= 1.0 {
                    state.tokens -= 1.0;
                    return Ok(());
                }
                // Time until one whole token accrues
                Duration::from_secs_f64(
                    (1.0 - state.tokens) / self.config.requests_per_second,
                )
            };

            let now = Instant::now();
            if now + next_token_in > deadline {
                return Err(Error::deadline_exceeded(format!(
                    "rate limiter {} wait timed out",
                    self.name
                )));
            }

            tokio::select! {
                _ = tokio::time::sleep(next_token_in) => {}
                _ = token.cancelled() => {
                    return Err(Error::cancelled("rate limiter wait cancelled"));
                }
            }
        }
    }

    fn refill(&self, state: &mut BucketState) {
        let now = Instant::now();
        let elapsed = now.duration_since(state.last_refill).as_secs_f64();
        state.last_refill = now;
        state.tokens = (state.tokens + elapsed * self.config.requests_per_second)
            .min(self.config.burst_size as f64);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    #[tokio::test]
    async fn test_burst_is_bounded() {
        let limiter = RateLimiter::new(
            "reg-a",
            RateLimiterConfig {
                requests_per_second: 10.0,
                burst_size: 5,
                wait_timeout: Duration::from_secs(1),
            },
        );

        let allowed = (0..20).filter(|_| limiter.allow()).count();
        // At most burst_size plus what refills during the loop itself
        assert!(allowed <= 6, "allowed {allowed} exceeds burst");
        assert!(allowed >= 5);
    }

    #[tokio::test(start_paused = true)]
    async fn test_refill_over_time() {
        let limiter = RateLimiter::new(
            "reg-a",
            RateLimiterConfig {
                requests_per_second: 10.0,
                burst_size: 1,
                wait_timeout: Duration::from_secs(1),
            },
        );

        assert!(limiter.allow());
        assert!(!limiter.allow());

        tokio::time::advance(Duration::from_millis(150)).await;
        assert!(limiter.allow());
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_acquires_after_refill() {
        let limiter = RateLimiter::new(
            "reg-a",
            RateLimiterConfig {
                requests_per_second: 10.0,
                burst_size: 1,
                wait_timeout: Duration::from_secs(5),
            },
        );
        let token = CancellationToken::new();

        assert!(limiter.allow());
        limiter.wait(&token).await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_times_out() {
        let limiter = RateLimiter::new(
            "reg-a",
            RateLimiterConfig {
                requests_per_second: 0.001,
                burst_size: 1,
                wait_timeout: Duration::from_millis(50),
            },
        );
        let token = CancellationToken::new();

        assert!(limiter.allow());
        let err = limiter.wait(&token).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::DeadlineExceeded);
    }
}
