// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! Retry policy with exponential backoff and jitter.

use rand::Rng;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::error::{Error, Result};

/// Hook invoked before each retry wait
pub type OnRetryFn = dyn Fn(u32, &Error) + Send + Sync;

/// Retry configuration
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Additional attempts after the first failure
    pub max_retries: u32,
    /// Backoff before the first retry
    pub initial_wait: Duration,
    /// Backoff ceiling
    pub max_wait: Duration,
    /// Backoff growth factor
    pub multiplier: f64,
    /// Uniform jitter fraction in [0, 1]
    pub jitter: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_wait: Duration::from_millis(500),
            max_wait: Duration::from_secs(30),
            multiplier: 2.0,
            jitter: 0.2,
        }
    }
}

/// Retry policy around a fallible async operation.
///
/// Only errors whose kind is retryable are re-attempted; cancellation is
/// honored before and during every backoff wait.
#[derive(Clone)]
pub struct RetryPolicy {
    config: RetryConfig,
    on_retry: Option<Arc<OnRetryFn>>,
}

impl RetryPolicy {
    /// Create a policy
    pub fn new(config: RetryConfig) -> Self {
        Self {
            config,
            on_retry: None,
        }
    }

    /// Register a hook fired before each retry wait
    pub fn with_on_retry(mut self, hook: Arc<OnRetryFn>) -> Self {
        self.on_retry = Some(hook);
        self
    }

    /// Backoff for the given zero-based attempt, before jitter
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exp = self.config.initial_wait.as_secs_f64()
            * self.config.multiplier.powi(attempt as i32);
        Duration::from_secs_f64(exp.min(self.config.max_wait.as_secs_f64()))
    }

    /// Run `op`, retrying retryable failures up to `max_retries` times
    pub async fn execute<T, F, Fut>(&self, token: &CancellationToken, mut op: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut attempt: u32 = 0;
        loop {
            if token.is_cancelled() {
                return Err(Error::cancelled("retry loop cancelled"));
            }

            match op().await {
                Ok(value) => return Ok(value),
                Err(err) => {
                    if !err.is_retryable() || attempt >= self.config.max_retries {
                        return Err(err);
                    }

                    let backoff = self.backoff(attempt);
                    let wait = jittered(backoff, self.config.jitter);
                    debug!(
                        attempt,
                        wait_ms = wait.as_millis() as u64,
                        error = %err,
                        "retrying after backoff"
                    );
                    if let Some(hook) = &self.on_retry {
                        hook(attempt, &err);
                    }

                    tokio::select! {
                        _ = tokio::time::sleep(wait) => {}
                        _ = token.cancelled() => {
                            return Err(Error::cancelled("retry wait cancelled"));
                        }
                    }
                    attempt += 1;
                }
            }
        }
    }
}

/// Apply uniform ±jitter to a base duration
fn jittered(base: Duration, jitter: f64) -> Duration {
    if jitter <= 0.0 {
        return base;
    }
    let spread = base.as_secs_f64() * jitter;
    let offset = rand::thread_rng().gen_range(-spread..=spread);
    Duration::from_secs_f64((base.as_secs_f64() + offset).max(0.0))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn fast_config() -> RetryConfig {
        RetryConfig {
            max_retries: 3,
            initial_wait: Duration::from_millis(10),
            max_wait: Duration::from_millis(100),
            multiplier: 2.0,
            jitter: 0.0,
        }
    }

    #[tokio::test]
    async fn test_succeeds_after_transient_failures() {
        let policy = RetryPolicy::new(fast_config());
        let token = CancellationToken::new();
        let attempts = AtomicU32::new(0);

        let result = policy
            .execute(&token, || {
                let n = attempts.fetch_add(1, Ordering::SeqCst);
                async move {
                    if n < 2 {
                        Err(Error::transient("flaky"))
                    } else {
                        Ok(n)
                    }
                }
            })
            .await
            .unwrap();

        assert_eq!(result, 2);
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_non_retryable_fails_immediately() {
        let policy = RetryPolicy::new(fast_config());
        let token = CancellationToken::new();
        let attempts = AtomicU32::new(0);

        let err = policy
            .execute(&token, || {
                attempts.fetch_add(1, Ordering::SeqCst);
                async { Err::<(), _>(Error::not_found("missing")) }
            })
            .await
            .unwrap_err();

        assert_eq!(err.kind(), ErrorKind::NotFound);
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_exhausts_retries() {
        let policy = RetryPolicy::new(fast_config());
        let token = CancellationToken::new();
        let attempts = AtomicU32::new(0);

        let err = policy
            .execute(&token, || {
                attempts.fetch_add(1, Ordering::SeqCst);
                async { Err::<(), _>(Error::transient("always")) }
            })
            .await
            .unwrap_err();

        assert_eq!(err.kind(), ErrorKind::Transient);
        // Initial attempt plus max_retries
        assert_eq!(attempts.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn test_cancellation_stops_retries() {
        let policy = RetryPolicy::new(RetryConfig {
            initial_wait: Duration::from_secs(60),
            ..fast_config()
        });
        let token = CancellationToken::new();
        token.cancel();

        let err = policy
            .execute(&token, || async { Err::<(), _>(Error::transient("x")) })
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Cancelled);
    }

    #[test]
    fn test_backoff_is_capped() {
        let policy = RetryPolicy::new(RetryConfig {
            max_retries: 10,
            initial_wait: Duration::from_secs(1),
            max_wait: Duration::from_secs(8),
            multiplier: 2.0,
            jitter: 0.0,
        });

        assert_eq!(policy.backoff(0), Duration::from_secs(1));
        assert_eq!(policy.backoff(2), Duration::from_secs(4));
        assert_eq!(policy.backoff(6), Duration::from_secs(8));
    }

    #[tokio::test]
    async fn test_on_retry_hook_fires() {
        let fired = Arc::new(AtomicU32::new(0));
        let seen = fired.clone();
        let policy = RetryPolicy::new(fast_config()).with_on_retry(Arc::new(move |_, _| {
            seen.fetch_add(1, Ordering::SeqCst);
        }));
        let token = CancellationToken::new();

        let _ = policy
            .execute(&token, || async { Err::<(), _>(Error::transient("x")) })
            .await;
        assert_eq!(fired.load(Ordering::SeqCst), 3);
    }
}
