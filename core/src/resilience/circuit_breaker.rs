// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! Circuit breaker guarding calls to a single registry.

use parking_lot::Mutex;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;

use crate::error::{Error, Result};

/// Circuit state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    /// Requests flow; outcomes are counted
    Closed,
    /// Requests fail fast until the open timeout expires
    Open,
    /// A bounded number of probes decide recovery
    HalfOpen,
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Closed => write!(f, "closed"),
            Self::Open => write!(f, "open"),
            Self::HalfOpen => write!(f, "half_open"),
        }
    }
}

/// Callback invoked on every state transition
pub type StateChangeFn = dyn Fn(&str, CircuitState, CircuitState) + Send + Sync;

/// Circuit breaker configuration
#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    /// Minimum samples in the rolling interval before the breaker can trip
    pub min_requests: u64,
    /// Failure ratio that trips the breaker (0.0-1.0)
    pub failure_threshold: f64,
    /// Rolling interval over which outcomes are counted
    pub interval: Duration,
    /// How long the circuit stays open before probing
    pub timeout: Duration,
    /// Probes admitted while half-open
    pub max_requests: u32,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            min_requests: 5,
            failure_threshold: 0.6,
            interval: Duration::from_secs(60),
            timeout: Duration::from_secs(30),
            max_requests: 1,
        }
    }
}

#[derive(Debug, Default, Clone, Copy)]
struct Counts {
    requests: u64,
    failures: u64,
}

struct Inner {
    state: CircuitState,
    counts: Counts,
    window_start: Instant,
    /// Set while open; probing begins once this instant passes
    expiry: Option<Instant>,
    /// Probes admitted while half-open
    half_open_admitted: u32,
    /// Consecutive probe successes while half-open
    half_open_successes: u32,
}

/// Circuit breaker with atomic transitions under a single mutex.
///
/// The state-change callback is fired after the lock is released so user
/// code cannot deadlock against the breaker.
pub struct CircuitBreaker {
    name: String,
    config: CircuitBreakerConfig,
    inner: Mutex<Inner>,
    on_state_change: Option<Arc<StateChangeFn>>,
}

impl CircuitBreaker {
    /// Create a breaker for the named resource
    pub fn new(name: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        Self {
            name: name.into(),
            config,
            inner: Mutex::new(Inner {
                state: CircuitState::Closed,
                counts: Counts::default(),
                window_start: Instant::now(),
                expiry: None,
                half_open_admitted: 0,
                half_open_successes: 0,
            }),
            on_state_change: None,
        }
    }

    /// Register a state-change callback
    pub fn with_state_change(mut self, callback: Arc<StateChangeFn>) -> Self {
        self.on_state_change = Some(callback);
        self
    }

    /// Breaker name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Current state
    pub fn state(&self) -> CircuitState {
        self.inner.lock().state
    }

    /// Run `fut` through the breaker, recording its outcome
    pub async fn execute<T, F>(&self, fut: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        self.before()?;

        let result = fut.await;
        match &result {
            Ok(_) => self.record(true),
            Err(_) => self.record(false),
        }
        result
    }

    /// Admission check; transitions open → half-open on expiry
    fn before(&self) -> Result<()> {
        let transition;
        {
            let mut inner = self.inner.lock();
            match inner.state {
                CircuitState::Closed => return Ok(()),
                CircuitState::Open => {
                    let expired = inner
                        .expiry
                        .map(|e| Instant::now() >= e)
                        .unwrap_or(false);
                    if !expired {
                        return Err(Error::circuit_open(format!(
                            "circuit {} is open",
                            self.name
                        )));
                    }
                    transition = self.transition(&mut inner, CircuitState::HalfOpen);
                    inner.half_open_admitted = 1;
                }
                CircuitState::HalfOpen => {
                    if inner.half_open_admitted >= self.config.max_requests {
                        return Err(Error::circuit_open(format!(
                            "circuit {} is half-open with all probes in flight",
                            self.name
                        )));
                    }
                    inner.half_open_admitted += 1;
                    return Ok(());
                }
            }
        }
        self.fire(transition);
        Ok(())
    }

    fn record(&self, success: bool) {
        let transition;
        {
            let mut inner = self.inner.lock();
            match inner.state {
                CircuitState::Closed => {
                    // Roll the window when the interval elapses
                    if inner.window_start.elapsed() >= self.config.interval {
                        inner.counts = Counts::default();
                        inner.window_start = Instant::now();
                    }
                    inner.counts.requests += 1;
                    if !success {
                        inner.counts.failures += 1;
                    }

                    let counts = inner.counts;
                    let ratio = counts.failures as f64 / counts.requests as f64;
                    if counts.requests >= self.config.min_requests
                        && ratio >= self.config.failure_threshold
                    {
                        transition = self.transition(&mut inner, CircuitState::Open);
                        inner.expiry = Some(Instant::now() + self.config.timeout);
                    } else {
                        return;
                    }
                }
                CircuitState::HalfOpen => {
                    if success {
                        inner.half_open_successes += 1;
                        if inner.half_open_successes >= self.config.max_requests {
                            transition = self.transition(&mut inner, CircuitState::Closed);
                        } else {
                            return;
                        }
                    } else {
                        transition = self.transition(&mut inner, CircuitState::Open);
                        inner.expiry = Some(Instant::now() + self.config.timeout);
                    }
                }
                // A late completion after the breaker re-opened
                CircuitState::Open => return,
            }
        }
        self.fire(transition);
    }

    /// Must be called with the lock held; resets per-state bookkeeping
    fn transition(&self, inner: &mut Inner, to: CircuitState) -> (CircuitState, CircuitState) {
        let from = inner.state;
        inner.state = to;
        match to {
            CircuitState::Closed => {
                inner.counts = Counts::default();
                inner.window_start = Instant::now();
                inner.expiry = None;
            }
            CircuitState::Open => {
                inner.half_open_admitted = 0;
                inner.half_open_successes = 0;
            }
            CircuitState::HalfOpen => {
                inner.half_open_admitted = 0;
                inner.half_open_successes = 0;
            }
        }
        (from, to)
    }

    fn fire(&self, (from, to): (CircuitState, CircuitState)) {
        debug!(breaker = %self.name, %from, %to, "circuit state change");
        crate::metrics::circuit_transitions(&self.name, &to.to_string());
        if let Some(cb) = &self.on_state_change {
            cb(&self.name, from, to);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn config() -> CircuitBreakerConfig {
        CircuitBreakerConfig {
            min_requests: 3,
            failure_threshold: 0.6,
            interval: Duration::from_secs(60),
            timeout: Duration::from_secs(30),
            max_requests: 2,
        }
    }

    async fn fail(cb: &CircuitBreaker) -> Result<()> {
        cb.execute(async { Err::<(), _>(Error::transient("boom")) })
            .await
            .map(|_| ())
    }

    async fn succeed(cb: &CircuitBreaker) -> Result<()> {
        cb.execute(async { Ok(()) }).await
    }

    #[tokio::test]
    async fn test_trips_open_at_threshold() {
        let cb = CircuitBreaker::new("reg-a", config());

        for _ in 0..5 {
            let _ = fail(&cb).await;
        }
        assert_eq!(cb.state(), CircuitState::Open);

        // Next call fails fast without invoking the operation
        let invoked = AtomicUsize::new(0);
        let err = cb
            .execute(async {
                invoked.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
            .await
            .unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::CircuitOpen);
        assert_eq!(invoked.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_stays_closed_below_min_requests() {
        let cb = CircuitBreaker::new("reg-a", config());

        let _ = fail(&cb).await;
        let _ = fail(&cb).await;
        assert_eq!(cb.state(), CircuitState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_half_open_probe_after_timeout() {
        let cb = CircuitBreaker::new("reg-a", config());

        for _ in 0..3 {
            let _ = fail(&cb).await;
        }
        assert_eq!(cb.state(), CircuitState::Open);

        tokio::time::advance(Duration::from_secs(31)).await;

        // One probe succeeds, breaker requires max_requests successes
        succeed(&cb).await.unwrap();
        assert_eq!(cb.state(), CircuitState::HalfOpen);
        succeed(&cb).await.unwrap();
        assert_eq!(cb.state(), CircuitState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_half_open_failure_reopens() {
        let cb = CircuitBreaker::new("reg-a", config());

        for _ in 0..3 {
            let _ = fail(&cb).await;
        }
        tokio::time::advance(Duration::from_secs(31)).await;

        let _ = fail(&cb).await;
        assert_eq!(cb.state(), CircuitState::Open);
    }

    #[tokio::test]
    async fn test_state_change_callback() {
        let transitions = Arc::new(Mutex::new(Vec::new()));
        let seen = transitions.clone();
        let cb = CircuitBreaker::new("reg-a", config()).with_state_change(Arc::new(
            move |_, from, to| {
                seen.lock().push((from, to));
            },
        ));

        for _ in 0..3 {
            let _ = fail(&cb).await;
        }

        let recorded = transitions.lock().clone();
        assert_eq!(recorded, vec![(CircuitState::Closed, CircuitState::Open)]);
    }
}
