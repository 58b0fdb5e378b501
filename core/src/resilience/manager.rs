// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! Composed resilience pipeline keyed by resource name.

use dashmap::DashMap;
use std::future::Future;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use crate::error::Result;
use crate::resilience::{
    Bulkhead, BulkheadConfig, CircuitBreaker, CircuitBreakerConfig, RateLimiter,
    RateLimiterConfig, RetryConfig, RetryPolicy,
};

/// Template configuration applied to each named resource on first use
#[derive(Debug, Clone, Default)]
pub struct ResilienceConfig {
    pub circuit_breaker: CircuitBreakerConfig,
    pub bulkhead: BulkheadConfig,
    pub rate_limiter: RateLimiterConfig,
    pub retry: RetryConfig,
}

struct Keyed {
    breaker: CircuitBreaker,
    bulkhead: Bulkhead,
    limiter: RateLimiter,
    retry: RetryPolicy,
}

/// Per-resource resilience pipelines.
///
/// `execute` runs: rate-limit wait → circuit-breaker gate → bulkhead
/// isolation → retry policy around the operation. Each named resource gets
/// its own instances so one degraded registry cannot starve another.
pub struct ResilienceManager {
    template: ResilienceConfig,
    keyed: DashMap<String, Arc<Keyed>>,
}

impl ResilienceManager {
    /// Create a manager applying `template` to each new resource name
    pub fn new(template: ResilienceConfig) -> Self {
        Self {
            template,
            keyed: DashMap::new(),
        }
    }

    fn entry(&self, name: &str) -> Arc<Keyed> {
        if let Some(existing) = self.keyed.get(name) {
            return existing.clone();
        }
        let created = Arc::new(Keyed {
            breaker: CircuitBreaker::new(name, self.template.circuit_breaker.clone()),
            bulkhead: Bulkhead::new(name, self.template.bulkhead.clone()),
            limiter: RateLimiter::new(name, self.template.rate_limiter.clone()),
            retry: RetryPolicy::new(self.template.retry.clone()),
        });
        self.keyed
            .entry(name.to_string())
            .or_insert(created)
            .clone()
    }

    /// Current circuit state for a resource, if it has been used
    pub fn circuit_state(&self, name: &str) -> Option<super::CircuitState> {
        self.keyed.get(name).map(|k| k.breaker.state())
    }

    /// Run `op` under the full pipeline for `name`
    pub async fn execute<T, F, Fut>(
        &self,
        name: &str,
        token: &CancellationToken,
        op: F,
    ) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let keyed = self.entry(name);

        keyed.limiter.wait(token).await?;
        keyed
            .breaker
            .execute(keyed.bulkhead.execute(token, keyed.retry.execute(token, op)))
            .await
    }
}
