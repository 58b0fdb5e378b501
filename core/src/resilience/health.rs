// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! Periodic health checks with aggregate status.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::interval;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::Result;

/// Aggregate health status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    /// All checks passing
    Healthy,
    /// Some non-critical check failing
    Degraded,
    /// A critical check failing
    Unhealthy,
}

/// A named health check
#[async_trait]
pub trait HealthCheck: Send + Sync {
    /// Probe the resource; `Err` marks the check failed
    async fn check(&self) -> Result<()>;
}

/// Per-check configuration
#[derive(Debug, Clone)]
pub struct CheckConfig {
    /// How often the check runs
    pub interval: Duration,
    /// Per-run deadline
    pub timeout: Duration,
    /// Whether failure makes the whole system unhealthy
    pub critical: bool,
}

impl Default for CheckConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(10),
            timeout: Duration::from_secs(5),
            critical: false,
        }
    }
}

/// Latest result of one check
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckState {
    /// Whether the last run passed
    pub healthy: bool,
    /// Whether the check is critical
    pub critical: bool,
    /// Error from the last failed run
    pub error: Option<String>,
    /// When the check last ran
    pub checked_at: Option<DateTime<Utc>>,
}

struct Registered {
    check: Arc<dyn HealthCheck>,
    config: CheckConfig,
}

/// Callback fired on overall healthy/unhealthy transitions
pub type HealthEventFn = dyn Fn(HealthStatus) + Send + Sync;

/// Registry of named health checks, each running on its own interval
pub struct HealthChecker {
    checks: RwLock<HashMap<String, Registered>>,
    states: Arc<RwLock<HashMap<String, CheckState>>>,
    last_overall: Arc<RwLock<HealthStatus>>,
    on_failure: Option<Arc<HealthEventFn>>,
    on_recovery: Option<Arc<HealthEventFn>>,
}

impl HealthChecker {
    /// Create an empty checker
    pub fn new() -> Self {
        Self {
            checks: RwLock::new(HashMap::new()),
            states: Arc::new(RwLock::new(HashMap::new())),
            last_overall: Arc::new(RwLock::new(HealthStatus::Healthy)),
            on_failure: None,
            on_recovery: None,
        }
    }

    /// Register a failure callback
    pub fn with_on_failure(mut self, cb: Arc<HealthEventFn>) -> Self {
        self.on_failure = Some(cb);
        self
    }

    /// Register a recovery callback
    pub fn with_on_recovery(mut self, cb: Arc<HealthEventFn>) -> Self {
        self.on_recovery = Some(cb);
        self
    }

    /// Register a named check
    pub fn register(
        &self,
        name: impl Into<String>,
        check: Arc<dyn HealthCheck>,
        config: CheckConfig,
    ) {
        let name = name.into();
        self.states.write().insert(
            name.clone(),
            CheckState {
                healthy: true,
                critical: config.critical,
                error: None,
                checked_at: None,
            },
        );
        self.checks
            .write()
            .insert(name, Registered { check, config });
    }

    /// Spawn one background loop per registered check
    pub fn start(self: &Arc<Self>, shutdown: CancellationToken) {
        let checks = self.checks.read();
        for (name, registered) in checks.iter() {
            let name = name.clone();
            let check = registered.check.clone();
            let config = registered.config.clone();
            let this = self.clone();
            let shutdown = shutdown.clone();

            tokio::spawn(async move {
                let mut ticker = interval(config.interval);
                loop {
                    tokio::select! {
                        _ = ticker.tick() => {}
                        _ = shutdown.cancelled() => return,
                    }
                    this.run_check(&name, &check, &config).await;
                }
            });
        }
    }

    async fn run_check(&self, name: &str, check: &Arc<dyn HealthCheck>, config: &CheckConfig) {
        let outcome = tokio::time::timeout(config.timeout, check.check()).await;
        let (healthy, error) = match outcome {
            Ok(Ok(())) => (true, None),
            Ok(Err(err)) => (false, Some(err.to_string())),
            Err(_) => (false, Some("health check timed out".to_string())),
        };

        if healthy {
            debug!(check = name, "health check passed");
        } else {
            warn!(check = name, error = ?error, "health check failed");
        }

        {
            let mut states = self.states.write();
            if let Some(state) = states.get_mut(name) {
                state.healthy = healthy;
                state.error = error;
                state.checked_at = Some(Utc::now());
            }
        }
        self.recompute_overall();
    }

    fn recompute_overall(&self) {
        let status = self.status();
        let previous = {
            let mut last = self.last_overall.write();
            std::mem::replace(&mut *last, status)
        };

        if previous != HealthStatus::Unhealthy && status == HealthStatus::Unhealthy {
            if let Some(cb) = &self.on_failure {
                cb(status);
            }
        } else if previous == HealthStatus::Unhealthy && status == HealthStatus::Healthy {
            if let Some(cb) = &self.on_recovery {
                cb(status);
            }
        }
    }

    /// Aggregate status over all checks
    pub fn status(&self) -> HealthStatus {
        let states = self.states.read();
        let mut degraded = false;
        for state in states.values() {
            if !state.healthy {
                if state.critical {
                    return HealthStatus::Unhealthy;
                }
                degraded = true;
            }
        }
        if degraded {
            HealthStatus::Degraded
        } else {
            HealthStatus::Healthy
        }
    }

    /// Per-check states for reporting
    pub fn states(&self) -> HashMap<String, CheckState> {
        self.states.read().clone()
    }
}

impl Default for HealthChecker {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use std::sync::atomic::{AtomicBool, Ordering};

    struct FlagCheck {
        ok: Arc<AtomicBool>,
    }

    #[async_trait]
    impl HealthCheck for FlagCheck {
        async fn check(&self) -> Result<()> {
            if self.ok.load(Ordering::SeqCst) {
                Ok(())
            } else {
                Err(Error::transient("down"))
            }
        }
    }

    #[tokio::test]
    async fn test_aggregate_status() {
        let checker = Arc::new(HealthChecker::new());
        let ok = Arc::new(AtomicBool::new(true));

        checker.register(
            "registry-a",
            Arc::new(FlagCheck { ok: ok.clone() }),
            CheckConfig {
                critical: true,
                ..CheckConfig::default()
            },
        );
        checker.register(
            "cache",
            Arc::new(FlagCheck {
                ok: Arc::new(AtomicBool::new(true)),
            }),
            CheckConfig::default(),
        );

        assert_eq!(checker.status(), HealthStatus::Healthy);

        // Fail the critical check directly
        ok.store(false, Ordering::SeqCst);
        let checks = checker.checks.read();
        let reg = checks.get("registry-a").unwrap();
        let (check, config) = (reg.check.clone(), reg.config.clone());
        drop(checks);
        checker.run_check("registry-a", &check, &config).await;

        assert_eq!(checker.status(), HealthStatus::Unhealthy);
    }

    #[tokio::test]
    async fn test_non_critical_failure_degrades() {
        let checker = Arc::new(HealthChecker::new());
        let ok = Arc::new(AtomicBool::new(false));

        checker.register(
            "cache",
            Arc::new(FlagCheck { ok }),
            CheckConfig::default(),
        );

        let checks = checker.checks.read();
        let reg = checks.get("cache").unwrap();
        let (check, config) = (reg.check.clone(), reg.config.clone());
        drop(checks);
        checker.run_check("cache", &check, &config).await;

        assert_eq!(checker.status(), HealthStatus::Degraded);
    }

    #[tokio::test]
    async fn test_failure_and_recovery_callbacks() {
        let failures = Arc::new(AtomicBool::new(false));
        let recoveries = Arc::new(AtomicBool::new(false));
        let f = failures.clone();
        let r = recoveries.clone();

        let checker = Arc::new(
            HealthChecker::new()
                .with_on_failure(Arc::new(move |_| f.store(true, Ordering::SeqCst)))
                .with_on_recovery(Arc::new(move |_| r.store(true, Ordering::SeqCst))),
        );
        let ok = Arc::new(AtomicBool::new(false));
        checker.register(
            "registry-a",
            Arc::new(FlagCheck { ok: ok.clone() }),
            CheckConfig {
                critical: true,
                ..CheckConfig::default()
            },
        );

        let (check, config) = {
            let checks = checker.checks.read();
            let reg = checks.get("registry-a").unwrap();
            (reg.check.clone(), reg.config.clone())
        };

        checker.run_check("registry-a", &check, &config).await;
        assert!(failures.load(Ordering::SeqCst));

        ok.store(true, Ordering::SeqCst);
        checker.run_check("registry-a", &check, &config).await;
        assert!(recoveries.load(Ordering::SeqCst));
    }
}
