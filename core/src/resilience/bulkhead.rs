// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! Bulkhead: bounded concurrency with a bounded wait queue.

use std::future::Future;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;

use crate::error::{Error, Result};

/// Bulkhead configuration
#[derive(Debug, Clone)]
pub struct BulkheadConfig {
    /// Maximum operations in flight
    pub max_concurrent: usize,
    /// Maximum callers waiting for a slot
    pub max_queue_depth: usize,
    /// How long a caller may wait for a slot
    pub timeout: Duration,
}

impl Default for BulkheadConfig {
    fn default() -> Self {
        Self {
            max_concurrent: 10,
            max_queue_depth: 50,
            timeout: Duration::from_secs(30),
        }
    }
}

/// Point-in-time bulkhead statistics
#[derive(Debug, Clone, Copy, Default)]
pub struct BulkheadStats {
    /// Operations executed to completion
    pub executed: u64,
    /// Fast-failed because the queue was full
    pub rejected: u64,
    /// Gave up waiting for a slot
    pub timed_out: u64,
    /// Currently in flight
    pub active: usize,
    /// Currently queued
    pub queued: usize,
}

/// Bounded-concurrency isolation for one named resource
pub struct Bulkhead {
    name: String,
    config: BulkheadConfig,
    semaphore: Arc<Semaphore>,
    queued: AtomicUsize,
    active: AtomicUsize,
    executed: AtomicU64,
    rejected: AtomicU64,
    timed_out: AtomicU64,
}

impl Bulkhead {
    /// Create a bulkhead for the named resource
    pub fn new(name: impl Into<String>, config: BulkheadConfig) -> Self {
        let semaphore = Arc::new(Semaphore::new(config.max_concurrent));
        Self {
            name: name.into(),
            config,
            semaphore,
            queued: AtomicUsize::new(0),
            active: AtomicUsize::new(0),
            executed: AtomicU64::new(0),
            rejected: AtomicU64::new(0),
            timed_out: AtomicU64::new(0),
        }
    }

    /// Run `fut` inside the bulkhead.
    ///
    /// Fast-fails when the wait queue is full; otherwise waits for a slot up
    /// to the configured timeout or until `token` is cancelled.
    pub async fn execute<T, F>(&self, token: &CancellationToken, fut: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        // Fast path: a free slot means no queueing at all
        let permit = match self.semaphore.try_acquire() {
            Ok(permit) => permit,
            Err(tokio::sync::TryAcquireError::Closed) => {
                return Err(Error::internal("bulkhead semaphore closed"));
            }
            Err(tokio::sync::TryAcquireError::NoPermits) => {
                if self.queued.load(Ordering::Acquire) >= self.config.max_queue_depth {
                    self.rejected.fetch_add(1, Ordering::Relaxed);
                    return Err(Error::transient(format!(
                        "bulkhead {} queue is full",
                        self.name
                    )));
                }

                self.queued.fetch_add(1, Ordering::AcqRel);
                let acquired = tokio::select! {
                    acquired = self.semaphore.acquire() => match acquired {
                        Ok(p) => Ok(p),
                        Err(_) => Err(Error::internal("bulkhead semaphore closed")),
                    },
                    _ = tokio::time::sleep(self.config.timeout) => {
                        self.timed_out.fetch_add(1, Ordering::Relaxed);
                        Err(Error::deadline_exceeded(format!(
                            "bulkhead {} acquisition timed out",
                            self.name
                        )))
                    }
                    _ = token.cancelled() => {
                        Err(Error::cancelled("bulkhead wait cancelled"))
                    }
                };
                self.queued.fetch_sub(1, Ordering::AcqRel);
                acquired?
            }
        };

        self.active.fetch_add(1, Ordering::AcqRel);
        let result = fut.await;
        self.active.fetch_sub(1, Ordering::AcqRel);
        self.executed.fetch_add(1, Ordering::Relaxed);
        drop(permit);

        result
    }

    /// Snapshot of counters
    pub fn stats(&self) -> BulkheadStats {
        BulkheadStats {
            executed: self.executed.load(Ordering::Relaxed),
            rejected: self.rejected.load(Ordering::Relaxed),
            timed_out: self.timed_out.load(Ordering::Relaxed),
            active: self.active.load(Ordering::Acquire),
            queued: self.queued.load(Ordering::Acquire),
        }
    }
}
