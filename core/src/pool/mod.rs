// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! Worker pool: the local execution substrate for replication tasks.
//!
//! A fixed set of workers drains a bounded queue. Each task runs under a
//! context cancelled by either the caller's token or pool shutdown, and
//! publishes a [`TaskOutcome`] to a bounded results channel.

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::{Error, Result};

/// A unit of work submitted to the pool
pub struct PoolTask {
    /// Task identifier used in results
    pub id: String,
    /// Token governing cancellation from the caller's side
    pub token: CancellationToken,
    /// The operation itself
    pub run: Pin<Box<dyn Future<Output = Result<()>> + Send>>,
}

impl PoolTask {
    /// Build a task from an id, caller token, and future
    pub fn new<F>(id: impl Into<String>, token: CancellationToken, fut: F) -> Self
    where
        F: Future<Output = Result<()>> + Send + 'static,
    {
        Self {
            id: id.into(),
            token,
            run: Box::pin(fut),
        }
    }
}

/// Result of one executed task
#[derive(Debug)]
pub struct TaskOutcome {
    /// Task identifier
    pub id: String,
    /// The task's result
    pub result: Result<()>,
    /// Wall-clock execution time
    pub elapsed: Duration,
}

/// Worker pool with bounded intake and a results channel
pub struct WorkerPool {
    queue_tx: Mutex<Option<mpsc::Sender<PoolTask>>>,
    results_rx: Mutex<Option<mpsc::Receiver<TaskOutcome>>>,
    shutdown: CancellationToken,
    workers: Mutex<Vec<tokio::task::JoinHandle<()>>>,
    stopping: Arc<AtomicBool>,
    in_flight: Arc<AtomicUsize>,
    worker_count: usize,
}

impl WorkerPool {
    /// Create a pool; `workers == 0` auto-sizes to `max(2, cpus - 1)`
    pub fn new(workers: usize) -> Self {
        let worker_count = if workers == 0 {
            std::cmp::max(2, num_cpus::get().saturating_sub(1))
        } else {
            workers
        };
        let queue_capacity = worker_count * 10;

        let (queue_tx, queue_rx) = mpsc::channel::<PoolTask>(queue_capacity);
        let (results_tx, results_rx) = mpsc::channel::<TaskOutcome>(queue_capacity);
        let shutdown = CancellationToken::new();
        let in_flight = Arc::new(AtomicUsize::new(0));

        let queue_rx = Arc::new(Mutex::new(queue_rx));
        let mut handles = Vec::with_capacity(worker_count);
        for worker_id in 0..worker_count {
            let queue_rx = queue_rx.clone();
            let results_tx = results_tx.clone();
            let shutdown = shutdown.clone();
            let in_flight = in_flight.clone();

            handles.push(tokio::spawn(async move {
                loop {
                    let task = {
                        let mut rx = queue_rx.lock().await;
                        tokio::select! {
                            task = rx.recv() => task,
                            _ = shutdown.cancelled() => None,
                        }
                    };
                    let Some(task) = task else {
                        debug!(worker_id, "worker exiting");
                        return;
                    };
                    let PoolTask { id, token, run } = task;

                    in_flight.fetch_add(1, Ordering::AcqRel);
                    let started = Instant::now();

                    // Cancelled by the caller's token or pool shutdown,
                    // whichever fires first
                    let result = tokio::select! {
                        result = run => result,
                        _ = token.cancelled() => {
                            Err(Error::cancelled("task cancelled by caller"))
                        }
                        _ = shutdown.cancelled() => {
                            Err(Error::cancelled("pool shutting down"))
                        }
                    };

                    let outcome = TaskOutcome {
                        id,
                        result,
                        elapsed: started.elapsed(),
                    };
                    // Non-blocking send preserves worker liveness
                    if let Err(err) = results_tx.try_send(outcome) {
                        warn!(worker_id, %err, "results channel full, dropping outcome");
                    }
                    in_flight.fetch_sub(1, Ordering::AcqRel);
                }
            }));
        }

        Self {
            queue_tx: Mutex::new(Some(queue_tx)),
            results_rx: Mutex::new(Some(results_rx)),
            shutdown,
            workers: Mutex::new(handles),
            stopping: Arc::new(AtomicBool::new(false)),
            in_flight,
            worker_count,
        }
    }

    /// Number of workers
    pub fn worker_count(&self) -> usize {
        self.worker_count
    }

    /// Tasks currently executing
    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::Acquire)
    }

    /// Submit a task; fails when the pool is stopping or the queue is full
    pub async fn submit(&self, task: PoolTask) -> Result<()> {
        if self.stopping.load(Ordering::Acquire) {
            return Err(Error::invalid_input("worker pool is stopping"));
        }
        let guard = self.queue_tx.lock().await;
        let Some(tx) = guard.as_ref() else {
            return Err(Error::invalid_input("worker pool is stopping"));
        };
        tx.try_send(task).map_err(|err| match err {
            mpsc::error::TrySendError::Full(_) => Error::transient("worker pool queue is full"),
            mpsc::error::TrySendError::Closed(_) => {
                Error::invalid_input("worker pool is stopping")
            }
        })
    }

    /// Take the results receiver; callable once
    pub async fn take_results(&self) -> Option<mpsc::Receiver<TaskOutcome>> {
        self.results_rx.lock().await.take()
    }

    /// Close the intake, wait for all workers to drain, then stop.
    ///
    /// Safe to call once; subsequent submissions fail.
    pub async fn wait(&self) {
        self.stopping.store(true, Ordering::Release);
        // Dropping the sender closes the queue; workers exit on drain
        self.queue_tx.lock().await.take();

        let mut handles = self.workers.lock().await;
        for handle in handles.drain(..) {
            let _ = handle.await;
        }
    }

    /// Cancel all work and wait for workers to exit
    pub async fn stop(&self) {
        self.stopping.store(true, Ordering::Release);
        self.shutdown.cancel();
        self.queue_tx.lock().await.take();

        let mut handles = self.workers.lock().await;
        for handle in handles.drain(..) {
            let _ = handle.await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;

    #[tokio::test]
    async fn test_executes_submitted_tasks() {
        let pool = WorkerPool::new(2);
        let counter = Arc::new(AtomicU32::new(0));

        for i in 0..5 {
            let counter = counter.clone();
            pool.submit(PoolTask::new(
                format!("task-{i}"),
                CancellationToken::new(),
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                },
            ))
            .await
            .unwrap();
        }

        pool.wait().await;
        assert_eq!(counter.load(Ordering::SeqCst), 5);
    }

    #[tokio::test]
    async fn test_results_carry_outcome_and_duration() {
        let pool = WorkerPool::new(1);
        let mut results = pool.take_results().await.unwrap();

        pool.submit(PoolTask::new(
            "ok-task",
            CancellationToken::new(),
            async { Ok(()) },
        ))
        .await
        .unwrap();
        pool.submit(PoolTask::new(
            "bad-task",
            CancellationToken::new(),
            async { Err(Error::transient("nope")) },
        ))
        .await
        .unwrap();

        pool.wait().await;

        let first = results.recv().await.unwrap();
        assert_eq!(first.id, "ok-task");
        assert!(first.result.is_ok());

        let second = results.recv().await.unwrap();
        assert_eq!(second.id, "bad-task");
        assert!(second.result.is_err());
    }

    #[tokio::test]
    async fn test_submit_after_wait_fails() {
        let pool = WorkerPool::new(1);
        pool.wait().await;

        let err = pool
            .submit(PoolTask::new("late", CancellationToken::new(), async {
                Ok(())
            }))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::InvalidInput);
    }

    #[tokio::test]
    async fn test_caller_cancellation() {
        let pool = WorkerPool::new(1);
        let mut results = pool.take_results().await.unwrap();

        let token = CancellationToken::new();
        token.cancel();
        pool.submit(PoolTask::new("cancelled", token, async {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok(())
        }))
        .await
        .unwrap();

        let outcome = results.recv().await.unwrap();
        assert_eq!(
            outcome.result.unwrap_err().kind(),
            crate::error::ErrorKind::Cancelled
        );
        pool.stop().await;
    }

    #[tokio::test]
    async fn test_stop_cancels_in_flight() {
        let pool = WorkerPool::new(1);

        pool.submit(PoolTask::new(
            "slow",
            CancellationToken::new(),
            async {
                tokio::time::sleep(Duration::from_secs(60)).await;
                Ok(())
            },
        ))
        .await
        .unwrap();

        tokio::task::yield_now().await;
        pool.stop().await;
    }

    #[test]
    fn test_auto_sizing() {
        let pool_size = if num_cpus::get() <= 3 {
            2
        } else {
            num_cpus::get() - 1
        };
        // Constructed inside a runtime because workers spawn immediately
        let rt = tokio::runtime::Runtime::new().unwrap();
        rt.block_on(async {
            let pool = WorkerPool::new(0);
            assert_eq!(pool.worker_count(), pool_size);
            pool.stop().await;
        });
    }
}
