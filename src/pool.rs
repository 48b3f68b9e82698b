//! Auto-scaling worker pool
//!
//! Tasks submitted to the pool land in an internal queue drained by `w`
//! workers, `min_workers ≤ w ≤ max_workers`. A scaling loop samples
//! `load = pending / max(w, 1)` every `check_interval` and adds or retires
//! one worker per tick as the load crosses the configured thresholds.

use std::collections::VecDeque;
use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::{oneshot, Notify};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::metrics::{self, MetricsRecorder};

/// Worker pool errors
#[derive(Error, Debug)]
pub enum PoolError {
    /// The pool no longer accepts work.
    #[error("worker pool is stopped")]
    Stopped,

    /// The task was cancelled before it produced a result.
    #[error("task cancelled")]
    Cancelled,
}

/// Result type for pool operations
pub type PoolResult<T> = Result<T, PoolError>;

/// Worker pool configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerPoolConfig {
    /// Lower bound on workers.
    pub min_workers: usize,
    /// Upper bound on workers.
    pub max_workers: usize,
    /// Add a worker while `load` exceeds this.
    pub scale_up_threshold: f64,
    /// Retire a worker while `load` is under this.
    pub scale_down_threshold: f64,
    /// Sampling period of the scaling loop.
    pub check_interval: Duration,
}

impl Default for WorkerPoolConfig {
    fn default() -> Self {
        Self {
            min_workers: 1,
            max_workers: 8,
            scale_up_threshold: 4.0,
            scale_down_threshold: 1.0,
            check_interval: Duration::from_millis(500),
        }
    }
}

/// Completion handle returned by [`WorkerPool::submit`].
pub struct TaskHandle<R> {
    rx: oneshot::Receiver<R>,
}

impl<R> TaskHandle<R> {
    /// Wait for the task's result. Errors when the task was cancelled by
    /// shutdown before finishing.
    pub async fn join(self) -> PoolResult<R> {
        self.rx.await.map_err(|_| PoolError::Cancelled)
    }
}

type Job = Box<dyn FnOnce() -> BoxFuture<'static, ()> + Send>;

struct WorkerHandle {
    token: CancellationToken,
    join: JoinHandle<()>,
}

struct Core {
    config: WorkerPoolConfig,
    jobs: Mutex<VecDeque<Job>>,
    notify: Notify,
    /// Stop accepting submits and drain the backlog.
    shutdown: CancellationToken,
    /// Abort in-flight tasks after the drain deadline.
    kill: CancellationToken,
    worker_count: AtomicUsize,
    metrics: Arc<MetricsRecorder>,
}

impl Core {
    fn record_gauges(&self) {
        self.metrics.set_gauge(
            "fluxgate_pool_workers",
            self.worker_count.load(Ordering::Relaxed) as f64,
        );
        self.metrics
            .set_gauge("fluxgate_pool_pending", self.jobs.lock().len() as f64);
    }

    async fn worker_loop(self: Arc<Self>, token: CancellationToken) {
        loop {
            let job = loop {
                let notified = self.notify.notified();
                if let Some(job) = self.jobs.lock().pop_front() {
                    break Some(job);
                }
                if self.shutdown.is_cancelled() || token.is_cancelled() {
                    break None;
                }
                tokio::select! {
                    _ = notified => {}
                    _ = token.cancelled() => {}
                    _ = self.shutdown.cancelled() => {}
                    _ = self.kill.cancelled() => break None,
                }
            };
            let job = match job {
                Some(job) => job,
                None => break,
            };
            tokio::select! {
                _ = self.kill.cancelled() => {
                    debug!("pool task cancelled during shutdown");
                    break;
                }
                _ = job() => {}
            }
            // A retired worker finishes its current task, then leaves the
            // rest of the backlog to its peers.
            if token.is_cancelled() {
                break;
            }
        }
        self.worker_count.fetch_sub(1, Ordering::AcqRel);
        self.record_gauges();
    }

    async fn scaler_loop(self: Arc<Self>, workers: Arc<Mutex<Vec<WorkerHandle>>>) {
        let mut ticker = tokio::time::interval(self.config.check_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                _ = ticker.tick() => {}
            }
            let pending = self.jobs.lock().len();
            let count = self.worker_count.load(Ordering::Acquire);
            let load = pending as f64 / count.max(1) as f64;

            if load > self.config.scale_up_threshold && count < self.config.max_workers {
                spawn_worker(&self, &workers);
                debug!(load, workers = count + 1, "pool scaled up");
            } else if load < self.config.scale_down_threshold
                && count > self.config.min_workers.max(1)
            {
                let handles = workers.lock();
                if let Some(handle) = handles
                    .iter()
                    .rev()
                    .find(|handle| !handle.token.is_cancelled())
                {
                    handle.token.cancel();
                    // Wake it so an idle worker notices the retirement.
                    self.notify.notify_waiters();
                    debug!(load, workers = count - 1, "pool scaled down");
                }
            }
            self.record_gauges();
        }
    }
}

fn spawn_worker(core: &Arc<Core>, workers: &Arc<Mutex<Vec<WorkerHandle>>>) {
    let token = CancellationToken::new();
    core.worker_count.fetch_add(1, Ordering::AcqRel);
    let join = tokio::spawn(core.clone().worker_loop(token.clone()));
    workers.lock().push(WorkerHandle { token, join });
}

/// Auto-scaling task executor.
///
/// Must be created inside a tokio runtime; workers and the scaling loop
/// spawn immediately.
pub struct WorkerPool {
    core: Arc<Core>,
    workers: Arc<Mutex<Vec<WorkerHandle>>>,
    scaler: Mutex<Option<JoinHandle<()>>>,
}

impl WorkerPool {
    /// Create a pool and spawn `min_workers` workers plus the scaling loop.
    pub fn new(config: WorkerPoolConfig) -> Self {
        Self::with_metrics(config, metrics::global())
    }

    /// Create a pool recording its metrics on `recorder` instead of the
    /// process default.
    pub fn with_metrics(config: WorkerPoolConfig, recorder: Arc<MetricsRecorder>) -> Self {
        let core = Arc::new(Core {
            config,
            jobs: Mutex::new(VecDeque::new()),
            notify: Notify::new(),
            shutdown: CancellationToken::new(),
            kill: CancellationToken::new(),
            worker_count: AtomicUsize::new(0),
            metrics: recorder,
        });
        let workers = Arc::new(Mutex::new(Vec::new()));
        for _ in 0..core.config.min_workers.max(1) {
            spawn_worker(&core, &workers);
        }
        let scaler = tokio::spawn(core.clone().scaler_loop(workers.clone()));
        Self {
            core,
            workers,
            scaler: Mutex::new(Some(scaler)),
        }
    }

    /// Enqueue a task; the returned handle resolves to its result.
    pub fn submit<F, Fut, R>(&self, task: F) -> PoolResult<TaskHandle<R>>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = R> + Send + 'static,
        R: Send + 'static,
    {
        if self.core.shutdown.is_cancelled() {
            return Err(PoolError::Stopped);
        }
        let (tx, rx) = oneshot::channel();
        let job: Job = Box::new(move || {
            Box::pin(async move {
                let result = task().await;
                let _ = tx.send(result);
            })
        });
        self.core.jobs.lock().push_back(job);
        self.core.notify.notify_one();
        self.core.record_gauges();
        Ok(TaskHandle { rx })
    }

    /// Current worker count.
    pub fn worker_count(&self) -> usize {
        self.core.worker_count.load(Ordering::Acquire)
    }

    /// Tasks waiting for a worker.
    pub fn pending(&self) -> usize {
        self.core.jobs.lock().len()
    }

    /// Refuse new submits, drain the backlog, cancel in-flight tasks after
    /// `deadline`.
    pub async fn shutdown(&self, deadline: Option<Duration>) -> PoolResult<()> {
        if self.core.shutdown.is_cancelled() {
            return Err(PoolError::Stopped);
        }
        self.core.shutdown.cancel();
        self.core.notify.notify_waiters();

        if let Some(scaler) = self.scaler.lock().take() {
            scaler.abort();
        }

        let handles: Vec<WorkerHandle> = std::mem::take(&mut *self.workers.lock());
        let drained = async {
            for handle in handles {
                let _ = handle.join.await;
            }
        };
        match deadline {
            None => drained.await,
            Some(limit) => {
                if tokio::time::timeout(limit, drained).await.is_err() {
                    warn!(?limit, "pool drain deadline elapsed; cancelling in-flight tasks");
                    self.core.kill.cancel();
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn submit_resolves_to_result() {
        let pool = WorkerPool::new(WorkerPoolConfig::default());
        let handle = pool.submit(|| async { 2 + 2 }).unwrap();
        assert_eq!(handle.join().await.unwrap(), 4);
        pool.shutdown(None).await.unwrap();
    }

    #[tokio::test]
    async fn many_tasks_all_complete() {
        let pool = WorkerPool::new(WorkerPoolConfig {
            min_workers: 2,
            max_workers: 4,
            check_interval: Duration::from_millis(20),
            ..WorkerPoolConfig::default()
        });
        let mut handles = Vec::new();
        for i in 0..50_u64 {
            handles.push(pool.submit(move || async move { i * 2 }).unwrap());
        }
        let mut total = 0;
        for handle in handles {
            total += handle.join().await.unwrap();
        }
        assert_eq!(total, (0..50).map(|i| i * 2).sum::<u64>());
        pool.shutdown(None).await.unwrap();
    }

    #[tokio::test]
    async fn pool_scales_up_under_load() {
        let pool = WorkerPool::new(WorkerPoolConfig {
            min_workers: 1,
            max_workers: 3,
            scale_up_threshold: 1.0,
            scale_down_threshold: 0.1,
            check_interval: Duration::from_millis(10),
        });
        // Saturate the single worker with slow tasks.
        let mut handles = Vec::new();
        for _ in 0..12 {
            handles.push(
                pool.submit(|| async {
                    tokio::time::sleep(Duration::from_millis(50)).await;
                })
                .unwrap(),
            );
        }
        tokio::time::sleep(Duration::from_millis(120)).await;
        assert!(pool.worker_count() > 1);
        for handle in handles {
            handle.join().await.unwrap();
        }
        pool.shutdown(None).await.unwrap();
    }

    #[tokio::test]
    async fn worker_count_stays_within_bounds() {
        let pool = WorkerPool::new(WorkerPoolConfig {
            min_workers: 2,
            max_workers: 3,
            scale_up_threshold: 0.5,
            scale_down_threshold: 0.1,
            check_interval: Duration::from_millis(10),
        });
        tokio::time::sleep(Duration::from_millis(100)).await;
        let count = pool.worker_count();
        assert!((2..=3).contains(&count), "count {} out of bounds", count);
        pool.shutdown(None).await.unwrap();
    }

    #[tokio::test]
    async fn shutdown_refuses_new_submits() {
        let pool = WorkerPool::new(WorkerPoolConfig::default());
        pool.shutdown(None).await.unwrap();
        assert!(pool.submit(|| async {}).is_err());
    }

    #[tokio::test]
    async fn deadline_cancels_stuck_tasks() {
        let pool = WorkerPool::new(WorkerPoolConfig::default());
        let handle = pool
            .submit(|| async {
                tokio::time::sleep(Duration::from_secs(600)).await;
                42
            })
            .unwrap();
        // Give the worker a moment to pick the task up.
        tokio::time::sleep(Duration::from_millis(20)).await;
        pool.shutdown(Some(Duration::from_millis(50))).await.unwrap();

        assert!(matches!(handle.join().await, Err(PoolError::Cancelled)));
    }
}
