//! FIFO queue with batching
//!
//! The dispatcher accumulates up to `batch_size` items and flushes early
//! once the first item of a batch has waited `batch_timeout`. An empty
//! batch is never flushed. Failed batches are retried with exponential
//! backoff before being counted as failed.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::{Notify, Semaphore};
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::metrics::{self, MetricsRecorder};
use crate::wrappers::ExponentialBackoff;

use super::{BatchHandler, Lifecycle, QueueError, QueueResult, QueueState, QueueStats};

/// FIFO queue configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FifoQueueConfig {
    /// Concurrent batch flushes.
    pub workers: usize,
    /// Capacity; `put` errors beyond it.
    pub max_size: usize,
    /// Maximum items per flushed batch.
    pub batch_size: usize,
    /// Flush once the oldest unflushed item has waited this long.
    pub batch_timeout: Duration,
    /// Retries per failing batch before it is dropped.
    pub max_retries: u32,
}

impl Default for FifoQueueConfig {
    fn default() -> Self {
        Self {
            workers: 2,
            max_size: 10_000,
            batch_size: 32,
            batch_timeout: Duration::from_millis(500),
            max_retries: 3,
        }
    }
}

struct Core<T> {
    config: FifoQueueConfig,
    deque: Mutex<VecDeque<(Instant, T)>>,
    notify: Notify,
    lifecycle: Lifecycle,
    semaphore: Arc<Semaphore>,
    processed: AtomicU64,
    failed: AtomicU64,
    metrics: Arc<MetricsRecorder>,
}

impl<T: Clone + Send + 'static> Core<T> {
    fn pop_now(&self) -> Option<(Instant, T)> {
        let mut deque = self.deque.lock();
        let popped = deque.pop_front();
        if popped.is_some() {
            self.metrics
                .set_gauge("fluxgate_fifo_queue_depth", deque.len() as f64);
        }
        popped
    }

    async fn pop_wait(&self) -> Option<(Instant, T)> {
        loop {
            let notified = self.notify.notified();
            if let Some(entry) = self.pop_now() {
                return Some(entry);
            }
            if self.lifecycle.drain.is_cancelled() {
                return None;
            }
            tokio::select! {
                _ = notified => {}
                _ = self.lifecycle.drain.cancelled() => {}
                _ = self.lifecycle.kill.cancelled() => return None,
            }
        }
    }

    /// Gather one batch: the first item anchors the flush deadline, further
    /// items join until the batch fills or the deadline passes.
    async fn collect_batch(&self) -> Option<Vec<T>> {
        let (enqueued, first) = self.pop_wait().await?;
        let deadline = enqueued + self.config.batch_timeout;
        let mut batch = vec![first];

        while batch.len() < self.config.batch_size {
            if let Some((_, item)) = self.pop_now() {
                batch.push(item);
                continue;
            }
            if self.lifecycle.drain.is_cancelled() || self.lifecycle.kill.is_cancelled() {
                break;
            }
            let notified = self.notify.notified();
            tokio::select! {
                _ = tokio::time::sleep_until(deadline) => break,
                _ = notified => {}
                _ = self.lifecycle.drain.cancelled() => {}
                _ = self.lifecycle.kill.cancelled() => break,
            }
        }
        Some(batch)
    }

    async fn dispatch(self: Arc<Self>, handler: Arc<dyn BatchHandler<T>>) {
        while let Some(batch) = self.collect_batch().await {
            let permit = match self.semaphore.clone().acquire_owned().await {
                Ok(permit) => permit,
                Err(_) => break,
            };
            let handler = handler.clone();
            let kill = self.lifecycle.kill.clone();
            let core = self.clone();
            tokio::spawn(async move {
                let _permit = permit;
                let started = std::time::Instant::now();
                core.flush_with_retries(handler, batch, kill).await;
                core.metrics.observe(
                    "fluxgate_fifo_queue_flush_seconds",
                    started.elapsed().as_secs_f64(),
                );
            });
        }
    }

    async fn flush_with_retries(
        &self,
        handler: Arc<dyn BatchHandler<T>>,
        batch: Vec<T>,
        kill: tokio_util::sync::CancellationToken,
    ) {
        let backoff = ExponentialBackoff::default();
        let size = batch.len() as u64;
        let mut attempt = 0;
        loop {
            let outcome = tokio::select! {
                _ = kill.cancelled() => {
                    debug!("batch cancelled during shutdown");
                    return;
                }
                outcome = handler.handle_batch(batch.clone()) => outcome,
            };
            match outcome {
                Ok(()) => {
                    self.processed.fetch_add(size, Ordering::Relaxed);
                    return;
                }
                Err(error) => {
                    attempt += 1;
                    if attempt > self.config.max_retries {
                        self.failed.fetch_add(size, Ordering::Relaxed);
                        warn!(%error, attempts = attempt, "batch dropped after retries");
                        return;
                    }
                    let delay = backoff.delay(attempt - 1);
                    debug!(%error, attempt, ?delay, "batch flush failed; retrying");
                    tokio::select! {
                        _ = kill.cancelled() => return,
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
            }
        }
    }
}

/// Batching FIFO queue.
pub struct FifoQueue<T> {
    core: Arc<Core<T>>,
}

impl<T: Clone + Send + 'static> FifoQueue<T> {
    /// Create a queue; the dispatcher starts on [`FifoQueue::start`].
    pub fn new(config: FifoQueueConfig) -> Self {
        Self::with_metrics(config, metrics::global())
    }

    /// Create a queue recording its metrics on `recorder` instead of the
    /// process default.
    pub fn with_metrics(config: FifoQueueConfig, recorder: Arc<MetricsRecorder>) -> Self {
        let workers = config.workers.max(1);
        Self {
            core: Arc::new(Core {
                config,
                deque: Mutex::new(VecDeque::new()),
                notify: Notify::new(),
                lifecycle: Lifecycle::new(),
                semaphore: Arc::new(Semaphore::new(workers)),
                processed: AtomicU64::new(0),
                failed: AtomicU64::new(0),
                metrics: recorder,
            }),
        }
    }

    /// Enqueue an item at the tail.
    pub async fn put(&self, item: T) -> QueueResult<()> {
        if !self.core.lifecycle.accepts_put() {
            return Err(QueueError::Stopped);
        }
        {
            let mut deque = self.core.deque.lock();
            if deque.len() >= self.core.config.max_size {
                return Err(QueueError::Full(self.core.config.max_size));
            }
            deque.push_back((Instant::now(), item));
            self.core
                .metrics
                .set_gauge("fluxgate_fifo_queue_depth", deque.len() as f64);
        }
        self.core.notify.notify_one();
        Ok(())
    }

    /// Dequeue the head item, waiting when empty. Errors once the queue
    /// stops.
    pub async fn get(&self) -> QueueResult<T> {
        match self.core.pop_wait().await {
            Some((_, item)) => Ok(item),
            None => Err(QueueError::Stopped),
        }
    }

    /// Start the dispatcher flushing batches into `handler`.
    pub fn start(&self, handler: Arc<dyn BatchHandler<T>>) -> QueueResult<()> {
        self.core.lifecycle.begin_running()?;
        let core = self.core.clone();
        let join = tokio::spawn(core.dispatch(handler));
        self.core.lifecycle.store_join(join);
        Ok(())
    }

    /// Refuse new puts, flush what is queued, cancel in-flight batches
    /// after `deadline`.
    pub async fn stop(&self, deadline: Option<Duration>) -> QueueResult<()> {
        self.core
            .lifecycle
            .shutdown(
                deadline,
                self.core.config.workers.max(1) as u32,
                &self.core.semaphore,
                &self.core.notify,
            )
            .await
    }

    /// Items currently queued.
    pub fn size(&self) -> usize {
        self.core.deque.lock().len()
    }

    /// Lifecycle state.
    pub fn state(&self) -> QueueState {
        self.core.lifecycle.state()
    }

    /// Counter snapshot; `processed`/`failed` count items, not batches.
    pub fn stats(&self) -> QueueStats {
        let workers = self.core.config.workers.max(1);
        QueueStats {
            size: self.size(),
            in_flight: workers - self.core.semaphore.available_permits().min(workers),
            processed: self.core.processed.load(Ordering::Relaxed),
            failed: self.core.failed.load(Ordering::Relaxed),
        }
    }
}
