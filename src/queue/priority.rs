//! Priority queue
//!
//! A binary heap keyed by `(priority, enqueue sequence)`: strictly larger
//! priorities drain first, ties drain in arrival order. `put` on a full
//! queue errors rather than blocking.

use std::collections::BinaryHeap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::{Notify, Semaphore};
use tracing::debug;

use crate::metrics::{self, MetricsRecorder};

use super::{Lifecycle, QueueError, QueueResult, QueueState, QueueStats, TaskHandler};

/// Priority queue configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PriorityQueueConfig {
    /// Concurrent handler invocations.
    pub workers: usize,
    /// Capacity; `put` errors beyond it.
    pub max_size: usize,
}

impl Default for PriorityQueueConfig {
    fn default() -> Self {
        Self {
            workers: 4,
            max_size: 10_000,
        }
    }
}

struct Entry<T> {
    priority: i64,
    seq: u64,
    item: T,
}

impl<T> PartialEq for Entry<T> {
    fn eq(&self, other: &Self) -> bool {
        self.priority == other.priority && self.seq == other.seq
    }
}

impl<T> Eq for Entry<T> {}

impl<T> PartialOrd for Entry<T> {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl<T> Ord for Entry<T> {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        // Max-heap: higher priority wins, then the earlier sequence.
        self.priority
            .cmp(&other.priority)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

struct Core<T> {
    config: PriorityQueueConfig,
    heap: Mutex<BinaryHeap<Entry<T>>>,
    seq: AtomicU64,
    notify: Notify,
    lifecycle: Lifecycle,
    semaphore: Arc<Semaphore>,
    processed: AtomicU64,
    failed: AtomicU64,
    metrics: Arc<MetricsRecorder>,
}

impl<T: Send + 'static> Core<T> {
    fn pop_now(&self) -> Option<Entry<T>> {
        let mut heap = self.heap.lock();
        let popped = heap.pop();
        if popped.is_some() {
            self.metrics
                .set_gauge("fluxgate_priority_queue_depth", heap.len() as f64);
        }
        popped
    }

    /// Wait for the next item; `None` once the queue has drained during
    /// shutdown or a hard cancel arrived.
    async fn pop_wait(&self) -> Option<Entry<T>> {
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

    async fn dispatch(self: Arc<Self>, handler: Arc<dyn TaskHandler<T>>) {
        while let Some(entry) = self.pop_wait().await {
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
                tokio::select! {
                    _ = kill.cancelled() => {
                        debug!("task cancelled during shutdown");
                    }
                    result = handler.handle(entry.item) => {
                        core.metrics.observe(
                            "fluxgate_priority_queue_handle_seconds",
                            started.elapsed().as_secs_f64(),
                        );
                        match result {
                            Ok(()) => {
                                core.processed.fetch_add(1, Ordering::Relaxed);
                            }
                            Err(error) => {
                                core.failed.fetch_add(1, Ordering::Relaxed);
                                tracing::warn!(%error, "priority queue task failed");
                            }
                        }
                    }
                }
            });
        }
    }
}

/// Priority task queue.
pub struct PriorityQueue<T> {
    core: Arc<Core<T>>,
}

impl<T: Send + 'static> PriorityQueue<T> {
    /// Create a queue; the dispatcher starts on [`PriorityQueue::start`].
    pub fn new(config: PriorityQueueConfig) -> Self {
        Self::with_metrics(config, metrics::global())
    }

    /// Create a queue recording its metrics on `recorder` instead of the
    /// process default.
    pub fn with_metrics(config: PriorityQueueConfig, recorder: Arc<MetricsRecorder>) -> Self {
        let workers = config.workers.max(1);
        Self {
            core: Arc::new(Core {
                config,
                heap: Mutex::new(BinaryHeap::new()),
                seq: AtomicU64::new(0),
                notify: Notify::new(),
                lifecycle: Lifecycle::new(),
                semaphore: Arc::new(Semaphore::new(workers)),
                processed: AtomicU64::new(0),
                failed: AtomicU64::new(0),
                metrics: recorder,
            }),
        }
    }

    /// Enqueue with a priority; larger values drain first.
    pub async fn put(&self, item: T, priority: i64) -> QueueResult<()> {
        if !self.core.lifecycle.accepts_put() {
            return Err(QueueError::Stopped);
        }
        {
            let mut heap = self.core.heap.lock();
            if heap.len() >= self.core.config.max_size {
                return Err(QueueError::Full(self.core.config.max_size));
            }
            let seq = self.core.seq.fetch_add(1, Ordering::Relaxed);
            heap.push(Entry {
                priority,
                seq,
                item,
            });
            self.core
                .metrics
                .set_gauge("fluxgate_priority_queue_depth", heap.len() as f64);
        }
        self.core.notify.notify_one();
        Ok(())
    }

    /// Dequeue the highest-priority item, waiting when empty. Errors once
    /// the queue stops.
    pub async fn get(&self) -> QueueResult<T> {
        match self.core.pop_wait().await {
            Some(entry) => Ok(entry.item),
            None => Err(QueueError::Stopped),
        }
    }

    /// Start the dispatcher feeding `handler`.
    pub fn start(&self, handler: Arc<dyn TaskHandler<T>>) -> QueueResult<()> {
        self.core.lifecycle.begin_running()?;
        let core = self.core.clone();
        let join = tokio::spawn(core.dispatch(handler));
        self.core.lifecycle.store_join(join);
        Ok(())
    }

    /// Refuse new puts, drain queued work, cancel in-flight tasks after
    /// `deadline`.
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
        self.core.heap.lock().len()
    }

    /// Lifecycle state.
    pub fn state(&self) -> QueueState {
        self.core.lifecycle.state()
    }

    /// Counter snapshot.
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
