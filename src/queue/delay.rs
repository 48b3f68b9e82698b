//! Delay queue
//!
//! Items carry an `execute_at` instant and become visible only once it
//! passes. The dispatcher sleeps until the earliest deadline and wakes
//! early when a put schedules something sooner.

use std::collections::BinaryHeap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::{Notify, Semaphore};
use tokio::time::Instant;
use tracing::debug;

use crate::metrics::{self, MetricsRecorder};

use super::{Lifecycle, QueueError, QueueResult, QueueState, QueueStats, TaskHandler};

/// Delay queue configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DelayQueueConfig {
    /// Concurrent handler invocations.
    pub workers: usize,
    /// Capacity; `put` errors beyond it.
    pub max_size: usize,
}

impl Default for DelayQueueConfig {
    fn default() -> Self {
        Self {
            workers: 4,
            max_size: 10_000,
        }
    }
}

struct Entry<T> {
    due: Instant,
    seq: u64,
    item: T,
}

impl<T> PartialEq for Entry<T> {
    fn eq(&self, other: &Self) -> bool {
        self.due == other.due && self.seq == other.seq
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
        // Min-heap through a max-heap: the earliest deadline is "greatest",
        // ties resolved by arrival order.
        other
            .due
            .cmp(&self.due)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

enum Next<T> {
    Due(Entry<T>),
    SleepUntil(Instant),
    Empty,
}

struct Core<T> {
    config: DelayQueueConfig,
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
    fn next(&self) -> Next<T> {
        let mut heap = self.heap.lock();
        let due = match heap.peek() {
            None => return Next::Empty,
            Some(entry) => entry.due,
        };
        if due > Instant::now() {
            return Next::SleepUntil(due);
        }
        match heap.pop() {
            Some(entry) => {
                self.metrics
                    .set_gauge("fluxgate_delay_queue_depth", heap.len() as f64);
                Next::Due(entry)
            }
            None => Next::Empty,
        }
    }

    /// Wait for the next due item. During a drain, scheduled items are
    /// still honored; the deadline passed to `stop` bounds how long that
    /// can take.
    async fn pop_due_wait(&self) -> Option<Entry<T>> {
        loop {
            let notified = self.notify.notified();
            match self.next() {
                Next::Due(entry) => return Some(entry),
                Next::SleepUntil(due) => {
                    if self.lifecycle.drain.is_cancelled() {
                        tokio::select! {
                            _ = tokio::time::sleep_until(due) => {}
                            _ = self.lifecycle.kill.cancelled() => return None,
                        }
                    } else {
                        tokio::select! {
                            _ = tokio::time::sleep_until(due) => {}
                            _ = notified => {}
                            _ = self.lifecycle.drain.cancelled() => {}
                            _ = self.lifecycle.kill.cancelled() => return None,
                        }
                    }
                }
                Next::Empty => {
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
        }
    }

    async fn dispatch(self: Arc<Self>, handler: Arc<dyn TaskHandler<T>>) {
        while let Some(entry) = self.pop_due_wait().await {
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
                            "fluxgate_delay_queue_handle_seconds",
                            started.elapsed().as_secs_f64(),
                        );
                        match result {
                            Ok(()) => {
                                core.processed.fetch_add(1, Ordering::Relaxed);
                            }
                            Err(error) => {
                                core.failed.fetch_add(1, Ordering::Relaxed);
                                tracing::warn!(%error, "delay queue task failed");
                            }
                        }
                    }
                }
            });
        }
    }
}

/// Deadline-ordered task queue.
pub struct DelayQueue<T> {
    core: Arc<Core<T>>,
}

impl<T: Send + 'static> DelayQueue<T> {
    /// Create a queue; the dispatcher starts on [`DelayQueue::start`].
    pub fn new(config: DelayQueueConfig) -> Self {
        Self::with_metrics(config, metrics::global())
    }

    /// Create a queue recording its metrics on `recorder` instead of the
    /// process default.
    pub fn with_metrics(config: DelayQueueConfig, recorder: Arc<MetricsRecorder>) -> Self {
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

    /// Enqueue an item to surface after `delay`.
    pub async fn put(&self, item: T, delay: Duration) -> QueueResult<()> {
        self.put_at(item, Instant::now() + delay).await
    }

    /// Enqueue an item to surface at `execute_at`.
    pub async fn put_at(&self, item: T, execute_at: Instant) -> QueueResult<()> {
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
                due: execute_at,
                seq,
                item,
            });
            self.core
                .metrics
                .set_gauge("fluxgate_delay_queue_depth", heap.len() as f64);
        }
        // Wake the dispatcher: this put may precede its current sleep
        // target.
        self.core.notify.notify_one();
        Ok(())
    }

    /// Dequeue the next due item, waiting until one matures. Errors once
    /// the queue stops.
    pub async fn get(&self) -> QueueResult<T> {
        match self.core.pop_due_wait().await {
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

    /// Refuse new puts, honor remaining deadlines, cancel after `deadline`.
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

    /// Items currently queued, due or not.
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

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn items_surface_in_deadline_order() {
        let queue: DelayQueue<&str> = DelayQueue::new(DelayQueueConfig::default());

        queue.put("late", Duration::from_millis(80)).await.unwrap();
        queue.put("early", Duration::from_millis(20)).await.unwrap();

        assert_eq!(queue.get().await.unwrap(), "early");
        assert_eq!(queue.get().await.unwrap(), "late");
    }

    #[tokio::test]
    async fn undelayed_item_is_immediately_due() {
        let queue: DelayQueue<u32> = DelayQueue::new(DelayQueueConfig::default());
        queue.put(1, Duration::ZERO).await.unwrap();
        let got = tokio::time::timeout(Duration::from_millis(100), queue.get())
            .await
            .expect("due item should surface promptly")
            .unwrap();
        assert_eq!(got, 1);
    }

    #[tokio::test]
    async fn earlier_put_wakes_a_sleeping_getter() {
        let queue: Arc<DelayQueue<&str>> = Arc::new(DelayQueue::new(DelayQueueConfig::default()));

        let getter = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.get().await.unwrap() })
        };
        queue.put("slow", Duration::from_secs(30)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        queue.put("fast", Duration::from_millis(10)).await.unwrap();

        let got = tokio::time::timeout(Duration::from_secs(1), getter)
            .await
            .expect("earlier item should preempt the sleep")
            .unwrap();
        assert_eq!(got, "fast");
    }

    #[tokio::test]
    async fn drain_honors_pending_deadlines() {
        let queue: DelayQueue<u32> = DelayQueue::new(DelayQueueConfig::default());
        let processed = Arc::new(AtomicU64::new(0));
        let processed_in_handler = processed.clone();
        queue
            .start(Arc::new(crate::queue::FnHandler(move |_: u32| {
                let processed = processed_in_handler.clone();
                async move {
                    processed.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }
            })))
            .unwrap();

        queue.put(1, Duration::from_millis(50)).await.unwrap();
        queue.stop(Some(Duration::from_secs(2))).await.unwrap();

        assert_eq!(processed.load(Ordering::SeqCst), 1);
    }
}
