//! Dedupe queue
//!
//! A FIFO queue guarded by a membership table: items whose dedupe key was
//! already seen inside the TTL are rejected at `put`. Keys stay claimed for
//! the full TTL whether or not the first item was already dequeued, so two
//! equal items inside one TTL can never both be processed.

use std::collections::{HashMap, VecDeque};
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::{Notify, Semaphore};
use tracing::debug;

use crate::clock::{Clock, SystemClock};
use crate::metrics::{self, MetricsRecorder};

use super::{Lifecycle, QueueError, QueueResult, QueueState, QueueStats, TaskHandler};

/// Dedupe queue configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DedupeQueueConfig {
    /// Concurrent handler invocations.
    pub workers: usize,
    /// Capacity; `put` errors beyond it.
    pub max_size: usize,
    /// How long a dedupe key suppresses duplicates.
    pub ttl: Duration,
}

impl Default for DedupeQueueConfig {
    fn default() -> Self {
        Self {
            workers: 4,
            max_size: 10_000,
            ttl: Duration::from_secs(60),
        }
    }
}

/// How many puts pass between opportunistic sweeps of expired keys.
const SWEEP_EVERY: u64 = 256;

type KeyFn<T> = Box<dyn Fn(&T) -> String + Send + Sync>;

struct Core<T> {
    config: DedupeQueueConfig,
    deque: Mutex<VecDeque<T>>,
    table: Mutex<HashMap<String, Instant>>,
    key_fn: KeyFn<T>,
    puts: AtomicU64,
    clock: Arc<dyn Clock>,
    notify: Notify,
    lifecycle: Lifecycle,
    semaphore: Arc<Semaphore>,
    processed: AtomicU64,
    failed: AtomicU64,
    metrics: Arc<MetricsRecorder>,
}

impl<T: Send + 'static> Core<T> {
    fn pop_now(&self) -> Option<T> {
        let mut deque = self.deque.lock();
        let popped = deque.pop_front();
        if popped.is_some() {
            self.metrics
                .set_gauge("fluxgate_dedupe_queue_depth", deque.len() as f64);
        }
        popped
    }

    async fn pop_wait(&self) -> Option<T> {
        loop {
            let notified = self.notify.notified();
            if let Some(item) = self.pop_now() {
                return Some(item);
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
        while let Some(item) = self.pop_wait().await {
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
                    result = handler.handle(item) => {
                        core.metrics.observe(
                            "fluxgate_dedupe_queue_handle_seconds",
                            started.elapsed().as_secs_f64(),
                        );
                        match result {
                            Ok(()) => {
                                core.processed.fetch_add(1, Ordering::Relaxed);
                            }
                            Err(error) => {
                                core.failed.fetch_add(1, Ordering::Relaxed);
                                tracing::warn!(%error, "dedupe queue task failed");
                            }
                        }
                    }
                }
            });
        }
    }
}

/// Duplicate-suppressing FIFO queue.
pub struct DedupeQueue<T> {
    core: Arc<Core<T>>,
}

impl<T: Hash + Send + 'static> DedupeQueue<T> {
    /// Create a queue deriving dedupe keys from item content.
    pub fn new(config: DedupeQueueConfig) -> Self {
        Self::with_key_fn(config, |item: &T| {
            let mut hasher = std::collections::hash_map::DefaultHasher::new();
            item.hash(&mut hasher);
            format!("{:016x}", hasher.finish())
        })
    }
}

impl<T: Send + 'static> DedupeQueue<T> {
    /// Create a queue with an explicit key function.
    pub fn with_key_fn<F>(config: DedupeQueueConfig, key_fn: F) -> Self
    where
        F: Fn(&T) -> String + Send + Sync + 'static,
    {
        Self::build(config, Box::new(key_fn), Arc::new(SystemClock), metrics::global())
    }

    /// Create a queue with an explicit key function and clock; tests use
    /// this to drive TTL expiry by hand.
    pub fn with_key_fn_and_clock<F>(
        config: DedupeQueueConfig,
        key_fn: F,
        clock: Arc<dyn Clock>,
    ) -> Self
    where
        F: Fn(&T) -> String + Send + Sync + 'static,
    {
        Self::build(config, Box::new(key_fn), clock, metrics::global())
    }

    fn build(
        config: DedupeQueueConfig,
        key_fn: KeyFn<T>,
        clock: Arc<dyn Clock>,
        recorder: Arc<MetricsRecorder>,
    ) -> Self {
        let workers = config.workers.max(1);
        Self {
            core: Arc::new(Core {
                config,
                deque: Mutex::new(VecDeque::new()),
                table: Mutex::new(HashMap::new()),
                key_fn,
                puts: AtomicU64::new(0),
                clock,
                notify: Notify::new(),
                lifecycle: Lifecycle::new(),
                semaphore: Arc::new(Semaphore::new(workers)),
                processed: AtomicU64::new(0),
                failed: AtomicU64::new(0),
                metrics: recorder,
            }),
        }
    }

    /// Enqueue unless an unexpired duplicate was already accepted.
    pub async fn put(&self, item: T) -> QueueResult<()> {
        if !self.core.lifecycle.accepts_put() {
            return Err(QueueError::Stopped);
        }
        let key = (self.core.key_fn)(&item);
        let now = self.core.clock.now();
        {
            let mut table = self.core.table.lock();
            if self.core.puts.fetch_add(1, Ordering::Relaxed) % SWEEP_EVERY == SWEEP_EVERY - 1 {
                table.retain(|_, expiry| *expiry > now);
            }
            match table.get(&key) {
                Some(expiry) if *expiry > now => {
                    return Err(QueueError::Duplicate(key));
                }
                _ => {}
            }
            let mut deque = self.core.deque.lock();
            if deque.len() >= self.core.config.max_size {
                return Err(QueueError::Full(self.core.config.max_size));
            }
            table.insert(key, now + self.core.config.ttl);
            deque.push_back(item);
            self.core
                .metrics
                .set_gauge("fluxgate_dedupe_queue_depth", deque.len() as f64);
        }
        self.core.notify.notify_one();
        Ok(())
    }

    /// Whether `key` currently suppresses duplicates.
    pub fn contains(&self, key: &str) -> bool {
        let now = self.core.clock.now();
        self.core
            .table
            .lock()
            .get(key)
            .map_or(false, |expiry| *expiry > now)
    }

    /// Dequeue the head item, waiting when empty. Errors once the queue
    /// stops.
    pub async fn get(&self) -> QueueResult<T> {
        match self.core.pop_wait().await {
            Some(item) => Ok(item),
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
        self.core.deque.lock().len()
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
