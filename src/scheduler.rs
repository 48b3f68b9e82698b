//! Periodic task scheduler
//!
//! Registers `(interval, name, task)` entries and drives them from one
//! loop: sleep until the nearest deadline, fire whatever is due, advance
//! each fired entry by its interval. Registering a new entry wakes the
//! loop so a short interval never waits behind a long sleep.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use parking_lot::Mutex;
use thiserror::Error;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::metrics::{self, MetricsRecorder};

/// Scheduler errors
#[derive(Error, Debug)]
pub enum SchedulerError {
    /// `start` was called twice.
    #[error("scheduler already started")]
    AlreadyStarted,

    /// The scheduler was stopped.
    #[error("scheduler is stopped")]
    Stopped,
}

/// Result type for scheduler operations
pub type SchedulerResult<T> = Result<T, SchedulerError>;

type TaskFn = Arc<dyn Fn() -> BoxFuture<'static, ()> + Send + Sync>;

struct Entry {
    name: String,
    interval: Duration,
    next_run: Instant,
    task: TaskFn,
}

struct Inner {
    entries: Mutex<Vec<Entry>>,
    notify: Notify,
    cancel: CancellationToken,
    metrics: Arc<MetricsRecorder>,
}

impl Inner {
    fn nearest(&self) -> Option<Instant> {
        self.entries.lock().iter().map(|e| e.next_run).min()
    }

    fn fire_due(&self) {
        let now = Instant::now();
        let mut entries = self.entries.lock();
        for entry in entries.iter_mut() {
            if entry.next_run <= now {
                debug!(name = %entry.name, "scheduler firing");
                self.metrics
                    .incr_counter("fluxgate_scheduler_fired_total", 1);
                tokio::spawn((entry.task)());
                entry.next_run += entry.interval;
            }
        }
    }

    async fn run(self: Arc<Self>) {
        loop {
            match self.nearest() {
                None => {
                    tokio::select! {
                        _ = self.notify.notified() => {}
                        _ = self.cancel.cancelled() => break,
                    }
                }
                Some(at) => {
                    tokio::select! {
                        _ = tokio::time::sleep_until(at) => self.fire_due(),
                        _ = self.notify.notified() => {}
                        _ = self.cancel.cancelled() => break,
                    }
                }
            }
        }
    }
}

/// Periodic task dispatcher.
pub struct Scheduler {
    inner: Arc<Inner>,
    started: AtomicBool,
    join: Mutex<Option<JoinHandle<()>>>,
}

impl Scheduler {
    /// Create an empty scheduler.
    pub fn new() -> Self {
        Self::with_metrics(metrics::global())
    }

    /// Create a scheduler recording its metrics on `recorder` instead of
    /// the process default.
    pub fn with_metrics(recorder: Arc<MetricsRecorder>) -> Self {
        Self {
            inner: Arc::new(Inner {
                entries: Mutex::new(Vec::new()),
                notify: Notify::new(),
                cancel: CancellationToken::new(),
                metrics: recorder,
            }),
            started: AtomicBool::new(false),
            join: Mutex::new(None),
        }
    }

    /// Register `task` to fire every `interval`, first run one interval
    /// from now. Registration works before or after `start`.
    pub fn every<F, Fut>(&self, name: &str, interval: Duration, task: F) -> SchedulerResult<()>
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = ()> + Send + 'static,
    {
        if self.inner.cancel.is_cancelled() {
            return Err(SchedulerError::Stopped);
        }
        let task: TaskFn = Arc::new(move || Box::pin(task()));
        self.inner.entries.lock().push(Entry {
            name: name.to_string(),
            interval,
            next_run: Instant::now() + interval,
            task,
        });
        self.inner.notify.notify_waiters();
        Ok(())
    }

    /// Start the dispatch loop.
    pub fn start(&self) -> SchedulerResult<()> {
        if self.inner.cancel.is_cancelled() {
            return Err(SchedulerError::Stopped);
        }
        if self.started.swap(true, Ordering::AcqRel) {
            return Err(SchedulerError::AlreadyStarted);
        }
        let inner = self.inner.clone();
        *self.join.lock() = Some(tokio::spawn(inner.run()));
        Ok(())
    }

    /// Stop the loop; already-spawned firings run to completion.
    pub async fn stop(&self) -> SchedulerResult<()> {
        if self.inner.cancel.is_cancelled() {
            return Err(SchedulerError::Stopped);
        }
        self.inner.cancel.cancel();
        let join = self.join.lock().take();
        if let Some(join) = join {
            let _ = join.await;
        }
        Ok(())
    }

    /// Number of registered entries.
    pub fn len(&self) -> usize {
        self.inner.entries.lock().len()
    }

    /// Whether no entries are registered.
    pub fn is_empty(&self) -> bool {
        self.inner.entries.lock().is_empty()
    }
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new()
    }
}
