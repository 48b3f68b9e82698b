//! Task queues with worker dispatch
//!
//! This module provides:
//! - Priority queue draining highest priority first, FIFO on ties
//! - FIFO queue with size- and timeout-driven batching
//! - Delay queue releasing items at their scheduled instant
//! - Dedupe queue suppressing duplicates inside a TTL
//! - Broadcast queue fanning out to per-subscriber inboxes
//!
//! Each queue owns a dispatcher that pulls items and hands them to a
//! registered handler, concurrent up to the configured worker count.
//! Shutdown is graceful: new puts are refused, queued work drains, and
//! in-flight tasks are cancelled only after an optional deadline.

use std::sync::atomic::{AtomicU8, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::{Notify, Semaphore};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::warn;

mod broadcast;
mod dedupe;
mod delay;
mod fifo;
mod priority;

pub use broadcast::{BroadcastQueue, BroadcastQueueConfig, BroadcastSubscriber};
pub use dedupe::{DedupeQueue, DedupeQueueConfig};
pub use delay::{DelayQueue, DelayQueueConfig};
pub use fifo::{FifoQueue, FifoQueueConfig};
pub use priority::{PriorityQueue, PriorityQueueConfig};

/// Queue errors
#[derive(Error, Debug)]
pub enum QueueError {
    /// The queue is at `max_size`; the item was not enqueued.
    #[error("queue is full (capacity {0})")]
    Full(usize),

    /// The queue no longer accepts work.
    #[error("queue is stopped")]
    Stopped,

    /// A dedupe queue already holds an unexpired item with this key.
    #[error("duplicate item for key {0}")]
    Duplicate(String),

    /// The operation was aborted by shutdown or caller cancellation.
    #[error("operation cancelled")]
    Cancelled,

    /// A handler reported failure.
    #[error("handler error: {0}")]
    Handler(String),
}

/// Result type for queue operations
pub type QueueResult<T> = Result<T, QueueError>;

/// Handler invoked by a queue's workers, one item at a time.
#[async_trait]
pub trait TaskHandler<T>: Send + Sync {
    /// Process one item.
    async fn handle(&self, item: T) -> QueueResult<()>;
}

/// Handler invoked by the batching FIFO queue and the batch collector.
#[async_trait]
pub trait BatchHandler<T>: Send + Sync {
    /// Process one non-empty batch.
    async fn handle_batch(&self, batch: Vec<T>) -> QueueResult<()>;
}

/// Adapter turning an async closure into a [`TaskHandler`].
pub struct FnHandler<F>(pub F);

#[async_trait]
impl<T, F, Fut> TaskHandler<T> for FnHandler<F>
where
    T: Send + 'static,
    F: Fn(T) -> Fut + Send + Sync,
    Fut: std::future::Future<Output = QueueResult<()>> + Send,
{
    async fn handle(&self, item: T) -> QueueResult<()> {
        (self.0)(item).await
    }
}

/// Adapter turning an async closure into a [`BatchHandler`].
pub struct FnBatchHandler<F>(pub F);

#[async_trait]
impl<T, F, Fut> BatchHandler<T> for FnBatchHandler<F>
where
    T: Send + 'static,
    F: Fn(Vec<T>) -> Fut + Send + Sync,
    Fut: std::future::Future<Output = QueueResult<()>> + Send,
{
    async fn handle_batch(&self, batch: Vec<T>) -> QueueResult<()> {
        (self.0)(batch).await
    }
}

/// Snapshot of a queue's counters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueStats {
    /// Items currently queued.
    pub size: usize,
    /// Items being processed right now.
    pub in_flight: usize,
    /// Items handled successfully since start.
    pub processed: u64,
    /// Items whose handler returned an error since start.
    pub failed: u64,
}

/// Externally observable queue state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum QueueState {
    /// Created; accepts puts, dispatcher not started.
    Idle,
    /// Dispatcher running.
    Running,
    /// Stop requested; draining queued work.
    Draining,
    /// Terminal; every operation errors.
    Stopped,
}

const STATE_IDLE: u8 = 0;
const STATE_RUNNING: u8 = 1;
const STATE_DRAINING: u8 = 2;
const STATE_STOPPED: u8 = 3;

/// Start/drain/kill machinery shared by the dispatching queues.
pub(crate) struct Lifecycle {
    state: AtomicU8,
    /// Signalled when a stop begins: dispatchers finish the backlog and exit.
    pub(crate) drain: CancellationToken,
    /// Signalled when the drain deadline passes: in-flight tasks abort.
    pub(crate) kill: CancellationToken,
    join: parking_lot::Mutex<Option<JoinHandle<()>>>,
}

impl Lifecycle {
    pub(crate) fn new() -> Self {
        Self {
            state: AtomicU8::new(STATE_IDLE),
            drain: CancellationToken::new(),
            kill: CancellationToken::new(),
            join: parking_lot::Mutex::new(None),
        }
    }

    pub(crate) fn state(&self) -> QueueState {
        match self.state.load(Ordering::Acquire) {
            STATE_IDLE => QueueState::Idle,
            STATE_RUNNING => QueueState::Running,
            STATE_DRAINING => QueueState::Draining,
            _ => QueueState::Stopped,
        }
    }

    pub(crate) fn accepts_put(&self) -> bool {
        matches!(self.state(), QueueState::Idle | QueueState::Running)
    }

    /// Idle → Running; errors when already started or stopped.
    pub(crate) fn begin_running(&self) -> QueueResult<()> {
        self.state
            .compare_exchange(
                STATE_IDLE,
                STATE_RUNNING,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .map(|_| ())
            .map_err(|_| QueueError::Stopped)
    }

    pub(crate) fn store_join(&self, handle: JoinHandle<()>) {
        *self.join.lock() = Some(handle);
    }

    /// Idle/Running → Draining; false when a stop already happened.
    fn begin_drain(&self) -> bool {
        loop {
            let current = self.state.load(Ordering::Acquire);
            if current == STATE_DRAINING || current == STATE_STOPPED {
                return false;
            }
            if self
                .state
                .compare_exchange(
                    current,
                    STATE_DRAINING,
                    Ordering::AcqRel,
                    Ordering::Acquire,
                )
                .is_ok()
            {
                return true;
            }
        }
    }

    /// Drive the drain-then-cancel shutdown sequence.
    ///
    /// `workers` and `semaphore` describe the dispatch concurrency: once
    /// every permit is reclaimable, no task is in flight.
    pub(crate) async fn shutdown(
        &self,
        deadline: Option<Duration>,
        workers: u32,
        semaphore: &Semaphore,
        notify: &Notify,
    ) -> QueueResult<()> {
        if !self.begin_drain() {
            return Err(QueueError::Stopped);
        }
        self.drain.cancel();
        notify.notify_waiters();

        let join = self.join.lock().take();
        let drained = async {
            if let Some(join) = join {
                let _ = join.await;
            }
            let _ = semaphore.acquire_many(workers).await;
        };
        match deadline {
            None => drained.await,
            Some(limit) => {
                if tokio::time::timeout(limit, drained).await.is_err() {
                    warn!(?limit, "drain deadline elapsed; cancelling in-flight tasks");
                    self.kill.cancel();
                }
            }
        }

        self.state.store(STATE_STOPPED, Ordering::Release);
        Ok(())
    }
}
