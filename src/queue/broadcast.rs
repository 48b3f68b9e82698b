//! Broadcast queue
//!
//! Fan-out: every subscriber gets its own bounded inbox and a copy of each
//! item. A subscriber that falls behind loses its own oldest items and is
//! told how many, while the rest of the subscribers stream on undisturbed.

use std::sync::Arc;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::debug;

use crate::metrics::{self, MetricsRecorder};

use super::{QueueError, QueueResult, QueueState};

/// Broadcast queue configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BroadcastQueueConfig {
    /// Per-subscriber inbox capacity; the oldest unread item is dropped
    /// for that subscriber beyond it.
    pub subscriber_capacity: usize,
}

impl Default for BroadcastQueueConfig {
    fn default() -> Self {
        Self {
            subscriber_capacity: 1024,
        }
    }
}

/// Fan-out queue.
pub struct BroadcastQueue<T> {
    sender: RwLock<Option<broadcast::Sender<T>>>,
    metrics: Arc<MetricsRecorder>,
}

impl<T: Clone + Send + 'static> BroadcastQueue<T> {
    /// Create a queue.
    pub fn new(config: BroadcastQueueConfig) -> Self {
        Self::with_metrics(config, metrics::global())
    }

    /// Create a queue recording its metrics on `recorder` instead of the
    /// process default.
    pub fn with_metrics(config: BroadcastQueueConfig, recorder: Arc<MetricsRecorder>) -> Self {
        let (sender, _) = broadcast::channel(config.subscriber_capacity.max(1));
        Self {
            sender: RwLock::new(Some(sender)),
            metrics: recorder,
        }
    }

    /// Deliver a copy of `item` to every current subscriber. Fan-out to
    /// zero subscribers is a no-op, not an error.
    pub async fn put(&self, item: T) -> QueueResult<()> {
        let sender = self.sender.read();
        match sender.as_ref() {
            None => Err(QueueError::Stopped),
            Some(sender) => {
                let receivers = sender.send(item).unwrap_or(0);
                self.metrics
                    .incr_counter("fluxgate_broadcast_fanout_total", receivers as u64);
                Ok(())
            }
        }
    }

    /// Open a new subscription. Items put before this call are not
    /// delivered to it.
    pub fn subscribe(&self) -> QueueResult<BroadcastSubscriber<T>> {
        let sender = self.sender.read();
        match sender.as_ref() {
            None => Err(QueueError::Stopped),
            Some(sender) => Ok(BroadcastSubscriber {
                receiver: sender.subscribe(),
                lagged: 0,
            }),
        }
    }

    /// Undelivered items buffered for the slowest subscriber.
    pub fn size(&self) -> usize {
        self.sender
            .read()
            .as_ref()
            .map_or(0, |sender| sender.len())
    }

    /// Current subscriber count.
    pub fn subscriber_count(&self) -> usize {
        self.sender
            .read()
            .as_ref()
            .map_or(0, |sender| sender.receiver_count())
    }

    /// Lifecycle state; broadcast has no dispatcher, so it is either
    /// running or stopped.
    pub fn state(&self) -> QueueState {
        if self.sender.read().is_some() {
            QueueState::Running
        } else {
            QueueState::Stopped
        }
    }

    /// Stop accepting puts. Subscribers drain whatever is already buffered
    /// and then observe the stop.
    pub async fn stop(&self) -> QueueResult<()> {
        let sender = self.sender.write().take();
        match sender {
            None => Err(QueueError::Stopped),
            Some(_) => Ok(()),
        }
    }
}

/// One subscriber's view of a [`BroadcastQueue`].
pub struct BroadcastSubscriber<T> {
    receiver: broadcast::Receiver<T>,
    lagged: u64,
}

impl<T: Clone + Send + 'static> BroadcastSubscriber<T> {
    /// Receive the next item. When this subscriber has fallen behind, the
    /// drop is recorded in [`BroadcastSubscriber::lagged`] and the oldest
    /// surviving item is returned instead of an error.
    pub async fn recv(&mut self) -> QueueResult<T> {
        loop {
            match self.receiver.recv().await {
                Ok(item) => return Ok(item),
                Err(broadcast::error::RecvError::Lagged(missed)) => {
                    self.lagged += missed;
                    debug!(missed, "broadcast subscriber lagged; oldest items dropped");
                }
                Err(broadcast::error::RecvError::Closed) => return Err(QueueError::Stopped),
            }
        }
    }

    /// Total items this subscriber has lost to backpressure.
    pub fn lagged(&self) -> u64 {
        self.lagged
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn every_subscriber_sees_every_item() {
        let queue: BroadcastQueue<u32> = BroadcastQueue::new(BroadcastQueueConfig::default());
        let mut a = queue.subscribe().unwrap();
        let mut b = queue.subscribe().unwrap();

        queue.put(1).await.unwrap();
        queue.put(2).await.unwrap();

        assert_eq!(a.recv().await.unwrap(), 1);
        assert_eq!(a.recv().await.unwrap(), 2);
        assert_eq!(b.recv().await.unwrap(), 1);
        assert_eq!(b.recv().await.unwrap(), 2);
    }

    #[tokio::test]
    async fn slow_subscriber_drops_its_own_oldest() {
        let queue: BroadcastQueue<u32> = BroadcastQueue::new(BroadcastQueueConfig {
            subscriber_capacity: 2,
        });
        let mut slow = queue.subscribe().unwrap();

        for i in 0..5 {
            queue.put(i).await.unwrap();
        }

        // Items 0..3 were pushed out of the two-slot inbox.
        assert_eq!(slow.recv().await.unwrap(), 3);
        assert_eq!(slow.recv().await.unwrap(), 4);
        assert_eq!(slow.lagged(), 3);
    }

    #[tokio::test]
    async fn fast_subscriber_is_not_stalled_by_slow_one() {
        let queue: BroadcastQueue<u32> = BroadcastQueue::new(BroadcastQueueConfig {
            subscriber_capacity: 2,
        });
        let mut fast = queue.subscribe().unwrap();
        let mut slow = queue.subscribe().unwrap();

        for i in 0..10 {
            queue.put(i).await.unwrap();
            assert_eq!(fast.recv().await.unwrap(), i);
        }
        // The slow subscriber lost items but the fast one saw all ten.
        assert!(slow.recv().await.is_ok());
        assert!(slow.lagged() > 0);
    }

    #[tokio::test]
    async fn stop_lets_subscribers_drain_then_close() {
        let queue: BroadcastQueue<&str> = BroadcastQueue::new(BroadcastQueueConfig::default());
        let mut sub = queue.subscribe().unwrap();

        queue.put("last").await.unwrap();
        queue.stop().await.unwrap();

        assert!(matches!(queue.put("nope").await, Err(QueueError::Stopped)));
        assert_eq!(sub.recv().await.unwrap(), "last");
        assert!(matches!(sub.recv().await, Err(QueueError::Stopped)));
        assert_eq!(queue.state(), QueueState::Stopped);
    }

    #[tokio::test]
    async fn put_without_subscribers_is_noop() {
        let queue: BroadcastQueue<u32> = BroadcastQueue::new(BroadcastQueueConfig::default());
        queue.put(1).await.unwrap();
        assert_eq!(queue.subscriber_count(), 0);
    }
}
