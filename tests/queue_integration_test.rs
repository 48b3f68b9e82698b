//! End-to-end queue and pool scenarios
//!
//! Drives the queue family and the worker pool through the public API:
//! priority drain order, dedupe suppression, full-queue rejection, and the
//! drain-then-cancel shutdown sequence.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use fluxgate::queue::{FnHandler, TaskHandler};
use fluxgate::{
    BroadcastQueue, BroadcastQueueConfig, DedupeQueue, DedupeQueueConfig, DelayQueue,
    DelayQueueConfig, PriorityQueue, PriorityQueueConfig, QueueError, WorkerPool,
    WorkerPoolConfig,
};
use parking_lot::Mutex;

#[tokio::test]
async fn priority_drain_order_matches_priorities() {
    let queue: PriorityQueue<i64> = PriorityQueue::new(PriorityQueueConfig::default());

    for priority in [1_i64, 5, 3, 5, 2] {
        queue.put(priority, priority).await.unwrap();
    }

    let mut drained = Vec::new();
    for _ in 0..5 {
        drained.push(queue.get().await.unwrap());
    }
    assert_eq!(drained, vec![5, 5, 3, 2, 1]);
}

#[tokio::test]
async fn dedupe_queue_delivers_duplicates_at_most_once() {
    let queue: DedupeQueue<String> = DedupeQueue::new(DedupeQueueConfig {
        ttl: Duration::from_secs(60),
        ..DedupeQueueConfig::default()
    });
    let delivered = Arc::new(AtomicU32::new(0));
    let delivered_in_handler = delivered.clone();
    queue
        .start(Arc::new(FnHandler(move |_item: String| {
            let delivered = delivered_in_handler.clone();
            async move {
                delivered.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        })))
        .unwrap();

    let mut rejected = 0;
    for _ in 0..5 {
        if queue.put("same-key".to_string()).await.is_err() {
            rejected += 1;
        }
    }
    queue.put("other-key".to_string()).await.unwrap();
    queue.stop(Some(Duration::from_secs(5))).await.unwrap();

    assert_eq!(rejected, 4);
    assert_eq!(delivered.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn queue_at_capacity_rejects_until_a_get() {
    let queue: PriorityQueue<u32> = PriorityQueue::new(PriorityQueueConfig {
        workers: 1,
        max_size: 3,
    });
    for i in 0..3 {
        queue.put(i, 0).await.unwrap();
    }
    assert!(matches!(queue.put(9, 0).await, Err(QueueError::Full(3))));

    queue.get().await.unwrap();
    queue.put(9, 0).await.unwrap();
    assert_eq!(queue.size(), 3);
}

#[tokio::test]
async fn delay_queue_defers_and_reorders() {
    let queue: DelayQueue<&str> = DelayQueue::new(DelayQueueConfig::default());
    let order = Arc::new(Mutex::new(Vec::new()));
    let order_in_handler = order.clone();
    queue
        .start(Arc::new(FnHandler(move |item: &'static str| {
            let order = order_in_handler.clone();
            async move {
                order.lock().push(item);
                Ok(())
            }
        })))
        .unwrap();

    queue.put("second", Duration::from_millis(80)).await.unwrap();
    queue.put("first", Duration::from_millis(20)).await.unwrap();
    tokio::time::sleep(Duration::from_millis(200)).await;
    queue.stop(Some(Duration::from_secs(1))).await.unwrap();

    assert_eq!(order.lock().as_slice(), &["first", "second"]);
}

#[tokio::test]
async fn broadcast_fans_out_without_cross_subscriber_stall() {
    let queue: BroadcastQueue<u32> = BroadcastQueue::new(BroadcastQueueConfig {
        subscriber_capacity: 4,
    });
    let mut fast = queue.subscribe().unwrap();
    let mut slow = queue.subscribe().unwrap();

    for i in 0..20 {
        queue.put(i).await.unwrap();
        assert_eq!(fast.recv().await.unwrap(), i);
    }

    // The fast subscriber saw all twenty; the slow one lost some of its
    // own backlog but still makes progress.
    let first_surviving = slow.recv().await.unwrap();
    assert!(first_surviving > 0);
    assert_eq!(slow.lagged(), u64::from(first_surviving));
}

/// Handler that blocks until told to finish, to pin items in flight.
struct GatedHandler {
    gate: Arc<tokio::sync::Notify>,
    entered: Arc<AtomicU32>,
}

#[async_trait::async_trait]
impl TaskHandler<u32> for GatedHandler {
    async fn handle(&self, _item: u32) -> Result<(), QueueError> {
        self.entered.fetch_add(1, Ordering::SeqCst);
        self.gate.notified().await;
        Ok(())
    }
}

#[tokio::test]
async fn shutdown_deadline_cancels_stuck_tasks() {
    let queue: PriorityQueue<u32> = PriorityQueue::new(PriorityQueueConfig {
        workers: 1,
        max_size: 10,
    });
    let gate = Arc::new(tokio::sync::Notify::new());
    let entered = Arc::new(AtomicU32::new(0));
    queue
        .start(Arc::new(GatedHandler {
            gate: gate.clone(),
            entered: entered.clone(),
        }))
        .unwrap();

    queue.put(1, 0).await.unwrap();
    // Wait until the worker is inside the handler.
    while entered.load(Ordering::SeqCst) == 0 {
        tokio::time::sleep(Duration::from_millis(5)).await;
    }

    // The gate never opens; the deadline must cut the task loose.
    queue.stop(Some(Duration::from_millis(100))).await.unwrap();
    assert!(matches!(queue.put(2, 0).await, Err(QueueError::Stopped)));
}

#[tokio::test]
async fn pool_runs_submitted_work_and_scales() {
    let pool = WorkerPool::new(WorkerPoolConfig {
        min_workers: 1,
        max_workers: 4,
        scale_up_threshold: 1.0,
        scale_down_threshold: 0.2,
        check_interval: Duration::from_millis(10),
    });

    let mut handles = Vec::new();
    for i in 0..40_u32 {
        handles.push(
            pool.submit(move || async move {
                tokio::time::sleep(Duration::from_millis(10)).await;
                i
            })
            .unwrap(),
        );
    }
    let mut sum = 0;
    for handle in handles {
        sum += handle.join().await.unwrap();
    }
    assert_eq!(sum, (0..40).sum::<u32>());
    assert!(pool.worker_count() >= 1);
    pool.shutdown(Some(Duration::from_secs(1))).await.unwrap();
}
