//! # Fluxgate - Concurrency Control Toolkit
//!
//! A toolkit for regulating the rate at which work enters a system and
//! orchestrating how that work is scheduled, batched, deduplicated, and
//! dispatched to worker pools.
//!
//! ## Architecture
//!
//! - `clock`: Monotonic time source, injectable for tests
//! - `storage`: Key/value backends (local, Redis, two-tier hybrid) with
//!   atomic scripts
//! - `metrics`: Counters, gauges, and bounded histograms with text
//!   exposition
//! - `limiter`: Token bucket, sliding window, leaky bucket, adaptive AIMD,
//!   and composite rate limiters
//! - `queue`: Priority, batching FIFO, delay, dedupe, and broadcast queues
//!   with worker dispatch
//! - `pool`: Auto-scaling worker pool
//! - `scheduler`: Periodic task dispatcher
//! - `coordinator`: Leader election over shared storage
//! - `wrappers`: Rate-limited/queued invocation, circuit breaker, backoff,
//!   batch collector

#![warn(missing_docs)]
#![warn(clippy::all)]

// Time source
pub mod clock;

// Storage backends
pub mod storage;

// Metrics recording
pub mod metrics;

// Rate limiters
pub mod limiter;

// Task queues
pub mod queue;

// Worker pool
pub mod pool;

// Periodic scheduler
pub mod scheduler;

// Leader election
pub mod coordinator;

// Callable wrappers
pub mod wrappers;

// Re-export commonly used types
pub use clock::{Clock, ManualClock, SystemClock};
pub use coordinator::{Coordinator, CoordinatorConfig, CoordinatorError};
pub use limiter::{
    AdaptiveConfig, AdaptiveLimiter, CompositeLimiter, LeakyBucketConfig, LeakyBucketLimiter,
    LimiterError, LimiterStats, RateLimiter, SlidingWindowConfig, SlidingWindowLimiter,
    TokenBucketConfig, TokenBucketLimiter,
};
pub use metrics::MetricsRecorder;
pub use pool::{PoolError, TaskHandle, WorkerPool, WorkerPoolConfig};
pub use queue::{
    BroadcastQueue, BroadcastQueueConfig, DedupeQueue, DedupeQueueConfig, DelayQueue,
    DelayQueueConfig, FifoQueue, FifoQueueConfig, PriorityQueue, PriorityQueueConfig, QueueError,
    QueueState,
};
pub use scheduler::Scheduler;
pub use storage::{
    HybridStorage, LocalStorage, LocalStorageConfig, RemoteStorage, RemoteStorageConfig, Storage,
    StorageError,
};
pub use wrappers::{
    BatchCollector, BatchCollectorConfig, CircuitBreaker, CircuitBreakerConfig, CircuitError,
    CircuitState, ExponentialBackoff, Queued, RateLimited, WaitMode,
};

/// Crate version string.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Crate name.
pub const NAME: &str = env!("CARGO_PKG_NAME");
