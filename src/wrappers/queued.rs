//! Queued invocation
//!
//! Routes each call through a worker pool instead of running it inline.
//! The caller gets a completion handle immediately; the pool's workers
//! perform the call, subject to the pool's scaling and shutdown rules.

use std::future::Future;
use std::sync::Arc;

use crate::pool::{PoolResult, TaskHandle, WorkerPool};

/// Pool-dispatched async callable.
pub struct Queued<F> {
    pool: Arc<WorkerPool>,
    inner: Arc<F>,
}

impl<F> Queued<F> {
    /// Wrap `inner`, dispatching every call onto `pool`.
    pub fn new(pool: Arc<WorkerPool>, inner: F) -> Self {
        Self {
            pool,
            inner: Arc::new(inner),
        }
    }

    /// Enqueue one call; the handle resolves to its result.
    pub fn call<Req, Fut, Out>(&self, request: Req) -> PoolResult<TaskHandle<Out>>
    where
        F: Fn(Req) -> Fut + Send + Sync + 'static,
        Req: Send + 'static,
        Fut: Future<Output = Out> + Send + 'static,
        Out: Send + 'static,
    {
        let inner = self.inner.clone();
        self.pool.submit(move || inner(request))
    }
}
