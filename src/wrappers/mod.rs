//! Callable wrappers
//!
//! This module provides:
//! - Rate-limited invocation: acquire, backing off until accepted
//! - Queued invocation: run the call on a worker pool, return a handle
//! - Circuit breaker: fail fast after sustained downstream failures
//! - Exponential and decorrelated-jitter backoff policies
//! - Batch collector: buffer items, flush on size, timeout, or close

mod backoff;
mod batch;
mod circuit_breaker;
mod queued;
mod rate_limited;

pub use backoff::{DecorrelatedJitter, ExponentialBackoff};
pub use batch::{BatchCollector, BatchCollectorConfig};
pub use circuit_breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitError, CircuitState};
pub use queued::Queued;
pub use rate_limited::{RateLimited, WaitMode, WrapperError};
