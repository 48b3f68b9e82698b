//! Rate limiting algorithms over pluggable storage
//!
//! This module provides five limiters behind one capability set:
//! - Token bucket with burst support
//! - Sliding window log for precise counting
//! - Leaky bucket for traffic smoothing
//! - Adaptive AIMD limiter driven by reported outcomes
//! - Composite limiter combining children all-or-nothing
//!
//! Every limiter keeps its state in a [`Storage`] backend, so the same
//! algorithm runs in-process against local storage or fleet-wide against
//! Redis with identical observable behavior.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::storage::{Storage, StorageError};

mod adaptive;
mod composite;
mod leaky_bucket;
mod sliding_window;
mod token_bucket;

pub use adaptive::{AdaptiveConfig, AdaptiveLimiter};
pub use composite::CompositeLimiter;
pub use leaky_bucket::{LeakyBucketConfig, LeakyBucketLimiter};
pub use sliding_window::{SlidingWindowConfig, SlidingWindowLimiter};
pub use token_bucket::{TokenBucketConfig, TokenBucketLimiter};

/// Limiter errors
#[derive(Error, Debug)]
pub enum LimiterError {
    /// The storage backend failed; a rejection is NOT an error.
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    /// The limiter was built with unusable parameters.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}

/// Result type for limiter operations
pub type LimiterResult<T> = Result<T, LimiterError>;

/// Point-in-time view of one key's limiter state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LimiterStats {
    /// Capacity currently available to acquire.
    pub available: f64,
    /// Maximum instantaneous capacity.
    pub max: f64,
    /// Sustained rate in permits per second.
    pub rate: f64,
    /// When the underlying state last changed, if it exists.
    pub last_update: Option<DateTime<Utc>>,
    /// Scope-qualified storage key holding the state.
    pub storage_key: String,
}

/// Uniform limiter contract.
///
/// `acquire` decides accept/reject in at most one storage round trip and
/// never sleeps; callers that want to wait compose it with backoff (see
/// the rate-limit wrapper). `Ok(false)` is an expected signal, not an
/// error.
#[async_trait]
pub trait RateLimiter: Send + Sync {
    /// Try to take `permits` for `key`. Returns whether they were granted.
    async fn acquire(&self, key: &str, permits: u32) -> LimiterResult<bool>;

    /// Return `permits` to `key`, e.g. after a cancelled composite
    /// acquisition.
    async fn release(&self, key: &str, permits: u32) -> LimiterResult<()>;

    /// Observe the key's state without consuming capacity.
    async fn stats(&self, key: &str) -> LimiterResult<LimiterStats>;
}

/// Key naming convention shared by all limiters: `{scope}:{kind}:{key}`.
pub(crate) fn state_key(scope: &str, kind: &str, key: &str) -> String {
    format!("{}:{}:{}", scope, kind, key)
}

/// Pull one field out of a script reply, treating a short reply as a
/// malformed script result.
pub(crate) fn reply_field(reply: &[f64], idx: usize) -> LimiterResult<f64> {
    reply.get(idx).copied().ok_or_else(|| {
        LimiterError::Storage(StorageError::Script(format!(
            "script reply too short: wanted field {}, got {}",
            idx,
            reply.len()
        )))
    })
}

/// Translate a script-reported state age into a wall-clock timestamp.
/// Negative ages mean the state does not exist yet.
pub(crate) fn last_update_from_age(age_secs: f64) -> Option<DateTime<Utc>> {
    if age_secs < 0.0 {
        return None;
    }
    let age = chrono::Duration::from_std(Duration::from_secs_f64(age_secs)).ok()?;
    Some(Utc::now() - age)
}

/// Validate that a configured quantity is finite and strictly positive.
pub(crate) fn require_positive(value: f64, what: &str) -> LimiterResult<()> {
    if !value.is_finite() || value <= 0.0 {
        return Err(LimiterError::InvalidConfig(format!(
            "{} must be positive, got {}",
            what, value
        )));
    }
    Ok(())
}

/// Shared helper: TTL applied to bucket state keys, generous enough that a
/// live bucket never expires between touches.
pub(crate) fn state_ttl_secs(full_drain_secs: f64) -> f64 {
    (full_drain_secs * 2.0).max(60.0)
}

/// Shared storage handle accepted by every storage-backed limiter.
pub type StorageHandle = std::sync::Arc<dyn Storage>;
