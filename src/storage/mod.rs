//! Storage backends for limiter state and coordination
//!
//! This module provides:
//! - A uniform async key/value contract with atomic counters and TTLs
//! - Named atomic scripts executed as one indivisible step per backend
//! - Local in-memory backend with LRU eviction
//! - Remote Redis backend using server-side Lua execution
//! - Two-tier hybrid backend (local L1 over remote L2)

use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

mod hybrid;
mod local;
mod remote;
mod script;

pub use hybrid::HybridStorage;
pub use local::{LocalStorage, LocalStorageConfig};
pub use remote::{RemoteStorage, RemoteStorageConfig};
pub use script::Script;

/// Storage errors
#[derive(Error, Debug)]
pub enum StorageError {
    /// The backend could not be reached. Retryable.
    #[error("storage connection error: {0}")]
    Connection(String),

    /// The backend is temporarily overloaded. Retryable.
    #[error("storage busy: {0}")]
    Busy(String),

    /// A stored value could not be decoded. Not retryable.
    #[error("malformed value at {key}: {reason}")]
    Corrupt { key: String, reason: String },

    /// An atomic script failed server-side. Not retryable.
    #[error("script error: {0}")]
    Script(String),
}

impl StorageError {
    /// Whether the caller may retry the operation with backoff.
    pub fn is_retryable(&self) -> bool {
        matches!(self, StorageError::Connection(_) | StorageError::Busy(_))
    }

    pub(crate) fn corrupt(key: &str, reason: impl Into<String>) -> Self {
        StorageError::Corrupt {
            key: key.to_string(),
            reason: reason.into(),
        }
    }
}

impl From<redis::RedisError> for StorageError {
    fn from(err: redis::RedisError) -> Self {
        use redis::ErrorKind;
        if err.is_io_error() || err.is_timeout() || err.is_connection_refusal() || err.is_connection_dropped() {
            return StorageError::Connection(err.to_string());
        }
        match err.kind() {
            ErrorKind::TryAgain | ErrorKind::BusyLoadingError | ErrorKind::MasterDown => {
                StorageError::Busy(err.to_string())
            }
            ErrorKind::TypeError => StorageError::Corrupt {
                key: String::new(),
                reason: err.to_string(),
            },
            _ => StorageError::Script(err.to_string()),
        }
    }
}

/// Result type for storage operations
pub type StorageResult<T> = Result<T, StorageError>;

/// Uniform storage contract shared by all backends.
///
/// `incr`, `decr`, `set_nx`, `extend_if_match`, `delete_if_match`, and
/// [`Storage::run_script`] are linearizable with respect to concurrent
/// callers on the same instance. Keys set with a TTL disappear after the
/// duration elapses; removal is observable by `get`, `exists`, and the
/// counters (a missing counter reads as zero).
#[async_trait]
pub trait Storage: Send + Sync {
    /// Read a value, or `None` when absent or expired.
    async fn get(&self, key: &str) -> StorageResult<Option<String>>;

    /// Write a value, replacing any previous one.
    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> StorageResult<()>;

    /// Write a value only if the key is absent. Returns whether it was set.
    async fn set_nx(&self, key: &str, value: &str, ttl: Option<Duration>) -> StorageResult<bool>;

    /// Remove a key. Returns whether it existed.
    async fn delete(&self, key: &str) -> StorageResult<bool>;

    /// Whether the key currently exists.
    async fn exists(&self, key: &str) -> StorageResult<bool>;

    /// Atomically add `delta` to a numeric key (missing reads as zero) and
    /// return the new value.
    async fn incr(&self, key: &str, delta: f64) -> StorageResult<f64>;

    /// Atomically subtract `delta` from a numeric key and return the new value.
    async fn decr(&self, key: &str, delta: f64) -> StorageResult<f64> {
        self.incr(key, -delta).await
    }

    /// Residual time-to-live of a key, `None` when the key is absent or has
    /// no expiry.
    async fn ttl(&self, key: &str) -> StorageResult<Option<Duration>>;

    /// Refresh the TTL of `key` only while its value still equals `value`.
    /// Returns whether the extension happened.
    async fn extend_if_match(&self, key: &str, value: &str, ttl: Duration) -> StorageResult<bool>;

    /// Delete `key` only while its value still equals `value`. Returns
    /// whether the deletion happened.
    async fn delete_if_match(&self, key: &str, value: &str) -> StorageResult<bool>;

    /// Execute a named atomic script.
    ///
    /// The script observes the backend's clock, reads and writes the given
    /// keys as one indivisible step, and returns a numeric reply. See
    /// [`Script`] for the per-script key/argument/reply conventions.
    async fn run_script(&self, script: Script, keys: &[&str], args: &[f64])
        -> StorageResult<Vec<f64>>;
}
