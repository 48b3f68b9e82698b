//! Distributed coordinator
//!
//! Leader election over shared storage: one key, value = the holder's
//! instance id, expiry = `ttl`. Acquisition is an atomic set-if-absent;
//! the heartbeat extends the TTL only while the value still matches, so a
//! handed-off lock is never resurrected by a stale heartbeat. At most one
//! instance holds the key at any instant, modulo clock skew within `ttl`.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use uuid::Uuid;

use crate::metrics::{self, MetricsRecorder};
use crate::storage::{Storage, StorageError};

/// Coordinator errors
#[derive(Error, Debug)]
pub enum CoordinatorError {
    /// The storage backend failed.
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    /// The coordinator was stopped.
    #[error("coordinator is stopped")]
    Stopped,
}

/// Result type for coordinator operations
pub type CoordinatorResult<T> = Result<T, CoordinatorError>;

/// Coordinator configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoordinatorConfig {
    /// Storage key naming the contested lock.
    pub lock_name: String,
    /// Lease length; a dead leader is succeeded within this plus
    /// `retry_interval`.
    pub ttl: Duration,
    /// How often a follower retries acquisition.
    pub retry_interval: Duration,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            lock_name: "fluxgate:leader".to_string(),
            ttl: Duration::from_secs(10),
            retry_interval: Duration::from_secs(1),
        }
    }
}

struct Inner {
    config: CoordinatorConfig,
    storage: Arc<dyn Storage>,
    instance_id: String,
    is_leader: AtomicBool,
    leadership: watch::Sender<bool>,
    cancel: CancellationToken,
    metrics: Arc<MetricsRecorder>,
}

impl Inner {
    fn set_leader(&self, leader: bool) {
        let was = self.is_leader.swap(leader, Ordering::AcqRel);
        if was != leader {
            if leader {
                info!(instance = %self.instance_id, lock = %self.config.lock_name, "became leader");
            } else {
                warn!(instance = %self.instance_id, lock = %self.config.lock_name, "lost leadership");
            }
            self.metrics
                .set_gauge("fluxgate_coordinator_is_leader", if leader { 1.0 } else { 0.0 });
            let _ = self.leadership.send(leader);
        }
    }

    /// One acquisition attempt: claim the key, or renew it when this
    /// instance already holds it.
    async fn try_acquire(&self) -> CoordinatorResult<bool> {
        let claimed = self
            .storage
            .set_nx(
                &self.config.lock_name,
                &self.instance_id,
                Some(self.config.ttl),
            )
            .await?;
        if claimed {
            self.set_leader(true);
            return Ok(true);
        }
        // Key exists; it may be our own lease from a previous attempt.
        let renewed = self
            .storage
            .extend_if_match(&self.config.lock_name, &self.instance_id, self.config.ttl)
            .await?;
        self.set_leader(renewed);
        Ok(renewed)
    }

    /// Extend the lease while the value still matches this instance.
    async fn heartbeat(&self) -> CoordinatorResult<bool> {
        let renewed = self
            .storage
            .extend_if_match(&self.config.lock_name, &self.instance_id, self.config.ttl)
            .await?;
        self.set_leader(renewed);
        Ok(renewed)
    }

    async fn run(self: Arc<Self>) {
        loop {
            let delay = if self.is_leader.load(Ordering::Acquire) {
                match self.heartbeat().await {
                    Ok(true) => self.config.ttl / 2,
                    Ok(false) => self.config.retry_interval,
                    Err(error) => {
                        // An unconfirmed lease does not count as leadership.
                        warn!(%error, "heartbeat failed");
                        self.set_leader(false);
                        self.config.retry_interval
                    }
                }
            } else {
                match self.try_acquire().await {
                    Ok(true) => self.config.ttl / 2,
                    Ok(false) => self.config.retry_interval,
                    Err(error) => {
                        warn!(%error, "leadership acquisition failed");
                        self.config.retry_interval
                    }
                }
            };
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = self.cancel.cancelled() => break,
            }
        }
    }
}

/// Leader elector over shared storage.
pub struct Coordinator {
    inner: Arc<Inner>,
    started: AtomicBool,
    join: Mutex<Option<JoinHandle<()>>>,
}

impl Coordinator {
    /// Create a coordinator with a fresh instance identity.
    pub fn new(config: CoordinatorConfig, storage: Arc<dyn Storage>) -> Self {
        Self::with_metrics(config, storage, metrics::global())
    }

    /// Create a coordinator recording its metrics on `recorder` instead of
    /// the process default.
    pub fn with_metrics(
        config: CoordinatorConfig,
        storage: Arc<dyn Storage>,
        recorder: Arc<MetricsRecorder>,
    ) -> Self {
        let (leadership, _) = watch::channel(false);
        Self {
            inner: Arc::new(Inner {
                config,
                storage,
                instance_id: Uuid::new_v4().to_string(),
                is_leader: AtomicBool::new(false),
                leadership,
                cancel: CancellationToken::new(),
                metrics: recorder,
            }),
            started: AtomicBool::new(false),
            join: Mutex::new(None),
        }
    }

    /// This instance's identity, the value written into the lock key.
    pub fn instance_id(&self) -> &str {
        &self.inner.instance_id
    }

    /// Last confirmed leadership state.
    pub fn is_leader(&self) -> bool {
        self.inner.is_leader.load(Ordering::Acquire)
    }

    /// Watch leadership transitions.
    pub fn leadership(&self) -> watch::Receiver<bool> {
        self.inner.leadership.subscribe()
    }

    /// Attempt to become leader once, without the background loop.
    pub async fn acquire_leadership(&self) -> CoordinatorResult<bool> {
        self.inner.try_acquire().await
    }

    /// Give up the lease if this instance still holds it.
    pub async fn release_leadership(&self) -> CoordinatorResult<()> {
        self.inner
            .storage
            .delete_if_match(&self.inner.config.lock_name, &self.inner.instance_id)
            .await?;
        self.inner.set_leader(false);
        Ok(())
    }

    /// Start the contention loop: followers retry every `retry_interval`,
    /// the leader heartbeats every `ttl / 2`.
    pub fn start(&self) -> CoordinatorResult<()> {
        if self.inner.cancel.is_cancelled() {
            return Err(CoordinatorError::Stopped);
        }
        if self.started.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        let inner = self.inner.clone();
        *self.join.lock() = Some(tokio::spawn(inner.run()));
        Ok(())
    }

    /// Stop contending and release a held lease.
    pub async fn stop(&self) -> CoordinatorResult<()> {
        if self.inner.cancel.is_cancelled() {
            return Err(CoordinatorError::Stopped);
        }
        self.inner.cancel.cancel();
        let join = self.join.lock().take();
        if let Some(join) = join {
            let _ = join.await;
        }
        self.release_leadership().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{LocalStorage, LocalStorageConfig};

    fn coordinator(storage: Arc<dyn Storage>, ttl: Duration, retry: Duration) -> Coordinator {
        Coordinator::new(
            CoordinatorConfig {
                lock_name: "test:leader".to_string(),
                ttl,
                retry_interval: retry,
            },
            storage,
        )
    }

    fn shared_storage() -> Arc<dyn Storage> {
        Arc::new(LocalStorage::new(LocalStorageConfig::default()))
    }

    #[tokio::test]
    async fn only_one_instance_acquires() {
        let storage = shared_storage();
        let a = coordinator(storage.clone(), Duration::from_secs(10), Duration::from_millis(50));
        let b = coordinator(storage, Duration::from_secs(10), Duration::from_millis(50));

        assert!(a.acquire_leadership().await.unwrap());
        assert!(!b.acquire_leadership().await.unwrap());
        assert!(a.is_leader());
        assert!(!b.is_leader());
    }

    #[tokio::test]
    async fn reacquire_renews_own_lease() {
        let storage = shared_storage();
        let a = coordinator(storage, Duration::from_secs(10), Duration::from_millis(50));

        assert!(a.acquire_leadership().await.unwrap());
        assert!(a.acquire_leadership().await.unwrap());
        assert!(a.is_leader());
    }

    #[tokio::test]
    async fn release_hands_off_promptly() {
        let storage = shared_storage();
        let a = coordinator(storage.clone(), Duration::from_secs(10), Duration::from_millis(50));
        let b = coordinator(storage, Duration::from_secs(10), Duration::from_millis(50));

        assert!(a.acquire_leadership().await.unwrap());
        a.release_leadership().await.unwrap();
        assert!(!a.is_leader());
        assert!(b.acquire_leadership().await.unwrap());
    }

    #[tokio::test]
    async fn dead_leader_is_succeeded_after_ttl() {
        let storage = shared_storage();
        let a = coordinator(storage.clone(), Duration::from_millis(100), Duration::from_millis(20));
        let b = coordinator(storage, Duration::from_millis(100), Duration::from_millis(20));

        assert!(a.acquire_leadership().await.unwrap());
        // A never heartbeats; inside the TTL, B stays follower.
        assert!(!b.acquire_leadership().await.unwrap());

        tokio::time::sleep(Duration::from_millis(120)).await;
        assert!(b.acquire_leadership().await.unwrap());
    }

    #[tokio::test]
    async fn contention_loop_elects_exactly_one() {
        let storage = shared_storage();
        let a = coordinator(storage.clone(), Duration::from_millis(200), Duration::from_millis(25));
        let b = coordinator(storage, Duration::from_millis(200), Duration::from_millis(25));

        a.start().unwrap();
        b.start().unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(a.is_leader() ^ b.is_leader());

        // Stop the leader; the survivor takes over within ttl + retry.
        let (leader, follower) = if a.is_leader() { (a, b) } else { (b, a) };
        leader.stop().await.unwrap();
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert!(follower.is_leader());
        follower.stop().await.unwrap();
    }

    #[tokio::test]
    async fn leadership_watch_reports_transitions() {
        let storage = shared_storage();
        let a = coordinator(storage, Duration::from_secs(10), Duration::from_millis(50));
        let mut watch = a.leadership();

        assert!(!*watch.borrow());
        assert!(a.acquire_leadership().await.unwrap());
        watch.changed().await.unwrap();
        assert!(*watch.borrow());
    }
}
