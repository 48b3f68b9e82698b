//! Two-tier hybrid storage
//!
//! A local L1 in front of an authoritative L2 (normally remote). Reads
//! populate L1 with a capped TTL; counters, conditional ops, and atomic
//! scripts always invalidate L1 first and run against L2 so a stale cached
//! value can never influence an admission decision.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use super::{LocalStorage, LocalStorageConfig, Script, Storage, StorageResult};

/// Upper bound on how long a value read through the hybrid tier may live
/// in L1 regardless of its L2 expiry.
const L1_TTL_CAP: Duration = Duration::from_secs(60);

/// Local-over-remote two-tier storage.
///
/// Remote unavailability surfaces to the caller as a retryable error; the
/// hybrid tier never silently answers counter traffic from L1.
pub struct HybridStorage {
    l1: LocalStorage,
    l2: Arc<dyn Storage>,
}

impl HybridStorage {
    /// Build a hybrid tier over an authoritative backend.
    pub fn new(l1_config: LocalStorageConfig, l2: Arc<dyn Storage>) -> Self {
        Self {
            l1: LocalStorage::new(l1_config),
            l2,
        }
    }

    fn l1_ttl(residual: Option<Duration>) -> Duration {
        residual.map_or(L1_TTL_CAP, |ttl| ttl.min(L1_TTL_CAP))
    }

    async fn invalidate_l1(&self, key: &str) -> StorageResult<()> {
        self.l1.delete(key).await?;
        Ok(())
    }
}

#[async_trait]
impl Storage for HybridStorage {
    async fn get(&self, key: &str) -> StorageResult<Option<String>> {
        if let Some(value) = self.l1.get(key).await? {
            return Ok(Some(value));
        }
        let value = self.l2.get(key).await?;
        if let Some(value) = &value {
            let residual = self.l2.ttl(key).await?;
            self.l1
                .set(key, value, Some(Self::l1_ttl(residual)))
                .await?;
        }
        Ok(value)
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> StorageResult<()> {
        self.l2.set(key, value, ttl).await?;
        self.l1.set(key, value, Some(Self::l1_ttl(ttl))).await
    }

    async fn set_nx(&self, key: &str, value: &str, ttl: Option<Duration>) -> StorageResult<bool> {
        // Only L2 can arbitrate first-writer-wins; L1 merely mirrors the
        // outcome.
        self.invalidate_l1(key).await?;
        let set = self.l2.set_nx(key, value, ttl).await?;
        if set {
            self.l1.set(key, value, Some(Self::l1_ttl(ttl))).await?;
        }
        Ok(set)
    }

    async fn delete(&self, key: &str) -> StorageResult<bool> {
        self.invalidate_l1(key).await?;
        self.l2.delete(key).await
    }

    async fn exists(&self, key: &str) -> StorageResult<bool> {
        if self.l1.exists(key).await? {
            return Ok(true);
        }
        self.l2.exists(key).await
    }

    async fn incr(&self, key: &str, delta: f64) -> StorageResult<f64> {
        self.invalidate_l1(key).await?;
        self.l2.incr(key, delta).await
    }

    async fn ttl(&self, key: &str) -> StorageResult<Option<Duration>> {
        self.l2.ttl(key).await
    }

    async fn extend_if_match(&self, key: &str, value: &str, ttl: Duration) -> StorageResult<bool> {
        self.invalidate_l1(key).await?;
        self.l2.extend_if_match(key, value, ttl).await
    }

    async fn delete_if_match(&self, key: &str, value: &str) -> StorageResult<bool> {
        self.invalidate_l1(key).await?;
        self.l2.delete_if_match(key, value).await
    }

    async fn run_script(
        &self,
        script: Script,
        keys: &[&str],
        args: &[f64],
    ) -> StorageResult<Vec<f64>> {
        for key in keys {
            self.invalidate_l1(key).await?;
        }
        self.l2.run_script(script, keys, args).await
    }
}
