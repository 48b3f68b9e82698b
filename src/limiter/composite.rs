//! Composite limiter
//!
//! Chains limiters so an acquisition succeeds only when every child
//! accepts. Children are debited in order; when a later child rejects, the
//! earlier debits are compensated with matching releases so the composite
//! is observably all-or-nothing. A caller that drops the acquire future
//! mid-flight gets the same compensation, spawned in the background.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::warn;

use super::{LimiterError, LimiterResult, LimiterStats, RateLimiter};

/// Tracks which children have been debited during one acquire, so every
/// exit path, including the caller dropping the future, returns them.
struct DebitGuard {
    debited: Vec<Arc<dyn RateLimiter>>,
    key: String,
    permits: u32,
}

impl DebitGuard {
    fn new(key: &str, permits: u32) -> Self {
        Self {
            debited: Vec::new(),
            key: key.to_string(),
            permits,
        }
    }

    fn push(&mut self, child: Arc<dyn RateLimiter>) {
        self.debited.push(child);
    }

    fn disarm(&mut self) {
        self.debited.clear();
    }

    /// Return permits to every debited child, logging rather than failing
    /// when a compensation itself cannot be delivered.
    async fn compensate_now(&mut self) {
        let debited = std::mem::take(&mut self.debited);
        for (idx, child) in debited.into_iter().enumerate() {
            if let Err(error) = child.release(&self.key, self.permits).await {
                warn!(
                    child = idx,
                    key = %self.key,
                    permits = self.permits,
                    %error,
                    "composite compensation failed; residual imbalance remains"
                );
            }
        }
    }
}

impl Drop for DebitGuard {
    fn drop(&mut self) {
        if self.debited.is_empty() {
            return;
        }
        // The acquire future was dropped between children; compensation
        // cannot run inline, so hand it to the runtime.
        let debited = std::mem::take(&mut self.debited);
        let key = std::mem::take(&mut self.key);
        let permits = self.permits;
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            handle.spawn(async move {
                for child in debited {
                    if let Err(error) = child.release(&key, permits).await {
                        warn!(key = %key, permits, %error, "deferred composite compensation failed");
                    }
                }
            });
        } else {
            warn!(key = %key, permits, "composite acquire dropped outside a runtime; debits leak until state TTL");
        }
    }
}

/// Conjunction of child limiters.
pub struct CompositeLimiter {
    children: Vec<Arc<dyn RateLimiter>>,
}

impl CompositeLimiter {
    /// Build a composite over `children`, requiring at least one.
    pub fn new(children: Vec<Arc<dyn RateLimiter>>) -> LimiterResult<Self> {
        if children.is_empty() {
            return Err(LimiterError::InvalidConfig(
                "composite limiter requires at least one child".to_string(),
            ));
        }
        Ok(Self { children })
    }

    /// Number of chained children.
    pub fn len(&self) -> usize {
        self.children.len()
    }

    /// Always false: construction rejects an empty chain.
    pub fn is_empty(&self) -> bool {
        self.children.is_empty()
    }
}

#[async_trait]
impl RateLimiter for CompositeLimiter {
    async fn acquire(&self, key: &str, permits: u32) -> LimiterResult<bool> {
        let mut guard = DebitGuard::new(key, permits);
        for child in &self.children {
            match child.acquire(key, permits).await {
                Ok(true) => guard.push(child.clone()),
                Ok(false) => {
                    guard.compensate_now().await;
                    return Ok(false);
                }
                Err(error) => {
                    // Best effort: the failed child may or may not have
                    // debited; only the children known to have accepted are
                    // compensated.
                    guard.compensate_now().await;
                    return Err(error);
                }
            }
        }
        guard.disarm();
        Ok(true)
    }

    async fn release(&self, key: &str, permits: u32) -> LimiterResult<()> {
        let mut first_error = None;
        for child in &self.children {
            if let Err(error) = child.release(key, permits).await {
                if first_error.is_none() {
                    first_error = Some(error);
                }
            }
        }
        match first_error {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }

    /// Stats of the most constrained child: the one with the least
    /// available capacity governs admission.
    async fn stats(&self, key: &str) -> LimiterResult<LimiterStats> {
        let mut tightest: Option<LimiterStats> = None;
        for child in &self.children {
            let stats = child.stats(key).await?;
            let replace = tightest
                .as_ref()
                .map_or(true, |current| stats.available < current.available);
            if replace {
                tightest = Some(stats);
            }
        }
        tightest.ok_or_else(|| {
            LimiterError::InvalidConfig("composite limiter requires at least one child".to_string())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::limiter::{TokenBucketConfig, TokenBucketLimiter};
    use crate::storage::{LocalStorage, LocalStorageConfig, Storage};
    use std::time::Duration;

    fn bucket(
        storage: Arc<dyn Storage>,
        rate: f64,
        per: Duration,
        scope: &str,
    ) -> Arc<dyn RateLimiter> {
        Arc::new(
            TokenBucketLimiter::new(
                TokenBucketConfig {
                    rate,
                    per,
                    burst: None,
                    scope: scope.to_string(),
                },
                storage,
            )
            .unwrap(),
        )
    }

    fn harness() -> (CompositeLimiter, ManualClock) {
        let clock = ManualClock::new();
        let storage: Arc<dyn Storage> = Arc::new(LocalStorage::with_clock(
            LocalStorageConfig::default(),
            Arc::new(clock.clone()),
        ));
        // Per-minute and per-hour caps, as one would guard an upstream API.
        let minute = bucket(storage.clone(), 100.0, Duration::from_secs(60), "minute");
        let hour = bucket(storage, 1000.0, Duration::from_secs(3600), "hour");
        (CompositeLimiter::new(vec![minute, hour]).unwrap(), clock)
    }

    fn harness_with_small_hour() -> (CompositeLimiter, ManualClock) {
        let clock = ManualClock::new();
        let storage: Arc<dyn Storage> = Arc::new(LocalStorage::with_clock(
            LocalStorageConfig::default(),
            Arc::new(clock.clone()),
        ));
        let minute = bucket(storage.clone(), 100.0, Duration::from_secs(60), "minute");
        let hour = bucket(storage, 10.0, Duration::from_secs(3600), "hour");
        (CompositeLimiter::new(vec![minute, hour]).unwrap(), clock)
    }

    #[tokio::test]
    async fn accepts_only_when_all_children_accept() {
        let (composite, clock) = harness();

        for _ in 0..100 {
            assert!(composite.acquire("k", 1).await.unwrap());
        }
        // Minute cap exhausted.
        assert!(!composite.acquire("k", 1).await.unwrap());

        clock.advance(Duration::from_secs(60));
        for _ in 0..100 {
            assert!(composite.acquire("k", 1).await.unwrap());
        }
        assert!(!composite.acquire("k", 1).await.unwrap());
    }

    #[tokio::test]
    async fn rejection_compensates_earlier_debits() {
        let (composite, clock) = harness_with_small_hour();

        // Hour cap is 10; first 10 pass.
        for _ in 0..10 {
            assert!(composite.acquire("k", 1).await.unwrap());
        }
        // Minute child accepts, hour child rejects; the minute debit is
        // refunded so the composite stays all-or-nothing.
        assert!(!composite.acquire("k", 1).await.unwrap());
        let stats = composite.stats("k").await.unwrap();
        assert_eq!(stats.available, 0.0);

        clock.advance(Duration::from_secs(3600));
        assert!(composite.acquire("k", 1).await.unwrap());
    }

    #[tokio::test]
    async fn release_credits_every_child() {
        let (composite, _clock) = harness();

        for _ in 0..100 {
            assert!(composite.acquire("k", 1).await.unwrap());
        }
        assert!(!composite.acquire("k", 1).await.unwrap());

        composite.release("k", 5).await.unwrap();
        for _ in 0..5 {
            assert!(composite.acquire("k", 1).await.unwrap());
        }
        assert!(!composite.acquire("k", 1).await.unwrap());
    }

    #[tokio::test]
    async fn empty_chain_is_rejected() {
        assert!(CompositeLimiter::new(vec![]).is_err());
    }
}
