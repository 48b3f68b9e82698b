//! Leaky bucket rate limiter
//!
//! Smooths traffic to a constant drain rate. The bucket starts empty and
//! admissions raise its level; the level drains at `rate` per second and
//! an admission that would overflow `capacity` is rejected.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::metrics::{self, MetricsRecorder};
use crate::storage::Script;

use super::{
    last_update_from_age, reply_field, require_positive, state_key, state_ttl_secs,
    LimiterResult, LimiterStats, RateLimiter, StorageHandle,
};

/// Leaky bucket configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LeakyBucketConfig {
    /// Level drained per second.
    pub rate: f64,
    /// Maximum level before admissions overflow.
    pub capacity: f64,
    /// Key namespace.
    pub scope: String,
}

impl Default for LeakyBucketConfig {
    fn default() -> Self {
        Self {
            rate: 10.0,
            capacity: 10.0,
            scope: "fluxgate".to_string(),
        }
    }
}

/// Leaky bucket limiter over a storage backend.
pub struct LeakyBucketLimiter {
    config: LeakyBucketConfig,
    storage: StorageHandle,
    metrics: Arc<MetricsRecorder>,
}

impl LeakyBucketLimiter {
    /// Build a limiter, validating the configuration.
    pub fn new(config: LeakyBucketConfig, storage: StorageHandle) -> LimiterResult<Self> {
        require_positive(config.rate, "rate")?;
        require_positive(config.capacity, "capacity")?;
        Ok(Self {
            config,
            storage,
            metrics: metrics::global(),
        })
    }

    /// Record accept/reject counters on `recorder` instead of the process
    /// default.
    pub fn with_metrics(mut self, recorder: Arc<MetricsRecorder>) -> Self {
        self.metrics = recorder;
        self
    }

    fn key(&self, key: &str) -> String {
        state_key(&self.config.scope, "leaky_bucket", key)
    }

    fn ttl(&self) -> f64 {
        state_ttl_secs(self.config.capacity / self.config.rate)
    }
}

#[async_trait]
impl RateLimiter for LeakyBucketLimiter {
    async fn acquire(&self, key: &str, permits: u32) -> LimiterResult<bool> {
        let state_key = self.key(key);
        let reply = self
            .storage
            .run_script(
                Script::LeakyBucketAcquire,
                &[&state_key],
                &[
                    permits as f64,
                    self.config.capacity,
                    self.config.rate,
                    self.ttl(),
                ],
            )
            .await?;
        let accepted = reply_field(&reply, 0)? >= 1.0;
        let counter = if accepted {
            "fluxgate_limiter_accepted_total"
        } else {
            "fluxgate_limiter_rejected_total"
        };
        self.metrics.incr_counter(counter, permits as u64);
        Ok(accepted)
    }

    async fn release(&self, key: &str, permits: u32) -> LimiterResult<()> {
        let state_key = self.key(key);
        self.storage
            .run_script(
                Script::LeakyBucketRelease,
                &[&state_key],
                &[permits as f64, self.ttl()],
            )
            .await?;
        Ok(())
    }

    async fn stats(&self, key: &str) -> LimiterResult<LimiterStats> {
        let state_key = self.key(key);
        let reply = self
            .storage
            .run_script(Script::LeakyBucketPeek, &[&state_key], &[self.config.rate])
            .await?;
        let level = reply_field(&reply, 0)?;
        Ok(LimiterStats {
            available: (self.config.capacity - level).max(0.0),
            max: self.config.capacity,
            rate: self.config.rate,
            last_update: last_update_from_age(reply_field(&reply, 1)?),
            storage_key: state_key,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::storage::{LocalStorage, LocalStorageConfig};
    use std::time::Duration;

    fn limiter_with_clock(rate: f64, capacity: f64) -> (LeakyBucketLimiter, ManualClock) {
        let clock = ManualClock::new();
        let storage = Arc::new(LocalStorage::with_clock(
            LocalStorageConfig::default(),
            Arc::new(clock.clone()),
        ));
        let limiter = LeakyBucketLimiter::new(
            LeakyBucketConfig {
                rate,
                capacity,
                ..LeakyBucketConfig::default()
            },
            storage,
        )
        .unwrap();
        (limiter, clock)
    }

    #[tokio::test]
    async fn starts_empty_and_fills_to_capacity() {
        let (limiter, _clock) = limiter_with_clock(1.0, 5.0);

        let stats = limiter.stats("k").await.unwrap();
        assert_eq!(stats.available, 5.0);

        for _ in 0..5 {
            assert!(limiter.acquire("k", 1).await.unwrap());
        }
        assert!(!limiter.acquire("k", 1).await.unwrap());
    }

    #[tokio::test]
    async fn level_drains_over_time() {
        let (limiter, clock) = limiter_with_clock(1.0, 2.0);

        assert!(limiter.acquire("k", 2).await.unwrap());
        assert!(!limiter.acquire("k", 1).await.unwrap());

        clock.advance(Duration::from_secs(1));
        assert!(limiter.acquire("k", 1).await.unwrap());

        clock.advance(Duration::from_secs(10));
        let stats = limiter.stats("k").await.unwrap();
        assert_eq!(stats.available, 2.0);
    }

    #[tokio::test]
    async fn release_restores_prior_level() {
        let (limiter, _clock) = limiter_with_clock(1.0, 10.0);

        assert!(limiter.acquire("k", 3).await.unwrap());
        let before = limiter.stats("k").await.unwrap().available;

        assert!(limiter.acquire("k", 2).await.unwrap());
        limiter.release("k", 2).await.unwrap();

        let after = limiter.stats("k").await.unwrap().available;
        assert!((before - after).abs() < 1e-9);
    }

    #[tokio::test]
    async fn oversized_request_never_admits() {
        let (limiter, _clock) = limiter_with_clock(1.0, 3.0);
        assert!(!limiter.acquire("k", 4).await.unwrap());
        // The failed admission leaves the bucket untouched.
        assert!(limiter.acquire("k", 3).await.unwrap());
    }
}
