//! Token bucket rate limiter
//!
//! Allows bursts up to the bucket capacity while enforcing an average rate
//! over time. A bucket is created full on first reference, so an evicted or
//! expired bucket simply re-admits a burst.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::metrics::{self, MetricsRecorder};
use crate::storage::Script;

use super::{
    last_update_from_age, reply_field, require_positive, state_key, state_ttl_secs,
    LimiterResult, LimiterStats, RateLimiter, StorageHandle,
};

/// Token bucket configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenBucketConfig {
    /// Tokens replenished per `per`.
    pub rate: f64,
    /// Refill period.
    pub per: Duration,
    /// Maximum instantaneous credit; defaults to `rate`.
    pub burst: Option<f64>,
    /// Key namespace, first segment of every storage key.
    pub scope: String,
}

impl Default for TokenBucketConfig {
    fn default() -> Self {
        Self {
            rate: 10.0,
            per: Duration::from_secs(1),
            burst: None,
            scope: "fluxgate".to_string(),
        }
    }
}

/// Token bucket limiter over a storage backend.
pub struct TokenBucketLimiter {
    config: TokenBucketConfig,
    storage: StorageHandle,
    metrics: Arc<MetricsRecorder>,
}

impl TokenBucketLimiter {
    /// Build a limiter, validating the configuration.
    pub fn new(config: TokenBucketConfig, storage: StorageHandle) -> LimiterResult<Self> {
        require_positive(config.rate, "rate")?;
        require_positive(config.per.as_secs_f64(), "per")?;
        if let Some(burst) = config.burst {
            require_positive(burst, "burst")?;
        }
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

    fn burst(&self) -> f64 {
        self.config.burst.unwrap_or(self.config.rate)
    }

    fn refill_per_sec(&self) -> f64 {
        self.config.rate / self.config.per.as_secs_f64()
    }

    fn key(&self, key: &str) -> String {
        state_key(&self.config.scope, "token_bucket", key)
    }
}

#[async_trait]
impl RateLimiter for TokenBucketLimiter {
    async fn acquire(&self, key: &str, permits: u32) -> LimiterResult<bool> {
        let state_key = self.key(key);
        let ttl = state_ttl_secs(self.burst() / self.refill_per_sec());
        let reply = self
            .storage
            .run_script(
                Script::TokenBucketAcquire,
                &[&state_key],
                &[permits as f64, self.burst(), self.refill_per_sec(), ttl],
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
        let ttl = state_ttl_secs(self.burst() / self.refill_per_sec());
        self.storage
            .run_script(
                Script::TokenBucketRelease,
                &[&state_key],
                &[permits as f64, self.burst(), ttl],
            )
            .await?;
        Ok(())
    }

    async fn stats(&self, key: &str) -> LimiterResult<LimiterStats> {
        let state_key = self.key(key);
        let reply = self
            .storage
            .run_script(
                Script::TokenBucketPeek,
                &[&state_key],
                &[self.burst(), self.refill_per_sec()],
            )
            .await?;
        Ok(LimiterStats {
            available: reply_field(&reply, 0)?,
            max: self.burst(),
            rate: self.refill_per_sec(),
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

    fn limiter_with_clock(rate: f64, burst: Option<f64>) -> (TokenBucketLimiter, ManualClock) {
        let clock = ManualClock::new();
        let storage = Arc::new(LocalStorage::with_clock(
            LocalStorageConfig::default(),
            Arc::new(clock.clone()),
        ));
        let limiter = TokenBucketLimiter::new(
            TokenBucketConfig {
                rate,
                burst,
                ..TokenBucketConfig::default()
            },
            storage,
        )
        .unwrap();
        (limiter, clock)
    }

    #[tokio::test]
    async fn burst_then_steady_refill() {
        let (limiter, clock) = limiter_with_clock(10.0, None);

        // Bucket starts full: ten rapid acquires all accept.
        for _ in 0..10 {
            assert!(limiter.acquire("k", 1).await.unwrap());
        }
        // The eleventh within the same second rejects.
        assert!(!limiter.acquire("k", 1).await.unwrap());

        // After one second exactly one further acquire accepts.
        clock.advance(Duration::from_secs(1));
        for _ in 0..10 {
            limiter.acquire("k", 1).await.unwrap();
        }
        assert!(!limiter.acquire("k", 1).await.unwrap());
    }

    #[tokio::test]
    async fn refill_admits_single_token() {
        let (limiter, clock) = limiter_with_clock(10.0, None);

        for _ in 0..10 {
            assert!(limiter.acquire("k", 1).await.unwrap());
        }
        clock.advance(Duration::from_millis(100));
        assert!(limiter.acquire("k", 1).await.unwrap());
        assert!(!limiter.acquire("k", 1).await.unwrap());
    }

    #[tokio::test]
    async fn release_restores_prior_balance() {
        let (limiter, _clock) = limiter_with_clock(10.0, None);

        for _ in 0..4 {
            assert!(limiter.acquire("k", 1).await.unwrap());
        }
        let before = limiter.stats("k").await.unwrap().available;

        assert!(limiter.acquire("k", 2).await.unwrap());
        limiter.release("k", 2).await.unwrap();

        let after = limiter.stats("k").await.unwrap().available;
        assert!((before - after).abs() < 1e-9);
    }

    #[tokio::test]
    async fn release_never_exceeds_burst() {
        let (limiter, _clock) = limiter_with_clock(5.0, None);

        limiter.release("k", 10).await.unwrap();
        let stats = limiter.stats("k").await.unwrap();
        assert!(stats.available <= stats.max);
    }

    #[tokio::test]
    async fn stats_on_untouched_key_reports_full_bucket() {
        let (limiter, _clock) = limiter_with_clock(10.0, Some(25.0));

        let stats = limiter.stats("fresh").await.unwrap();
        assert_eq!(stats.available, 25.0);
        assert_eq!(stats.max, 25.0);
        assert_eq!(stats.last_update, None);
        assert_eq!(stats.storage_key, "fluxgate:token_bucket:fresh");
    }

    #[tokio::test]
    async fn keys_are_independent() {
        let (limiter, _clock) = limiter_with_clock(2.0, None);

        assert!(limiter.acquire("a", 2).await.unwrap());
        assert!(!limiter.acquire("a", 1).await.unwrap());
        assert!(limiter.acquire("b", 1).await.unwrap());
    }

    #[tokio::test]
    async fn rejects_invalid_config() {
        let storage = Arc::new(LocalStorage::new(LocalStorageConfig::default()));
        let err = TokenBucketLimiter::new(
            TokenBucketConfig {
                rate: 0.0,
                ..TokenBucketConfig::default()
            },
            storage,
        );
        assert!(err.is_err());
    }
}
