//! Sliding window log rate limiter
//!
//! Records the instant of each admitted request and admits a new one only
//! while fewer than `rate` instants fall inside the trailing window. Exact,
//! at the cost of one stored instant per admission.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::metrics::{self, MetricsRecorder};
use crate::storage::Script;

use super::{
    reply_field, require_positive, state_key, LimiterResult, LimiterStats, RateLimiter,
    StorageHandle,
};

/// Sliding window configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SlidingWindowConfig {
    /// Maximum admissions inside one window.
    pub rate: u32,
    /// Window length.
    pub per: Duration,
    /// Key namespace.
    pub scope: String,
}

impl Default for SlidingWindowConfig {
    fn default() -> Self {
        Self {
            rate: 10,
            per: Duration::from_secs(1),
            scope: "fluxgate".to_string(),
        }
    }
}

/// Sliding window limiter over a storage backend.
pub struct SlidingWindowLimiter {
    config: SlidingWindowConfig,
    storage: StorageHandle,
    metrics: Arc<MetricsRecorder>,
}

impl SlidingWindowLimiter {
    /// Build a limiter, validating the configuration.
    pub fn new(config: SlidingWindowConfig, storage: StorageHandle) -> LimiterResult<Self> {
        require_positive(config.rate as f64, "rate")?;
        require_positive(config.per.as_secs_f64(), "per")?;
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
        state_key(&self.config.scope, "sliding_window", key)
    }
}

#[async_trait]
impl RateLimiter for SlidingWindowLimiter {
    async fn acquire(&self, key: &str, permits: u32) -> LimiterResult<bool> {
        let state_key = self.key(key);
        let reply = self
            .storage
            .run_script(
                Script::SlidingWindowAcquire,
                &[&state_key],
                &[
                    permits as f64,
                    self.config.rate as f64,
                    self.config.per.as_secs_f64(),
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

    /// Recorded instants age out of the window on their own; releasing has
    /// nothing to return.
    async fn release(&self, _key: &str, _permits: u32) -> LimiterResult<()> {
        Ok(())
    }

    async fn stats(&self, key: &str) -> LimiterResult<LimiterStats> {
        let state_key = self.key(key);
        let reply = self
            .storage
            .run_script(
                Script::SlidingWindowCount,
                &[&state_key],
                &[self.config.per.as_secs_f64()],
            )
            .await?;
        let count = reply_field(&reply, 0)?;
        Ok(LimiterStats {
            available: (self.config.rate as f64 - count).max(0.0),
            max: self.config.rate as f64,
            rate: self.config.rate as f64 / self.config.per.as_secs_f64(),
            last_update: None,
            storage_key: state_key,
        })
    }
}
