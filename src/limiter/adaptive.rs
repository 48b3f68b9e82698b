//! Adaptive AIMD rate limiter
//!
//! Additive-increase, multiplicative-decrease: callers report request
//! outcomes and the limiter tunes its rate once per window, gently upward
//! while the error rate stays under the threshold and sharply downward when
//! it does not. Admission itself is a token-bucket check at the current
//! rate.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::clock::{Clock, SystemClock};
use crate::metrics::{self, MetricsRecorder};
use crate::storage::Script;

use super::{
    last_update_from_age, reply_field, require_positive, state_key, state_ttl_secs,
    LimiterError, LimiterResult, LimiterStats, RateLimiter, StorageHandle,
};

/// Adaptive limiter configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdaptiveConfig {
    /// Rate at startup, permits per second.
    pub initial_rate: f64,
    /// Floor the rate never drops below.
    pub min_rate: f64,
    /// Ceiling the rate never exceeds.
    pub max_rate: f64,
    /// Additive increase applied after a healthy window.
    pub increase_step: f64,
    /// Multiplicative decrease applied after an unhealthy window, in (0, 1).
    pub decrease_factor: f64,
    /// Error-rate threshold separating healthy from unhealthy windows.
    pub error_threshold: f64,
    /// Observation window.
    pub window: Duration,
    /// Key namespace.
    pub scope: String,
}

impl Default for AdaptiveConfig {
    fn default() -> Self {
        Self {
            initial_rate: 10.0,
            min_rate: 1.0,
            max_rate: 100.0,
            increase_step: 1.0,
            decrease_factor: 0.5,
            error_threshold: 0.1,
            window: Duration::from_secs(10),
            scope: "fluxgate".to_string(),
        }
    }
}

#[derive(Debug)]
struct ControlState {
    rate: f64,
    successes: u64,
    errors: u64,
    window_started: Instant,
}

/// AIMD limiter over a storage backend.
///
/// The control loop state is per limiter instance; the admission state
/// lives in storage like every other limiter, keyed per caller key.
pub struct AdaptiveLimiter {
    config: AdaptiveConfig,
    state: Mutex<ControlState>,
    storage: StorageHandle,
    clock: Arc<dyn Clock>,
    metrics: Arc<MetricsRecorder>,
}

impl AdaptiveLimiter {
    /// Build a limiter, validating the configuration.
    pub fn new(config: AdaptiveConfig, storage: StorageHandle) -> LimiterResult<Self> {
        Self::with_clock(config, storage, Arc::new(SystemClock))
    }

    /// Build a limiter reading time from `clock`.
    pub fn with_clock(
        config: AdaptiveConfig,
        storage: StorageHandle,
        clock: Arc<dyn Clock>,
    ) -> LimiterResult<Self> {
        require_positive(config.initial_rate, "initial_rate")?;
        require_positive(config.min_rate, "min_rate")?;
        require_positive(config.max_rate, "max_rate")?;
        require_positive(config.window.as_secs_f64(), "window")?;
        if config.min_rate > config.max_rate {
            return Err(LimiterError::InvalidConfig(
                "min_rate must not exceed max_rate".to_string(),
            ));
        }
        if !(0.0..1.0).contains(&config.decrease_factor) || config.decrease_factor == 0.0 {
            return Err(LimiterError::InvalidConfig(format!(
                "decrease_factor must lie in (0, 1), got {}",
                config.decrease_factor
            )));
        }
        if !(0.0..=1.0).contains(&config.error_threshold) {
            return Err(LimiterError::InvalidConfig(format!(
                "error_threshold must lie in [0, 1], got {}",
                config.error_threshold
            )));
        }
        let rate = config
            .initial_rate
            .clamp(config.min_rate, config.max_rate);
        let window_started = clock.now();
        Ok(Self {
            config,
            state: Mutex::new(ControlState {
                rate,
                successes: 0,
                errors: 0,
                window_started,
            }),
            storage,
            clock,
            metrics: metrics::global(),
        })
    }

    /// Record accept/reject counters on `recorder` instead of the process
    /// default.
    pub fn with_metrics(mut self, recorder: Arc<MetricsRecorder>) -> Self {
        self.metrics = recorder;
        self
    }

    /// Report a downstream success for the current window.
    pub fn report_success(&self) {
        self.state.lock().successes += 1;
    }

    /// Report a downstream error for the current window.
    pub fn report_error(&self) {
        self.state.lock().errors += 1;
    }

    /// Current permits-per-second rate.
    pub fn current_rate(&self) -> f64 {
        self.state.lock().rate
    }

    fn key(&self, key: &str) -> String {
        state_key(&self.config.scope, "adaptive", key)
    }

    /// Roll the AIMD window if it has elapsed. Checked on every acquire;
    /// no background task is involved.
    fn maybe_roll(&self) -> f64 {
        let mut state = self.state.lock();
        let now = self.clock.now();
        if now.duration_since(state.window_started) >= self.config.window {
            let total = state.successes + state.errors;
            let err_rate = state.errors as f64 / total.max(1) as f64;
            let previous = state.rate;
            if err_rate > self.config.error_threshold {
                state.rate = (state.rate * self.config.decrease_factor).max(self.config.min_rate);
            } else {
                state.rate = (state.rate + self.config.increase_step).min(self.config.max_rate);
            }
            debug!(
                previous_rate = previous,
                rate = state.rate,
                err_rate,
                "adaptive window rolled"
            );
            self.metrics.set_gauge("fluxgate_adaptive_rate", state.rate);
            state.successes = 0;
            state.errors = 0;
            state.window_started = now;
        }
        state.rate
    }
}

#[async_trait]
impl RateLimiter for AdaptiveLimiter {
    async fn acquire(&self, key: &str, permits: u32) -> LimiterResult<bool> {
        let rate = self.maybe_roll();
        let state_key = self.key(key);
        let reply = self
            .storage
            .run_script(
                Script::TokenBucketAcquire,
                &[&state_key],
                &[permits as f64, rate, rate, state_ttl_secs(1.0)],
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
        let rate = self.current_rate();
        let state_key = self.key(key);
        self.storage
            .run_script(
                Script::TokenBucketRelease,
                &[&state_key],
                &[permits as f64, rate, state_ttl_secs(1.0)],
            )
            .await?;
        Ok(())
    }

    async fn stats(&self, key: &str) -> LimiterResult<LimiterStats> {
        let rate = self.current_rate();
        let state_key = self.key(key);
        let reply = self
            .storage
            .run_script(Script::TokenBucketPeek, &[&state_key], &[rate, rate])
            .await?;
        Ok(LimiterStats {
            available: reply_field(&reply, 0)?,
            max: rate,
            rate,
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

    fn limiter_with_clock(config: AdaptiveConfig) -> (AdaptiveLimiter, ManualClock) {
        let clock = ManualClock::new();
        let storage = Arc::new(LocalStorage::with_clock(
            LocalStorageConfig::default(),
            Arc::new(clock.clone()),
        ));
        let limiter =
            AdaptiveLimiter::with_clock(config, storage, Arc::new(clock.clone())).unwrap();
        (limiter, clock)
    }

    #[tokio::test]
    async fn idle_window_adds_increase_step() {
        let (limiter, clock) = limiter_with_clock(AdaptiveConfig {
            initial_rate: 10.0,
            increase_step: 1.0,
            window: Duration::from_secs(10),
            ..AdaptiveConfig::default()
        });

        clock.advance(Duration::from_secs(10));
        limiter.acquire("k", 1).await.unwrap();
        assert_eq!(limiter.current_rate(), 11.0);
    }

    #[tokio::test]
    async fn error_burst_halves_rate() {
        let (limiter, clock) = limiter_with_clock(AdaptiveConfig {
            initial_rate: 40.0,
            decrease_factor: 0.5,
            error_threshold: 0.1,
            window: Duration::from_secs(5),
            ..AdaptiveConfig::default()
        });

        for _ in 0..8 {
            limiter.report_success();
        }
        for _ in 0..2 {
            limiter.report_error();
        }
        clock.advance(Duration::from_secs(5));
        limiter.acquire("k", 1).await.unwrap();
        assert_eq!(limiter.current_rate(), 20.0);
    }

    #[tokio::test]
    async fn rate_stays_inside_bounds() {
        let (limiter, clock) = limiter_with_clock(AdaptiveConfig {
            initial_rate: 2.0,
            min_rate: 2.0,
            max_rate: 3.0,
            increase_step: 5.0,
            window: Duration::from_secs(1),
            ..AdaptiveConfig::default()
        });

        clock.advance(Duration::from_secs(1));
        limiter.acquire("k", 1).await.unwrap();
        assert_eq!(limiter.current_rate(), 3.0);

        for _ in 0..10 {
            limiter.report_error();
        }
        clock.advance(Duration::from_secs(1));
        limiter.acquire("k", 1).await.unwrap();
        assert_eq!(limiter.current_rate(), 2.0);
    }

    #[tokio::test]
    async fn acquire_enforces_current_rate() {
        let (limiter, _clock) = limiter_with_clock(AdaptiveConfig {
            initial_rate: 3.0,
            window: Duration::from_secs(60),
            ..AdaptiveConfig::default()
        });

        for _ in 0..3 {
            assert!(limiter.acquire("k", 1).await.unwrap());
        }
        assert!(!limiter.acquire("k", 1).await.unwrap());
    }

    #[tokio::test]
    async fn rejects_inverted_bounds() {
        let storage = Arc::new(LocalStorage::new(LocalStorageConfig::default()));
        let err = AdaptiveLimiter::new(
            AdaptiveConfig {
                min_rate: 10.0,
                max_rate: 5.0,
                ..AdaptiveConfig::default()
            },
            storage,
        );
        assert!(err.is_err());
    }
}
