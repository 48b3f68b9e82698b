//! Backoff policies
//!
//! Exponential backoff with optional jitter for retry loops, plus the
//! decorrelated-jitter variant the rate-limit wrapper uses to keep
//! competing retriers from synchronizing.

use std::time::Duration;

use parking_lot::Mutex;
use rand::Rng;
use serde::{Deserialize, Serialize};

/// Exponential backoff: attempt `i` waits `min(max_delay, base · factorⁱ)`,
/// optionally scaled by a uniform random factor in `[0, 1]`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExponentialBackoff {
    /// Delay of attempt zero.
    pub base: Duration,
    /// Growth per attempt.
    pub factor: f64,
    /// Upper bound on any single delay.
    pub max_delay: Duration,
    /// Multiply by a uniform random in `[0, 1]`.
    pub jitter: bool,
}

impl Default for ExponentialBackoff {
    fn default() -> Self {
        Self {
            base: Duration::from_millis(100),
            factor: 2.0,
            max_delay: Duration::from_secs(10),
            jitter: false,
        }
    }
}

impl ExponentialBackoff {
    /// Delay before retrying after `attempt` failures.
    pub fn delay(&self, attempt: u32) -> Duration {
        let raw = self.base.as_secs_f64() * self.factor.powi(attempt.min(63) as i32);
        let capped = raw.min(self.max_delay.as_secs_f64());
        let scaled = if self.jitter {
            capped * rand::thread_rng().gen::<f64>()
        } else {
            capped
        };
        Duration::from_secs_f64(scaled.max(0.0))
    }
}

/// Decorrelated jitter: each delay is drawn uniformly from
/// `[base, 3 · previous]`, capped at `max_delay`. Spreads out retriers that
/// failed at the same instant.
#[derive(Debug)]
pub struct DecorrelatedJitter {
    base: Duration,
    max_delay: Duration,
    previous: Mutex<Duration>,
}

impl DecorrelatedJitter {
    /// Create a policy starting from `base`.
    pub fn new(base: Duration, max_delay: Duration) -> Self {
        Self {
            base,
            max_delay,
            previous: Mutex::new(base),
        }
    }

    /// Draw the next delay.
    pub fn next_delay(&self) -> Duration {
        let mut previous = self.previous.lock();
        let low = self.base.as_secs_f64();
        let high = (previous.as_secs_f64() * 3.0).max(low);
        let drawn = rand::thread_rng()
            .gen_range(low..=high)
            .min(self.max_delay.as_secs_f64());
        *previous = Duration::from_secs_f64(drawn);
        *previous
    }

    /// Forget accumulated growth, e.g. after a successful acquire.
    pub fn reset(&self) {
        *self.previous.lock() = self.base;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exponential_growth_is_capped() {
        let backoff = ExponentialBackoff {
            base: Duration::from_millis(100),
            factor: 2.0,
            max_delay: Duration::from_secs(1),
            jitter: false,
        };
        assert_eq!(backoff.delay(0), Duration::from_millis(100));
        assert_eq!(backoff.delay(1), Duration::from_millis(200));
        assert_eq!(backoff.delay(2), Duration::from_millis(400));
        assert_eq!(backoff.delay(10), Duration::from_secs(1));
        assert_eq!(backoff.delay(63), Duration::from_secs(1));
    }

    #[test]
    fn jitter_stays_under_deterministic_delay() {
        let backoff = ExponentialBackoff {
            jitter: true,
            ..ExponentialBackoff::default()
        };
        for attempt in 0..8 {
            let ceiling = ExponentialBackoff {
                jitter: false,
                ..ExponentialBackoff::default()
            }
            .delay(attempt);
            assert!(backoff.delay(attempt) <= ceiling);
        }
    }

    #[test]
    fn decorrelated_jitter_respects_bounds() {
        let policy = DecorrelatedJitter::new(
            Duration::from_millis(50),
            Duration::from_secs(2),
        );
        for _ in 0..100 {
            let delay = policy.next_delay();
            assert!(delay >= Duration::from_millis(50));
            assert!(delay <= Duration::from_secs(2));
        }
    }

    #[test]
    fn decorrelated_jitter_resets() {
        let policy = DecorrelatedJitter::new(
            Duration::from_millis(50),
            Duration::from_secs(10),
        );
        for _ in 0..20 {
            policy.next_delay();
        }
        policy.reset();
        let next = policy.next_delay();
        assert!(next <= Duration::from_millis(150));
    }
}
