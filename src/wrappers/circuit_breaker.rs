//! Circuit breaker
//!
//! Three states guard a downstream callable:
//! - `Closed`: calls pass; each counted failure moves toward the threshold
//! - `Open`: calls reject immediately until `timeout` elapses
//! - `HalfOpen`: exactly one probe call runs; its outcome decides between
//!   closing the circuit and re-opening it with a fresh timer

use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

use crate::clock::{Clock, SystemClock};
use crate::metrics::{self, MetricsRecorder};

/// Circuit breaker configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CircuitBreakerConfig {
    /// Consecutive counted failures that trip the circuit.
    pub failure_threshold: u32,
    /// How long the circuit stays open before admitting a probe.
    pub timeout: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            timeout: Duration::from_secs(60),
        }
    }
}

/// Circuit breaker state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CircuitState {
    /// Requests pass through.
    Closed,
    /// Requests fail fast.
    Open,
    /// One probe request is testing recovery.
    HalfOpen,
}

/// Errors produced by a guarded call.
#[derive(Error, Debug)]
pub enum CircuitError<E> {
    /// The circuit is open; no call was made.
    #[error("circuit open; retry after {retry_after:?}")]
    Open {
        /// Time until the next probe is admitted.
        retry_after: Duration,
    },

    /// The call ran and failed with the wrapped error.
    #[error("wrapped call failed: {0}")]
    Inner(E),
}

struct State {
    state: CircuitState,
    failures: u32,
    opened_at: Option<Instant>,
    probe_started: Option<Instant>,
}

enum Admission {
    Allow,
    Probe,
    Reject { retry_after: Duration },
}

/// Three-state failure guard around a downstream callable.
pub struct CircuitBreaker {
    config: CircuitBreakerConfig,
    state: Mutex<State>,
    clock: Arc<dyn Clock>,
    metrics: Arc<MetricsRecorder>,
}

impl CircuitBreaker {
    /// Create a breaker with the wall clock.
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self::with_clock(config, Arc::new(SystemClock))
    }

    /// Create a breaker reading time from `clock`.
    pub fn with_clock(config: CircuitBreakerConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            config,
            state: Mutex::new(State {
                state: CircuitState::Closed,
                failures: 0,
                opened_at: None,
                probe_started: None,
            }),
            clock,
            metrics: metrics::global(),
        }
    }

    /// Record state-transition counters on `recorder` instead of the
    /// process default.
    pub fn with_metrics(mut self, recorder: Arc<MetricsRecorder>) -> Self {
        self.metrics = recorder;
        self
    }

    /// Current state, as of the last admission decision.
    pub fn state(&self) -> CircuitState {
        self.state.lock().state
    }

    /// Guard `call`; every `Err` counts toward the failure threshold.
    pub async fn call<F, Fut, T, E>(&self, call: F) -> Result<T, CircuitError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        self.call_filtered(call, |_| true).await
    }

    /// Guard `call`, counting only errors matching `counts_as_failure`;
    /// the rest pass through without moving the breaker.
    pub async fn call_filtered<F, Fut, T, E, P>(
        &self,
        call: F,
        counts_as_failure: P,
    ) -> Result<T, CircuitError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        P: Fn(&E) -> bool,
    {
        let admission = self.admit();
        let probe = match admission {
            Admission::Reject { retry_after } => {
                self.metrics
                    .incr_counter("fluxgate_breaker_rejected_total", 1);
                return Err(CircuitError::Open { retry_after });
            }
            Admission::Probe => true,
            Admission::Allow => false,
        };

        match call().await {
            Ok(value) => {
                self.record_success(probe);
                Ok(value)
            }
            Err(error) => {
                if counts_as_failure(&error) {
                    self.record_failure(probe);
                }
                Err(CircuitError::Inner(error))
            }
        }
    }

    fn admit(&self) -> Admission {
        let now = self.clock.now();
        let mut state = self.state.lock();
        match state.state {
            CircuitState::Closed => Admission::Allow,
            CircuitState::Open => {
                let opened_at = match state.opened_at {
                    Some(at) => at,
                    None => {
                        // Unreachable in practice; recover to closed.
                        state.state = CircuitState::Closed;
                        return Admission::Allow;
                    }
                };
                let elapsed = now.duration_since(opened_at);
                if elapsed >= self.config.timeout {
                    state.state = CircuitState::HalfOpen;
                    state.probe_started = Some(now);
                    debug!("circuit half-open; admitting probe");
                    Admission::Probe
                } else {
                    Admission::Reject {
                        retry_after: self.config.timeout - elapsed,
                    }
                }
            }
            CircuitState::HalfOpen => match state.probe_started {
                // A probe that outlived the timeout is presumed lost; let
                // another caller take over.
                Some(started) if now.duration_since(started) < self.config.timeout => {
                    Admission::Reject {
                        retry_after: self.config.timeout - now.duration_since(started),
                    }
                }
                _ => {
                    state.probe_started = Some(now);
                    Admission::Probe
                }
            },
        }
    }

    fn record_success(&self, probe: bool) {
        let mut state = self.state.lock();
        match state.state {
            CircuitState::Closed => {
                state.failures = 0;
            }
            CircuitState::HalfOpen if probe => {
                state.state = CircuitState::Closed;
                state.failures = 0;
                state.opened_at = None;
                state.probe_started = None;
                debug!("probe succeeded; circuit closed");
                self.metrics.incr_counter("fluxgate_breaker_closed_total", 1);
            }
            // A success from a call admitted before the trip does not
            // close the circuit; only a probe may.
            CircuitState::HalfOpen | CircuitState::Open => {}
        }
    }

    fn record_failure(&self, probe: bool) {
        let now = self.clock.now();
        let mut state = self.state.lock();
        if probe {
            state.state = CircuitState::Open;
            state.opened_at = Some(now);
            state.probe_started = None;
            warn!("probe failed; circuit re-opened");
            self.metrics.incr_counter("fluxgate_breaker_opened_total", 1);
            return;
        }
        match state.state {
            CircuitState::Closed => {
                state.failures += 1;
                if state.failures >= self.config.failure_threshold {
                    state.state = CircuitState::Open;
                    state.opened_at = Some(now);
                    warn!(failures = state.failures, "failure threshold reached; circuit opened");
                    self.metrics.incr_counter("fluxgate_breaker_opened_total", 1);
                }
            }
            // Failures observed while open or half-open (from calls that
            // were already in flight) keep the current timer.
            CircuitState::Open | CircuitState::HalfOpen => {}
        }
    }
}
