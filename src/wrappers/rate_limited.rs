//! Rate-limited invocation
//!
//! Wraps an async callable behind a limiter. Each call derives a key from
//! the request, acquires one permit, and either backs off until the
//! limiter accepts (the default) or surfaces the rejection immediately,
//! depending on the configured wait mode.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use crate::limiter::{LimiterError, RateLimiter};

use super::DecorrelatedJitter;

/// What a call does when the limiter rejects.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum WaitMode {
    /// Sleep per decorrelated backoff and retry until accepted.
    Backoff,
    /// Return [`WrapperError::Rejected`] at once.
    FailFast,
}

/// Wrapper errors
#[derive(Error, Debug)]
pub enum WrapperError {
    /// The limiter rejected and the wait budget is spent (or the mode is
    /// fail-fast).
    #[error("rate limited")]
    Rejected,

    /// The limiter itself failed.
    #[error(transparent)]
    Limiter(#[from] LimiterError),
}

type KeyFn<Req> = Box<dyn Fn(&Req) -> String + Send + Sync>;

/// Rate-limited async callable.
pub struct RateLimited<Req, F> {
    inner: F,
    limiter: Arc<dyn RateLimiter>,
    key_fn: KeyFn<Req>,
    mode: WaitMode,
    backoff: DecorrelatedJitter,
    max_attempts: Option<u32>,
}

impl<Req, F> RateLimited<Req, F> {
    /// Wrap `inner`, throttling every call under one fixed key.
    pub fn new(limiter: Arc<dyn RateLimiter>, key: &str, inner: F) -> Self {
        let key = key.to_string();
        Self::with_key_fn(limiter, move |_: &Req| key.clone(), inner)
    }

    /// Wrap `inner`, deriving the key from each request.
    pub fn with_key_fn<K>(limiter: Arc<dyn RateLimiter>, key_fn: K, inner: F) -> Self
    where
        K: Fn(&Req) -> String + Send + Sync + 'static,
    {
        Self {
            inner,
            limiter,
            key_fn: Box::new(key_fn),
            mode: WaitMode::Backoff,
            backoff: DecorrelatedJitter::new(
                Duration::from_millis(25),
                Duration::from_secs(5),
            ),
            max_attempts: None,
        }
    }

    /// Select the behavior on rejection.
    pub fn wait_mode(mut self, mode: WaitMode) -> Self {
        self.mode = mode;
        self
    }

    /// Bound the number of acquire attempts in backoff mode; exhausted
    /// budgets surface as [`WrapperError::Rejected`].
    pub fn max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = Some(attempts.max(1));
        self
    }

    /// Invoke the wrapped callable under the limiter.
    pub async fn call<Fut, Out>(&self, request: Req) -> Result<Out, WrapperError>
    where
        F: Fn(Req) -> Fut,
        Fut: std::future::Future<Output = Out>,
    {
        let key = (self.key_fn)(&request);
        let mut attempts: u32 = 0;
        loop {
            if self.limiter.acquire(&key, 1).await? {
                self.backoff.reset();
                break;
            }
            attempts += 1;
            if self.mode == WaitMode::FailFast {
                return Err(WrapperError::Rejected);
            }
            if let Some(budget) = self.max_attempts {
                if attempts >= budget {
                    return Err(WrapperError::Rejected);
                }
            }
            let delay = self.backoff.next_delay();
            debug!(%key, attempts, ?delay, "rate limited; backing off");
            tokio::time::sleep(delay).await;
        }
        Ok((self.inner)(request).await)
    }
}
