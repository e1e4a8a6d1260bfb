//! Bounded retries with exponential backoff around a single fetch.
//!
//! Each attempt runs under the per-attempt timeout and every delay is capped
//! at `max_delay`, so one poll can never take longer than
//! [`RetryPolicy::worst_case`].

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use tracing::{debug, warn};

use crate::config::ServiceConfig;
use crate::error::FetchError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub rate_limit_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub jitter: bool,
    pub attempt_timeout: Duration,
}

impl RetryPolicy {
    pub fn from_config(config: &ServiceConfig) -> Self {
        let retry = &config.retry;
        Self {
            max_attempts: retry.max_attempts.max(1),
            rate_limit_attempts: retry.rate_limit_attempts.max(1),
            base_delay: Duration::from_millis(retry.base_delay_ms),
            max_delay: Duration::from_millis(retry.max_delay_ms),
            jitter: retry.jitter,
            attempt_timeout: config.request_timeout(),
        }
    }

    /// Upper bound on the wall-clock time of [`RetryPolicy::run`].
    pub fn worst_case(&self) -> Duration {
        let attempts = self.max_attempts.max(1);
        self.attempt_timeout
            .saturating_mul(attempts)
            .saturating_add(self.max_delay.saturating_mul(attempts - 1))
    }

    /// Delay before retry number `retry` (0 for the first retry).
    ///
    /// `base * 2^retry`, capped at `max_delay`, then scaled into
    /// `[0.5, 1.0]` of itself when jitter is on.
    pub fn backoff_delay(&self, retry: u32) -> Duration {
        let exponential = self
            .base_delay
            .saturating_mul(2u32.saturating_pow(retry))
            .min(self.max_delay);
        if self.jitter {
            exponential.mul_f64(rand::rng().random_range(0.5..=1.0))
        } else {
            exponential
        }
    }

    fn rate_limit_delay(&self, hint: Option<Duration>, retry: u32) -> Duration {
        match hint {
            Some(hint) => hint.min(self.max_delay),
            None => self.backoff_delay(retry),
        }
    }

    /// Runs `op` until it succeeds, fails with a non-retryable error, or the
    /// attempt budgets are spent. `op` receives the 1-based attempt number.
    pub async fn run<T, F, Fut>(&self, mut op: F) -> Result<T, FetchError>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, FetchError>>,
    {
        let mut rate_limited = 0u32;
        let mut attempt = 0u32;

        loop {
            attempt += 1;
            let result = match tokio::time::timeout(self.attempt_timeout, op(attempt)).await {
                Ok(result) => result,
                Err(_) => Err(FetchError::Timeout),
            };

            let err = match result {
                Ok(value) => {
                    if attempt > 1 {
                        debug!(attempt, "Request succeeded after retry");
                    }
                    return Ok(value);
                }
                Err(err) => err,
            };

            if !err.is_retryable() {
                debug!(attempt, error = %err, "Not retrying");
                return Err(err);
            }
            if attempt >= self.max_attempts {
                warn!(attempt, error = %err, "Retries exhausted");
                return Err(err);
            }

            let delay = match &err {
                FetchError::RateLimited { retry_after } => {
                    rate_limited += 1;
                    if rate_limited >= self.rate_limit_attempts {
                        warn!(attempt, rate_limited, "Rate limit retry budget exhausted");
                        return Err(err);
                    }
                    self.rate_limit_delay(*retry_after, attempt - 1)
                }
                _ => self.backoff_delay(attempt - 1),
            };

            warn!(
                attempt,
                max_attempts = self.max_attempts,
                delay_ms = delay.as_millis() as u64,
                error = %err,
                "Attempt failed, backing off"
            );
            tokio::time::sleep(delay).await;
        }
    }
}
