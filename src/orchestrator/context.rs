use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use bytes::Bytes;
use chrono_tz::Tz;

use crate::aggregate::AggregateOptions;
use crate::config::ServiceConfig;
use crate::error::{FetchError, ServiceError};
use crate::fetch::{HttpClient, RateLimiter, StopFetcher};
use crate::retry::RetryPolicy;

/// One validated configuration and everything derived from it.
///
/// Workers hold an `Arc` to the snapshot they started a poll with, so a
/// reload never changes settings under a poll in flight.
pub struct ConfigSnapshot<C> {
    pub version: u64,
    pub config: Arc<ServiceConfig>,
    pub timezone: Tz,
    pub retry: RetryPolicy,
    pub fetcher: StopFetcher<C>,
}

impl<C: HttpClient> ConfigSnapshot<C> {
    pub fn build<F>(version: u64, config: ServiceConfig, connect: &F) -> Result<Self, ServiceError>
    where
        F: ?Sized + Fn(&ServiceConfig) -> reqwest::Result<C>,
    {
        let timezone = config.validate()?;
        let client = connect(&config)?;
        let limiter = Arc::new(RateLimiter::new(
            config.rate_limit.requests,
            config.rate_limit.window(),
        ));
        let fetcher = StopFetcher::new(client, config.endpoint.clone(), config.agency.clone(), limiter);

        Ok(Self {
            version,
            retry: RetryPolicy::from_config(&config),
            config: Arc::new(config),
            timezone,
            fetcher,
        })
    }

    pub fn aggregate_options(&self) -> AggregateOptions {
        AggregateOptions::from_config(&self.config, self.timezone)
    }
}

/// Fetches one stop's payload under the snapshot's retry policy.
pub async fn fetch_stop<C: HttpClient>(ctx: &ConfigSnapshot<C>, stop_code: &str) -> Result<Bytes, FetchError> {
    ctx.retry.run(|_| ctx.fetcher.fetch(stop_code)).await
}

/// Raised on the first rejected API key and cleared by any successful poll,
/// so a bad key is reported once rather than once per stop per poll.
#[derive(Debug, Default)]
pub struct AuthAlarm {
    raised: AtomicBool,
}

impl AuthAlarm {
    /// Returns `true` only for the call that raised the alarm.
    pub fn raise(&self) -> bool {
        !self.raised.swap(true, Ordering::AcqRel)
    }

    pub fn clear(&self) {
        self.raised.store(false, Ordering::Release);
    }

    pub fn is_raised(&self) -> bool {
        self.raised.load(Ordering::Acquire)
    }
}
