use std::sync::Mutex;
use std::time::Duration;

use serde::Serialize;
use tokio::time::Instant;
use tracing::debug;

/// Token bucket shared by every stop of one configuration.
///
/// Holds up to `capacity` tokens and refills continuously at
/// `capacity / window`. Each request attempt takes one token.
#[derive(Debug)]
pub struct RateLimiter {
    capacity: f64,
    per_second: f64,
    bucket: Mutex<Bucket>,
}

#[derive(Debug)]
struct Bucket {
    tokens: f64,
    refilled_at: Instant,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RateLimiterStatus {
    pub capacity: u32,
    pub available: f64,
}

impl RateLimiter {
    pub fn new(requests: u32, window: Duration) -> Self {
        let capacity = f64::from(requests.max(1));
        let window = window.as_secs_f64().max(f64::EPSILON);
        Self {
            capacity,
            per_second: capacity / window,
            bucket: Mutex::new(Bucket {
                tokens: capacity,
                refilled_at: Instant::now(),
            }),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Bucket> {
        self.bucket.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn refill(&self, bucket: &mut Bucket, now: Instant) {
        let elapsed = now.saturating_duration_since(bucket.refilled_at);
        bucket.tokens = (bucket.tokens + elapsed.as_secs_f64() * self.per_second).min(self.capacity);
        bucket.refilled_at = now;
    }

    /// Takes a token if one is available, otherwise returns how long until
    /// one will be.
    fn try_take(&self) -> Result<(), Duration> {
        let mut bucket = self.lock();
        self.refill(&mut bucket, Instant::now());
        if bucket.tokens >= 1.0 {
            bucket.tokens -= 1.0;
            Ok(())
        } else {
            Err(Duration::from_secs_f64((1.0 - bucket.tokens) / self.per_second))
        }
    }

    /// Waits until a token is available and takes it.
    pub async fn acquire(&self) {
        loop {
            match self.try_take() {
                Ok(()) => return,
                Err(wait) => {
                    debug!(wait_ms = wait.as_millis() as u64, "Rate limit budget empty, waiting");
                    tokio::time::sleep(wait).await;
                }
            }
        }
    }

    pub fn status(&self) -> RateLimiterStatus {
        let mut bucket = self.lock();
        self.refill(&mut bucket, Instant::now());
        RateLimiterStatus {
            capacity: self.capacity as u32,
            available: bucket.tokens,
        }
    }
}
