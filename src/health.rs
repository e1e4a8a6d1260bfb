//! Sliding-window connection health for one stop.

use std::collections::VecDeque;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::model::ErrorReason;

pub const WINDOW_SIZE: usize = 10;
pub const FAILURE_THRESHOLD: u32 = 5;
pub const SUCCESS_RATE_THRESHOLD: f64 = 0.5;
const UNHEALTHY_AFTER: u32 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionStatus {
    Healthy,
    Degraded,
    Unhealthy,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HealthReport {
    pub is_healthy: bool,
    pub connection_status: ConnectionStatus,
    pub success_rate: f64,
    pub consecutive_failures: u32,
    pub total_operations: usize,
    pub last_success: Option<DateTime<Utc>>,
    pub last_failure: Option<DateTime<Utc>>,
    pub last_error: Option<ErrorReason>,
}

#[derive(Debug, Clone, Default)]
pub struct HealthMonitor {
    window: VecDeque<bool>,
    consecutive_failures: u32,
    last_success: Option<DateTime<Utc>>,
    last_failure: Option<DateTime<Utc>>,
    last_error: Option<ErrorReason>,
}

impl HealthMonitor {
    pub fn new() -> Self {
        Self::default()
    }

    fn push(&mut self, ok: bool) {
        if self.window.len() == WINDOW_SIZE {
            self.window.pop_front();
        }
        self.window.push_back(ok);
    }

    pub fn record_success(&mut self, now: DateTime<Utc>) {
        self.push(true);
        self.consecutive_failures = 0;
        self.last_success = Some(now);
    }

    pub fn record_failure(&mut self, now: DateTime<Utc>, reason: ErrorReason) {
        self.push(false);
        self.consecutive_failures += 1;
        self.last_failure = Some(now);
        self.last_error = Some(reason);
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }

    /// Share of successes in the window; 1.0 before anything was recorded.
    pub fn success_rate(&self) -> f64 {
        if self.window.is_empty() {
            return 1.0;
        }
        let ok = self.window.iter().filter(|ok| **ok).count();
        pct(ok, self.window.len())
    }

    pub fn is_healthy(&self) -> bool {
        self.success_rate() >= SUCCESS_RATE_THRESHOLD && self.consecutive_failures < FAILURE_THRESHOLD
    }

    pub fn connection_status(&self) -> ConnectionStatus {
        if self.is_healthy() {
            ConnectionStatus::Healthy
        } else if self.consecutive_failures > UNHEALTHY_AFTER {
            ConnectionStatus::Unhealthy
        } else {
            ConnectionStatus::Degraded
        }
    }

    pub fn report(&self) -> HealthReport {
        HealthReport {
            is_healthy: self.is_healthy(),
            connection_status: self.connection_status(),
            success_rate: self.success_rate(),
            consecutive_failures: self.consecutive_failures,
            total_operations: self.window.len(),
            last_success: self.last_success,
            last_failure: self.last_failure,
            last_error: self.last_error.clone(),
        }
    }

    pub fn reset(&mut self) {
        *self = Self::default();
    }
}

fn pct(n: usize, total: usize) -> f64 {
    if total == 0 {
        0.0
    } else {
        n as f64 / total as f64
    }
}
