//! Point-in-time report of a running service, safe to print or attach to a bug report.

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::cache::CacheInfo;
use crate::config::ServiceConfig;
use crate::fetch::RateLimiterStatus;
use crate::health::HealthReport;
use crate::model::{ErrorReason, Freshness};
use crate::orchestrator::{PollState, StopStatus};

#[derive(Debug, Clone, Serialize)]
pub struct Diagnostics {
    /// Active configuration with the API key redacted.
    pub config: ServiceConfig,
    pub config_version: u64,
    /// Set while the upstream is rejecting the API key.
    pub auth_alarm: bool,
    pub rate_limiter: RateLimiterStatus,
    pub cache: CacheInfo,
    pub stops: Vec<StopDiagnostics>,
}

#[derive(Debug, Clone, Serialize)]
pub struct StopDiagnostics {
    pub stop_code: String,
    pub stop_name: String,
    pub freshness: Freshness,
    pub last_updated: Option<DateTime<Utc>>,
    pub line_count: usize,
    pub arrival_count: usize,
    pub last_outcome: Option<PollState>,
    pub error: Option<ErrorReason>,
    pub health: HealthReport,
}

impl StopDiagnostics {
    pub fn from_status(status: &StopStatus) -> Self {
        let snapshot = &status.snapshot;
        Self {
            stop_code: snapshot.stop_code.clone(),
            stop_name: snapshot.stop_name.clone(),
            freshness: snapshot.freshness,
            last_updated: snapshot.last_updated,
            line_count: snapshot.lines.len(),
            arrival_count: snapshot.arrival_count(),
            last_outcome: status.last_outcome,
            error: snapshot.error.clone(),
            health: status.health.clone(),
        }
    }
}
