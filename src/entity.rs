//! The per-stop entity exposed to the host.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::config::StopConfig;
use crate::health::ConnectionStatus;
use crate::model::{DataSource, ErrorKind, ErrorReason, Freshness, LineSnapshot};
use crate::orchestrator::StopStatus;

pub const DOMAIN: &str = "muni_times";

/// More consecutive failures than this with no data marks the entity unavailable.
const UNAVAILABLE_AFTER: u32 = 5;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StopEntity {
    pub entity_id: String,
    pub name: String,
    pub state: String,
    pub icon: &'static str,
    pub available: bool,
    pub attributes: EntityAttributes,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EntityAttributes {
    pub stop_code: String,
    pub stop_name: String,
    pub agency: String,
    pub last_updated: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub direction: Option<String>,
    pub data_source: DataSource,
    pub stale: bool,
    pub error: Option<ErrorReason>,
    pub error_count: u32,
    pub connection_status: ConnectionStatus,
    pub success_rate: f64,
    #[serde(skip_serializing_if = "HashMap::is_empty")]
    pub line_name_overrides: HashMap<String, String>,
    pub lines: Vec<LineSnapshot>,
}

impl StopEntity {
    pub fn from_status(status: &StopStatus, stop: &StopConfig) -> Self {
        let snapshot = &status.snapshot;
        let has_data = matches!(snapshot.freshness, Freshness::Fresh | Freshness::Stale);
        let failures = status.health.consecutive_failures;

        Self {
            entity_id: format!("{DOMAIN}_{}", snapshot.stop_code),
            name: snapshot.stop_name.clone(),
            state: primary_value(status),
            icon: icon(status),
            available: has_data || failures <= UNAVAILABLE_AFTER,
            attributes: EntityAttributes {
                stop_code: snapshot.stop_code.clone(),
                stop_name: snapshot.stop_name.clone(),
                agency: snapshot.agency.clone(),
                last_updated: snapshot.last_updated,
                direction: snapshot.direction.clone(),
                data_source: snapshot.data_source(),
                stale: snapshot.is_stale(),
                error: snapshot.error.clone(),
                error_count: failures,
                connection_status: status.health.connection_status,
                success_rate: status.health.success_rate,
                line_name_overrides: stop.line_names.clone(),
                lines: snapshot.lines.clone(),
            },
        }
    }
}

/// Soonest arrival's formatted time, or a short description of why there is none.
pub fn primary_value(status: &StopStatus) -> String {
    let snapshot = &status.snapshot;
    if let Some(next) = snapshot.next_arrival() {
        return next.formatted_time.clone();
    }
    match snapshot.freshness {
        Freshness::Fresh | Freshness::Stale => "No arrivals".to_string(),
        Freshness::Pending => "No data".to_string(),
        Freshness::Unavailable => match snapshot.error.as_ref().map(|e| e.kind) {
            Some(ErrorKind::AuthError) => "Authentication error".to_string(),
            _ => "Connection error".to_string(),
        },
    }
}

fn icon(status: &StopStatus) -> &'static str {
    let has_arrivals = status.snapshot.next_arrival().is_some();
    match (status.snapshot.freshness, has_arrivals) {
        (Freshness::Fresh, true) => "mdi:bus",
        (Freshness::Fresh, false) => "mdi:bus-stop",
        (Freshness::Stale, true) => "mdi:bus-clock",
        (Freshness::Stale, false) | (Freshness::Pending, _) => "mdi:bus-off",
        (Freshness::Unavailable, _) => "mdi:bus-alert",
    }
}
