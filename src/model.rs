//! Arrival records and per-stop snapshots.
//!
//! [`RawPrediction`] and [`EnrichedPrediction`] live for one poll only.
//! [`StopSnapshot`] is the value a stop's worker holds between polls.

use chrono::{DateTime, FixedOffset, Utc};
use serde::{Deserialize, Serialize};

use crate::config::StopConfig;
use crate::error::{FetchError, ParseError};
use crate::mapper::LineCategory;

/// One upstream prediction after decoding, before any display mapping.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawPrediction {
    pub line_ref: String,
    /// Destination text, or the line ref when the upstream omitted it.
    pub destination: String,
    pub destination_ref: Option<String>,
    pub arrival_time: DateTime<Utc>,
    /// Vehicle mode reported upstream, if any.
    pub line_type: Option<String>,
}

/// A prediction with display labels and a category resolved.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnrichedPrediction {
    pub line_ref: String,
    pub line_label: String,
    pub category: LineCategory,
    pub destination: String,
    pub arrival_time: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Arrival {
    pub minutes: u32,
    pub formatted_time: String,
    pub destination: String,
    /// Absolute arrival time, expressed in the configured timezone.
    pub arrival_time: DateTime<FixedOffset>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LineSnapshot {
    pub line: String,
    pub line_ref: String,
    pub category: LineCategory,
    pub destinations: Vec<String>,
    pub arrivals: Vec<Arrival>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Freshness {
    /// No poll has completed for this stop yet.
    Pending,
    Fresh,
    /// Last good data re-served after a failed poll.
    Stale,
    /// A poll failed and there is no earlier data to fall back on.
    Unavailable,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    TransportError,
    RateLimited,
    AuthError,
    MalformedPayload,
}

/// Where the data in a snapshot came from, as shown to the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DataSource {
    Api,
    /// Carried over from an earlier poll or the on-disk cache.
    Cache,
    None,
}

/// Why the latest poll for a stop did not produce fresh data.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorReason {
    pub kind: ErrorKind,
    pub message: String,
}

impl ErrorReason {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

impl From<&FetchError> for ErrorReason {
    fn from(err: &FetchError) -> Self {
        let kind = match err {
            FetchError::AuthRejected(_) => ErrorKind::AuthError,
            FetchError::RateLimited { .. } => ErrorKind::RateLimited,
            FetchError::Timeout
            | FetchError::NetworkUnreachable(_)
            | FetchError::HttpStatus(_)
            | FetchError::InvalidRequest(_) => ErrorKind::TransportError,
        };
        Self::new(kind, err.to_string())
    }
}

impl From<&ParseError> for ErrorReason {
    fn from(err: &ParseError) -> Self {
        Self::new(ErrorKind::MalformedPayload, err.to_string())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StopSnapshot {
    pub stop_code: String,
    pub stop_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub direction: Option<String>,
    pub agency: String,
    /// When the data in `lines` was fetched. `None` until a poll succeeds.
    pub last_updated: Option<DateTime<Utc>>,
    pub freshness: Freshness,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorReason>,
    pub lines: Vec<LineSnapshot>,
}

impl StopSnapshot {
    fn empty(stop: &StopConfig, agency: &str, freshness: Freshness) -> Self {
        Self {
            stop_code: stop.stop_code.clone(),
            stop_name: stop.display_name(),
            direction: stop.direction.clone(),
            agency: agency.to_string(),
            last_updated: None,
            freshness,
            error: None,
            lines: Vec::new(),
        }
    }

    pub fn pending(stop: &StopConfig, agency: &str) -> Self {
        Self::empty(stop, agency, Freshness::Pending)
    }

    pub fn fresh(
        stop: &StopConfig,
        agency: &str,
        lines: Vec<LineSnapshot>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            last_updated: Some(now),
            lines,
            ..Self::empty(stop, agency, Freshness::Fresh)
        }
    }

    pub fn unavailable(stop: &StopConfig, agency: &str, reason: ErrorReason) -> Self {
        Self {
            error: Some(reason),
            ..Self::empty(stop, agency, Freshness::Unavailable)
        }
    }

    /// Re-labels a previously fresh snapshot as stale, keeping its data.
    pub fn into_stale(self, reason: ErrorReason) -> Self {
        Self {
            freshness: Freshness::Stale,
            error: Some(reason),
            ..self
        }
    }

    pub fn is_stale(&self) -> bool {
        matches!(self.freshness, Freshness::Stale | Freshness::Unavailable)
    }

    pub fn data_source(&self) -> DataSource {
        match self.freshness {
            Freshness::Fresh => DataSource::Api,
            Freshness::Stale => DataSource::Cache,
            Freshness::Pending | Freshness::Unavailable => DataSource::None,
        }
    }

    pub fn next_arrival(&self) -> Option<&Arrival> {
        self.lines.first()?.arrivals.first()
    }

    pub fn arrival_count(&self) -> usize {
        self.lines.iter().map(|l| l.arrivals.len()).sum()
    }
}
