//! Decoder for 511.org SIRI StopMonitoring JSON.
//!
//! Entries are decoded one at a time: a visit that does not fit the schema is
//! logged and skipped, and the rest of the payload still counts.

use chrono::{DateTime, TimeDelta, Utc};
use serde::Deserialize;
use serde_json::Value;
use tracing::{debug, warn};

use crate::config::normalize_line_ref;
use crate::error::ParseError;
use crate::model::RawPrediction;

/// How far in the past a prediction may be and still be kept.
pub const PAST_GRACE: TimeDelta = TimeDelta::seconds(60);

const BOM: &[u8] = b"\xEF\xBB\xBF";

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct StopVisit {
    monitored_vehicle_journey: Option<VehicleJourney>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct VehicleJourney {
    line_ref: Option<Value>,
    destination_name: Option<Value>,
    destination_ref: Option<Value>,
    vehicle_mode: Option<Value>,
    monitored_call: Option<MonitoredCall>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct MonitoredCall {
    expected_arrival_time: Option<String>,
    aimed_arrival_time: Option<String>,
}

/// Decodes a response body into predictions, dropping entries with no line,
/// no usable timestamp, or a timestamp more than [`PAST_GRACE`] before `now`.
///
/// # Errors
///
/// [`ParseError::Malformed`] when the body is not JSON or the envelope does
/// not match the schema. [`ParseError::Empty`] when nothing usable is due.
pub fn parse_predictions(body: &[u8], now: DateTime<Utc>) -> Result<Vec<RawPrediction>, ParseError> {
    let body = body.strip_prefix(BOM).unwrap_or(body);
    let root: Value =
        serde_json::from_slice(body).map_err(|e| ParseError::Malformed(format!("invalid JSON: {e}")))?;

    let root = root
        .as_object()
        .ok_or_else(|| ParseError::Malformed("response is not a JSON object".into()))?;
    let delivery = root
        .get("ServiceDelivery")
        .ok_or_else(|| ParseError::Malformed("missing ServiceDelivery".into()))?;

    let mut predictions = Vec::new();
    for visit in stop_visits(delivery)? {
        match decode_visit(visit, now) {
            Ok(Some(prediction)) => predictions.push(prediction),
            Ok(None) => {}
            Err(reason) => warn!(%reason, "Skipping stop visit"),
        }
    }

    if predictions.is_empty() {
        debug!("No usable predictions in payload");
        return Err(ParseError::Empty);
    }
    Ok(predictions)
}

/// Collects `MonitoredStopVisit` entries across one or many deliveries.
fn stop_visits(service_delivery: &Value) -> Result<Vec<&Value>, ParseError> {
    let deliveries = match service_delivery.get("StopMonitoringDelivery") {
        None | Some(Value::Null) => return Ok(Vec::new()),
        Some(Value::Array(items)) => items.iter().collect(),
        Some(delivery @ Value::Object(_)) => vec![delivery],
        Some(_) => {
            return Err(ParseError::Malformed(
                "StopMonitoringDelivery is not an object or list".into(),
            ));
        }
    };

    let mut visits = Vec::new();
    for delivery in deliveries {
        match delivery.get("MonitoredStopVisit") {
            None | Some(Value::Null) => {}
            Some(Value::Array(items)) => visits.extend(items),
            Some(visit @ Value::Object(_)) => visits.push(visit),
            Some(_) => {
                return Err(ParseError::Malformed(
                    "MonitoredStopVisit is not an object or list".into(),
                ));
            }
        }
    }
    Ok(visits)
}

/// `Ok(None)` for entries that are well-formed but not worth keeping.
fn decode_visit(visit: &Value, now: DateTime<Utc>) -> Result<Option<RawPrediction>, String> {
    let visit = StopVisit::deserialize(visit).map_err(|e| e.to_string())?;
    let Some(journey) = visit.monitored_vehicle_journey else {
        return Err("no MonitoredVehicleJourney".into());
    };

    let line_ref = journey
        .line_ref
        .as_ref()
        .and_then(text)
        .map(|s| normalize_line_ref(&s))
        .filter(|s| !s.is_empty())
        .ok_or("no LineRef")?;

    let call = journey.monitored_call.ok_or("no MonitoredCall")?;
    let Some(raw_time) = call
        .expected_arrival_time
        .or(call.aimed_arrival_time)
        .filter(|t| !t.trim().is_empty())
    else {
        warn!(line = %line_ref, "Prediction has no arrival time, dropping");
        return Ok(None);
    };

    let arrival_time = match DateTime::parse_from_rfc3339(raw_time.trim()) {
        Ok(t) => t.with_timezone(&Utc),
        Err(e) => {
            warn!(line = %line_ref, time = %raw_time, error = %e, "Unparseable arrival time, dropping");
            return Ok(None);
        }
    };
    if arrival_time < now - PAST_GRACE {
        warn!(line = %line_ref, %arrival_time, "Prediction is in the past, dropping");
        return Ok(None);
    }

    let destination = journey
        .destination_name
        .as_ref()
        .and_then(text)
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| line_ref.clone());

    Ok(Some(RawPrediction {
        destination,
        destination_ref: journey.destination_ref.as_ref().and_then(text),
        line_type: journey.vehicle_mode.as_ref().and_then(text),
        line_ref,
        arrival_time,
    }))
}

/// SIRI text fields arrive as a string or a list of strings.
fn text(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Array(items) => items.iter().find_map(text),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 3, 1, 18, 0, 0).unwrap()
    }

    #[test]
    fn test_parse_visits_list() {
        let body = crate::test_support::payload(&[
            ("24", "Jackson St", "2025-03-01T18:03:00Z"),
            ("j", "Balboa Park", "2025-03-01T18:10:00-08:00"),
        ]);
        let predictions = parse_predictions(body.as_bytes(), now()).unwrap();

        assert_eq!(predictions.len(), 2);
        assert_eq!(predictions[0].line_ref, "24");
        assert_eq!(predictions[0].destination, "Jackson St");
        assert_eq!(predictions[1].line_ref, "J");
        assert_eq!(
            predictions[1].arrival_time,
            Utc.with_ymd_and_hms(2025, 3, 2, 2, 10, 0).unwrap()
        );
    }

    #[test]
    fn test_single_visit_object_and_bom() {
        let body = "\u{feff}{\"ServiceDelivery\":{\"StopMonitoringDelivery\":{\"MonitoredStopVisit\":\
            {\"MonitoredVehicleJourney\":{\"LineRef\":\"N\",\"VehicleMode\":[\"metro\"],\
            \"MonitoredCall\":{\"AimedArrivalTime\":\"2025-03-01T18:05:00Z\"}}}}}}";
        let predictions = parse_predictions(body.as_bytes(), now()).unwrap();

        assert_eq!(predictions.len(), 1);
        // destination falls back to the line ref
        assert_eq!(predictions[0].destination, "N");
        assert_eq!(predictions[0].line_type.as_deref(), Some("metro"));
    }

    #[test]
    fn test_bad_entries_do_not_discard_good_ones() {
        let body = r#"{"ServiceDelivery":{"StopMonitoringDelivery":[{"MonitoredStopVisit":[
            {"MonitoredVehicleJourney":{"LineRef":"24","MonitoredCall":{"ExpectedArrivalTime":"2025-03-01T18:03:00Z"}}},
            {"MonitoredVehicleJourney":{"LineRef":"24","MonitoredCall":{"ExpectedArrivalTime":"not a time"}}},
            {"MonitoredVehicleJourney":{"LineRef":"24","MonitoredCall":{}}},
            {"MonitoredVehicleJourney":{"MonitoredCall":{"ExpectedArrivalTime":"2025-03-01T18:04:00Z"}}},
            {"MonitoredVehicleJourney":"garbage"},
            {"Unrelated": true},
            {"MonitoredVehicleJourney":{"LineRef":"24","MonitoredCall":{"ExpectedArrivalTime":"2025-03-01T17:50:00Z"}}},
            {"MonitoredVehicleJourney":{"LineRef":"24","Extra":1,"MonitoredCall":{"ExpectedArrivalTime":"2025-03-01T17:59:30Z"}}}
        ]}]}}"#;
        let predictions = parse_predictions(body.as_bytes(), now()).unwrap();

        // the valid entry plus the one just inside the grace window
        assert_eq!(predictions.len(), 2);
        assert!(predictions.iter().all(|p| p.line_ref == "24"));
    }

    #[test]
    fn test_empty_states() {
        for body in [
            r#"{"ServiceDelivery":{}}"#,
            r#"{"ServiceDelivery":{"StopMonitoringDelivery":{}}}"#,
            r#"{"ServiceDelivery":{"StopMonitoringDelivery":{"MonitoredStopVisit":[]}}}"#,
        ] {
            assert_eq!(parse_predictions(body.as_bytes(), now()), Err(ParseError::Empty), "{body}");
        }
    }

    #[test]
    fn test_malformed_envelopes() {
        for body in [
            "<html>Service Unavailable</html>",
            "[]",
            r#"{"Siri":{}}"#,
            r#"{"ServiceDelivery":{"StopMonitoringDelivery":{"MonitoredStopVisit":"24"}}}"#,
        ] {
            assert!(
                matches!(parse_predictions(body.as_bytes(), now()), Err(ParseError::Malformed(_))),
                "{body}"
            );
        }
    }
}
