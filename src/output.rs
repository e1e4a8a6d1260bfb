//! Output formatting and persistence for stop snapshots.
//!
//! Supports pretty-printing, JSON serialization, and CSV append.

use std::fmt::Debug;
use std::fs::OpenOptions;
use std::path::Path;

use anyhow::Result;
use chrono::{DateTime, FixedOffset, Utc};
use csv::WriterBuilder;
use serde::Serialize;
use tracing::{debug, info};

use crate::model::{Freshness, StopSnapshot};

/// One CSV row: a single arrival, or a placeholder row for a stop with none.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ArrivalRecord {
    pub timestamp: DateTime<Utc>,
    pub stop_code: String,
    pub stop_name: String,
    pub freshness: Freshness,
    pub last_updated: Option<DateTime<Utc>>,
    pub line: Option<String>,
    pub line_ref: Option<String>,
    pub destination: Option<String>,
    pub minutes: Option<u32>,
    pub formatted_time: Option<String>,
    pub arrival_time: Option<DateTime<FixedOffset>>,
    pub error: Option<String>,
}

impl ArrivalRecord {
    /// Flattens a snapshot into rows, earliest line first.
    pub fn from_snapshot(snapshot: &StopSnapshot, timestamp: DateTime<Utc>) -> Vec<Self> {
        let base = ArrivalRecord {
            timestamp,
            stop_code: snapshot.stop_code.clone(),
            stop_name: snapshot.stop_name.clone(),
            freshness: snapshot.freshness,
            last_updated: snapshot.last_updated,
            line: None,
            line_ref: None,
            destination: None,
            minutes: None,
            formatted_time: None,
            arrival_time: None,
            error: snapshot.error.as_ref().map(|e| e.message.clone()),
        };

        let rows: Vec<Self> = snapshot
            .lines
            .iter()
            .flat_map(|line| {
                let base = &base;
                line.arrivals.iter().map(move |arrival| ArrivalRecord {
                    line: Some(line.line.clone()),
                    line_ref: Some(line.line_ref.clone()),
                    destination: Some(arrival.destination.clone()),
                    minutes: Some(arrival.minutes),
                    formatted_time: Some(arrival.formatted_time.clone()),
                    arrival_time: Some(arrival.arrival_time),
                    ..base.clone()
                })
            })
            .collect();

        if rows.is_empty() { vec![base] } else { rows }
    }
}

/// Logs a value using Rust's debug pretty-print format.
pub fn print_pretty<T: Debug>(value: &T) {
    info!("{:#?}", value);
}

/// Logs a value as pretty-printed JSON.
pub fn print_json<T: Serialize>(value: &T) -> Result<()> {
    info!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

/// Appends rows to a CSV file.
///
/// Creates the file with headers if it does not already exist.
pub fn append_records(path: &str, records: &[ArrivalRecord]) -> Result<()> {
    let file_exists = Path::new(path).exists();
    debug!(path, file_exists, rows = records.len(), "Appending CSV records");

    let file = OpenOptions::new().append(true).create(true).open(path)?;

    let mut writer = WriterBuilder::new()
        .has_headers(!file_exists) // IMPORTANT when appending
        .from_writer(file);

    for record in records {
        writer.serialize(record)?;
    }
    writer.flush()?;

    Ok(())
}
