//! Groups enriched predictions into per-line arrival lists.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use chrono_tz::Tz;

use crate::config::{ServiceConfig, TimeFormat};
use crate::model::{Arrival, EnrichedPrediction, LineSnapshot};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AggregateOptions {
    pub max_results: usize,
    pub time_format: TimeFormat,
    pub timezone: Tz,
}

impl AggregateOptions {
    pub fn from_config(config: &ServiceConfig, timezone: Tz) -> Self {
        Self {
            max_results: config.max_results,
            time_format: config.time_format,
            timezone,
        }
    }
}

/// Whole minutes from `now` until `at`, rounded, never negative.
pub fn minutes_until(at: DateTime<Utc>, now: DateTime<Utc>) -> u32 {
    let secs = (at - now).num_seconds();
    if secs <= 0 {
        return 0;
    }
    u32::try_from((secs + 30) / 60).unwrap_or(u32::MAX)
}

pub fn format_arrival(minutes: u32, at: DateTime<Utc>, options: &AggregateOptions) -> String {
    match options.time_format {
        TimeFormat::Minutes => minutes.to_string(),
        TimeFormat::Verbose => match minutes {
            0 => "Due".to_string(),
            1 => "1 min".to_string(),
            n => format!("{n} min"),
        },
        TimeFormat::Full => at
            .with_timezone(&options.timezone)
            .format("%-I:%M %p")
            .to_string(),
    }
}

/// Builds the line list for one stop.
///
/// Lines are keyed by `line_ref`; each keeps at most `max_results` distinct
/// `(destination, time)` arrivals, earliest first, and lists every destination
/// seen for it. Lines are ordered by their
/// soonest arrival and lines with nothing due are left out. Minutes are
/// computed against `now`, not the upstream response time.
pub fn aggregate(
    records: &[EnrichedPrediction],
    options: &AggregateOptions,
    now: DateTime<Utc>,
) -> Vec<LineSnapshot> {
    let mut groups: BTreeMap<&str, Vec<&EnrichedPrediction>> = BTreeMap::new();
    for record in records {
        groups.entry(record.line_ref.as_str()).or_default().push(record);
    }

    let mut lines: Vec<LineSnapshot> = groups
        .into_values()
        .filter_map(|mut group| {
            group.sort_by(|a, b| {
                a.arrival_time
                    .cmp(&b.arrival_time)
                    .then_with(|| a.destination.cmp(&b.destination))
            });
            group.dedup_by(|a, b| a.arrival_time == b.arrival_time && a.destination == b.destination);

            // Every destination served, including ones past the arrival cap.
            let mut destinations: Vec<String> = Vec::new();
            for record in &group {
                if !destinations.contains(&record.destination) {
                    destinations.push(record.destination.clone());
                }
            }
            group.truncate(options.max_results);

            let first = *group.first()?;
            let arrivals = group
                .iter()
                .map(|record| {
                    let minutes = minutes_until(record.arrival_time, now);
                    Arrival {
                        minutes,
                        formatted_time: format_arrival(minutes, record.arrival_time, options),
                        destination: record.destination.clone(),
                        arrival_time: record
                            .arrival_time
                            .with_timezone(&options.timezone)
                            .fixed_offset(),
                    }
                })
                .collect();

            Some(LineSnapshot {
                line: first.line_label.clone(),
                line_ref: first.line_ref.clone(),
                category: first.category,
                destinations,
                arrivals,
            })
        })
        .collect();

    lines.sort_by(|a, b| {
        a.arrivals[0]
            .arrival_time
            .cmp(&b.arrivals[0].arrival_time)
            .then_with(|| a.line_ref.cmp(&b.line_ref))
    });
    lines
}
