//! Display labels and line categories.

use serde::{Deserialize, Serialize};

use crate::config::StopConfig;
use crate::model::{EnrichedPrediction, RawPrediction};

const TROLLEYBUS_ROUTES: &[&str] = &[
    "1", "2", "3", "5", "6", "7", "8", "14", "21", "22", "24", "30", "31", "33", "41", "45", "49",
];
const CABLE_CAR_LINES: &[&str] = &["C", "PM", "PH", "59", "60", "61"];
const METRO_LINES: &[&str] = &["J", "K", "L", "M", "N", "T", "S", "E", "F"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LineCategory {
    Bus,
    Trolleybus,
    CableCar,
    Metro,
    Owl,
    Express,
    Generic,
}

impl LineCategory {
    pub fn icon(self) -> &'static str {
        match self {
            LineCategory::Bus => "🚌",
            LineCategory::Trolleybus => "🚎",
            LineCategory::CableCar => "🚟",
            LineCategory::Metro => "🚇",
            LineCategory::Owl => "🦉",
            LineCategory::Express => "🚀",
            LineCategory::Generic => "🚏",
        }
    }

    /// Classifies a line from upstream vehicle-mode metadata when present,
    /// otherwise from the shape of its (upper-cased) ref.
    pub fn classify(line_ref: &str, line_type: Option<&str>) -> Self {
        match line_type.map(str::to_ascii_lowercase).as_deref() {
            Some(mode) if mode.contains("trolley") => LineCategory::Trolleybus,
            Some(mode) if mode.contains("cable") || mode.contains("funicular") => {
                LineCategory::CableCar
            }
            Some(mode)
                if ["metro", "tram", "streetcar", "rail"]
                    .iter()
                    .any(|m| mode.contains(m)) =>
            {
                LineCategory::Metro
            }
            Some(mode) if mode.contains("owl") || mode.contains("night") => LineCategory::Owl,
            Some(mode) if mode.contains("express") || mode.contains("rapid") => {
                LineCategory::Express
            }
            Some(mode) if mode.contains("bus") || mode.contains("coach") => {
                match Self::from_line_ref(line_ref) {
                    LineCategory::Generic => LineCategory::Bus,
                    category => category,
                }
            }
            _ => Self::from_line_ref(line_ref),
        }
    }

    fn from_line_ref(line_ref: &str) -> Self {
        let all_digits = !line_ref.is_empty() && line_ref.chars().all(|c| c.is_ascii_digit());
        let starts_with_digit = line_ref.chars().next().is_some_and(|c| c.is_ascii_digit());

        if line_ref == "91" || line_ref.contains("OWL") {
            LineCategory::Owl
        } else if line_ref.ends_with('X') || (starts_with_digit && line_ref.ends_with('R')) {
            LineCategory::Express
        } else if CABLE_CAR_LINES.contains(&line_ref) {
            LineCategory::CableCar
        } else if METRO_LINES.contains(&line_ref) {
            LineCategory::Metro
        } else if all_digits && TROLLEYBUS_ROUTES.contains(&line_ref) {
            LineCategory::Trolleybus
        } else if all_digits {
            LineCategory::Bus
        } else {
            LineCategory::Generic
        }
    }
}

/// Applies a stop's name overrides and resolves the line category.
pub fn map_prediction(raw: &RawPrediction, stop: &StopConfig, show_icons: bool) -> EnrichedPrediction {
    let category = LineCategory::classify(&raw.line_ref, raw.line_type.as_deref());
    let name = stop
        .line_names
        .get(&raw.line_ref)
        .cloned()
        .unwrap_or_else(|| raw.line_ref.clone());
    let line_label = if show_icons {
        format!("{} {}", category.icon(), name)
    } else {
        name
    };

    let destination = stop
        .destination_names
        .get(&raw.destination)
        .or_else(|| {
            raw.destination_ref
                .as_ref()
                .and_then(|r| stop.destination_names.get(r))
        })
        .cloned()
        .unwrap_or_else(|| raw.destination.clone());

    EnrichedPrediction {
        line_ref: raw.line_ref.clone(),
        line_label,
        category,
        destination,
        arrival_time: raw.arrival_time,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};

    fn raw(line_ref: &str, destination: &str) -> RawPrediction {
        RawPrediction {
            line_ref: line_ref.into(),
            destination: destination.into(),
            destination_ref: None,
            arrival_time: Utc.with_ymd_and_hms(2025, 3, 1, 18, 3, 0).unwrap(),
            line_type: None,
        }
    }

    #[test]
    fn test_classify_line_refs() {
        let cases = [
            ("24", LineCategory::Trolleybus),
            ("38", LineCategory::Bus),
            ("91", LineCategory::Owl),
            ("L-OWL", LineCategory::Owl),
            ("14R", LineCategory::Express),
            ("8X", LineCategory::Express),
            ("NX", LineCategory::Express),
            ("PH", LineCategory::CableCar),
            ("60", LineCategory::CableCar),
            ("N", LineCategory::Metro),
            ("F", LineCategory::Metro),
            ("SHUTTLE", LineCategory::Generic),
            ("", LineCategory::Generic),
        ];
        for (line, expected) in cases {
            assert_eq!(LineCategory::classify(line, None), expected, "{line}");
        }
    }

    #[test]
    fn test_metadata_wins_over_line_ref() {
        assert_eq!(LineCategory::classify("38", Some("Trolleybus")), LineCategory::Trolleybus);
        assert_eq!(LineCategory::classify("K", Some("tram")), LineCategory::Metro);
        assert_eq!(LineCategory::classify("XYZ", Some("bus")), LineCategory::Bus);
        assert_eq!(LineCategory::classify("24", Some("bus")), LineCategory::Trolleybus);
        assert_eq!(LineCategory::classify("SHUTTLE", Some("ferry")), LineCategory::Generic);
    }

    #[test]
    fn test_line_override_with_icon() {
        let mut stop = StopConfig::new("13543");
        stop.line_names.insert("24".into(), "24 Divisadero".into());

        let mapped = map_prediction(&raw("24", "24"), &stop, true);
        assert_eq!(mapped.line_label, "🚎 24 Divisadero");
        assert_eq!(mapped.destination, "24");

        let mapped = map_prediction(&raw("24", "24"), &stop, false);
        assert_eq!(mapped.line_label, "24 Divisadero");
    }

    #[test]
    fn test_lowercase_override_matches_parsed_ref() {
        let stop: StopConfig =
            serde_json::from_str(r#"{"stop_code": "15731", "line_names": {"n": "N Judah"}}"#).unwrap();
        let mapped = map_prediction(&raw("N", "Ocean Beach"), &stop, false);
        assert_eq!(mapped.line_label, "N Judah");
    }

    #[test]
    fn test_destination_override_by_name_or_ref() {
        let mut stop = StopConfig::new("13543");
        stop.destination_names.insert("Jackson St & Fillmore".into(), "Pacific Heights".into());
        stop.destination_names.insert("15565".into(), "Hunters Point".into());

        let mapped = map_prediction(&raw("24", "Jackson St & Fillmore"), &stop, false);
        assert_eq!(mapped.destination, "Pacific Heights");

        let mut by_ref = raw("24", "Third St & Palou");
        by_ref.destination_ref = Some("15565".into());
        assert_eq!(map_prediction(&by_ref, &stop, false).destination, "Hunters Point");

        assert_eq!(map_prediction(&raw("38", "Ocean Beach"), &stop, true).destination, "Ocean Beach");
    }
}
