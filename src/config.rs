//! Service configuration as supplied by the host.
//!
//! Stored as a plain JSON object on disk:
//! ```json
//! {
//!   "api_key": "...",
//!   "agency": "SF",
//!   "time_format": "verbose",
//!   "stops": [
//!     { "stop_code": "13543", "stop_name": "Divisadero & Hayes",
//!       "line_names": { "24": "24 Divisadero" } }
//!   ]
//! }
//! ```
//! Every field except `stops` has a default.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono_tz::Tz;
use serde::{Deserialize, Deserializer, Serialize};

use crate::error::ConfigError;
use crate::fetch::API_ENDPOINT;
use crate::retry::RetryPolicy;

pub const API_KEY_ENV: &str = "MUNI_API_KEY";
pub const REDACTED: &str = "***REDACTED***";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TimeFormat {
    /// `"7"`
    #[default]
    Minutes,
    /// `"7 min"`, `"1 min"`, `"Due"`
    Verbose,
    /// Wall-clock time in the configured timezone, e.g. `"6:07 PM"`.
    Full,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct StopConfig {
    pub stop_code: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stop_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub direction: Option<String>,
    /// Line ref to display name. Keys are matched after trimming and
    /// upper-casing, so `"j"` and `"J"` name the same line.
    #[serde(default, deserialize_with = "line_ref_keys")]
    pub line_names: HashMap<String, String>,
    /// Raw destination name or ref to display name.
    #[serde(default)]
    pub destination_names: HashMap<String, String>,
}

impl StopConfig {
    pub fn new(stop_code: impl Into<String>) -> Self {
        Self {
            stop_code: stop_code.into(),
            ..Default::default()
        }
    }

    pub fn display_name(&self) -> String {
        match &self.stop_name {
            Some(name) if !name.trim().is_empty() => name.clone(),
            _ => format!("Stop {}", self.stop_code),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrySettings {
    /// Total attempts per poll, including the first.
    pub max_attempts: u32,
    /// Attempts allowed to end in HTTP 429 before giving up.
    pub rate_limit_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub jitter: bool,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            rate_limit_attempts: 2,
            base_delay_ms: 1_000,
            max_delay_ms: 10_000,
            jitter: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitSettings {
    pub requests: u32,
    pub window_seconds: u64,
}

impl Default for RateLimitSettings {
    fn default() -> Self {
        Self {
            requests: 60,
            window_seconds: 60,
        }
    }
}

impl RateLimitSettings {
    pub fn window(&self) -> Duration {
        Duration::from_secs(self.window_seconds)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheSettings {
    pub enabled: bool,
    pub path: PathBuf,
    pub max_age_minutes: u64,
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            path: PathBuf::from("muni_times_cache/transit_data.json"),
            max_age_minutes: 30,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceConfig {
    pub api_key: String,
    pub endpoint: String,
    pub agency: String,
    pub poll_interval_seconds: u64,
    pub max_results: usize,
    pub show_icons: bool,
    pub time_format: TimeFormat,
    pub timezone: String,
    pub request_timeout_seconds: u64,
    pub retry: RetrySettings,
    pub rate_limit: RateLimitSettings,
    pub cache: CacheSettings,
    pub stops: Vec<StopConfig>,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            api_key: String::new(),
            endpoint: API_ENDPOINT.to_string(),
            agency: "SF".to_string(),
            poll_interval_seconds: 60,
            max_results: 3,
            show_icons: true,
            time_format: TimeFormat::Minutes,
            timezone: "America/Los_Angeles".to_string(),
            request_timeout_seconds: 10,
            retry: RetrySettings::default(),
            rate_limit: RateLimitSettings::default(),
            cache: CacheSettings::default(),
            stops: Vec::new(),
        }
    }
}

impl ServiceConfig {
    /// Loads the config from a JSON file at `path`, filling a missing API key
    /// from `MUNI_API_KEY`, and validates it.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        let mut config: ServiceConfig = serde_json::from_str(&content)?;
        config.apply_env();
        config.validate()?;
        Ok(config)
    }

    /// Takes the API key from the environment when the file left it empty.
    pub fn apply_env(&mut self) {
        if self.api_key.trim().is_empty() {
            if let Ok(key) = std::env::var(API_KEY_ENV) {
                self.api_key = key;
            }
        }
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_seconds)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_seconds)
    }

    pub fn stop(&self, stop_code: &str) -> Option<&StopConfig> {
        self.stops.iter().find(|s| s.stop_code == stop_code)
    }

    pub fn parsed_timezone(&self) -> Result<Tz, ConfigError> {
        self.timezone
            .parse::<Tz>()
            .map_err(|_| ConfigError::UnknownTimezone(self.timezone.clone()))
    }

    /// Checks the config and returns its parsed timezone.
    pub fn validate(&self) -> Result<Tz, ConfigError> {
        if self.api_key.trim().is_empty() {
            return Err(ConfigError::MissingApiKey);
        }
        if self.max_results == 0 {
            return Err(ConfigError::Zero("max_results"));
        }
        if self.poll_interval_seconds == 0 {
            return Err(ConfigError::Zero("poll_interval_seconds"));
        }
        if self.request_timeout_seconds == 0 {
            return Err(ConfigError::Zero("request_timeout_seconds"));
        }
        if self.retry.max_attempts == 0 {
            return Err(ConfigError::Zero("retry.max_attempts"));
        }
        if self.rate_limit.requests == 0 || self.rate_limit.window_seconds == 0 {
            return Err(ConfigError::Zero("rate_limit"));
        }

        let mut seen = HashSet::new();
        for stop in &self.stops {
            if !is_valid_stop_code(&stop.stop_code) {
                return Err(ConfigError::InvalidStopCode(stop.stop_code.clone()));
            }
            if !seen.insert(stop.stop_code.as_str()) {
                return Err(ConfigError::DuplicateStop(stop.stop_code.clone()));
            }
        }

        let worst_case = RetryPolicy::from_config(self).worst_case();
        let interval = self.poll_interval();
        if worst_case >= interval {
            return Err(ConfigError::PollBudgetExceeded {
                worst_case,
                interval,
            });
        }

        self.parsed_timezone()
    }

    /// Copy safe to print or log.
    pub fn redacted(&self) -> Self {
        Self {
            api_key: REDACTED.to_string(),
            ..self.clone()
        }
    }
}

/// Canonical form of an upstream line ref.
pub fn normalize_line_ref(raw: &str) -> String {
    raw.trim().to_uppercase()
}

fn line_ref_keys<'de, D>(deserializer: D) -> Result<HashMap<String, String>, D::Error>
where
    D: Deserializer<'de>,
{
    let names = HashMap::<String, String>::deserialize(deserializer)?;
    Ok(names
        .into_iter()
        .map(|(line, name)| (normalize_line_ref(&line), name))
        .collect())
}

/// Stop codes are passed to the upstream as a query value; only ASCII
/// alphanumerics, `-` and `_` are accepted.
pub fn is_valid_stop_code(code: &str) -> bool {
    !code.is_empty()
        && code
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
}
