use chrono::{DateTime, SubsecRound, Utc};
use serde::{Deserialize, Serialize};

/// Surrogate key of a monitored endpoint.
pub type UrlId = i64;

/// Default probing interval for targets that do not set one.
pub const DEFAULT_SAMPLE_FREQUENCY_S: u32 = 60;

/// Target - a monitored endpoint as stored in the registry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Target {
    pub url_id: UrlId,
    pub is_enabled: bool,
    pub sample_frequency_s: u32,
    pub url_path: String,
    pub regex_pattern: Option<String>,
}

/// A target that has not been assigned a `url_id` yet
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewTarget {
    pub is_enabled: bool,
    pub sample_frequency_s: u32,
    pub url_path: String,
    pub regex_pattern: Option<String>,
}

impl NewTarget {
    /// A disabled target probed every 60 seconds without a body pattern
    pub fn new(url_path: impl Into<String>) -> Self {
        Self {
            is_enabled: false,
            sample_frequency_s: DEFAULT_SAMPLE_FREQUENCY_S,
            url_path: url_path.into(),
            regex_pattern: None,
        }
    }

    pub fn enabled(mut self, is_enabled: bool) -> Self {
        self.is_enabled = is_enabled;
        self
    }

    pub fn every(mut self, seconds: u32) -> Self {
        self.sample_frequency_s = seconds;
        self
    }

    pub fn matching(mut self, pattern: impl Into<String>) -> Self {
        self.regex_pattern = Some(pattern.into());
        self
    }
}

/// What the prober needs to know about an enabled target
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TargetDescriptor {
    pub url_id: UrlId,
    pub sample_frequency_s: u32,
    pub url_path: String,
    pub regex_pattern: Option<String>,
}

impl From<Target> for TargetDescriptor {
    fn from(target: Target) -> Self {
        Self {
            url_id: target.url_id,
            sample_frequency_s: target.sample_frequency_s,
            url_path: target.url_path,
            regex_pattern: target.regex_pattern,
        }
    }
}

/// Identity of a measurement; at most one stored row per key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct MeasurementKey {
    pub sample_timestamp: DateTime<Utc>,
    pub url_id: UrlId,
}

/// Measurement - one observed sample of a target
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Measurement {
    pub sample_timestamp: DateTime<Utc>,
    pub url_id: UrlId,
    pub response_code: i32,
    /// Seconds
    pub response_time: f64,
    pub match_found: bool,
}

impl Measurement {
    /// Create a measurement stamped with the current time
    pub fn new(url_id: UrlId, response_code: i32, response_time: f64, match_found: bool) -> Self {
        Self::at(Utc::now(), url_id, response_code, response_time, match_found)
    }

    /// Create a measurement captured at `sample_timestamp`.
    ///
    /// The timestamp is truncated to microseconds, the precision it is stored with.
    pub fn at(
        sample_timestamp: DateTime<Utc>,
        url_id: UrlId,
        response_code: i32,
        response_time: f64,
        match_found: bool,
    ) -> Self {
        Self {
            sample_timestamp: sample_timestamp.trunc_subsecs(6),
            url_id,
            response_code,
            response_time,
            match_found,
        }
    }

    pub fn key(&self) -> MeasurementKey {
        MeasurementKey { sample_timestamp: self.sample_timestamp, url_id: self.url_id }
    }
}

/// Text form of `sample_timestamp` in storage. Fixed width so that equal
/// instants always compare equal as strings.
pub fn format_timestamp(timestamp: &DateTime<Utc>) -> String {
    timestamp.format("%Y-%m-%dT%H:%M:%S%.6fZ").to_string()
}

pub fn parse_timestamp(raw: &str) -> Result<DateTime<Utc>, chrono::ParseError> {
    Ok(DateTime::parse_from_rfc3339(raw)?.with_timezone(&Utc))
}
