//! Human-readable durations used by `timeout`, `wait` and retry delays
//!
//! Accepts compound strings such as `1h30m`, `500ms`, `2.5s`, or a bare
//! number meaning seconds.

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum DurationError {
    #[error("Invalid duration format: {0}")]
    InvalidFormat(String),
}

/// Parse a duration string like "1h30m", "45s", "250ms" or "10"
pub fn parse_duration(s: &str) -> Result<Duration, DurationError> {
    let s = s.trim();
    if s.is_empty() {
        return Err(DurationError::InvalidFormat("empty string".to_string()));
    }

    let mut total = Duration::ZERO;
    let mut chars = s.chars().peekable();
    let mut current_num = String::new();

    while let Some(c) = chars.next() {
        if c.is_ascii_digit() || c == '.' {
            current_num.push(c);
            continue;
        }

        if current_num.is_empty() {
            return Err(DurationError::InvalidFormat(format!(
                "expected number before unit '{}' in '{}'",
                c, s
            )));
        }

        let num: f64 = current_num
            .parse()
            .map_err(|_| DurationError::InvalidFormat(format!("invalid number: {}", current_num)))?;
        current_num.clear();

        let millis = match c {
            'd' => num * 24.0 * 60.0 * 60.0 * 1000.0,
            'h' => num * 60.0 * 60.0 * 1000.0,
            'm' => {
                if chars.peek() == Some(&'s') {
                    chars.next();
                    num
                } else {
                    num * 60.0 * 1000.0
                }
            }
            's' => num * 1000.0,
            _ => {
                return Err(DurationError::InvalidFormat(format!(
                    "unknown unit '{}' in '{}'",
                    c, s
                )))
            }
        };

        total = add_secs(total, millis / 1000.0, s)?;
    }

    // Trailing number without a unit means seconds
    if !current_num.is_empty() {
        let num: f64 = current_num
            .parse()
            .map_err(|_| DurationError::InvalidFormat(format!("invalid number: {}", current_num)))?;
        total = add_secs(total, num, s)?;
    }

    Ok(total)
}

fn add_secs(total: Duration, secs: f64, source: &str) -> Result<Duration, DurationError> {
    Duration::try_from_secs_f64(secs)
        .ok()
        .and_then(|d| total.checked_add(d))
        .ok_or_else(|| DurationError::InvalidFormat(format!("duration out of range: {}", source)))
}

/// Convert a YAML/JSON scalar (string or number of seconds) to a duration
pub fn duration_from_value(value: &serde_json::Value) -> Result<Duration, DurationError> {
    match value {
        serde_json::Value::String(s) => parse_duration(s),
        serde_json::Value::Number(n) => n
            .as_f64()
            .and_then(|secs| Duration::try_from_secs_f64(secs).ok())
            .ok_or_else(|| DurationError::InvalidFormat(n.to_string())),
        other => Err(DurationError::InvalidFormat(other.to_string())),
    }
}

/// Unit for a bare-number `wait` duration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WaitUnit {
    Seconds,
    Minutes,
    Hours,
}

impl WaitUnit {
    pub const NAMES: [&'static str; 3] = ["seconds", "minutes", "hours"];

    fn seconds(self) -> f64 {
        match self {
            WaitUnit::Seconds => 1.0,
            WaitUnit::Minutes => 60.0,
            WaitUnit::Hours => 3600.0,
        }
    }
}

/// Like [`duration_from_value`], but a unit scales a number (or numeric string)
pub fn scaled_duration(
    value: &serde_json::Value,
    unit: Option<WaitUnit>,
) -> Result<Duration, DurationError> {
    let Some(unit) = unit else {
        return duration_from_value(value);
    };
    let amount = match value {
        serde_json::Value::Number(n) => n.as_f64(),
        serde_json::Value::String(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    }
    .ok_or_else(|| {
        DurationError::InvalidFormat(format!("expected a number of {:?}, got {}", unit, value))
    })?;
    Duration::try_from_secs_f64(amount * unit.seconds())
        .map_err(|_| DurationError::InvalidFormat(format!("duration out of range: {}", value)))
}

/// A duration that deserializes from "5m"-style strings or seconds
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StepDuration(pub Duration);

impl StepDuration {
    pub fn as_duration(&self) -> Duration {
        self.0
    }
}

impl fmt::Display for StepDuration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let millis = self.0.as_millis();
        if millis % 1000 == 0 {
            write!(f, "{}s", millis / 1000)
        } else {
            write!(f, "{}ms", millis)
        }
    }
}

impl Serialize for StepDuration {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for StepDuration {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value = serde_json::Value::deserialize(deserializer)?;
        duration_from_value(&value)
            .map(StepDuration)
            .map_err(serde::de::Error::custom)
    }
}
