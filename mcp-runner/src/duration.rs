//! Human-readable durations, as used by the `timeout` tool argument and throughout the config
//! file.
//!
//! The accepted grammar is one or more `<number><unit>` groups (`5s`, `500ms`, `1m30s`, `1.5s`),
//! with units `ns`, `us`/`µs`, `ms`, `s`, `m` and `h`.  A bare number is taken as seconds.
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DurationError {
    #[error("duration is empty")]
    Empty,

    #[error("invalid duration '{input}': {reason}")]
    Invalid { input: String, reason: String },

    #[error("duration '{input}' is out of range")]
    OutOfRange { input: String },
}

impl DurationError {
    fn invalid(input: &str, reason: impl Into<String>) -> Self {
        Self::Invalid {
            input: input.to_string(),
            reason: reason.into(),
        }
    }
}

/// Parse a duration string.
pub fn parse_duration(input: &str) -> Result<Duration, DurationError> {
    let trimmed = input.trim();
    if trimmed.is_empty() {
        return Err(DurationError::Empty);
    }
    let out_of_range = || DurationError::OutOfRange {
        input: input.to_string(),
    };

    // Bare number means seconds
    if let Ok(secs) = trimmed.parse::<u64>() {
        return Ok(Duration::from_secs(secs));
    }
    if let Ok(secs) = trimmed.parse::<f64>() {
        return from_secs_f64(secs).ok_or_else(out_of_range);
    }

    let mut total_nanos: u128 = 0;
    let mut rest = trimmed;
    while !rest.is_empty() {
        let number_len = rest
            .find(|c: char| !(c.is_ascii_digit() || c == '.'))
            .unwrap_or(rest.len());
        if number_len == 0 {
            return Err(DurationError::invalid(input, "expected a number"));
        }
        let (number, tail) = rest.split_at(number_len);

        let unit_len = tail
            .find(|c: char| c.is_ascii_digit() || c == '.')
            .unwrap_or(tail.len());
        let (unit, tail) = tail.split_at(unit_len);
        let scale: u128 = match unit {
            "ns" => 1,
            "us" | "µs" => 1_000,
            "ms" => 1_000_000,
            "s" => 1_000_000_000,
            "m" => 60_000_000_000,
            "h" => 3_600_000_000_000,
            "" => return Err(DurationError::invalid(input, "missing unit")),
            other => {
                return Err(DurationError::invalid(
                    input,
                    format!("unknown unit '{other}'"),
                ))
            }
        };

        let nanos = if number.contains('.') {
            let value: f64 = number
                .parse()
                .map_err(|_| DurationError::invalid(input, format!("bad number '{number}'")))?;
            (value * scale as f64).round() as u128
        } else {
            let value: u128 = number
                .parse()
                .map_err(|_| DurationError::invalid(input, format!("bad number '{number}'")))?;
            value.checked_mul(scale).ok_or_else(out_of_range)?
        };

        total_nanos = total_nanos.checked_add(nanos).ok_or_else(out_of_range)?;
        rest = tail;
    }

    let total_nanos = u64::try_from(total_nanos).map_err(|_| out_of_range())?;
    Ok(Duration::from_nanos(total_nanos))
}

/// Seconds as a possibly-fractional number, which is how JSON clients tend to send timeouts.
///
/// Rounds to the nearest nanosecond.  Negative, non-finite and absurdly large values yield `None`.
pub fn from_secs_f64(secs: f64) -> Option<Duration> {
    let nanos = (secs * 1e9).round();
    if nanos.is_finite() && nanos >= 0.0 && nanos <= u64::MAX as f64 {
        Some(Duration::from_nanos(nanos as u64))
    } else {
        None
    }
}

/// Format a duration using the largest unit that represents it exactly.
pub fn format_duration(duration: Duration) -> String {
    let nanos = duration.as_nanos();
    const UNITS: [(u128, &str); 6] = [
        (3_600_000_000_000, "h"),
        (60_000_000_000, "m"),
        (1_000_000_000, "s"),
        (1_000_000, "ms"),
        (1_000, "us"),
        (1, "ns"),
    ];

    if nanos == 0 {
        return "0s".to_string();
    }

    for (scale, unit) in UNITS {
        if nanos % scale == 0 {
            return format!("{}{}", nanos / scale, unit);
        }
    }
    unreachable!("every duration is a whole number of nanoseconds")
}

/// `serde(with = ...)` adapter so config structs can hold a [`Duration`] and read/write it as a
/// string like `30s`.
pub mod serde_str {
    use super::*;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&format_duration(*duration))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let raw = String::deserialize(deserializer)?;
        parse_duration(&raw).map_err(serde::de::Error::custom)
    }
}

/// Like [`serde_str`], for settings that may be left unset
pub mod serde_opt_str {
    use super::*;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(
        duration: &Option<Duration>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        match duration {
            Some(duration) => serializer.serialize_some(&format_duration(*duration)),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<Duration>, D::Error> {
        Option::<String>::deserialize(deserializer)?
            .map(|raw| parse_duration(&raw).map_err(serde::de::Error::custom))
            .transpose()
    }
}
