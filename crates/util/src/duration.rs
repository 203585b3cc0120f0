//! Human-friendly duration strings.
//!
//! Pipeline documents and configuration files express timeouts and intervals
//! as short strings such as `"500ms"`, `"30s"`, `"5m"`, or `"1h"`. A bare
//! number is read as seconds. The [`serde`] submodules let typed models keep
//! `std::time::Duration` fields while accepting either form on the wire.

use std::time::Duration;

use thiserror::Error;

/// Failure to read a duration string.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DurationParseError {
    #[error("duration is empty")]
    Empty,

    #[error("invalid duration '{input}': {reason}")]
    Invalid { input: String, reason: String },
}

impl DurationParseError {
    fn invalid(input: &str, reason: impl Into<String>) -> Self {
        Self::Invalid {
            input: input.to_string(),
            reason: reason.into(),
        }
    }
}

/// Parses `"250ms"`, `"10s"`, `"1.5m"`, `"2h"`, or a bare number of seconds.
pub fn parse_duration(input: &str) -> Result<Duration, DurationParseError> {
    let trimmed = input.trim();
    if trimmed.is_empty() {
        return Err(DurationParseError::Empty);
    }

    let split_at = trimmed
        .find(|c: char| !(c.is_ascii_digit() || c == '.'))
        .unwrap_or(trimmed.len());
    let (number, unit) = trimmed.split_at(split_at);
    if number.is_empty() {
        return Err(DurationParseError::invalid(input, "missing numeric value"));
    }
    let value: f64 = number
        .parse()
        .map_err(|_| DurationParseError::invalid(input, format!("'{number}' is not a number")))?;

    let seconds = match unit.trim().to_ascii_lowercase().as_str() {
        "" | "s" | "sec" | "secs" => value,
        "ms" => value / 1000.0,
        "m" | "min" | "mins" => value * 60.0,
        "h" | "hr" | "hrs" => value * 3600.0,
        other => return Err(DurationParseError::invalid(input, format!("unknown unit '{other}'"))),
    };

    if !seconds.is_finite() || seconds < 0.0 {
        return Err(DurationParseError::invalid(input, "duration must be a finite, non-negative value"));
    }
    Duration::try_from_secs_f64(seconds).map_err(|error| DurationParseError::invalid(input, error.to_string()))
}

/// Formats a duration using the largest unit that represents it exactly.
pub fn format_duration(duration: Duration) -> String {
    let millis = duration.as_millis();
    if millis == 0 {
        return "0s".to_string();
    }
    if millis % 3_600_000 == 0 {
        format!("{}h", millis / 3_600_000)
    } else if millis % 60_000 == 0 {
        format!("{}m", millis / 60_000)
    } else if millis % 1000 == 0 {
        format!("{}s", millis / 1000)
    } else {
        format!("{millis}ms")
    }
}

/// Serde adapters for `Duration` fields written as duration strings.
pub mod serde {
    use std::{fmt, time::Duration};

    use serde::{
        Deserializer, Serializer,
        de::{self, Visitor},
    };

    use super::{format_duration, parse_duration};

    pub fn serialize<S: Serializer>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&format_duration(*duration))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        deserializer.deserialize_any(DurationVisitor)
    }

    struct DurationVisitor;

    impl Visitor<'_> for DurationVisitor {
        type Value = Duration;

        fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
            formatter.write_str("a duration string such as \"30s\" or a number of seconds")
        }

        fn visit_str<E: de::Error>(self, value: &str) -> Result<Duration, E> {
            parse_duration(value).map_err(E::custom)
        }

        fn visit_u64<E: de::Error>(self, value: u64) -> Result<Duration, E> {
            Ok(Duration::from_secs(value))
        }

        fn visit_i64<E: de::Error>(self, value: i64) -> Result<Duration, E> {
            u64::try_from(value)
                .map(Duration::from_secs)
                .map_err(|_| E::custom("duration must not be negative"))
        }

        fn visit_f64<E: de::Error>(self, value: f64) -> Result<Duration, E> {
            Duration::try_from_secs_f64(value).map_err(|error| E::custom(format!("invalid duration {value}: {error}")))
        }
    }

    /// Same as the parent module for `Option<Duration>` fields.
    pub mod option {
        use std::time::Duration;

        use serde::{Deserialize, Deserializer, Serializer};

        pub fn serialize<S: Serializer>(duration: &Option<Duration>, serializer: S) -> Result<S::Ok, S::Error> {
            match duration {
                Some(duration) => super::serialize(duration, serializer),
                None => serializer.serialize_none(),
            }
        }

        pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<Duration>, D::Error> {
            #[derive(Deserialize)]
            struct Wrapped(#[serde(with = "crate::duration::serde")] Duration);

            Ok(Option::<Wrapped>::deserialize(deserializer)?.map(|Wrapped(duration)| duration))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_units_and_bare_seconds() {
        assert_eq!(parse_duration("250ms").unwrap(), Duration::from_millis(250));
        assert_eq!(parse_duration("30s").unwrap(), Duration::from_secs(30));
        assert_eq!(parse_duration("5m").unwrap(), Duration::from_secs(300));
        assert_eq!(parse_duration("1.5m").unwrap(), Duration::from_secs(90));
        assert_eq!(parse_duration("2h").unwrap(), Duration::from_secs(7200));
        assert_eq!(parse_duration(" 12 ").unwrap(), Duration::from_secs(12));
    }

    #[test]
    fn rejects_garbage() {
        assert_eq!(parse_duration("  "), Err(DurationParseError::Empty));
        assert!(parse_duration("fast").is_err());
        assert!(parse_duration("10 parsecs").is_err());
    }

    #[test]
    fn out_of_range_values_are_errors() {
        let error = parse_duration("999999999999999999999h").expect_err("too large");
        assert!(matches!(error, DurationParseError::Invalid { .. }), "{error}");
        assert!(parse_duration("1e400").is_err());

        #[derive(Debug, ::serde::Deserialize)]
        struct Holder {
            #[serde(with = "crate::duration::serde")]
            #[allow(dead_code)]
            every: Duration,
        }
        assert!(serde_json::from_str::<Holder>(r#"{"every": 1e300}"#).is_err());
        assert!(serde_json::from_str::<Holder>(r#"{"every": -1.5}"#).is_err());
    }

    #[test]
    fn formats_with_largest_exact_unit() {
        assert_eq!(format_duration(Duration::from_secs(300)), "5m");
        assert_eq!(format_duration(Duration::from_secs(90)), "90s");
        assert_eq!(format_duration(Duration::from_millis(1500)), "1500ms");
        assert_eq!(format_duration(Duration::from_secs(3600)), "1h");
        assert_eq!(format_duration(Duration::ZERO), "0s");
    }

    #[test]
    fn serde_accepts_strings_and_numbers() {
        #[derive(::serde::Deserialize)]
        struct Holder {
            #[serde(with = "crate::duration::serde")]
            every: Duration,
            #[serde(default, with = "crate::duration::serde::option")]
            timeout: Option<Duration>,
        }

        let holder: Holder = serde_json::from_str(r#"{"every": "2m", "timeout": 45}"#).expect("decode");
        assert_eq!(holder.every, Duration::from_secs(120));
        assert_eq!(holder.timeout, Some(Duration::from_secs(45)));

        let holder: Holder = serde_json::from_str(r#"{"every": 3}"#).expect("decode");
        assert_eq!(holder.timeout, None);
    }
}
