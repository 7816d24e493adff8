//! Time-literal and unit parsing (component A).
//!
//! Parses the TSDB's duration-literal grammar (`"14d"`, `"1w6h"`, `"INF"`)
//! and the size/throughput/time unit grammar used when normalizing message-log
//! parameters (component H). Never guesses: an unknown unit is a hard error,
//! it does not fall back to a default.

use crate::error::ParseError;
use std::fmt;

/// A single unit in a duration literal, ordered from smallest to largest.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DurationUnit {
    Nanos,
    Micros,
    Millis,
    Seconds,
    Minutes,
    Hours,
    Days,
    Weeks,
}

impl DurationUnit {
    fn as_str(self) -> &'static str {
        match self {
            DurationUnit::Nanos => "ns",
            DurationUnit::Micros => "us",
            DurationUnit::Millis => "ms",
            DurationUnit::Seconds => "s",
            DurationUnit::Minutes => "m",
            DurationUnit::Hours => "h",
            DurationUnit::Days => "d",
            DurationUnit::Weeks => "w",
        }
    }

    /// Multiplier to convert this unit's integer value into seconds.
    /// Sub-second units truncate towards zero when summed.
    fn seconds_multiplier(self) -> f64 {
        match self {
            DurationUnit::Nanos => 1e-9,
            DurationUnit::Micros => 1e-6,
            DurationUnit::Millis => 1e-3,
            DurationUnit::Seconds => 1.0,
            DurationUnit::Minutes => 60.0,
            DurationUnit::Hours => 3600.0,
            DurationUnit::Days => 86_400.0,
            DurationUnit::Weeks => 604_800.0,
        }
    }

    fn parse(unit: &str) -> Option<Self> {
        match unit {
            "ns" => Some(DurationUnit::Nanos),
            "us" | "\u{b5}s" => Some(DurationUnit::Micros),
            "ms" => Some(DurationUnit::Millis),
            "s" => Some(DurationUnit::Seconds),
            "m" => Some(DurationUnit::Minutes),
            "h" => Some(DurationUnit::Hours),
            "d" => Some(DurationUnit::Days),
            "w" => Some(DurationUnit::Weeks),
            _ => None,
        }
    }
}

/// A parsed duration or retention-policy literal.
///
/// `Infinite` always renders as `"INF"` — the TSDB rejects a bare `inf` as an
/// invalid numeric literal, so the two must never be conflated.
#[derive(Debug, Clone, PartialEq)]
pub enum TimeLiteral {
    Infinite,
    Duration(Vec<(u64, DurationUnit)>),
}

impl TimeLiteral {
    /// Parses a duration literal: one or more `(integer)(unit)` pairs
    /// concatenated, or the case-insensitive token `INF`.
    pub fn parse(input: &str) -> Result<Self, ParseError> {
        let trimmed = input.trim();
        if trimmed.is_empty() {
            return Err(ParseError::Empty);
        }
        if trimmed.eq_ignore_ascii_case("inf") {
            return Ok(TimeLiteral::Infinite);
        }

        let mut parts = Vec::new();
        let chars: Vec<char> = trimmed.chars().collect();
        let mut i = 0;
        let mut saw_number = false;
        while i < chars.len() {
            let start = i;
            while i < chars.len() && chars[i].is_ascii_digit() {
                i += 1;
            }
            if i == start {
                return Err(ParseError::NoNumber(trimmed.to_string()));
            }
            saw_number = true;
            let value: u64 = chars[start..i].iter().collect::<String>().parse().map_err(|_| ParseError::NoNumber(trimmed.to_string()))?;

            let unit_start = i;
            while i < chars.len() && !chars[i].is_ascii_digit() {
                i += 1;
            }
            let unit_str: String = chars[unit_start..i].iter().collect();
            let unit = DurationUnit::parse(&unit_str).ok_or_else(|| ParseError::UnknownUnit {
                literal: trimmed.to_string(),
                unit: unit_str.clone(),
            })?;
            parts.push((value, unit));
        }

        if !saw_number {
            return Err(ParseError::NoNumber(trimmed.to_string()));
        }
        Ok(TimeLiteral::Duration(parts))
    }

    /// Total duration in whole seconds, truncating any sub-second remainder.
    /// Returns `None` for `Infinite`, which has no finite duration.
    pub fn to_seconds(&self) -> Option<u64> {
        match self {
            TimeLiteral::Infinite => None,
            TimeLiteral::Duration(parts) => {
                let total: f64 = parts.iter().map(|(v, u)| *v as f64 * u.seconds_multiplier()).sum();
                Some(total as u64)
            }
        }
    }

    /// Decomposes the literal into `(hours, minutes, seconds)` for the
    /// `now() - duration` arithmetic used by the harvester's RP-bounded
    /// catch-up window (§4.G). `Infinite` decomposes to `(0.0, 0.0, 0.0)`;
    /// callers must special-case an infinite RP explicitly.
    pub fn to_hms(&self) -> (f64, f64, f64) {
        let Some(total_secs) = self.to_seconds() else {
            return (0.0, 0.0, 0.0);
        };
        let hours = (total_secs / 3600) as f64;
        let minutes = ((total_secs % 3600) / 60) as f64;
        let seconds = (total_secs % 60) as f64;
        (hours, minutes, seconds)
    }
}

impl fmt::Display for TimeLiteral {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TimeLiteral::Infinite => write!(f, "INF"),
            TimeLiteral::Duration(parts) => {
                for (value, unit) in parts {
                    write!(f, "{value}{}", unit.as_str())?;
                }
                Ok(())
            }
        }
    }
}

/// Multiplier table for the size/throughput/time unit grammar (component A,
/// second grammar). Base-2 for `*iB` and bare letters, base-10 for `*B`.
/// Throughput units (`MB/s`, `MiB/s`) carry the same multiplier as their
/// storage counterpart. Time-like units normalize to seconds.
fn unit_multiplier(unit: &str) -> Option<f64> {
    let unit = unit.to_ascii_lowercase();
    let value = match unit.as_str() {
        "" | "no type" => 1.0,
        "%" => 1.0,

        "b" => 1.0,
        "k" => 2f64.powi(10),
        "kb" => 10f64.powi(3),
        "kib" => 2f64.powi(10),
        "kib/s" | "kb/s" | "kbps" => 2f64.powi(10),

        "m" => 2f64.powi(20),
        "mib" | "mib/s" => 2f64.powi(20),
        "mb" | "mb/s" | "mbps" => 10f64.powi(6),

        "g" => 2f64.powi(30),
        "gib" | "gib/s" => 2f64.powi(30),
        "gb" | "gb/s" | "gbps" => 10f64.powi(9),

        "t" => 2f64.powi(40),
        "tib" | "tib/s" => 2f64.powi(40),
        "tb" | "tb/s" | "tbps" => 10f64.powi(12),

        "second(s)" | "second" | "seconds" | "s" => 1.0,
        "min(s)" | "min" | "mins" | "minute" | "minutes" => 60.0,
        "hour(s)" | "hour" | "hours" | "h" => 3600.0,
        "d" | "day" | "days" => 86_400.0,
        "w" | "week" | "weeks" => 604_800.0,

        _ => return None,
    };
    Some(value)
}

/// Parses a string or bare number into the canonical lowest unit (bytes or
/// seconds, depending on which grammar matched). Mirrors the positional
/// value/unit pairing used by message-log parameters: the unit may be glued
/// to the value (`"12.5MB"`) or be a separate token after `delimiter`
/// (`"12.5 MB"`). `given_unit` overrides unit detection entirely, used when
/// the unit is implied by context (e.g. a field known to always be seconds).
pub fn parse_unit(data: &str, given_unit: Option<&str>, delimiter: &str) -> Result<f64, ParseError> {
    let data = data.trim();
    if data.is_empty() || data.eq_ignore_ascii_case("null") {
        return Err(ParseError::Empty);
    }
    if let Ok(n) = data.parse::<f64>() {
        return Ok(n);
    }

    let parts: Vec<&str> = data.split(delimiter).map(str::trim).collect();
    let mut total = 0.0;
    let mut i = 0;
    while i < parts.len() {
        let token = parts[i];
        i += 1;

        let (number_part, unit_part) = if let Some(given) = given_unit {
            (token, given.to_string())
        } else {
            split_number_and_unit(token)
        };

        let unit = if unit_part.is_empty() {
            if i < parts.len() {
                let next = parts[i];
                i += 1;
                next.to_string()
            } else {
                "no type".to_string()
            }
        } else {
            unit_part
        };

        let multiplier = unit_multiplier(&unit).ok_or_else(|| ParseError::UnknownUnit {
            literal: data.to_string(),
            unit,
        })?;

        let value: f64 = number_part.parse().map_err(|_| ParseError::NoNumber(data.to_string()))?;
        total += value * multiplier;
    }
    Ok(total)
}

/// Splits a token like `"12.5MB"` into `("12.5", "MB")`. If no unit
/// characters follow the number, the unit half is empty.
fn split_number_and_unit(token: &str) -> (&str, String) {
    let split_at = token
        .char_indices()
        .find(|(_, c)| !(c.is_ascii_digit() || *c == '.' || *c == '-'))
        .map(|(idx, _)| idx);
    match split_at {
        Some(idx) => (&token[..idx], token[idx..].trim().to_string()),
        None => (token, String::new()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_canonical_durations() {
        for literal in ["14d", "60d", "1w", "0s"] {
            let parsed = TimeLiteral::parse(literal).unwrap();
            assert_eq!(parsed.to_string(), literal);
        }
    }

    #[test]
    fn inf_is_case_insensitive_but_renders_uppercase() {
        for literal in ["inf", "INF", "Inf"] {
            let parsed = TimeLiteral::parse(literal).unwrap();
            assert_eq!(parsed, TimeLiteral::Infinite);
            assert_eq!(parsed.to_string(), "INF");
        }
    }

    #[test]
    fn concatenated_units_sum_seconds() {
        let parsed = TimeLiteral::parse("1w6h").unwrap();
        assert_eq!(parsed.to_seconds(), Some(604_800 + 21_600));
    }

    #[test]
    fn rejects_unknown_unit() {
        let err = TimeLiteral::parse("5x").unwrap_err();
        assert!(matches!(err, ParseError::UnknownUnit { .. }));
    }

    #[test]
    fn rejects_missing_number() {
        let err = TimeLiteral::parse("d").unwrap_err();
        assert!(matches!(err, ParseError::NoNumber(_)));
    }

    #[test]
    fn parses_binary_size_units() {
        assert_eq!(parse_unit("1KiB", None, " ").unwrap(), 1024.0);
        assert_eq!(parse_unit("1KB", None, " ").unwrap(), 1000.0);
    }

    #[test]
    fn parses_decimal_megabytes_as_used_by_office365_transfer_size() {
        // matches the real call site in parse_office365_transfer: no given_unit
        // override, "MB" is base-10.
        let value = parse_unit("12.5 MB", None, " ").unwrap();
        assert_eq!(value.round() as i64, 12_500_000);
    }

    #[test]
    fn percentages_pass_through() {
        assert_eq!(parse_unit("42%", None, " ").unwrap(), 42.0);
    }

    #[test]
    fn time_like_units_normalize_to_seconds() {
        assert_eq!(parse_unit("2", Some("min(s)"), " ").unwrap(), 120.0);
    }
}
