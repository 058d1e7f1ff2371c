//! Duration literals
//!
//! Two textual forms are used across the cluster:
//! - the long form reported by `SHOW RETENTION POLICIES` (`1h0m0s`, `168h0m0s`, `0s`)
//! - the short form accepted in statements (`1h`, `30m`, `7d`, `INF`)
//!
//! [`parse_duration`] accepts either, so results read back from a node can be
//! compared against the values that were written.

use crate::{Error, Result};
use std::time::Duration;

const NANOS_PER_MICRO: u64 = 1_000;
const NANOS_PER_MILLI: u64 = 1_000_000;
const NANOS_PER_SEC: u64 = 1_000_000_000;
const SECS_PER_MINUTE: u64 = 60;
const SECS_PER_HOUR: u64 = 60 * SECS_PER_MINUTE;
const SECS_PER_DAY: u64 = 24 * SECS_PER_HOUR;
const SECS_PER_WEEK: u64 = 7 * SECS_PER_DAY;

/// Format a duration in the long form, e.g. `1h0m0s`, `1m30s`, `1.5s`, `500ms`.
pub fn format_duration(d: Duration) -> String {
    let total_nanos = d.as_nanos();
    if total_nanos == 0 {
        return "0s".to_string();
    }

    let secs = d.as_secs();
    let sub = d.subsec_nanos() as u64;

    if secs == 0 {
        return if sub < NANOS_PER_MICRO {
            format!("{}ns", sub)
        } else if sub < NANOS_PER_MILLI {
            format!("{}µs", with_fraction(sub / NANOS_PER_MICRO, sub % NANOS_PER_MICRO, 3))
        } else {
            format!("{}ms", with_fraction(sub / NANOS_PER_MILLI, sub % NANOS_PER_MILLI, 6))
        };
    }

    let hours = secs / SECS_PER_HOUR;
    let minutes = (secs % SECS_PER_HOUR) / SECS_PER_MINUTE;
    let seconds = with_fraction(secs % SECS_PER_MINUTE, sub, 9);

    if hours > 0 {
        format!("{}h{}m{}s", hours, minutes, seconds)
    } else if minutes > 0 {
        format!("{}m{}s", minutes, seconds)
    } else {
        format!("{}s", seconds)
    }
}

fn with_fraction(whole: u64, frac: u64, digits: usize) -> String {
    if frac == 0 {
        return whole.to_string();
    }
    let frac = format!("{:0width$}", frac, width = digits);
    format!("{}.{}", whole, frac.trim_end_matches('0'))
}

/// Format a duration as a statement literal using the largest exact unit.
///
/// A zero duration means "keep forever" and is rendered as `INF`.
pub fn format_literal(d: Duration) -> String {
    if d.is_zero() {
        return "INF".to_string();
    }

    let nanos = d.as_nanos();
    let units: [(u128, &str); 8] = [
        ((SECS_PER_WEEK * NANOS_PER_SEC) as u128, "w"),
        ((SECS_PER_DAY * NANOS_PER_SEC) as u128, "d"),
        ((SECS_PER_HOUR * NANOS_PER_SEC) as u128, "h"),
        ((SECS_PER_MINUTE * NANOS_PER_SEC) as u128, "m"),
        (NANOS_PER_SEC as u128, "s"),
        (NANOS_PER_MILLI as u128, "ms"),
        (NANOS_PER_MICRO as u128, "u"),
        (1, "ns"),
    ];

    for (size, unit) in units {
        if nanos % size == 0 {
            return format!("{}{}", nanos / size, unit);
        }
    }
    format!("{}ns", nanos)
}

/// Parse a duration in either the long or the short form.
///
/// `0`, `INF` and `inf` all parse to a zero duration.
pub fn parse_duration(raw: &str) -> Result<Duration> {
    let input = raw.trim();
    if input.is_empty() {
        return Err(Error::Parse("empty duration".to_string()));
    }
    if input == "0" || input.eq_ignore_ascii_case("inf") {
        return Ok(Duration::ZERO);
    }

    let mut total: u128 = 0;
    let mut rest = input;

    while !rest.is_empty() {
        let number_len = rest
            .find(|c: char| !(c.is_ascii_digit() || c == '.'))
            .unwrap_or(rest.len());
        if number_len == 0 {
            return Err(Error::Parse(format!("invalid duration {:?}", raw)));
        }
        let (number, tail) = rest.split_at(number_len);

        let unit_len = tail
            .find(|c: char| c.is_ascii_digit() || c == '.')
            .unwrap_or(tail.len());
        let (unit, tail) = tail.split_at(unit_len);

        let scale = unit_nanos(unit)
            .ok_or_else(|| Error::Parse(format!("unknown unit {:?} in duration {:?}", unit, raw)))?;
        total += scaled(number, scale, raw)?;
        rest = tail;
    }

    let secs = (total / NANOS_PER_SEC as u128) as u64;
    let nanos = (total % NANOS_PER_SEC as u128) as u32;
    Ok(Duration::new(secs, nanos))
}

fn unit_nanos(unit: &str) -> Option<u128> {
    let nanos = match unit {
        "ns" => 1,
        "u" | "us" | "µs" | "μs" => NANOS_PER_MICRO,
        "ms" => NANOS_PER_MILLI,
        "s" => NANOS_PER_SEC,
        "m" => SECS_PER_MINUTE * NANOS_PER_SEC,
        "h" => SECS_PER_HOUR * NANOS_PER_SEC,
        "d" => SECS_PER_DAY * NANOS_PER_SEC,
        "w" => SECS_PER_WEEK * NANOS_PER_SEC,
        _ => return None,
    };
    Some(nanos as u128)
}

fn scaled(number: &str, scale: u128, raw: &str) -> Result<u128> {
    let invalid = || Error::Parse(format!("invalid duration {:?}", raw));

    let (whole, frac) = match number.split_once('.') {
        Some((whole, frac)) => (whole, frac),
        None => (number, ""),
    };
    if whole.is_empty() && frac.is_empty() {
        return Err(invalid());
    }

    let whole: u128 = if whole.is_empty() {
        0
    } else {
        whole.parse().map_err(|_| invalid())?
    };

    let mut value = whole.checked_mul(scale).ok_or_else(invalid)?;
    let mut place = scale;
    for digit in frac.chars() {
        let digit = digit.to_digit(10).ok_or_else(invalid)? as u128;
        place /= 10;
        if place == 0 {
            break;
        }
        value += digit * place;
    }
    Ok(value)
}
