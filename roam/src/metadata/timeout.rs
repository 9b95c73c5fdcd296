//! Encoding and decoding of the `grpc-timeout` request header.
//!
//! The header value is at most eight ASCII digits followed by a unit:
//! `H` (hours), `M` (minutes), `S` (seconds), `m` (milliseconds),
//! `u` (microseconds) or `n` (nanoseconds).

use std::time::Duration;

use http::header::HeaderValue;

pub(crate) const GRPC_TIMEOUT_HEADER: &str = "grpc-timeout";

const MAX_TIMEOUT_DIGITS: u32 = 8;
const MAX_TIMEOUT_VALUE: u64 = 10u64.pow(MAX_TIMEOUT_DIGITS) - 1;

const SECONDS_IN_HOUR: u64 = 60 * 60;
const SECONDS_IN_MINUTE: u64 = 60;

/// Encodes a timeout as a `grpc-timeout` value, choosing the coarsest unit
/// that still represents the duration within eight digits. Values too large
/// even for hours are clamped to the maximum representable timeout.
pub(crate) fn encode_timeout(timeout: Duration) -> HeaderValue {
    let value = if timeout.as_nanos() <= MAX_TIMEOUT_VALUE as u128 {
        format!("{}n", timeout.as_nanos())
    } else if timeout.as_micros() <= MAX_TIMEOUT_VALUE as u128 {
        format!("{}u", timeout.as_micros())
    } else if timeout.as_millis() <= MAX_TIMEOUT_VALUE as u128 {
        format!("{}m", timeout.as_millis())
    } else if timeout.as_secs() <= MAX_TIMEOUT_VALUE {
        format!("{}S", timeout.as_secs())
    } else if timeout.as_secs() / SECONDS_IN_MINUTE <= MAX_TIMEOUT_VALUE {
        format!("{}M", timeout.as_secs() / SECONDS_IN_MINUTE)
    } else {
        let hours = timeout.as_secs() / SECONDS_IN_HOUR;
        format!("{}H", hours.min(MAX_TIMEOUT_VALUE))
    };

    // The strings built above are all digits plus one ASCII letter.
    HeaderValue::from_str(&value).unwrap()
}

/// Parses a `grpc-timeout` value. Returns `None` for values that are not
/// syntactically valid timeouts.
pub(crate) fn try_parse_timeout(value: &HeaderValue) -> Option<Duration> {
    let value = value.to_str().ok()?;
    if value.is_empty() || value.len() > (MAX_TIMEOUT_DIGITS + 1) as usize {
        return None;
    }
    let (digits, unit) = value.split_at(value.len() - 1);
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    let magnitude: u64 = digits.parse().ok()?;

    let timeout = match unit {
        "H" => Duration::from_secs(magnitude.checked_mul(SECONDS_IN_HOUR)?),
        "M" => Duration::from_secs(magnitude.checked_mul(SECONDS_IN_MINUTE)?),
        "S" => Duration::from_secs(magnitude),
        "m" => Duration::from_millis(magnitude),
        "u" => Duration::from_micros(magnitude),
        "n" => Duration::from_nanos(magnitude),
        _ => return None,
    };
    Some(timeout)
}
