//! Conversions for values coming back from the database.
//!
//! ClickHouse's JSON output quotes 64-bit integers, so every numeric reader
//! here also accepts numeric strings.

use crate::time;
use chrono::{DateTime, NaiveDateTime, Utc};
use serde_json::Value;

pub fn as_f64(value: &Value) -> Option<f64> {
    match value {
        Value::Number(number) => number.as_f64(),
        Value::String(raw) => raw.trim().parse().ok(),
        Value::Bool(flag) => Some(if *flag { 1.0 } else { 0.0 }),
        _ => None,
    }
}

pub fn as_i64(value: &Value) -> Option<i64> {
    match value {
        Value::Number(number) => number
            .as_i64()
            .or_else(|| number.as_f64().map(|float| float as i64)),
        Value::String(raw) => {
            let raw = raw.trim();
            raw.parse()
                .ok()
                .or_else(|| raw.parse::<f64>().ok().map(|float| float as i64))
        }
        _ => None,
    }
}

pub fn as_u128(value: &Value) -> Option<u128> {
    match value {
        Value::Number(number) => number.as_u64().map(u128::from),
        Value::String(raw) => raw.trim().parse().ok(),
        _ => None,
    }
}

pub fn as_count(value: &Value) -> u64 {
    as_i64(value)
        .and_then(|count| u64::try_from(count).ok())
        .unwrap_or(0)
}

/// JSON number, or `null` for non-finite values.
pub fn number(value: f64) -> Value {
    Value::from(value)
}

pub fn optional_number(value: Option<f64>) -> Value {
    value.map(number).unwrap_or(Value::Null)
}

/// Unwraps single-element arrays such as the result of `quantiles(p)(x)`.
pub fn first_element(value: &Value) -> &Value {
    match value {
        Value::Array(items) => items.first().unwrap_or(&Value::Null),
        other => other,
    }
}

/// Epoch milliseconds of a timestamp returned either as a number or as a
/// `YYYY-MM-DD hh:mm:ss[.fff]` / RFC 3339 string.
pub fn to_millis(value: &Value) -> Option<i64> {
    match value {
        Value::String(raw) => {
            let raw = raw.trim();
            if let Ok(parsed) = DateTime::parse_from_rfc3339(raw) {
                return Some(parsed.with_timezone(&Utc).timestamp_millis());
            }
            for format in ["%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%dT%H:%M:%S%.f"] {
                if let Ok(naive) = NaiveDateTime::parse_from_str(raw, format) {
                    return Some(naive.and_utc().timestamp_millis());
                }
            }
            as_i64(value)
        }
        other => as_i64(other),
    }
}

pub fn date_string(ms: i64) -> Option<String> {
    time::format_key_as_string(ms).map(|formatted| format!("{formatted}Z"))
}

/// Text used for keyed buckets and `key_as_string`.
pub fn key_string(value: &Value) -> String {
    match value {
        Value::String(raw) => raw.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

pub fn is_empty_key(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::String(raw) => raw.is_empty(),
        _ => false,
    }
}

/// Float labels as the DSL prints them: `50` becomes `"50.0"`, `99.9` stays
/// `"99.9"`.
pub fn float_label(value: f64) -> String {
    if value.fract() == 0.0 && value.abs() < 1e15 {
        format!("{value:.1}")
    } else {
        value.to_string()
    }
}

pub fn percent_label(percent: f64) -> String {
    float_label(percent)
}
