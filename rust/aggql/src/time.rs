//! Time helpers for date-based aggregations: histogram intervals, date math
//! (`now-1d/d`), time zones and bucket key formatting.

use crate::error::{Result, ServiceError};
use chrono::{
    DateTime, Datelike, Duration, FixedOffset, Months, NaiveDate, NaiveDateTime, TimeZone, Utc,
};
use serde_json::Value;

pub const SECOND_MS: i64 = 1_000;
pub const MINUTE_MS: i64 = 60 * SECOND_MS;
pub const HOUR_MS: i64 = 60 * MINUTE_MS;
pub const DAY_MS: i64 = 24 * HOUR_MS;
pub const WEEK_MS: i64 = 7 * DAY_MS;

/// Format of `key_as_string` for date buckets.
pub const KEY_AS_STRING_FORMAT: &str = "%Y-%m-%dT%H:%M:%S%.3f";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CalendarUnit {
    Week,
    Month,
    Quarter,
    Year,
}

impl CalendarUnit {
    pub fn start_of_function(self) -> &'static str {
        match self {
            CalendarUnit::Week => "toMonday",
            CalendarUnit::Month => "toStartOfMonth",
            CalendarUnit::Quarter => "toStartOfQuarter",
            CalendarUnit::Year => "toStartOfYear",
        }
    }

    /// Nominal length used for rate conversions (a year counts as 360 days
    /// so that year/month == 12).
    pub fn nominal_ms(self) -> i64 {
        match self {
            CalendarUnit::Week => WEEK_MS,
            CalendarUnit::Month => 30 * DAY_MS,
            CalendarUnit::Quarter => 90 * DAY_MS,
            CalendarUnit::Year => 360 * DAY_MS,
        }
    }

    pub fn truncate(self, instant: DateTime<Utc>) -> DateTime<Utc> {
        let date = instant.date_naive();
        let start = match self {
            CalendarUnit::Week => {
                date - Duration::days(i64::from(date.weekday().num_days_from_monday()))
            }
            CalendarUnit::Month => first_of_month(date.year(), date.month()),
            CalendarUnit::Quarter => first_of_month(date.year(), (date.month() - 1) / 3 * 3 + 1),
            CalendarUnit::Year => first_of_month(date.year(), 1),
        };
        start_of_day(start)
    }

    pub fn advance(self, instant: DateTime<Utc>) -> DateTime<Utc> {
        let months = match self {
            CalendarUnit::Week => return instant + Duration::days(7),
            CalendarUnit::Month => 1,
            CalendarUnit::Quarter => 3,
            CalendarUnit::Year => 12,
        };
        instant
            .checked_add_months(Months::new(months))
            .unwrap_or(DateTime::<Utc>::MAX_UTC)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Interval {
    Fixed { ms: i64 },
    Calendar(CalendarUnit),
}

impl Interval {
    /// `fixed_interval`: a positive integer followed by `ms`, `s`, `m`, `h` or `d`.
    pub fn parse_fixed(raw: &str) -> Result<Self> {
        parse_duration_ms(raw)
            .map(|ms| Interval::Fixed { ms })
            .ok_or_else(|| ServiceError::InvalidRequest(format!("invalid fixed_interval '{raw}'")))
    }

    /// `calendar_interval`. Minutes, hours and days have constant length and
    /// are therefore treated as fixed intervals.
    pub fn parse_calendar(raw: &str) -> Result<Self> {
        let interval = match raw.trim() {
            "1m" | "minute" => Interval::Fixed { ms: MINUTE_MS },
            "1h" | "hour" => Interval::Fixed { ms: HOUR_MS },
            "1d" | "day" => Interval::Fixed { ms: DAY_MS },
            "1w" | "week" => Interval::Calendar(CalendarUnit::Week),
            "1M" | "month" => Interval::Calendar(CalendarUnit::Month),
            "1q" | "quarter" => Interval::Calendar(CalendarUnit::Quarter),
            "1y" | "year" => Interval::Calendar(CalendarUnit::Year),
            other => {
                return Err(ServiceError::InvalidRequest(format!(
                    "invalid calendar_interval '{other}'"
                )))
            }
        };
        Ok(interval)
    }

    /// Deprecated `interval` parameter: calendar names first, then fixed.
    pub fn parse_legacy(raw: &str) -> Result<Self> {
        Self::parse_calendar(raw).or_else(|_| Self::parse_fixed(raw))
    }

    pub fn nominal_ms(&self) -> i64 {
        match self {
            Interval::Fixed { ms } => *ms,
            Interval::Calendar(unit) => unit.nominal_ms(),
        }
    }
}

pub fn parse_duration_ms(raw: &str) -> Option<i64> {
    let raw = raw.trim();
    let split = raw.find(|ch: char| !ch.is_ascii_digit())?;
    let (digits, unit) = raw.split_at(split);
    let amount: i64 = digits.parse().ok()?;
    let unit_ms = match unit {
        "ms" => 1,
        "s" => SECOND_MS,
        "m" => MINUTE_MS,
        "h" => HOUR_MS,
        "d" => DAY_MS,
        _ => return None,
    };
    let ms = amount.checked_mul(unit_ms)?;
    (ms > 0).then_some(ms)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TimeZoneSpec {
    Utc,
    Fixed(FixedOffset),
    /// IANA name, resolved by the database.
    Named(String),
}

impl TimeZoneSpec {
    pub fn parse(raw: &str) -> Self {
        let raw = raw.trim();
        match raw {
            "" | "UTC" | "utc" | "Z" | "GMT" | "Etc/UTC" | "Etc/GMT" => return TimeZoneSpec::Utc,
            _ => {}
        }
        match parse_offset(raw) {
            Some(offset) if offset.local_minus_utc() == 0 => TimeZoneSpec::Utc,
            Some(offset) => TimeZoneSpec::Fixed(offset),
            None => TimeZoneSpec::Named(raw.to_string()),
        }
    }

    pub fn offset_ms(&self) -> i64 {
        match self {
            TimeZoneSpec::Fixed(offset) => i64::from(offset.local_minus_utc()) * SECOND_MS,
            TimeZoneSpec::Utc | TimeZoneSpec::Named(_) => 0,
        }
    }

    /// Name understood by ClickHouse's `toTimezone`.
    pub fn sql_name(&self) -> String {
        match self {
            TimeZoneSpec::Utc => "UTC".to_string(),
            TimeZoneSpec::Fixed(offset) => {
                // POSIX Etc zones have inverted signs and whole hours only.
                let seconds = offset.local_minus_utc();
                if seconds % 3600 == 0 {
                    let hours = -seconds / 3600;
                    if hours > 0 {
                        format!("Etc/GMT+{hours}")
                    } else {
                        format!("Etc/GMT{hours}")
                    }
                } else {
                    "UTC".to_string()
                }
            }
            TimeZoneSpec::Named(name) => name.clone(),
        }
    }
}

fn parse_offset(raw: &str) -> Option<FixedOffset> {
    let (sign, rest) = match raw.as_bytes().first()? {
        b'+' => (1, &raw[1..]),
        b'-' => (-1, &raw[1..]),
        _ => return None,
    };
    let digits: String = rest.chars().filter(|ch| *ch != ':').collect();
    if !digits.chars().all(|ch| ch.is_ascii_digit()) {
        return None;
    }
    let (hours, minutes) = match digits.len() {
        1 | 2 => (digits.parse::<i32>().ok()?, 0),
        4 => (digits[..2].parse::<i32>().ok()?, digits[2..].parse::<i32>().ok()?),
        _ => return None,
    };
    if hours > 18 || minutes > 59 {
        return None;
    }
    FixedOffset::east_opt(sign * (hours * 3600 + minutes * 60))
}

pub fn from_millis(ms: i64) -> Option<DateTime<Utc>> {
    Utc.timestamp_millis_opt(ms).single()
}

pub fn format_key_as_string(ms: i64) -> Option<String> {
    from_millis(ms).map(|instant| instant.format(KEY_AS_STRING_FORMAT).to_string())
}

/// Parses an absolute date, an epoch-millis number, or Elasticsearch date math
/// (`now-7d/d`, `2024-01-01||+1M`).
pub fn parse_date_math(raw: &str, now: DateTime<Utc>) -> Result<DateTime<Utc>> {
    let raw = raw.trim();
    let (anchor, math) = if let Some(rest) = raw.strip_prefix("now") {
        (now, rest)
    } else if let Some((anchor, math)) = raw.split_once("||") {
        (parse_absolute(anchor)?, math)
    } else {
        return parse_absolute(raw);
    };
    apply_date_math(anchor, math)
        .ok_or_else(|| ServiceError::InvalidRequest(format!("invalid date math '{raw}'")))
}

pub fn parse_date_value(value: &Value, now: DateTime<Utc>) -> Result<DateTime<Utc>> {
    match value {
        Value::Number(number) => number
            .as_i64()
            .or_else(|| number.as_f64().map(|float| float as i64))
            .and_then(from_millis)
            .ok_or_else(|| ServiceError::InvalidRequest(format!("invalid epoch millis {number}"))),
        Value::String(raw) => parse_date_math(raw, now),
        other => Err(ServiceError::InvalidRequest(format!(
            "expected date, got {other}"
        ))),
    }
}

fn parse_absolute(raw: &str) -> Result<DateTime<Utc>> {
    let raw = raw.trim();
    if !raw.is_empty() && raw.chars().all(|ch| ch.is_ascii_digit()) {
        if let Some(instant) = raw.parse::<i64>().ok().and_then(from_millis) {
            return Ok(instant);
        }
    }
    if let Ok(parsed) = DateTime::parse_from_rfc3339(raw) {
        return Ok(parsed.with_timezone(&Utc));
    }
    for format in ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%dT%H:%M"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(raw, format) {
            return Ok(Utc.from_utc_datetime(&naive));
        }
    }
    if let Ok(date) = NaiveDate::parse_from_str(raw, "%Y-%m-%d") {
        return Ok(start_of_day(date));
    }
    Err(ServiceError::InvalidRequest(format!(
        "unsupported date format '{raw}'"
    )))
}

fn apply_date_math(mut instant: DateTime<Utc>, mut math: &str) -> Option<DateTime<Utc>> {
    while !math.is_empty() {
        let op = math.chars().next()?;
        math = &math[1..];
        match op {
            '+' | '-' => {
                let digits_end = math
                    .find(|ch: char| !ch.is_ascii_digit())
                    .unwrap_or(math.len());
                let amount: i64 = if digits_end == 0 {
                    1
                } else {
                    math[..digits_end].parse().ok()?
                };
                let unit = math[digits_end..].chars().next()?;
                math = &math[digits_end + unit.len_utf8()..];
                let signed = if op == '-' { -amount } else { amount };
                instant = shift(instant, signed, unit)?;
            }
            '/' => {
                let unit = math.chars().next()?;
                math = &math[unit.len_utf8()..];
                instant = round_down(instant, unit)?;
            }
            _ => return None,
        }
    }
    Some(instant)
}

fn shift(instant: DateTime<Utc>, amount: i64, unit: char) -> Option<DateTime<Utc>> {
    let months = |n: i64| -> Option<DateTime<Utc>> {
        let magnitude = Months::new(u32::try_from(n.unsigned_abs()).ok()?);
        if n >= 0 {
            instant.checked_add_months(magnitude)
        } else {
            instant.checked_sub_months(magnitude)
        }
    };
    match unit {
        'y' => months(amount.checked_mul(12)?),
        'M' => months(amount),
        'w' => instant.checked_add_signed(Duration::weeks(amount)),
        'd' => instant.checked_add_signed(Duration::days(amount)),
        'h' | 'H' => instant.checked_add_signed(Duration::hours(amount)),
        'm' => instant.checked_add_signed(Duration::minutes(amount)),
        's' => instant.checked_add_signed(Duration::seconds(amount)),
        _ => None,
    }
}

fn round_down(instant: DateTime<Utc>, unit: char) -> Option<DateTime<Utc>> {
    let ms = instant.timestamp_millis();
    let truncated = match unit {
        'y' => CalendarUnit::Year.truncate(instant),
        'M' => CalendarUnit::Month.truncate(instant),
        'w' => CalendarUnit::Week.truncate(instant),
        'd' => from_millis(ms - ms.rem_euclid(DAY_MS))?,
        'h' | 'H' => from_millis(ms - ms.rem_euclid(HOUR_MS))?,
        'm' => from_millis(ms - ms.rem_euclid(MINUTE_MS))?,
        's' => from_millis(ms - ms.rem_euclid(SECOND_MS))?,
        _ => return None,
    };
    Some(truncated)
}

fn first_of_month(year: i32, month: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(year, month, 1).unwrap_or(NaiveDate::MIN)
}

fn start_of_day(date: NaiveDate) -> DateTime<Utc> {
    Utc.from_utc_datetime(&date.and_time(chrono::NaiveTime::MIN))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 15, 13, 45, 30).unwrap()
    }

    #[test]
    fn formats_key_as_string() {
        assert_eq!(
            format_key_as_string(56962398 * 30_000).as_deref(),
            Some("2024-02-25T14:39:00.000")
        );
    }

    #[test]
    fn parses_fixed_intervals() {
        assert_eq!(Interval::parse_fixed("30s").unwrap(), Interval::Fixed { ms: 30_000 });
        assert_eq!(Interval::parse_fixed("12h").unwrap(), Interval::Fixed { ms: 12 * HOUR_MS });
        assert!(Interval::parse_fixed("1M").is_err());
        assert!(Interval::parse_fixed("0s").is_err());
        assert!(Interval::parse_fixed("s").is_err());
    }

    #[test]
    fn calendar_days_are_fixed() {
        assert_eq!(Interval::parse_calendar("day").unwrap(), Interval::Fixed { ms: DAY_MS });
        assert_eq!(
            Interval::parse_calendar("1M").unwrap(),
            Interval::Calendar(CalendarUnit::Month)
        );
        assert_eq!(
            Interval::parse_legacy("5m").unwrap(),
            Interval::Fixed { ms: 5 * MINUTE_MS }
        );
        assert_eq!(
            Interval::parse_legacy("year").unwrap(),
            Interval::Calendar(CalendarUnit::Year)
        );
    }

    #[test]
    fn parses_time_zones() {
        assert_eq!(TimeZoneSpec::parse("UTC"), TimeZoneSpec::Utc);
        assert_eq!(TimeZoneSpec::parse("+00:00"), TimeZoneSpec::Utc);
        let tz = TimeZoneSpec::parse("+02:00");
        assert_eq!(tz.offset_ms(), 2 * HOUR_MS);
        assert_eq!(tz.sql_name(), "Etc/GMT-2");
        assert_eq!(TimeZoneSpec::parse("-0530").offset_ms(), -(5 * HOUR_MS + 30 * MINUTE_MS));
        assert_eq!(
            TimeZoneSpec::parse("Europe/Warsaw"),
            TimeZoneSpec::Named("Europe/Warsaw".into())
        );
    }

    #[test]
    fn date_math_relative_to_now() {
        let now = now();
        assert_eq!(parse_date_math("now", now).unwrap(), now);
        assert_eq!(
            parse_date_math("now-1d", now).unwrap(),
            Utc.with_ymd_and_hms(2024, 3, 14, 13, 45, 30).unwrap()
        );
        assert_eq!(
            parse_date_math("now-1M/M", now).unwrap(),
            Utc.with_ymd_and_hms(2024, 2, 1, 0, 0, 0).unwrap()
        );
        assert_eq!(
            parse_date_math("now/d", now).unwrap(),
            Utc.with_ymd_and_hms(2024, 3, 15, 0, 0, 0).unwrap()
        );
        assert!(parse_date_math("now-1x", now).is_err());
    }

    #[test]
    fn absolute_dates_and_anchors() {
        let now = now();
        assert_eq!(
            parse_date_math("2024-01-31", now).unwrap(),
            Utc.with_ymd_and_hms(2024, 1, 31, 0, 0, 0).unwrap()
        );
        assert_eq!(
            parse_date_math("2024-01-31||+1M", now).unwrap(),
            Utc.with_ymd_and_hms(2024, 2, 29, 0, 0, 0).unwrap()
        );
        assert_eq!(
            parse_date_math("2024-02-25T14:39:00.000Z", now).unwrap(),
            from_millis(56962398 * 30_000).unwrap()
        );
        assert_eq!(
            parse_date_value(&serde_json::json!(1708871940000_i64), now).unwrap(),
            from_millis(1708871940000).unwrap()
        );
    }

    #[test]
    fn calendar_truncation_and_advance() {
        let instant = now();
        assert_eq!(
            CalendarUnit::Week.truncate(instant),
            Utc.with_ymd_and_hms(2024, 3, 11, 0, 0, 0).unwrap()
        );
        assert_eq!(
            CalendarUnit::Quarter.truncate(instant),
            Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap()
        );
        assert_eq!(
            CalendarUnit::Month.advance(Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap()),
            Utc.with_ymd_and_hms(2024, 2, 1, 0, 0, 0).unwrap()
        );
    }
}
