/*!
 * Time and Day-Code Helpers
 *
 * Epoch-millisecond conversions, YYYYMMDD day codes and ISO-8601 durations.
 * Day codes for all-day events always come from the UTC calendar; timed
 * events use the device zone so the UI buckets them onto the local day.
 */

use chrono::{DateTime, Datelike, Duration, NaiveDate, TimeZone, Utc};
use chrono_tz::Tz;

pub const MS_PER_DAY: i64 = 86_400_000;
/// Inclusive last millisecond of a day relative to its UTC midnight.
pub const LAST_MS_OF_DAY: i64 = MS_PER_DAY - 1;

pub fn utc_from_ms(ms: i64) -> DateTime<Utc> {
    DateTime::<Utc>::from_timestamp_millis(ms).unwrap_or_else(|| {
        // Out-of-range timestamps cannot come from parsed wire data; clamp
        // instead of propagating an impossible error through every caller.
        DateTime::<Utc>::from_timestamp_millis(0).unwrap()
    })
}

pub fn ms_from_utc(dt: DateTime<Utc>) -> i64 {
    dt.timestamp_millis()
}

/// Derives the YYYYMMDD day code for a timestamp. All-day timestamps are
/// interpreted on the UTC calendar; timed ones on the device calendar.
pub fn to_day_format(ts_ms: i64, is_all_day: bool, device_tz: Tz) -> i32 {
    let utc = utc_from_ms(ts_ms);
    if is_all_day {
        date_to_day_code(utc.year(), utc.month(), utc.day())
    } else {
        let local = utc.with_timezone(&device_tz);
        date_to_day_code(local.year(), local.month(), local.day())
    }
}

pub fn date_to_day_code(year: i32, month: u32, day: u32) -> i32 {
    year * 10_000 + month as i32 * 100 + day as i32
}

pub fn day_code_to_date(day_code: i32) -> Option<NaiveDate> {
    let year = day_code / 10_000;
    let month = (day_code / 100 % 100) as u32;
    let day = (day_code % 100) as u32;
    NaiveDate::from_ymd_opt(year, month, day)
}

/// Number of calendar days from `start_day` to `end_day`, handling
/// month/year/leap boundaries with integer date math.
pub fn calculate_days_between(start_day: i32, end_day: i32) -> i64 {
    match (day_code_to_date(start_day), day_code_to_date(end_day)) {
        (Some(start), Some(end)) => end.signed_duration_since(start).num_days(),
        _ => 0,
    }
}

/// UTC midnight of the given day code, in epoch milliseconds.
pub fn day_code_to_utc_midnight_ms(day_code: i32) -> Option<i64> {
    let date = day_code_to_date(day_code)?;
    let dt = Utc.from_utc_datetime(&date.and_hms_opt(0, 0, 0)?);
    Some(dt.timestamp_millis())
}

/// Inclusive all-day end for a start that falls on a UTC midnight: the last
/// millisecond of the day `days` days later.
pub fn all_day_inclusive_end_ms(start_midnight_ms: i64, days: i64) -> i64 {
    start_midnight_ms + (days - 1).max(0) * MS_PER_DAY + LAST_MS_OF_DAY
}

/// RFC 5545 UTC DATE-TIME, e.g. `20251225T093000Z`, used in calendar-query
/// time-range filters.
pub fn format_caldav_datetime(ts_ms: i64) -> String {
    utc_from_ms(ts_ms).format("%Y%m%dT%H%M%SZ").to_string()
}

/// Parses an ISO-8601 duration such as `-PT15M`, `P1D`, `PT1H30M` or `-P2W`.
/// Returns None on anything that is not a duration.
pub fn parse_iso8601_duration(input: &str) -> Option<Duration> {
    let s = input.trim();
    let (negative, s) = match s.strip_prefix('-') {
        Some(rest) => (true, rest),
        None => (false, s.strip_prefix('+').unwrap_or(s)),
    };
    let s = s.strip_prefix('P')?;

    let mut total_ms: i64 = 0;
    let mut in_time = false;
    let mut number = String::new();
    for ch in s.chars() {
        match ch {
            'T' | 't' => {
                if !number.is_empty() {
                    return None;
                }
                in_time = true;
            }
            '0'..='9' => number.push(ch),
            unit => {
                let value: i64 = number.parse().ok()?;
                number.clear();
                let ms = match (unit.to_ascii_uppercase(), in_time) {
                    ('W', false) => value.checked_mul(7 * MS_PER_DAY)?,
                    ('D', false) => value.checked_mul(MS_PER_DAY)?,
                    ('H', true) => value.checked_mul(3_600_000)?,
                    ('M', true) => value.checked_mul(60_000)?,
                    ('S', true) => value.checked_mul(1_000)?,
                    _ => return None,
                };
                total_ms = total_ms.checked_add(ms)?;
            }
        }
    }
    if !number.is_empty() {
        return None;
    }

    Some(Duration::milliseconds(if negative {
        -total_ms
    } else {
        total_ms
    }))
}

/// Formats a duration as an ISO-8601 string. The zero duration becomes
/// `PT0S`; negative durations carry a leading `-`.
pub fn format_iso8601_duration(duration: Duration) -> String {
    let total_secs = duration.num_seconds();
    if total_secs == 0 {
        return "PT0S".to_string();
    }
    let negative = total_secs < 0;
    let mut secs = total_secs.abs();

    let days = secs / 86_400;
    secs %= 86_400;
    let hours = secs / 3_600;
    secs %= 3_600;
    let minutes = secs / 60;
    secs %= 60;

    let mut out = String::new();
    if negative {
        out.push('-');
    }
    out.push('P');
    if days > 0 {
        out.push_str(&format!("{}D", days));
    }
    if hours > 0 || minutes > 0 || secs > 0 {
        out.push('T');
        if hours > 0 {
            out.push_str(&format!("{}H", hours));
        }
        if minutes > 0 {
            out.push_str(&format!("{}M", minutes));
        }
        if secs > 0 {
            out.push_str(&format!("{}S", secs));
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_day_code_round_trip() {
        let date = day_code_to_date(20251225).unwrap();
        assert_eq!((date.year(), date.month(), date.day()), (2025, 12, 25));
        assert_eq!(date_to_day_code(2025, 12, 25), 20251225);
        assert!(day_code_to_date(20250230).is_none());
    }

    #[test]
    fn test_days_between_boundaries() {
        assert_eq!(calculate_days_between(20231231, 20240101), 1);
        // 2024 is a leap year.
        assert_eq!(calculate_days_between(20240228, 20240301), 2);
        assert_eq!(calculate_days_between(20230228, 20230301), 1);
        assert_eq!(calculate_days_between(20250101, 20250101), 0);
        assert_eq!(calculate_days_between(20250110, 20250101), -9);
    }

    #[test]
    fn test_all_day_day_code_ignores_device_zone() {
        // Dec 25 00:00 UTC.
        let ts = day_code_to_utc_midnight_ms(20251225).unwrap();
        assert_eq!(to_day_format(ts, true, chrono_tz::America::New_York), 20251225);
        assert_eq!(to_day_format(ts, true, chrono_tz::Asia::Tokyo), 20251225);
    }

    #[test]
    fn test_timed_day_code_uses_device_zone() {
        // Dec 25 03:00 UTC is still Dec 24 in New York (UTC-5).
        let ts = day_code_to_utc_midnight_ms(20251225).unwrap() + 3 * 3_600_000;
        assert_eq!(to_day_format(ts, false, chrono_tz::America::New_York), 20251224);
        assert_eq!(to_day_format(ts, false, chrono_tz::UTC), 20251225);
    }

    #[test]
    fn test_all_day_inclusive_end() {
        let start = day_code_to_utc_midnight_ms(20251012).unwrap();
        // Single-day event ends at 23:59:59.999 of the same day.
        assert_eq!(all_day_inclusive_end_ms(start, 1), start + LAST_MS_OF_DAY);
        // Two-day event ends at the last millisecond of the second day.
        assert_eq!(
            all_day_inclusive_end_ms(start, 2),
            start + MS_PER_DAY + LAST_MS_OF_DAY
        );
    }

    #[test]
    fn test_caldav_datetime_format() {
        let ts = day_code_to_utc_midnight_ms(20251225).unwrap() + 9 * 3_600_000 + 30 * 60_000;
        assert_eq!(format_caldav_datetime(ts), "20251225T093000Z");
    }

    #[test]
    fn test_parse_iso8601_duration() {
        assert_eq!(
            parse_iso8601_duration("-PT15M"),
            Some(Duration::minutes(-15))
        );
        assert_eq!(parse_iso8601_duration("-P1D"), Some(Duration::days(-1)));
        assert_eq!(
            parse_iso8601_duration("PT1H30M"),
            Some(Duration::minutes(90))
        );
        assert_eq!(parse_iso8601_duration("-P2W"), Some(Duration::weeks(-2)));
        assert_eq!(parse_iso8601_duration("PT0S"), Some(Duration::zero()));
        assert_eq!(parse_iso8601_duration("15M"), None);
        assert_eq!(parse_iso8601_duration("P1H"), None); // H requires T
        assert_eq!(parse_iso8601_duration(""), None);
    }

    #[test]
    fn test_format_iso8601_duration() {
        assert_eq!(format_iso8601_duration(Duration::minutes(-15)), "-PT15M");
        assert_eq!(format_iso8601_duration(Duration::days(-1)), "-P1D");
        assert_eq!(format_iso8601_duration(Duration::minutes(90)), "PT1H30M");
        assert_eq!(format_iso8601_duration(Duration::zero()), "PT0S");
        assert_eq!(
            format_iso8601_duration(Duration::seconds(-90_061)),
            "-P1DT1H1M1S"
        );
    }

    #[test]
    fn test_duration_round_trip_keeps_sorting_magnitude() {
        let offsets = ["-PT5M", "-PT30M", "-PT1H", "-P1D"];
        let mut parsed: Vec<_> = offsets
            .iter()
            .map(|o| parse_iso8601_duration(o).unwrap())
            .collect();
        parsed.sort_by_key(|d| d.num_milliseconds().abs());
        assert_eq!(format_iso8601_duration(parsed[0]), "-PT5M");
        assert_eq!(format_iso8601_duration(parsed[3]), "-P1D");
    }
}
