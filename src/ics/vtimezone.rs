/*!
 * VTIMEZONE Synthesis
 *
 * Fresh PUT bodies that reference a named timezone must ship a VTIMEZONE
 * definition. The observances are derived from the IANA database for the
 * event's year: offsets are sampled per day to locate transitions, then the
 * transition hour is found by bisection. Servers treat VTIMEZONE as
 * informational, so a single-year definition is sufficient for interop.
 */

use chrono::{Datelike, NaiveDate, TimeZone, Utc};
use chrono_tz::Tz;

use crate::ics::component::{IcsComponent, VTIMEZONE};
use crate::ics::line::ContentLine;

fn offset_seconds_at(tz: Tz, utc_ms: i64) -> i32 {
    use chrono::Offset;
    let dt = crate::time::utc_from_ms(utc_ms);
    tz.offset_from_utc_datetime(&dt.naive_utc()).fix().local_minus_utc()
}

fn format_offset(seconds: i32) -> String {
    let sign = if seconds < 0 { '-' } else { '+' };
    let abs = seconds.abs();
    format!("{}{:02}{:02}", sign, abs / 3600, (abs % 3600) / 60)
}

/// Builds a VTIMEZONE component for the zone covering the given year.
/// Returns None for UTC and fixed-offset-only years without transitions are
/// emitted as a single STANDARD observance.
pub fn build_vtimezone(tzid: &str, year: i32) -> Option<IcsComponent> {
    let tz: Tz = tzid.parse().ok()?;
    if tzid.eq_ignore_ascii_case("UTC") {
        return None;
    }

    let jan1 = Utc
        .from_utc_datetime(&NaiveDate::from_ymd_opt(year, 1, 1)?.and_hms_opt(0, 0, 0)?)
        .timestamp_millis();
    let day_ms = crate::time::MS_PER_DAY;
    let days_in_year = if NaiveDate::from_ymd_opt(year, 12, 31)?.ordinal() == 366 {
        366
    } else {
        365
    };

    // Locate offset-change days, then bisect within the day to the hour.
    let mut transitions: Vec<(i64, i32, i32)> = Vec::new();
    let mut prev_offset = offset_seconds_at(tz, jan1);
    let base_offset = prev_offset;
    for day in 1..days_in_year {
        let probe = jan1 + day * day_ms;
        let offset = offset_seconds_at(tz, probe);
        if offset != prev_offset {
            let mut lo = probe - day_ms;
            let mut hi = probe;
            while hi - lo > 3_600_000 {
                let mid = lo + (hi - lo) / 2 / 3_600_000 * 3_600_000;
                if offset_seconds_at(tz, mid) == prev_offset {
                    lo = mid.max(lo + 3_600_000);
                } else {
                    hi = mid;
                }
            }
            transitions.push((hi, prev_offset, offset));
            prev_offset = offset;
        }
    }

    let mut component = IcsComponent::new(VTIMEZONE);
    component.lines.push(ContentLine::new("TZID", tzid.to_string()));

    if transitions.is_empty() {
        let mut standard = IcsComponent::new("STANDARD");
        standard
            .lines
            .push(ContentLine::new("DTSTART", "19700101T000000"));
        standard
            .lines
            .push(ContentLine::new("TZOFFSETFROM", format_offset(base_offset)));
        standard
            .lines
            .push(ContentLine::new("TZOFFSETTO", format_offset(base_offset)));
        component.children.push(standard);
        return Some(component);
    }

    for (at_ms, from, to) in transitions {
        let kind = if to > from { "DAYLIGHT" } else { "STANDARD" };
        // Observance DTSTART is local wall time under the pre-transition offset.
        let local = crate::time::utc_from_ms(at_ms + from as i64 * 1000);
        let mut observance = IcsComponent::new(kind);
        observance.lines.push(ContentLine::new(
            "DTSTART",
            local.format("%Y%m%dT%H%M%S").to_string(),
        ));
        observance
            .lines
            .push(ContentLine::new("TZOFFSETFROM", format_offset(from)));
        observance
            .lines
            .push(ContentLine::new("TZOFFSETTO", format_offset(to)));
        component.children.push(observance);
    }
    Some(component)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_berlin_has_two_observances() {
        let vtz = build_vtimezone("Europe/Berlin", 2025).unwrap();
        assert_eq!(vtz.value_of("TZID"), Some("Europe/Berlin"));
        let kinds: Vec<&str> = vtz.children.iter().map(|c| c.name.as_str()).collect();
        assert!(kinds.contains(&"DAYLIGHT"));
        assert!(kinds.contains(&"STANDARD"));
        let daylight = vtz.children.iter().find(|c| c.name == "DAYLIGHT").unwrap();
        assert_eq!(daylight.value_of("TZOFFSETFROM"), Some("+0100"));
        assert_eq!(daylight.value_of("TZOFFSETTO"), Some("+0200"));
    }

    #[test]
    fn test_tokyo_is_fixed_offset() {
        let vtz = build_vtimezone("Asia/Tokyo", 2025).unwrap();
        assert_eq!(vtz.children.len(), 1);
        assert_eq!(vtz.children[0].name, "STANDARD");
        assert_eq!(vtz.children[0].value_of("TZOFFSETTO"), Some("+0900"));
    }

    #[test]
    fn test_utc_yields_none() {
        assert!(build_vtimezone("UTC", 2025).is_none());
        assert!(build_vtimezone("Not/AZone", 2025).is_none());
    }
}
