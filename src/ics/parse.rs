/*!
 * Typed iCalendar Extraction
 *
 * Turns server-authored blobs into `ParsedEvent`s, one per VEVENT. The
 * original blob is kept verbatim by the caller; this module only reads.
 * All-day DTEND values follow the RFC exclusive convention on the wire and
 * are converted here into the store's inclusive last-millisecond form.
 */

use std::collections::HashMap;

use chrono::{NaiveDate, NaiveDateTime, TimeZone, Utc};
use chrono_tz::Tz;

use crate::error::{CalendarError, CalendarResult};
use crate::ics::component::{parse_calendar, IcsComponent, VALARM, VEVENT};
use crate::ics::line::{unescape_text, ContentLine};
use crate::time::{parse_iso8601_duration, LAST_MS_OF_DAY, MS_PER_DAY};
use crate::types::EventStatus;

/// Bumped whenever extraction semantics change; rows written by an older
/// codec are re-parsed from `raw_ical` on the next pull even when the etag
/// is unchanged.
pub const PARSER_VERSION: i64 = 3;

/// A parsed DATE or DATE-TIME property value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IcsInstant {
    pub ts_ms: i64,
    pub is_date: bool,
    pub tzid: Option<String>,
}

/// One VALARM, reduced to what reminder mapping needs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedAlarm {
    pub action: String,
    /// Raw TRIGGER value, e.g. `-PT15M` or an absolute DATE-TIME.
    pub trigger: String,
    pub description: Option<String>,
}

/// Typed projection of one VEVENT.
#[derive(Debug, Clone)]
pub struct ParsedEvent {
    pub uid: String,
    /// RECURRENCE-ID instant; present exactly for exception events.
    pub recurrence_id: Option<i64>,
    pub title: String,
    pub location: Option<String>,
    pub description: Option<String>,
    pub start_ts: i64,
    pub end_ts: i64,
    pub timezone: Option<String>,
    pub is_all_day: bool,
    pub status: EventStatus,
    pub transp: String,
    pub classification: String,
    pub organizer_email: Option<String>,
    pub organizer_name: Option<String>,
    pub rrule: Option<String>,
    /// RDATE instants normalized to UTC wire form, lines joined with '\n'.
    pub rdate: Option<String>,
    /// EXDATE instants normalized to UTC wire form, lines joined with '\n'.
    pub exdate: Option<String>,
    /// Original DURATION value when the event used DURATION instead of DTEND.
    pub duration: Option<String>,
    pub sequence: i64,
    pub dtstamp: i64,
    pub last_modified: Option<i64>,
    pub alarms: Vec<ParsedAlarm>,
    /// Full ATTENDEE property texts, in document order.
    pub attendees: Vec<String>,
    /// X-* properties: full name (with parameters) → value.
    pub x_properties: HashMap<String, String>,
    /// Every property of the VEVENT keyed by property name, full texts.
    pub raw_properties: HashMap<String, Vec<String>>,
}

impl ParsedEvent {
    /// Reminder offsets extracted from duration-valued VALARM triggers,
    /// sorted nearest-to-event first (ascending absolute magnitude).
    pub fn reminders(&self) -> Vec<String> {
        let mut parsed: Vec<(i64, String)> = self
            .alarms
            .iter()
            .filter_map(|a| {
                parse_iso8601_duration(&a.trigger)
                    .map(|d| (d.num_milliseconds().abs(), a.trigger.clone()))
            })
            .collect();
        parsed.sort_by_key(|(magnitude, _)| *magnitude);
        parsed.into_iter().map(|(_, offset)| offset).collect()
    }
}

/// Parses a DATE (`20251225`) or DATE-TIME (`20251225T093000[Z]`) value,
/// resolving TZID through the IANA database. Floating times are read as UTC.
pub fn parse_instant(value: &str, tzid: Option<&str>) -> Option<IcsInstant> {
    let value = value.trim();
    if value.len() == 8 && value.chars().all(|c| c.is_ascii_digit()) {
        let date = NaiveDate::parse_from_str(value, "%Y%m%d").ok()?;
        let midnight = Utc.from_utc_datetime(&date.and_hms_opt(0, 0, 0)?);
        return Some(IcsInstant {
            ts_ms: midnight.timestamp_millis(),
            is_date: true,
            tzid: None,
        });
    }

    let (body, is_utc) = match value.strip_suffix('Z') {
        Some(body) => (body, true),
        None => (value, false),
    };
    let naive = NaiveDateTime::parse_from_str(body, "%Y%m%dT%H%M%S").ok()?;

    if is_utc {
        return Some(IcsInstant {
            ts_ms: Utc.from_utc_datetime(&naive).timestamp_millis(),
            is_date: false,
            tzid: None,
        });
    }
    if let Some(tzid) = tzid {
        if let Ok(tz) = tzid.parse::<Tz>() {
            let zoned = tz
                .from_local_datetime(&naive)
                .earliest()
                .unwrap_or_else(|| tz.from_utc_datetime(&naive));
            return Some(IcsInstant {
                ts_ms: zoned.timestamp_millis(),
                is_date: false,
                tzid: Some(tzid.to_string()),
            });
        }
    }
    // Floating (or unresolvable TZID): read on the UTC clock.
    Some(IcsInstant {
        ts_ms: Utc.from_utc_datetime(&naive).timestamp_millis(),
        is_date: false,
        tzid: tzid.map(|t| t.to_string()),
    })
}

fn parse_dt_line(line: &ContentLine) -> Option<IcsInstant> {
    let tzid = line.param("TZID");
    let forced_date = line
        .param("VALUE")
        .map(|v| v.eq_ignore_ascii_case("DATE"))
        .unwrap_or(false);
    let mut instant = parse_instant(&line.value, tzid.as_deref())?;
    if forced_date {
        instant.is_date = true;
    }
    Some(instant)
}

/// Normalizes an RDATE/EXDATE property (possibly a comma-separated list)
/// into UTC wire form.
fn normalize_date_list(line: &ContentLine) -> Option<String> {
    let tzid = line.param("TZID");
    let mut out: Vec<String> = Vec::new();
    for part in line.value.split(',') {
        let instant = parse_instant(part, tzid.as_deref())?;
        let dt = crate::time::utc_from_ms(instant.ts_ms);
        if instant.is_date {
            out.push(dt.format("%Y%m%d").to_string());
        } else {
            out.push(dt.format("%Y%m%dT%H%M%SZ").to_string());
        }
    }
    Some(out.join(","))
}

fn parse_event_component(event: &IcsComponent) -> CalendarResult<ParsedEvent> {
    let uid = event
        .value_of("UID")
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
        .ok_or_else(|| CalendarError::malformed("ics", "VEVENT without UID"))?;

    let dtstart = event
        .line("DTSTART")
        .and_then(parse_dt_line)
        .ok_or_else(|| CalendarError::malformed("ics", format!("event {uid} has no DTSTART")))?;
    let is_all_day = dtstart.is_date;
    let start_ts = dtstart.ts_ms;

    let duration_value = event.value_of("DURATION").map(|v| v.to_string());
    let dtend = event.line("DTEND").and_then(parse_dt_line);
    let end_ts = match (&dtend, &duration_value) {
        (Some(end), _) => {
            if is_all_day {
                // Exclusive wire DTEND becomes the inclusive last millisecond
                // of the preceding day.
                end.ts_ms - 1
            } else {
                end.ts_ms
            }
        }
        (None, Some(duration)) => match parse_iso8601_duration(duration) {
            Some(d) if is_all_day => start_ts + d.num_milliseconds() - 1,
            Some(d) => start_ts + d.num_milliseconds(),
            None => start_ts,
        },
        (None, None) => {
            if is_all_day {
                start_ts + LAST_MS_OF_DAY
            } else {
                start_ts
            }
        }
    };
    // Guard against inverted or sub-millisecond ends from hostile feeds.
    let end_ts = end_ts.max(if is_all_day {
        start_ts + LAST_MS_OF_DAY
    } else {
        start_ts
    });

    let recurrence_id = event
        .line("RECURRENCE-ID")
        .and_then(parse_dt_line)
        .map(|i| i.ts_ms);

    let mut rdates: Vec<String> = Vec::new();
    for line in event.lines_named("RDATE") {
        if let Some(normalized) = normalize_date_list(line) {
            rdates.push(normalized);
        }
    }
    let mut exdates: Vec<String> = Vec::new();
    for line in event.lines_named("EXDATE") {
        if let Some(normalized) = normalize_date_list(line) {
            exdates.push(normalized);
        }
    }

    let (organizer_email, organizer_name) = match event.line("ORGANIZER") {
        Some(line) => {
            let email = line
                .value
                .trim()
                .strip_prefix("mailto:")
                .or_else(|| line.value.trim().strip_prefix("MAILTO:"))
                .unwrap_or(line.value.trim())
                .to_string();
            (Some(email).filter(|e| !e.is_empty()), line.param("CN"))
        }
        None => (None, None),
    };

    let mut alarms = Vec::new();
    for alarm in event.children_named(VALARM) {
        alarms.push(ParsedAlarm {
            action: alarm
                .value_of("ACTION")
                .unwrap_or("DISPLAY")
                .trim()
                .to_ascii_uppercase(),
            trigger: alarm.value_of("TRIGGER").unwrap_or_default().to_string(),
            description: alarm
                .value_of("DESCRIPTION")
                .map(|v| unescape_text(v)),
        });
    }

    let mut x_properties = HashMap::new();
    let mut raw_properties: HashMap<String, Vec<String>> = HashMap::new();
    let mut attendees = Vec::new();
    for line in &event.lines {
        raw_properties
            .entry(line.name.clone())
            .or_default()
            .push(line.to_string());
        if line.name.starts_with("X-") {
            x_properties.insert(line.full_name(), line.value.clone());
        }
        if line.name == "ATTENDEE" {
            attendees.push(line.to_string());
        }
    }

    Ok(ParsedEvent {
        uid,
        recurrence_id,
        title: event
            .value_of("SUMMARY")
            .map(unescape_text)
            .unwrap_or_default(),
        location: event.value_of("LOCATION").map(unescape_text),
        description: event.value_of("DESCRIPTION").map(unescape_text),
        start_ts,
        end_ts,
        timezone: dtstart.tzid,
        is_all_day,
        status: event
            .value_of("STATUS")
            .and_then(|v| EventStatus::parse(v.trim()))
            .unwrap_or(EventStatus::Confirmed),
        transp: event
            .value_of("TRANSP")
            .unwrap_or("OPAQUE")
            .trim()
            .to_ascii_uppercase(),
        classification: event
            .value_of("CLASS")
            .unwrap_or("PUBLIC")
            .trim()
            .to_ascii_uppercase(),
        organizer_email,
        organizer_name,
        rrule: event.value_of("RRULE").map(|v| v.trim().to_string()),
        rdate: if rdates.is_empty() {
            None
        } else {
            Some(rdates.join("\n"))
        },
        exdate: if exdates.is_empty() {
            None
        } else {
            Some(exdates.join("\n"))
        },
        duration: duration_value,
        sequence: event
            .value_of("SEQUENCE")
            .and_then(|v| v.trim().parse().ok())
            .unwrap_or(0),
        dtstamp: event
            .line("DTSTAMP")
            .and_then(parse_dt_line)
            .map(|i| i.ts_ms)
            .unwrap_or(start_ts),
        last_modified: event
            .line("LAST-MODIFIED")
            .and_then(parse_dt_line)
            .map(|i| i.ts_ms),
        alarms,
        attendees,
        x_properties,
        raw_properties,
    })
}

/// Parses a blob into one ParsedEvent per VEVENT. VEVENTs that fail typed
/// extraction (no UID, no DTSTART) are skipped with a warning rather than
/// poisoning the whole collection fetch.
pub fn parse_events(blob: &str) -> CalendarResult<Vec<ParsedEvent>> {
    let calendar = parse_calendar(blob)?;
    let mut events = Vec::new();
    for component in calendar.children_named(VEVENT) {
        match parse_event_component(component) {
            Ok(parsed) => events.push(parsed),
            Err(err) => {
                tracing::warn!("Skipping unparseable VEVENT: {}", err);
            }
        }
    }
    Ok(events)
}

/// Returns the number of calendar days an all-day event spans, derived from
/// its inclusive end.
pub fn all_day_span_days(start_ts: i64, end_ts_inclusive: i64) -> i64 {
    ((end_ts_inclusive - start_ts) / MS_PER_DAY) + 1
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::time::day_code_to_utc_midnight_ms;

    const TOKYO_ALL_DAY: &str = "BEGIN:VCALENDAR\r\nVERSION:2.0\r\nPRODID:-//Test//EN\r\nBEGIN:VEVENT\r\nUID:allday-1\r\nDTSTAMP:20251201T000000Z\r\nDTSTART;VALUE=DATE:20251225\r\nDTEND;VALUE=DATE:20251226\r\nSUMMARY:Christmas\r\nEND:VEVENT\r\nEND:VCALENDAR\r\n";

    #[test]
    fn test_all_day_inclusive_end() {
        let events = parse_events(TOKYO_ALL_DAY).unwrap();
        assert_eq!(events.len(), 1);
        let e = &events[0];
        assert!(e.is_all_day);
        let midnight = day_code_to_utc_midnight_ms(20251225).unwrap();
        assert_eq!(e.start_ts, midnight);
        assert_eq!(e.end_ts, midnight + LAST_MS_OF_DAY);
        assert_eq!(all_day_span_days(e.start_ts, e.end_ts), 1);
    }

    #[test]
    fn test_multi_day_all_day_exclusive_dtend() {
        let blob = "BEGIN:VCALENDAR\r\nBEGIN:VEVENT\r\nUID:trip\r\nDTSTART;VALUE=DATE:20251010\r\nDTEND;VALUE=DATE:20251013\r\nSUMMARY:Trip\r\nEND:VEVENT\r\nEND:VCALENDAR\r\n";
        let e = &parse_events(blob).unwrap()[0];
        let start = day_code_to_utc_midnight_ms(20251010).unwrap();
        // DTEND Oct 13 exclusive means the event ends Oct 12 23:59:59.999.
        assert_eq!(e.start_ts, start);
        assert_eq!(e.end_ts, day_code_to_utc_midnight_ms(20251012).unwrap() + LAST_MS_OF_DAY);
        assert_eq!(all_day_span_days(e.start_ts, e.end_ts), 3);
    }

    #[test]
    fn test_timed_with_tzid() {
        let blob = "BEGIN:VCALENDAR\r\nBEGIN:VEVENT\r\nUID:tz-1\r\nDTSTART;TZID=Asia/Tokyo:20251225T090000\r\nDTEND;TZID=Asia/Tokyo:20251225T100000\r\nSUMMARY:Morning\r\nEND:VEVENT\r\nEND:VCALENDAR\r\n";
        let e = &parse_events(blob).unwrap()[0];
        // 09:00 JST is 00:00 UTC.
        assert_eq!(e.start_ts, day_code_to_utc_midnight_ms(20251225).unwrap());
        assert_eq!(e.end_ts - e.start_ts, 3_600_000);
        assert_eq!(e.timezone.as_deref(), Some("Asia/Tokyo"));
        assert!(!e.is_all_day);
    }

    #[test]
    fn test_alarms_and_reminder_sorting() {
        let blob = "BEGIN:VCALENDAR\r\nBEGIN:VEVENT\r\nUID:alarm-1\r\nDTSTART:20251225T090000Z\r\nDTEND:20251225T100000Z\r\nSUMMARY:Meeting\r\nBEGIN:VALARM\r\nACTION:EMAIL\r\nTRIGGER:-P1D\r\nEND:VALARM\r\nBEGIN:VALARM\r\nACTION:DISPLAY\r\nTRIGGER:-PT5M\r\nEND:VALARM\r\nBEGIN:VALARM\r\nACTION:DISPLAY\r\nTRIGGER:-PT1H\r\nEND:VALARM\r\nEND:VEVENT\r\nEND:VCALENDAR\r\n";
        let e = &parse_events(blob).unwrap()[0];
        assert_eq!(e.alarms.len(), 3);
        assert_eq!(e.alarms[0].action, "EMAIL");
        assert_eq!(e.reminders(), vec!["-PT5M", "-PT1H", "-P1D"]);
    }

    #[test]
    fn test_exception_recurrence_id() {
        let blob = "BEGIN:VCALENDAR\r\nBEGIN:VEVENT\r\nUID:series\r\nDTSTART:20250101T100000Z\r\nDTEND:20250101T110000Z\r\nRRULE:FREQ=DAILY;COUNT=5\r\nSUMMARY:Series\r\nEND:VEVENT\r\nBEGIN:VEVENT\r\nUID:series\r\nRECURRENCE-ID:20250103T100000Z\r\nDTSTART:20250103T120000Z\r\nDTEND:20250103T130000Z\r\nSUMMARY:Moved instance\r\nEND:VEVENT\r\nEND:VCALENDAR\r\n";
        let events = parse_events(blob).unwrap();
        assert_eq!(events.len(), 2);
        let master = events.iter().find(|e| e.recurrence_id.is_none()).unwrap();
        let exception = events.iter().find(|e| e.recurrence_id.is_some()).unwrap();
        assert_eq!(master.rrule.as_deref(), Some("FREQ=DAILY;COUNT=5"));
        assert_eq!(exception.uid, master.uid);
        let expected = parse_instant("20250103T100000Z", None).unwrap().ts_ms;
        assert_eq!(exception.recurrence_id, Some(expected));
    }

    #[test]
    fn test_x_properties_and_attendees_captured() {
        let blob = "BEGIN:VCALENDAR\r\nBEGIN:VEVENT\r\nUID:x-1\r\nDTSTART:20250601T080000Z\r\nSUMMARY:Sync\r\nX-APPLE-TRAVEL-ADVISORY-BEHAVIOR:AUTOMATIC\r\nATTENDEE;CN=Jane:mailto:jane@example.com\r\nATTENDEE;CN=Ola:mailto:ola@example.com\r\nORGANIZER;CN=Boss:mailto:boss@example.com\r\nEND:VEVENT\r\nEND:VCALENDAR\r\n";
        let e = &parse_events(blob).unwrap()[0];
        assert_eq!(
            e.x_properties.get("X-APPLE-TRAVEL-ADVISORY-BEHAVIOR").map(String::as_str),
            Some("AUTOMATIC")
        );
        assert_eq!(e.attendees.len(), 2);
        assert_eq!(e.organizer_email.as_deref(), Some("boss@example.com"));
        assert_eq!(e.organizer_name.as_deref(), Some("Boss"));
        assert_eq!(e.raw_properties.get("ATTENDEE").map(Vec::len), Some(2));
    }

    #[test]
    fn test_exdate_normalized_to_utc() {
        let blob = "BEGIN:VCALENDAR\r\nBEGIN:VEVENT\r\nUID:ex-1\r\nDTSTART;TZID=Europe/Berlin:20250601T090000\r\nRRULE:FREQ=DAILY\r\nEXDATE;TZID=Europe/Berlin:20250603T090000,20250605T090000\r\nSUMMARY:Daily\r\nEND:VEVENT\r\nEND:VCALENDAR\r\n";
        let e = &parse_events(blob).unwrap()[0];
        // Berlin is UTC+2 in June.
        assert_eq!(e.exdate.as_deref(), Some("20250603T070000Z,20250605T070000Z"));
    }

    #[test]
    fn test_event_without_uid_is_skipped() {
        let blob = "BEGIN:VCALENDAR\r\nBEGIN:VEVENT\r\nDTSTART:20250101T000000Z\r\nSUMMARY:No uid\r\nEND:VEVENT\r\nBEGIN:VEVENT\r\nUID:ok\r\nDTSTART:20250101T000000Z\r\nSUMMARY:Fine\r\nEND:VEVENT\r\nEND:VCALENDAR\r\n";
        let events = parse_events(blob).unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].uid, "ok");
    }
}
