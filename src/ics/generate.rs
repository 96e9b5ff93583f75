/*!
 * Fresh VEVENT Generation
 *
 * Synthesizes a conformant VCALENDAR for events the server has never seen
 * (or whose stored blob is unusable). The VEVENT skeleton is built with the
 * `icalendar` crate; alarms, EXDATE groups and the VTIMEZONE definition are
 * attached through the component layer, which also performs final emission.
 */

use chrono::{Datelike, NaiveDateTime};
use icalendar::{
    Calendar as IcalCalendar, CalendarDateTime, Component as _, DatePerhapsTime,
    Event as IcalEvent, EventLike,
};

use crate::ics::component::{parse_calendar, IcsComponent, VALARM, VEVENT, VTIMEZONE};
use crate::ics::line::{escape_text, ContentLine};
use crate::ics::vtimezone::build_vtimezone;
use crate::time::utc_from_ms;
use crate::types::Event;

/// Synthesizes a complete VCALENDAR blob for the entity from scratch.
pub fn generate_fresh(event: &Event, now_ms: i64) -> String {
    let mut ical_event = IcalEvent::new();
    ical_event.uid(&event.uid);
    ical_event.summary(&event.title);
    if let Some(location) = &event.location {
        ical_event.location(location);
    }
    if let Some(description) = &event.description {
        ical_event.description(description);
    }

    ical_event.starts(date_perhaps_time(event, event.start_ts, false));
    ical_event.ends(date_perhaps_time(event, event.end_ts, true));
    ical_event.timestamp(utc_from_ms(now_ms));

    ical_event.add_property("STATUS", event.status.as_str());
    ical_event.add_property("TRANSP", &event.transp);
    ical_event.add_property("CLASS", &event.classification);
    ical_event.add_property("SEQUENCE", &event.sequence.to_string());
    if let Some(rrule) = &event.rrule {
        ical_event.add_property("RRULE", rrule);
    }

    let mut skeleton = IcalCalendar::new();
    skeleton.push(ical_event);
    let rendered = skeleton.to_string();

    // The builder output always reparses; finish through the component layer.
    let mut calendar = match parse_calendar(&rendered) {
        Ok(calendar) => calendar,
        Err(_) => return rendered,
    };
    decorate(&mut calendar, event);
    calendar.serialize()
}

/// Converts the entity's instant into the wire form the builder expects.
/// All-day ends are stored inclusive; the exclusive wire date is the day
/// after (inclusive end + 1 ms lands exactly on that midnight).
fn date_perhaps_time(event: &Event, ts_ms: i64, is_end: bool) -> DatePerhapsTime {
    if event.is_all_day {
        let wire_ms = if is_end { ts_ms + 1 } else { ts_ms };
        return DatePerhapsTime::Date(utc_from_ms(wire_ms).date_naive());
    }
    if let Some(tzid) = &event.timezone {
        if let Ok(tz) = tzid.parse::<chrono_tz::Tz>() {
            use chrono::TimeZone;
            let local: NaiveDateTime = tz
                .from_utc_datetime(&utc_from_ms(ts_ms).naive_utc())
                .naive_local();
            return DatePerhapsTime::DateTime(CalendarDateTime::WithTimezone {
                date_time: local,
                tzid: tzid.clone(),
            });
        }
    }
    DatePerhapsTime::DateTime(CalendarDateTime::Utc(utc_from_ms(ts_ms)))
}

/// Attaches everything the builder does not cover: EXDATE groups, ORGANIZER,
/// RECURRENCE-ID for exceptions, VALARMs, and the VTIMEZONE definition for a
/// referenced named zone.
fn decorate(calendar: &mut IcsComponent, event: &Event) {
    let needs_vtimezone = !event.is_all_day
        && event
            .timezone
            .as_deref()
            .map(|tz| !tz.eq_ignore_ascii_case("UTC"))
            .unwrap_or(false);
    if needs_vtimezone {
        if let Some(tzid) = event.timezone.as_deref() {
            let year = utc_from_ms(event.start_ts).year();
            if let Some(vtz) = build_vtimezone(tzid, year) {
                let insert_at = calendar
                    .children
                    .iter()
                    .position(|c| c.name == VEVENT)
                    .unwrap_or(calendar.children.len());
                if calendar.children_named(VTIMEZONE).is_empty() {
                    calendar.children.insert(insert_at, vtz);
                }
            }
        }
    }

    for component in calendar.children.iter_mut().filter(|c| c.name == VEVENT) {
        if let Some(exdate) = &event.exdate {
            for group in exdate.split('\n').filter(|g| !g.is_empty()) {
                let all_date = group.split(',').all(|v| v.len() == 8);
                let line = if all_date {
                    ContentLine::with_params("EXDATE", ";VALUE=DATE", group.to_string())
                } else {
                    ContentLine::new("EXDATE", group.to_string())
                };
                component.lines.push(line);
            }
        }
        if let Some(rdate) = &event.rdate {
            for group in rdate.split('\n').filter(|g| !g.is_empty()) {
                component
                    .lines
                    .push(ContentLine::new("RDATE", group.to_string()));
            }
        }
        if let Some(email) = &event.organizer_email {
            let params = event
                .organizer_name
                .as_ref()
                .map(|name| format!(";CN={}", name))
                .unwrap_or_default();
            component.set_line(ContentLine::with_params(
                "ORGANIZER",
                &params,
                format!("mailto:{}", email),
            ));
        }
        if let Some(instance) = event.original_instance_time {
            if event.is_exception() {
                let line = if event.is_all_day {
                    ContentLine::with_params(
                        "RECURRENCE-ID",
                        ";VALUE=DATE",
                        utc_from_ms(instance).format("%Y%m%d").to_string(),
                    )
                } else {
                    ContentLine::new(
                        "RECURRENCE-ID",
                        utc_from_ms(instance).format("%Y%m%dT%H%M%SZ").to_string(),
                    )
                };
                component.set_line(line);
            }
        }
        for offset in &event.reminders {
            let mut alarm = IcsComponent::new(VALARM);
            alarm.lines.push(ContentLine::new("ACTION", "DISPLAY"));
            alarm
                .lines
                .push(ContentLine::new("DESCRIPTION", escape_text(&event.title)));
            alarm.lines.push(ContentLine::new("TRIGGER", offset.clone()));
            component.children.push(alarm);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ics::parse::parse_events;
    use crate::time::{day_code_to_utc_midnight_ms, LAST_MS_OF_DAY};
    use crate::types::{EventStatus, SyncStatus};

    fn draft_event() -> Event {
        Event {
            id: "e1".into(),
            uid: "fresh-uid-1".into(),
            import_id: "fresh-uid-1".into(),
            calendar_id: "c1".into(),
            title: "Dentist, maybe".into(),
            location: Some("Main St 5".into()),
            description: Some("Bring card".into()),
            start_ts: day_code_to_utc_midnight_ms(20250610).unwrap() + 8 * 3_600_000,
            end_ts: day_code_to_utc_midnight_ms(20250610).unwrap() + 9 * 3_600_000,
            timezone: None,
            is_all_day: false,
            status: EventStatus::Confirmed,
            transp: "OPAQUE".into(),
            classification: "PUBLIC".into(),
            organizer_email: None,
            organizer_name: None,
            rrule: None,
            rdate: None,
            exdate: None,
            duration: None,
            original_event_id: None,
            original_instance_time: None,
            reminders: vec!["-PT15M".into()],
            extra_properties: Default::default(),
            raw_ical: None,
            dtstamp: 0,
            caldav_url: None,
            etag: None,
            sequence: 0,
            sync_status: SyncStatus::PendingCreate,
            last_sync_error: None,
            sync_retry_count: 0,
            parser_version: crate::ics::parse::PARSER_VERSION,
            local_modified_at: None,
            server_modified_at: None,
        }
    }

    #[test]
    fn test_generate_round_trip_preserves_core_fields() {
        let event = draft_event();
        let blob = generate_fresh(&event, 1_750_000_000_000);
        let parsed = &parse_events(&blob).unwrap()[0];
        assert_eq!(parsed.uid, "fresh-uid-1");
        assert_eq!(parsed.title, "Dentist, maybe");
        assert_eq!(parsed.location.as_deref(), Some("Main St 5"));
        assert_eq!(parsed.start_ts, event.start_ts);
        assert_eq!(parsed.end_ts, event.end_ts);
        assert_eq!(parsed.sequence, 0);
        assert_eq!(parsed.reminders(), vec!["-PT15M"]);
    }

    #[test]
    fn test_generate_all_day_uses_exclusive_date_dtend() {
        let mut event = draft_event();
        event.is_all_day = true;
        event.start_ts = day_code_to_utc_midnight_ms(20251225).unwrap();
        event.end_ts = event.start_ts + LAST_MS_OF_DAY;
        let blob = generate_fresh(&event, 1_750_000_000_000);
        assert!(blob.contains("DTSTART;VALUE=DATE:20251225"));
        assert!(blob.contains("DTEND;VALUE=DATE:20251226"));
        let parsed = &parse_events(&blob).unwrap()[0];
        assert!(parsed.is_all_day);
        assert_eq!(parsed.end_ts, event.end_ts);
    }

    #[test]
    fn test_generate_named_zone_emits_vtimezone() {
        let mut event = draft_event();
        event.timezone = Some("Europe/Berlin".into());
        let blob = generate_fresh(&event, 1_750_000_000_000);
        assert!(blob.contains("BEGIN:VTIMEZONE"));
        assert!(blob.contains("TZID:Europe/Berlin"));
        assert!(blob.contains("DTSTART;TZID=Europe/Berlin:"));
        let parsed = &parse_events(&blob).unwrap()[0];
        assert_eq!(parsed.start_ts, event.start_ts);
        assert_eq!(parsed.timezone.as_deref(), Some("Europe/Berlin"));
    }

    #[test]
    fn test_generate_rrule_and_exdate() {
        let mut event = draft_event();
        event.rrule = Some("FREQ=WEEKLY;BYDAY=TU".into());
        event.exdate = Some("20250617T080000Z".into());
        let blob = generate_fresh(&event, 1_750_000_000_000);
        let parsed = &parse_events(&blob).unwrap()[0];
        assert_eq!(parsed.rrule.as_deref(), Some("FREQ=WEEKLY;BYDAY=TU"));
        assert_eq!(parsed.exdate.as_deref(), Some("20250617T080000Z"));
    }

    #[test]
    fn test_generate_exception_carries_recurrence_id() {
        let mut event = draft_event();
        event.original_event_id = Some("master".into());
        event.original_instance_time = Some(event.start_ts);
        let blob = generate_fresh(&event, 1_750_000_000_000);
        let parsed = &parse_events(&blob).unwrap()[0];
        assert_eq!(parsed.recurrence_id, Some(event.start_ts));
    }
}
