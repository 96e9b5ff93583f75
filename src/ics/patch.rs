/*!
 * In-Place iCalendar Patching
 *
 * When the server authored an event, local edits must not rewrite the blob
 * wholesale: attendees, scheduling parameters, X- properties, VTIMEZONE
 * definitions and surplus alarms all belong to the server and other clients.
 * The patch path re-parses the stored blob, overwrites exactly the properties
 * the entity manages, and emits everything else untouched.
 */

use chrono::TimeZone;
use chrono_tz::Tz;

use crate::ics::component::{parse_calendar, IcsComponent, VALARM, VEVENT};
use crate::ics::generate::generate_fresh;
use crate::ics::line::{escape_text, ContentLine};
use crate::ics::parse::parse_instant;
use crate::time::utc_from_ms;
use crate::types::Event;

/// The sequence number a successful push of this patched blob should record.
pub fn patched_sequence(event: &Event) -> i64 {
    event.sequence + 1
}

/// Patches the server-authored blob with the entity's managed fields,
/// falling back to fresh generation when the original is absent or
/// unparseable.
pub fn patch(original_raw: Option<&str>, event: &Event, now_ms: i64) -> String {
    let raw = match original_raw {
        Some(raw) if !raw.trim().is_empty() => raw,
        _ => return generate_fresh(event, now_ms),
    };
    let mut calendar = match parse_calendar(raw) {
        Ok(calendar) => calendar,
        Err(err) => {
            tracing::warn!(
                "Stored blob for {} is unparseable ({}); regenerating",
                event.uid,
                err
            );
            return generate_fresh(event, now_ms);
        }
    };
    if calendar.children_named(VEVENT).is_empty() {
        return generate_fresh(event, now_ms);
    }

    let target = select_event_index(&calendar, event);
    patch_vevent(&mut calendar.children[target], event, now_ms);
    calendar.serialize()
}

/// Emits one VCALENDAR holding the patched master plus every exception as a
/// full sibling VEVENT sharing the master's UID. Exceptions previously baked
/// into the master's blob are replaced, not duplicated.
pub fn serialize_with_exceptions(
    master: &Event,
    exceptions: &[Event],
    now_ms: i64,
) -> String {
    let master_blob = patch(master.raw_ical.as_deref(), master, now_ms);
    let mut calendar = match parse_calendar(&master_blob) {
        Ok(calendar) => calendar,
        // patch() output always reparses; guard anyway.
        Err(_) => return master_blob,
    };

    // Drop stale exception copies carried over from the stored blob.
    calendar
        .children
        .retain(|c| c.name != VEVENT || c.line("RECURRENCE-ID").is_none());

    for exception in exceptions {
        let raw = exception
            .raw_ical
            .as_deref()
            .or(master.raw_ical.as_deref());
        let blob = patch(raw, exception, now_ms);
        if let Ok(parsed) = parse_calendar(&blob) {
            let idx = select_event_index(&parsed, exception);
            let mut component = parsed.children[idx].clone();
            component.set_line(ContentLine::new("UID", master.uid.clone()));
            if let Some(instance) = exception.original_instance_time {
                component.set_line(recurrence_id_line(master, instance));
            }
            calendar.children.push(component);
        }
    }
    calendar.serialize()
}

/// Picks the VEVENT this entity corresponds to: by RECURRENCE-ID for
/// exceptions, the RECURRENCE-ID-free master otherwise, first VEVENT as a
/// last resort.
fn select_event_index(calendar: &IcsComponent, event: &Event) -> usize {
    let mut first_event = None;
    for (idx, child) in calendar.children.iter().enumerate() {
        if child.name != VEVENT {
            continue;
        }
        if first_event.is_none() {
            first_event = Some(idx);
        }
        let rid = child
            .line("RECURRENCE-ID")
            .and_then(|l| parse_instant(&l.value, l.param("TZID").as_deref()))
            .map(|i| i.ts_ms);
        match event.original_instance_time {
            Some(instance) if rid == Some(instance) => return idx,
            None if rid.is_none() => return idx,
            _ => {}
        }
    }
    first_event.unwrap_or(0)
}

fn patch_vevent(component: &mut IcsComponent, event: &Event, now_ms: i64) {
    component.set_line(ContentLine::new("SUMMARY", escape_text(&event.title)));
    set_or_remove_text(component, "LOCATION", event.location.as_deref());
    set_or_remove_text(component, "DESCRIPTION", event.description.as_deref());

    component.set_line(dtstart_line(event));
    component.set_line(dtend_line(event));
    // DTEND and DURATION are mutually exclusive; the codec always emits DTEND.
    component.remove_lines("DURATION");

    match &event.rrule {
        Some(rule) => component.set_line(ContentLine::new("RRULE", rule.clone())),
        None => component.remove_lines("RRULE"),
    }
    set_exdate_lines(component, event.exdate.as_deref());

    component.set_line(ContentLine::new("STATUS", event.status.as_str()));
    component.set_line(ContentLine::new("TRANSP", event.transp.clone()));
    component.set_line(ContentLine::new("CLASS", event.classification.clone()));

    match &event.organizer_email {
        Some(email) => {
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
        None => component.remove_lines("ORGANIZER"),
    }

    component.set_line(ContentLine::new(
        "SEQUENCE",
        patched_sequence(event).to_string(),
    ));
    component.set_line(ContentLine::new(
        "DTSTAMP",
        utc_from_ms(now_ms).format("%Y%m%dT%H%M%SZ").to_string(),
    ));

    if event.is_exception() {
        if let Some(instance) = event.original_instance_time {
            if component.line("RECURRENCE-ID").is_none() {
                component.set_line(recurrence_id_line(event, instance));
            }
        }
    }

    patch_alarms(component, event);
}

/// Overwrites the triggers of the first `reminders.len()` alarms by position,
/// preserving their ACTION and DESCRIPTION; appends display alarms for any
/// surplus reminders; preserves alarms beyond the reminder count. An empty
/// reminder list means the user cleared alarms; all VALARMs go.
fn patch_alarms(component: &mut IcsComponent, event: &Event) {
    if event.reminders.is_empty() {
        component.remove_children(VALARM);
        return;
    }

    let mut alarm_refs = component.children_named_mut(VALARM);
    let existing = alarm_refs.len();
    for (idx, alarm) in alarm_refs.iter_mut().enumerate() {
        if idx >= event.reminders.len() {
            break;
        }
        alarm.set_line(ContentLine::new("TRIGGER", event.reminders[idx].clone()));
    }
    drop(alarm_refs);

    for offset in event.reminders.iter().skip(existing) {
        let mut alarm = IcsComponent::new(VALARM);
        alarm.lines.push(ContentLine::new("ACTION", "DISPLAY"));
        alarm
            .lines
            .push(ContentLine::new("DESCRIPTION", escape_text(&event.title)));
        alarm.lines.push(ContentLine::new("TRIGGER", offset.clone()));
        component.children.push(alarm);
    }
}

fn set_or_remove_text(component: &mut IcsComponent, name: &str, value: Option<&str>) {
    match value {
        Some(v) if !v.is_empty() => component.set_line(ContentLine::new(name, escape_text(v))),
        _ => component.remove_lines(name),
    }
}

fn set_exdate_lines(component: &mut IcsComponent, exdate: Option<&str>) {
    component.remove_lines("EXDATE");
    if let Some(exdate) = exdate {
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
}

/// DTSTART for the entity: DATE form for all-day, zoned local form for named
/// timezones, UTC otherwise.
pub(crate) fn dtstart_line(event: &Event) -> ContentLine {
    timed_line("DTSTART", event.start_ts, event)
}

/// DTEND for the entity. All-day ends are stored inclusive and emitted
/// exclusive per RFC 5545 (inclusive end + 1 ms lands on the next midnight).
pub(crate) fn dtend_line(event: &Event) -> ContentLine {
    if event.is_all_day {
        let exclusive = event.end_ts + 1;
        ContentLine::with_params(
            "DTEND",
            ";VALUE=DATE",
            utc_from_ms(exclusive).format("%Y%m%d").to_string(),
        )
    } else {
        timed_line("DTEND", event.end_ts, event)
    }
}

fn timed_line(name: &str, ts_ms: i64, event: &Event) -> ContentLine {
    if event.is_all_day {
        return ContentLine::with_params(
            name,
            ";VALUE=DATE",
            utc_from_ms(ts_ms).format("%Y%m%d").to_string(),
        );
    }
    if let Some(tzid) = &event.timezone {
        if let Ok(tz) = tzid.parse::<Tz>() {
            let local = tz.from_utc_datetime(&utc_from_ms(ts_ms).naive_utc());
            return ContentLine::with_params(
                name,
                &format!(";TZID={}", tzid),
                local.format("%Y%m%dT%H%M%S").to_string(),
            );
        }
    }
    ContentLine::new(name, utc_from_ms(ts_ms).format("%Y%m%dT%H%M%SZ").to_string())
}

fn recurrence_id_line(event: &Event, instance_ms: i64) -> ContentLine {
    if event.is_all_day {
        ContentLine::with_params(
            "RECURRENCE-ID",
            ";VALUE=DATE",
            utc_from_ms(instance_ms).format("%Y%m%d").to_string(),
        )
    } else {
        ContentLine::new(
            "RECURRENCE-ID",
            utc_from_ms(instance_ms).format("%Y%m%dT%H%M%SZ").to_string(),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ics::parse::parse_events;
    use crate::time::day_code_to_utc_midnight_ms;
    use crate::types::{EventStatus, SyncStatus};

    fn base_event() -> Event {
        Event {
            id: "e1".into(),
            uid: "uid-1".into(),
            import_id: "uid-1".into(),
            calendar_id: "c1".into(),
            title: "Edited title".into(),
            location: Some("Room 2".into()),
            description: None,
            start_ts: day_code_to_utc_midnight_ms(20251225).unwrap() + 9 * 3_600_000,
            end_ts: day_code_to_utc_midnight_ms(20251225).unwrap() + 10 * 3_600_000,
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
            reminders: vec![],
            extra_properties: Default::default(),
            raw_ical: None,
            dtstamp: 0,
            caldav_url: None,
            etag: None,
            sequence: 0,
            sync_status: SyncStatus::PendingUpdate,
            last_sync_error: None,
            sync_retry_count: 0,
            parser_version: crate::ics::parse::PARSER_VERSION,
            local_modified_at: None,
            server_modified_at: None,
        }
    }

    const SERVER_BLOB: &str = "BEGIN:VCALENDAR\r\nVERSION:2.0\r\nPRODID:-//Server//EN\r\nBEGIN:VTIMEZONE\r\nTZID:Europe/Berlin\r\nBEGIN:STANDARD\r\nDTSTART:19701025T030000\r\nTZOFFSETFROM:+0200\r\nTZOFFSETTO:+0100\r\nEND:STANDARD\r\nEND:VTIMEZONE\r\nBEGIN:VEVENT\r\nUID:uid-1\r\nDTSTAMP:20251201T000000Z\r\nDTSTART:20251225T090000Z\r\nDTEND:20251225T100000Z\r\nSUMMARY:Original\r\nSEQUENCE:4\r\nX-APPLE-STRUCTURED-LOCATION;VALUE=URI:geo:52.52\\,13.40\r\nATTENDEE;CN=Jane;PARTSTAT=ACCEPTED:mailto:jane@example.com\r\nATTENDEE;CN=Ola:mailto:ola@example.com\r\nBEGIN:VALARM\r\nACTION:EMAIL\r\nDESCRIPTION:Mail me\r\nTRIGGER:-PT30M\r\nEND:VALARM\r\nBEGIN:VALARM\r\nACTION:DISPLAY\r\nTRIGGER:-PT10M\r\nEND:VALARM\r\nEND:VEVENT\r\nEND:VCALENDAR\r\n";

    #[test]
    fn test_patch_preserves_unmanaged_properties() {
        let mut event = base_event();
        event.sequence = 4;
        event.reminders = vec!["-PT15M".into(), "-PT5M".into()];
        let patched = patch(Some(SERVER_BLOB), &event, 1_700_000_000_000);

        let parsed = &parse_events(&patched).unwrap()[0];
        assert_eq!(parsed.title, "Edited title");
        assert_eq!(parsed.uid, "uid-1");
        assert_eq!(parsed.sequence, 5);
        // Attendees and X- properties survive untouched.
        assert_eq!(parsed.attendees.len(), 2);
        assert!(parsed
            .x_properties
            .contains_key("X-APPLE-STRUCTURED-LOCATION;VALUE=URI"));
        // VTIMEZONE survives.
        assert!(patched.contains("BEGIN:VTIMEZONE"));
        // Both alarm actions survive; triggers are overwritten positionally.
        assert_eq!(parsed.alarms.len(), 2);
        assert_eq!(parsed.alarms[0].action, "EMAIL");
        assert_eq!(parsed.alarms[0].trigger, "-PT15M");
        assert_eq!(parsed.alarms[0].description.as_deref(), Some("Mail me"));
        assert_eq!(parsed.alarms[1].trigger, "-PT5M");
    }

    #[test]
    fn test_patch_preserves_surplus_alarms() {
        let mut event = base_event();
        event.reminders = vec!["-PT5M".into()];
        let patched = patch(Some(SERVER_BLOB), &event, 1_700_000_000_000);
        let parsed = &parse_events(&patched).unwrap()[0];
        assert_eq!(parsed.alarms.len(), 2);
        assert_eq!(parsed.alarms[0].trigger, "-PT5M");
        // Second alarm beyond the reminder count keeps its trigger.
        assert_eq!(parsed.alarms[1].trigger, "-PT10M");
    }

    #[test]
    fn test_patch_empty_reminders_removes_all_alarms() {
        let event = base_event();
        let patched = patch(Some(SERVER_BLOB), &event, 1_700_000_000_000);
        let parsed = &parse_events(&patched).unwrap()[0];
        assert!(parsed.alarms.is_empty());
    }

    #[test]
    fn test_patch_appends_alarms_beyond_existing() {
        let mut event = base_event();
        event.reminders = vec!["-PT5M".into(), "-PT10M".into(), "-PT1H".into()];
        let patched = patch(Some(SERVER_BLOB), &event, 1_700_000_000_000);
        let parsed = &parse_events(&patched).unwrap()[0];
        assert_eq!(parsed.alarms.len(), 3);
        assert_eq!(parsed.alarms[2].action, "DISPLAY");
        assert_eq!(parsed.alarms[2].trigger, "-PT1H");
    }

    #[test]
    fn test_patch_falls_back_to_generate() {
        let event = base_event();
        let patched = patch(Some("not an ics at all"), &event, 1_700_000_000_000);
        let parsed = &parse_events(&patched).unwrap()[0];
        assert_eq!(parsed.uid, "uid-1");
        assert_eq!(parsed.title, "Edited title");

        let from_none = patch(None, &event, 1_700_000_000_000);
        assert!(parse_events(&from_none).is_ok());
    }

    #[test]
    fn test_patch_never_rewrites_uid() {
        let mut event = base_event();
        event.uid = "different-uid".into();
        let patched = patch(Some(SERVER_BLOB), &event, 1_700_000_000_000);
        let parsed = &parse_events(&patched).unwrap()[0];
        assert_eq!(parsed.uid, "uid-1");
    }

    #[test]
    fn test_serialize_with_exceptions() {
        let mut master = base_event();
        master.rrule = Some("FREQ=DAILY;COUNT=10".into());
        master.raw_ical = Some(SERVER_BLOB.to_string());

        let mut exception = base_event();
        exception.id = "e2".into();
        exception.title = "Moved".into();
        exception.status = EventStatus::Cancelled;
        exception.original_event_id = Some("e1".into());
        exception.original_instance_time = Some(master.start_ts + 86_400_000);
        exception.raw_ical = None;

        let blob = serialize_with_exceptions(&master, &[exception], 1_700_000_000_000);
        let events = parse_events(&blob).unwrap();
        assert_eq!(events.len(), 2);
        let master_out = events.iter().find(|e| e.recurrence_id.is_none()).unwrap();
        let exc_out = events.iter().find(|e| e.recurrence_id.is_some()).unwrap();
        assert_eq!(master_out.rrule.as_deref(), Some("FREQ=DAILY;COUNT=10"));
        assert_eq!(exc_out.uid, master_out.uid);
        assert_eq!(
            exc_out.recurrence_id,
            Some(master.start_ts + 86_400_000)
        );
        assert_eq!(exc_out.status, EventStatus::Cancelled);
    }

    #[test]
    fn test_all_day_patch_emits_exclusive_dtend() {
        let mut event = base_event();
        event.is_all_day = true;
        event.start_ts = day_code_to_utc_midnight_ms(20251225).unwrap();
        event.end_ts = day_code_to_utc_midnight_ms(20251225).unwrap() + crate::time::LAST_MS_OF_DAY;
        let patched = patch(Some(SERVER_BLOB), &event, 1_700_000_000_000);
        assert!(patched.contains("DTSTART;VALUE=DATE:20251225"));
        assert!(patched.contains("DTEND;VALUE=DATE:20251226"));
    }

    #[test]
    fn test_timed_patch_with_named_zone() {
        let mut event = base_event();
        event.timezone = Some("Europe/Berlin".into());
        // 09:00 UTC = 10:00 Berlin in December.
        let patched = patch(Some(SERVER_BLOB), &event, 1_700_000_000_000);
        assert!(patched.contains("DTSTART;TZID=Europe/Berlin:20251225T100000"));
    }
}
