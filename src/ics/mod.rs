/*!
 * iCalendar Codec
 *
 * The round-trip contract between RFC 5545 wire bodies and Event rows:
 * typed extraction for the pull path, in-place patching for pushes of
 * server-authored events, and fresh generation for locally created ones.
 */

pub mod component;
pub mod generate;
pub mod line;
pub mod parse;
pub mod patch;
pub mod vtimezone;

pub use generate::generate_fresh;
pub use parse::{parse_events, ParsedAlarm, ParsedEvent, PARSER_VERSION};
pub use patch::{patch, patched_sequence, serialize_with_exceptions};

use crate::types::Event;

/// A rendered PUT body plus the sequence number to persist once the server
/// accepts it. Patching bumps SEQUENCE by one; fresh generation keeps the
/// entity's current value.
#[derive(Debug, Clone)]
pub struct PutBody {
    pub blob: String,
    pub sequence: i64,
}

/// Renders the upload body for an event. Recurring masters are serialized
/// together with their exception rows so the server sees the whole series in
/// one resource.
pub fn put_body(event: &Event, exceptions: &[Event], now_ms: i64) -> PutBody {
    let patched = event.raw_ical.is_some();
    let blob = if event.is_recurring() && !exceptions.is_empty() {
        serialize_with_exceptions(event, exceptions, now_ms)
    } else {
        patch(event.raw_ical.as_deref(), event, now_ms)
    };
    PutBody {
        blob,
        sequence: if patched {
            patched_sequence(event)
        } else {
            event.sequence
        },
    }
}
