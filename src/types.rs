/*!
 * Calendar Core Data Model
 *
 * Persistent entities and their enums. All timestamps are epoch milliseconds
 * in UTC; day codes are YYYYMMDD integers. Ownership is a tree: Account →
 * Calendar → Event → Occurrence/PendingOperation/ScheduledReminder. The
 * two recurrence back-references (`original_event_id` on Event,
 * `exception_event_id` on Occurrence) are weak id lookups, never owning edges.
 */

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// Account provider variants. Behavioural differences live in
/// `caldav::quirks`, keyed off this tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Provider {
    ICloud,
    GenericCalDav,
    Ics,
    Local,
}

impl Provider {
    pub fn as_str(&self) -> &'static str {
        match self {
            Provider::ICloud => "ICLOUD",
            Provider::GenericCalDav => "GENERIC_CALDAV",
            Provider::Ics => "ICS",
            Provider::Local => "LOCAL",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "ICLOUD" => Some(Provider::ICloud),
            "GENERIC_CALDAV" => Some(Provider::GenericCalDav),
            "ICS" => Some(Provider::Ics),
            "LOCAL" => Some(Provider::Local),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Account {
    pub id: String,
    pub provider: Provider,
    pub email: String,
    pub display_name: String,
    pub principal_url: Option<String>,
    pub home_set_url: Option<String>,
    pub is_enabled: bool,
    pub created_at: i64,
    pub last_sync_at: Option<i64>,
    pub last_successful_sync_at: Option<i64>,
    pub consecutive_sync_failures: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Calendar {
    pub id: String,
    pub account_id: String,
    /// Normalized collection URL; unique across the store.
    pub caldav_url: String,
    pub display_name: String,
    /// ARGB, e.g. 0xFF2196F3.
    pub color: i64,
    pub ctag: Option<String>,
    pub sync_token: Option<String>,
    pub is_visible: bool,
    pub is_default: bool,
    pub is_read_only: bool,
    pub sort_order: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EventStatus {
    Confirmed,
    Tentative,
    Cancelled,
}

impl EventStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventStatus::Confirmed => "CONFIRMED",
            EventStatus::Tentative => "TENTATIVE",
            EventStatus::Cancelled => "CANCELLED",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "CONFIRMED" => Some(EventStatus::Confirmed),
            "TENTATIVE" => Some(EventStatus::Tentative),
            "CANCELLED" => Some(EventStatus::Cancelled),
            _ => None,
        }
    }
}

/// Local replication state of an event row relative to its server resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SyncStatus {
    Synced,
    PendingCreate,
    PendingUpdate,
    PendingDelete,
}

impl SyncStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncStatus::Synced => "SYNCED",
            SyncStatus::PendingCreate => "PENDING_CREATE",
            SyncStatus::PendingUpdate => "PENDING_UPDATE",
            SyncStatus::PendingDelete => "PENDING_DELETE",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "SYNCED" => Some(SyncStatus::Synced),
            "PENDING_CREATE" => Some(SyncStatus::PendingCreate),
            "PENDING_UPDATE" => Some(SyncStatus::PendingUpdate),
            "PENDING_DELETE" => Some(SyncStatus::PendingDelete),
            _ => None,
        }
    }
}

/// A VEVENT row. Masters and standalone events have
/// `original_event_id = None`; a RECURRENCE-ID exception points at its master
/// and shares the master's `uid`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub id: String,
    pub uid: String,
    /// Deprecated lookup key kept for rows written before
    /// (uid, original_instance_time) became canonical.
    pub import_id: String,
    pub calendar_id: String,
    pub title: String,
    pub location: Option<String>,
    pub description: Option<String>,
    pub start_ts: i64,
    pub end_ts: i64,
    pub timezone: Option<String>,
    pub is_all_day: bool,
    pub status: EventStatus,
    /// TRANSP property value (OPAQUE/TRANSPARENT).
    pub transp: String,
    /// CLASS property value (PUBLIC/PRIVATE/CONFIDENTIAL).
    pub classification: String,
    pub organizer_email: Option<String>,
    pub organizer_name: Option<String>,
    /// RRULE value text, without the property name.
    pub rrule: Option<String>,
    /// RDATE value text; multiple properties joined with '\n'.
    pub rdate: Option<String>,
    /// EXDATE value text; multiple properties joined with '\n'.
    pub exdate: Option<String>,
    /// DURATION value text when the source used DURATION instead of DTEND.
    pub duration: Option<String>,
    pub original_event_id: Option<String>,
    pub original_instance_time: Option<i64>,
    /// ISO-8601 negative durations, sorted nearest-to-event first.
    pub reminders: Vec<String>,
    /// X-* properties, keyed by property name with parameters included.
    pub extra_properties: HashMap<String, String>,
    /// The server-authored VEVENT blob, stored verbatim for patching.
    pub raw_ical: Option<String>,
    pub dtstamp: i64,
    pub caldav_url: Option<String>,
    pub etag: Option<String>,
    pub sequence: i64,
    pub sync_status: SyncStatus,
    pub last_sync_error: Option<String>,
    pub sync_retry_count: i64,
    /// Codec version that last wrote this row; a mismatch forces a re-parse
    /// of `raw_ical` even when the etag is unchanged.
    pub parser_version: i64,
    pub local_modified_at: Option<i64>,
    pub server_modified_at: Option<i64>,
}

impl Event {
    pub fn is_exception(&self) -> bool {
        self.original_event_id.is_some()
    }

    pub fn is_recurring(&self) -> bool {
        self.rrule.is_some() || self.rdate.is_some()
    }

    pub fn duration_ms(&self) -> i64 {
        self.end_ts - self.start_ts
    }
}

/// One materialized instance of a (possibly-recurring) event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Occurrence {
    pub id: String,
    pub event_id: String,
    pub calendar_id: String,
    pub start_ts: i64,
    pub end_ts: i64,
    pub start_day: i32,
    pub end_day: i32,
    pub is_cancelled: bool,
    /// Weak reference to the RECURRENCE-ID exception overriding this
    /// instance; cleared (never cascaded) when that event goes away.
    pub exception_event_id: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OperationType {
    Create,
    Update,
    Delete,
    Move,
}

impl OperationType {
    pub fn as_str(&self) -> &'static str {
        match self {
            OperationType::Create => "CREATE",
            OperationType::Update => "UPDATE",
            OperationType::Delete => "DELETE",
            OperationType::Move => "MOVE",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "CREATE" => Some(OperationType::Create),
            "UPDATE" => Some(OperationType::Update),
            "DELETE" => Some(OperationType::Delete),
            "MOVE" => Some(OperationType::Move),
            _ => None,
        }
    }

    /// The event sync statuses consistent with an op of this type.
    pub fn matching_sync_statuses(&self) -> &'static [SyncStatus] {
        match self {
            OperationType::Create => &[SyncStatus::PendingCreate],
            OperationType::Update => &[SyncStatus::PendingUpdate],
            OperationType::Delete => &[SyncStatus::PendingDelete],
            // A MOVE leaves content untouched; the row may also carry a
            // pending content edit queued behind it.
            OperationType::Move => &[
                SyncStatus::Synced,
                SyncStatus::PendingUpdate,
                SyncStatus::PendingCreate,
            ],
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OperationStatus {
    Pending,
    InProgress,
    Failed,
}

impl OperationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            OperationStatus::Pending => "PENDING",
            OperationStatus::InProgress => "IN_PROGRESS",
            OperationStatus::Failed => "FAILED",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "PENDING" => Some(OperationStatus::Pending),
            "IN_PROGRESS" => Some(OperationStatus::InProgress),
            "FAILED" => Some(OperationStatus::Failed),
            _ => None,
        }
    }
}

/// A queued local mutation awaiting push to the server.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PendingOperation {
    pub id: String,
    pub event_id: String,
    pub operation: OperationType,
    pub status: OperationStatus,
    pub retry_count: i64,
    pub next_retry_at: i64,
    pub last_error: Option<String>,
    pub failed_at: Option<i64>,
    /// Start of the 30-day lifetime window; reset when the user touches the
    /// event again.
    pub lifetime_reset_at: i64,
    /// Target calendar for MOVE operations.
    pub dest_calendar_id: Option<String>,
    pub created_at: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReminderStatus {
    Pending,
    Fired,
    Snoozed,
    Dismissed,
}

impl ReminderStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReminderStatus::Pending => "PENDING",
            ReminderStatus::Fired => "FIRED",
            ReminderStatus::Snoozed => "SNOOZED",
            ReminderStatus::Dismissed => "DISMISSED",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "PENDING" => Some(ReminderStatus::Pending),
            "FIRED" => Some(ReminderStatus::Fired),
            "SNOOZED" => Some(ReminderStatus::Snoozed),
            "DISMISSED" => Some(ReminderStatus::Dismissed),
            _ => None,
        }
    }
}

/// A reminder row derived from an occurrence and one reminder offset.
/// Title/location/color are denormalized so the notification path never has
/// to join back into the event tables.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduledReminder {
    pub id: String,
    pub event_id: String,
    pub occurrence_time: i64,
    pub trigger_time: i64,
    /// ISO-8601 negative duration, e.g. "-PT15M".
    pub reminder_offset: String,
    pub status: ReminderStatus,
    pub snooze_count: i64,
    pub event_title: String,
    pub event_location: Option<String>,
    pub is_all_day: bool,
    pub calendar_color: i64,
}

/// A read-only ICS feed bound to its own calendar.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IcsSubscription {
    pub id: String,
    pub url: String,
    pub name: String,
    pub color: i64,
    pub calendar_id: String,
    pub last_sync: i64,
    pub sync_interval_hours: i64,
    pub enabled: bool,
    pub etag: Option<String>,
    pub last_modified: Option<String>,
    pub username: Option<String>,
    pub last_error: Option<String>,
    pub created_at: i64,
}

impl IcsSubscription {
    pub fn is_due_for_sync(&self, now_ms: i64) -> bool {
        self.enabled && now_ms - self.last_sync >= self.sync_interval_hours * 3_600_000
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SyncLogResult {
    Success,
    Error401,
    Error403,
    Error404,
    Error412,
    Error5xx,
    ErrorNetwork,
    ErrorOther,
}

impl SyncLogResult {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncLogResult::Success => "SUCCESS",
            SyncLogResult::Error401 => "ERROR_401",
            SyncLogResult::Error403 => "ERROR_403",
            SyncLogResult::Error404 => "ERROR_404",
            SyncLogResult::Error412 => "ERROR_412",
            SyncLogResult::Error5xx => "ERROR_5XX",
            SyncLogResult::ErrorNetwork => "ERROR_NETWORK",
            SyncLogResult::ErrorOther => "ERROR_OTHER",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "SUCCESS" => Some(SyncLogResult::Success),
            "ERROR_401" => Some(SyncLogResult::Error401),
            "ERROR_403" => Some(SyncLogResult::Error403),
            "ERROR_404" => Some(SyncLogResult::Error404),
            "ERROR_412" => Some(SyncLogResult::Error412),
            "ERROR_5XX" => Some(SyncLogResult::Error5xx),
            "ERROR_NETWORK" => Some(SyncLogResult::ErrorNetwork),
            "ERROR_OTHER" => Some(SyncLogResult::ErrorOther),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncLogEntry {
    pub id: String,
    pub timestamp: i64,
    pub calendar_id: Option<String>,
    pub event_uid: Option<String>,
    pub result: SyncLogResult,
    pub message: Option<String>,
}

/// Scope selector for edits/deletes touching recurring series.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EditScope {
    This,
    ThisAndFollowing,
    All,
}

/// User-supplied fields for creating or editing an event. Everything the
/// codec does not manage (X-*, attendees, extra alarms) survives through the
/// stored `raw_ical` and the patch path.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EventDraft {
    pub title: String,
    pub location: Option<String>,
    pub description: Option<String>,
    pub start_ts: i64,
    pub end_ts: i64,
    pub timezone: Option<String>,
    pub is_all_day: bool,
    pub rrule: Option<String>,
    pub reminders: Vec<String>,
}

/// Per-direction counts of a completed `sync_calendar` run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncCounts {
    pub added: u32,
    pub updated: u32,
    pub deleted: u32,
}

impl SyncCounts {
    pub fn total(&self) -> u32 {
        self.added + self.updated + self.deleted
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SyncOutcome {
    pub calendar_id: String,
    pub pulled: SyncCounts,
    pub pushed: SyncCounts,
    pub conflicts_resolved: u32,
    pub duration_ms: i64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_enum_round_trips() {
        for p in [
            Provider::ICloud,
            Provider::GenericCalDav,
            Provider::Ics,
            Provider::Local,
        ] {
            assert_eq!(Provider::parse(p.as_str()), Some(p));
        }
        for s in [
            SyncStatus::Synced,
            SyncStatus::PendingCreate,
            SyncStatus::PendingUpdate,
            SyncStatus::PendingDelete,
        ] {
            assert_eq!(SyncStatus::parse(s.as_str()), Some(s));
        }
        assert_eq!(SyncLogResult::parse("ERROR_5XX"), Some(SyncLogResult::Error5xx));
        assert_eq!(Provider::parse("GOOGLE"), None);
    }

    #[test]
    fn test_operation_status_correspondence() {
        assert!(OperationType::Create
            .matching_sync_statuses()
            .contains(&SyncStatus::PendingCreate));
        assert!(!OperationType::Delete
            .matching_sync_statuses()
            .contains(&SyncStatus::Synced));
        assert!(OperationType::Move
            .matching_sync_statuses()
            .contains(&SyncStatus::Synced));
    }

    #[test]
    fn test_subscription_due() {
        let sub = IcsSubscription {
            id: "s1".into(),
            url: "https://example.com/feed.ics".into(),
            name: "Holidays".into(),
            color: 0xFF00_7AFF,
            calendar_id: "c1".into(),
            last_sync: 1_000_000,
            sync_interval_hours: 6,
            enabled: true,
            etag: None,
            last_modified: None,
            username: None,
            last_error: None,
            created_at: 0,
        };
        assert!(!sub.is_due_for_sync(1_000_000 + 5 * 3_600_000));
        assert!(sub.is_due_for_sync(1_000_000 + 6 * 3_600_000));
        let disabled = IcsSubscription {
            enabled: false,
            ..sub
        };
        assert!(!disabled.is_due_for_sync(i64::MAX));
    }
}
