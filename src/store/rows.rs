/*!
 * Row → Entity Mapping
 *
 * Manual mapping keeps the schema decoupled from serde field names and lets
 * enum columns fail loudly when a row carries an unknown tag.
 */

use sqlx::sqlite::SqliteRow;
use sqlx::Row;

use crate::error::{CalendarError, CalendarResult};
use crate::types::{
    Account, Calendar, Event, EventStatus, IcsSubscription, Occurrence, OperationStatus,
    OperationType, PendingOperation, Provider, ReminderStatus, ScheduledReminder, SyncLogEntry,
    SyncLogResult, SyncStatus,
};

fn bad_enum(table: &str, column: &str, value: &str) -> CalendarError {
    CalendarError::store(
        "decode",
        format!("{table}.{column} holds unknown value '{value}'"),
    )
}

pub(crate) fn account_from_row(row: &SqliteRow) -> CalendarResult<Account> {
    let provider: String = row.try_get("provider")?;
    Ok(Account {
        id: row.try_get("id")?,
        provider: Provider::parse(&provider)
            .ok_or_else(|| bad_enum("accounts", "provider", &provider))?,
        email: row.try_get("email")?,
        display_name: row.try_get("display_name")?,
        principal_url: row.try_get("principal_url")?,
        home_set_url: row.try_get("home_set_url")?,
        is_enabled: row.try_get("is_enabled")?,
        created_at: row.try_get("created_at")?,
        last_sync_at: row.try_get("last_sync_at")?,
        last_successful_sync_at: row.try_get("last_successful_sync_at")?,
        consecutive_sync_failures: row.try_get("consecutive_sync_failures")?,
    })
}

pub(crate) fn calendar_from_row(row: &SqliteRow) -> CalendarResult<Calendar> {
    Ok(Calendar {
        id: row.try_get("id")?,
        account_id: row.try_get("account_id")?,
        caldav_url: row.try_get("caldav_url")?,
        display_name: row.try_get("display_name")?,
        color: row.try_get("color")?,
        ctag: row.try_get("ctag")?,
        sync_token: row.try_get("sync_token")?,
        is_visible: row.try_get("is_visible")?,
        is_default: row.try_get("is_default")?,
        is_read_only: row.try_get("is_read_only")?,
        sort_order: row.try_get("sort_order")?,
    })
}

pub(crate) fn event_from_row(row: &SqliteRow) -> CalendarResult<Event> {
    let status: String = row.try_get("status")?;
    let sync_status: String = row.try_get("sync_status")?;
    let reminders: String = row.try_get("reminders")?;
    let extra: String = row.try_get("extra_properties")?;
    Ok(Event {
        id: row.try_get("id")?,
        uid: row.try_get("uid")?,
        import_id: row.try_get("import_id")?,
        calendar_id: row.try_get("calendar_id")?,
        title: row.try_get("title")?,
        location: row.try_get("location")?,
        description: row.try_get("description")?,
        start_ts: row.try_get("start_ts")?,
        end_ts: row.try_get("end_ts")?,
        timezone: row.try_get("timezone")?,
        is_all_day: row.try_get("is_all_day")?,
        status: EventStatus::parse(&status).ok_or_else(|| bad_enum("events", "status", &status))?,
        transp: row.try_get("transp")?,
        classification: row.try_get("classification")?,
        organizer_email: row.try_get("organizer_email")?,
        organizer_name: row.try_get("organizer_name")?,
        rrule: row.try_get("rrule")?,
        rdate: row.try_get("rdate")?,
        exdate: row.try_get("exdate")?,
        duration: row.try_get("duration")?,
        original_event_id: row.try_get("original_event_id")?,
        original_instance_time: row.try_get("original_instance_time")?,
        reminders: serde_json::from_str(&reminders)
            .map_err(|e| CalendarError::store("decode", format!("events.reminders: {e}")))?,
        extra_properties: serde_json::from_str(&extra)
            .map_err(|e| CalendarError::store("decode", format!("events.extra_properties: {e}")))?,
        raw_ical: row.try_get("raw_ical")?,
        dtstamp: row.try_get("dtstamp")?,
        caldav_url: row.try_get("caldav_url")?,
        etag: row.try_get("etag")?,
        sequence: row.try_get("sequence")?,
        sync_status: SyncStatus::parse(&sync_status)
            .ok_or_else(|| bad_enum("events", "sync_status", &sync_status))?,
        last_sync_error: row.try_get("last_sync_error")?,
        sync_retry_count: row.try_get("sync_retry_count")?,
        parser_version: row.try_get("parser_version")?,
        local_modified_at: row.try_get("local_modified_at")?,
        server_modified_at: row.try_get("server_modified_at")?,
    })
}

pub(crate) fn occurrence_from_row(row: &SqliteRow) -> CalendarResult<Occurrence> {
    Ok(Occurrence {
        id: row.try_get("id")?,
        event_id: row.try_get("event_id")?,
        calendar_id: row.try_get("calendar_id")?,
        start_ts: row.try_get("start_ts")?,
        end_ts: row.try_get("end_ts")?,
        start_day: row.try_get::<i64, _>("start_day")? as i32,
        end_day: row.try_get::<i64, _>("end_day")? as i32,
        is_cancelled: row.try_get("is_cancelled")?,
        exception_event_id: row.try_get("exception_event_id")?,
    })
}

pub(crate) fn operation_from_row(row: &SqliteRow) -> CalendarResult<PendingOperation> {
    let operation: String = row.try_get("operation")?;
    let status: String = row.try_get("status")?;
    Ok(PendingOperation {
        id: row.try_get("id")?,
        event_id: row.try_get("event_id")?,
        operation: OperationType::parse(&operation)
            .ok_or_else(|| bad_enum("pending_operations", "operation", &operation))?,
        status: OperationStatus::parse(&status)
            .ok_or_else(|| bad_enum("pending_operations", "status", &status))?,
        retry_count: row.try_get("retry_count")?,
        next_retry_at: row.try_get("next_retry_at")?,
        last_error: row.try_get("last_error")?,
        failed_at: row.try_get("failed_at")?,
        lifetime_reset_at: row.try_get("lifetime_reset_at")?,
        dest_calendar_id: row.try_get("dest_calendar_id")?,
        created_at: row.try_get("created_at")?,
    })
}

pub(crate) fn reminder_from_row(row: &SqliteRow) -> CalendarResult<ScheduledReminder> {
    let status: String = row.try_get("status")?;
    Ok(ScheduledReminder {
        id: row.try_get("id")?,
        event_id: row.try_get("event_id")?,
        occurrence_time: row.try_get("occurrence_time")?,
        trigger_time: row.try_get("trigger_time")?,
        reminder_offset: row.try_get("reminder_offset")?,
        status: ReminderStatus::parse(&status)
            .ok_or_else(|| bad_enum("scheduled_reminders", "status", &status))?,
        snooze_count: row.try_get("snooze_count")?,
        event_title: row.try_get("event_title")?,
        event_location: row.try_get("event_location")?,
        is_all_day: row.try_get("is_all_day")?,
        calendar_color: row.try_get("calendar_color")?,
    })
}

pub(crate) fn subscription_from_row(row: &SqliteRow) -> CalendarResult<IcsSubscription> {
    Ok(IcsSubscription {
        id: row.try_get("id")?,
        url: row.try_get("url")?,
        name: row.try_get("name")?,
        color: row.try_get("color")?,
        calendar_id: row.try_get("calendar_id")?,
        last_sync: row.try_get("last_sync")?,
        sync_interval_hours: row.try_get("sync_interval_hours")?,
        enabled: row.try_get("enabled")?,
        etag: row.try_get("etag")?,
        last_modified: row.try_get("last_modified")?,
        username: row.try_get("username")?,
        last_error: row.try_get("last_error")?,
        created_at: row.try_get("created_at")?,
    })
}

pub(crate) fn sync_log_from_row(row: &SqliteRow) -> CalendarResult<SyncLogEntry> {
    let result: String = row.try_get("result")?;
    Ok(SyncLogEntry {
        id: row.try_get("id")?,
        timestamp: row.try_get("timestamp")?,
        calendar_id: row.try_get("calendar_id")?,
        event_uid: row.try_get("event_uid")?,
        result: SyncLogResult::parse(&result)
            .ok_or_else(|| bad_enum("sync_log", "result", &result))?,
        message: row.try_get("message")?,
    })
}
