/*!
 * Event queries.
 *
 * Masters are addressed by (uid, calendar_id), exceptions by
 * (uid, calendar_id, original_instance_time). The deprecated import_id
 * lookup survives only as a fallback for rows written by old builds.
 */

use serde::{Deserialize, Serialize};
use sqlx::{Executor, Sqlite};

use crate::error::CalendarResult;
use crate::store::rows::{event_from_row, occurrence_from_row};
use crate::store::{StoreTx, Table};
use crate::types::{Event, Occurrence, SyncStatus};

/// Slim projection used by the pull reconciliation pass.
#[derive(Debug, Clone)]
pub struct EventSyncRow {
    pub id: String,
    pub uid: String,
    pub caldav_url: Option<String>,
    pub etag: Option<String>,
    pub sync_status: SyncStatus,
    pub is_exception: bool,
}

/// Query result pairing an occurrence with its effective event (the
/// exception row when one overrides the instance).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventWithOccurrence {
    pub event: Event,
    pub occurrence: Occurrence,
}

/// Inserts or fully replaces the row with this id.
pub async fn upsert(tx: &mut StoreTx, event: &Event) -> CalendarResult<()> {
    let reminders = serde_json::to_string(&event.reminders)
        .map_err(|e| crate::error::CalendarError::store("encode", e.to_string()))?;
    let extra = serde_json::to_string(&event.extra_properties)
        .map_err(|e| crate::error::CalendarError::store("encode", e.to_string()))?;
    sqlx::query(
        r#"
        INSERT INTO events (
            id, uid, import_id, calendar_id, title, location, description,
            start_ts, end_ts, timezone, is_all_day, status, transp,
            classification, organizer_email, organizer_name, rrule, rdate,
            exdate, duration, original_event_id, original_instance_time,
            reminders, extra_properties, raw_ical, dtstamp, caldav_url, etag,
            sequence, sync_status, last_sync_error, sync_retry_count,
            parser_version, local_modified_at, server_modified_at
        ) VALUES (
            ?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15,
            ?16, ?17, ?18, ?19, ?20, ?21, ?22, ?23, ?24, ?25, ?26, ?27, ?28,
            ?29, ?30, ?31, ?32, ?33, ?34, ?35
        )
        ON CONFLICT(id) DO UPDATE SET
            uid = excluded.uid,
            import_id = excluded.import_id,
            calendar_id = excluded.calendar_id,
            title = excluded.title,
            location = excluded.location,
            description = excluded.description,
            start_ts = excluded.start_ts,
            end_ts = excluded.end_ts,
            timezone = excluded.timezone,
            is_all_day = excluded.is_all_day,
            status = excluded.status,
            transp = excluded.transp,
            classification = excluded.classification,
            organizer_email = excluded.organizer_email,
            organizer_name = excluded.organizer_name,
            rrule = excluded.rrule,
            rdate = excluded.rdate,
            exdate = excluded.exdate,
            duration = excluded.duration,
            original_event_id = excluded.original_event_id,
            original_instance_time = excluded.original_instance_time,
            reminders = excluded.reminders,
            extra_properties = excluded.extra_properties,
            raw_ical = excluded.raw_ical,
            dtstamp = excluded.dtstamp,
            caldav_url = excluded.caldav_url,
            etag = excluded.etag,
            sequence = excluded.sequence,
            sync_status = excluded.sync_status,
            last_sync_error = excluded.last_sync_error,
            sync_retry_count = excluded.sync_retry_count,
            parser_version = excluded.parser_version,
            local_modified_at = excluded.local_modified_at,
            server_modified_at = excluded.server_modified_at
    "#,
    )
    .bind(&event.id)
    .bind(&event.uid)
    .bind(&event.import_id)
    .bind(&event.calendar_id)
    .bind(&event.title)
    .bind(&event.location)
    .bind(&event.description)
    .bind(event.start_ts)
    .bind(event.end_ts)
    .bind(&event.timezone)
    .bind(event.is_all_day)
    .bind(event.status.as_str())
    .bind(&event.transp)
    .bind(&event.classification)
    .bind(&event.organizer_email)
    .bind(&event.organizer_name)
    .bind(&event.rrule)
    .bind(&event.rdate)
    .bind(&event.exdate)
    .bind(&event.duration)
    .bind(&event.original_event_id)
    .bind(event.original_instance_time)
    .bind(reminders)
    .bind(extra)
    .bind(&event.raw_ical)
    .bind(event.dtstamp)
    .bind(&event.caldav_url)
    .bind(&event.etag)
    .bind(event.sequence)
    .bind(event.sync_status.as_str())
    .bind(&event.last_sync_error)
    .bind(event.sync_retry_count)
    .bind(event.parser_version)
    .bind(event.local_modified_at)
    .bind(event.server_modified_at)
    .execute(tx.conn())
    .await?;
    tx.touch(Table::Events);
    Ok(())
}

pub async fn fetch_by_id<'e, E>(exec: E, id: &str) -> CalendarResult<Option<Event>>
where
    E: Executor<'e, Database = Sqlite>,
{
    let row = sqlx::query("SELECT * FROM events WHERE id = ?1")
        .bind(id)
        .fetch_optional(exec)
        .await?;
    row.as_ref().map(event_from_row).transpose()
}

/// Master (or standalone) row for a uid within one calendar.
pub async fn find_master<'e, E>(
    exec: E,
    calendar_id: &str,
    uid: &str,
) -> CalendarResult<Option<Event>>
where
    E: Executor<'e, Database = Sqlite>,
{
    let row = sqlx::query(
        "SELECT * FROM events WHERE calendar_id = ?1 AND uid = ?2 AND original_event_id IS NULL",
    )
    .bind(calendar_id)
    .bind(uid)
    .fetch_optional(exec)
    .await?;
    row.as_ref().map(event_from_row).transpose()
}

/// Exception row addressed the canonical way.
pub async fn find_exception<'e, E>(
    exec: E,
    calendar_id: &str,
    uid: &str,
    original_instance_time: i64,
) -> CalendarResult<Option<Event>>
where
    E: Executor<'e, Database = Sqlite>,
{
    let row = sqlx::query(
        r#"
        SELECT * FROM events
        WHERE calendar_id = ?1 AND uid = ?2
          AND original_event_id IS NOT NULL AND original_instance_time = ?3
    "#,
    )
    .bind(calendar_id)
    .bind(uid)
    .bind(original_instance_time)
    .fetch_optional(exec)
    .await?;
    row.as_ref().map(event_from_row).transpose()
}

/// Deprecated import_id fallback for master/standalone rows; consulted only
/// when the canonical (uid, calendar) lookup misses. The master predicate
/// keeps it from ever resolving to an exception row that shares the uid.
pub async fn find_master_by_import_id<'e, E>(
    exec: E,
    calendar_id: &str,
    import_id: &str,
) -> CalendarResult<Option<Event>>
where
    E: Executor<'e, Database = Sqlite>,
{
    if import_id.is_empty() {
        return Ok(None);
    }
    let row = sqlx::query(
        r#"
        SELECT * FROM events
        WHERE calendar_id = ?1 AND import_id = ?2 AND original_event_id IS NULL
    "#,
    )
    .bind(calendar_id)
    .bind(import_id)
    .fetch_optional(exec)
    .await?;
    row.as_ref().map(event_from_row).transpose()
}

/// Deprecated import_id fallback for exception rows. Both the exception
/// predicate and the instance time are required: masters share the uid (and
/// therefore the import_id), so an unscoped match would hand back the master
/// and let an incoming override overwrite it.
pub async fn find_exception_by_import_id<'e, E>(
    exec: E,
    calendar_id: &str,
    import_id: &str,
    original_instance_time: i64,
) -> CalendarResult<Option<Event>>
where
    E: Executor<'e, Database = Sqlite>,
{
    if import_id.is_empty() {
        return Ok(None);
    }
    let row = sqlx::query(
        r#"
        SELECT * FROM events
        WHERE calendar_id = ?1 AND import_id = ?2
          AND original_event_id IS NOT NULL AND original_instance_time = ?3
    "#,
    )
    .bind(calendar_id)
    .bind(import_id)
    .bind(original_instance_time)
    .fetch_optional(exec)
    .await?;
    row.as_ref().map(event_from_row).transpose()
}

pub async fn list_exceptions_of<'e, E>(exec: E, master_id: &str) -> CalendarResult<Vec<Event>>
where
    E: Executor<'e, Database = Sqlite>,
{
    let rows = sqlx::query(
        "SELECT * FROM events WHERE original_event_id = ?1 ORDER BY original_instance_time",
    )
    .bind(master_id)
    .fetch_all(exec)
    .await?;
    rows.iter().map(event_from_row).collect()
}

pub async fn list_for_calendar<'e, E>(exec: E, calendar_id: &str) -> CalendarResult<Vec<Event>>
where
    E: Executor<'e, Database = Sqlite>,
{
    let rows = sqlx::query("SELECT * FROM events WHERE calendar_id = ?1 ORDER BY start_ts")
        .bind(calendar_id)
        .fetch_all(exec)
        .await?;
    rows.iter().map(event_from_row).collect()
}

/// Slim rows for ETag-diff reconciliation.
pub async fn sync_rows_for_calendar<'e, E>(
    exec: E,
    calendar_id: &str,
) -> CalendarResult<Vec<EventSyncRow>>
where
    E: Executor<'e, Database = Sqlite>,
{
    use sqlx::Row;
    let rows = sqlx::query(
        r#"
        SELECT id, uid, caldav_url, etag, sync_status, original_event_id
        FROM events WHERE calendar_id = ?1
    "#,
    )
    .bind(calendar_id)
    .fetch_all(exec)
    .await?;
    rows.iter()
        .map(|row| {
            let sync_status: String = row.try_get("sync_status")?;
            Ok(EventSyncRow {
                id: row.try_get("id")?,
                uid: row.try_get("uid")?,
                caldav_url: row.try_get("caldav_url")?,
                etag: row.try_get("etag")?,
                sync_status: SyncStatus::parse(&sync_status).unwrap_or(SyncStatus::Synced),
                is_exception: row.try_get::<Option<String>, _>("original_event_id")?.is_some(),
            })
        })
        .collect()
}

/// Masters with queued content changes; reconciliation must never treat
/// these as server-deletable.
pub async fn list_pending_in_calendar<'e, E>(
    exec: E,
    calendar_id: &str,
) -> CalendarResult<Vec<Event>>
where
    E: Executor<'e, Database = Sqlite>,
{
    let rows = sqlx::query(
        "SELECT * FROM events WHERE calendar_id = ?1 AND sync_status != 'SYNCED'",
    )
    .bind(calendar_id)
    .fetch_all(exec)
    .await?;
    rows.iter().map(event_from_row).collect()
}

/// Occurrence-window query joining each occurrence to its effective event.
/// Cancelled instances and cancelled effective events are filtered out.
pub async fn fetch_in_range<'e, E>(
    exec: E,
    start_ts: i64,
    end_ts: i64,
    calendar_ids: Option<&[String]>,
) -> CalendarResult<Vec<EventWithOccurrence>>
where
    E: Executor<'e, Database = Sqlite>,
{
    let mut sql = String::from(
        r#"
        SELECT o.id AS o_id, o.event_id AS o_event_id, o.calendar_id AS o_calendar_id,
               o.start_ts AS o_start_ts, o.end_ts AS o_end_ts,
               o.start_day AS o_start_day, o.end_day AS o_end_day,
               o.is_cancelled AS o_is_cancelled, o.exception_event_id AS o_exception_event_id,
               e.*
        FROM occurrences o
        JOIN events e ON e.id = COALESCE(o.exception_event_id, o.event_id)
        WHERE o.is_cancelled = 0
          AND e.status != 'CANCELLED'
          AND e.sync_status != 'PENDING_DELETE'
          AND o.start_ts < ?2 AND o.end_ts >= ?1
    "#,
    );
    if let Some(ids) = calendar_ids {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let placeholders: Vec<String> = (0..ids.len()).map(|i| format!("?{}", i + 3)).collect();
        sql.push_str(&format!(
            " AND o.calendar_id IN ({})",
            placeholders.join(", ")
        ));
    }
    sql.push_str(" ORDER BY o.start_ts");

    let mut query = sqlx::query(&sql).bind(start_ts).bind(end_ts);
    if let Some(ids) = calendar_ids {
        for id in ids {
            query = query.bind(id);
        }
    }
    let rows = query.fetch_all(exec).await?;

    rows.iter()
        .map(|row| {
            use sqlx::Row;
            let occurrence = Occurrence {
                id: row.try_get("o_id")?,
                event_id: row.try_get("o_event_id")?,
                calendar_id: row.try_get("o_calendar_id")?,
                start_ts: row.try_get("o_start_ts")?,
                end_ts: row.try_get("o_end_ts")?,
                start_day: row.try_get::<i64, _>("o_start_day")? as i32,
                end_day: row.try_get::<i64, _>("o_end_day")? as i32,
                is_cancelled: row.try_get("o_is_cancelled")?,
                exception_event_id: row.try_get("o_exception_event_id")?,
            };
            Ok(EventWithOccurrence {
                event: event_from_row(row)?,
                occurrence,
            })
        })
        .collect()
}

pub async fn set_sync_state(
    tx: &mut StoreTx,
    id: &str,
    sync_status: SyncStatus,
    caldav_url: Option<&str>,
    etag: Option<&str>,
    sequence: i64,
) -> CalendarResult<()> {
    sqlx::query(
        r#"
        UPDATE events
        SET sync_status = ?2, caldav_url = ?3, etag = ?4, sequence = ?5,
            last_sync_error = NULL, sync_retry_count = 0
        WHERE id = ?1
    "#,
    )
    .bind(id)
    .bind(sync_status.as_str())
    .bind(caldav_url)
    .bind(etag)
    .bind(sequence)
    .execute(tx.conn())
    .await?;
    tx.touch(Table::Events);
    Ok(())
}

pub async fn record_sync_error(
    tx: &mut StoreTx,
    id: &str,
    message: &str,
) -> CalendarResult<()> {
    sqlx::query(
        r#"
        UPDATE events
        SET last_sync_error = ?2, sync_retry_count = sync_retry_count + 1
        WHERE id = ?1
    "#,
    )
    .bind(id)
    .bind(message)
    .execute(tx.conn())
    .await?;
    tx.touch(Table::Events);
    Ok(())
}

/// Moves the master and all of its exception rows to the destination
/// calendar (same account ⇒ same UID namespace).
pub async fn move_to_calendar(
    tx: &mut StoreTx,
    event_id: &str,
    dest_calendar_id: &str,
    new_caldav_url: Option<&str>,
    new_etag: Option<&str>,
) -> CalendarResult<()> {
    sqlx::query(
        r#"
        UPDATE events SET calendar_id = ?2, caldav_url = ?3, etag = ?4
        WHERE id = ?1
    "#,
    )
    .bind(event_id)
    .bind(dest_calendar_id)
    .bind(new_caldav_url)
    .bind(new_etag)
    .execute(tx.conn())
    .await?;
    sqlx::query("UPDATE events SET calendar_id = ?2 WHERE original_event_id = ?1")
        .bind(event_id)
        .bind(dest_calendar_id)
        .execute(tx.conn())
        .await?;
    sqlx::query("UPDATE occurrences SET calendar_id = ?2 WHERE event_id = ?1")
        .bind(event_id)
        .bind(dest_calendar_id)
        .execute(tx.conn())
        .await?;
    tx.touch(Table::Events);
    tx.touch(Table::Occurrences);
    Ok(())
}

/// Deletes the row; occurrences, reminders and pending operations cascade,
/// and any occurrence pointing here through `exception_event_id` is SET NULL
/// by the foreign key.
pub async fn delete(tx: &mut StoreTx, id: &str) -> CalendarResult<()> {
    sqlx::query("DELETE FROM events WHERE id = ?1")
        .bind(id)
        .execute(tx.conn())
        .await?;
    tx.touch(Table::Events);
    tx.touch(Table::Occurrences);
    tx.touch(Table::Reminders);
    tx.touch(Table::PendingOperations);
    Ok(())
}

pub async fn fetch_occurrences_for_event<'e, E>(
    exec: E,
    event_id: &str,
) -> CalendarResult<Vec<Occurrence>>
where
    E: Executor<'e, Database = Sqlite>,
{
    let rows = sqlx::query("SELECT * FROM occurrences WHERE event_id = ?1 ORDER BY start_ts")
        .bind(event_id)
        .fetch_all(exec)
        .await?;
    rows.iter().map(occurrence_from_row).collect()
}
