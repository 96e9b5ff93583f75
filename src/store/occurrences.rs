/*!
 * Occurrence queries.
 *
 * Rows are keyed (event_id, start_ts). The exception pointer is preserved
 * across regenerations unless explicitly rewritten, so a server race that
 * delivered the exception before the master cannot be undone by a later
 * expansion pass.
 */

use sqlx::{Executor, Sqlite};

use crate::error::CalendarResult;
use crate::store::rows::occurrence_from_row;
use crate::store::{StoreTx, Table};
use crate::types::Occurrence;

/// Inserts or updates by (event_id, start_ts), keeping a previously attached
/// `exception_event_id` unless the caller supplies one.
pub async fn upsert(tx: &mut StoreTx, occurrence: &Occurrence) -> CalendarResult<()> {
    sqlx::query(
        r#"
        INSERT INTO occurrences (
            id, event_id, calendar_id, start_ts, end_ts, start_day, end_day,
            is_cancelled, exception_event_id
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
        ON CONFLICT(event_id, start_ts) DO UPDATE SET
            calendar_id = excluded.calendar_id,
            end_ts = excluded.end_ts,
            start_day = excluded.start_day,
            end_day = excluded.end_day,
            is_cancelled = excluded.is_cancelled,
            exception_event_id = COALESCE(excluded.exception_event_id, occurrences.exception_event_id)
    "#,
    )
    .bind(&occurrence.id)
    .bind(&occurrence.event_id)
    .bind(&occurrence.calendar_id)
    .bind(occurrence.start_ts)
    .bind(occurrence.end_ts)
    .bind(occurrence.start_day as i64)
    .bind(occurrence.end_day as i64)
    .bind(occurrence.is_cancelled)
    .bind(&occurrence.exception_event_id)
    .execute(tx.conn())
    .await?;
    tx.touch(Table::Occurrences);
    Ok(())
}

/// Removes occurrences of an event whose start is not in the surviving set.
pub async fn delete_not_in(
    tx: &mut StoreTx,
    event_id: &str,
    keep_starts: &[i64],
) -> CalendarResult<u64> {
    let result = if keep_starts.is_empty() {
        sqlx::query("DELETE FROM occurrences WHERE event_id = ?1")
            .bind(event_id)
            .execute(tx.conn())
            .await?
    } else {
        let placeholders: Vec<String> =
            (0..keep_starts.len()).map(|i| format!("?{}", i + 2)).collect();
        let sql = format!(
            "DELETE FROM occurrences WHERE event_id = ?1 AND start_ts NOT IN ({})",
            placeholders.join(", ")
        );
        let mut query = sqlx::query(&sql).bind(event_id);
        for start in keep_starts {
            query = query.bind(start);
        }
        query.execute(tx.conn()).await?
    };
    tx.touch(Table::Occurrences);
    Ok(result.rows_affected())
}

pub async fn delete_for_event(tx: &mut StoreTx, event_id: &str) -> CalendarResult<()> {
    sqlx::query("DELETE FROM occurrences WHERE event_id = ?1")
        .bind(event_id)
        .execute(tx.conn())
        .await?;
    tx.touch(Table::Occurrences);
    Ok(())
}

/// Points the (master, instance) occurrence at an exception row, or clears
/// the pointer. Returns false when no such occurrence exists.
pub async fn set_exception_pointer(
    tx: &mut StoreTx,
    master_event_id: &str,
    start_ts: i64,
    exception_event_id: Option<&str>,
) -> CalendarResult<bool> {
    let result = sqlx::query(
        "UPDATE occurrences SET exception_event_id = ?3 WHERE event_id = ?1 AND start_ts = ?2",
    )
    .bind(master_event_id)
    .bind(start_ts)
    .bind(exception_event_id)
    .execute(tx.conn())
    .await?;
    tx.touch(Table::Occurrences);
    Ok(result.rows_affected() > 0)
}

pub async fn set_cancelled(
    tx: &mut StoreTx,
    master_event_id: &str,
    start_ts: i64,
    cancelled: bool,
) -> CalendarResult<()> {
    sqlx::query(
        "UPDATE occurrences SET is_cancelled = ?3 WHERE event_id = ?1 AND start_ts = ?2",
    )
    .bind(master_event_id)
    .bind(start_ts)
    .bind(cancelled)
    .execute(tx.conn())
    .await?;
    tx.touch(Table::Occurrences);
    Ok(())
}

pub async fn fetch_by_event_and_start<'e, E>(
    exec: E,
    event_id: &str,
    start_ts: i64,
) -> CalendarResult<Option<Occurrence>>
where
    E: Executor<'e, Database = Sqlite>,
{
    let row = sqlx::query("SELECT * FROM occurrences WHERE event_id = ?1 AND start_ts = ?2")
        .bind(event_id)
        .bind(start_ts)
        .fetch_optional(exec)
        .await?;
    row.as_ref().map(occurrence_from_row).transpose()
}

pub async fn list_for_event<'e, E>(exec: E, event_id: &str) -> CalendarResult<Vec<Occurrence>>
where
    E: Executor<'e, Database = Sqlite>,
{
    let rows = sqlx::query("SELECT * FROM occurrences WHERE event_id = ?1 ORDER BY start_ts")
        .bind(event_id)
        .fetch_all(exec)
        .await?;
    rows.iter().map(occurrence_from_row).collect()
}

/// Non-cancelled occurrences starting inside the window, for the reminder
/// planner. Calendar visibility is applied here so hidden calendars never
/// schedule notifications.
pub async fn list_starting_in_window<'e, E>(
    exec: E,
    window_start: i64,
    window_end: i64,
) -> CalendarResult<Vec<Occurrence>>
where
    E: Executor<'e, Database = Sqlite>,
{
    let rows = sqlx::query(
        r#"
        SELECT o.* FROM occurrences o
        JOIN calendars c ON c.id = o.calendar_id
        WHERE o.is_cancelled = 0 AND c.is_visible = 1
          AND o.start_ts >= ?1 AND o.start_ts <= ?2
        ORDER BY o.start_ts
    "#,
    )
    .bind(window_start)
    .bind(window_end)
    .fetch_all(exec)
    .await?;
    rows.iter().map(occurrence_from_row).collect()
}
