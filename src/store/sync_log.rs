/*!
 * Sync-log queries.
 */

use sqlx::{Executor, Sqlite};

use crate::error::CalendarResult;
use crate::store::rows::sync_log_from_row;
use crate::store::{StoreTx, Table};
use crate::types::SyncLogEntry;

pub async fn append(tx: &mut StoreTx, entry: &SyncLogEntry) -> CalendarResult<()> {
    sqlx::query(
        r#"
        INSERT INTO sync_log (id, timestamp, calendar_id, event_uid, result, message)
        VALUES (?1, ?2, ?3, ?4, ?5, ?6)
    "#,
    )
    .bind(&entry.id)
    .bind(entry.timestamp)
    .bind(&entry.calendar_id)
    .bind(&entry.event_uid)
    .bind(entry.result.as_str())
    .bind(&entry.message)
    .execute(tx.conn())
    .await?;
    tx.touch(Table::SyncLog);
    Ok(())
}

pub async fn recent<'e, E>(exec: E, limit: i64) -> CalendarResult<Vec<SyncLogEntry>>
where
    E: Executor<'e, Database = Sqlite>,
{
    let rows = sqlx::query("SELECT * FROM sync_log ORDER BY timestamp DESC LIMIT ?1")
        .bind(limit)
        .fetch_all(exec)
        .await?;
    rows.iter().map(sync_log_from_row).collect()
}

pub async fn for_calendar<'e, E>(
    exec: E,
    calendar_id: &str,
    limit: i64,
) -> CalendarResult<Vec<SyncLogEntry>>
where
    E: Executor<'e, Database = Sqlite>,
{
    let rows = sqlx::query(
        "SELECT * FROM sync_log WHERE calendar_id = ?1 ORDER BY timestamp DESC LIMIT ?2",
    )
    .bind(calendar_id)
    .bind(limit)
    .fetch_all(exec)
    .await?;
    rows.iter().map(sync_log_from_row).collect()
}

/// Trims history; sync logging must never grow without bound.
pub async fn prune_older_than(tx: &mut StoreTx, cutoff_ms: i64) -> CalendarResult<u64> {
    let result = sqlx::query("DELETE FROM sync_log WHERE timestamp < ?1")
        .bind(cutoff_ms)
        .execute(tx.conn())
        .await?;
    if result.rows_affected() > 0 {
        tx.touch(Table::SyncLog);
    }
    Ok(result.rows_affected())
}
