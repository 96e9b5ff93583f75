/*!
 * Pending-operation queue queries.
 */

use sqlx::{Executor, Row, Sqlite};

use crate::error::CalendarResult;
use crate::store::rows::operation_from_row;
use crate::store::{StoreTx, Table};
use crate::types::{OperationStatus, PendingOperation};

pub async fn enqueue(tx: &mut StoreTx, op: &PendingOperation) -> CalendarResult<()> {
    sqlx::query(
        r#"
        INSERT INTO pending_operations (
            id, event_id, operation, status, retry_count, next_retry_at,
            last_error, failed_at, lifetime_reset_at, dest_calendar_id, created_at
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)
    "#,
    )
    .bind(&op.id)
    .bind(&op.event_id)
    .bind(op.operation.as_str())
    .bind(op.status.as_str())
    .bind(op.retry_count)
    .bind(op.next_retry_at)
    .bind(&op.last_error)
    .bind(op.failed_at)
    .bind(op.lifetime_reset_at)
    .bind(&op.dest_calendar_id)
    .bind(op.created_at)
    .execute(tx.conn())
    .await?;
    tx.touch(Table::PendingOperations);
    Ok(())
}

pub async fn fetch_by_id<'e, E>(exec: E, id: &str) -> CalendarResult<Option<PendingOperation>>
where
    E: Executor<'e, Database = Sqlite>,
{
    let row = sqlx::query("SELECT * FROM pending_operations WHERE id = ?1")
        .bind(id)
        .fetch_optional(exec)
        .await?;
    row.as_ref().map(operation_from_row).transpose()
}

/// Ready PENDING ops for one calendar, oldest first.
pub async fn list_ready_for_calendar<'e, E>(
    exec: E,
    calendar_id: &str,
    now_ms: i64,
) -> CalendarResult<Vec<PendingOperation>>
where
    E: Executor<'e, Database = Sqlite>,
{
    let rows = sqlx::query(
        r#"
        SELECT p.* FROM pending_operations p
        JOIN events e ON e.id = p.event_id
        WHERE e.calendar_id = ?1 AND p.status = 'PENDING' AND p.next_retry_at <= ?2
        ORDER BY p.created_at, p.id
    "#,
    )
    .bind(calendar_id)
    .bind(now_ms)
    .fetch_all(exec)
    .await?;
    rows.iter().map(operation_from_row).collect()
}

pub async fn list_for_event<'e, E>(exec: E, event_id: &str) -> CalendarResult<Vec<PendingOperation>>
where
    E: Executor<'e, Database = Sqlite>,
{
    let rows = sqlx::query("SELECT * FROM pending_operations WHERE event_id = ?1 ORDER BY created_at")
        .bind(event_id)
        .fetch_all(exec)
        .await?;
    rows.iter().map(operation_from_row).collect()
}

pub async fn count_pending<'e, E>(exec: E) -> CalendarResult<i64>
where
    E: Executor<'e, Database = Sqlite>,
{
    let row = sqlx::query("SELECT COUNT(*) AS n FROM pending_operations WHERE status = 'PENDING'")
        .fetch_one(exec)
        .await?;
    Ok(row.try_get("n")?)
}

pub async fn set_status(
    tx: &mut StoreTx,
    id: &str,
    status: OperationStatus,
) -> CalendarResult<()> {
    sqlx::query("UPDATE pending_operations SET status = ?2 WHERE id = ?1")
        .bind(id)
        .bind(status.as_str())
        .execute(tx.conn())
        .await?;
    tx.touch(Table::PendingOperations);
    Ok(())
}

/// Returns a retryable op to PENDING with its next attempt time.
pub async fn requeue(
    tx: &mut StoreTx,
    id: &str,
    retry_count: i64,
    next_retry_at: i64,
    last_error: &str,
) -> CalendarResult<()> {
    sqlx::query(
        r#"
        UPDATE pending_operations
        SET status = 'PENDING', retry_count = ?2, next_retry_at = ?3, last_error = ?4
        WHERE id = ?1
    "#,
    )
    .bind(id)
    .bind(retry_count)
    .bind(next_retry_at)
    .bind(last_error)
    .execute(tx.conn())
    .await?;
    tx.touch(Table::PendingOperations);
    Ok(())
}

/// The user touched the event again: restart the lifetime window and make
/// the op immediately eligible.
pub async fn reset_lifetime(tx: &mut StoreTx, id: &str, now_ms: i64) -> CalendarResult<()> {
    sqlx::query(
        r#"
        UPDATE pending_operations
        SET lifetime_reset_at = ?2, next_retry_at = ?2, status = 'PENDING',
            retry_count = 0, failed_at = NULL
        WHERE id = ?1
    "#,
    )
    .bind(id)
    .bind(now_ms)
    .execute(tx.conn())
    .await?;
    tx.touch(Table::PendingOperations);
    Ok(())
}

/// Morphs an op in place (UPDATE → CREATE promotion, MOVE fallback).
pub async fn set_operation(
    tx: &mut StoreTx,
    id: &str,
    operation: crate::types::OperationType,
    now_ms: i64,
) -> CalendarResult<()> {
    sqlx::query(
        r#"
        UPDATE pending_operations
        SET operation = ?2, status = 'PENDING', next_retry_at = ?3
        WHERE id = ?1
    "#,
    )
    .bind(id)
    .bind(operation.as_str())
    .bind(now_ms)
    .execute(tx.conn())
    .await?;
    tx.touch(Table::PendingOperations);
    Ok(())
}

pub async fn mark_failed(
    tx: &mut StoreTx,
    id: &str,
    now_ms: i64,
    last_error: &str,
) -> CalendarResult<()> {
    sqlx::query(
        r#"
        UPDATE pending_operations
        SET status = 'FAILED', failed_at = ?2, last_error = ?3
        WHERE id = ?1
    "#,
    )
    .bind(id)
    .bind(now_ms)
    .bind(last_error)
    .execute(tx.conn())
    .await?;
    tx.touch(Table::PendingOperations);
    Ok(())
}

pub async fn delete(tx: &mut StoreTx, id: &str) -> CalendarResult<()> {
    sqlx::query("DELETE FROM pending_operations WHERE id = ?1")
        .bind(id)
        .execute(tx.conn())
        .await?;
    tx.touch(Table::PendingOperations);
    Ok(())
}

pub async fn delete_for_event(tx: &mut StoreTx, event_id: &str) -> CalendarResult<()> {
    sqlx::query("DELETE FROM pending_operations WHERE event_id = ?1")
        .bind(event_id)
        .execute(tx.conn())
        .await?;
    tx.touch(Table::PendingOperations);
    Ok(())
}

/// Gives FAILED ops one more chance after the auto-reset interval; the retry
/// counter is deliberately preserved.
pub async fn reset_stale_failures(
    tx: &mut StoreTx,
    now_ms: i64,
    auto_reset_after_ms: i64,
) -> CalendarResult<u64> {
    let result = sqlx::query(
        r#"
        UPDATE pending_operations
        SET status = 'PENDING', failed_at = NULL, next_retry_at = ?1
        WHERE status = 'FAILED' AND failed_at IS NOT NULL AND failed_at <= ?2
    "#,
    )
    .bind(now_ms)
    .bind(now_ms - auto_reset_after_ms)
    .execute(tx.conn())
    .await?;
    if result.rows_affected() > 0 {
        tx.touch(Table::PendingOperations);
    }
    Ok(result.rows_affected())
}

/// Ops past their lifetime window, to be discarded with a log record.
pub async fn list_expired<'e, E>(
    exec: E,
    now_ms: i64,
    lifetime_ms: i64,
) -> CalendarResult<Vec<PendingOperation>>
where
    E: Executor<'e, Database = Sqlite>,
{
    let rows = sqlx::query("SELECT * FROM pending_operations WHERE lifetime_reset_at <= ?1")
        .bind(now_ms - lifetime_ms)
        .fetch_all(exec)
        .await?;
    rows.iter().map(operation_from_row).collect()
}

/// Recovers ops stranded IN_PROGRESS by a crash or cancellation; they go
/// back to PENDING for the next drain.
pub async fn recover_in_progress(tx: &mut StoreTx, now_ms: i64) -> CalendarResult<u64> {
    let result = sqlx::query(
        r#"
        UPDATE pending_operations
        SET status = 'PENDING', next_retry_at = ?1
        WHERE status = 'IN_PROGRESS'
    "#,
    )
    .bind(now_ms)
    .execute(tx.conn())
    .await?;
    if result.rows_affected() > 0 {
        tx.touch(Table::PendingOperations);
    }
    Ok(result.rows_affected())
}
