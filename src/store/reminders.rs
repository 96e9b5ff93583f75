/*!
 * Scheduled-reminder queries.
 *
 * Rows are keyed (event_id, occurrence_time, reminder_offset). The planner
 * upserts PENDING rows and prunes vanished ones; FIRED and SNOOZED rows are
 * user-visible state and never pruned by planning.
 */

use sqlx::{Executor, Sqlite};

use crate::error::CalendarResult;
use crate::store::rows::reminder_from_row;
use crate::store::{StoreTx, Table};
use crate::types::{ReminderStatus, ScheduledReminder};

/// Inserts the reminder or refreshes its denormalized fields. The status of
/// an existing row is preserved so planning cannot resurrect a dismissed or
/// fired reminder.
pub async fn upsert(tx: &mut StoreTx, reminder: &ScheduledReminder) -> CalendarResult<()> {
    sqlx::query(
        r#"
        INSERT INTO scheduled_reminders (
            id, event_id, occurrence_time, trigger_time, reminder_offset,
            status, snooze_count, event_title, event_location, is_all_day,
            calendar_color
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)
        ON CONFLICT(event_id, occurrence_time, reminder_offset) DO UPDATE SET
            trigger_time = excluded.trigger_time,
            event_title = excluded.event_title,
            event_location = excluded.event_location,
            is_all_day = excluded.is_all_day,
            calendar_color = excluded.calendar_color
    "#,
    )
    .bind(&reminder.id)
    .bind(&reminder.event_id)
    .bind(reminder.occurrence_time)
    .bind(reminder.trigger_time)
    .bind(&reminder.reminder_offset)
    .bind(reminder.status.as_str())
    .bind(reminder.snooze_count)
    .bind(&reminder.event_title)
    .bind(&reminder.event_location)
    .bind(reminder.is_all_day)
    .bind(reminder.calendar_color)
    .execute(tx.conn())
    .await?;
    tx.touch(Table::Reminders);
    Ok(())
}

pub async fn fetch_by_id<'e, E>(exec: E, id: &str) -> CalendarResult<Option<ScheduledReminder>>
where
    E: Executor<'e, Database = Sqlite>,
{
    let row = sqlx::query("SELECT * FROM scheduled_reminders WHERE id = ?1")
        .bind(id)
        .fetch_optional(exec)
        .await?;
    row.as_ref().map(reminder_from_row).transpose()
}

pub async fn list_for_event<'e, E>(exec: E, event_id: &str) -> CalendarResult<Vec<ScheduledReminder>>
where
    E: Executor<'e, Database = Sqlite>,
{
    let rows = sqlx::query(
        "SELECT * FROM scheduled_reminders WHERE event_id = ?1 ORDER BY trigger_time",
    )
    .bind(event_id)
    .fetch_all(exec)
    .await?;
    rows.iter().map(reminder_from_row).collect()
}

/// All reminders whose occurrence starts inside the planning window.
pub async fn list_in_window<'e, E>(
    exec: E,
    window_start: i64,
    window_end: i64,
) -> CalendarResult<Vec<ScheduledReminder>>
where
    E: Executor<'e, Database = Sqlite>,
{
    let rows = sqlx::query(
        r#"
        SELECT * FROM scheduled_reminders
        WHERE occurrence_time >= ?1 AND occurrence_time <= ?2
        ORDER BY trigger_time
    "#,
    )
    .bind(window_start)
    .bind(window_end)
    .fetch_all(exec)
    .await?;
    rows.iter().map(reminder_from_row).collect()
}

/// PENDING or SNOOZED reminders due at or before `now`, for the external
/// alarm deliverer.
pub async fn list_due<'e, E>(exec: E, now_ms: i64) -> CalendarResult<Vec<ScheduledReminder>>
where
    E: Executor<'e, Database = Sqlite>,
{
    let rows = sqlx::query(
        r#"
        SELECT * FROM scheduled_reminders
        WHERE status IN ('PENDING', 'SNOOZED') AND trigger_time <= ?1
        ORDER BY trigger_time
    "#,
    )
    .bind(now_ms)
    .fetch_all(exec)
    .await?;
    rows.iter().map(reminder_from_row).collect()
}

pub async fn set_status(
    tx: &mut StoreTx,
    id: &str,
    status: ReminderStatus,
) -> CalendarResult<()> {
    sqlx::query("UPDATE scheduled_reminders SET status = ?2 WHERE id = ?1")
        .bind(id)
        .bind(status.as_str())
        .execute(tx.conn())
        .await?;
    tx.touch(Table::Reminders);
    Ok(())
}

/// Re-arms a fired reminder at a later trigger time.
pub async fn snooze(tx: &mut StoreTx, id: &str, snoozed_until_ms: i64) -> CalendarResult<()> {
    sqlx::query(
        r#"
        UPDATE scheduled_reminders
        SET status = 'SNOOZED', trigger_time = ?2, snooze_count = snooze_count + 1
        WHERE id = ?1
    "#,
    )
    .bind(id)
    .bind(snoozed_until_ms)
    .execute(tx.conn())
    .await?;
    tx.touch(Table::Reminders);
    Ok(())
}

pub async fn delete(tx: &mut StoreTx, id: &str) -> CalendarResult<()> {
    sqlx::query("DELETE FROM scheduled_reminders WHERE id = ?1")
        .bind(id)
        .execute(tx.conn())
        .await?;
    tx.touch(Table::Reminders);
    Ok(())
}

pub async fn delete_for_event(tx: &mut StoreTx, event_id: &str) -> CalendarResult<()> {
    sqlx::query("DELETE FROM scheduled_reminders WHERE event_id = ?1")
        .bind(event_id)
        .execute(tx.conn())
        .await?;
    tx.touch(Table::Reminders);
    Ok(())
}
