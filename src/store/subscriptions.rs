/*!
 * ICS-subscription queries.
 */

use sqlx::{Executor, Sqlite};

use crate::error::CalendarResult;
use crate::store::rows::subscription_from_row;
use crate::store::{StoreTx, Table};
use crate::types::IcsSubscription;

pub async fn insert(tx: &mut StoreTx, sub: &IcsSubscription) -> CalendarResult<()> {
    sqlx::query(
        r#"
        INSERT INTO ics_subscriptions (
            id, url, name, color, calendar_id, last_sync, sync_interval_hours,
            enabled, etag, last_modified, username, last_error, created_at
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)
    "#,
    )
    .bind(&sub.id)
    .bind(&sub.url)
    .bind(&sub.name)
    .bind(sub.color)
    .bind(&sub.calendar_id)
    .bind(sub.last_sync)
    .bind(sub.sync_interval_hours)
    .bind(sub.enabled)
    .bind(&sub.etag)
    .bind(&sub.last_modified)
    .bind(&sub.username)
    .bind(&sub.last_error)
    .bind(sub.created_at)
    .execute(tx.conn())
    .await?;
    tx.touch(Table::Subscriptions);
    Ok(())
}

pub async fn fetch_by_id<'e, E>(exec: E, id: &str) -> CalendarResult<Option<IcsSubscription>>
where
    E: Executor<'e, Database = Sqlite>,
{
    let row = sqlx::query("SELECT * FROM ics_subscriptions WHERE id = ?1")
        .bind(id)
        .fetch_optional(exec)
        .await?;
    row.as_ref().map(subscription_from_row).transpose()
}

pub async fn list_all<'e, E>(exec: E) -> CalendarResult<Vec<IcsSubscription>>
where
    E: Executor<'e, Database = Sqlite>,
{
    let rows = sqlx::query("SELECT * FROM ics_subscriptions ORDER BY created_at")
        .fetch_all(exec)
        .await?;
    rows.iter().map(subscription_from_row).collect()
}

/// Subscriptions whose refresh interval has elapsed.
pub async fn list_due<'e, E>(exec: E, now_ms: i64) -> CalendarResult<Vec<IcsSubscription>>
where
    E: Executor<'e, Database = Sqlite>,
{
    let rows = sqlx::query(
        r#"
        SELECT * FROM ics_subscriptions
        WHERE enabled = 1 AND ?1 - last_sync >= sync_interval_hours * 3600000
        ORDER BY last_sync
    "#,
    )
    .bind(now_ms)
    .fetch_all(exec)
    .await?;
    rows.iter().map(subscription_from_row).collect()
}

/// Records a successful refresh (or an unchanged 304) with fresh validators.
pub async fn record_refresh(
    tx: &mut StoreTx,
    id: &str,
    now_ms: i64,
    etag: Option<&str>,
    last_modified: Option<&str>,
) -> CalendarResult<()> {
    sqlx::query(
        r#"
        UPDATE ics_subscriptions
        SET last_sync = ?2, etag = ?3, last_modified = ?4, last_error = NULL
        WHERE id = ?1
    "#,
    )
    .bind(id)
    .bind(now_ms)
    .bind(etag)
    .bind(last_modified)
    .execute(tx.conn())
    .await?;
    tx.touch(Table::Subscriptions);
    Ok(())
}

/// Failures fill `last_error` but never disable the subscription.
pub async fn record_error(tx: &mut StoreTx, id: &str, message: &str) -> CalendarResult<()> {
    sqlx::query("UPDATE ics_subscriptions SET last_error = ?2 WHERE id = ?1")
        .bind(id)
        .bind(message)
        .execute(tx.conn())
        .await?;
    tx.touch(Table::Subscriptions);
    Ok(())
}

pub async fn set_enabled(tx: &mut StoreTx, id: &str, enabled: bool) -> CalendarResult<()> {
    sqlx::query("UPDATE ics_subscriptions SET enabled = ?2 WHERE id = ?1")
        .bind(id)
        .bind(enabled)
        .execute(tx.conn())
        .await?;
    tx.touch(Table::Subscriptions);
    Ok(())
}

pub async fn delete(tx: &mut StoreTx, id: &str) -> CalendarResult<()> {
    sqlx::query("DELETE FROM ics_subscriptions WHERE id = ?1")
        .bind(id)
        .execute(tx.conn())
        .await?;
    tx.touch(Table::Subscriptions);
    Ok(())
}
