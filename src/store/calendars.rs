/*!
 * Calendar collection queries.
 */

use sqlx::{Executor, Sqlite};

use crate::error::CalendarResult;
use crate::store::rows::calendar_from_row;
use crate::store::{StoreTx, Table};
use crate::types::Calendar;

pub async fn fetch_by_id<'e, E>(exec: E, id: &str) -> CalendarResult<Option<Calendar>>
where
    E: Executor<'e, Database = Sqlite>,
{
    let row = sqlx::query("SELECT * FROM calendars WHERE id = ?1")
        .bind(id)
        .fetch_optional(exec)
        .await?;
    row.as_ref().map(calendar_from_row).transpose()
}

pub async fn fetch_by_url<'e, E>(exec: E, caldav_url: &str) -> CalendarResult<Option<Calendar>>
where
    E: Executor<'e, Database = Sqlite>,
{
    let row = sqlx::query("SELECT * FROM calendars WHERE caldav_url = ?1")
        .bind(caldav_url)
        .fetch_optional(exec)
        .await?;
    row.as_ref().map(calendar_from_row).transpose()
}

pub async fn list_for_account<'e, E>(exec: E, account_id: &str) -> CalendarResult<Vec<Calendar>>
where
    E: Executor<'e, Database = Sqlite>,
{
    let rows = sqlx::query(
        "SELECT * FROM calendars WHERE account_id = ?1 ORDER BY sort_order, display_name",
    )
    .bind(account_id)
    .fetch_all(exec)
    .await?;
    rows.iter().map(calendar_from_row).collect()
}

pub async fn list_all<'e, E>(exec: E) -> CalendarResult<Vec<Calendar>>
where
    E: Executor<'e, Database = Sqlite>,
{
    let rows = sqlx::query("SELECT * FROM calendars ORDER BY sort_order, display_name")
        .fetch_all(exec)
        .await?;
    rows.iter().map(calendar_from_row).collect()
}

/// Inserts or refreshes a calendar keyed by its normalized URL. Sync cursors
/// (ctag/sync_token) are deliberately left untouched so discovery never
/// shadows pull state.
pub async fn upsert_by_url(tx: &mut StoreTx, calendar: &Calendar) -> CalendarResult<String> {
    if let Some(existing) = fetch_by_url(tx.conn(), &calendar.caldav_url).await? {
        sqlx::query(
            r#"
            UPDATE calendars
            SET display_name = ?2, color = ?3, is_read_only = ?4
            WHERE id = ?1
        "#,
        )
        .bind(&existing.id)
        .bind(&calendar.display_name)
        .bind(calendar.color)
        .bind(calendar.is_read_only)
        .execute(tx.conn())
        .await?;
        tx.touch(Table::Calendars);
        return Ok(existing.id);
    }
    sqlx::query(
        r#"
        INSERT INTO calendars (
            id, account_id, caldav_url, display_name, color, ctag, sync_token,
            is_visible, is_default, is_read_only, sort_order
        ) VALUES (?1, ?2, ?3, ?4, ?5, NULL, NULL, ?6, ?7, ?8, ?9)
    "#,
    )
    .bind(&calendar.id)
    .bind(&calendar.account_id)
    .bind(&calendar.caldav_url)
    .bind(&calendar.display_name)
    .bind(calendar.color)
    .bind(calendar.is_visible)
    .bind(calendar.is_default)
    .bind(calendar.is_read_only)
    .bind(calendar.sort_order)
    .execute(tx.conn())
    .await?;
    tx.touch(Table::Calendars);
    Ok(calendar.id.clone())
}

pub async fn insert(tx: &mut StoreTx, calendar: &Calendar) -> CalendarResult<()> {
    sqlx::query(
        r#"
        INSERT INTO calendars (
            id, account_id, caldav_url, display_name, color, ctag, sync_token,
            is_visible, is_default, is_read_only, sort_order
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)
    "#,
    )
    .bind(&calendar.id)
    .bind(&calendar.account_id)
    .bind(&calendar.caldav_url)
    .bind(&calendar.display_name)
    .bind(calendar.color)
    .bind(&calendar.ctag)
    .bind(&calendar.sync_token)
    .bind(calendar.is_visible)
    .bind(calendar.is_default)
    .bind(calendar.is_read_only)
    .bind(calendar.sort_order)
    .execute(tx.conn())
    .await?;
    tx.touch(Table::Calendars);
    Ok(())
}

/// Persists fresh change-detection cursors after a pull.
pub async fn update_sync_cursors(
    tx: &mut StoreTx,
    id: &str,
    ctag: Option<&str>,
    sync_token: Option<&str>,
) -> CalendarResult<()> {
    sqlx::query("UPDATE calendars SET ctag = ?2, sync_token = ?3 WHERE id = ?1")
        .bind(id)
        .bind(ctag)
        .bind(sync_token)
        .execute(tx.conn())
        .await?;
    tx.touch(Table::Calendars);
    Ok(())
}

pub async fn clear_sync_token(tx: &mut StoreTx, id: &str) -> CalendarResult<()> {
    sqlx::query("UPDATE calendars SET sync_token = NULL WHERE id = ?1")
        .bind(id)
        .execute(tx.conn())
        .await?;
    tx.touch(Table::Calendars);
    Ok(())
}

/// Makes this calendar the account default, demoting any other. Enforces
/// the at-most-one-default invariant in a single transaction.
pub async fn set_default(tx: &mut StoreTx, account_id: &str, calendar_id: &str) -> CalendarResult<()> {
    sqlx::query("UPDATE calendars SET is_default = 0 WHERE account_id = ?1 AND id != ?2")
        .bind(account_id)
        .bind(calendar_id)
        .execute(tx.conn())
        .await?;
    sqlx::query("UPDATE calendars SET is_default = 1 WHERE id = ?1")
        .bind(calendar_id)
        .execute(tx.conn())
        .await?;
    tx.touch(Table::Calendars);
    Ok(())
}

pub async fn set_visible(tx: &mut StoreTx, id: &str, visible: bool) -> CalendarResult<()> {
    sqlx::query("UPDATE calendars SET is_visible = ?2 WHERE id = ?1")
        .bind(id)
        .bind(visible)
        .execute(tx.conn())
        .await?;
    tx.touch(Table::Calendars);
    Ok(())
}

pub async fn delete(tx: &mut StoreTx, id: &str) -> CalendarResult<()> {
    sqlx::query("DELETE FROM calendars WHERE id = ?1")
        .bind(id)
        .execute(tx.conn())
        .await?;
    tx.touch(Table::Calendars);
    tx.touch(Table::Events);
    tx.touch(Table::Occurrences);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{accounts, Store};
    use crate::types::{Account, Provider};

    async fn seed(store: &Store) -> String {
        store
            .tx(|ctx| {
                Box::pin(async move {
                    accounts::insert(
                        ctx,
                        &Account {
                            id: "a1".into(),
                            provider: Provider::GenericCalDav,
                            email: "u@example.com".into(),
                            display_name: "U".into(),
                            principal_url: None,
                            home_set_url: None,
                            is_enabled: true,
                            created_at: 0,
                            last_sync_at: None,
                            last_successful_sync_at: None,
                            consecutive_sync_failures: 0,
                        },
                    )
                    .await
                })
            })
            .await
            .unwrap();
        "a1".to_string()
    }

    fn calendar(id: &str, url: &str, default: bool) -> Calendar {
        Calendar {
            id: id.into(),
            account_id: "a1".into(),
            caldav_url: url.into(),
            display_name: format!("Calendar {id}"),
            color: 0xFF33_66FF,
            ctag: None,
            sync_token: None,
            is_visible: true,
            is_default: default,
            is_read_only: false,
            sort_order: 0,
        }
    }

    #[tokio::test]
    async fn test_upsert_by_url_is_idempotent() {
        let store = Store::open_in_memory().await.unwrap();
        seed(&store).await;
        let id1 = store
            .tx(|ctx| {
                Box::pin(async move {
                    upsert_by_url(ctx, &calendar("c1", "https://s/cal/a/", false)).await
                })
            })
            .await
            .unwrap();
        // Same URL with a new candidate id refreshes in place.
        let id2 = store
            .tx(|ctx| {
                Box::pin(async move {
                    let mut cal = calendar("c2", "https://s/cal/a/", false);
                    cal.display_name = "Renamed".into();
                    upsert_by_url(ctx, &cal).await
                })
            })
            .await
            .unwrap();
        assert_eq!(id1, id2);
        let loaded = fetch_by_url(store.pool(), "https://s/cal/a/")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(loaded.display_name, "Renamed");
    }

    #[tokio::test]
    async fn test_at_most_one_default() {
        let store = Store::open_in_memory().await.unwrap();
        seed(&store).await;
        store
            .tx(|ctx| {
                Box::pin(async move {
                    insert(ctx, &calendar("c1", "https://s/cal/1/", true)).await?;
                    insert(ctx, &calendar("c2", "https://s/cal/2/", false)).await?;
                    set_default(ctx, "a1", "c2").await
                })
            })
            .await
            .unwrap();
        let all = list_for_account(store.pool(), "a1").await.unwrap();
        let defaults: Vec<_> = all.iter().filter(|c| c.is_default).collect();
        assert_eq!(defaults.len(), 1);
        assert_eq!(defaults[0].id, "c2");
    }
}
