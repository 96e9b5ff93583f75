/*!
 * Account queries.
 */

use sqlx::{Executor, Sqlite};

use crate::error::CalendarResult;
use crate::store::rows::account_from_row;
use crate::store::{StoreTx, Table};
use crate::types::Account;

pub async fn insert(tx: &mut StoreTx, account: &Account) -> CalendarResult<()> {
    sqlx::query(
        r#"
        INSERT INTO accounts (
            id, provider, email, display_name, principal_url, home_set_url,
            is_enabled, created_at, last_sync_at, last_successful_sync_at,
            consecutive_sync_failures
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)
    "#,
    )
    .bind(&account.id)
    .bind(account.provider.as_str())
    .bind(&account.email)
    .bind(&account.display_name)
    .bind(&account.principal_url)
    .bind(&account.home_set_url)
    .bind(account.is_enabled)
    .bind(account.created_at)
    .bind(account.last_sync_at)
    .bind(account.last_successful_sync_at)
    .bind(account.consecutive_sync_failures)
    .execute(tx.conn())
    .await?;
    tx.touch(Table::Accounts);
    Ok(())
}

pub async fn fetch_by_id<'e, E>(exec: E, id: &str) -> CalendarResult<Option<Account>>
where
    E: Executor<'e, Database = Sqlite>,
{
    let row = sqlx::query("SELECT * FROM accounts WHERE id = ?1")
        .bind(id)
        .fetch_optional(exec)
        .await?;
    row.as_ref().map(account_from_row).transpose()
}

pub async fn fetch_by_provider_email<'e, E>(
    exec: E,
    provider: &str,
    email: &str,
) -> CalendarResult<Option<Account>>
where
    E: Executor<'e, Database = Sqlite>,
{
    let row = sqlx::query("SELECT * FROM accounts WHERE provider = ?1 AND email = ?2")
        .bind(provider)
        .bind(email)
        .fetch_optional(exec)
        .await?;
    row.as_ref().map(account_from_row).transpose()
}

pub async fn list_all<'e, E>(exec: E) -> CalendarResult<Vec<Account>>
where
    E: Executor<'e, Database = Sqlite>,
{
    let rows = sqlx::query("SELECT * FROM accounts ORDER BY created_at")
        .fetch_all(exec)
        .await?;
    rows.iter().map(account_from_row).collect()
}

pub async fn list_enabled<'e, E>(exec: E) -> CalendarResult<Vec<Account>>
where
    E: Executor<'e, Database = Sqlite>,
{
    let rows = sqlx::query("SELECT * FROM accounts WHERE is_enabled = 1 ORDER BY created_at")
        .fetch_all(exec)
        .await?;
    rows.iter().map(account_from_row).collect()
}

pub async fn set_enabled(tx: &mut StoreTx, id: &str, enabled: bool) -> CalendarResult<()> {
    sqlx::query("UPDATE accounts SET is_enabled = ?2 WHERE id = ?1")
        .bind(id)
        .bind(enabled)
        .execute(tx.conn())
        .await?;
    tx.touch(Table::Accounts);
    Ok(())
}

pub async fn set_discovery_urls(
    tx: &mut StoreTx,
    id: &str,
    principal_url: Option<&str>,
    home_set_url: Option<&str>,
) -> CalendarResult<()> {
    sqlx::query("UPDATE accounts SET principal_url = ?2, home_set_url = ?3 WHERE id = ?1")
        .bind(id)
        .bind(principal_url)
        .bind(home_set_url)
        .execute(tx.conn())
        .await?;
    tx.touch(Table::Accounts);
    Ok(())
}

/// Records the outcome of one sync attempt: success resets the failure
/// streak, failure extends it.
pub async fn record_sync_outcome(
    tx: &mut StoreTx,
    id: &str,
    now_ms: i64,
    success: bool,
) -> CalendarResult<()> {
    if success {
        sqlx::query(
            r#"
            UPDATE accounts
            SET last_sync_at = ?2, last_successful_sync_at = ?2,
                consecutive_sync_failures = 0
            WHERE id = ?1
        "#,
        )
        .bind(id)
        .bind(now_ms)
        .execute(tx.conn())
        .await?;
    } else {
        sqlx::query(
            r#"
            UPDATE accounts
            SET last_sync_at = ?2,
                consecutive_sync_failures = consecutive_sync_failures + 1
            WHERE id = ?1
        "#,
        )
        .bind(id)
        .bind(now_ms)
        .execute(tx.conn())
        .await?;
    }
    tx.touch(Table::Accounts);
    Ok(())
}

pub async fn delete(tx: &mut StoreTx, id: &str) -> CalendarResult<()> {
    sqlx::query("DELETE FROM accounts WHERE id = ?1")
        .bind(id)
        .execute(tx.conn())
        .await?;
    tx.touch(Table::Accounts);
    tx.touch(Table::Calendars);
    tx.touch(Table::Events);
    tx.touch(Table::Occurrences);
    tx.touch(Table::Reminders);
    tx.touch(Table::PendingOperations);
    Ok(())
}
