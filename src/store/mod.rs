/*!
 * Local Store
 *
 * Single source of truth for all persisted entities, backed by one SQLite
 * database in WAL mode. Writes go through an explicit transaction context
 * (`StoreTx`) handed out by [`Store::tx`]; commit notifies a broadcast
 * channel with the touched tables so reactive readers know to re-read.
 */

pub mod accounts;
pub mod calendars;
pub mod events;
pub mod occurrences;
pub mod operations;
pub mod reminders;
mod rows;
pub mod schema;
pub mod search;
pub mod subscriptions;
pub mod sync_log;

use std::collections::HashSet;
use std::str::FromStr;

use futures::future::BoxFuture;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions};
use sqlx::{Sqlite, Transaction};
use tokio::sync::broadcast;

use crate::error::{CalendarError, CalendarResult};

/// Tables a write can touch; used as the change-notification payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Table {
    Accounts,
    Calendars,
    Events,
    Occurrences,
    PendingOperations,
    Reminders,
    Subscriptions,
    SyncLog,
}

/// Explicit transaction context. Every write helper takes `&mut StoreTx`;
/// there is no ambient transaction and no nested auto-join.
pub struct StoreTx {
    tx: Transaction<'static, Sqlite>,
    touched: HashSet<Table>,
}

impl StoreTx {
    pub(crate) fn conn(&mut self) -> &mut sqlx::SqliteConnection {
        &mut self.tx
    }

    pub(crate) fn touch(&mut self, table: Table) {
        self.touched.insert(table);
    }
}

/// Handle to the local database. Cheap to clone; all clones share the pool
/// and the change channel.
#[derive(Clone)]
pub struct Store {
    pool: SqlitePool,
    changes: broadcast::Sender<Table>,
}

impl Store {
    /// Opens (creating if missing) the database at the given path.
    pub async fn open(path: &str) -> CalendarResult<Self> {
        let options = SqliteConnectOptions::from_str(path)
            .map_err(|e| CalendarError::store("open", e.to_string()))?
            .create_if_missing(true)
            .foreign_keys(true)
            .journal_mode(SqliteJournalMode::Wal);
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await?;
        Self::from_pool(pool).await
    }

    /// In-memory database, used by tests. A single connection keeps the
    /// whole database on one handle.
    pub async fn open_in_memory() -> CalendarResult<Self> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")
            .map_err(|e| CalendarError::store("open", e.to_string()))?
            .foreign_keys(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await?;
        Self::from_pool(pool).await
    }

    async fn from_pool(pool: SqlitePool) -> CalendarResult<Self> {
        schema::init_schema(&pool).await?;
        let (changes, _) = broadcast::channel(256);
        Ok(Self { pool, changes })
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Runs `body` atomically. On success the transaction commits and the
    /// touched tables are broadcast; on error everything rolls back and no
    /// notification fires.
    pub async fn tx<T, F>(&self, body: F) -> CalendarResult<T>
    where
        T: Send,
        F: for<'a> FnOnce(&'a mut StoreTx) -> BoxFuture<'a, CalendarResult<T>> + Send,
    {
        let tx = self.pool.begin().await?;
        let mut ctx = StoreTx {
            tx,
            touched: HashSet::new(),
        };
        match body(&mut ctx).await {
            Ok(value) => {
                let touched = std::mem::take(&mut ctx.touched);
                ctx.tx.commit().await?;
                for table in touched {
                    let _ = self.changes.send(table);
                }
                Ok(value)
            }
            Err(err) => {
                let _ = ctx.tx.rollback().await;
                Err(err)
            }
        }
    }

    /// Raw change stream; most callers want one of the typed watchers below.
    pub fn subscribe(&self) -> broadcast::Receiver<Table> {
        self.changes.subscribe()
    }

    pub fn watch_calendar(&self, calendar_id: &str) -> CalendarWatch {
        CalendarWatch {
            store: self.clone(),
            calendar_id: calendar_id.to_string(),
            rx: self.changes.subscribe(),
            primed: false,
        }
    }

    pub fn watch_events_in_range(&self, start_ts: i64, end_ts: i64) -> EventsInRangeWatch {
        EventsInRangeWatch {
            store: self.clone(),
            start_ts,
            end_ts,
            rx: self.changes.subscribe(),
            primed: false,
        }
    }

    pub fn watch_pending_count(&self) -> PendingCountWatch {
        PendingCountWatch {
            store: self.clone(),
            rx: self.changes.subscribe(),
            primed: false,
        }
    }
}

/// Awaits the next change touching any of `tables`. A lagged receiver counts
/// as a change: the reader re-reads and resynchronizes.
async fn wait_for_change(rx: &mut broadcast::Receiver<Table>, tables: &[Table]) {
    loop {
        match rx.recv().await {
            Ok(table) if tables.contains(&table) => return,
            Ok(_) => continue,
            Err(broadcast::error::RecvError::Lagged(_)) => return,
            Err(broadcast::error::RecvError::Closed) => {
                // Store dropped; park forever rather than spin.
                futures::future::pending::<()>().await;
            }
        }
    }
}

/// Restartable sequence of snapshots of one calendar row.
pub struct CalendarWatch {
    store: Store,
    calendar_id: String,
    rx: broadcast::Receiver<Table>,
    primed: bool,
}

impl CalendarWatch {
    /// First call returns the current snapshot; later calls block until a
    /// relevant write lands, then re-read.
    pub async fn next(&mut self) -> CalendarResult<Option<crate::types::Calendar>> {
        if self.primed {
            wait_for_change(&mut self.rx, &[Table::Calendars]).await;
        }
        self.primed = true;
        calendars::fetch_by_id(self.store.pool(), &self.calendar_id).await
    }
}

/// Restartable sequence of occurrence-window snapshots.
pub struct EventsInRangeWatch {
    store: Store,
    start_ts: i64,
    end_ts: i64,
    rx: broadcast::Receiver<Table>,
    primed: bool,
}

impl EventsInRangeWatch {
    pub async fn next(&mut self) -> CalendarResult<Vec<events::EventWithOccurrence>> {
        if self.primed {
            wait_for_change(
                &mut self.rx,
                &[Table::Events, Table::Occurrences, Table::Calendars],
            )
            .await;
        }
        self.primed = true;
        events::fetch_in_range(self.store.pool(), self.start_ts, self.end_ts, None).await
    }
}

/// Restartable sequence of pending-operation counts.
pub struct PendingCountWatch {
    store: Store,
    rx: broadcast::Receiver<Table>,
    primed: bool,
}

impl PendingCountWatch {
    pub async fn next(&mut self) -> CalendarResult<i64> {
        if self.primed {
            wait_for_change(&mut self.rx, &[Table::PendingOperations]).await;
        }
        self.primed = true;
        operations::count_pending(self.store.pool()).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Account, Provider};

    fn account(id: &str, email: &str) -> Account {
        Account {
            id: id.into(),
            provider: Provider::GenericCalDav,
            email: email.into(),
            display_name: "Test".into(),
            principal_url: None,
            home_set_url: None,
            is_enabled: true,
            created_at: 1,
            last_sync_at: None,
            last_successful_sync_at: None,
            consecutive_sync_failures: 0,
        }
    }

    #[tokio::test]
    async fn test_tx_commits_and_notifies() {
        let store = Store::open_in_memory().await.unwrap();
        let mut rx = store.subscribe();
        store
            .tx(|ctx| {
                Box::pin(async move {
                    accounts::insert(ctx, &account("a1", "a@example.com")).await
                })
            })
            .await
            .unwrap();
        assert_eq!(rx.recv().await.unwrap(), Table::Accounts);
        let loaded = accounts::fetch_by_id(store.pool(), "a1").await.unwrap();
        assert!(loaded.is_some());
    }

    #[tokio::test]
    async fn test_tx_rolls_back_on_error() {
        let store = Store::open_in_memory().await.unwrap();
        let result: CalendarResult<()> = store
            .tx(|ctx| {
                Box::pin(async move {
                    accounts::insert(ctx, &account("a1", "a@example.com")).await?;
                    Err(CalendarError::other("forced failure"))
                })
            })
            .await;
        assert!(result.is_err());
        let loaded = accounts::fetch_by_id(store.pool(), "a1").await.unwrap();
        assert!(loaded.is_none(), "rollback must leave no partial state");
    }

    #[tokio::test]
    async fn test_unique_violation_is_typed() {
        let store = Store::open_in_memory().await.unwrap();
        store
            .tx(|ctx| {
                Box::pin(async move {
                    accounts::insert(ctx, &account("a1", "dup@example.com")).await
                })
            })
            .await
            .unwrap();
        let err = store
            .tx(|ctx| {
                Box::pin(async move {
                    accounts::insert(ctx, &account("a2", "dup@example.com")).await
                })
            })
            .await
            .unwrap_err();
        match err {
            CalendarError::Store {
                constraint_violation,
                ..
            } => assert!(constraint_violation),
            other => panic!("expected store error, got {other:?}"),
        }
    }
}
