/*!
 * Store Schema
 *
 * Single SQLite database holding every entity of the data model plus the
 * FTS5 index over event text. Cascades mirror the ownership tree; the
 * exception pointer on occurrences is the one SET NULL edge. The FTS index
 * is kept current by triggers so no write path can forget it.
 */

use sqlx::sqlite::SqlitePool;

use crate::error::CalendarResult;

pub(crate) async fn init_schema(pool: &SqlitePool) -> CalendarResult<()> {
    let mut tx = pool.begin().await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS accounts (
            id TEXT PRIMARY KEY,
            provider TEXT NOT NULL CHECK (provider IN ('ICLOUD', 'GENERIC_CALDAV', 'ICS', 'LOCAL')),
            email TEXT NOT NULL,
            display_name TEXT NOT NULL,
            principal_url TEXT,
            home_set_url TEXT,
            is_enabled INTEGER NOT NULL DEFAULT 1,
            created_at INTEGER NOT NULL,
            last_sync_at INTEGER,
            last_successful_sync_at INTEGER,
            consecutive_sync_failures INTEGER NOT NULL DEFAULT 0,

            UNIQUE(provider, email)
        )
    "#,
    )
    .execute(&mut *tx)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS calendars (
            id TEXT PRIMARY KEY,
            account_id TEXT NOT NULL,
            caldav_url TEXT NOT NULL UNIQUE,
            display_name TEXT NOT NULL,
            color INTEGER NOT NULL DEFAULT 0,
            ctag TEXT,
            sync_token TEXT,
            is_visible INTEGER NOT NULL DEFAULT 1,
            is_default INTEGER NOT NULL DEFAULT 0,
            is_read_only INTEGER NOT NULL DEFAULT 0,
            sort_order INTEGER NOT NULL DEFAULT 0,

            FOREIGN KEY (account_id) REFERENCES accounts (id) ON DELETE CASCADE
        )
    "#,
    )
    .execute(&mut *tx)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS events (
            id TEXT PRIMARY KEY,
            uid TEXT NOT NULL,
            import_id TEXT NOT NULL DEFAULT '',
            calendar_id TEXT NOT NULL,
            title TEXT NOT NULL DEFAULT '',
            location TEXT,
            description TEXT,
            start_ts INTEGER NOT NULL,
            end_ts INTEGER NOT NULL,
            timezone TEXT,
            is_all_day INTEGER NOT NULL DEFAULT 0,
            status TEXT NOT NULL DEFAULT 'CONFIRMED' CHECK (status IN ('CONFIRMED', 'TENTATIVE', 'CANCELLED')),
            transp TEXT NOT NULL DEFAULT 'OPAQUE',
            classification TEXT NOT NULL DEFAULT 'PUBLIC',
            organizer_email TEXT,
            organizer_name TEXT,
            rrule TEXT,
            rdate TEXT,
            exdate TEXT,
            duration TEXT,
            original_event_id TEXT,
            original_instance_time INTEGER,
            reminders TEXT NOT NULL DEFAULT '[]',
            extra_properties TEXT NOT NULL DEFAULT '{}',
            raw_ical TEXT,
            dtstamp INTEGER NOT NULL DEFAULT 0,
            caldav_url TEXT,
            etag TEXT,
            sequence INTEGER NOT NULL DEFAULT 0,
            sync_status TEXT NOT NULL DEFAULT 'SYNCED' CHECK (sync_status IN ('SYNCED', 'PENDING_CREATE', 'PENDING_UPDATE', 'PENDING_DELETE')),
            last_sync_error TEXT,
            sync_retry_count INTEGER NOT NULL DEFAULT 0,
            parser_version INTEGER NOT NULL DEFAULT 0,
            local_modified_at INTEGER,
            server_modified_at INTEGER,

            FOREIGN KEY (calendar_id) REFERENCES calendars (id) ON DELETE CASCADE
        )
    "#,
    )
    .execute(&mut *tx)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS occurrences (
            id TEXT PRIMARY KEY,
            event_id TEXT NOT NULL,
            calendar_id TEXT NOT NULL,
            start_ts INTEGER NOT NULL,
            end_ts INTEGER NOT NULL,
            start_day INTEGER NOT NULL,
            end_day INTEGER NOT NULL,
            is_cancelled INTEGER NOT NULL DEFAULT 0,
            exception_event_id TEXT,

            FOREIGN KEY (event_id) REFERENCES events (id) ON DELETE CASCADE,
            FOREIGN KEY (exception_event_id) REFERENCES events (id) ON DELETE SET NULL,
            UNIQUE(event_id, start_ts)
        )
    "#,
    )
    .execute(&mut *tx)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS pending_operations (
            id TEXT PRIMARY KEY,
            event_id TEXT NOT NULL,
            operation TEXT NOT NULL CHECK (operation IN ('CREATE', 'UPDATE', 'DELETE', 'MOVE')),
            status TEXT NOT NULL DEFAULT 'PENDING' CHECK (status IN ('PENDING', 'IN_PROGRESS', 'FAILED')),
            retry_count INTEGER NOT NULL DEFAULT 0,
            next_retry_at INTEGER NOT NULL DEFAULT 0,
            last_error TEXT,
            failed_at INTEGER,
            lifetime_reset_at INTEGER NOT NULL,
            dest_calendar_id TEXT,
            created_at INTEGER NOT NULL,

            FOREIGN KEY (event_id) REFERENCES events (id) ON DELETE CASCADE
        )
    "#,
    )
    .execute(&mut *tx)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS scheduled_reminders (
            id TEXT PRIMARY KEY,
            event_id TEXT NOT NULL,
            occurrence_time INTEGER NOT NULL,
            trigger_time INTEGER NOT NULL,
            reminder_offset TEXT NOT NULL,
            status TEXT NOT NULL DEFAULT 'PENDING' CHECK (status IN ('PENDING', 'FIRED', 'SNOOZED', 'DISMISSED')),
            snooze_count INTEGER NOT NULL DEFAULT 0,
            event_title TEXT NOT NULL DEFAULT '',
            event_location TEXT,
            is_all_day INTEGER NOT NULL DEFAULT 0,
            calendar_color INTEGER NOT NULL DEFAULT 0,

            FOREIGN KEY (event_id) REFERENCES events (id) ON DELETE CASCADE,
            UNIQUE(event_id, occurrence_time, reminder_offset)
        )
    "#,
    )
    .execute(&mut *tx)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS ics_subscriptions (
            id TEXT PRIMARY KEY,
            url TEXT NOT NULL,
            name TEXT NOT NULL,
            color INTEGER NOT NULL DEFAULT 0,
            calendar_id TEXT NOT NULL UNIQUE,
            last_sync INTEGER NOT NULL DEFAULT 0,
            sync_interval_hours INTEGER NOT NULL DEFAULT 24,
            enabled INTEGER NOT NULL DEFAULT 1,
            etag TEXT,
            last_modified TEXT,
            username TEXT,
            last_error TEXT,
            created_at INTEGER NOT NULL,

            FOREIGN KEY (calendar_id) REFERENCES calendars (id) ON DELETE CASCADE
        )
    "#,
    )
    .execute(&mut *tx)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS sync_log (
            id TEXT PRIMARY KEY,
            timestamp INTEGER NOT NULL,
            calendar_id TEXT,
            event_uid TEXT,
            result TEXT NOT NULL CHECK (result IN ('SUCCESS', 'ERROR_401', 'ERROR_403', 'ERROR_404', 'ERROR_412', 'ERROR_5XX', 'ERROR_NETWORK', 'ERROR_OTHER')),
            message TEXT
        )
    "#,
    )
    .execute(&mut *tx)
    .await?;

    sqlx::query(
        r#"
        CREATE VIRTUAL TABLE IF NOT EXISTS events_fts USING fts5(
            title, location, description,
            content='events', content_rowid='rowid'
        )
    "#,
    )
    .execute(&mut *tx)
    .await?;

    // Triggers keep the FTS index in lockstep with event writes.
    sqlx::query(
        r#"
        CREATE TRIGGER IF NOT EXISTS events_fts_ai AFTER INSERT ON events BEGIN
            INSERT INTO events_fts(rowid, title, location, description)
            VALUES (new.rowid, new.title, coalesce(new.location, ''), coalesce(new.description, ''));
        END
    "#,
    )
    .execute(&mut *tx)
    .await?;
    sqlx::query(
        r#"
        CREATE TRIGGER IF NOT EXISTS events_fts_ad AFTER DELETE ON events BEGIN
            INSERT INTO events_fts(events_fts, rowid, title, location, description)
            VALUES ('delete', old.rowid, old.title, coalesce(old.location, ''), coalesce(old.description, ''));
        END
    "#,
    )
    .execute(&mut *tx)
    .await?;
    sqlx::query(
        r#"
        CREATE TRIGGER IF NOT EXISTS events_fts_au AFTER UPDATE ON events BEGIN
            INSERT INTO events_fts(events_fts, rowid, title, location, description)
            VALUES ('delete', old.rowid, old.title, coalesce(old.location, ''), coalesce(old.description, ''));
            INSERT INTO events_fts(rowid, title, location, description)
            VALUES (new.rowid, new.title, coalesce(new.location, ''), coalesce(new.description, ''));
        END
    "#,
    )
    .execute(&mut *tx)
    .await?;

    create_indexes(&mut tx).await?;
    tx.commit().await?;
    Ok(())
}

async fn create_indexes(tx: &mut sqlx::Transaction<'_, sqlx::Sqlite>) -> CalendarResult<()> {
    let indexes = [
        "CREATE INDEX IF NOT EXISTS idx_calendars_account_id ON calendars (account_id)",
        "CREATE INDEX IF NOT EXISTS idx_events_calendar_id ON events (calendar_id)",
        "CREATE INDEX IF NOT EXISTS idx_events_uid ON events (uid, calendar_id)",
        "CREATE INDEX IF NOT EXISTS idx_events_original ON events (original_event_id)",
        "CREATE INDEX IF NOT EXISTS idx_events_caldav_url ON events (caldav_url)",
        "CREATE INDEX IF NOT EXISTS idx_events_sync_status ON events (sync_status)",
        "CREATE INDEX IF NOT EXISTS idx_occurrences_event ON occurrences (event_id)",
        "CREATE INDEX IF NOT EXISTS idx_occurrences_range ON occurrences (start_ts, end_ts)",
        "CREATE INDEX IF NOT EXISTS idx_occurrences_days ON occurrences (start_day, end_day)",
        "CREATE INDEX IF NOT EXISTS idx_occurrences_calendar ON occurrences (calendar_id)",
        "CREATE INDEX IF NOT EXISTS idx_pending_ops_ready ON pending_operations (status, next_retry_at)",
        "CREATE INDEX IF NOT EXISTS idx_pending_ops_event ON pending_operations (event_id)",
        "CREATE INDEX IF NOT EXISTS idx_reminders_trigger ON scheduled_reminders (status, trigger_time)",
        "CREATE INDEX IF NOT EXISTS idx_reminders_event ON scheduled_reminders (event_id)",
        "CREATE INDEX IF NOT EXISTS idx_sync_log_time ON sync_log (timestamp)",
        "CREATE INDEX IF NOT EXISTS idx_sync_log_calendar ON sync_log (calendar_id)",
    ];
    for sql in indexes {
        sqlx::query(sql).execute(&mut **tx).await?;
    }
    Ok(())
}
