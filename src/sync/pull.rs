/*!
 * Pull Strategy
 *
 * Reconciles local event rows with the server collection using the cheapest
 * correct change detection: ctag short-circuit, then RFC 6578 sync-token
 * increments, then an ETag diff over the horizon, then a full range fetch.
 * The apply pass for a calendar runs in one store transaction so a
 * cancellation can never leave occurrences detached from their events.
 */

use std::collections::HashSet;

use tokio_util::sync::CancellationToken;
use url::Url;
use uuid::Uuid;

use crate::caldav::{CalDavClient, RemoteEvent};
use crate::config::CoreConfig;
use crate::error::{CalendarError, CalendarResult, ErrorKind};
use crate::ics::{self, ParsedEvent};
use crate::occurrence::OccurrenceIndex;
use crate::store::{calendars, events, sync_log, Store, StoreTx};
use crate::types::{Calendar, Event, SyncCounts, SyncLogEntry, SyncLogResult, SyncStatus};

/// A pulled server event that collides with a queued local update; handed to
/// the conflict resolver after the apply pass.
#[derive(Debug, Clone)]
pub struct PullConflict {
    pub event_id: String,
    pub remote: RemoteEvent,
}

#[derive(Debug, Default)]
pub struct PullOutcome {
    pub counts: SyncCounts,
    pub conflicts: Vec<PullConflict>,
}

pub struct PullStrategy<'a> {
    pub store: &'a Store,
    pub client: &'a CalDavClient,
    pub index: &'a OccurrenceIndex,
    pub config: &'a CoreConfig,
}

impl<'a> PullStrategy<'a> {
    pub async fn pull_calendar(
        &self,
        calendar: &Calendar,
        force_full: bool,
        now_ms: i64,
        cancel: &CancellationToken,
    ) -> CalendarResult<PullOutcome> {
        // Cheapest check first: an unchanged ctag means an unchanged
        // collection.
        let remote_ctag = self.client.get_ctag(&calendar.caldav_url, cancel).await?;
        if !force_full {
            if let (Some(local), Some(remote)) = (calendar.ctag.as_deref(), remote_ctag.as_deref())
            {
                if local == remote {
                    tracing::debug!("ctag unchanged for {}; skipping pull", calendar.display_name);
                    return Ok(PullOutcome::default());
                }
            }
        }

        if !force_full {
            if let Some(token) = calendar.sync_token.clone() {
                match self
                    .pull_with_sync_token(calendar, &token, remote_ctag.as_deref(), now_ms, cancel)
                    .await
                {
                    Ok(outcome) => return Ok(outcome),
                    Err(err) if err.kind() == ErrorKind::SyncTokenInvalid => {
                        tracing::info!(
                            "Sync token expired for {}; falling back to ETag diff",
                            calendar.display_name
                        );
                        self.clear_sync_token(&calendar.id).await?;
                    }
                    Err(err) => return Err(err),
                }
            }
        }

        self.pull_with_etag_diff(calendar, remote_ctag.as_deref(), force_full, now_ms, cancel)
            .await
    }

    // ---- sync-collection path ------------------------------------------

    async fn pull_with_sync_token(
        &self,
        calendar: &Calendar,
        token: &str,
        remote_ctag: Option<&str>,
        now_ms: i64,
        cancel: &CancellationToken,
    ) -> CalendarResult<PullOutcome> {
        let mut token = token.to_string();
        let mut fetched: Vec<RemoteEvent> = Vec::new();
        let mut deleted_hrefs: Vec<String> = Vec::new();

        // A truncated (507) report hands back a fresh token to continue
        // from; loop until the server reports a complete window.
        loop {
            if cancel.is_cancelled() {
                return Err(CalendarError::Cancelled);
            }
            let report = self
                .client
                .sync_collection(&calendar.caldav_url, Some(&token), cancel)
                .await?;

            let changed_hrefs: Vec<String> =
                report.changed.iter().map(|(href, _)| href.clone()).collect();
            for chunk in changed_hrefs.chunks(self.config.multiget_chunk_size) {
                let batch = self
                    .client
                    .fetch_events_by_href(&calendar.caldav_url, chunk, cancel)
                    .await?;
                fetched.extend(batch);
            }
            deleted_hrefs.extend(report.deleted.clone());

            match report.new_token {
                Some(new_token) => token = new_token,
                None => {
                    // A server that stops returning tokens forces the diff
                    // path on the next run.
                    tracing::warn!(
                        "sync-collection for {} returned no fresh token",
                        calendar.display_name
                    );
                }
            }
            if !report.truncated {
                break;
            }
        }

        self.apply(
            calendar,
            fetched,
            Some(deleted_hrefs),
            remote_ctag,
            Some(token),
            now_ms,
        )
        .await
    }

    // ---- ETag diff / full fetch path -----------------------------------

    async fn pull_with_etag_diff(
        &self,
        calendar: &Calendar,
        remote_ctag: Option<&str>,
        force_full: bool,
        now_ms: i64,
        cancel: &CancellationToken,
    ) -> CalendarResult<PullOutcome> {
        let range_start = now_ms - self.config.horizon_past_ms();
        let range_end = now_ms + self.config.horizon_future_ms();

        let local_rows = events::sync_rows_for_calendar(self.store.pool(), &calendar.id).await?;

        let (fetched, server_paths) = if force_full || local_rows.is_empty() {
            // Initial sync: fetch everything in range outright.
            let fetched = self
                .client
                .fetch_events_in_range(&calendar.caldav_url, range_start, range_end, cancel)
                .await?;
            let paths: HashSet<String> = fetched.iter().map(|e| href_path(&e.href)).collect();
            (fetched, paths)
        } else {
            let server_etags = self
                .client
                .fetch_etags_in_range(&calendar.caldav_url, range_start, range_end, cancel)
                .await?;
            let mut paths = HashSet::new();
            let mut to_fetch: Vec<String> = Vec::new();
            for (href, etag) in &server_etags {
                let path = href_path(href);
                paths.insert(path.clone());
                let known = local_rows.iter().find(|row| {
                    row.caldav_url
                        .as_deref()
                        .map(|u| href_path(u) == path)
                        .unwrap_or(false)
                });
                let needs_fetch = match known {
                    None => true,
                    Some(row) => {
                        row.etag.as_deref() != etag.as_deref()
                            || self.needs_reparse(&row.id).await?
                    }
                };
                if needs_fetch {
                    to_fetch.push(href.clone());
                }
            }
            let mut fetched = Vec::new();
            for chunk in to_fetch.chunks(self.config.multiget_chunk_size) {
                let batch = self
                    .client
                    .fetch_events_by_href(&calendar.caldav_url, chunk, cancel)
                    .await?;
                fetched.extend(batch);
            }
            (fetched, paths)
        };

        // Local SYNCED rows absent from the server window are deletions;
        // PENDING_* rows are never touched by reconciliation.
        let deleted: Vec<String> = local_rows
            .iter()
            .filter(|row| row.sync_status == SyncStatus::Synced && !row.is_exception)
            .filter_map(|row| row.caldav_url.clone())
            .filter(|url| !server_paths.contains(&href_path(url)))
            .collect();

        let outcome = self
            .apply(calendar, fetched, Some(deleted), remote_ctag, None, now_ms)
            .await?;

        // Re-seed the incremental cursor when the server supports it.
        if let Ok(Some(token)) = self.client.get_sync_token(&calendar.caldav_url, cancel).await {
            let calendar_id = calendar.id.clone();
            let ctag_owned = remote_ctag.map(|s| s.to_string());
            self.store
                .tx(move |ctx| {
                    Box::pin(async move {
                        calendars::update_sync_cursors(
                            ctx,
                            &calendar_id,
                            ctag_owned.as_deref(),
                            Some(&token),
                        )
                        .await
                    })
                })
                .await?;
        }
        Ok(outcome)
    }

    /// Whether the stored row was written by an older codec and must be
    /// re-parsed even though its etag matches.
    async fn needs_reparse(&self, event_id: &str) -> CalendarResult<bool> {
        let event = events::fetch_by_id(self.store.pool(), event_id).await?;
        Ok(event
            .map(|e| e.parser_version != ics::PARSER_VERSION)
            .unwrap_or(false))
    }

    async fn clear_sync_token(&self, calendar_id: &str) -> CalendarResult<()> {
        let id = calendar_id.to_string();
        self.store
            .tx(move |ctx| Box::pin(async move { calendars::clear_sync_token(ctx, &id).await }))
            .await
    }

    // ---- apply ---------------------------------------------------------

    /// Applies fetched payloads and deletions in one transaction, then
    /// regenerates occurrences for every touched master and records the
    /// outcome in the sync log.
    async fn apply(
        &self,
        calendar: &Calendar,
        fetched: Vec<RemoteEvent>,
        deleted_hrefs: Option<Vec<String>>,
        remote_ctag: Option<&str>,
        new_sync_token: Option<String>,
        now_ms: i64,
    ) -> CalendarResult<PullOutcome> {
        let calendar = calendar.clone();
        let index = self.index.clone();
        let ctag_owned = remote_ctag.map(|s| s.to_string());

        self.store
            .tx(move |ctx| {
                Box::pin(async move {
                    let mut counts = SyncCounts::default();
                    let mut conflicts = Vec::new();
                    let mut touched_masters: HashSet<String> = HashSet::new();

                    // Parse every payload up front, then apply masters across
                    // the whole batch before any exception. Servers split a
                    // series over resources however they like; the fetch
                    // order must not decide whether an exception finds its
                    // master.
                    let mut payloads: Vec<(ParsedEvent, &RemoteEvent)> = Vec::new();
                    for remote in &fetched {
                        match ics::parse_events(&remote.ical_data) {
                            Ok(parsed) => {
                                for event in parsed {
                                    payloads.push((event, remote));
                                }
                            }
                            Err(err) => {
                                tracing::warn!("Unparseable payload at {}: {}", remote.url, err);
                                sync_log::append(
                                    ctx,
                                    &log_entry(&calendar.id, None, SyncLogResult::ErrorOther, &err.to_string(), now_ms),
                                )
                                .await?;
                            }
                        }
                    }
                    payloads.sort_by_key(|(event, _)| event.recurrence_id.is_some());
                    for (event, remote) in &payloads {
                        apply_one(
                            ctx,
                            &index,
                            &calendar,
                            event,
                            remote,
                            now_ms,
                            &mut counts,
                            &mut conflicts,
                            &mut touched_masters,
                        )
                        .await?;
                    }

                    if let Some(hrefs) = &deleted_hrefs {
                        for href in hrefs {
                            counts.deleted +=
                                delete_by_href(ctx, &calendar.id, href).await? as u32;
                        }
                    }

                    for master_id in &touched_masters {
                        index.regenerate_for(ctx, master_id, now_ms).await?;
                    }

                    calendars::update_sync_cursors(
                        ctx,
                        &calendar.id,
                        ctag_owned.as_deref(),
                        new_sync_token.as_deref().or(calendar.sync_token.as_deref()),
                    )
                    .await?;

                    sync_log::append(
                        ctx,
                        &log_entry(
                            &calendar.id,
                            None,
                            SyncLogResult::Success,
                            &format!(
                                "pull applied: {} added, {} updated, {} deleted",
                                counts.added, counts.updated, counts.deleted
                            ),
                            now_ms,
                        ),
                    )
                    .await?;

                    Ok(PullOutcome { counts, conflicts })
                })
            })
            .await
    }
}

#[allow(clippy::too_many_arguments)]
async fn apply_one(
    ctx: &mut StoreTx,
    index: &OccurrenceIndex,
    calendar: &Calendar,
    parsed: &ParsedEvent,
    remote: &RemoteEvent,
    now_ms: i64,
    counts: &mut SyncCounts,
    conflicts: &mut Vec<PullConflict>,
    touched_masters: &mut HashSet<String>,
) -> CalendarResult<()> {
    // Both fallbacks are scoped to their row shape: a master and its
    // exceptions share the uid-derived import_id, and an unscoped match
    // would pair the incoming payload with the wrong row and overwrite it.
    let existing = match parsed.recurrence_id {
        None => match events::find_master(ctx.conn(), &calendar.id, &parsed.uid).await? {
            Some(event) => Some(event),
            None => {
                events::find_master_by_import_id(ctx.conn(), &calendar.id, &parsed.uid).await?
            }
        },
        Some(instance) => {
            match events::find_exception(ctx.conn(), &calendar.id, &parsed.uid, instance).await? {
                Some(event) => Some(event),
                None => {
                    events::find_exception_by_import_id(
                        ctx.conn(),
                        &calendar.id,
                        &parsed.uid,
                        instance,
                    )
                    .await?
                }
            }
        }
    };

    if let Some(existing) = &existing {
        // Local pending edits are never clobbered by a pull. A remote row
        // with a higher sequence than a queued update is a conflict for the
        // resolver; everything else waits for the push to succeed or
        // conflict on its own.
        if existing.sync_status != SyncStatus::Synced {
            if existing.sync_status == SyncStatus::PendingUpdate
                && parsed.sequence > existing.sequence
            {
                conflicts.push(PullConflict {
                    event_id: existing.id.clone(),
                    remote: remote.clone(),
                });
            }
            return Ok(());
        }
        let etag_unchanged = existing.etag.as_deref() == remote.etag.as_deref()
            && remote.etag.is_some();
        if etag_unchanged && existing.parser_version == ics::PARSER_VERSION {
            return Ok(());
        }
    }

    let master_link = match parsed.recurrence_id {
        None => None,
        Some(_) => events::find_master(ctx.conn(), &calendar.id, &parsed.uid)
            .await?
            .map(|m| m.id),
    };
    if parsed.recurrence_id.is_some() && master_link.is_none() {
        tracing::warn!(
            "Exception {} has no master in calendar {}; storing standalone",
            parsed.uid,
            calendar.display_name
        );
    }

    let is_update = existing.is_some();
    let row = build_row_from_remote(
        existing.as_ref(),
        parsed,
        remote,
        &calendar.id,
        master_link.clone(),
    );
    let id = row.id.clone();
    events::upsert(ctx, &row).await?;

    match &master_link {
        Some(master_id) => {
            touched_masters.insert(master_id.clone());
            index.attach_exception(ctx, &row).await?;
        }
        None => {
            touched_masters.insert(id);
        }
    }

    if is_update {
        counts.updated += 1;
    } else {
        counts.added += 1;
    }
    Ok(())
}

/// Deletes the local rows living at a server href. Returns how many event
/// rows went away. Only SYNCED rows qualify; queued local changes survive.
async fn delete_by_href(
    ctx: &mut StoreTx,
    calendar_id: &str,
    href: &str,
) -> CalendarResult<u64> {
    let path = href_path(href);
    let rows = events::sync_rows_for_calendar(ctx.conn(), calendar_id).await?;
    let mut removed = 0;
    for row in rows {
        let matches = row
            .caldav_url
            .as_deref()
            .map(|u| href_path(u) == path)
            .unwrap_or(false);
        if matches && row.sync_status == SyncStatus::Synced {
            events::delete(ctx, &row.id).await?;
            removed += 1;
        }
    }
    Ok(removed)
}

/// Builds the store row for a server-authored payload, preserving identity
/// and local bookkeeping of an existing row.
pub(crate) fn build_row_from_remote(
    existing: Option<&Event>,
    parsed: &ParsedEvent,
    remote: &RemoteEvent,
    calendar_id: &str,
    master_link: Option<String>,
) -> Event {
    Event {
        id: existing
            .map(|e| e.id.clone())
            .unwrap_or_else(|| Uuid::new_v4().to_string()),
        uid: parsed.uid.clone(),
        import_id: existing
            .map(|e| e.import_id.clone())
            .unwrap_or_else(|| parsed.uid.clone()),
        calendar_id: calendar_id.to_string(),
        title: parsed.title.clone(),
        location: parsed.location.clone(),
        description: parsed.description.clone(),
        start_ts: parsed.start_ts,
        end_ts: parsed.end_ts,
        timezone: parsed.timezone.clone(),
        is_all_day: parsed.is_all_day,
        status: parsed.status,
        transp: parsed.transp.clone(),
        classification: parsed.classification.clone(),
        organizer_email: parsed.organizer_email.clone(),
        organizer_name: parsed.organizer_name.clone(),
        rrule: parsed.rrule.clone(),
        rdate: parsed.rdate.clone(),
        exdate: parsed.exdate.clone(),
        duration: parsed.duration.clone(),
        original_event_id: master_link.clone(),
        original_instance_time: if master_link.is_some() {
            parsed.recurrence_id
        } else {
            None
        },
        reminders: parsed.reminders(),
        extra_properties: parsed.x_properties.clone(),
        raw_ical: Some(remote.ical_data.clone()),
        dtstamp: parsed.dtstamp,
        caldav_url: Some(remote.url.clone()),
        etag: remote.etag.clone(),
        sequence: parsed.sequence,
        sync_status: SyncStatus::Synced,
        last_sync_error: None,
        sync_retry_count: 0,
        parser_version: ics::PARSER_VERSION,
        local_modified_at: existing.and_then(|e| e.local_modified_at),
        server_modified_at: parsed.last_modified.or(Some(parsed.dtstamp)),
    }
}

/// Normalizes an href or absolute URL to its decoded path for comparison.
fn href_path(href: &str) -> String {
    if let Ok(url) = Url::parse(href) {
        return url.path().to_string();
    }
    match href.split_once('?') {
        Some((path, _)) => path.to_string(),
        None => href.to_string(),
    }
}

pub(crate) fn log_entry(
    calendar_id: &str,
    event_uid: Option<&str>,
    result: SyncLogResult,
    message: &str,
    now_ms: i64,
) -> SyncLogEntry {
    SyncLogEntry {
        id: Uuid::new_v4().to_string(),
        timestamp: now_ms,
        calendar_id: Some(calendar_id.to_string()),
        event_uid: event_uid.map(|s| s.to_string()),
        result,
        message: Some(message.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{accounts, occurrences, Store};
    use crate::time::day_code_to_utc_midnight_ms;
    use crate::types::{Account, Provider};

    #[test]
    fn test_href_path_normalization() {
        assert_eq!(href_path("/cal/1/e.ics"), "/cal/1/e.ics");
        assert_eq!(
            href_path("https://caldav.example.com/cal/1/e.ics"),
            "/cal/1/e.ics"
        );
        assert_eq!(href_path("/cal/1/e.ics?x=1"), "/cal/1/e.ics");
    }

    async fn seeded_store() -> (Store, Calendar) {
        let store = Store::open_in_memory().await.unwrap();
        let calendar = Calendar {
            id: "c1".into(),
            account_id: "a1".into(),
            caldav_url: "https://s/cal/1/".into(),
            display_name: "Main".into(),
            color: 0,
            ctag: None,
            sync_token: None,
            is_visible: true,
            is_default: true,
            is_read_only: false,
            sort_order: 0,
        };
        let seed = calendar.clone();
        store
            .tx(move |ctx| {
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
                    .await?;
                    calendars::insert(ctx, &seed).await
                })
            })
            .await
            .unwrap();
        (store, calendar)
    }

    /// Mirrors the apply stage: parse everything, masters across the whole
    /// batch before any exception, then regenerate touched masters.
    async fn apply_batch(
        store: &Store,
        index: &OccurrenceIndex,
        calendar: &Calendar,
        batch: Vec<RemoteEvent>,
        now_ms: i64,
    ) -> SyncCounts {
        let calendar = calendar.clone();
        let index = index.clone();
        store
            .tx(move |ctx| {
                Box::pin(async move {
                    let mut counts = SyncCounts::default();
                    let mut conflicts = Vec::new();
                    let mut touched: HashSet<String> = HashSet::new();
                    let mut payloads: Vec<(ParsedEvent, &RemoteEvent)> = Vec::new();
                    for remote in &batch {
                        for event in ics::parse_events(&remote.ical_data)? {
                            payloads.push((event, remote));
                        }
                    }
                    payloads.sort_by_key(|(event, _)| event.recurrence_id.is_some());
                    for (event, remote) in &payloads {
                        apply_one(
                            ctx,
                            &index,
                            &calendar,
                            event,
                            remote,
                            now_ms,
                            &mut counts,
                            &mut conflicts,
                            &mut touched,
                        )
                        .await?;
                    }
                    for master_id in &touched {
                        index.regenerate_for(ctx, master_id, now_ms).await?;
                    }
                    Ok(counts)
                })
            })
            .await
            .unwrap()
    }

    const SERIES_BLOB: &str = "BEGIN:VCALENDAR\r\nVERSION:2.0\r\nBEGIN:VEVENT\r\nUID:series-1\r\nDTSTAMP:20250520T000000Z\r\nDTSTART:20250601T090000Z\r\nDTEND:20250601T093000Z\r\nRRULE:FREQ=DAILY;COUNT=5\r\nSUMMARY:Series\r\nEND:VEVENT\r\nBEGIN:VEVENT\r\nUID:series-1\r\nRECURRENCE-ID:20250603T090000Z\r\nDTSTART:20250603T110000Z\r\nDTEND:20250603T113000Z\r\nSUMMARY:Moved instance\r\nEND:VEVENT\r\nEND:VCALENDAR\r\n";

    const MASTER_BLOB: &str = "BEGIN:VCALENDAR\r\nVERSION:2.0\r\nBEGIN:VEVENT\r\nUID:series-1\r\nDTSTAMP:20250520T000000Z\r\nDTSTART:20250601T090000Z\r\nDTEND:20250601T093000Z\r\nRRULE:FREQ=DAILY;COUNT=5\r\nSUMMARY:Series\r\nEND:VEVENT\r\nEND:VCALENDAR\r\n";

    const EXCEPTION_BLOB: &str = "BEGIN:VCALENDAR\r\nVERSION:2.0\r\nBEGIN:VEVENT\r\nUID:series-1\r\nDTSTAMP:20250520T000000Z\r\nRECURRENCE-ID:20250603T090000Z\r\nDTSTART:20250603T110000Z\r\nDTEND:20250603T113000Z\r\nSUMMARY:Moved instance\r\nEND:VEVENT\r\nEND:VCALENDAR\r\n";

    fn instance_ts() -> i64 {
        crate::ics::parse::parse_instant("20250603T090000Z", None)
            .unwrap()
            .ts_ms
    }

    /// Master and its override in one resource under one ETag: the normal
    /// CalDAV layout. Both rows must survive, distinctly, across repeated
    /// pulls of the unchanged resource.
    #[tokio::test]
    async fn test_shared_resource_pull_keeps_master_and_exception() {
        let (store, calendar) = seeded_store().await;
        let index = OccurrenceIndex::new(&CoreConfig::default());
        let now = day_code_to_utc_midnight_ms(20250601).unwrap();
        let resource = RemoteEvent {
            href: "/cal/1/series-1.ics".into(),
            url: "https://s/cal/1/series-1.ics".into(),
            etag: Some("r1".into()),
            ical_data: SERIES_BLOB.into(),
        };

        let counts = apply_batch(&store, &index, &calendar, vec![resource.clone()], now).await;
        assert_eq!(counts.added, 2);

        let master = events::find_master(store.pool(), "c1", "series-1")
            .await
            .unwrap()
            .expect("master row must exist");
        assert_eq!(master.title, "Series");
        assert_eq!(master.rrule.as_deref(), Some("FREQ=DAILY;COUNT=5"));
        assert!(master.original_event_id.is_none());

        let exception = events::find_exception(store.pool(), "c1", "series-1", instance_ts())
            .await
            .unwrap()
            .expect("exception row must exist");
        assert_ne!(exception.id, master.id);
        assert_eq!(exception.title, "Moved instance");
        assert_eq!(exception.original_event_id.as_deref(), Some(master.id.as_str()));
        assert_eq!(exception.original_instance_time, Some(instance_ts()));

        let occ = occurrences::fetch_by_event_and_start(store.pool(), &master.id, instance_ts())
            .await
            .unwrap()
            .expect("master occurrence at the overridden instance");
        assert_eq!(occ.exception_event_id.as_deref(), Some(exception.id.as_str()));

        // Unchanged resource on the next pull: nothing is dropped or
        // rewritten.
        let counts = apply_batch(&store, &index, &calendar, vec![resource], now).await;
        assert_eq!(counts.total(), 0);
        let master_again = events::find_master(store.pool(), "c1", "series-1")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(master_again.id, master.id);
        assert_eq!(master_again.rrule.as_deref(), Some("FREQ=DAILY;COUNT=5"));
        assert!(events::find_exception(store.pool(), "c1", "series-1", instance_ts())
            .await
            .unwrap()
            .is_some());
    }

    /// Master and override on distinct hrefs with distinct ETags, delivered
    /// exception-first: batch ordering must still apply the master before
    /// the override, and neither row may overwrite the other.
    #[tokio::test]
    async fn test_split_resource_pull_keeps_master_and_exception() {
        let (store, calendar) = seeded_store().await;
        let index = OccurrenceIndex::new(&CoreConfig::default());
        let now = day_code_to_utc_midnight_ms(20250601).unwrap();
        let master_resource = RemoteEvent {
            href: "/cal/1/series-1.ics".into(),
            url: "https://s/cal/1/series-1.ics".into(),
            etag: Some("a1".into()),
            ical_data: MASTER_BLOB.into(),
        };
        let exception_resource = RemoteEvent {
            href: "/cal/1/series-1-exc.ics".into(),
            url: "https://s/cal/1/series-1-exc.ics".into(),
            etag: Some("b1".into()),
            ical_data: EXCEPTION_BLOB.into(),
        };

        let counts = apply_batch(
            &store,
            &index,
            &calendar,
            vec![exception_resource.clone(), master_resource],
            now,
        )
        .await;
        assert_eq!(counts.added, 2);

        let master = events::find_master(store.pool(), "c1", "series-1")
            .await
            .unwrap()
            .expect("master row must exist");
        assert_eq!(master.title, "Series");
        assert_eq!(master.rrule.as_deref(), Some("FREQ=DAILY;COUNT=5"));
        assert_eq!(master.etag.as_deref(), Some("a1"));

        let exception = events::find_exception(store.pool(), "c1", "series-1", instance_ts())
            .await
            .unwrap()
            .expect("exception row must exist");
        assert_ne!(exception.id, master.id);
        assert_eq!(exception.etag.as_deref(), Some("b1"));
        assert_eq!(exception.original_event_id.as_deref(), Some(master.id.as_str()));
        assert_eq!(exception.original_instance_time, Some(instance_ts()));

        // Re-delivering only the exception resource (same ETag) must leave
        // the master untouched.
        let counts = apply_batch(&store, &index, &calendar, vec![exception_resource], now).await;
        assert_eq!(counts.total(), 0);
        let master_again = events::find_master(store.pool(), "c1", "series-1")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(master_again.id, master.id);
        assert!(master_again.original_event_id.is_none());
        assert_eq!(master_again.rrule.as_deref(), Some("FREQ=DAILY;COUNT=5"));
    }
}
