/*!
 * Conflict Resolution
 *
 * Runs when a conditional PUT/DELETE returns 412, or when a pull observes a
 * server sequence above a locally queued update. Policy: server wins on
 * metadata, local wins on user-visible content, realized as a three-way
 * merge over base (the last SYNCED blob), local (the current entity) and
 * remote (the freshly fetched resource).
 */

use tokio_util::sync::CancellationToken;

use crate::caldav::{CalDavClient, RemoteEvent};
use crate::error::{CalendarError, CalendarResult, ErrorKind};
use crate::ics::{self, ParsedEvent};
use crate::occurrence::OccurrenceIndex;
use crate::store::{events, operations, sync_log, Store};
use crate::sync::pull::{build_row_from_remote, log_entry};
use crate::types::{Event, SyncLogResult, SyncStatus};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConflictResolution {
    /// Remote accepted wholesale; the queued operation was dropped.
    AcceptedRemote,
    /// Local user edits re-applied on top of the remote version; the update
    /// was requeued with the remote etag and a higher sequence.
    Rebased,
    /// The remote resource no longer exists; the caller promotes the queued
    /// update to a create.
    RemoteGone,
}

/// The user-visible projection the merge compares.
#[derive(Debug, PartialEq, Eq)]
struct VisibleFields {
    title: String,
    location: Option<String>,
    description: Option<String>,
    start_ts: i64,
    end_ts: i64,
    rrule: Option<String>,
    reminders: Vec<String>,
}

impl VisibleFields {
    fn of_event(event: &Event) -> Self {
        Self {
            title: event.title.clone(),
            location: event.location.clone(),
            description: event.description.clone(),
            start_ts: event.start_ts,
            end_ts: event.end_ts,
            rrule: event.rrule.clone(),
            reminders: event.reminders.clone(),
        }
    }

    fn of_parsed(parsed: &ParsedEvent) -> Self {
        Self {
            title: parsed.title.clone(),
            location: parsed.location.clone(),
            description: parsed.description.clone(),
            start_ts: parsed.start_ts,
            end_ts: parsed.end_ts,
            rrule: parsed.rrule.clone(),
            reminders: parsed.reminders(),
        }
    }
}

pub struct ConflictResolver<'a> {
    pub store: &'a Store,
    pub client: &'a CalDavClient,
    pub index: &'a OccurrenceIndex,
}

impl<'a> ConflictResolver<'a> {
    /// Resolves a conflict for `event`, using `prefetched` when the pull
    /// already has the remote payload in hand.
    pub async fn resolve(
        &self,
        event: &Event,
        now_ms: i64,
        prefetched: Option<RemoteEvent>,
        cancel: &CancellationToken,
    ) -> CalendarResult<ConflictResolution> {
        let remote = match prefetched {
            Some(remote) => remote,
            None => {
                let url = event.caldav_url.as_deref().ok_or_else(|| {
                    CalendarError::other("conflicted event has no server URL")
                })?;
                match self.client.fetch_event(url, cancel).await {
                    Ok(remote) => remote,
                    Err(err) if err.kind() == ErrorKind::NotFound => {
                        return Ok(ConflictResolution::RemoteGone);
                    }
                    Err(err) => return Err(err),
                }
            }
        };

        let remote_parsed = select_matching(&remote, event)?;
        let local_fields = VisibleFields::of_event(event);
        let remote_fields = VisibleFields::of_parsed(&remote_parsed);

        // 1. Identical user-visible content: the 412 was about metadata
        //    only, so the remote version is simply adopted.
        // 2. No local user edits since base: same outcome.
        let accept_remote = local_fields == remote_fields
            || self
                .base_fields(event)
                .map(|base| base == local_fields)
                .unwrap_or(false);

        let resolution = if accept_remote {
            self.accept_remote(event, &remote_parsed, &remote, now_ms).await?;
            ConflictResolution::AcceptedRemote
        } else {
            self.rebase(event, &remote_parsed, &remote, now_ms).await?;
            ConflictResolution::Rebased
        };

        tracing::info!(
            "Resolved conflict on {} as {:?}",
            event.uid,
            resolution
        );
        Ok(resolution)
    }

    /// User-visible fields of the last SYNCED blob, when one exists and
    /// still parses.
    fn base_fields(&self, event: &Event) -> Option<VisibleFields> {
        let raw = event.raw_ical.as_deref()?;
        let parsed = ics::parse_events(raw).ok()?;
        let base = parsed.into_iter().find(|p| {
            p.uid == event.uid && p.recurrence_id == event.original_instance_time
        })?;
        Some(VisibleFields::of_parsed(&base))
    }

    async fn accept_remote(
        &self,
        event: &Event,
        remote_parsed: &ParsedEvent,
        remote: &RemoteEvent,
        now_ms: i64,
    ) -> CalendarResult<()> {
        let event = event.clone();
        let remote_parsed = remote_parsed.clone();
        let remote = remote.clone();
        let index = self.index.clone();
        self.store
            .tx(move |ctx| {
                Box::pin(async move {
                    let row = build_row_from_remote(
                        Some(&event),
                        &remote_parsed,
                        &remote,
                        &event.calendar_id,
                        event.original_event_id.clone(),
                    );
                    events::upsert(ctx, &row).await?;
                    operations::delete_for_event(ctx, &event.id).await?;
                    let regen_target = event
                        .original_event_id
                        .as_deref()
                        .unwrap_or(event.id.as_str())
                        .to_string();
                    index.regenerate_for(ctx, &regen_target, now_ms).await?;
                    sync_log::append(
                        ctx,
                        &log_entry(
                            &event.calendar_id,
                            Some(&event.uid),
                            SyncLogResult::Error412,
                            "conflict resolved: accepted remote",
                            now_ms,
                        ),
                    )
                    .await
                })
            })
            .await
    }

    /// Re-applies local user-visible fields on top of the remote blob: the
    /// entity keeps its edits, adopts the remote etag and raw body, and its
    /// sequence is raised so the next patch emits one above the remote's.
    async fn rebase(
        &self,
        event: &Event,
        remote_parsed: &ParsedEvent,
        remote: &RemoteEvent,
        now_ms: i64,
    ) -> CalendarResult<()> {
        let mut rebased = event.clone();
        rebased.raw_ical = Some(remote.ical_data.clone());
        rebased.etag = remote.etag.clone();
        rebased.sequence = event.sequence.max(remote_parsed.sequence);
        rebased.sync_status = SyncStatus::PendingUpdate;
        rebased.local_modified_at = Some(now_ms);

        self.store
            .tx(move |ctx| {
                Box::pin(async move {
                    events::upsert(ctx, &rebased).await?;
                    // Requeue the update for an immediate retry with the
                    // fresh etag.
                    for op in operations::list_for_event(ctx.conn(), &rebased.id).await? {
                        operations::requeue(
                            ctx,
                            &op.id,
                            op.retry_count,
                            now_ms,
                            "rebased onto remote after 412",
                        )
                        .await?;
                    }
                    sync_log::append(
                        ctx,
                        &log_entry(
                            &rebased.calendar_id,
                            Some(&rebased.uid),
                            SyncLogResult::Error412,
                            "conflict resolved: rebased local edits",
                            now_ms,
                        ),
                    )
                    .await
                })
            })
            .await
    }
}

/// Picks the VEVENT matching the conflicted entity out of the fetched
/// resource (a series resource carries the master and all exceptions).
fn select_matching(remote: &RemoteEvent, event: &Event) -> CalendarResult<ParsedEvent> {
    let parsed = ics::parse_events(&remote.ical_data)?;
    parsed
        .iter()
        .find(|p| p.recurrence_id == event.original_instance_time)
        .or_else(|| parsed.iter().find(|p| p.recurrence_id.is_none()))
        .cloned()
        .ok_or_else(|| CalendarError::malformed("ics", "remote resource holds no VEVENT"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::EventStatus;

    fn local_event() -> Event {
        Event {
            id: "e1".into(),
            uid: "uid-1".into(),
            import_id: "uid-1".into(),
            calendar_id: "c1".into(),
            title: "Local".into(),
            location: None,
            description: None,
            start_ts: 1_000_000,
            end_ts: 2_000_000,
            timezone: None,
            is_all_day: false,
            status: EventStatus::Confirmed,
            transp: "OPAQUE".into(),
            classification: "PUBLIC".into(),
            organizer_email: None,
            organizer_name: None,
            rrule: None,
            rdate: None,
            exdate: None,
            duration: None,
            original_event_id: None,
            original_instance_time: None,
            reminders: vec!["-PT10M".into()],
            extra_properties: Default::default(),
            raw_ical: None,
            dtstamp: 0,
            caldav_url: Some("https://s/cal/1/e1.ics".into()),
            etag: Some("old".into()),
            sequence: 2,
            sync_status: SyncStatus::PendingUpdate,
            last_sync_error: None,
            sync_retry_count: 0,
            parser_version: ics::PARSER_VERSION,
            local_modified_at: None,
            server_modified_at: None,
        }
    }

    #[test]
    fn test_visible_fields_comparison() {
        let event = local_event();
        let same = VisibleFields::of_event(&event);
        assert_eq!(VisibleFields::of_event(&event), same);

        let mut edited = event.clone();
        edited.title = "Other".into();
        assert_ne!(VisibleFields::of_event(&event), VisibleFields::of_event(&edited));
    }

    #[test]
    fn test_select_matching_prefers_recurrence_id() {
        let blob = "BEGIN:VCALENDAR\r\nBEGIN:VEVENT\r\nUID:uid-1\r\nDTSTART:20250101T100000Z\r\nSUMMARY:Master\r\nRRULE:FREQ=DAILY\r\nEND:VEVENT\r\nBEGIN:VEVENT\r\nUID:uid-1\r\nRECURRENCE-ID:20250102T100000Z\r\nDTSTART:20250102T110000Z\r\nSUMMARY:Exception\r\nEND:VEVENT\r\nEND:VCALENDAR\r\n";
        let remote = RemoteEvent {
            href: "/cal/1/e1.ics".into(),
            url: "https://s/cal/1/e1.ics".into(),
            etag: Some("new".into()),
            ical_data: blob.into(),
        };

        let master = local_event();
        let selected = select_matching(&remote, &master).unwrap();
        assert_eq!(selected.title, "Master");

        let mut exception = local_event();
        exception.original_event_id = Some("e0".into());
        exception.original_instance_time =
            crate::ics::parse::parse_instant("20250102T100000Z", None).map(|i| i.ts_ms);
        let selected = select_matching(&remote, &exception).unwrap();
        assert_eq!(selected.title, "Exception");
    }
}
