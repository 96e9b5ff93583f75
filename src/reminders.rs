/*!
 * Reminder Planning
 *
 * Derives scheduled-reminder rows from the occurrence index and each
 * event's reminder offsets, inside a lookahead window. The core only
 * maintains the rows; firing notifications is the embedder's job, driven by
 * `store::reminders::list_due`. Cancellation requests are returned to the
 * caller so external alarms can be torn down before rows disappear.
 */

use std::collections::{HashMap, HashSet};

use uuid::Uuid;

use crate::config::CoreConfig;
use crate::error::CalendarResult;
use crate::store::{calendars, events, occurrences, reminders, StoreTx};
use crate::time::parse_iso8601_duration;
use crate::types::{Event, ReminderStatus, ScheduledReminder, SyncStatus};

#[derive(Clone)]
pub struct ReminderPlanner {
    lookahead_ms: i64,
}

impl ReminderPlanner {
    pub fn new(config: &CoreConfig) -> Self {
        Self {
            lookahead_ms: config.reminder_lookahead_ms(),
        }
    }

    /// Rebuilds the reminder rows for every occurrence starting within the
    /// window. Existing rows keep their status; rows whose source vanished
    /// are pruned unless the user has already seen them (FIRED/SNOOZED).
    pub async fn refresh(&self, tx: &mut StoreTx, now_ms: i64) -> CalendarResult<()> {
        let window_end = now_ms + self.lookahead_ms;
        let window = occurrences::list_starting_in_window(tx.conn(), now_ms, window_end).await?;

        let mut event_cache: HashMap<String, Option<Event>> = HashMap::new();
        let mut color_cache: HashMap<String, i64> = HashMap::new();
        let mut desired: HashSet<(String, i64, String)> = HashSet::new();

        for occurrence in &window {
            let effective_id = occurrence
                .exception_event_id
                .as_deref()
                .unwrap_or(&occurrence.event_id)
                .to_string();

            let effective = match lookup_event(tx, &mut event_cache, &effective_id).await? {
                Some(event) => event,
                None => continue,
            };
            if effective.sync_status == SyncStatus::PendingDelete {
                continue;
            }

            // RFC 5545 inheritance: an exception without its own alarms
            // inherits the master's.
            let offsets = if effective.reminders.is_empty() && effective.is_exception() {
                match lookup_event(tx, &mut event_cache, &occurrence.event_id).await? {
                    Some(master) => master.reminders,
                    None => Vec::new(),
                }
            } else {
                effective.reminders.clone()
            };
            if offsets.is_empty() {
                continue;
            }

            let color = match color_cache.get(&occurrence.calendar_id) {
                Some(color) => *color,
                None => {
                    let color = calendars::fetch_by_id(tx.conn(), &occurrence.calendar_id)
                        .await?
                        .map(|c| c.color)
                        .unwrap_or(0);
                    color_cache.insert(occurrence.calendar_id.clone(), color);
                    color
                }
            };

            for offset in &offsets {
                let delta = match parse_iso8601_duration(offset) {
                    Some(delta) => delta.num_milliseconds(),
                    None => {
                        tracing::warn!("Unparseable reminder offset '{offset}' on {}", effective.uid);
                        continue;
                    }
                };
                let reminder = ScheduledReminder {
                    id: Uuid::new_v4().to_string(),
                    event_id: effective.id.clone(),
                    occurrence_time: occurrence.start_ts,
                    trigger_time: occurrence.start_ts + delta,
                    reminder_offset: offset.clone(),
                    status: ReminderStatus::Pending,
                    snooze_count: 0,
                    event_title: effective.title.clone(),
                    event_location: effective.location.clone(),
                    is_all_day: effective.is_all_day,
                    calendar_color: color,
                };
                desired.insert((
                    reminder.event_id.clone(),
                    reminder.occurrence_time,
                    reminder.reminder_offset.clone(),
                ));
                reminders::upsert(tx, &reminder).await?;
            }
        }

        // Prune rows whose (event, occurrence, offset) no longer exists.
        for existing in reminders::list_in_window(tx.conn(), now_ms, window_end).await? {
            let key = (
                existing.event_id.clone(),
                existing.occurrence_time,
                existing.reminder_offset.clone(),
            );
            if desired.contains(&key) {
                continue;
            }
            match existing.status {
                // The user already saw these; never retracted by planning.
                ReminderStatus::Fired | ReminderStatus::Snoozed => {}
                _ => reminders::delete(tx, &existing.id).await?,
            }
        }
        Ok(())
    }

    /// Removes every reminder of an event, returning the removed rows so
    /// the embedder can cancel the matching OS alarms.
    pub async fn cancel_for(
        &self,
        tx: &mut StoreTx,
        event_id: &str,
    ) -> CalendarResult<Vec<ScheduledReminder>> {
        let cancelled = reminders::list_for_event(tx.conn(), event_id).await?;
        reminders::delete_for_event(tx, event_id).await?;
        Ok(cancelled)
    }

    /// Marks a delivered reminder FIRED.
    pub async fn mark_fired(&self, tx: &mut StoreTx, reminder_id: &str) -> CalendarResult<()> {
        reminders::set_status(tx, reminder_id, ReminderStatus::Fired).await
    }

    /// Re-arms a fired reminder; PENDING → FIRED → (SNOOZED → FIRED)* per
    /// the state machine, with the snooze counter bumped by the store.
    pub async fn snooze(
        &self,
        tx: &mut StoreTx,
        reminder_id: &str,
        until_ms: i64,
    ) -> CalendarResult<()> {
        reminders::snooze(tx, reminder_id, until_ms).await
    }

    /// Terminal transition; a dismissed reminder never comes back.
    pub async fn dismiss(&self, tx: &mut StoreTx, reminder_id: &str) -> CalendarResult<()> {
        reminders::set_status(tx, reminder_id, ReminderStatus::Dismissed).await
    }
}

async fn lookup_event(
    tx: &mut StoreTx,
    cache: &mut HashMap<String, Option<Event>>,
    event_id: &str,
) -> CalendarResult<Option<Event>> {
    if let Some(cached) = cache.get(event_id) {
        return Ok(cached.clone());
    }
    let fetched = events::fetch_by_id(tx.conn(), event_id).await?;
    cache.insert(event_id.to_string(), fetched.clone());
    Ok(fetched)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::occurrence::OccurrenceIndex;
    use crate::store::{accounts, Store};
    use crate::time::day_code_to_utc_midnight_ms;
    use crate::types::{Account, Calendar, EventStatus, Provider};

    async fn seeded_store() -> Store {
        let store = Store::open_in_memory().await.unwrap();
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
                    .await?;
                    calendars::insert(
                        ctx,
                        &Calendar {
                            id: "c1".into(),
                            account_id: "a1".into(),
                            caldav_url: "https://s/cal/1/".into(),
                            display_name: "Main".into(),
                            color: 0xFF11_2233,
                            ctag: None,
                            sync_token: None,
                            is_visible: true,
                            is_default: true,
                            is_read_only: false,
                            sort_order: 0,
                        },
                    )
                    .await
                })
            })
            .await
            .unwrap();
        store
    }

    fn event(id: &str, start_ts: i64, reminders: Vec<String>) -> Event {
        Event {
            id: id.into(),
            uid: format!("uid-{id}"),
            import_id: String::new(),
            calendar_id: "c1".into(),
            title: format!("Event {id}"),
            location: Some("Office".into()),
            description: None,
            start_ts,
            end_ts: start_ts + 3_600_000,
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
            reminders,
            extra_properties: Default::default(),
            raw_ical: None,
            dtstamp: 0,
            caldav_url: None,
            etag: None,
            sequence: 0,
            sync_status: SyncStatus::Synced,
            last_sync_error: None,
            sync_retry_count: 0,
            parser_version: crate::ics::PARSER_VERSION,
            local_modified_at: None,
            server_modified_at: None,
        }
    }

    #[tokio::test]
    async fn test_refresh_creates_denormalized_rows() {
        let store = seeded_store().await;
        let config = CoreConfig::default();
        let index = OccurrenceIndex::new(&config);
        let planner = ReminderPlanner::new(&config);
        let now = day_code_to_utc_midnight_ms(20250701).unwrap();
        let start = now + 6 * 3_600_000;

        store
            .tx(|ctx| {
                Box::pin(async move {
                    events::upsert(
                        ctx,
                        &event("e1", start, vec!["-PT15M".into(), "-PT1H".into()]),
                    )
                    .await?;
                    index.regenerate_for(ctx, "e1", now).await?;
                    planner.refresh(ctx, now).await
                })
            })
            .await
            .unwrap();

        let rows = reminders::list_for_event(store.pool(), "e1").await.unwrap();
        assert_eq!(rows.len(), 2);
        let quarter = rows
            .iter()
            .find(|r| r.reminder_offset == "-PT15M")
            .unwrap();
        assert_eq!(quarter.trigger_time, start - 15 * 60_000);
        assert_eq!(quarter.status, ReminderStatus::Pending);
        assert_eq!(quarter.event_title, "Event e1");
        assert_eq!(quarter.calendar_color, 0xFF11_2233);
    }

    #[tokio::test]
    async fn test_refresh_prunes_removed_offsets_but_keeps_fired() {
        let store = seeded_store().await;
        let config = CoreConfig::default();
        let index = OccurrenceIndex::new(&config);
        let planner = ReminderPlanner::new(&config);
        let now = day_code_to_utc_midnight_ms(20250701).unwrap();
        let start = now + 6 * 3_600_000;

        let index_clone = index.clone();
        let planner_clone = planner.clone();
        store
            .tx(|ctx| {
                Box::pin(async move {
                    events::upsert(
                        ctx,
                        &event("e1", start, vec!["-PT15M".into(), "-PT1H".into()]),
                    )
                    .await?;
                    index_clone.regenerate_for(ctx, "e1", now).await?;
                    planner_clone.refresh(ctx, now).await
                })
            })
            .await
            .unwrap();

        // The -PT1H reminder fires, then the user removes both offsets.
        let fired_id = reminders::list_for_event(store.pool(), "e1")
            .await
            .unwrap()
            .into_iter()
            .find(|r| r.reminder_offset == "-PT1H")
            .unwrap()
            .id;
        store
            .tx(|ctx| {
                let fired_id = fired_id.clone();
                Box::pin(async move {
                    planner.mark_fired(ctx, &fired_id).await?;
                    events::upsert(ctx, &event("e1", start, vec![])).await?;
                    index.regenerate_for(ctx, "e1", now).await?;
                    planner.refresh(ctx, now).await
                })
            })
            .await
            .unwrap();

        let rows = reminders::list_for_event(store.pool(), "e1").await.unwrap();
        // -PT15M pruned, fired -PT1H retained.
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].reminder_offset, "-PT1H");
        assert_eq!(rows[0].status, ReminderStatus::Fired);
    }

    #[tokio::test]
    async fn test_exception_inherits_master_reminders() {
        let store = seeded_store().await;
        let config = CoreConfig::default();
        let index = OccurrenceIndex::new(&config);
        let planner = ReminderPlanner::new(&config);
        let now = day_code_to_utc_midnight_ms(20250701).unwrap();
        let start = now + 6 * 3_600_000;
        let instance = start + 86_400_000;

        store
            .tx(|ctx| {
                Box::pin(async move {
                    let mut master = event("e1", start, vec!["-PT30M".into()]);
                    master.rrule = Some("FREQ=DAILY;COUNT=2".into());
                    events::upsert(ctx, &master).await?;
                    index.regenerate_for(ctx, "e1", now).await?;

                    // Exception with no own alarms moved one hour later.
                    let mut exc = event("e2", instance + 3_600_000, vec![]);
                    exc.uid = "uid-e1".into();
                    exc.original_event_id = Some("e1".into());
                    exc.original_instance_time = Some(instance);
                    events::upsert(ctx, &exc).await?;
                    index.attach_exception(ctx, &exc).await?;
                    planner.refresh(ctx, now).await
                })
            })
            .await
            .unwrap();

        let rows = reminders::list_for_event(store.pool(), "e2").await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].reminder_offset, "-PT30M");
    }

    #[tokio::test]
    async fn test_cancel_for_returns_rows() {
        let store = seeded_store().await;
        let config = CoreConfig::default();
        let index = OccurrenceIndex::new(&config);
        let planner = ReminderPlanner::new(&config);
        let now = day_code_to_utc_midnight_ms(20250701).unwrap();
        let start = now + 6 * 3_600_000;

        let cancelled = store
            .tx(|ctx| {
                Box::pin(async move {
                    events::upsert(ctx, &event("e1", start, vec!["-PT5M".into()])).await?;
                    index.regenerate_for(ctx, "e1", now).await?;
                    planner.refresh(ctx, now).await?;
                    planner.cancel_for(ctx, "e1").await
                })
            })
            .await
            .unwrap();
        assert_eq!(cancelled.len(), 1);
        let rows = reminders::list_for_event(store.pool(), "e1").await.unwrap();
        assert!(rows.is_empty());
    }
}
