/*!
 * Occurrence Materialization
 *
 * Expands each master (or standalone) event into denormalized occurrence
 * rows so range queries never touch recurrence logic. Expansion runs inside
 * the same transaction that mutated the event. All-day instants live on the
 * UTC calendar; timed day codes use the device zone.
 */

use std::collections::BTreeSet;

use chrono::TimeZone;
use chrono_tz::Tz;
use rrule::RRuleSet;
use uuid::Uuid;

use crate::config::CoreConfig;
use crate::error::CalendarResult;
use crate::ics::parse::parse_instant;
use crate::store::{events, occurrences, StoreTx};
use crate::time::{to_day_format, utc_from_ms};
use crate::types::{Event, EventStatus, Occurrence};

/// Upper bound on instances generated per event; a runaway RRULE gets
/// truncated here rather than flooding the table.
const MAX_INSTANCES: u16 = 4096;

#[derive(Debug, Clone)]
pub struct OccurrenceIndex {
    horizon_past_ms: i64,
    horizon_future_ms: i64,
    device_tz: Tz,
}

impl OccurrenceIndex {
    pub fn new(config: &CoreConfig) -> Self {
        Self {
            horizon_past_ms: config.horizon_past_ms(),
            horizon_future_ms: config.horizon_future_ms(),
            device_tz: config.device_timezone,
        }
    }

    /// Recomputes occurrences for one master or standalone event. Exception
    /// rows have no occurrences of their own; passing one re-attaches it to
    /// its master instead.
    pub async fn regenerate_for(
        &self,
        tx: &mut StoreTx,
        event_id: &str,
        now_ms: i64,
    ) -> CalendarResult<()> {
        let event = match events::fetch_by_id(tx.conn(), event_id).await? {
            Some(event) => event,
            None => {
                occurrences::delete_for_event(tx, event_id).await?;
                return Ok(());
            }
        };
        if event.is_exception() {
            return self.attach_exception(tx, &event).await;
        }

        let instants = self.expand_instants(&event, now_ms);
        let cancelled = event.status == EventStatus::Cancelled;
        let duration = event.duration_ms();

        let mut kept: Vec<i64> = Vec::with_capacity(instants.len());
        for start in &instants {
            let end = start + duration;
            let occurrence = Occurrence {
                id: Uuid::new_v4().to_string(),
                event_id: event.id.clone(),
                calendar_id: event.calendar_id.clone(),
                start_ts: *start,
                end_ts: end,
                start_day: to_day_format(*start, event.is_all_day, self.device_tz),
                end_day: to_day_format(end, event.is_all_day, self.device_tz),
                is_cancelled: cancelled,
                exception_event_id: None,
            };
            occurrences::upsert(tx, &occurrence).await?;
            kept.push(*start);
        }
        occurrences::delete_not_in(tx, &event.id, &kept).await?;

        // Re-attach existing exceptions; idempotent.
        for exception in events::list_exceptions_of(tx.conn(), &event.id).await? {
            self.attach_exception(tx, &exception).await?;
        }
        Ok(())
    }

    pub async fn regenerate_for_calendar(
        &self,
        tx: &mut StoreTx,
        calendar_id: &str,
        now_ms: i64,
    ) -> CalendarResult<()> {
        let all = events::list_for_calendar(tx.conn(), calendar_id).await?;
        for event in all.iter().filter(|e| !e.is_exception()) {
            self.regenerate_for(tx, &event.id, now_ms).await?;
        }
        Ok(())
    }

    /// Points the master occurrence at `original_instance_time` to this
    /// exception, creating the occurrence when the server delivered the
    /// exception before (or instead of) the expanded master instance.
    pub async fn attach_exception(
        &self,
        tx: &mut StoreTx,
        exception: &Event,
    ) -> CalendarResult<()> {
        let (master_id, instance) = match (&exception.original_event_id, exception.original_instance_time)
        {
            (Some(master_id), Some(instance)) => (master_id.clone(), instance),
            _ => return Ok(()),
        };
        let cancelled = exception.status == EventStatus::Cancelled;

        let found =
            occurrences::set_exception_pointer(tx, &master_id, instance, Some(&exception.id))
                .await?;
        if !found {
            let master = events::fetch_by_id(tx.conn(), &master_id).await?;
            let duration = master
                .as_ref()
                .map(|m| m.duration_ms())
                .unwrap_or_else(|| exception.duration_ms());
            let is_all_day = master.as_ref().map(|m| m.is_all_day).unwrap_or(exception.is_all_day);
            let occurrence = Occurrence {
                id: Uuid::new_v4().to_string(),
                event_id: master_id.clone(),
                calendar_id: exception.calendar_id.clone(),
                start_ts: instance,
                end_ts: instance + duration,
                start_day: to_day_format(instance, is_all_day, self.device_tz),
                end_day: to_day_format(instance + duration, is_all_day, self.device_tz),
                is_cancelled: cancelled,
                exception_event_id: Some(exception.id.clone()),
            };
            occurrences::upsert(tx, &occurrence).await?;
        } else {
            occurrences::set_cancelled(tx, &master_id, instance, cancelled).await?;
        }
        Ok(())
    }

    /// Clears the pointer; the occurrence reverts to the master's own data on
    /// the next regeneration.
    pub async fn detach_exception(
        &self,
        tx: &mut StoreTx,
        exception_event_id: &str,
    ) -> CalendarResult<()> {
        sqlx::query(
            r#"
            UPDATE occurrences SET exception_event_id = NULL, is_cancelled = 0
            WHERE exception_event_id = ?1
        "#,
        )
        .bind(exception_event_id)
        .execute(tx.conn())
        .await?;
        tx.touch(crate::store::Table::Occurrences);
        Ok(())
    }

    /// Computes the start instants of an event inside the horizon. A
    /// non-recurring event always yields its single start, horizon or not.
    fn expand_instants(&self, event: &Event, now_ms: i64) -> Vec<i64> {
        if !event.is_recurring() {
            return vec![event.start_ts];
        }

        let window_start = now_ms - self.horizon_past_ms;
        let window_end = now_ms + self.horizon_future_ms;
        let mut instants: BTreeSet<i64> = BTreeSet::new();

        if let Some(rule) = &event.rrule {
            match self.expand_rrule(event, rule, window_start, window_end) {
                Ok(dates) => instants.extend(dates),
                Err(message) => {
                    tracing::warn!(
                        "RRULE expansion failed for {} ({}); keeping single instance",
                        event.uid,
                        message
                    );
                    instants.insert(event.start_ts);
                }
            }
        }

        for value in list_values(event.rdate.as_deref()) {
            if let Some(instant) = parse_instant(&value, None) {
                if instant.ts_ms >= window_start && instant.ts_ms <= window_end {
                    instants.insert(instant.ts_ms);
                }
            }
        }

        for value in list_values(event.exdate.as_deref()) {
            if let Some(instant) = parse_instant(&value, None) {
                instants.remove(&instant.ts_ms);
            }
        }

        instants.into_iter().collect()
    }

    fn expand_rrule(
        &self,
        event: &Event,
        rule: &str,
        window_start: i64,
        window_end: i64,
    ) -> Result<Vec<i64>, String> {
        let dtstart = self.dtstart_line(event);
        let input = format!("{}\nRRULE:{}", dtstart, rule);
        let rrule_set: RRuleSet = input.parse().map_err(|e| format!("{e}"))?;

        let after = rrule::Tz::UTC
            .timestamp_millis_opt(window_start)
            .single()
            .ok_or_else(|| "window start out of range".to_string())?;
        let before = rrule::Tz::UTC
            .timestamp_millis_opt(window_end)
            .single()
            .ok_or_else(|| "window end out of range".to_string())?;

        let result = rrule_set.after(after).before(before).all(MAX_INSTANCES);
        if result.limited {
            tracing::warn!(
                "RRULE for {} truncated at {} instances",
                event.uid,
                MAX_INSTANCES
            );
        }
        Ok(result
            .dates
            .into_iter()
            .map(|d| d.timestamp_millis())
            .collect())
    }

    /// DTSTART for RRULE parsing. All-day events iterate on the UTC
    /// calendar; timed events iterate in their named zone so the local wall
    /// time is stable across DST transitions.
    fn dtstart_line(&self, event: &Event) -> String {
        let start = utc_from_ms(event.start_ts);
        if event.is_all_day {
            return format!("DTSTART:{}", start.format("%Y%m%dT%H%M%SZ"));
        }
        if let Some(tzid) = &event.timezone {
            if let Ok(tz) = tzid.parse::<Tz>() {
                let local = tz.from_utc_datetime(&start.naive_utc());
                return format!("DTSTART;TZID={}:{}", tzid, local.format("%Y%m%dT%H%M%S"));
            }
        }
        format!("DTSTART:{}", start.format("%Y%m%dT%H%M%SZ"))
    }
}

fn list_values(joined: Option<&str>) -> Vec<String> {
    match joined {
        Some(joined) => joined
            .split(['\n', ','])
            .filter(|v| !v.is_empty())
            .map(|v| v.to_string())
            .collect(),
        None => Vec::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{accounts, calendars, Store};
    use crate::time::day_code_to_utc_midnight_ms;
    use crate::types::{Account, Calendar, Provider, SyncStatus};

    fn test_config() -> CoreConfig {
        CoreConfig::default()
    }

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
                            color: 0,
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

    fn event(id: &str, start_ts: i64, end_ts: i64) -> Event {
        Event {
            id: id.into(),
            uid: format!("uid-{id}"),
            import_id: String::new(),
            calendar_id: "c1".into(),
            title: "Event".into(),
            location: None,
            description: None,
            start_ts,
            end_ts,
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
            reminders: vec![],
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
    async fn test_single_event_yields_one_occurrence() {
        let store = seeded_store().await;
        let index = OccurrenceIndex::new(&test_config());
        let now = day_code_to_utc_midnight_ms(20250701).unwrap();
        let start = now + 10 * 3_600_000;
        store
            .tx(|ctx| {
                Box::pin(async move {
                    events::upsert(ctx, &event("e1", start, start + 3_600_000)).await?;
                    index.regenerate_for(ctx, "e1", now).await
                })
            })
            .await
            .unwrap();
        let occs = occurrences::list_for_event(store.pool(), "e1").await.unwrap();
        assert_eq!(occs.len(), 1);
        assert_eq!(occs[0].start_ts, start);
        assert_eq!(occs[0].start_day, 20250701);
        assert!(!occs[0].is_cancelled);
    }

    #[tokio::test]
    async fn test_daily_rrule_with_exdate() {
        let store = seeded_store().await;
        let index = OccurrenceIndex::new(&test_config());
        let now = day_code_to_utc_midnight_ms(20250701).unwrap();
        let start = now + 9 * 3_600_000;
        store
            .tx(|ctx| {
                Box::pin(async move {
                    let mut e = event("e1", start, start + 1_800_000);
                    e.rrule = Some("FREQ=DAILY;COUNT=5".into());
                    // Skip day three.
                    e.exdate = Some("20250703T090000Z".into());
                    events::upsert(ctx, &e).await?;
                    index.regenerate_for(ctx, "e1", now).await
                })
            })
            .await
            .unwrap();
        let occs = occurrences::list_for_event(store.pool(), "e1").await.unwrap();
        assert_eq!(occs.len(), 4);
        let days: Vec<i32> = occs.iter().map(|o| o.start_day).collect();
        assert_eq!(days, vec![20250701, 20250702, 20250704, 20250705]);
    }

    #[tokio::test]
    async fn test_regenerate_is_idempotent_and_prunes() {
        let store = seeded_store().await;
        let index = OccurrenceIndex::new(&test_config());
        let now = day_code_to_utc_midnight_ms(20250701).unwrap();
        let start = now + 9 * 3_600_000;
        store
            .tx(|ctx| {
                Box::pin(async move {
                    let mut e = event("e1", start, start + 1_800_000);
                    e.rrule = Some("FREQ=DAILY;COUNT=5".into());
                    events::upsert(ctx, &e).await?;
                    index.regenerate_for(ctx, "e1", now).await?;
                    // Shrink the series; stale rows must be pruned.
                    e.rrule = Some("FREQ=DAILY;COUNT=2".into());
                    events::upsert(ctx, &e).await?;
                    index.regenerate_for(ctx, "e1", now).await
                })
            })
            .await
            .unwrap();
        let occs = occurrences::list_for_event(store.pool(), "e1").await.unwrap();
        assert_eq!(occs.len(), 2);
    }

    #[tokio::test]
    async fn test_exception_attach_and_race() {
        let store = seeded_store().await;
        let index = OccurrenceIndex::new(&test_config());
        let now = day_code_to_utc_midnight_ms(20250701).unwrap();
        let start = now + 9 * 3_600_000;
        let instance = start + 2 * 86_400_000;
        let index_clone = index.clone();
        store
            .tx(|ctx| {
                Box::pin(async move {
                    let mut master = event("e1", start, start + 3_600_000);
                    master.rrule = Some("FREQ=DAILY;COUNT=5".into());
                    events::upsert(ctx, &master).await?;
                    index_clone.regenerate_for(ctx, "e1", now).await?;

                    let mut exc = event("e2", instance + 3_600_000, instance + 7_200_000);
                    exc.uid = master.uid.clone();
                    exc.original_event_id = Some("e1".into());
                    exc.original_instance_time = Some(instance);
                    events::upsert(ctx, &exc).await?;
                    index_clone.attach_exception(ctx, &exc).await
                })
            })
            .await
            .unwrap();
        let occ = occurrences::fetch_by_event_and_start(store.pool(), "e1", instance)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(occ.exception_event_id.as_deref(), Some("e2"));

        // Exception for an instance the master never generated (race): a new
        // occurrence is created at the claimed instance time.
        let orphan_instance = start + 30 * 86_400_000;
        store
            .tx(|ctx| {
                Box::pin(async move {
                    let mut exc = event("e3", orphan_instance, orphan_instance + 3_600_000);
                    exc.uid = "uid-e1".into();
                    exc.original_event_id = Some("e1".into());
                    exc.original_instance_time = Some(orphan_instance);
                    events::upsert(ctx, &exc).await?;
                    index.attach_exception(ctx, &exc).await
                })
            })
            .await
            .unwrap();
        let occ = occurrences::fetch_by_event_and_start(store.pool(), "e1", orphan_instance)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(occ.exception_event_id.as_deref(), Some("e3"));
    }

    #[tokio::test]
    async fn test_regeneration_preserves_exception_pointer() {
        let store = seeded_store().await;
        let index = OccurrenceIndex::new(&test_config());
        let now = day_code_to_utc_midnight_ms(20250701).unwrap();
        let start = now + 9 * 3_600_000;
        let instance = start + 86_400_000;
        store
            .tx(|ctx| {
                Box::pin(async move {
                    let mut master = event("e1", start, start + 3_600_000);
                    master.rrule = Some("FREQ=DAILY;COUNT=3".into());
                    events::upsert(ctx, &master).await?;
                    index.regenerate_for(ctx, "e1", now).await?;

                    let mut exc = event("e2", instance, instance + 3_600_000);
                    exc.uid = master.uid.clone();
                    exc.original_event_id = Some("e1".into());
                    exc.original_instance_time = Some(instance);
                    events::upsert(ctx, &exc).await?;
                    index.attach_exception(ctx, &exc).await?;

                    // A second regeneration must keep the pointer.
                    index.regenerate_for(ctx, "e1", now).await
                })
            })
            .await
            .unwrap();
        let occ = occurrences::fetch_by_event_and_start(store.pool(), "e1", instance)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(occ.exception_event_id.as_deref(), Some("e2"));
    }

    #[tokio::test]
    async fn test_elapsed_series_yields_nothing() {
        let store = seeded_store().await;
        let index = OccurrenceIndex::new(&test_config());
        let now = day_code_to_utc_midnight_ms(20250701).unwrap();
        // Series ended years before the horizon window.
        let start = now - 4 * 365 * 86_400_000;
        store
            .tx(|ctx| {
                Box::pin(async move {
                    let mut e = event("e1", start, start + 3_600_000);
                    e.rrule = Some("FREQ=DAILY;COUNT=10".into());
                    events::upsert(ctx, &e).await?;
                    index.regenerate_for(ctx, "e1", now).await
                })
            })
            .await
            .unwrap();
        let occs = occurrences::list_for_event(store.pool(), "e1").await.unwrap();
        assert!(occs.is_empty());
    }
}
