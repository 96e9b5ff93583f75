/*!
 * Offline integration tests
 *
 * Exercise the facade end to end against an in-memory store: local event
 * CRUD queues operations, occurrences materialize, reminders plan, and the
 * server-authored round trip preserves foreign structure. No network is
 * involved; the wire layer has its own parser-level tests.
 */

use std::sync::Arc;

use crate::config::CoreConfig;
use crate::credentials::MemoryCredentialStore;
use crate::engine::CalendarEngine;
use crate::store::{accounts, calendars, operations, Store};
use crate::time::day_code_to_utc_midnight_ms;
use crate::types::{
    Account, Calendar, EditScope, EventDraft, OperationType, Provider, SyncStatus,
};

async fn engine_with_calendar() -> (CalendarEngine, String) {
    let store = Store::open_in_memory().await.unwrap();
    store
        .tx(|ctx| {
            Box::pin(async move {
                accounts::insert(
                    ctx,
                    &Account {
                        id: "a1".into(),
                        provider: Provider::GenericCalDav,
                        email: "jane@example.com".into(),
                        display_name: "Jane".into(),
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
                        caldav_url: "https://cal.example.com/dav/jane/home/".into(),
                        display_name: "Home".into(),
                        color: 0xFF33_99CC,
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

    let engine = CalendarEngine::new(
        store,
        CoreConfig::default(),
        Arc::new(MemoryCredentialStore::new()),
        None,
    )
    .unwrap();
    (engine, "c1".to_string())
}

fn tomorrow_draft(title: &str) -> EventDraft {
    let start = chrono::Utc::now().timestamp_millis() + 24 * 3_600_000;
    EventDraft {
        title: title.to_string(),
        location: Some("Kitchen".into()),
        description: None,
        start_ts: start,
        end_ts: start + 3_600_000,
        timezone: None,
        is_all_day: false,
        rrule: None,
        reminders: vec!["-PT10M".into()],
    }
}

#[tokio::test]
async fn test_create_event_queues_and_materializes() {
    let (engine, calendar_id) = engine_with_calendar().await;
    let draft = tomorrow_draft("Bake bread");
    let start = draft.start_ts;
    let event_id = engine.create_event(&calendar_id, draft).await.unwrap();

    // One occurrence in range, effective event attached.
    let hits = engine
        .query_events(start - 1_000, start + 1_000, None)
        .await
        .unwrap();
    assert_eq!(hits.len(), 1);
    assert_eq!(hits[0].event.id, event_id);
    assert_eq!(hits[0].event.sync_status, SyncStatus::PendingCreate);

    // A CREATE op is queued and counted.
    let ops = operations::list_for_event(engine.store().pool(), &event_id)
        .await
        .unwrap();
    assert_eq!(ops.len(), 1);
    assert_eq!(ops[0].operation, OperationType::Create);
    assert_eq!(
        operations::count_pending(engine.store().pool()).await.unwrap(),
        1
    );

    // The reminder planner ran inside the same flow.
    let due = crate::store::reminders::list_for_event(engine.store().pool(), &event_id)
        .await
        .unwrap();
    assert_eq!(due.len(), 1);
    assert_eq!(due[0].reminder_offset, "-PT10M");
}

#[tokio::test]
async fn test_update_then_delete_keeps_single_ops() {
    let (engine, calendar_id) = engine_with_calendar().await;
    let event_id = engine
        .create_event(&calendar_id, tomorrow_draft("Original"))
        .await
        .unwrap();

    // Editing an unpushed event must not stack a second operation.
    let mut edit = tomorrow_draft("Renamed");
    edit.reminders = vec![];
    engine.update_event(&event_id, edit).await.unwrap();
    let ops = operations::list_for_event(engine.store().pool(), &event_id)
        .await
        .unwrap();
    assert_eq!(ops.len(), 1);
    assert_eq!(ops[0].operation, OperationType::Create);

    // Deleting a never-uploaded event drops everything locally.
    engine
        .delete_event(&event_id, EditScope::All)
        .await
        .unwrap();
    assert!(crate::store::events::fetch_by_id(engine.store().pool(), &event_id)
        .await
        .unwrap()
        .is_none());
    assert_eq!(
        operations::count_pending(engine.store().pool()).await.unwrap(),
        0
    );
}

#[tokio::test]
async fn test_recurring_series_with_instance_override() {
    let (engine, calendar_id) = engine_with_calendar().await;
    let base = day_code_to_utc_midnight_ms(20270301).unwrap() + 9 * 3_600_000;
    let draft = EventDraft {
        title: "Standup".into(),
        location: None,
        description: None,
        start_ts: base,
        end_ts: base + 900_000,
        timezone: None,
        is_all_day: false,
        rrule: Some("FREQ=DAILY;COUNT=5".into()),
        reminders: vec![],
    };
    let master_id = engine.create_event(&calendar_id, draft).await.unwrap();

    let hits = engine
        .query_events(base - 1, base + 5 * 86_400_000, None)
        .await
        .unwrap();
    assert_eq!(hits.len(), 5);

    // Override day three.
    let instance = base + 2 * 86_400_000;
    let mut moved = tomorrow_draft("Standup (moved)");
    moved.start_ts = instance + 3_600_000;
    moved.end_ts = instance + 2 * 3_600_000;
    moved.reminders = vec![];
    let exception_id = engine
        .update_occurrence(&master_id, instance, moved)
        .await
        .unwrap();

    let hits = engine
        .query_events(base - 1, base + 5 * 86_400_000, None)
        .await
        .unwrap();
    assert_eq!(hits.len(), 5);
    let overridden = hits
        .iter()
        .find(|h| h.occurrence.start_ts == instance)
        .unwrap();
    assert_eq!(overridden.event.id, exception_id);
    assert_eq!(overridden.event.title, "Standup (moved)");

    // Excluding day five shrinks the series.
    engine
        .delete_occurrence(&master_id, base + 4 * 86_400_000)
        .await
        .unwrap();
    let hits = engine
        .query_events(base - 1, base + 5 * 86_400_000, None)
        .await
        .unwrap();
    assert_eq!(hits.len(), 4);
}

#[tokio::test]
async fn test_search_finds_created_events() {
    let (engine, calendar_id) = engine_with_calendar().await;
    engine
        .create_event(&calendar_id, tomorrow_draft("Quarterly planning session"))
        .await
        .unwrap();
    engine
        .create_event(&calendar_id, tomorrow_draft("Dentist"))
        .await
        .unwrap();

    let hits = engine.search_events("quarter*", None).await.unwrap();
    assert_eq!(hits.len(), 1);
    assert_eq!(hits[0].event.title, "Quarterly planning session");
    assert!(hits[0].next_occurrence.is_some());

    let none = engine.search_events("zzz-nothing", None).await.unwrap();
    assert!(none.is_empty());
}
