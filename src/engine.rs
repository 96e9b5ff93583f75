/*!
 * Calendar Engine Facade
 *
 * The process-boundary API the UI layer talks to: account setup, event
 * CRUD (queued as pending operations), range and text queries, ICS
 * subscriptions, reminder state transitions and account deletion. All
 * mutations are offline-first: they land in the store immediately and the
 * sync pipeline reconciles them with the server later.
 */

use std::sync::Arc;

use async_trait::async_trait;
use secrecy::SecretString;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::caldav::{discover_account, CalDavClient, Credentials, DiscoveredAccount, Quirks};
use crate::config::CoreConfig;
use crate::credentials::{account_key, subscription_key, CredentialStore};
use crate::error::{CalendarError, CalendarResult};
use crate::ics;
use crate::jobs::{sync_backoff_hint_ms, JobRunner, SyncJob};
use crate::store::events::EventWithOccurrence;
use crate::store::search::EventWithNextOccurrence;
use crate::store::{
    accounts, calendars, events, operations, reminders, search, subscriptions, sync_log, Store,
    StoreTx,
};
use crate::subscriptions::IcsSubscriptionService;
use crate::sync::{ClientFactory, SyncEngine};
use crate::time::utc_from_ms;
use crate::types::{
    Account, Calendar, EditScope, Event, EventDraft, EventStatus, IcsSubscription,
    OperationStatus, OperationType, PendingOperation, Provider, ScheduledReminder, SyncLogEntry,
    SyncOutcome, SyncStatus,
};

/// Builds authenticated CalDAV clients from stored credentials. Clients are
/// constructed per sync with credentials bound at construction; nothing can
/// swap the auth header on a live client.
pub struct StoredCredentialClientFactory {
    credentials: Arc<dyn CredentialStore>,
    config: Arc<CoreConfig>,
}

#[async_trait]
impl ClientFactory for StoredCredentialClientFactory {
    async fn client_for(&self, account: &Account) -> CalendarResult<Arc<CalDavClient>> {
        let username = self
            .credentials
            .get(&account_key(&account.id, "username"))
            .await?
            .map(|s| {
                use secrecy::ExposeSecret;
                s.expose_secret().to_string()
            })
            .unwrap_or_else(|| account.email.clone());
        let password = self
            .credentials
            .get(&account_key(&account.id, "password"))
            .await?
            .ok_or_else(|| CalendarError::Auth {
                message: "no stored credentials".to_string(),
                account_id: Some(account.id.clone()),
            })?;
        let client = CalDavClient::new(
            Quirks::new(account.provider),
            Some(Credentials { username, password }),
            &self.config.http,
        )?;
        Ok(Arc::new(client))
    }
}

pub struct CalendarEngine {
    store: Store,
    config: Arc<CoreConfig>,
    sync: SyncEngine,
    feeds: IcsSubscriptionService,
    credentials: Arc<dyn CredentialStore>,
    client_factory: StoredCredentialClientFactory,
    job_runner: Option<Arc<dyn JobRunner>>,
}

impl CalendarEngine {
    pub fn new(
        store: Store,
        config: CoreConfig,
        credentials: Arc<dyn CredentialStore>,
        job_runner: Option<Arc<dyn JobRunner>>,
    ) -> CalendarResult<Self> {
        let config = Arc::new(config);
        let feeds =
            IcsSubscriptionService::new(store.clone(), config.clone(), credentials.clone())?;
        Ok(Self {
            sync: SyncEngine::new(store.clone(), config.clone()),
            client_factory: StoredCredentialClientFactory {
                credentials: credentials.clone(),
                config: config.clone(),
            },
            feeds,
            store,
            config,
            credentials,
            job_runner,
        })
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    pub fn config(&self) -> &CoreConfig {
        &self.config
    }

    fn now_ms() -> i64 {
        chrono::Utc::now().timestamp_millis()
    }

    // ---- accounts ------------------------------------------------------

    /// Sets up an account: discovery against the given server, credential
    /// storage, and an initial sync scheduled for every discovered calendar.
    pub async fn create_account(
        &self,
        provider: Provider,
        email: &str,
        display_name: &str,
        server_url: Option<&str>,
        username: Option<&str>,
        password: SecretString,
        cancel: &CancellationToken,
    ) -> CalendarResult<DiscoveredAccount> {
        let server_url = server_url
            .map(|s| s.to_string())
            .or_else(|| default_server_url(provider).map(|s| s.to_string()))
            .ok_or_else(|| CalendarError::other("server URL required for this provider"))?;
        let username = username.unwrap_or(email).to_string();

        let client = CalDavClient::new(
            Quirks::new(provider),
            Some(Credentials {
                username: username.clone(),
                password: password.clone(),
            }),
            &self.config.http,
        )?;

        let discovered = discover_account(
            &self.store,
            &client,
            provider,
            email,
            display_name,
            &server_url,
            Self::now_ms(),
            cancel,
        )
        .await?;

        let account_id = &discovered.account.id;
        self.credentials
            .save(&account_key(account_id, "username"), SecretString::new(username))
            .await?;
        self.credentials
            .save(&account_key(account_id, "password"), password)
            .await?;

        if let Some(runner) = &self.job_runner {
            for calendar in &discovered.calendars {
                runner
                    .schedule(
                        SyncJob::SyncCalendar {
                            calendar_id: calendar.id.clone(),
                        },
                        0,
                    )
                    .await;
            }
        }
        Ok(discovered)
    }

    pub async fn list_accounts(&self) -> CalendarResult<Vec<Account>> {
        accounts::list_all(self.store.pool()).await
    }

    pub async fn list_calendars(&self, account_id: &str) -> CalendarResult<Vec<Calendar>> {
        calendars::list_for_account(self.store.pool(), account_id).await
    }

    pub async fn set_account_enabled(&self, account_id: &str, enabled: bool) -> CalendarResult<()> {
        let id = account_id.to_string();
        self.store
            .tx(move |ctx| Box::pin(async move { accounts::set_enabled(ctx, &id, enabled).await }))
            .await
    }

    /// §4.10: jobs → reminders + pending ops → credentials → cascade.
    pub async fn delete_account(
        &self,
        account_id: &str,
    ) -> CalendarResult<Vec<ScheduledReminder>> {
        self.sync
            .delete_account(
                account_id,
                self.credentials.as_ref(),
                self.job_runner.as_deref(),
            )
            .await
    }

    /// Probe used by account setup before anything is persisted.
    pub async fn check_connection(
        &self,
        provider: Provider,
        server_url: &str,
        username: &str,
        password: SecretString,
        cancel: &CancellationToken,
    ) -> CalendarResult<()> {
        let client = CalDavClient::new(
            Quirks::new(provider),
            Some(Credentials {
                username: username.to_string(),
                password,
            }),
            &self.config.http,
        )?;
        client.check_connection(server_url, cancel).await
    }

    // ---- sync ----------------------------------------------------------

    /// Synchronizes one calendar; the unit of work the job runner invokes.
    /// On failure the runner gets a backoff hint for the account.
    pub async fn sync_calendar(
        &self,
        calendar_id: &str,
        force_full: bool,
        cancel: &CancellationToken,
    ) -> CalendarResult<SyncOutcome> {
        let calendar = calendars::fetch_by_id(self.store.pool(), calendar_id)
            .await?
            .ok_or_else(|| CalendarError::NotFound {
                resource: format!("calendar {calendar_id}"),
            })?;
        let account = accounts::fetch_by_id(self.store.pool(), &calendar.account_id)
            .await?
            .ok_or_else(|| CalendarError::NotFound {
                resource: format!("account {}", calendar.account_id),
            })?;
        if !account.is_enabled {
            tracing::debug!("Account {} disabled; skipping sync", account.email);
            return Ok(SyncOutcome {
                calendar_id: calendar_id.to_string(),
                ..Default::default()
            });
        }
        if account.provider == Provider::Ics || account.provider == Provider::Local {
            // Feed calendars refresh through the subscription pipeline and
            // local calendars have no remote at all.
            return Ok(SyncOutcome {
                calendar_id: calendar_id.to_string(),
                ..Default::default()
            });
        }

        let client = self.client_factory.client_for(&account).await?;
        let result = self
            .sync
            .sync_calendar(
                client.as_ref(),
                Some(&self.client_factory as &dyn ClientFactory),
                calendar_id,
                force_full,
                cancel,
            )
            .await;

        if result.is_err() {
            if let Some(runner) = &self.job_runner {
                let failures = accounts::fetch_by_id(self.store.pool(), &account.id)
                    .await?
                    .map(|a| a.consecutive_sync_failures)
                    .unwrap_or(0);
                runner
                    .schedule(
                        SyncJob::SyncCalendar {
                            calendar_id: calendar_id.to_string(),
                        },
                        sync_backoff_hint_ms(failures),
                    )
                    .await;
            }
        }
        result
    }

    pub async fn recent_sync_log(&self, limit: i64) -> CalendarResult<Vec<SyncLogEntry>> {
        sync_log::recent(self.store.pool(), limit).await
    }

    // ---- event CRUD ----------------------------------------------------

    /// Creates a local event and queues its upload.
    pub async fn create_event(
        &self,
        calendar_id: &str,
        draft: EventDraft,
    ) -> CalendarResult<String> {
        let calendar = calendars::fetch_by_id(self.store.pool(), calendar_id)
            .await?
            .ok_or_else(|| CalendarError::NotFound {
                resource: format!("calendar {calendar_id}"),
            })?;
        if calendar.is_read_only {
            return Err(CalendarError::Permission {
                message: format!("calendar {} is read-only", calendar.display_name),
            });
        }
        let now = Self::now_ms();
        let event = Event {
            id: Uuid::new_v4().to_string(),
            uid: Uuid::new_v4().to_string(),
            import_id: String::new(),
            calendar_id: calendar.id.clone(),
            title: draft.title,
            location: draft.location,
            description: draft.description,
            start_ts: draft.start_ts,
            end_ts: draft.end_ts.max(draft.start_ts),
            timezone: draft.timezone,
            is_all_day: draft.is_all_day,
            status: EventStatus::Confirmed,
            transp: "OPAQUE".to_string(),
            classification: "PUBLIC".to_string(),
            organizer_email: None,
            organizer_name: None,
            rrule: draft.rrule,
            rdate: None,
            exdate: None,
            duration: None,
            original_event_id: None,
            original_instance_time: None,
            reminders: draft.reminders,
            extra_properties: Default::default(),
            raw_ical: None,
            dtstamp: now,
            caldav_url: None,
            etag: None,
            sequence: 0,
            sync_status: SyncStatus::PendingCreate,
            last_sync_error: None,
            sync_retry_count: 0,
            parser_version: ics::PARSER_VERSION,
            local_modified_at: Some(now),
            server_modified_at: None,
        };
        let event_id = event.id.clone();

        let index = self.sync.index().clone();
        let planner = self.sync.planner().clone();
        self.store
            .tx(move |ctx| {
                Box::pin(async move {
                    events::upsert(ctx, &event).await?;
                    enqueue_op(ctx, &event.id, OperationType::Create, None, now).await?;
                    index.regenerate_for(ctx, &event.id, now).await?;
                    planner.refresh(ctx, now).await
                })
            })
            .await?;
        Ok(event_id)
    }

    /// Applies user edits to an event (master, standalone or exception) and
    /// queues the upload. The sequence stays put; the codec bumps it when
    /// the PUT body is rendered.
    pub async fn update_event(&self, event_id: &str, draft: EventDraft) -> CalendarResult<()> {
        let mut event = events::fetch_by_id(self.store.pool(), event_id)
            .await?
            .ok_or_else(|| CalendarError::NotFound {
                resource: format!("event {event_id}"),
            })?;
        if event.sync_status == SyncStatus::PendingDelete {
            return Err(CalendarError::other("event is queued for deletion"));
        }
        let now = Self::now_ms();

        event.title = draft.title;
        event.location = draft.location;
        event.description = draft.description;
        event.start_ts = draft.start_ts;
        event.end_ts = draft.end_ts.max(draft.start_ts);
        event.timezone = draft.timezone;
        event.is_all_day = draft.is_all_day;
        if !event.is_exception() {
            event.rrule = draft.rrule;
        }
        event.reminders = draft.reminders;
        event.local_modified_at = Some(now);
        if event.sync_status == SyncStatus::Synced {
            event.sync_status = SyncStatus::PendingUpdate;
        }

        let index = self.sync.index().clone();
        let planner = self.sync.planner().clone();
        self.store
            .tx(move |ctx| {
                Box::pin(async move {
                    events::upsert(ctx, &event).await?;
                    let op_type = match event.sync_status {
                        SyncStatus::PendingCreate => OperationType::Create,
                        _ => OperationType::Update,
                    };
                    enqueue_op(ctx, &event.id, op_type, None, now).await?;
                    let regen_target = event
                        .original_event_id
                        .as_deref()
                        .unwrap_or(event.id.as_str())
                        .to_string();
                    index.regenerate_for(ctx, &regen_target, now).await?;
                    planner.refresh(ctx, now).await
                })
            })
            .await
    }

    /// Overrides a single instance of a recurring series with new content,
    /// creating the RECURRENCE-ID exception if it does not exist yet.
    pub async fn update_occurrence(
        &self,
        master_id: &str,
        instance_ts: i64,
        draft: EventDraft,
    ) -> CalendarResult<String> {
        let master = events::fetch_by_id(self.store.pool(), master_id)
            .await?
            .ok_or_else(|| CalendarError::NotFound {
                resource: format!("event {master_id}"),
            })?;
        if master.is_exception() {
            return Err(CalendarError::other("cannot override an exception"));
        }
        let existing = events::find_exception(
            self.store.pool(),
            &master.calendar_id,
            &master.uid,
            instance_ts,
        )
        .await?;
        let now = Self::now_ms();

        let mut exception = existing.unwrap_or_else(|| Event {
            id: Uuid::new_v4().to_string(),
            uid: master.uid.clone(),
            import_id: String::new(),
            original_event_id: Some(master.id.clone()),
            original_instance_time: Some(instance_ts),
            raw_ical: master.raw_ical.clone(),
            caldav_url: master.caldav_url.clone(),
            etag: master.etag.clone(),
            sequence: master.sequence,
            ..master.clone()
        });
        exception.rrule = None;
        exception.rdate = None;
        exception.exdate = None;
        exception.title = draft.title;
        exception.location = draft.location;
        exception.description = draft.description;
        exception.start_ts = draft.start_ts;
        exception.end_ts = draft.end_ts.max(draft.start_ts);
        exception.reminders = draft.reminders;
        exception.local_modified_at = Some(now);
        exception.sync_status = if master.sync_status == SyncStatus::PendingCreate {
            SyncStatus::PendingCreate
        } else {
            SyncStatus::PendingUpdate
        };

        let exception_id = exception.id.clone();
        let master_id = master.id.clone();
        let index = self.sync.index().clone();
        let planner = self.sync.planner().clone();
        self.store
            .tx(move |ctx| {
                Box::pin(async move {
                    events::upsert(ctx, &exception).await?;
                    index.attach_exception(ctx, &exception).await?;
                    // The series is one server resource; the master's queued
                    // update carries the exception.
                    let op_type = match exception.sync_status {
                        SyncStatus::PendingCreate => OperationType::Create,
                        _ => OperationType::Update,
                    };
                    enqueue_op(ctx, &master_id, op_type, None, now).await?;
                    planner.refresh(ctx, now).await
                })
            })
            .await?;
        Ok(exception_id)
    }

    /// Deletes an event with the requested scope.
    pub async fn delete_event(&self, event_id: &str, scope: EditScope) -> CalendarResult<()> {
        let event = events::fetch_by_id(self.store.pool(), event_id)
            .await?
            .ok_or_else(|| CalendarError::NotFound {
                resource: format!("event {event_id}"),
            })?;
        let now = Self::now_ms();

        match (scope, event.is_exception(), event.is_recurring()) {
            // Cancelling one already-overridden instance: the exception
            // turns CANCELLED and rides along with the series PUT.
            (EditScope::This, true, _) => {
                let master_id = event.original_event_id.clone().ok_or_else(|| {
                    CalendarError::other("exception without master reference")
                })?;
                let mut cancelled = event;
                cancelled.status = EventStatus::Cancelled;
                cancelled.sync_status = SyncStatus::PendingUpdate;
                cancelled.local_modified_at = Some(now);
                let index = self.sync.index().clone();
                let planner = self.sync.planner().clone();
                self.store
                    .tx(move |ctx| {
                        Box::pin(async move {
                            events::upsert(ctx, &cancelled).await?;
                            index.attach_exception(ctx, &cancelled).await?;
                            planner.cancel_for(ctx, &cancelled.id).await?;
                            enqueue_op(ctx, &master_id, OperationType::Update, None, now).await?;
                            planner.refresh(ctx, now).await
                        })
                    })
                    .await
            }
            (EditScope::This, false, true) => Err(CalendarError::other(
                "deleting one instance of a series needs delete_occurrence",
            )),
            (EditScope::ThisAndFollowing, true, _) => {
                let instance = event.original_instance_time.ok_or_else(|| {
                    CalendarError::other("exception without instance time")
                })?;
                let master_id = event.original_event_id.clone().ok_or_else(|| {
                    CalendarError::other("exception without master reference")
                })?;
                self.truncate_series(&master_id, instance, now).await
            }
            // THIS on a non-recurring event, and ALL anywhere, remove the
            // whole series.
            _ => self.delete_whole_series(&event, now).await,
        }
    }

    /// Excludes one instance of a series via EXDATE and queues the series
    /// update.
    pub async fn delete_occurrence(
        &self,
        master_id: &str,
        instance_ts: i64,
    ) -> CalendarResult<()> {
        let mut master = events::fetch_by_id(self.store.pool(), master_id)
            .await?
            .ok_or_else(|| CalendarError::NotFound {
                resource: format!("event {master_id}"),
            })?;
        if !master.is_recurring() {
            return Err(CalendarError::other("event is not recurring"));
        }
        let now = Self::now_ms();

        let wire = if master.is_all_day {
            utc_from_ms(instance_ts).format("%Y%m%d").to_string()
        } else {
            utc_from_ms(instance_ts).format("%Y%m%dT%H%M%SZ").to_string()
        };
        master.exdate = Some(match master.exdate.take() {
            Some(existing) => format!("{existing}\n{wire}"),
            None => wire,
        });
        master.local_modified_at = Some(now);
        if master.sync_status == SyncStatus::Synced {
            master.sync_status = SyncStatus::PendingUpdate;
        }

        let index = self.sync.index().clone();
        let planner = self.sync.planner().clone();
        self.store
            .tx(move |ctx| {
                Box::pin(async move {
                    events::upsert(ctx, &master).await?;
                    let op_type = match master.sync_status {
                        SyncStatus::PendingCreate => OperationType::Create,
                        _ => OperationType::Update,
                    };
                    enqueue_op(ctx, &master.id, op_type, None, now).await?;
                    index.regenerate_for(ctx, &master.id, now).await?;
                    planner.refresh(ctx, now).await
                })
            })
            .await
    }

    async fn truncate_series(
        &self,
        master_id: &str,
        until_exclusive_ts: i64,
        now: i64,
    ) -> CalendarResult<()> {
        let mut master = events::fetch_by_id(self.store.pool(), master_id)
            .await?
            .ok_or_else(|| CalendarError::NotFound {
                resource: format!("event {master_id}"),
            })?;
        let rrule = match master.rrule.take() {
            Some(rrule) => rrule,
            None => return self.delete_whole_series(&master, now).await,
        };
        master.rrule = Some(truncate_rrule(&rrule, until_exclusive_ts - 1));
        master.local_modified_at = Some(now);
        if master.sync_status == SyncStatus::Synced {
            master.sync_status = SyncStatus::PendingUpdate;
        }

        let doomed: Vec<Event> = events::list_exceptions_of(self.store.pool(), &master.id)
            .await?
            .into_iter()
            .filter(|e| e.original_instance_time.unwrap_or(i64::MAX) >= until_exclusive_ts)
            .collect();

        let index = self.sync.index().clone();
        let planner = self.sync.planner().clone();
        self.store
            .tx(move |ctx| {
                Box::pin(async move {
                    events::upsert(ctx, &master).await?;
                    for exception in &doomed {
                        planner.cancel_for(ctx, &exception.id).await?;
                        operations::delete_for_event(ctx, &exception.id).await?;
                        events::delete(ctx, &exception.id).await?;
                    }
                    let op_type = match master.sync_status {
                        SyncStatus::PendingCreate => OperationType::Create,
                        _ => OperationType::Update,
                    };
                    enqueue_op(ctx, &master.id, op_type, None, now).await?;
                    index.regenerate_for(ctx, &master.id, now).await?;
                    planner.refresh(ctx, now).await
                })
            })
            .await
    }

    async fn delete_whole_series(&self, event: &Event, now: i64) -> CalendarResult<()> {
        let master_id = event
            .original_event_id
            .clone()
            .unwrap_or_else(|| event.id.clone());
        let master = events::fetch_by_id(self.store.pool(), &master_id)
            .await?
            .unwrap_or_else(|| event.clone());
        let never_uploaded = master.caldav_url.is_none();
        let exceptions = events::list_exceptions_of(self.store.pool(), &master.id).await?;

        let planner = self.sync.planner().clone();
        self.store
            .tx(move |ctx| {
                Box::pin(async move {
                    for doomed in exceptions.iter().chain(std::iter::once(&master)) {
                        planner.cancel_for(ctx, &doomed.id).await?;
                        operations::delete_for_event(ctx, &doomed.id).await?;
                    }
                    if never_uploaded {
                        // The server never saw it; drop the series outright.
                        // Exceptions are weak references, not cascade
                        // children, so they go explicitly.
                        for exception in &exceptions {
                            events::delete(ctx, &exception.id).await?;
                        }
                        events::delete(ctx, &master.id).await?;
                        return Ok(());
                    }
                    let mut pending = master.clone();
                    pending.sync_status = SyncStatus::PendingDelete;
                    pending.local_modified_at = Some(now);
                    events::upsert(ctx, &pending).await?;
                    for exception in &exceptions {
                        let mut pending = exception.clone();
                        pending.sync_status = SyncStatus::PendingDelete;
                        events::upsert(ctx, &pending).await?;
                    }
                    enqueue_op(ctx, &master.id, OperationType::Delete, None, now).await
                })
            })
            .await
    }

    /// Queues a move; the event row switches calendars once the push lands
    /// it on the destination server.
    pub async fn move_event(&self, event_id: &str, dest_calendar_id: &str) -> CalendarResult<()> {
        let event = events::fetch_by_id(self.store.pool(), event_id)
            .await?
            .ok_or_else(|| CalendarError::NotFound {
                resource: format!("event {event_id}"),
            })?;
        let dest = calendars::fetch_by_id(self.store.pool(), dest_calendar_id)
            .await?
            .ok_or_else(|| CalendarError::NotFound {
                resource: format!("calendar {dest_calendar_id}"),
            })?;
        if dest.is_read_only {
            return Err(CalendarError::Permission {
                message: format!("calendar {} is read-only", dest.display_name),
            });
        }
        if event.calendar_id == dest.id {
            return Ok(());
        }
        let master_id = event
            .original_event_id
            .clone()
            .unwrap_or_else(|| event.id.clone());
        let dest_id = dest.id.clone();
        let now = Self::now_ms();
        self.store
            .tx(move |ctx| {
                Box::pin(async move {
                    enqueue_op(ctx, &master_id, OperationType::Move, Some(&dest_id), now).await
                })
            })
            .await
    }

    // ---- queries -------------------------------------------------------

    /// Occurrence-window query: each row pairs an occurrence with its
    /// effective event (the exception when one overrides the instance).
    pub async fn query_events(
        &self,
        start_ts: i64,
        end_ts: i64,
        calendar_ids: Option<&[String]>,
    ) -> CalendarResult<Vec<EventWithOccurrence>> {
        events::fetch_in_range(self.store.pool(), start_ts, end_ts, calendar_ids).await
    }

    /// Full-text search with each hit's next upcoming occurrence attached.
    pub async fn search_events(
        &self,
        query: &str,
        range: Option<(i64, i64)>,
    ) -> CalendarResult<Vec<EventWithNextOccurrence>> {
        let (from, to) = match range {
            Some((from, to)) => (from, Some(to)),
            None => (Self::now_ms(), None),
        };
        search::search_events(self.store.pool(), query, from, to).await
    }

    // ---- subscriptions -------------------------------------------------

    /// Adds a read-only ICS feed. Feed calendars hang off a synthetic ICS
    /// account so the ownership tree stays uniform.
    pub async fn subscribe_ics(
        &self,
        url: &str,
        name: &str,
        color: i64,
        sync_interval_hours: i64,
        username: Option<String>,
        password: Option<SecretString>,
    ) -> CalendarResult<IcsSubscription> {
        let account_id = self.ensure_ics_account().await?;
        let subscription = self
            .feeds
            .subscribe(
                &account_id,
                url,
                name,
                color,
                sync_interval_hours,
                username,
                Self::now_ms(),
            )
            .await?;
        if let Some(password) = password {
            self.credentials
                .save(&subscription_key(&subscription.id), password)
                .await?;
        }
        if let Some(runner) = &self.job_runner {
            runner
                .schedule(
                    SyncJob::RefreshIcsSubscription {
                        subscription_id: subscription.id.clone(),
                    },
                    0,
                )
                .await;
        }
        Ok(subscription)
    }

    pub async fn refresh_subscription(
        &self,
        subscription_id: &str,
        cancel: &CancellationToken,
    ) -> CalendarResult<()> {
        self.feeds
            .refresh(subscription_id, Self::now_ms(), cancel)
            .await
    }

    pub async fn refresh_due_subscriptions(
        &self,
        cancel: &CancellationToken,
    ) -> CalendarResult<usize> {
        self.feeds.refresh_due(Self::now_ms(), cancel).await
    }

    pub async fn list_subscriptions(&self) -> CalendarResult<Vec<IcsSubscription>> {
        subscriptions::list_all(self.store.pool()).await
    }

    pub async fn delete_subscription(&self, subscription_id: &str) -> CalendarResult<()> {
        if let Some(runner) = &self.job_runner {
            runner.cancel_for_subscription(subscription_id).await;
        }
        self.feeds.delete(subscription_id).await
    }

    async fn ensure_ics_account(&self) -> CalendarResult<String> {
        const ICS_EMAIL: &str = "subscriptions@local";
        if let Some(account) = accounts::fetch_by_provider_email(
            self.store.pool(),
            Provider::Ics.as_str(),
            ICS_EMAIL,
        )
        .await?
        {
            return Ok(account.id);
        }
        let account = Account {
            id: Uuid::new_v4().to_string(),
            provider: Provider::Ics,
            email: ICS_EMAIL.to_string(),
            display_name: "Subscriptions".to_string(),
            principal_url: None,
            home_set_url: None,
            is_enabled: true,
            created_at: Self::now_ms(),
            last_sync_at: None,
            last_successful_sync_at: None,
            consecutive_sync_failures: 0,
        };
        let id = account.id.clone();
        self.store
            .tx(move |ctx| Box::pin(async move { accounts::insert(ctx, &account).await }))
            .await?;
        Ok(id)
    }

    // ---- reminders -----------------------------------------------------

    /// PENDING/SNOOZED reminders due for delivery; the embedder fires the
    /// notification and reports back through the transitions below.
    pub async fn due_reminders(&self) -> CalendarResult<Vec<ScheduledReminder>> {
        reminders::list_due(self.store.pool(), Self::now_ms()).await
    }

    pub async fn mark_reminder_fired(&self, reminder_id: &str) -> CalendarResult<()> {
        let planner = self.sync.planner().clone();
        let id = reminder_id.to_string();
        self.store
            .tx(move |ctx| Box::pin(async move { planner.mark_fired(ctx, &id).await }))
            .await
    }

    pub async fn snooze_reminder(&self, reminder_id: &str, until_ms: i64) -> CalendarResult<()> {
        let planner = self.sync.planner().clone();
        let id = reminder_id.to_string();
        self.store
            .tx(move |ctx| Box::pin(async move { planner.snooze(ctx, &id, until_ms).await }))
            .await
    }

    pub async fn dismiss_reminder(&self, reminder_id: &str) -> CalendarResult<()> {
        let planner = self.sync.planner().clone();
        let id = reminder_id.to_string();
        self.store
            .tx(move |ctx| Box::pin(async move { planner.dismiss(ctx, &id).await }))
            .await
    }
}

/// Queues an operation for an event, or revives the matching queued one
/// (restarting its lifetime window) instead of stacking duplicates.
async fn enqueue_op(
    ctx: &mut StoreTx,
    event_id: &str,
    operation: OperationType,
    dest_calendar_id: Option<&str>,
    now_ms: i64,
) -> CalendarResult<()> {
    let existing = operations::list_for_event(ctx.conn(), event_id).await?;
    if let Some(op) = existing.iter().find(|op| {
        op.operation == operation && op.status != OperationStatus::InProgress
    }) {
        return operations::reset_lifetime(ctx, &op.id, now_ms).await;
    }
    operations::enqueue(
        ctx,
        &PendingOperation {
            id: Uuid::new_v4().to_string(),
            event_id: event_id.to_string(),
            operation,
            status: OperationStatus::Pending,
            retry_count: 0,
            next_retry_at: now_ms,
            last_error: None,
            failed_at: None,
            lifetime_reset_at: now_ms,
            dest_calendar_id: dest_calendar_id.map(|s| s.to_string()),
            created_at: now_ms,
        },
    )
    .await
}

/// Strips UNTIL/COUNT from an RRULE and pins a new UTC UNTIL.
fn truncate_rrule(rrule: &str, until_ts: i64) -> String {
    let kept: Vec<&str> = rrule
        .split(';')
        .filter(|part| {
            let upper = part.trim().to_ascii_uppercase();
            !upper.starts_with("UNTIL=") && !upper.starts_with("COUNT=")
        })
        .collect();
    format!(
        "{};UNTIL={}",
        kept.join(";"),
        utc_from_ms(until_ts).format("%Y%m%dT%H%M%SZ")
    )
}

fn default_server_url(provider: Provider) -> Option<&'static str> {
    match provider {
        Provider::ICloud => Some("https://caldav.icloud.com"),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_truncate_rrule() {
        let ts = crate::time::day_code_to_utc_midnight_ms(20250701).unwrap();
        assert_eq!(
            truncate_rrule("FREQ=DAILY;COUNT=10", ts),
            "FREQ=DAILY;UNTIL=20250701T000000Z"
        );
        assert_eq!(
            truncate_rrule("FREQ=WEEKLY;UNTIL=20300101T000000Z;BYDAY=MO", ts),
            "FREQ=WEEKLY;BYDAY=MO;UNTIL=20250701T000000Z"
        );
    }

    #[test]
    fn test_default_server_urls() {
        assert_eq!(
            default_server_url(Provider::ICloud),
            Some("https://caldav.icloud.com")
        );
        assert_eq!(default_server_url(Provider::GenericCalDav), None);
    }
}
