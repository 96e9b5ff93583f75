/*!
 * Sync Engine
 *
 * `sync_calendar` is the unit of work: lease → pull → occurrence regen →
 * conflict resolution → push → reminder planning → account counters, in
 * that order, so reminder planning always sees a view including the pull.
 * Leases serialize work per calendar; a per-account semaphore bounds
 * parallel calendars against shared rate limits.
 */

use std::sync::Arc;
use std::time::Instant;

use dashmap::DashMap;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::caldav::CalDavClient;
use crate::config::CoreConfig;
use crate::credentials::CredentialStore;
use crate::error::{CalendarError, CalendarResult};
use crate::jobs::JobRunner;
use crate::occurrence::OccurrenceIndex;
use crate::reminders::ReminderPlanner;
use crate::store::{accounts, calendars, events, operations, Store};
use crate::sync::conflict::ConflictResolver;
use crate::sync::pull::PullStrategy;
use crate::sync::push::{ClientFactory, PushStrategy};
use crate::types::{Calendar, ScheduledReminder, SyncOutcome};

#[derive(Debug, Clone)]
struct Lease {
    token: String,
    expires_at: i64,
}

pub struct SyncEngine {
    store: Store,
    config: Arc<CoreConfig>,
    index: OccurrenceIndex,
    planner: ReminderPlanner,
    leases: DashMap<String, Lease>,
    account_limits: DashMap<String, Arc<Semaphore>>,
}

impl SyncEngine {
    pub fn new(store: Store, config: Arc<CoreConfig>) -> Self {
        Self {
            index: OccurrenceIndex::new(&config),
            planner: ReminderPlanner::new(&config),
            store,
            config,
            leases: DashMap::new(),
            account_limits: DashMap::new(),
        }
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    pub fn index(&self) -> &OccurrenceIndex {
        &self.index
    }

    pub fn planner(&self) -> &ReminderPlanner {
        &self.planner
    }

    /// Synchronizes one calendar. Returns `Busy` without blocking when a
    /// sync for the same calendar is already running; two consecutive runs
    /// with no changes anywhere produce an all-zero outcome.
    pub async fn sync_calendar(
        &self,
        client: &CalDavClient,
        client_factory: Option<&dyn ClientFactory>,
        calendar_id: &str,
        force_full: bool,
        cancel: &CancellationToken,
    ) -> CalendarResult<SyncOutcome> {
        let now_ms = chrono::Utc::now().timestamp_millis();
        let calendar = calendars::fetch_by_id(self.store.pool(), calendar_id)
            .await?
            .ok_or_else(|| CalendarError::NotFound {
                resource: format!("calendar {calendar_id}"),
            })?;

        let _lease = self.acquire_lease(calendar_id, now_ms)?;
        let semaphore = self
            .account_limits
            .entry(calendar.account_id.clone())
            .or_insert_with(|| Arc::new(Semaphore::new(self.config.max_parallel_per_account)))
            .clone();
        let _permit = semaphore
            .acquire_owned()
            .await
            .map_err(|_| CalendarError::Cancelled)?;

        let started = Instant::now();
        let result = self
            .run_sync(client, client_factory, &calendar, force_full, now_ms, cancel)
            .await;

        let success = result.is_ok();
        let account_id = calendar.account_id.clone();
        let end_ms = chrono::Utc::now().timestamp_millis();
        self.store
            .tx(move |ctx| {
                Box::pin(async move {
                    accounts::record_sync_outcome(ctx, &account_id, end_ms, success).await
                })
            })
            .await?;

        result.map(|mut outcome| {
            outcome.duration_ms = started.elapsed().as_millis() as i64;
            outcome
        })
    }

    async fn run_sync(
        &self,
        client: &CalDavClient,
        client_factory: Option<&dyn ClientFactory>,
        calendar: &Calendar,
        force_full: bool,
        now_ms: i64,
        cancel: &CancellationToken,
    ) -> CalendarResult<SyncOutcome> {
        let mut outcome = SyncOutcome {
            calendar_id: calendar.id.clone(),
            ..Default::default()
        };

        // Pull completes fully before push begins.
        let pull = PullStrategy {
            store: &self.store,
            client,
            index: &self.index,
            config: &self.config,
        };
        let pulled = pull.pull_calendar(calendar, force_full, now_ms, cancel).await?;
        outcome.pulled = pulled.counts;

        // Conflicts the pull detected (server sequence raced a queued
        // update) are resolved before the push would collide on them.
        let resolver = ConflictResolver {
            store: &self.store,
            client,
            index: &self.index,
        };
        for conflict in pulled.conflicts {
            if let Some(event) = events::fetch_by_id(self.store.pool(), &conflict.event_id).await? {
                resolver
                    .resolve(&event, now_ms, Some(conflict.remote), cancel)
                    .await?;
                outcome.conflicts_resolved += 1;
            }
        }

        if !calendar.is_read_only {
            let push = PushStrategy {
                store: &self.store,
                client,
                index: &self.index,
                config: &self.config,
                client_factory,
            };
            let pushed = push.push_calendar(calendar, now_ms, cancel).await?;
            outcome.pushed = pushed.counts;
            outcome.conflicts_resolved += pushed.conflicts_resolved;
        }

        // Reminder planning runs last so it sees the post-sync state.
        let planner = self.planner.clone();
        self.store
            .tx(move |ctx| Box::pin(async move { planner.refresh(ctx, now_ms).await }))
            .await?;

        Ok(outcome)
    }

    /// Non-reentrant, time-bounded per-calendar lease. Stale leases (held
    /// past the configured bound by a crashed or wedged task) are reclaimed.
    fn acquire_lease(&self, calendar_id: &str, now_ms: i64) -> CalendarResult<LeaseGuard<'_>> {
        let token = Uuid::new_v4().to_string();
        let expires_at = now_ms + self.config.sync_lease_ms;

        let mut acquired = false;
        self.leases
            .entry(calendar_id.to_string())
            .and_modify(|lease| {
                if lease.expires_at <= now_ms {
                    tracing::warn!("Reclaiming stale sync lease for {calendar_id}");
                    lease.token = token.clone();
                    lease.expires_at = expires_at;
                    acquired = true;
                }
            })
            .or_insert_with(|| {
                acquired = true;
                Lease {
                    token: token.clone(),
                    expires_at,
                }
            });

        if acquired {
            Ok(LeaseGuard {
                leases: &self.leases,
                calendar_id: calendar_id.to_string(),
                token,
            })
        } else {
            Err(CalendarError::Busy {
                calendar_id: calendar_id.to_string(),
            })
        }
    }

    /// Deletes an account through the strictly ordered protocol: cancel
    /// jobs, cancel reminders and drop pending ops (both need event ids the
    /// cascade is about to destroy), delete credentials, then delete the
    /// account row and let the cascade run. Returns the cancelled reminders
    /// so external alarms can be torn down.
    pub async fn delete_account(
        &self,
        account_id: &str,
        credential_store: &dyn CredentialStore,
        job_runner: Option<&dyn JobRunner>,
    ) -> CalendarResult<Vec<ScheduledReminder>> {
        if let Some(runner) = job_runner {
            runner.cancel_for_account(account_id).await;
        }

        let planner = self.planner.clone();
        let account_owned = account_id.to_string();
        let cancelled = self
            .store
            .tx(move |ctx| {
                Box::pin(async move {
                    let mut cancelled = Vec::new();
                    for calendar in calendars::list_for_account(ctx.conn(), &account_owned).await? {
                        for event in events::list_for_calendar(ctx.conn(), &calendar.id).await? {
                            cancelled.extend(planner.cancel_for(ctx, &event.id).await?);
                            operations::delete_for_event(ctx, &event.id).await?;
                        }
                    }
                    Ok(cancelled)
                })
            })
            .await?;

        // Credential removal is non-fatal: a wiped keychain must not leave
        // the account undeletable.
        if let Err(err) = credential_store.delete_account(account_id).await {
            tracing::warn!("Failed to delete credentials for {account_id}: {err}");
        }

        let account_owned = account_id.to_string();
        self.store
            .tx(move |ctx| Box::pin(async move { accounts::delete(ctx, &account_owned).await }))
            .await?;

        Ok(cancelled)
    }
}

#[derive(Debug)]
struct LeaseGuard<'a> {
    leases: &'a DashMap<String, Lease>,
    calendar_id: String,
    token: String,
}

impl Drop for LeaseGuard<'_> {
    fn drop(&mut self) {
        // Only release a lease this guard still owns; a reclaimed lease
        // belongs to the newer task.
        self.leases
            .remove_if(&self.calendar_id, |_, lease| lease.token == self.token);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::Store;

    #[tokio::test]
    async fn test_lease_is_exclusive_and_reclaimable() {
        let store = Store::open_in_memory().await.unwrap();
        let engine = SyncEngine::new(store, Arc::new(CoreConfig::default()));

        let guard = engine.acquire_lease("c1", 1_000).unwrap();
        // Second acquisition while held is Busy.
        let err = engine.acquire_lease("c1", 2_000).unwrap_err();
        assert!(matches!(err, CalendarError::Busy { .. }));
        // Other calendars are unaffected.
        let _other = engine.acquire_lease("c2", 2_000).unwrap();

        drop(guard);
        engine.acquire_lease("c1", 3_000).unwrap();
    }

    #[tokio::test]
    async fn test_stale_lease_reclaimed() {
        let store = Store::open_in_memory().await.unwrap();
        let engine = SyncEngine::new(store, Arc::new(CoreConfig::default()));

        let stale = engine.acquire_lease("c1", 1_000).unwrap();
        // Past the five-minute bound the lease is stale and a new task may
        // take it over.
        let reclaim_at = 1_000 + CoreConfig::default().sync_lease_ms + 1;
        let _fresh = engine.acquire_lease("c1", reclaim_at).unwrap();

        // The stale guard's drop must not evict the fresh owner.
        drop(stale);
        let err = engine.acquire_lease("c1", reclaim_at + 1).unwrap_err();
        assert!(matches!(err, CalendarError::Busy { .. }));
    }
}
