/*!
 * Push Strategy
 *
 * Drains queued local mutations against the server with optimistic
 * concurrency. Ready ops run in insertion order per calendar; network calls
 * happen outside store transactions, state changes inside short ones. A
 * recurring series is always PUT as one resource: the master body carries
 * every exception row.
 */

use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::caldav::{CalDavClient, MoveOutcome};
use crate::config::{CoreConfig, PushConfig};
use crate::error::{CalendarError, CalendarResult, ErrorKind};
use crate::ics;
use crate::occurrence::OccurrenceIndex;
use crate::store::{calendars, events, operations, sync_log, Store, StoreTx};
use crate::sync::conflict::{ConflictResolution, ConflictResolver};
use crate::sync::pull::log_entry;
use crate::types::{
    Account, Calendar, Event, OperationStatus, OperationType, PendingOperation, SyncCounts,
    SyncLogResult, SyncStatus,
};

/// Pure exponential backoff for op retries: 30s base, doubling, capped at
/// five hours. Defined for every input; negative counts coerce to zero.
pub fn calculate_retry_delay(retry_count: i64, config: &PushConfig) -> i64 {
    let n = retry_count.max(0).min(62) as u32;
    let delay = config
        .base_delay_ms
        .checked_mul(1i64 << n)
        .unwrap_or(config.max_backoff_ms);
    delay.clamp(1, config.max_backoff_ms)
}

/// Hands out an authenticated client for any account; cross-account moves
/// need the destination account's credentials.
#[async_trait]
pub trait ClientFactory: Send + Sync {
    async fn client_for(&self, account: &Account) -> CalendarResult<Arc<CalDavClient>>;
}

#[derive(Debug, Default)]
pub struct PushOutcome {
    pub counts: SyncCounts,
    pub conflicts_resolved: u32,
}

pub struct PushStrategy<'a> {
    pub store: &'a Store,
    pub client: &'a CalDavClient,
    pub index: &'a OccurrenceIndex,
    pub config: &'a CoreConfig,
    pub client_factory: Option<&'a dyn ClientFactory>,
}

impl<'a> PushStrategy<'a> {
    pub async fn push_calendar(
        &self,
        calendar: &Calendar,
        now_ms: i64,
        cancel: &CancellationToken,
    ) -> CalendarResult<PushOutcome> {
        self.housekeeping(now_ms).await?;

        let ready =
            operations::list_ready_for_calendar(self.store.pool(), &calendar.id, now_ms).await?;
        let mut outcome = PushOutcome::default();

        for op in ready {
            if cancel.is_cancelled() {
                return Err(CalendarError::Cancelled);
            }
            let op_id = op.id.clone();
            self.store
                .tx(move |ctx| {
                    Box::pin(async move {
                        operations::set_status(ctx, &op_id, OperationStatus::InProgress).await
                    })
                })
                .await?;

            let event = match events::fetch_by_id(self.store.pool(), &op.event_id).await? {
                Some(event) => event,
                None => {
                    // Row already gone (cascade or undo); the op is moot.
                    let op_id = op.id.clone();
                    self.store
                        .tx(move |ctx| {
                            Box::pin(async move { operations::delete(ctx, &op_id).await })
                        })
                        .await?;
                    continue;
                }
            };

            match self.dispatch(&op, &event, calendar, now_ms, cancel).await {
                Ok(kind) => match kind {
                    Dispatched::Created => outcome.counts.added += 1,
                    Dispatched::Updated | Dispatched::Moved => outcome.counts.updated += 1,
                    Dispatched::Deleted => outcome.counts.deleted += 1,
                    Dispatched::Requeued => {}
                },
                Err(err) => {
                    let resolved = self
                        .handle_failure(&op, &event, err, now_ms, cancel)
                        .await?;
                    outcome.conflicts_resolved += resolved;
                }
            }
        }
        Ok(outcome)
    }

    /// FAILED ops older than the reset interval get one more chance; ops
    /// past their lifetime are discarded with a log record.
    async fn housekeeping(&self, now_ms: i64) -> CalendarResult<()> {
        let auto_reset = self.config.push.auto_reset_failed_ms;
        let lifetime = self.config.push.operation_lifetime_ms;
        self.store
            .tx(move |ctx| {
                Box::pin(async move {
                    operations::reset_stale_failures(ctx, now_ms, auto_reset).await?;
                    let expired = operations::list_expired(ctx.conn(), now_ms, lifetime).await?;
                    for op in expired {
                        tracing::warn!(
                            "Discarding {} op for event {} after 30 days of failures",
                            op.operation.as_str(),
                            op.event_id
                        );
                        sync_log::append(
                            ctx,
                            &crate::types::SyncLogEntry {
                                id: Uuid::new_v4().to_string(),
                                timestamp: now_ms,
                                calendar_id: None,
                                event_uid: None,
                                result: SyncLogResult::ErrorOther,
                                message: Some(format!(
                                    "discarded expired {} operation {}",
                                    op.operation.as_str(),
                                    op.id
                                )),
                            },
                        )
                        .await?;
                        operations::delete(ctx, &op.id).await?;
                    }
                    Ok(())
                })
            })
            .await
    }

    async fn dispatch(
        &self,
        op: &PendingOperation,
        event: &Event,
        calendar: &Calendar,
        now_ms: i64,
        cancel: &CancellationToken,
    ) -> CalendarResult<Dispatched> {
        match op.operation {
            OperationType::Create => self.push_create(op, event, calendar, now_ms, cancel).await,
            OperationType::Update => self.push_update(op, event, calendar, now_ms, cancel).await,
            OperationType::Delete => self.push_delete(op, event, cancel).await,
            OperationType::Move => self.push_move(op, event, calendar, now_ms, cancel).await,
        }
    }

    /// The resource target of a push: exceptions ride along with their
    /// master, which owns the server resource.
    async fn series_of(&self, event: &Event) -> CalendarResult<(Event, Vec<Event>)> {
        let master = match &event.original_event_id {
            Some(master_id) => events::fetch_by_id(self.store.pool(), master_id)
                .await?
                .unwrap_or_else(|| event.clone()),
            None => event.clone(),
        };
        let exceptions = events::list_exceptions_of(self.store.pool(), &master.id).await?;
        Ok((master, exceptions))
    }

    async fn push_create(
        &self,
        op: &PendingOperation,
        event: &Event,
        calendar: &Calendar,
        now_ms: i64,
        cancel: &CancellationToken,
    ) -> CalendarResult<Dispatched> {
        let (master, exceptions) = self.series_of(event).await?;
        let body = ics::put_body(&master, &exceptions, now_ms);
        let (url, etag) = self
            .client
            .create_event(&calendar.caldav_url, &master.uid, &body.blob, cancel)
            .await?;

        let op_id = op.id.clone();
        let master_id = master.id.clone();
        let exception_ids: Vec<String> = exceptions.iter().map(|e| e.id.clone()).collect();
        let sequence = body.sequence;
        self.store
            .tx(move |ctx| {
                Box::pin(async move {
                    events::set_sync_state(
                        ctx,
                        &master_id,
                        SyncStatus::Synced,
                        Some(&url),
                        etag.as_deref(),
                        sequence,
                    )
                    .await?;
                    for id in &exception_ids {
                        mark_exception_synced(ctx, id, &url, etag.as_deref()).await?;
                    }
                    operations::delete(ctx, &op_id).await
                })
            })
            .await?;
        Ok(Dispatched::Created)
    }

    async fn push_update(
        &self,
        op: &PendingOperation,
        event: &Event,
        calendar: &Calendar,
        now_ms: i64,
        cancel: &CancellationToken,
    ) -> CalendarResult<Dispatched> {
        let (master, exceptions) = self.series_of(event).await?;
        let url = match &master.caldav_url {
            Some(url) => url.clone(),
            // Never uploaded: promote to a create in place.
            None => {
                self.promote_to_create(op, &master, now_ms).await?;
                return Ok(Dispatched::Requeued);
            }
        };
        let body = ics::put_body(&master, &exceptions, now_ms);
        let result = self
            .client
            .update_event(&url, &body.blob, master.etag.as_deref(), cancel)
            .await;

        match result {
            Ok(new_etag) => {
                let op_id = op.id.clone();
                let master_id = master.id.clone();
                let exception_ids: Vec<String> =
                    exceptions.iter().map(|e| e.id.clone()).collect();
                let sequence = body.sequence;
                self.store
                    .tx(move |ctx| {
                        Box::pin(async move {
                            events::set_sync_state(
                                ctx,
                                &master_id,
                                SyncStatus::Synced,
                                Some(&url),
                                new_etag.as_deref(),
                                sequence,
                            )
                            .await?;
                            for id in &exception_ids {
                                mark_exception_synced(ctx, id, &url, new_etag.as_deref()).await?;
                            }
                            operations::delete(ctx, &op_id).await
                        })
                    })
                    .await?;
                Ok(Dispatched::Updated)
            }
            Err(err) if err.kind() == ErrorKind::NotFound => {
                // The resource vanished server-side; recreate it.
                self.promote_to_create(op, &master, now_ms).await?;
                Ok(Dispatched::Requeued)
            }
            Err(err) => Err(err),
        }
    }

    async fn push_delete(
        &self,
        op: &PendingOperation,
        event: &Event,
        cancel: &CancellationToken,
    ) -> CalendarResult<Dispatched> {
        if let Some(url) = &event.caldav_url {
            // 404 remaps to success inside the client.
            self.client
                .delete_event(url, event.etag.as_deref(), cancel)
                .await?;
        }
        let exceptions = events::list_exceptions_of(self.store.pool(), &event.id).await?;
        let op_id = op.id.clone();
        let event_id = event.id.clone();
        self.store
            .tx(move |ctx| {
                Box::pin(async move {
                    // Exceptions are weak references, not cascade children.
                    for exception in &exceptions {
                        events::delete(ctx, &exception.id).await?;
                    }
                    events::delete(ctx, &event_id).await?;
                    operations::delete(ctx, &op_id).await
                })
            })
            .await?;
        Ok(Dispatched::Deleted)
    }

    async fn push_move(
        &self,
        op: &PendingOperation,
        event: &Event,
        calendar: &Calendar,
        now_ms: i64,
        cancel: &CancellationToken,
    ) -> CalendarResult<Dispatched> {
        let dest_id = op.dest_calendar_id.clone().ok_or_else(|| {
            CalendarError::other("MOVE operation without destination calendar")
        })?;
        let dest = calendars::fetch_by_id(self.store.pool(), &dest_id)
            .await?
            .ok_or_else(|| CalendarError::other("MOVE destination calendar vanished"))?;

        let src_url = match &event.caldav_url {
            Some(url) => url.clone(),
            None => {
                // Never uploaded: just retarget locally and let the queued
                // create (or a fresh one) land it in the right collection.
                let op_id = op.id.clone();
                let event_id = event.id.clone();
                let dest_cal = dest.id.clone();
                self.store
                    .tx(move |ctx| {
                        Box::pin(async move {
                            events::move_to_calendar(ctx, &event_id, &dest_cal, None, None)
                                .await?;
                            operations::set_operation(
                                ctx,
                                &op_id,
                                OperationType::Create,
                                0,
                            )
                            .await
                        })
                    })
                    .await?;
                return Ok(Dispatched::Requeued);
            }
        };

        let same_account = dest.account_id == calendar.account_id;
        if same_account {
            match self
                .client
                .move_event(&src_url, &dest.caldav_url, &event.uid, cancel)
                .await?
            {
                MoveOutcome::Moved { url, etag } => {
                    let op_id = op.id.clone();
                    let event_id = event.id.clone();
                    let dest_cal = dest.id.clone();
                    self.store
                        .tx(move |ctx| {
                            Box::pin(async move {
                                events::move_to_calendar(
                                    ctx,
                                    &event_id,
                                    &dest_cal,
                                    Some(&url),
                                    etag.as_deref(),
                                )
                                .await?;
                                operations::delete(ctx, &op_id).await
                            })
                        })
                        .await?;
                    return Ok(Dispatched::Moved);
                }
                MoveOutcome::NotSupported => {
                    tracing::debug!(
                        "Server lacks MOVE; falling back to create+delete for {}",
                        event.uid
                    );
                    return self
                        .move_by_copy(op, event, &dest, self.client, now_ms, cancel)
                        .await;
                }
            }
        }

        // Cross-account: the destination needs its own credentials, and
        // MOVE cannot cross authentication realms at all.
        let dest_account = crate::store::accounts::fetch_by_id(self.store.pool(), &dest.account_id)
            .await?
            .ok_or_else(|| CalendarError::other("MOVE destination account vanished"))?;
        let factory = self.client_factory.ok_or_else(|| {
            CalendarError::other("cross-account move requires a client factory")
        })?;
        let dest_client = factory.client_for(&dest_account).await?;
        self.move_by_copy(op, event, &dest, dest_client.as_ref(), now_ms, cancel)
            .await
    }

    /// CREATE in the destination, DELETE at the source. The source delete
    /// always runs with this strategy's own client.
    async fn move_by_copy(
        &self,
        op: &PendingOperation,
        event: &Event,
        dest: &Calendar,
        dest_client: &CalDavClient,
        now_ms: i64,
        cancel: &CancellationToken,
    ) -> CalendarResult<Dispatched> {
        let (master, exceptions) = self.series_of(event).await?;
        let body = ics::put_body(&master, &exceptions, now_ms);
        let (new_url, new_etag) = dest_client
            .create_event(&dest.caldav_url, &master.uid, &body.blob, cancel)
            .await?;
        if let Some(old_url) = &master.caldav_url {
            self.client
                .delete_event(old_url, master.etag.as_deref(), cancel)
                .await?;
        }

        let op_id = op.id.clone();
        let master_id = master.id.clone();
        let dest_cal = dest.id.clone();
        let sequence = body.sequence;
        self.store
            .tx(move |ctx| {
                Box::pin(async move {
                    events::move_to_calendar(
                        ctx,
                        &master_id,
                        &dest_cal,
                        Some(&new_url),
                        new_etag.as_deref(),
                    )
                    .await?;
                    events::set_sync_state(
                        ctx,
                        &master_id,
                        SyncStatus::Synced,
                        Some(&new_url),
                        new_etag.as_deref(),
                        sequence,
                    )
                    .await?;
                    operations::delete(ctx, &op_id).await
                })
            })
            .await?;
        Ok(Dispatched::Moved)
    }

    async fn promote_to_create(
        &self,
        op: &PendingOperation,
        master: &Event,
        now_ms: i64,
    ) -> CalendarResult<()> {
        let op_id = op.id.clone();
        let mut cleared = master.clone();
        cleared.caldav_url = None;
        cleared.etag = None;
        cleared.sync_status = SyncStatus::PendingCreate;
        self.store
            .tx(move |ctx| {
                Box::pin(async move {
                    events::upsert(ctx, &cleared).await?;
                    operations::set_operation(ctx, &op_id, OperationType::Create, now_ms).await
                })
            })
            .await
    }

    /// Failure triage per the outcome table: auth surfaces, conflicts go to
    /// the resolver, everything retryable backs off, the rest fails the op.
    /// Returns the number of conflicts resolved.
    async fn handle_failure(
        &self,
        op: &PendingOperation,
        event: &Event,
        err: CalendarError,
        now_ms: i64,
        cancel: &CancellationToken,
    ) -> CalendarResult<u32> {
        match err.kind() {
            ErrorKind::Auth => {
                let op_id = op.id.clone();
                let event_id = event.id.clone();
                let message = err.to_string();
                self.store
                    .tx(move |ctx| {
                        Box::pin(async move {
                            operations::mark_failed(ctx, &op_id, now_ms, &message).await?;
                            events::record_sync_error(ctx, &event_id, &message).await
                        })
                    })
                    .await?;
                // Surfaced so the caller can trigger re-authentication.
                Err(err)
            }
            ErrorKind::Conflict => {
                let resolver = ConflictResolver {
                    store: self.store,
                    client: self.client,
                    index: self.index,
                };
                match resolver.resolve(event, now_ms, None, cancel).await? {
                    ConflictResolution::AcceptedRemote => {
                        // Resolver dropped the ops already.
                        Ok(1)
                    }
                    ConflictResolution::Rebased => Ok(1),
                    ConflictResolution::RemoteGone => {
                        let (master, _) = self.series_of(event).await?;
                        self.promote_to_create(op, &master, now_ms).await?;
                        Ok(1)
                    }
                }
            }
            ErrorKind::Cancelled => {
                // Put the op back; the next drain picks it up immediately.
                let op_id = op.id.clone();
                let retry_count = op.retry_count;
                self.store
                    .tx(move |ctx| {
                        Box::pin(async move {
                            operations::requeue(ctx, &op_id, retry_count, now_ms, "cancelled")
                                .await
                        })
                    })
                    .await?;
                Err(CalendarError::Cancelled)
            }
            _ if err.is_retryable() => {
                let next_count = op.retry_count + 1;
                let op_id = op.id.clone();
                let event_id = event.id.clone();
                let message = err.to_string();
                let max_retries = self.config.push.max_retries;
                let delay = calculate_retry_delay(next_count, &self.config.push);
                self.store
                    .tx(move |ctx| {
                        Box::pin(async move {
                            events::record_sync_error(ctx, &event_id, &message).await?;
                            if next_count >= max_retries {
                                operations::mark_failed(ctx, &op_id, now_ms, &message).await
                            } else {
                                operations::requeue(
                                    ctx,
                                    &op_id,
                                    next_count,
                                    now_ms + delay,
                                    &message,
                                )
                                .await
                            }
                        })
                    })
                    .await?;
                Ok(0)
            }
            _ => {
                let op_id = op.id.clone();
                let event_id = event.id.clone();
                let calendar_id = event.calendar_id.clone();
                let uid = event.uid.clone();
                let message = err.to_string();
                self.store
                    .tx(move |ctx| {
                        Box::pin(async move {
                            operations::mark_failed(ctx, &op_id, now_ms, &message).await?;
                            events::record_sync_error(ctx, &event_id, &message).await?;
                            sync_log::append(
                                ctx,
                                &log_entry(
                                    &calendar_id,
                                    Some(&uid),
                                    SyncLogResult::ErrorOther,
                                    &message,
                                    now_ms,
                                ),
                            )
                            .await
                        })
                    })
                    .await?;
                Ok(0)
            }
        }
    }
}

enum Dispatched {
    Created,
    Updated,
    Deleted,
    Moved,
    Requeued,
}

/// Exceptions share their master's resource; after a successful series PUT
/// they are SYNCED at the master's URL with the master's etag.
async fn mark_exception_synced(
    ctx: &mut StoreTx,
    exception_id: &str,
    url: &str,
    etag: Option<&str>,
) -> CalendarResult<()> {
    if let Some(exception) = events::fetch_by_id(ctx.conn(), exception_id).await? {
        events::set_sync_state(
            ctx,
            exception_id,
            SyncStatus::Synced,
            Some(url),
            etag,
            exception.sequence,
        )
        .await?;
    }
    Ok(())
}
