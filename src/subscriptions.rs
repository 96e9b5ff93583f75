/*!
 * ICS Feed Subscriptions
 *
 * One-way ingestion of public iCal feeds into read-only calendars. Refresh
 * is validator-driven (ETag / Last-Modified); events land SYNCED and are
 * keyed by a synthetic URL so the CalDAV pipeline can never mistake them
 * for server resources. Feed failures fill `last_error` and never disable
 * the subscription on their own.
 */

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use secrecy::ExposeSecret;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::config::CoreConfig;
use crate::credentials::{subscription_key, CredentialStore};
use crate::error::{CalendarError, CalendarResult};
use crate::ics::{self, ParsedEvent};
use crate::occurrence::OccurrenceIndex;
use crate::reminders::ReminderPlanner;
use crate::store::{calendars, events, subscriptions, Store, StoreTx};
use crate::types::{Calendar, Event, IcsSubscription, SyncStatus};

pub fn synthetic_event_url(subscription_id: &str, uid: &str) -> String {
    format!("ics_subscription:{subscription_id}:{uid}")
}

/// webcal(s):// is an alias for an HTTP(S) iCal resource.
pub fn normalize_feed_url(url: &str) -> String {
    let trimmed = url.trim();
    if let Some(rest) = trimmed.strip_prefix("webcals://") {
        return format!("https://{rest}");
    }
    if let Some(rest) = trimmed.strip_prefix("webcal://") {
        return format!("https://{rest}");
    }
    trimmed.to_string()
}

pub struct IcsSubscriptionService {
    store: Store,
    config: Arc<CoreConfig>,
    index: OccurrenceIndex,
    planner: ReminderPlanner,
    credentials: Arc<dyn CredentialStore>,
    http: reqwest::Client,
}

impl IcsSubscriptionService {
    pub fn new(
        store: Store,
        config: Arc<CoreConfig>,
        credentials: Arc<dyn CredentialStore>,
    ) -> CalendarResult<Self> {
        let http = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(config.http.connect_timeout_secs))
            .timeout(Duration::from_secs(
                config.http.connect_timeout_secs + config.http.read_timeout_secs,
            ))
            .user_agent("MeridianCalendar/1.0")
            .build()
            .map_err(|e| CalendarError::network(format!("failed to build HTTP client: {e}")))?;
        Ok(Self {
            index: OccurrenceIndex::new(&config),
            planner: ReminderPlanner::new(&config),
            store,
            config,
            credentials,
            http,
        })
    }

    /// Creates the subscription and its backing read-only calendar. The
    /// first refresh is the caller's move (usually via the job runner).
    pub async fn subscribe(
        &self,
        account_id: &str,
        url: &str,
        name: &str,
        color: i64,
        sync_interval_hours: i64,
        username: Option<String>,
        now_ms: i64,
    ) -> CalendarResult<IcsSubscription> {
        let subscription_id = Uuid::new_v4().to_string();
        let calendar = Calendar {
            id: Uuid::new_v4().to_string(),
            account_id: account_id.to_string(),
            caldav_url: format!("ics_subscription:{subscription_id}"),
            display_name: name.to_string(),
            color,
            ctag: None,
            sync_token: None,
            is_visible: true,
            is_default: false,
            is_read_only: true,
            sort_order: 0,
        };
        let subscription = IcsSubscription {
            id: subscription_id,
            url: normalize_feed_url(url),
            name: name.to_string(),
            color,
            calendar_id: calendar.id.clone(),
            last_sync: 0,
            sync_interval_hours: sync_interval_hours.max(1),
            enabled: true,
            etag: None,
            last_modified: None,
            username,
            last_error: None,
            created_at: now_ms,
        };

        let sub_clone = subscription.clone();
        self.store
            .tx(move |ctx| {
                Box::pin(async move {
                    calendars::insert(ctx, &calendar).await?;
                    subscriptions::insert(ctx, &sub_clone).await
                })
            })
            .await?;
        Ok(subscription)
    }

    /// Refreshes one feed. Errors are recorded on the subscription and then
    /// propagated for the caller's logging; the subscription stays enabled.
    pub async fn refresh(
        &self,
        subscription_id: &str,
        now_ms: i64,
        cancel: &CancellationToken,
    ) -> CalendarResult<()> {
        let subscription = subscriptions::fetch_by_id(self.store.pool(), subscription_id)
            .await?
            .ok_or_else(|| CalendarError::NotFound {
                resource: format!("subscription {subscription_id}"),
            })?;
        if !subscription.enabled {
            return Ok(());
        }

        match self.refresh_inner(&subscription, now_ms, cancel).await {
            Ok(()) => Ok(()),
            Err(err) => {
                let id = subscription.id.clone();
                let message = err.to_string();
                self.store
                    .tx(move |ctx| {
                        Box::pin(async move {
                            subscriptions::record_error(ctx, &id, &message).await
                        })
                    })
                    .await?;
                Err(err)
            }
        }
    }

    /// Refreshes every due subscription, skipping over individual failures.
    pub async fn refresh_due(
        &self,
        now_ms: i64,
        cancel: &CancellationToken,
    ) -> CalendarResult<usize> {
        let due = subscriptions::list_due(self.store.pool(), now_ms).await?;
        let mut refreshed = 0;
        for subscription in due {
            if cancel.is_cancelled() {
                return Err(CalendarError::Cancelled);
            }
            match self.refresh(&subscription.id, now_ms, cancel).await {
                Ok(()) => refreshed += 1,
                Err(err) => {
                    tracing::warn!("Feed refresh failed for {}: {}", subscription.name, err);
                }
            }
        }
        Ok(refreshed)
    }

    async fn refresh_inner(
        &self,
        subscription: &IcsSubscription,
        now_ms: i64,
        cancel: &CancellationToken,
    ) -> CalendarResult<()> {
        let url = normalize_feed_url(&subscription.url);
        let mut request = self.http.get(&url).header("Accept", "text/calendar");
        if let Some(etag) = &subscription.etag {
            request = request.header("If-None-Match", etag.clone());
        }
        if let Some(last_modified) = &subscription.last_modified {
            request = request.header("If-Modified-Since", last_modified.clone());
        }
        if let Some(username) = &subscription.username {
            if let Some(password) = self
                .credentials
                .get(&subscription_key(&subscription.id))
                .await?
            {
                use base64::Engine as _;
                let raw = format!("{}:{}", username, password.expose_secret());
                let encoded = base64::engine::general_purpose::STANDARD.encode(raw.as_bytes());
                request = request.header("Authorization", format!("Basic {encoded}"));
            }
        }

        let response = tokio::select! {
            _ = cancel.cancelled() => return Err(CalendarError::Cancelled),
            result = request.send() => result.map_err(|e| CalendarError::from_reqwest(&e))?,
        };

        let status = response.status();
        if status.as_u16() == 304 {
            let id = subscription.id.clone();
            let etag = subscription.etag.clone();
            let last_modified = subscription.last_modified.clone();
            return self
                .store
                .tx(move |ctx| {
                    Box::pin(async move {
                        subscriptions::record_refresh(
                            ctx,
                            &id,
                            now_ms,
                            etag.as_deref(),
                            last_modified.as_deref(),
                        )
                        .await
                    })
                })
                .await;
        }
        if !status.is_success() {
            return Err(CalendarError::other(format!(
                "feed returned {status} for {url}"
            )));
        }

        let new_etag = header_string(&response, "ETag");
        let new_last_modified = header_string(&response, "Last-Modified");
        if let Some(len) = response.content_length() {
            if len > self.config.http.max_body_bytes {
                return Err(CalendarError::ResponseTooLarge {
                    url,
                    limit_bytes: self.config.http.max_body_bytes,
                });
            }
        }
        let body = response
            .text()
            .await
            .map_err(|e| CalendarError::from_reqwest(&e))?;
        if body.len() as u64 > self.config.http.max_body_bytes {
            return Err(CalendarError::ResponseTooLarge {
                url,
                limit_bytes: self.config.http.max_body_bytes,
            });
        }

        let parsed = ics::parse_events(&body)?;
        tracing::info!(
            "Feed {} delivered {} event(s)",
            subscription.name,
            parsed.len()
        );

        let subscription = subscription.clone();
        let index = self.index.clone();
        let planner = self.planner.clone();
        self.store
            .tx(move |ctx| {
                Box::pin(async move {
                    apply_feed(ctx, &index, &subscription, &parsed, now_ms).await?;
                    subscriptions::record_refresh(
                        ctx,
                        &subscription.id,
                        now_ms,
                        new_etag.as_deref(),
                        new_last_modified.as_deref(),
                    )
                    .await?;
                    planner.refresh(ctx, now_ms).await
                })
            })
            .await
    }

    pub async fn set_enabled(&self, subscription_id: &str, enabled: bool) -> CalendarResult<()> {
        let id = subscription_id.to_string();
        self.store
            .tx(move |ctx| {
                Box::pin(async move { subscriptions::set_enabled(ctx, &id, enabled).await })
            })
            .await
    }

    /// Removes the subscription, its calendar and (through the cascade) all
    /// of its events and occurrences.
    pub async fn delete(&self, subscription_id: &str) -> CalendarResult<()> {
        let subscription = subscriptions::fetch_by_id(self.store.pool(), subscription_id).await?;
        if let Err(err) = self
            .credentials
            .delete(&subscription_key(subscription_id))
            .await
        {
            tracing::warn!("Failed to drop feed credentials: {err}");
        }
        if let Some(subscription) = subscription {
            self.store
                .tx(move |ctx| {
                    Box::pin(async move {
                        subscriptions::delete(ctx, &subscription.id).await?;
                        calendars::delete(ctx, &subscription.calendar_id).await
                    })
                })
                .await?;
        }
        Ok(())
    }
}

/// Reconciles the feed's events against the subscription's calendar.
/// Everything lands SYNCED; rows absent from the feed are removed.
async fn apply_feed(
    ctx: &mut StoreTx,
    index: &OccurrenceIndex,
    subscription: &IcsSubscription,
    parsed: &[ParsedEvent],
    now_ms: i64,
) -> CalendarResult<()> {
    let existing = events::list_for_calendar(ctx.conn(), &subscription.calendar_id).await?;
    let by_key: HashMap<(String, Option<i64>), Event> = existing
        .into_iter()
        .map(|e| ((e.uid.clone(), e.original_instance_time), e))
        .collect();

    let mut seen: HashSet<(String, Option<i64>)> = HashSet::new();
    let mut touched_masters: HashSet<String> = HashSet::new();
    let mut master_ids: HashMap<String, String> = HashMap::new();

    // Masters first so exceptions can link to them.
    let mut ordered: Vec<&ParsedEvent> = parsed.iter().collect();
    ordered.sort_by_key(|p| p.recurrence_id.is_some());

    for event in ordered {
        let key = (event.uid.clone(), event.recurrence_id);
        if !seen.insert(key.clone()) {
            // Duplicate uid within one feed; first occurrence wins.
            continue;
        }
        let master_link = event
            .recurrence_id
            .and_then(|_| master_ids.get(&event.uid).cloned());
        let row = feed_row(
            by_key.get(&key),
            event,
            subscription,
            master_link.clone(),
        );
        events::upsert(ctx, &row).await?;
        match &master_link {
            Some(master_id) => {
                touched_masters.insert(master_id.clone());
                index.attach_exception(ctx, &row).await?;
            }
            None => {
                master_ids.insert(row.uid.clone(), row.id.clone());
                touched_masters.insert(row.id.clone());
            }
        }
    }

    for (key, event) in &by_key {
        if !seen.contains(key) {
            events::delete(ctx, &event.id).await?;
            touched_masters.remove(&event.id);
        }
    }

    for master_id in &touched_masters {
        index.regenerate_for(ctx, master_id, now_ms).await?;
    }
    Ok(())
}

fn feed_row(
    existing: Option<&Event>,
    parsed: &ParsedEvent,
    subscription: &IcsSubscription,
    master_link: Option<String>,
) -> Event {
    Event {
        id: existing
            .map(|e| e.id.clone())
            .unwrap_or_else(|| Uuid::new_v4().to_string()),
        uid: parsed.uid.clone(),
        import_id: parsed.uid.clone(),
        calendar_id: subscription.calendar_id.clone(),
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
        // Feed events are never patched back; the blob is not kept.
        raw_ical: None,
        dtstamp: parsed.dtstamp,
        caldav_url: Some(synthetic_event_url(&subscription.id, &parsed.uid)),
        etag: None,
        sequence: parsed.sequence,
        sync_status: SyncStatus::Synced,
        last_sync_error: None,
        sync_retry_count: 0,
        parser_version: ics::PARSER_VERSION,
        local_modified_at: None,
        server_modified_at: parsed.last_modified.or(Some(parsed.dtstamp)),
    }
}

fn header_string(response: &reqwest::Response, name: &str) -> Option<String> {
    response
        .headers()
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_feed_url() {
        assert_eq!(
            normalize_feed_url("webcal://example.com/cal.ics"),
            "https://example.com/cal.ics"
        );
        assert_eq!(
            normalize_feed_url("webcals://example.com/cal.ics"),
            "https://example.com/cal.ics"
        );
        assert_eq!(
            normalize_feed_url("https://example.com/cal.ics"),
            "https://example.com/cal.ics"
        );
    }

    #[test]
    fn test_synthetic_url_shape() {
        assert_eq!(
            synthetic_event_url("sub-1", "uid-9"),
            "ics_subscription:sub-1:uid-9"
        );
    }
}
