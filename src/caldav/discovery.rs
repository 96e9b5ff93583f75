/*!
 * Account & Collection Discovery
 *
 * Bootstraps an account: connection probe, RFC 6764 well-known resolution,
 * principal and calendar-home lookup, then collection listing. Discovered
 * calendars are upserted keyed on their normalized URL; their ctag is never
 * persisted here so the first pull always fetches events.
 */

use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::caldav::client::CalDavClient;
use crate::error::{CalendarResult, ErrorKind};
use crate::store::{accounts, calendars, Store};
use crate::types::{Account, Calendar, Provider};

#[derive(Debug, Clone)]
pub struct DiscoveredAccount {
    pub account: Account,
    pub calendars: Vec<Calendar>,
}

/// Runs the discovery chain for an account and persists the results. Safe
/// to re-run: the account row is reused and collections are upserted by URL.
pub async fn discover_account(
    store: &Store,
    client: &CalDavClient,
    provider: Provider,
    email: &str,
    display_name: &str,
    server_url: &str,
    now_ms: i64,
    cancel: &CancellationToken,
) -> CalendarResult<DiscoveredAccount> {
    let quirks = *client.quirks();

    if let Err(err) = client.check_connection(server_url, cancel).await {
        match err.kind() {
            // Proxies often hide the DAV header outside the caldav path;
            // discovery continues and fails later if the server really
            // cannot speak CalDAV.
            ErrorKind::Other | ErrorKind::NotFound => {
                tracing::warn!("calendar-access probe inconclusive for {server_url}: {err}");
            }
            _ => return Err(err),
        }
    }

    let base = match client.discover_well_known(server_url, cancel).await {
        Ok(resolved) => resolved,
        Err(err) if matches!(err.kind(), ErrorKind::NotFound | ErrorKind::Permission | ErrorKind::Other | ErrorKind::Malformed) => {
            tracing::debug!("well-known lookup failed for {server_url} ({err}); using base URL");
            quirks.normalize_url(server_url)
        }
        Err(err) => return Err(err),
    };

    let principal_url = client.discover_principal(&base, cancel).await?;
    let home_url = client.discover_calendar_home(&principal_url, cancel).await?;
    let remote = client.list_calendars(&home_url, cancel).await?;
    tracing::info!(
        "Discovered {} calendar(s) under {} for {}",
        remote.len(),
        home_url,
        email
    );

    let provider_tag = provider.as_str();
    let email_owned = email.to_string();
    let display_owned = display_name.to_string();
    let principal_owned = principal_url.clone();
    let home_owned = home_url.clone();

    store
        .tx(move |ctx| {
            Box::pin(async move {
                let existing =
                    accounts::fetch_by_provider_email(ctx.conn(), provider_tag, &email_owned)
                        .await?;
                let is_new_account = existing.is_none();
                let account_id = match &existing {
                    Some(account) => account.id.clone(),
                    None => {
                        let account = Account {
                            id: Uuid::new_v4().to_string(),
                            provider,
                            email: email_owned.clone(),
                            display_name: display_owned.clone(),
                            principal_url: Some(principal_owned.clone()),
                            home_set_url: Some(home_owned.clone()),
                            is_enabled: true,
                            created_at: now_ms,
                            last_sync_at: None,
                            last_successful_sync_at: None,
                            consecutive_sync_failures: 0,
                        };
                        accounts::insert(ctx, &account).await?;
                        account.id.clone()
                    }
                };
                if existing.is_some() {
                    accounts::set_discovery_urls(
                        ctx,
                        &account_id,
                        Some(&principal_owned),
                        Some(&home_owned),
                    )
                    .await?;
                }

                let had_calendars = !calendars::list_for_account(ctx.conn(), &account_id)
                    .await?
                    .is_empty();

                let mut first_id: Option<String> = None;
                for (index, cal) in remote.iter().enumerate() {
                    let row = Calendar {
                        id: Uuid::new_v4().to_string(),
                        account_id: account_id.clone(),
                        caldav_url: cal.url.clone(),
                        display_name: cal.display_name.clone(),
                        color: cal
                            .color
                            .as_deref()
                            .and_then(parse_color)
                            .unwrap_or(DEFAULT_COLOR),
                        ctag: None,
                        sync_token: None,
                        is_visible: true,
                        is_default: false,
                        is_read_only: cal.is_read_only,
                        sort_order: index as i64,
                    };
                    let id = calendars::upsert_by_url(ctx, &row).await?;
                    if first_id.is_none() {
                        first_id = Some(id);
                    }
                }

                // The first collection of a brand-new account becomes the
                // default target for local creates.
                if is_new_account && !had_calendars {
                    if let Some(first) = &first_id {
                        calendars::set_default(ctx, &account_id, first).await?;
                    }
                }

                let account = accounts::fetch_by_id(ctx.conn(), &account_id)
                    .await?
                    .ok_or_else(|| {
                        crate::error::CalendarError::store("discovery", "account vanished mid-tx")
                    })?;
                let persisted = calendars::list_for_account(ctx.conn(), &account_id).await?;
                Ok(DiscoveredAccount {
                    account,
                    calendars: persisted,
                })
            })
        })
        .await
}

const DEFAULT_COLOR: i64 = 0xFF21_96F3; // material blue

/// Parses `#RRGGBB` or `#RRGGBBAA` (Apple's calendar-color form) into ARGB.
pub fn parse_color(value: &str) -> Option<i64> {
    let hex = value.trim().strip_prefix('#')?;
    match hex.len() {
        6 => {
            let rgb = i64::from_str_radix(hex, 16).ok()?;
            Some(0xFF00_0000 | rgb)
        }
        8 => {
            let rgba = i64::from_str_radix(hex, 16).ok()?;
            let alpha = rgba & 0xFF;
            let rgb = rgba >> 8;
            Some((alpha << 24) | rgb)
        }
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_color() {
        assert_eq!(parse_color("#1976D2"), Some(0xFF19_76D2));
        assert_eq!(parse_color("#1976D2FF"), Some(0xFF19_76D2u32 as i64));
        // Half-transparent alpha lands in the top byte.
        assert_eq!(parse_color("#11223380"), Some(0x8011_2233));
        assert_eq!(parse_color("1976D2"), None);
        assert_eq!(parse_color("#xyz"), None);
    }
}
