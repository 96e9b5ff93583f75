/*!
 * Per-Provider Quirks
 *
 * One capability object per provider, dispatched by matching on the
 * provider tag. Everything servers disagree on lives here: XML namespace
 * variance (handled structurally by the local-name parser), URL shapes,
 * host normalization, and the two meanings of 403.
 */

use url::Url;

use crate::caldav::xml::{parse_multistatus, MultiStatus};
use crate::error::{CalendarError, CalendarResult};
use crate::time::format_caldav_datetime;
use crate::types::Provider;

/// A collection as discovered on the server, before it becomes a store row.
#[derive(Debug, Clone)]
pub struct RemoteCalendar {
    pub href: String,
    pub url: String,
    pub display_name: String,
    pub color: Option<String>,
    pub ctag: Option<String>,
    pub is_read_only: bool,
}

/// An event resource fetched from a collection.
#[derive(Debug, Clone)]
pub struct RemoteEvent {
    pub href: String,
    pub url: String,
    pub etag: Option<String>,
    pub ical_data: String,
}

/// Outcome of a sync-collection REPORT.
#[derive(Debug, Clone, Default)]
pub struct SyncCollectionReport {
    pub new_token: Option<String>,
    pub changed: Vec<(String, Option<String>)>,
    pub deleted: Vec<String>,
    pub truncated: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Quirks {
    provider: Provider,
}

impl Quirks {
    pub fn new(provider: Provider) -> Self {
        Self { provider }
    }

    pub fn provider(&self) -> Provider {
        self.provider
    }

    pub fn user_agent(&self) -> &'static str {
        "MeridianCalendar/1.0"
    }

    /// iCloud hands out regional hosts (`p42-caldav.icloud.com`) in
    /// redirects and hrefs; they all serve the same data, so URLs are
    /// canonicalized before anything is stored or compared.
    pub fn normalize_url(&self, input: &str) -> String {
        if self.provider != Provider::ICloud {
            return input.to_string();
        }
        let mut url = match Url::parse(input) {
            Ok(url) => url,
            Err(_) => return input.to_string(),
        };
        if let Some(host) = url.host_str() {
            if is_regional_icloud_host(host) {
                let _ = url.set_host(Some("caldav.icloud.com"));
            }
        }
        url.to_string()
    }

    /// Resolves an href from a 207 body into an absolute collection URL on
    /// the (normalized) base host.
    pub fn build_calendar_url(&self, href: &str, base: &str) -> CalendarResult<String> {
        let base_url = Url::parse(&self.normalize_url(base))
            .map_err(|e| CalendarError::malformed("url", e.to_string()))?;
        let joined = base_url
            .join(href)
            .map_err(|e| CalendarError::malformed("url", e.to_string()))?;
        Ok(self.normalize_url(joined.as_str()))
    }

    /// Resolves an event href against its calendar URL.
    pub fn build_event_url(&self, href: &str, calendar_url: &str) -> String {
        match Url::parse(&self.normalize_url(calendar_url)) {
            Ok(base) => match base.join(href) {
                Ok(joined) => self.normalize_url(joined.as_str()),
                Err(_) => format!(
                    "{}/{}",
                    calendar_url.trim_end_matches('/'),
                    href.trim_start_matches('/')
                ),
            },
            Err(_) => format!(
                "{}/{}",
                calendar_url.trim_end_matches('/'),
                href.trim_start_matches('/')
            ),
        }
    }

    pub fn extract_principal_url(&self, body: &str, base: &str) -> CalendarResult<String> {
        let ms = parse_multistatus(body)?;
        let href = ms
            .responses
            .iter()
            .find_map(|r| r.principal_href.clone())
            .ok_or_else(|| CalendarError::malformed("xml", "no current-user-principal in response"))?;
        self.build_calendar_url(&href, base)
    }

    pub fn extract_calendar_home_url(&self, body: &str, base: &str) -> CalendarResult<String> {
        let ms = parse_multistatus(body)?;
        let href = ms
            .responses
            .iter()
            .find_map(|r| r.calendar_home_href.clone())
            .ok_or_else(|| CalendarError::malformed("xml", "no calendar-home-set in response"))?;
        self.build_calendar_url(&href, base)
    }

    pub fn extract_ctag(&self, body: &str) -> Option<String> {
        parse_multistatus(body)
            .ok()?
            .responses
            .iter()
            .find_map(|r| r.ctag.clone())
    }

    pub fn extract_sync_token(&self, body: &str) -> Option<String> {
        parse_multistatus(body).ok()?.sync_token
    }

    /// VEVENT-capable calendar collections from a Depth:1 listing, skipping
    /// scheduling and non-event collections.
    pub fn extract_calendars(&self, body: &str, home_url: &str) -> CalendarResult<Vec<RemoteCalendar>> {
        let ms = parse_multistatus(body)?;
        let mut calendars = Vec::new();
        for r in &ms.responses {
            if !r.is_calendar || r.href.is_empty() {
                continue;
            }
            let name = r.displayname.clone().unwrap_or_else(|| {
                r.href
                    .trim_end_matches('/')
                    .rsplit('/')
                    .next()
                    .unwrap_or("Calendar")
                    .to_string()
            });
            if self.should_skip_calendar(&r.href, &name) {
                continue;
            }
            // Servers that advertise component sets without VEVENT hold
            // tasks or journals.
            if r.supports_vevent || !body_mentions_comp(body) {
                calendars.push(RemoteCalendar {
                    href: r.href.clone(),
                    url: self.build_calendar_url(&r.href, home_url)?,
                    display_name: name,
                    color: r.calendar_color.clone(),
                    ctag: r.ctag.clone(),
                    is_read_only: r.is_read_only(),
                });
            }
        }
        Ok(calendars)
    }

    /// Event payloads from a calendar-query or multiget 207.
    pub fn extract_ical_items(&self, body: &str, calendar_url: &str) -> CalendarResult<Vec<RemoteEvent>> {
        let ms = parse_multistatus(body)?;
        Ok(ms
            .responses
            .iter()
            .filter(|r| !r.href.is_empty())
            .filter_map(|r| {
                r.calendar_data.as_ref().map(|data| RemoteEvent {
                    href: r.href.clone(),
                    url: self.build_event_url(&r.href, calendar_url),
                    etag: r.etag.clone(),
                    ical_data: data.clone(),
                })
            })
            .collect())
    }

    /// (href, etag) pairs from a response without calendar-data.
    pub fn extract_etag_items(&self, body: &str) -> CalendarResult<Vec<(String, Option<String>)>> {
        let ms = parse_multistatus(body)?;
        Ok(ms
            .responses
            .iter()
            .filter(|r| !r.href.is_empty() && !r.is_not_found())
            .map(|r| (r.href.clone(), r.etag.clone()))
            .collect())
    }

    /// Splits a sync-collection 207 into changes and deletions.
    pub fn extract_sync_report(&self, ms: &MultiStatus) -> SyncCollectionReport {
        let mut report = SyncCollectionReport {
            new_token: ms.sync_token.clone(),
            ..Default::default()
        };
        for r in &ms.responses {
            if r.href.is_empty() {
                continue;
            }
            if r.is_not_found() {
                report.deleted.push(r.href.clone());
            } else if r.is_insufficient_storage() {
                report.truncated = true;
            } else {
                report.changed.push((r.href.clone(), r.etag.clone()));
            }
        }
        report
    }

    /// 410 always invalidates; 403 only when the body names the
    /// `valid-sync-token` precondition. A bare 403 is permission-denied.
    pub fn is_sync_token_invalid(&self, status: u16, body: &str) -> bool {
        match status {
            410 => true,
            403 => body.contains("valid-sync-token"),
            _ => false,
        }
    }

    /// Scheduling inboxes, notification collections and task lists are not
    /// event calendars.
    pub fn should_skip_calendar(&self, href: &str, name: &str) -> bool {
        let href = href.to_ascii_lowercase();
        let name = name.to_ascii_lowercase();
        const SKIP: [&str; 5] = ["inbox", "outbox", "notification", "tasks", "reminders"];
        SKIP.iter()
            .any(|marker| href.contains(marker) || name == *marker)
    }

    /// RFC 5545 UTC DATE-TIME for calendar-query time-range filters.
    pub fn format_date_for_query(&self, ts_ms: i64) -> String {
        format_caldav_datetime(ts_ms)
    }

    pub fn additional_headers(&self) -> Vec<(&'static str, String)> {
        match self.provider {
            // iCloud rejects requests without an explicit UA.
            Provider::ICloud => vec![("User-Agent", self.user_agent().to_string())],
            _ => vec![("User-Agent", self.user_agent().to_string())],
        }
    }
}

fn is_regional_icloud_host(host: &str) -> bool {
    let host = host.to_ascii_lowercase();
    match host.strip_suffix("-caldav.icloud.com") {
        Some(prefix) => {
            prefix.len() > 1
                && prefix.starts_with('p')
                && prefix[1..].chars().all(|c| c.is_ascii_digit())
        }
        None => false,
    }
}

/// Whether the listing body carried component-set information at all.
fn body_mentions_comp(body: &str) -> bool {
    body.contains("supported-calendar-component-set")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_icloud_host_normalization() {
        let quirks = Quirks::new(Provider::ICloud);
        assert_eq!(
            quirks.normalize_url("https://p180-caldav.icloud.com/123/calendars/home/"),
            "https://caldav.icloud.com/123/calendars/home/"
        );
        assert_eq!(
            quirks.normalize_url("https://caldav.icloud.com/x/"),
            "https://caldav.icloud.com/x/"
        );
        // Non-iCloud providers never rewrite hosts.
        let generic = Quirks::new(Provider::GenericCalDav);
        assert_eq!(
            generic.normalize_url("https://p42-caldav.icloud.com/x/"),
            "https://p42-caldav.icloud.com/x/"
        );
    }

    #[test]
    fn test_regional_host_detection() {
        assert!(is_regional_icloud_host("p42-caldav.icloud.com"));
        assert!(is_regional_icloud_host("P180-CALDAV.ICLOUD.COM"));
        assert!(!is_regional_icloud_host("caldav.icloud.com"));
        assert!(!is_regional_icloud_host("px-caldav.icloud.com"));
        assert!(!is_regional_icloud_host("p42-caldav.example.com"));
    }

    #[test]
    fn test_sync_token_invalid_semantics() {
        let quirks = Quirks::new(Provider::GenericCalDav);
        assert!(quirks.is_sync_token_invalid(410, ""));
        assert!(quirks.is_sync_token_invalid(
            403,
            "<error xmlns=\"DAV:\"><valid-sync-token/></error>"
        ));
        // Bare 403 means permission denied, not token expiry.
        assert!(!quirks.is_sync_token_invalid(403, "forbidden"));
        assert!(!quirks.is_sync_token_invalid(507, ""));
    }

    #[test]
    fn test_skip_special_collections() {
        let quirks = Quirks::new(Provider::GenericCalDav);
        assert!(quirks.should_skip_calendar("/cal/inbox/", "Inbox"));
        assert!(quirks.should_skip_calendar("/cal/abc/", "tasks"));
        assert!(quirks.should_skip_calendar("/cal/notifications/", "Stuff"));
        assert!(!quirks.should_skip_calendar("/cal/work/", "Work"));
    }

    #[test]
    fn test_build_urls() {
        let quirks = Quirks::new(Provider::GenericCalDav);
        assert_eq!(
            quirks
                .build_calendar_url("/dav/cal/home/", "https://cal.example.com/anything")
                .unwrap(),
            "https://cal.example.com/dav/cal/home/"
        );
        assert_eq!(
            quirks.build_event_url("evt-1.ics", "https://cal.example.com/dav/cal/home/"),
            "https://cal.example.com/dav/cal/home/evt-1.ics"
        );
        assert_eq!(
            quirks.build_event_url("/dav/cal/home/evt-1.ics", "https://cal.example.com/dav/cal/home/"),
            "https://cal.example.com/dav/cal/home/evt-1.ics"
        );
    }

    #[test]
    fn test_extract_calendars_skips_non_vevent() {
        let body = r#"<multistatus xmlns="DAV:" xmlns:C="urn:ietf:params:xml:ns:caldav">
          <response>
            <href>/cal/work/</href>
            <propstat><prop>
              <displayname>Work</displayname>
              <resourcetype><collection/><C:calendar/></resourcetype>
              <C:supported-calendar-component-set><C:comp name="VEVENT"/></C:supported-calendar-component-set>
            </prop><status>HTTP/1.1 200 OK</status></propstat>
          </response>
          <response>
            <href>/cal/todo/</href>
            <propstat><prop>
              <displayname>Chores</displayname>
              <resourcetype><collection/><C:calendar/></resourcetype>
              <C:supported-calendar-component-set><C:comp name="VTODO"/></C:supported-calendar-component-set>
            </prop><status>HTTP/1.1 200 OK</status></propstat>
          </response>
          <response>
            <href>/cal/inbox/</href>
            <propstat><prop>
              <displayname>Inbox</displayname>
              <resourcetype><collection/><C:calendar/></resourcetype>
            </prop><status>HTTP/1.1 200 OK</status></propstat>
          </response>
        </multistatus>"#;
        let quirks = Quirks::new(Provider::GenericCalDav);
        let cals = quirks
            .extract_calendars(body, "https://cal.example.com/")
            .unwrap();
        assert_eq!(cals.len(), 1);
        assert_eq!(cals[0].display_name, "Work");
        assert_eq!(cals[0].url, "https://cal.example.com/cal/work/");
    }
}
