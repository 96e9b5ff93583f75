/*!
 * CalDAV HTTP Transport
 *
 * PROPFIND/REPORT/PUT/DELETE/MOVE/OPTIONS with retry, Retry-After support
 * and a hard response-size cap. Redirects are followed manually so the
 * Authorization header demonstrably survives iCloud's cross-host regional
 * redirects (an automatic policy strips credentials on origin change).
 * Credentials are bound at construction and cannot be swapped afterwards.
 */

use std::time::Duration;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use futures::StreamExt;
use reqwest::header::{HeaderMap, HeaderValue};
use reqwest::{Method, StatusCode};
use secrecy::{ExposeSecret, SecretString};
use tokio_util::sync::CancellationToken;
use url::Url;

use crate::caldav::quirks::{Quirks, RemoteCalendar, RemoteEvent, SyncCollectionReport};
use crate::caldav::xml::{normalize_etag, parse_multistatus};
use crate::config::HttpConfig;
use crate::error::{CalendarError, CalendarResult};

const MAX_REDIRECTS: usize = 5;
const DAV_CONTENT_TYPE: &str = "application/xml; charset=utf-8";
const ICS_CONTENT_TYPE: &str = "text/calendar; charset=utf-8";

/// Username/password pair; the password never leaves the secrecy wrapper
/// except to build the Authorization header.
pub struct Credentials {
    pub username: String,
    pub password: SecretString,
}

impl Credentials {
    /// RFC 7617 Basic with UTF-8 charset semantics: the raw UTF-8 bytes of
    /// `user:pass` are encoded, which keeps non-ASCII passwords working.
    fn basic_header(&self) -> String {
        let raw = format!("{}:{}", self.username, self.password.expose_secret());
        format!("Basic {}", BASE64.encode(raw.as_bytes()))
    }
}

/// Result of a MOVE attempt; servers without MOVE support report
/// `NotSupported` and the caller falls back to CREATE+DELETE.
#[derive(Debug, Clone)]
pub enum MoveOutcome {
    Moved { url: String, etag: Option<String> },
    NotSupported,
}

pub struct CalDavClient {
    http: reqwest::Client,
    quirks: Quirks,
    auth_header: Option<String>,
    config: HttpConfig,
}

impl CalDavClient {
    pub fn new(
        quirks: Quirks,
        credentials: Option<Credentials>,
        config: &HttpConfig,
    ) -> CalendarResult<Self> {
        let http = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(config.connect_timeout_secs))
            .read_timeout(Duration::from_secs(config.read_timeout_secs))
            .timeout(Duration::from_secs(
                config.connect_timeout_secs + config.read_timeout_secs + config.write_timeout_secs,
            ))
            .pool_max_idle_per_host(config.pool_max_idle_per_host)
            .pool_idle_timeout(Duration::from_secs(config.pool_idle_timeout_secs))
            .redirect(reqwest::redirect::Policy::none())
            .user_agent(quirks.user_agent())
            .build()
            .map_err(|e| CalendarError::network(format!("failed to build HTTP client: {e}")))?;
        Ok(Self {
            http,
            quirks,
            auth_header: credentials.map(|c| c.basic_header()),
            config: config.clone(),
        })
    }

    pub fn quirks(&self) -> &Quirks {
        &self.quirks
    }

    // ---- discovery ----------------------------------------------------

    /// Resolves `/.well-known/caldav`, returning the final base URL after
    /// redirects with query and fragment stripped. The original scheme is
    /// preserved so a reverse proxy downgrading to http cannot leak the
    /// session onto cleartext.
    pub async fn discover_well_known(
        &self,
        server_url: &str,
        cancel: &CancellationToken,
    ) -> CalendarResult<String> {
        let origin = Url::parse(server_url)
            .map_err(|e| CalendarError::malformed("url", e.to_string()))?;
        let well_known = origin
            .join("/.well-known/caldav")
            .map_err(|e| CalendarError::malformed("url", e.to_string()))?;

        let response = self
            .request(
                Method::from_bytes(b"PROPFIND").expect("static method"),
                well_known.as_str(),
                &[("Depth", "0".to_string())],
                Some(PROPFIND_PRINCIPAL_BODY.to_string()),
                DAV_CONTENT_TYPE,
                cancel,
            )
            .await?;

        let mut resolved = response.final_url;
        resolved.set_query(None);
        resolved.set_fragment(None);
        if resolved.scheme() != origin.scheme() {
            let _ = resolved.set_scheme(origin.scheme());
        }
        Ok(self.quirks.normalize_url(resolved.as_str()))
    }

    pub async fn discover_principal(
        &self,
        url: &str,
        cancel: &CancellationToken,
    ) -> CalendarResult<String> {
        let response = self
            .propfind(url, PROPFIND_PRINCIPAL_BODY, 0, cancel)
            .await?;
        self.quirks.extract_principal_url(&response.body, url)
    }

    pub async fn discover_calendar_home(
        &self,
        principal_url: &str,
        cancel: &CancellationToken,
    ) -> CalendarResult<String> {
        let response = self
            .propfind(principal_url, PROPFIND_HOME_BODY, 0, cancel)
            .await?;
        self.quirks.extract_calendar_home_url(&response.body, principal_url)
    }

    pub async fn list_calendars(
        &self,
        home_url: &str,
        cancel: &CancellationToken,
    ) -> CalendarResult<Vec<RemoteCalendar>> {
        let response = self.propfind(home_url, PROPFIND_LIST_BODY, 1, cancel).await?;
        self.quirks.extract_calendars(&response.body, home_url)
    }

    /// OPTIONS probe validating RFC 4791 `calendar-access` support.
    pub async fn check_connection(
        &self,
        url: &str,
        cancel: &CancellationToken,
    ) -> CalendarResult<()> {
        let response = self
            .request(Method::OPTIONS, url, &[], None, DAV_CONTENT_TYPE, cancel)
            .await?;
        let dav = response
            .headers
            .get("DAV")
            .and_then(|v| v.to_str().ok())
            .unwrap_or("");
        if dav.contains("calendar-access") {
            Ok(())
        } else {
            Err(CalendarError::other(format!(
                "server at {url} does not advertise calendar-access (DAV: {dav})"
            )))
        }
    }

    // ---- change detection ---------------------------------------------

    pub async fn get_ctag(&self, url: &str, cancel: &CancellationToken) -> CalendarResult<Option<String>> {
        let response = self.propfind(url, PROPFIND_CTAG_BODY, 0, cancel).await?;
        Ok(self.quirks.extract_ctag(&response.body))
    }

    pub async fn get_sync_token(
        &self,
        url: &str,
        cancel: &CancellationToken,
    ) -> CalendarResult<Option<String>> {
        let response = self.propfind(url, PROPFIND_SYNC_TOKEN_BODY, 0, cancel).await?;
        Ok(self.quirks.extract_sync_token(&response.body))
    }

    /// RFC 6578 sync-collection REPORT. An expired token surfaces as
    /// `SyncTokenInvalid`; HTTP 507 (or a 507 response element) marks the
    /// report truncated and the caller loops with the fresh token.
    pub async fn sync_collection(
        &self,
        url: &str,
        sync_token: Option<&str>,
        cancel: &CancellationToken,
    ) -> CalendarResult<SyncCollectionReport> {
        let body = format!(
            r#"<?xml version="1.0" encoding="utf-8" ?>
<d:sync-collection xmlns:d="DAV:">
  <d:sync-token>{}</d:sync-token>
  <d:sync-level>1</d:sync-level>
  <d:prop>
    <d:getetag/>
  </d:prop>
</d:sync-collection>"#,
            xml_escape(sync_token.unwrap_or(""))
        );

        let response = self
            .request_with_status(
                Method::from_bytes(b"REPORT").expect("static method"),
                url,
                &[("Depth", "1".to_string())],
                Some(body),
                DAV_CONTENT_TYPE,
                cancel,
            )
            .await?;

        if self
            .quirks
            .is_sync_token_invalid(response.status.as_u16(), &response.body)
        {
            return Err(CalendarError::SyncTokenInvalid {
                message: format!("server rejected sync token with {}", response.status),
            });
        }
        let truncated_status = response.status.as_u16() == 507;
        if !response.status.is_success() && !truncated_status {
            return Err(self.map_http_error(response.status, &response.body, url));
        }

        let ms = parse_multistatus(&response.body)?;
        let mut report = self.quirks.extract_sync_report(&ms);
        report.truncated |= truncated_status;
        Ok(report)
    }

    pub async fn fetch_events_in_range(
        &self,
        calendar_url: &str,
        start_ms: i64,
        end_ms: i64,
        cancel: &CancellationToken,
    ) -> CalendarResult<Vec<RemoteEvent>> {
        let body = calendar_query_body(
            &self.quirks.format_date_for_query(start_ms),
            &self.quirks.format_date_for_query(end_ms),
            true,
        );
        let response = self.report(calendar_url, &body, cancel).await?;
        self.quirks.extract_ical_items(&response.body, calendar_url)
    }

    /// ETag-only listing for the diff fallback; skipping calendar-data cuts
    /// the transfer to a few percent of the full fetch.
    pub async fn fetch_etags_in_range(
        &self,
        calendar_url: &str,
        start_ms: i64,
        end_ms: i64,
        cancel: &CancellationToken,
    ) -> CalendarResult<Vec<(String, Option<String>)>> {
        let body = calendar_query_body(
            &self.quirks.format_date_for_query(start_ms),
            &self.quirks.format_date_for_query(end_ms),
            false,
        );
        let response = self.report(calendar_url, &body, cancel).await?;
        self.quirks.extract_etag_items(&response.body)
    }

    /// calendar-multiget for a batch of hrefs.
    pub async fn fetch_events_by_href(
        &self,
        calendar_url: &str,
        hrefs: &[String],
        cancel: &CancellationToken,
    ) -> CalendarResult<Vec<RemoteEvent>> {
        if hrefs.is_empty() {
            return Ok(Vec::new());
        }
        let href_lines: String = hrefs
            .iter()
            .map(|h| format!("  <d:href>{}</d:href>\n", xml_escape(h)))
            .collect();
        let body = format!(
            r#"<?xml version="1.0" encoding="utf-8" ?>
<c:calendar-multiget xmlns:d="DAV:" xmlns:c="urn:ietf:params:xml:ns:caldav">
  <d:prop>
    <d:getetag/>
    <c:calendar-data/>
  </d:prop>
{href_lines}</c:calendar-multiget>"#
        );
        let response = self.report(calendar_url, &body, cancel).await?;
        self.quirks.extract_ical_items(&response.body, calendar_url)
    }

    /// Single-resource GET; the ETag comes from the response header.
    pub async fn fetch_event(
        &self,
        event_url: &str,
        cancel: &CancellationToken,
    ) -> CalendarResult<RemoteEvent> {
        let response = self
            .request(Method::GET, event_url, &[], None, ICS_CONTENT_TYPE, cancel)
            .await?;
        let etag = header_etag(&response.headers);
        Ok(RemoteEvent {
            href: Url::parse(event_url)
                .map(|u| u.path().to_string())
                .unwrap_or_else(|_| event_url.to_string()),
            url: event_url.to_string(),
            etag,
            ical_data: response.body,
        })
    }

    /// Depth:0 PROPFIND fallback for servers whose PUT responses omit the
    /// ETag header.
    pub async fn fetch_etag(
        &self,
        event_url: &str,
        cancel: &CancellationToken,
    ) -> CalendarResult<Option<String>> {
        let response = self.propfind(event_url, PROPFIND_ETAG_BODY, 0, cancel).await?;
        let ms = parse_multistatus(&response.body)?;
        Ok(ms.responses.iter().find_map(|r| r.etag.clone()))
    }

    // ---- mutations -----------------------------------------------------

    /// PUT with `If-None-Match: *`; a 412 means the uid already exists.
    pub async fn create_event(
        &self,
        calendar_url: &str,
        uid: &str,
        ical: &str,
        cancel: &CancellationToken,
    ) -> CalendarResult<(String, Option<String>)> {
        let event_url = format!(
            "{}/{}.ics",
            calendar_url.trim_end_matches('/'),
            percent_safe(uid)
        );
        let response = self
            .request(
                Method::PUT,
                &event_url,
                &[("If-None-Match", "*".to_string())],
                Some(ical.to_string()),
                ICS_CONTENT_TYPE,
                cancel,
            )
            .await?;
        let etag = match header_etag(&response.headers) {
            Some(etag) => Some(etag),
            None => self.fetch_etag(&event_url, cancel).await.unwrap_or(None),
        };
        Ok((event_url, etag))
    }

    /// Conditional PUT; 412 surfaces as Conflict for the resolver.
    pub async fn update_event(
        &self,
        event_url: &str,
        ical: &str,
        etag: Option<&str>,
        cancel: &CancellationToken,
    ) -> CalendarResult<Option<String>> {
        let mut headers = Vec::new();
        if let Some(etag) = etag {
            headers.push(("If-Match", format!("\"{}\"", etag.trim_matches('"'))));
        }
        let response = self
            .request(
                Method::PUT,
                event_url,
                &headers,
                Some(ical.to_string()),
                ICS_CONTENT_TYPE,
                cancel,
            )
            .await?;
        match header_etag(&response.headers) {
            Some(etag) => Ok(Some(etag)),
            None => self.fetch_etag(event_url, cancel).await,
        }
    }

    /// Conditional DELETE. 404 means the resource is already gone, which is
    /// the outcome the caller wanted.
    pub async fn delete_event(
        &self,
        event_url: &str,
        etag: Option<&str>,
        cancel: &CancellationToken,
    ) -> CalendarResult<()> {
        let mut headers = Vec::new();
        if let Some(etag) = etag {
            headers.push(("If-Match", format!("\"{}\"", etag.trim_matches('"'))));
        }
        let response = self
            .request_with_status(Method::DELETE, event_url, &headers, None, ICS_CONTENT_TYPE, cancel)
            .await?;
        match response.status.as_u16() {
            200 | 204 | 404 => Ok(()),
            412 => Err(CalendarError::Conflict {
                url: event_url.to_string(),
                message: "delete precondition failed".to_string(),
                remote_etag: None,
            }),
            _ => Err(self.map_http_error(response.status, &response.body, event_url)),
        }
    }

    /// WebDAV MOVE with `Overwrite: F`. A 405 reports `NotSupported` so the
    /// caller can fall back to CREATE+DELETE.
    pub async fn move_event(
        &self,
        event_url: &str,
        dest_calendar_url: &str,
        uid: &str,
        cancel: &CancellationToken,
    ) -> CalendarResult<MoveOutcome> {
        let destination = format!(
            "{}/{}.ics",
            dest_calendar_url.trim_end_matches('/'),
            percent_safe(uid)
        );
        let response = self
            .request_with_status(
                Method::from_bytes(b"MOVE").expect("static method"),
                event_url,
                &[
                    ("Destination", destination.clone()),
                    ("Overwrite", "F".to_string()),
                ],
                None,
                DAV_CONTENT_TYPE,
                cancel,
            )
            .await?;
        match response.status.as_u16() {
            201 | 204 => {
                let etag = match header_etag(&response.headers) {
                    Some(etag) => Some(etag),
                    None => self.fetch_etag(&destination, cancel).await.unwrap_or(None),
                };
                Ok(MoveOutcome::Moved {
                    url: destination,
                    etag,
                })
            }
            405 => Ok(MoveOutcome::NotSupported),
            _ => Err(self.map_http_error(response.status, &response.body, event_url)),
        }
    }

    // ---- plumbing ------------------------------------------------------

    async fn propfind(
        &self,
        url: &str,
        body: &str,
        depth: u8,
        cancel: &CancellationToken,
    ) -> CalendarResult<HttpResponse> {
        self.request(
            Method::from_bytes(b"PROPFIND").expect("static method"),
            url,
            &[("Depth", depth.to_string())],
            Some(body.to_string()),
            DAV_CONTENT_TYPE,
            cancel,
        )
        .await
    }

    async fn report(
        &self,
        url: &str,
        body: &str,
        cancel: &CancellationToken,
    ) -> CalendarResult<HttpResponse> {
        self.request(
            Method::from_bytes(b"REPORT").expect("static method"),
            url,
            &[("Depth", "1".to_string())],
            Some(body.to_string()),
            DAV_CONTENT_TYPE,
            cancel,
        )
        .await
    }

    /// Issues the request, mapping every non-2xx/207 status into a typed
    /// error.
    async fn request(
        &self,
        method: Method,
        url: &str,
        headers: &[(&str, String)],
        body: Option<String>,
        content_type: &str,
        cancel: &CancellationToken,
    ) -> CalendarResult<HttpResponse> {
        let response = self
            .request_with_status(method, url, headers, body, content_type, cancel)
            .await?;
        if response.status.is_success() || response.status.as_u16() == 207 {
            Ok(response)
        } else {
            Err(self.map_http_error(response.status, &response.body, url))
        }
    }

    /// Issues the request with retry and manual redirects, returning
    /// whatever status came back.
    async fn request_with_status(
        &self,
        method: Method,
        url: &str,
        headers: &[(&str, String)],
        body: Option<String>,
        content_type: &str,
        cancel: &CancellationToken,
    ) -> CalendarResult<HttpResponse> {
        let mut last_error: Option<CalendarError> = None;
        let mut delay_override_ms: Option<i64> = None;

        for attempt in 0..=self.config.max_retries {
            if cancel.is_cancelled() {
                return Err(CalendarError::Cancelled);
            }
            if attempt > 0 {
                let backoff = Duration::from_millis(
                    self.config.retry_base_delay_ms << (attempt - 1),
                );
                let delay = match delay_override_ms.take() {
                    Some(after_ms) => Duration::from_millis(after_ms.max(0) as u64),
                    None => backoff,
                };
                tokio::select! {
                    _ = cancel.cancelled() => return Err(CalendarError::Cancelled),
                    _ = tokio::time::sleep(delay) => {}
                }
            }

            match self
                .execute_once(method.clone(), url, headers, body.clone(), content_type, cancel)
                .await
            {
                Ok(response) => {
                    let status = response.status.as_u16();
                    // 5xx and 429 are retried; everything else is final.
                    // 503/429 honor Retry-After (delta-seconds or HTTP-date).
                    if (500..=599).contains(&status) || status == 429 {
                        if attempt == self.config.max_retries {
                            return Ok(response);
                        }
                        if status == 503 || status == 429 {
                            delay_override_ms = response
                                .headers
                                .get("Retry-After")
                                .and_then(|v| v.to_str().ok())
                                .and_then(|v| {
                                    parse_retry_after(v, chrono::Utc::now().timestamp_millis())
                                });
                        }
                        tracing::warn!("{} {} returned {}; retrying", response.method, url, status);
                        last_error = Some(self.map_http_error(response.status, &response.body, url));
                        continue;
                    }
                    return Ok(response);
                }
                Err(err) if err.is_retryable() && attempt < self.config.max_retries => {
                    tracing::warn!("{} {} failed ({}); retrying", method, url, err);
                    last_error = Some(err);
                }
                Err(err) => return Err(err),
            }
        }
        Err(last_error.unwrap_or_else(|| CalendarError::network("request failed")))
    }

    /// One network attempt: manual redirect chain with auth re-applied on
    /// every hop.
    async fn execute_once(
        &self,
        method: Method,
        url: &str,
        headers: &[(&str, String)],
        body: Option<String>,
        content_type: &str,
        cancel: &CancellationToken,
    ) -> CalendarResult<HttpResponse> {
        let mut current = Url::parse(url)
            .map_err(|e| CalendarError::malformed("url", e.to_string()))?;

        for _hop in 0..=MAX_REDIRECTS {
            let mut request = self.http.request(method.clone(), current.clone());
            request = request.header("Content-Type", content_type);
            if let Some(auth) = &self.auth_header {
                request = request.header("Authorization", auth.clone());
            }
            for (name, value) in self.quirks.additional_headers() {
                request = request.header(name, value);
            }
            for (name, value) in headers {
                request = request.header(*name, value.clone());
            }
            if let Some(body) = &body {
                request = request.body(body.clone());
            }

            let send = request.send();
            let response = tokio::select! {
                _ = cancel.cancelled() => return Err(CalendarError::Cancelled),
                result = send => result.map_err(|e| classify_transport_error(&e))?,
            };

            let status = response.status();
            if status.is_redirection() {
                let location = response
                    .headers()
                    .get("Location")
                    .and_then(|v| v.to_str().ok())
                    .ok_or_else(|| {
                        CalendarError::network(format!("{status} redirect without Location"))
                    })?;
                current = current
                    .join(location)
                    .map_err(|e| CalendarError::malformed("url", e.to_string()))?;
                continue;
            }

            let headers = response.headers().clone();
            let body = self.read_capped(response, current.as_str(), cancel).await?;
            return Ok(HttpResponse {
                method: method.clone(),
                status,
                headers,
                body,
                final_url: current,
            });
        }
        Err(CalendarError::network(format!(
            "redirect chain exceeded {MAX_REDIRECTS} hops from {url}"
        )))
    }

    /// Streams the body up to the configured cap; oversize responses abort
    /// with a typed error instead of exhausting memory.
    async fn read_capped(
        &self,
        response: reqwest::Response,
        url: &str,
        cancel: &CancellationToken,
    ) -> CalendarResult<String> {
        let cap = self.config.max_body_bytes as usize;
        if let Some(len) = response.content_length() {
            if len > self.config.max_body_bytes {
                return Err(CalendarError::ResponseTooLarge {
                    url: url.to_string(),
                    limit_bytes: self.config.max_body_bytes,
                });
            }
        }
        let mut stream = response.bytes_stream();
        let mut buf: Vec<u8> = Vec::new();
        loop {
            let chunk = tokio::select! {
                _ = cancel.cancelled() => return Err(CalendarError::Cancelled),
                chunk = stream.next() => chunk,
            };
            match chunk {
                Some(Ok(bytes)) => {
                    if buf.len() + bytes.len() > cap {
                        return Err(CalendarError::ResponseTooLarge {
                            url: url.to_string(),
                            limit_bytes: self.config.max_body_bytes,
                        });
                    }
                    buf.extend_from_slice(&bytes);
                }
                Some(Err(e)) => return Err(classify_transport_error(&e)),
                None => break,
            }
        }
        Ok(String::from_utf8_lossy(&buf).into_owned())
    }

    fn map_http_error(&self, status: StatusCode, body: &str, url: &str) -> CalendarError {
        match status.as_u16() {
            401 => CalendarError::Auth {
                message: format!("authentication rejected by {url}"),
                account_id: None,
            },
            403 => {
                if self.quirks.is_sync_token_invalid(403, body) {
                    CalendarError::SyncTokenInvalid {
                        message: "403 with valid-sync-token precondition".to_string(),
                    }
                } else {
                    CalendarError::Permission {
                        message: format!("access denied at {url}"),
                    }
                }
            }
            404 => CalendarError::NotFound {
                resource: url.to_string(),
            },
            410 => CalendarError::SyncTokenInvalid {
                message: "410 Gone from sync-collection".to_string(),
            },
            412 => CalendarError::Conflict {
                url: url.to_string(),
                message: "precondition failed".to_string(),
                remote_etag: None,
            },
            413 => CalendarError::Other {
                message: format!("server rejected payload as too large for {url}"),
            },
            429 => CalendarError::Server {
                status: 429,
                message: format!("rate limited by {url}"),
                retry_after_ms: None,
            },
            s if (500..=599).contains(&s) => CalendarError::Server {
                status: s,
                message: format!("{status} from {url}"),
                retry_after_ms: None,
            },
            _ => CalendarError::Other {
                message: format!("{status} from {url}: {}", truncate(body, 200)),
            },
        }
    }
}

/// A completed HTTP exchange.
struct HttpResponse {
    method: Method,
    status: StatusCode,
    headers: HeaderMap,
    body: String,
    final_url: Url,
}

fn header_etag(headers: &HeaderMap) -> Option<String> {
    headers
        .get("ETag")
        .and_then(|v: &HeaderValue| v.to_str().ok())
        .map(normalize_etag)
        .filter(|e| !e.is_empty())
}

/// Parses `Retry-After` as delta-seconds or an HTTP-date (RFC 7231 §7.1.3),
/// returning a delay in milliseconds relative to `now_ms`.
pub fn parse_retry_after(value: &str, now_ms: i64) -> Option<i64> {
    let value = value.trim();
    if let Ok(seconds) = value.parse::<i64>() {
        return Some((seconds.max(0)) * 1000);
    }
    let when = chrono::DateTime::parse_from_rfc2822(value).ok()?;
    Some((when.timestamp_millis() - now_ms).max(0))
}

/// TLS handshake failures are configuration problems, never retried;
/// timeouts and plain connection errors are.
fn classify_transport_error(err: &reqwest::Error) -> CalendarError {
    if err.is_timeout() {
        return CalendarError::Timeout {
            message: err.to_string(),
        };
    }
    let text = format!("{err:?}").to_ascii_lowercase();
    if text.contains("certificate") || text.contains("handshake") || text.contains("tls") {
        return CalendarError::Other {
            message: format!("TLS failure: {err}"),
        };
    }
    CalendarError::Network {
        message: err.to_string(),
    }
}

fn xml_escape(value: &str) -> String {
    value
        .replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
}

/// UIDs land in URL path segments; anything outside the unreserved set is
/// percent-encoded.
fn percent_safe(uid: &str) -> String {
    let mut out = String::with_capacity(uid.len());
    for byte in uid.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' | b'@' => {
                out.push(byte as char)
            }
            other => out.push_str(&format!("%{:02X}", other)),
        }
    }
    out
}

fn truncate(s: &str, max: usize) -> &str {
    if s.len() <= max {
        s
    } else {
        let mut cut = max;
        while !s.is_char_boundary(cut) {
            cut -= 1;
        }
        &s[..cut]
    }
}

const PROPFIND_PRINCIPAL_BODY: &str = r#"<?xml version="1.0" encoding="utf-8" ?>
<d:propfind xmlns:d="DAV:" xmlns:c="urn:ietf:params:xml:ns:caldav">
  <d:prop>
    <d:current-user-principal/>
    <d:principal-URL/>
    <c:calendar-home-set/>
  </d:prop>
</d:propfind>"#;

const PROPFIND_HOME_BODY: &str = r#"<?xml version="1.0" encoding="utf-8" ?>
<d:propfind xmlns:d="DAV:" xmlns:c="urn:ietf:params:xml:ns:caldav">
  <d:prop>
    <c:calendar-home-set/>
  </d:prop>
</d:propfind>"#;

const PROPFIND_LIST_BODY: &str = r#"<?xml version="1.0" encoding="utf-8" ?>
<d:propfind xmlns:d="DAV:" xmlns:c="urn:ietf:params:xml:ns:caldav" xmlns:cs="http://calendarserver.org/ns/" xmlns:a="http://apple.com/ns/ical/">
  <d:prop>
    <d:displayname/>
    <d:resourcetype/>
    <d:current-user-privilege-set/>
    <c:supported-calendar-component-set/>
    <a:calendar-color/>
    <cs:getctag/>
  </d:prop>
</d:propfind>"#;

const PROPFIND_CTAG_BODY: &str = r#"<?xml version="1.0" encoding="utf-8" ?>
<d:propfind xmlns:d="DAV:" xmlns:cs="http://calendarserver.org/ns/">
  <d:prop>
    <cs:getctag/>
  </d:prop>
</d:propfind>"#;

const PROPFIND_SYNC_TOKEN_BODY: &str = r#"<?xml version="1.0" encoding="utf-8" ?>
<d:propfind xmlns:d="DAV:">
  <d:prop>
    <d:sync-token/>
  </d:prop>
</d:propfind>"#;

const PROPFIND_ETAG_BODY: &str = r#"<?xml version="1.0" encoding="utf-8" ?>
<d:propfind xmlns:d="DAV:">
  <d:prop>
    <d:getetag/>
  </d:prop>
</d:propfind>"#;

fn calendar_query_body(start: &str, end: &str, with_data: bool) -> String {
    let data_prop = if with_data {
        "    <c:calendar-data/>\n"
    } else {
        ""
    };
    format!(
        r#"<?xml version="1.0" encoding="utf-8" ?>
<c:calendar-query xmlns:d="DAV:" xmlns:c="urn:ietf:params:xml:ns:caldav">
  <d:prop>
    <d:getetag/>
{data_prop}  </d:prop>
  <c:filter>
    <c:comp-filter name="VCALENDAR">
      <c:comp-filter name="VEVENT">
        <c:time-range start="{start}" end="{end}"/>
      </c:comp-filter>
    </c:comp-filter>
  </c:filter>
</c:calendar-query>"#
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_basic_header_is_utf8() {
        let creds = Credentials {
            username: "jürgen".to_string(),
            password: SecretString::new("pässwörd".to_string()),
        };
        let header = creds.basic_header();
        let encoded = header.strip_prefix("Basic ").unwrap();
        let decoded = BASE64.decode(encoded).unwrap();
        assert_eq!(String::from_utf8(decoded).unwrap(), "jürgen:pässwörd");
    }

    #[test]
    fn test_parse_retry_after() {
        assert_eq!(parse_retry_after("120", 0), Some(120_000));
        assert_eq!(parse_retry_after("0", 0), Some(0));
        assert_eq!(parse_retry_after("-5", 0), Some(0));
        // HTTP-date form.
        let now = chrono::DateTime::parse_from_rfc2822("Fri, 31 Dec 1999 23:59:00 GMT")
            .unwrap()
            .timestamp_millis();
        let delay = parse_retry_after("Fri, 31 Dec 1999 23:59:59 GMT", now).unwrap();
        assert_eq!(delay, 59_000);
        assert_eq!(parse_retry_after("garbage", 0), None);
    }

    #[test]
    fn test_percent_safe_uid() {
        assert_eq!(percent_safe("simple-uid_1.2@host"), "simple-uid_1.2@host");
        assert_eq!(percent_safe("a b/c"), "a%20b%2Fc");
    }

    #[test]
    fn test_calendar_query_body_shapes() {
        let with = calendar_query_body("20250101T000000Z", "20260101T000000Z", true);
        assert!(with.contains("calendar-data"));
        assert!(with.contains("time-range start=\"20250101T000000Z\""));
        let without = calendar_query_body("20250101T000000Z", "20260101T000000Z", false);
        assert!(!without.contains("calendar-data"));
    }

    #[test]
    fn test_xml_escape() {
        assert_eq!(xml_escape("a&b<c>"), "a&amp;b&lt;c&gt;");
    }
}
