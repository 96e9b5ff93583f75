/*!
 * WebDAV Multistatus Parsing
 *
 * Event-driven extraction over quick-xml. Servers disagree on namespace
 * prefixes (`D:`, `d:`, default-namespace DAV as iCloud sends it), so every
 * match here goes through the element's local name.
 */

use quick_xml::events::Event;
use quick_xml::Reader;

use crate::error::{CalendarError, CalendarResult};

/// One `<response>` element of a 207 body.
#[derive(Debug, Clone, Default)]
pub struct MultiStatusResponse {
    pub href: String,
    /// Response-level status line (sync-collection uses 404 for deletions).
    pub status: Option<String>,
    pub etag: Option<String>,
    pub ctag: Option<String>,
    pub displayname: Option<String>,
    pub calendar_color: Option<String>,
    pub calendar_data: Option<String>,
    pub principal_href: Option<String>,
    pub calendar_home_href: Option<String>,
    pub is_calendar: bool,
    pub supports_vevent: bool,
    /// Absent `<write/>` privilege (when the server reports privileges at
    /// all) marks the collection read-only.
    pub has_privilege_set: bool,
    pub can_write: bool,
}

impl MultiStatusResponse {
    pub fn is_read_only(&self) -> bool {
        self.has_privilege_set && !self.can_write
    }

    /// Whether this response reports a 404 (deleted resource in a
    /// sync-collection report).
    pub fn is_not_found(&self) -> bool {
        self.status
            .as_deref()
            .map(|s| s.contains("404"))
            .unwrap_or(false)
    }

    pub fn is_insufficient_storage(&self) -> bool {
        self.status
            .as_deref()
            .map(|s| s.contains("507"))
            .unwrap_or(false)
    }
}

#[derive(Debug, Clone, Default)]
pub struct MultiStatus {
    pub sync_token: Option<String>,
    pub responses: Vec<MultiStatusResponse>,
}

/// Parses any PROPFIND/REPORT 207 body.
pub fn parse_multistatus(body: &str) -> CalendarResult<MultiStatus> {
    let mut reader = Reader::from_str(body);
    reader.trim_text(true);

    let mut result = MultiStatus::default();
    let mut buf = Vec::new();
    // Path of local element names from the root to the current element.
    let mut path: Vec<String> = Vec::new();
    let mut current: Option<MultiStatusResponse> = None;

    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(ref e)) => {
                let local = String::from_utf8_lossy(e.local_name().as_ref()).to_ascii_lowercase();
                path.push(local.clone());
                if local == "response" {
                    current = Some(MultiStatusResponse::default());
                }
                if local == "current-user-privilege-set" {
                    if let Some(resp) = current.as_mut() {
                        resp.has_privilege_set = true;
                    }
                }
            }
            Ok(Event::Empty(ref e)) => {
                let local = String::from_utf8_lossy(e.local_name().as_ref()).to_ascii_lowercase();
                if let Some(resp) = current.as_mut() {
                    match local.as_str() {
                        "calendar" if path_ends_with(&path, "resourcetype") => {
                            resp.is_calendar = true;
                        }
                        "write" if path_contains(&path, "current-user-privilege-set") => {
                            resp.can_write = true;
                        }
                        "comp" => {
                            if comp_name_is_vevent(e) {
                                resp.supports_vevent = true;
                            }
                        }
                        _ => {}
                    }
                }
            }
            Ok(Event::Text(ref e)) => {
                let text = e.unescape().unwrap_or_default().to_string();
                if text.is_empty() {
                    continue;
                }
                record_text(&mut result, current.as_mut(), &path, &text);
            }
            Ok(Event::CData(ref e)) => {
                let text = String::from_utf8_lossy(e).to_string();
                record_text(&mut result, current.as_mut(), &path, &text);
            }
            Ok(Event::End(ref e)) => {
                let local = String::from_utf8_lossy(e.local_name().as_ref()).to_ascii_lowercase();
                path.pop();
                if local == "response" {
                    if let Some(resp) = current.take() {
                        result.responses.push(resp);
                    }
                }
            }
            Ok(Event::Eof) => break,
            Err(e) => {
                return Err(CalendarError::malformed("xml", e.to_string()));
            }
            _ => {}
        }
        buf.clear();
    }
    Ok(result)
}

fn path_ends_with(path: &[String], name: &str) -> bool {
    path.last().map(|l| l == name).unwrap_or(false)
}

fn path_contains(path: &[String], name: &str) -> bool {
    path.iter().any(|l| l == name)
}

fn comp_name_is_vevent(e: &quick_xml::events::BytesStart<'_>) -> bool {
    for attr in e.attributes().flatten() {
        if attr.key.local_name().as_ref() == b"name" {
            if let Ok(value) = attr.unescape_value() {
                return value.eq_ignore_ascii_case("VEVENT");
            }
        }
    }
    false
}

fn record_text(
    result: &mut MultiStatus,
    current: Option<&mut MultiStatusResponse>,
    path: &[String],
    text: &str,
) {
    let in_element = |name: &str| path_ends_with(path, name);

    // Top-level sync token (direct child of multistatus).
    if in_element("sync-token") && path.len() == 2 {
        result.sync_token = Some(text.trim().to_string());
        return;
    }

    let resp = match current {
        Some(resp) => resp,
        None => return,
    };

    if in_element("href") {
        let parent = path.iter().rev().nth(1).map(String::as_str);
        match parent {
            Some("current-user-principal") | Some("principal-url") => {
                resp.principal_href = Some(text.trim().to_string());
            }
            Some("calendar-home-set") => {
                resp.calendar_home_href = Some(text.trim().to_string());
            }
            Some("response") => {
                resp.href = text.trim().to_string();
            }
            _ => {
                if resp.href.is_empty() {
                    resp.href = text.trim().to_string();
                }
            }
        }
        return;
    }
    if in_element("status") {
        // Keep the response-level status; propstat statuses carry no
        // deletion semantics for us.
        if path.iter().rev().nth(1).map(String::as_str) == Some("response") {
            resp.status = Some(text.trim().to_string());
        }
        return;
    }
    if in_element("getetag") {
        resp.etag = Some(normalize_etag(text));
        return;
    }
    if in_element("getctag") {
        resp.ctag = Some(text.trim().to_string());
        return;
    }
    if in_element("sync-token") {
        result.sync_token = Some(text.trim().to_string());
        return;
    }
    if in_element("displayname") {
        resp.displayname = Some(text.to_string());
        return;
    }
    if in_element("calendar-color") {
        resp.calendar_color = Some(text.trim().to_string());
        return;
    }
    if in_element("calendar-data") {
        match resp.calendar_data.as_mut() {
            Some(existing) => existing.push_str(text),
            None => resp.calendar_data = Some(text.to_string()),
        }
    }
}

/// Strips the weak-validator prefix and surrounding quotes from an ETag.
pub fn normalize_etag(raw: &str) -> String {
    let trimmed = raw.trim();
    let trimmed = trimmed
        .strip_prefix("W/")
        .or_else(|| trimmed.strip_prefix("w/"))
        .unwrap_or(trimmed);
    trimmed.trim_matches('"').to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    const PREFIXED: &str = r#"<?xml version="1.0"?>
<D:multistatus xmlns:D="DAV:" xmlns:C="urn:ietf:params:xml:ns:caldav" xmlns:CS="http://calendarserver.org/ns/">
  <D:response>
    <D:href>/cal/home/work/</D:href>
    <D:propstat>
      <D:prop>
        <D:displayname>Work</D:displayname>
        <D:resourcetype><D:collection/><C:calendar/></D:resourcetype>
        <C:supported-calendar-component-set><C:comp name="VEVENT"/></C:supported-calendar-component-set>
        <CS:getctag>ctag-123</CS:getctag>
      </D:prop>
      <D:status>HTTP/1.1 200 OK</D:status>
    </D:propstat>
  </D:response>
</D:multistatus>"#;

    // iCloud-style default namespace, no prefixes.
    const DEFAULT_NS: &str = r#"<?xml version="1.0"?>
<multistatus xmlns="DAV:" xmlns:C="urn:ietf:params:xml:ns:caldav">
  <sync-token>https://example.com/sync/42</sync-token>
  <response>
    <href>/cal/home/work/event-1.ics</href>
    <propstat>
      <prop><getetag>W/"etag-abc"</getetag></prop>
      <status>HTTP/1.1 200 OK</status>
    </propstat>
  </response>
  <response>
    <href>/cal/home/work/event-2.ics</href>
    <status>HTTP/1.1 404 Not Found</status>
  </response>
</multistatus>"#;

    #[test]
    fn test_parse_prefixed_calendar_listing() {
        let ms = parse_multistatus(PREFIXED).unwrap();
        assert_eq!(ms.responses.len(), 1);
        let r = &ms.responses[0];
        assert_eq!(r.href, "/cal/home/work/");
        assert_eq!(r.displayname.as_deref(), Some("Work"));
        assert!(r.is_calendar);
        assert!(r.supports_vevent);
        assert_eq!(r.ctag.as_deref(), Some("ctag-123"));
    }

    #[test]
    fn test_parse_default_namespace_sync_report() {
        let ms = parse_multistatus(DEFAULT_NS).unwrap();
        assert_eq!(ms.sync_token.as_deref(), Some("https://example.com/sync/42"));
        assert_eq!(ms.responses.len(), 2);
        assert_eq!(ms.responses[0].etag.as_deref(), Some("etag-abc"));
        assert!(!ms.responses[0].is_not_found());
        assert!(ms.responses[1].is_not_found());
    }

    #[test]
    fn test_principal_and_home_hrefs() {
        let body = r#"<multistatus xmlns="DAV:" xmlns:C="urn:ietf:params:xml:ns:caldav">
          <response>
            <href>/</href>
            <propstat><prop>
              <current-user-principal><href>/principals/users/jane/</href></current-user-principal>
              <C:calendar-home-set><href>/cal/jane/</href></C:calendar-home-set>
            </prop><status>HTTP/1.1 200 OK</status></propstat>
          </response>
        </multistatus>"#;
        let ms = parse_multistatus(body).unwrap();
        let r = &ms.responses[0];
        assert_eq!(r.principal_href.as_deref(), Some("/principals/users/jane/"));
        assert_eq!(r.calendar_home_href.as_deref(), Some("/cal/jane/"));
        assert_eq!(r.href, "/");
    }

    #[test]
    fn test_calendar_data_extraction() {
        let body = r#"<multistatus xmlns="DAV:" xmlns:C="urn:ietf:params:xml:ns:caldav">
          <response>
            <href>/cal/e.ics</href>
            <propstat><prop>
              <getetag>"e1"</getetag>
              <C:calendar-data>BEGIN:VCALENDAR
BEGIN:VEVENT
UID:x
END:VEVENT
END:VCALENDAR</C:calendar-data>
            </prop><status>HTTP/1.1 200 OK</status></propstat>
          </response>
        </multistatus>"#;
        let ms = parse_multistatus(body).unwrap();
        let data = ms.responses[0].calendar_data.as_deref().unwrap();
        assert!(data.contains("BEGIN:VEVENT"));
        assert_eq!(ms.responses[0].etag.as_deref(), Some("e1"));
    }

    #[test]
    fn test_read_only_privileges() {
        let body = r#"<multistatus xmlns="DAV:">
          <response>
            <href>/cal/shared/</href>
            <propstat><prop>
              <resourcetype><collection/><calendar xmlns="urn:ietf:params:xml:ns:caldav"/></resourcetype>
              <current-user-privilege-set><privilege><read/></privilege></current-user-privilege-set>
            </prop><status>HTTP/1.1 200 OK</status></propstat>
          </response>
        </multistatus>"#;
        let ms = parse_multistatus(body).unwrap();
        assert!(ms.responses[0].is_read_only());
    }

    #[test]
    fn test_normalize_etag() {
        assert_eq!(normalize_etag("\"abc\""), "abc");
        assert_eq!(normalize_etag("W/\"abc\""), "abc");
        assert_eq!(normalize_etag("abc"), "abc");
    }

    #[test]
    fn test_malformed_xml_is_typed() {
        let err = parse_multistatus("<multistatus><unclosed").unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::Malformed);
    }
}
