/*!
 * RFC 5545 Content Lines
 *
 * The patching contract requires byte-level control over properties the
 * entity does not manage, so the codec works on logical content lines:
 * unfolded on ingest, refolded at 75 octets on emission. A line is split
 * into name, raw parameter text and raw value; parameter text keeps its
 * original bytes so unknown parameters survive a round trip untouched.
 */

use std::fmt;

/// One logical (unfolded) content line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContentLine {
    /// Property name, uppercased.
    pub name: String,
    /// Raw parameter text including the leading `;`, or empty.
    pub params: String,
    /// Raw value text, still escaped.
    pub value: String,
}

impl ContentLine {
    pub fn new(name: &str, value: impl Into<String>) -> Self {
        Self {
            name: name.to_ascii_uppercase(),
            params: String::new(),
            value: value.into(),
        }
    }

    pub fn with_params(name: &str, params: &str, value: impl Into<String>) -> Self {
        Self {
            name: name.to_ascii_uppercase(),
            params: params.to_string(),
            value: value.into(),
        }
    }

    /// Splits a logical line at the first `:` outside of a quoted parameter
    /// value. Returns None for structurally broken lines.
    pub fn parse(logical: &str) -> Option<Self> {
        let mut in_quotes = false;
        let mut split_at = None;
        for (idx, ch) in logical.char_indices() {
            match ch {
                '"' => in_quotes = !in_quotes,
                ':' if !in_quotes => {
                    split_at = Some(idx);
                    break;
                }
                _ => {}
            }
        }
        let colon = split_at?;
        let (head, rest) = logical.split_at(colon);
        let value = rest[1..].to_string();
        let (name, params) = match head.find(';') {
            Some(semi) => (&head[..semi], head[semi..].to_string()),
            None => (head, String::new()),
        };
        if name.is_empty() {
            return None;
        }
        Some(Self {
            name: name.trim().to_ascii_uppercase(),
            params,
            value,
        })
    }

    /// Looks up a parameter value by key (case-insensitive), without quotes.
    pub fn param(&self, key: &str) -> Option<String> {
        let upper_key = key.to_ascii_uppercase();
        for part in split_params(&self.params) {
            if let Some((k, v)) = part.split_once('=') {
                if k.trim().to_ascii_uppercase() == upper_key {
                    return Some(v.trim().trim_matches('"').to_string());
                }
            }
        }
        None
    }

    /// The key the raw-property map uses: name plus raw parameter text.
    pub fn full_name(&self) -> String {
        format!("{}{}", self.name, self.params)
    }
}

impl fmt::Display for ContentLine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}:{}", self.name, self.params, self.value)
    }
}

/// Splits raw parameter text (`;A=1;B="x;y"`) on `;` outside quotes,
/// skipping the leading separator.
fn split_params(params: &str) -> Vec<&str> {
    let mut out = Vec::new();
    let mut in_quotes = false;
    let mut start = None;
    for (idx, ch) in params.char_indices() {
        match ch {
            '"' => in_quotes = !in_quotes,
            ';' if !in_quotes => {
                if let Some(s) = start.take() {
                    out.push(&params[s..idx]);
                }
                start = Some(idx + 1);
            }
            _ => {
                if start.is_none() {
                    start = Some(idx);
                }
            }
        }
    }
    if let Some(s) = start {
        if s < params.len() {
            out.push(&params[s..]);
        }
    }
    out
}

/// Unfolds raw iCalendar text into logical lines. Folded continuations
/// begin with a space or horizontal tab (RFC 5545 §3.1); both CRLF and bare
/// LF terminators are accepted on ingest.
pub fn unfold(input: &str) -> Vec<String> {
    let mut lines: Vec<String> = Vec::new();
    for raw in input.split('\n') {
        let raw = raw.strip_suffix('\r').unwrap_or(raw);
        if raw.is_empty() {
            continue;
        }
        if (raw.starts_with(' ') || raw.starts_with('\t')) && !lines.is_empty() {
            if let Some(last) = lines.last_mut() {
                last.push_str(&raw[1..]);
            }
        } else {
            lines.push(raw.to_string());
        }
    }
    lines
}

/// Folds one logical line at 75 octets per RFC 5545 §3.1, splitting on
/// UTF-8 boundaries, and appends it with CRLF.
pub fn fold_into(out: &mut String, logical: &str) {
    const LIMIT: usize = 75;
    let mut first = true;
    let mut rest = logical;
    loop {
        let width = if first { LIMIT } else { LIMIT - 1 };
        if rest.len() <= width {
            if !first {
                out.push(' ');
            }
            out.push_str(rest);
            out.push_str("\r\n");
            return;
        }
        let mut cut = width;
        while !rest.is_char_boundary(cut) {
            cut -= 1;
        }
        if !first {
            out.push(' ');
        }
        out.push_str(&rest[..cut]);
        out.push_str("\r\n");
        rest = &rest[cut..];
        first = false;
    }
}

/// Escapes TEXT values per RFC 5545 §3.3.11.
pub fn escape_text(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for ch in value.chars() {
        match ch {
            '\\' => out.push_str("\\\\"),
            ';' => out.push_str("\\;"),
            ',' => out.push_str("\\,"),
            '\n' => out.push_str("\\n"),
            '\r' => {}
            other => out.push(other),
        }
    }
    out
}

/// Unescapes TEXT values per RFC 5545 §3.3.11.
pub fn unescape_text(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    let mut chars = value.chars();
    while let Some(ch) = chars.next() {
        if ch == '\\' {
            match chars.next() {
                Some('n') | Some('N') => out.push('\n'),
                Some(other) => out.push(other),
                None => out.push('\\'),
            }
        } else {
            out.push(ch);
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_simple_line() {
        let line = ContentLine::parse("SUMMARY:Team standup").unwrap();
        assert_eq!(line.name, "SUMMARY");
        assert_eq!(line.params, "");
        assert_eq!(line.value, "Team standup");
    }

    #[test]
    fn test_parse_line_with_params() {
        let line = ContentLine::parse("DTSTART;TZID=Europe/Berlin:20251225T093000").unwrap();
        assert_eq!(line.name, "DTSTART");
        assert_eq!(line.params, ";TZID=Europe/Berlin");
        assert_eq!(line.value, "20251225T093000");
        assert_eq!(line.param("tzid").as_deref(), Some("Europe/Berlin"));
        assert_eq!(line.param("VALUE"), None);
    }

    #[test]
    fn test_parse_quoted_param_with_colon() {
        let line = ContentLine::parse(
            "ATTENDEE;CN=\"Doe: Jane\";ROLE=REQ-PARTICIPANT:mailto:jane@example.com",
        )
        .unwrap();
        assert_eq!(line.name, "ATTENDEE");
        assert_eq!(line.param("CN").as_deref(), Some("Doe: Jane"));
        assert_eq!(line.value, "mailto:jane@example.com");
    }

    #[test]
    fn test_unfold_crlf_and_lf() {
        let input = "SUMMARY:A very\r\n  long line\r\nDESCRIPTION:plain\n\tcontinued";
        let lines = unfold(input);
        assert_eq!(lines[0], "SUMMARY:A very long line");
        assert_eq!(lines[1], "DESCRIPTION:plaincontinued");
    }

    #[test]
    fn test_fold_long_line() {
        let long = format!("DESCRIPTION:{}", "x".repeat(200));
        let mut out = String::new();
        fold_into(&mut out, &long);
        for physical in out.split("\r\n").filter(|l| !l.is_empty()) {
            assert!(physical.len() <= 75);
        }
        // Unfolding restores the logical line.
        assert_eq!(unfold(&out)[0], long);
    }

    #[test]
    fn test_escape_round_trip() {
        let raw = "Lunch; bring cake, drinks\nand napkins\\plates";
        assert_eq!(unescape_text(&escape_text(raw)), raw.replace('\r', ""));
        assert_eq!(escape_text("a;b"), "a\\;b");
    }
}
