/*!
 * iCalendar Component Tree
 *
 * BEGIN/END-delimited components over content lines. The tree keeps every
 * property in document order so an edit-and-emit cycle changes only the
 * lines the codec deliberately touches.
 */

use crate::error::{CalendarError, CalendarResult};
use crate::ics::line::{fold_into, unfold, ContentLine};

pub const VCALENDAR: &str = "VCALENDAR";
pub const VEVENT: &str = "VEVENT";
pub const VALARM: &str = "VALARM";
pub const VTIMEZONE: &str = "VTIMEZONE";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IcsComponent {
    pub name: String,
    pub lines: Vec<ContentLine>,
    pub children: Vec<IcsComponent>,
}

impl IcsComponent {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_ascii_uppercase(),
            lines: Vec::new(),
            children: Vec::new(),
        }
    }

    /// First property line with the given name.
    pub fn line(&self, name: &str) -> Option<&ContentLine> {
        let upper = name.to_ascii_uppercase();
        self.lines.iter().find(|l| l.name == upper)
    }

    /// All property lines with the given name, in document order.
    pub fn lines_named(&self, name: &str) -> Vec<&ContentLine> {
        let upper = name.to_ascii_uppercase();
        self.lines.iter().filter(|l| l.name == upper).collect()
    }

    pub fn value_of(&self, name: &str) -> Option<&str> {
        self.line(name).map(|l| l.value.as_str())
    }

    /// Replaces the first line with this name in place, keeping its document
    /// position; appends when absent. Extra lines with the same name are
    /// dropped (the codec only sets single-valued properties this way).
    pub fn set_line(&mut self, line: ContentLine) {
        let name = line.name.clone();
        if let Some(pos) = self.lines.iter().position(|l| l.name == name) {
            self.lines[pos] = line;
            // Remove any duplicates after the first.
            let mut seen = false;
            self.lines.retain(|l| {
                if l.name != name {
                    return true;
                }
                if !seen {
                    seen = true;
                    true
                } else {
                    false
                }
            });
        } else {
            self.lines.push(line);
        }
    }

    pub fn remove_lines(&mut self, name: &str) {
        let upper = name.to_ascii_uppercase();
        self.lines.retain(|l| l.name != upper);
    }

    pub fn children_named(&self, name: &str) -> Vec<&IcsComponent> {
        let upper = name.to_ascii_uppercase();
        self.children.iter().filter(|c| c.name == upper).collect()
    }

    pub fn children_named_mut(&mut self, name: &str) -> Vec<&mut IcsComponent> {
        let upper = name.to_ascii_uppercase();
        self.children
            .iter_mut()
            .filter(|c| c.name == upper)
            .collect()
    }

    pub fn remove_children(&mut self, name: &str) {
        let upper = name.to_ascii_uppercase();
        self.children.retain(|c| c.name != upper);
    }

    /// Emits this component and its children with CRLF terminators and
    /// 75-octet folding.
    pub fn serialize_into(&self, out: &mut String) {
        fold_into(out, &format!("BEGIN:{}", self.name));
        for line in &self.lines {
            fold_into(out, &line.to_string());
        }
        for child in &self.children {
            child.serialize_into(out);
        }
        fold_into(out, &format!("END:{}", self.name));
    }

    pub fn serialize(&self) -> String {
        let mut out = String::new();
        self.serialize_into(&mut out);
        out
    }
}

/// Parses a blob into its top-level components. A bare VEVENT without a
/// VCALENDAR wrapper is accepted and returned as-is.
pub fn parse_components(input: &str) -> CalendarResult<Vec<IcsComponent>> {
    let mut stack: Vec<IcsComponent> = Vec::new();
    let mut roots: Vec<IcsComponent> = Vec::new();

    for logical in unfold(input) {
        let line = match ContentLine::parse(&logical) {
            Some(line) => line,
            None => continue, // tolerate stray garbage between properties
        };
        match line.name.as_str() {
            "BEGIN" => {
                stack.push(IcsComponent::new(line.value.trim()));
            }
            "END" => {
                let done = stack.pop().ok_or_else(|| {
                    CalendarError::malformed("ics", format!("unmatched END:{}", line.value))
                })?;
                if !done.name.eq_ignore_ascii_case(line.value.trim()) {
                    return Err(CalendarError::malformed(
                        "ics",
                        format!("END:{} closes {}", line.value.trim(), done.name),
                    ));
                }
                match stack.last_mut() {
                    Some(parent) => parent.children.push(done),
                    None => roots.push(done),
                }
            }
            _ => {
                if let Some(top) = stack.last_mut() {
                    top.lines.push(line);
                }
                // Properties outside any component are dropped.
            }
        }
    }

    if !stack.is_empty() {
        return Err(CalendarError::malformed(
            "ics",
            format!("unterminated component {}", stack[stack.len() - 1].name),
        ));
    }
    if roots.is_empty() {
        return Err(CalendarError::malformed("ics", "no components found"));
    }
    Ok(roots)
}

/// Parses a blob and returns the VCALENDAR root, wrapping a bare VEVENT in a
/// synthetic calendar when the server sent one without the envelope.
pub fn parse_calendar(input: &str) -> CalendarResult<IcsComponent> {
    let roots = parse_components(input)?;
    if let Some(cal) = roots.iter().find(|c| c.name == VCALENDAR) {
        return Ok(cal.clone());
    }
    let mut cal = IcsComponent::new(VCALENDAR);
    cal.lines.push(ContentLine::new("VERSION", "2.0"));
    for root in roots {
        cal.children.push(root);
    }
    Ok(cal)
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = "BEGIN:VCALENDAR\r\nVERSION:2.0\r\nBEGIN:VEVENT\r\nUID:abc\r\nSUMMARY:Standup\r\nBEGIN:VALARM\r\nACTION:DISPLAY\r\nTRIGGER:-PT5M\r\nEND:VALARM\r\nEND:VEVENT\r\nEND:VCALENDAR\r\n";

    #[test]
    fn test_parse_nested_components() {
        let cal = parse_calendar(SAMPLE).unwrap();
        assert_eq!(cal.name, "VCALENDAR");
        let events = cal.children_named(VEVENT);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].value_of("UID"), Some("abc"));
        let alarms = events[0].children_named(VALARM);
        assert_eq!(alarms.len(), 1);
        assert_eq!(alarms[0].value_of("TRIGGER"), Some("-PT5M"));
    }

    #[test]
    fn test_serialize_round_trip() {
        let cal = parse_calendar(SAMPLE).unwrap();
        let emitted = cal.serialize();
        let back = parse_calendar(&emitted).unwrap();
        assert_eq!(cal, back);
    }

    #[test]
    fn test_bare_vevent_gets_wrapped() {
        let cal =
            parse_calendar("BEGIN:VEVENT\r\nUID:x\r\nEND:VEVENT\r\n").unwrap();
        assert_eq!(cal.name, "VCALENDAR");
        assert_eq!(cal.children_named(VEVENT).len(), 1);
    }

    #[test]
    fn test_unterminated_component_is_malformed() {
        assert!(parse_calendar("BEGIN:VCALENDAR\r\nBEGIN:VEVENT\r\nUID:x\r\n").is_err());
        assert!(parse_calendar("END:VEVENT\r\n").is_err());
    }

    #[test]
    fn test_set_line_keeps_position() {
        let mut cal = parse_calendar(SAMPLE).unwrap();
        let event = &mut cal.children[0];
        event.set_line(ContentLine::new("SUMMARY", "Renamed"));
        let idx_uid = event.lines.iter().position(|l| l.name == "UID").unwrap();
        let idx_summary = event
            .lines
            .iter()
            .position(|l| l.name == "SUMMARY")
            .unwrap();
        assert!(idx_uid < idx_summary);
        assert_eq!(event.value_of("SUMMARY"), Some("Renamed"));
    }
}
