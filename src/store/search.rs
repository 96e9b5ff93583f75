/*!
 * Event Full-Text Search
 *
 * FTS5 over (title, location, description), kept current by the schema
 * triggers. User queries are re-tokenized into a safe FTS5 expression so a
 * stray quote or parenthesis can never produce a syntax error: plain terms,
 * `foo*` prefixes, `"a b"` phrases and AND/OR connectives are supported.
 */

use serde::{Deserialize, Serialize};
use sqlx::{Executor, Sqlite};

use crate::error::CalendarResult;
use crate::store::rows::{event_from_row, occurrence_from_row};
use crate::types::{Event, Occurrence};

const MAX_RESULTS: i64 = 100;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventWithNextOccurrence {
    pub event: Event,
    pub next_occurrence: Option<Occurrence>,
}

/// Rebuilds the user query as a safe FTS5 match expression. Returns None
/// when nothing searchable remains.
pub fn build_match_expression(query: &str) -> Option<String> {
    let mut tokens: Vec<String> = Vec::new();
    let mut chars = query.chars().peekable();
    let mut pending_connective: Option<&'static str> = None;

    while let Some(&ch) = chars.peek() {
        if ch.is_whitespace() {
            chars.next();
            continue;
        }
        if ch == '"' {
            chars.next();
            let mut phrase = String::new();
            for c in chars.by_ref() {
                if c == '"' {
                    break;
                }
                phrase.push(c);
            }
            let cleaned: String = phrase.chars().filter(|c| *c != '"').collect();
            if !cleaned.trim().is_empty() {
                push_token(
                    &mut tokens,
                    &mut pending_connective,
                    format!("\"{}\"", cleaned.trim()),
                );
            }
            continue;
        }

        let mut word = String::new();
        while let Some(&c) = chars.peek() {
            if c.is_whitespace() || c == '"' {
                break;
            }
            word.push(c);
            chars.next();
        }
        let upper = word.to_ascii_uppercase();
        if upper == "AND" || upper == "OR" {
            if !tokens.is_empty() {
                pending_connective = Some(if upper == "AND" { "AND" } else { "OR" });
            }
            continue;
        }
        let prefix = word.ends_with('*');
        let cleaned: String = word
            .chars()
            .filter(|c| c.is_alphanumeric() || *c == '_' || *c == '-')
            .collect();
        if cleaned.is_empty() {
            continue;
        }
        let token = if prefix {
            format!("\"{}\"*", cleaned)
        } else {
            format!("\"{}\"", cleaned)
        };
        push_token(&mut tokens, &mut pending_connective, token);
    }

    if tokens.is_empty() {
        None
    } else {
        Some(tokens.join(" "))
    }
}

fn push_token(tokens: &mut Vec<String>, connective: &mut Option<&'static str>, token: String) {
    if let Some(op) = connective.take() {
        tokens.push(op.to_string());
    } else if !tokens.is_empty() {
        // Adjacent terms are an implicit AND.
        tokens.push("AND".to_string());
    }
    tokens.push(token);
}

/// Searches events, attaching the next occurrence at or after `from_ts`
/// (bounded by `range_end` when given).
pub async fn search_events<'e, E>(
    exec: E,
    query: &str,
    from_ts: i64,
    range_end: Option<i64>,
) -> CalendarResult<Vec<EventWithNextOccurrence>>
where
    E: Executor<'e, Database = Sqlite> + Copy,
{
    let expression = match build_match_expression(query) {
        Some(expression) => expression,
        None => return Ok(Vec::new()),
    };

    let rows = sqlx::query(
        r#"
        SELECT e.* FROM events e
        JOIN events_fts ON events_fts.rowid = e.rowid
        WHERE events_fts MATCH ?1 AND e.sync_status != 'PENDING_DELETE'
        ORDER BY events_fts.rank
        LIMIT ?2
    "#,
    )
    .bind(&expression)
    .bind(MAX_RESULTS)
    .fetch_all(exec)
    .await?;

    let mut results = Vec::with_capacity(rows.len());
    for row in &rows {
        let event = event_from_row(row)?;
        let next = next_occurrence(exec, &event.id, from_ts, range_end).await?;
        results.push(EventWithNextOccurrence {
            event,
            next_occurrence: next,
        });
    }
    Ok(results)
}

async fn next_occurrence<'e, E>(
    exec: E,
    event_id: &str,
    from_ts: i64,
    range_end: Option<i64>,
) -> CalendarResult<Option<Occurrence>>
where
    E: Executor<'e, Database = Sqlite>,
{
    let row = sqlx::query(
        r#"
        SELECT * FROM occurrences
        WHERE (event_id = ?1 OR exception_event_id = ?1)
          AND is_cancelled = 0 AND start_ts >= ?2 AND start_ts <= ?3
        ORDER BY start_ts LIMIT 1
    "#,
    )
    .bind(event_id)
    .bind(from_ts)
    .bind(range_end.unwrap_or(i64::MAX))
    .fetch_optional(exec)
    .await?;
    row.as_ref().map(occurrence_from_row).transpose()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_plain_terms_become_implicit_and() {
        assert_eq!(
            build_match_expression("team standup").as_deref(),
            Some("\"team\" AND \"standup\"")
        );
    }

    #[test]
    fn test_prefix_phrase_and_connectives() {
        assert_eq!(
            build_match_expression("den* OR \"annual review\"").as_deref(),
            Some("\"den\"* OR \"annual review\"")
        );
        assert_eq!(
            build_match_expression("a AND b").as_deref(),
            Some("\"a\" AND \"b\"")
        );
    }

    #[test]
    fn test_hostile_input_is_sanitized() {
        assert_eq!(build_match_expression("   "), None);
        assert_eq!(build_match_expression("(((("), None);
        // Leading connective without a left operand is dropped.
        assert_eq!(
            build_match_expression("OR lunch").as_deref(),
            Some("\"lunch\"")
        );
        // Unbalanced quote still yields a usable phrase.
        assert_eq!(
            build_match_expression("\"open phrase").as_deref(),
            Some("\"open phrase\"")
        );
    }
}
