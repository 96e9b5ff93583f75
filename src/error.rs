/*!
 * Calendar Core Error Types
 *
 * Every fallible operation in the crate returns `CalendarResult<T>`. The error
 * enum is closed: transport failures, store failures and protocol-level
 * conditions (412, expired sync tokens, oversized bodies) are all mapped into
 * it at the layer where they occur, so no foreign error type crosses a
 * component boundary.
 */

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Result type for calendar core operations
pub type CalendarResult<T> = Result<T, CalendarError>;

/// Coarse error classification used for retry and logging decisions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorKind {
    Auth,
    NotFound,
    Conflict,
    Permission,
    Network,
    Timeout,
    Server,
    ResponseTooLarge,
    Malformed,
    SyncTokenInvalid,
    Store,
    Busy,
    Cancelled,
    Other,
}

/// Calendar core error type
#[derive(Error, Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "details")]
pub enum CalendarError {
    /// 401, or 403 outside of a sync-token context. Surfaces to the re-auth flow.
    #[error("Authentication failed: {message}")]
    Auth {
        message: String,
        account_id: Option<String>,
    },

    /// 404. Only the DELETE path remaps this to success.
    #[error("Not found: {resource}")]
    NotFound { resource: String },

    /// 412 precondition failure on a conditional PUT/DELETE.
    #[error("Conflict on {url}: {message}")]
    Conflict {
        url: String,
        message: String,
        remote_etag: Option<String>,
    },

    /// 403 in a context other than sync-token validation.
    #[error("Permission denied: {message}")]
    Permission { message: String },

    /// Connection reset, unknown host, connection closed mid-body.
    #[error("Network error: {message}")]
    Network { message: String },

    /// Connect/read/write timeout.
    #[error("Timeout: {message}")]
    Timeout { message: String },

    /// 5xx responses. 503 carries the parsed Retry-After delay.
    #[error("Server error {status}: {message}")]
    Server {
        status: u16,
        message: String,
        retry_after_ms: Option<i64>,
    },

    /// Response body exceeded the configured cap; the read was aborted.
    #[error("Response too large (> {limit_bytes} bytes) from {url}")]
    ResponseTooLarge { url: String, limit_bytes: u64 },

    /// XML or iCalendar content that could not be parsed.
    #[error("Malformed {what}: {message}")]
    Malformed { what: String, message: String },

    /// RFC 6578 sync-token rejected by the server (410, or 403 naming
    /// `valid-sync-token`). PullStrategy falls back to an ETag diff.
    #[error("Sync token invalid: {message}")]
    SyncTokenInvalid { message: String },

    /// Store failures, including constraint violations.
    #[error("Store error during {operation}: {message}")]
    Store {
        operation: String,
        message: String,
        constraint_violation: bool,
    },

    /// The per-calendar sync lease is held by another task.
    #[error("Calendar {calendar_id} is already syncing")]
    Busy { calendar_id: String },

    /// The operation observed its cancellation token.
    #[error("Operation cancelled")]
    Cancelled,

    #[error("{message}")]
    Other { message: String },
}

impl CalendarError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            CalendarError::Auth { .. } => ErrorKind::Auth,
            CalendarError::NotFound { .. } => ErrorKind::NotFound,
            CalendarError::Conflict { .. } => ErrorKind::Conflict,
            CalendarError::Permission { .. } => ErrorKind::Permission,
            CalendarError::Network { .. } => ErrorKind::Network,
            CalendarError::Timeout { .. } => ErrorKind::Timeout,
            CalendarError::Server { .. } => ErrorKind::Server,
            CalendarError::ResponseTooLarge { .. } => ErrorKind::ResponseTooLarge,
            CalendarError::Malformed { .. } => ErrorKind::Malformed,
            CalendarError::SyncTokenInvalid { .. } => ErrorKind::SyncTokenInvalid,
            CalendarError::Store { .. } => ErrorKind::Store,
            CalendarError::Busy { .. } => ErrorKind::Busy,
            CalendarError::Cancelled => ErrorKind::Cancelled,
            CalendarError::Other { .. } => ErrorKind::Other,
        }
    }

    /// Whether the push/transport layer may retry this error with backoff.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self.kind(),
            ErrorKind::Network | ErrorKind::Timeout | ErrorKind::Server
        )
    }

    pub fn network(message: impl Into<String>) -> Self {
        CalendarError::Network {
            message: message.into(),
        }
    }

    pub fn malformed(what: impl Into<String>, message: impl Into<String>) -> Self {
        CalendarError::Malformed {
            what: what.into(),
            message: message.into(),
        }
    }

    pub fn store(operation: impl Into<String>, message: impl Into<String>) -> Self {
        CalendarError::Store {
            operation: operation.into(),
            message: message.into(),
            constraint_violation: false,
        }
    }

    pub fn other(message: impl Into<String>) -> Self {
        CalendarError::Other {
            message: message.into(),
        }
    }

    /// Maps a transport failure from reqwest into the taxonomy.
    pub fn from_reqwest(err: &reqwest::Error) -> Self {
        if err.is_timeout() {
            CalendarError::Timeout {
                message: err.to_string(),
            }
        } else {
            CalendarError::Network {
                message: err.to_string(),
            }
        }
    }
}

impl From<sqlx::Error> for CalendarError {
    fn from(err: sqlx::Error) -> Self {
        let constraint_violation = err
            .as_database_error()
            .map(|db| {
                matches!(
                    db.kind(),
                    sqlx::error::ErrorKind::UniqueViolation
                        | sqlx::error::ErrorKind::ForeignKeyViolation
                        | sqlx::error::ErrorKind::NotNullViolation
                        | sqlx::error::ErrorKind::CheckViolation
                )
            })
            .unwrap_or(false);
        CalendarError::Store {
            operation: "query".to_string(),
            message: err.to_string(),
            constraint_violation,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_kinds() {
        assert!(CalendarError::network("reset").is_retryable());
        assert!(CalendarError::Timeout {
            message: "read".into()
        }
        .is_retryable());
        assert!(CalendarError::Server {
            status: 503,
            message: "maintenance".into(),
            retry_after_ms: Some(30_000),
        }
        .is_retryable());

        assert!(!CalendarError::Auth {
            message: "401".into(),
            account_id: None
        }
        .is_retryable());
        assert!(!CalendarError::SyncTokenInvalid {
            message: "410".into()
        }
        .is_retryable());
        assert!(!CalendarError::Cancelled.is_retryable());
    }

    #[test]
    fn test_kind_mapping() {
        let err = CalendarError::Conflict {
            url: "https://example.com/cal/e.ics".into(),
            message: "precondition failed".into(),
            remote_etag: Some("\"abc\"".into()),
        };
        assert_eq!(err.kind(), ErrorKind::Conflict);
        assert_eq!(
            CalendarError::malformed("ics", "no VCALENDAR").kind(),
            ErrorKind::Malformed
        );
    }
}
