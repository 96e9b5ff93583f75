/*!
 * Meridian Calendar Core
 *
 * Offline-first personal calendar engine: a local SQLite store of events
 * with bidirectional CalDAV synchronization (iCloud, Nextcloud, Baïkal,
 * Radicale, Fastmail, Open-Xchange) and read-only ICS feed subscriptions.
 *
 * The crate is organized around the sync pipeline:
 *
 * - [`store`]: transactional persistence and reactive change streams
 * - [`occurrence`]: RRULE/RDATE/EXDATE materialization into a queryable index
 * - [`ics`]: the iCalendar codec (parse, preservation-patch, generate)
 * - [`caldav`]: HTTP transport, provider quirks and discovery
 * - [`sync`]: pull, push, conflict resolution and orchestration
 * - [`subscriptions`]: one-way ICS feed ingestion
 * - [`reminders`]: scheduled-reminder planning
 * - [`engine`]: the process-boundary facade embedders talk to
 *
 * Everything fallible returns [`error::CalendarResult`]; cancellation is an
 * explicit `CancellationToken` parameter on every suspending operation.
 */

pub mod caldav;
pub mod config;
pub mod credentials;
pub mod engine;
pub mod error;
pub mod ics;
pub mod jobs;
pub mod occurrence;
pub mod reminders;
pub mod store;
pub mod subscriptions;
pub mod sync;
pub mod time;
pub mod types;

#[cfg(test)]
mod integration_test;

pub use config::CoreConfig;
pub use engine::CalendarEngine;
pub use error::{CalendarError, CalendarResult, ErrorKind};
pub use store::Store;
pub use types::{
    Account, Calendar, EditScope, Event, EventDraft, EventStatus, IcsSubscription, Occurrence,
    PendingOperation, Provider, ReminderStatus, ScheduledReminder, SyncCounts, SyncOutcome,
    SyncStatus,
};

/// Installs a tracing subscriber driven by `RUST_LOG` (falling back to
/// `info`). Embedders with their own subscriber skip this.
pub fn init_tracing() {
    use tracing_subscriber::EnvFilter;
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .try_init();
}
