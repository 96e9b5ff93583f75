/*!
 * CalDAV Wire Layer
 *
 * Transport, multistatus parsing, provider quirks and discovery. Everything
 * above this module works in terms of typed results; no XML or HTTP detail
 * leaks upward.
 */

pub mod client;
pub mod discovery;
pub mod quirks;
pub mod xml;

pub use client::{CalDavClient, Credentials, MoveOutcome};
pub use discovery::{discover_account, DiscoveredAccount};
pub use quirks::{Quirks, RemoteCalendar, RemoteEvent, SyncCollectionReport};
