/*!
 * Synchronization Pipeline
 *
 * Pull, push, conflict resolution and the per-calendar orchestration.
 */

pub mod conflict;
pub mod engine;
pub mod pull;
pub mod push;

pub use conflict::{ConflictResolution, ConflictResolver};
pub use engine::SyncEngine;
pub use pull::{PullOutcome, PullStrategy};
pub use push::{calculate_retry_delay, ClientFactory, PushOutcome, PushStrategy};
