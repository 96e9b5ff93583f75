/*!
 * Background Job Interface
 *
 * The core does not own a scheduler. It hands work items and backoff hints
 * to an embedder-provided `JobRunner`, which decides when (and under what
 * OS constraints) `sync_calendar` and `refresh_subscription` actually run.
 */

use async_trait::async_trait;

/// A unit of background work the core wants executed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncJob {
    SyncCalendar { calendar_id: String },
    RefreshIcsSubscription { subscription_id: String },
}

#[async_trait]
pub trait JobRunner: Send + Sync {
    /// Schedules a job after at least `delay_ms`. Scheduling the same job
    /// again replaces the earlier request.
    async fn schedule(&self, job: SyncJob, delay_ms: i64);

    /// Drops every queued job touching this account's calendars.
    async fn cancel_for_account(&self, account_id: &str);

    /// Drops the queued refresh for a subscription.
    async fn cancel_for_subscription(&self, subscription_id: &str);
}

/// Suggested delay before retrying a failing account's sync. The runner may
/// stretch it (battery, metered network) but should not shrink it.
pub fn sync_backoff_hint_ms(consecutive_failures: i64) -> i64 {
    const BASE_MS: i64 = 60_000;
    const CAP_MS: i64 = 6 * 60 * 60 * 1000;
    let n = consecutive_failures.max(0).min(32) as u32;
    BASE_MS.checked_mul(1i64 << n).unwrap_or(CAP_MS).min(CAP_MS)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_hint_growth_and_cap() {
        assert_eq!(sync_backoff_hint_ms(0), 60_000);
        assert_eq!(sync_backoff_hint_ms(1), 120_000);
        assert_eq!(sync_backoff_hint_ms(-3), 60_000);
        assert_eq!(sync_backoff_hint_ms(50), 6 * 60 * 60 * 1000);
        let mut last = 0;
        for n in 0..20 {
            let hint = sync_backoff_hint_ms(n);
            assert!(hint >= last);
            last = hint;
        }
    }
}
