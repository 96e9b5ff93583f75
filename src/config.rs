/*!
 * Calendar Core Configuration
 *
 * Tunables for sync, recurrence expansion and reminder planning. Defaults
 * match shipped behaviour; embedders override individual fields.
 */

use chrono_tz::Tz;
use serde::{Deserialize, Serialize};

/// Top-level configuration for the calendar core.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoreConfig {
    /// Recurrence expansion reaches this far back from now.
    pub horizon_past_days: i64,
    /// Recurrence expansion reaches this far forward from now.
    pub horizon_future_days: i64,
    /// Reminder planning window.
    pub reminder_lookahead_hours: i64,
    /// How many hrefs go into a single calendar-multiget REPORT.
    pub multiget_chunk_size: usize,
    /// Concurrent calendar syncs per account.
    pub max_parallel_per_account: usize,
    /// Per-calendar sync lease duration before it is considered stale.
    pub sync_lease_ms: i64,
    /// IANA zone used for day-code derivation of timed events. All-day
    /// events always use UTC.
    #[serde(with = "tz_serde")]
    pub device_timezone: Tz,
    pub push: PushConfig,
    pub http: HttpConfig,
}

/// Pending-operation drain policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PushConfig {
    pub base_delay_ms: i64,
    pub max_backoff_ms: i64,
    pub max_retries: i64,
    /// FAILED ops return to PENDING after this long for one more attempt.
    pub auto_reset_failed_ms: i64,
    /// Ops older than this since `lifetime_reset_at` are discarded.
    pub operation_lifetime_ms: i64,
}

/// CalDAV/ICS transport policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpConfig {
    pub connect_timeout_secs: u64,
    pub read_timeout_secs: u64,
    pub write_timeout_secs: u64,
    /// Responses larger than this are aborted with ResponseTooLarge.
    pub max_body_bytes: u64,
    /// Transport retries on NETWORK/TIMEOUT/5xx, beyond the first attempt.
    pub max_retries: u32,
    pub retry_base_delay_ms: u64,
    pub pool_max_idle_per_host: usize,
    pub pool_idle_timeout_secs: u64,
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            horizon_past_days: 365,
            horizon_future_days: 730,
            reminder_lookahead_hours: 48,
            multiget_chunk_size: 50,
            max_parallel_per_account: 3,
            sync_lease_ms: 5 * 60 * 1000,
            device_timezone: chrono_tz::UTC,
            push: PushConfig::default(),
            http: HttpConfig::default(),
        }
    }
}

impl Default for PushConfig {
    fn default() -> Self {
        Self {
            base_delay_ms: 30_000,
            max_backoff_ms: 5 * 60 * 60 * 1000,
            max_retries: 10,
            auto_reset_failed_ms: 24 * 60 * 60 * 1000,
            operation_lifetime_ms: 30 * 24 * 60 * 60 * 1000,
        }
    }
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            connect_timeout_secs: 15,
            read_timeout_secs: 30,
            write_timeout_secs: 30,
            max_body_bytes: 10 * 1024 * 1024,
            max_retries: 2,
            retry_base_delay_ms: 500,
            pool_max_idle_per_host: 5,
            pool_idle_timeout_secs: 300,
        }
    }
}

impl CoreConfig {
    pub fn horizon_past_ms(&self) -> i64 {
        self.horizon_past_days * 86_400_000
    }

    pub fn horizon_future_ms(&self) -> i64 {
        self.horizon_future_days * 86_400_000
    }

    pub fn reminder_lookahead_ms(&self) -> i64 {
        self.reminder_lookahead_hours * 3_600_000
    }
}

mod tz_serde {
    use chrono_tz::Tz;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(tz: &Tz, ser: S) -> Result<S::Ok, S::Error> {
        ser.serialize_str(tz.name())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(de: D) -> Result<Tz, D::Error> {
        let name = String::deserialize(de)?;
        name.parse().map_err(serde::de::Error::custom)
    }
}
