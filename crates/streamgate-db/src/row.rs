//! The persisted shape of a single stream message (`spec.md` §3).

use chrono::{DateTime, Utc};
use sqlx::FromRow;
use streamgate_types::RetryPolicy;

/// Mirrors a `streams` row. Queries cast `backoff_coefficient` to
/// `double precision` so it decodes straight into `f64` without pulling in
/// a decimal crate purely for one column.
#[derive(Debug, Clone, FromRow)]
pub struct StreamRow {
    pub id: i64,
    pub stream_name: String,
    pub group_name: String,
    pub message: String,
    pub created_at: DateTime<Utc>,
    pub reserved_at: Option<DateTime<Utc>>,
    pub reserved_by: Option<String>,
    pub expired_at: Option<DateTime<Utc>>,
    pub visible_at: DateTime<Utc>,
    pub retry_attempt: i32,
    pub max_retry_attempts: i32,
    pub backoff_coefficient: f64,
    pub maximum_interval_seconds: i32,
}

impl StreamRow {
    /// The row's retry policy, in canonical storage shape.
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_retry_attempts: self.max_retry_attempts,
            backoff_coefficient: self.backoff_coefficient,
            maximum_interval_seconds: self.maximum_interval_seconds,
        }
    }
}

/// A hydrated message as returned from `fetch`: the row id, the rehydrated
/// JSON payload (with retry-config control fields re-injected if
/// non-default), and the row's retry-attempt counter.
#[derive(Debug, Clone)]
pub struct FetchedMessage {
    pub id: String,
    pub stream_name: String,
    pub group_name: String,
    pub payload: serde_json::Value,
    pub retry_policy: RetryPolicy,
    pub retry_attempt: i32,
}
