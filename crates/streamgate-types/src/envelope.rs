//! The message envelope producers and consumers exchange (`spec.md` §6).
//!
//! The engine itself treats the envelope mostly opaquely — it only lifts out
//! three producer-control fields (`_streamRetryConfig`, `_visibilityDelayMs`,
//! `_retryAttempt`) before persisting the rest as-is. Components above the
//! engine (the Router) work with the fully typed shape below.

use crate::retry::RetryPolicy;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Per-message metadata carried on every envelope.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct Metadata {
    pub guid: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub topic: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub jid: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gid: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dad: Option<String>,
    #[serde(default)]
    pub aid: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trc: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub spn: Option<String>,
    #[serde(default, rename = "try", skip_serializing_if = "Option::is_none")]
    pub try_count: Option<i32>,
    #[serde(default, rename = "await", skip_serializing_if = "Option::is_none")]
    pub awaited: Option<bool>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageType {
    Timehook,
    Webhook,
    Await,
    Result,
    Worker,
    Response,
    Transition,
    Signal,
    Interrupt,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Status {
    Success,
    Error,
    Pending,
}

/// Retry policy table keyed by response error code. `spec.md` §4.5 allows a
/// per-code max of 1, 2, or 3 retries.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct Policies {
    pub retry: HashMap<String, Vec<u8>>,
}

impl Policies {
    /// The configured max-retries ladder for a response code, if any.
    pub fn max_retries_for(&self, code: &str) -> Option<u8> {
        self.retry.get(code).and_then(|v| v.first()).copied()
    }
}

/// The full message envelope, as seen by consumers after hydration and by
/// the Router when inspecting worker responses.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StreamData {
    pub metadata: Metadata,
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<MessageType>,
    pub data: serde_json::Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub policies: Option<Policies>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<Status>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<i32>,
    #[serde(
        rename = "_streamRetryConfig",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub stream_retry_config: Option<RetryPolicy>,
    #[serde(
        rename = "_visibilityDelayMs",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub visibility_delay_ms: Option<i64>,
    #[serde(
        rename = "_retryAttempt",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub retry_attempt: Option<i32>,
}

/// Alias used by the Router: a worker's reply has the same shape as the
/// envelope it's responding to.
pub type StreamDataResponse = StreamData;
