//! Wire shape for quorum pub/sub traffic (`spec.md` §4.6).

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A message exchanged on the general quorum channel or an engine's private
/// channel, tagged by `type` the way the rest of the broker's envelopes are.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum QuorumMessage {
    /// Roll-call request. Every live recipient answers with a [`QuorumMessage::Pong`]
    /// on the quorum channel.
    Ping {
        originator: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        details: Option<Value>,
    },
    /// Roll-call response. Only the originator counts its own pongs.
    Pong {
        originator: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        profile: Option<Value>,
    },
    /// Broadcast cluster-wide version switch; every recipient adopts it
    /// locally.
    Activate {
        cache_mode: String,
        until_version: String,
    },
    /// Backpressure signal forwarded to the engine collaborator.
    Throttle { throttle: i64 },
    /// Scheduled-work nudge forwarded to the engine collaborator.
    Work,
    /// Cron tick forwarded to the engine collaborator.
    Cron,
    /// A job ready for dispatch, forwarded to the engine collaborator.
    Job { topic: String, job: Value },
    /// Requests a roll-call response cycle (see `QuorumEngine::do_roll_call`).
    Rollcall { interval_ms: u64, max: u32 },
}
