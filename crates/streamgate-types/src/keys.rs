//! Key Minter — deterministic derivation of stream, quorum, and job keys.
//!
//! Everything here is a pure function of `(namespace, app_id, ...)`; nothing
//! touches the database or a pub/sub connection. Keeping derivation pure and
//! centralized means the Stream Engine, Notification Manager, and Quorum
//! Service can't drift on naming.

use serde::{Deserialize, Serialize};

/// The consumer class a stream message belongs to, derived at publish time
/// from the stream name's suffix (`spec.md` §3).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum GroupName {
    Engine,
    Worker,
}

impl GroupName {
    pub fn as_str(&self) -> &'static str {
        match self {
            GroupName::Engine => "ENGINE",
            GroupName::Worker => "WORKER",
        }
    }

    /// Derives the group from a stream name: streams ending in `:` are
    /// engine-internal; everything else is worker-facing.
    pub fn derive(stream_name: &str) -> Self {
        if stream_name.ends_with(':') {
            GroupName::Engine
        } else {
            GroupName::Worker
        }
    }
}

impl std::fmt::Display for GroupName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Maximum length of a Postgres `NOTIFY` channel identifier.
pub const NOTIFY_CHANNEL_MAX_LEN: usize = 63;

/// Builds the `LISTEN`/`NOTIFY` channel name for a `(stream, group)` pair,
/// truncated to `NOTIFY_CHANNEL_MAX_LEN` bytes per `spec.md` §6.
pub fn notify_channel(stream_name: &str, group_name: &str) -> String {
    let mut channel = format!("stream_{stream_name}_{group_name}");
    if channel.len() > NOTIFY_CHANNEL_MAX_LEN {
        channel.truncate(NOTIFY_CHANNEL_MAX_LEN);
        // Truncation may land mid-codepoint on non-ASCII input; back off to
        // the nearest char boundary rather than panic.
        while !channel.is_char_boundary(channel.len()) {
            channel.pop();
        }
    }
    channel
}

/// Deterministically derives the Key Minter's namespace-scoped keys.
#[derive(Debug, Clone)]
pub struct KeyMinter {
    namespace: String,
    app_id: String,
}

impl KeyMinter {
    pub fn new(namespace: impl Into<String>, app_id: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            app_id: app_id.into(),
        }
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    pub fn app_id(&self) -> &str {
        &self.app_id
    }

    /// The Postgres schema name a given app's streams live in.
    pub fn schema_name(&self) -> String {
        safe_identifier(&self.app_id)
    }

    /// The general quorum channel shared by every engine in this
    /// `(namespace, app_id)` pair.
    pub fn quorum_channel(&self) -> String {
        format!("quorum:{}:{}", self.namespace, self.app_id)
    }

    /// The private, one-to-one channel keyed additionally by an engine's
    /// GUID (`spec.md` §4.6).
    pub fn quorum_private_channel(&self, engine_guid: &str) -> String {
        format!("quorum:{}:{}:{}", self.namespace, self.app_id, engine_guid)
    }

    /// The KV key a Scout role reservation is stored under.
    pub fn scout_role_key(&self, role: &str) -> String {
        format!("{}:{}:scout/{}", self.namespace, self.app_id, role)
    }

    /// The KV key a cluster-scoped activation reservation is stored under.
    pub fn activation_role_key(&self) -> String {
        format!("{}:{}:scout/activate", self.namespace, self.app_id)
    }

    /// The key a job/workflow instance is addressed by.
    pub fn job_key(&self, job_id: &str) -> String {
        format!("{}:{}:job/{}", self.namespace, self.app_id, job_id)
    }
}

/// Lower-cases and strips anything but `[a-z0-9_]` so a user-supplied app id
/// is safe to interpolate into a Postgres identifier (schema name).
fn safe_identifier(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for ch in raw.chars() {
        if ch.is_ascii_alphanumeric() || ch == '_' {
            out.push(ch.to_ascii_lowercase());
        } else {
            out.push('_');
        }
    }
    if out.is_empty() || out.chars().next().map(|c| c.is_ascii_digit()).unwrap_or(false) {
        out.insert(0, '_');
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn group_derivation_follows_colon_suffix() {
        assert_eq!(GroupName::derive("my-stream:"), GroupName::Engine);
        assert_eq!(GroupName::derive("my-stream"), GroupName::Worker);
    }

    #[test]
    fn channel_name_is_truncated_to_63_bytes() {
        let long_name = "x".repeat(80);
        let channel = notify_channel(&long_name, "WORKER");
        assert_eq!(channel.len(), NOTIFY_CHANNEL_MAX_LEN);
        assert!(channel.starts_with("stream_"));
    }

    #[test]
    fn channel_name_untouched_when_short() {
        let channel = notify_channel("orders", "WORKER");
        assert_eq!(channel, "stream_orders_WORKER");
    }

    #[test]
    fn safe_identifier_normalizes_app_id() {
        let minter = KeyMinter::new("ns", "My App-1");
        assert_eq!(minter.schema_name(), "my_app_1");
    }

    #[test]
    fn quorum_channels_are_namespaced() {
        let minter = KeyMinter::new("prod", "checkout");
        assert_eq!(minter.quorum_channel(), "quorum:prod:checkout");
        assert_eq!(
            minter.quorum_private_channel("guid-1"),
            "quorum:prod:checkout:guid-1"
        );
    }

    #[test]
    fn scout_keys_are_distinct_per_role() {
        let minter = KeyMinter::new("prod", "checkout");
        assert_ne!(
            minter.scout_role_key("router"),
            minter.activation_role_key()
        );
    }
}
