//! `RoleStore` — the key-value collaborator Scout and Quorum activation use
//! to elect a single role-holder (`spec.md` §3 "Scout reservation", §4.4,
//! §4.6).
//!
//! The real backend (the hash store the workflow engine already depends on)
//! is out of scope for this crate (`spec.md` §1); this trait is the seam a
//! production binding would implement, mirroring how the teacher's
//! `NatsPublisher` trait separates the wire protocol from a real client.

use async_trait::async_trait;
use std::time::Duration;

/// A set-if-absent-with-TTL / conditional-delete key-value collaborator.
///
/// Implementations must make `acquire` atomic: two concurrent callers racing
/// on the same key must not both succeed.
#[async_trait]
pub trait RoleStore: Send + Sync {
    /// Attempts to claim `key` for `holder`, valid for `ttl`. Returns `true`
    /// if the claim succeeded (the key was absent or previously expired),
    /// `false` if another holder currently holds it.
    async fn acquire(&self, key: &str, holder: &str, ttl: Duration) -> anyhow::Result<bool>;

    /// Extends the TTL of a claim this `holder` already owns. Returns `false`
    /// (without side effects) if `holder` is not the current owner.
    async fn refresh(&self, key: &str, holder: &str, ttl: Duration) -> anyhow::Result<bool>;

    /// Releases a claim, but only if `holder` is still the current owner
    /// (conditional delete). Returns `true` if a release occurred.
    async fn release(&self, key: &str, holder: &str) -> anyhow::Result<bool>;

    /// Returns the current holder of `key`, if any (for observability/tests).
    async fn holder_of(&self, key: &str) -> anyhow::Result<Option<String>>;
}
