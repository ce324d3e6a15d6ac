//! Shared types for the stream-message broker: the message envelope,
//! retry-policy normalization, the Key Minter, and the error taxonomy.
//!
//! This crate has no database or transport dependencies of its own beyond
//! `sqlx`'s error type (needed for the `StreamError` conversion) — everything
//! here is pure data and pure functions, shared by every other crate in the
//! workspace so that naming and policy semantics can't drift between them.

pub mod envelope;
pub mod error;
pub mod keys;
pub mod retry;

pub use envelope::{Metadata, MessageType, Policies, Status, StreamData, StreamDataResponse};
pub use error::StreamError;
pub use keys::{notify_channel, GroupName, KeyMinter, NOTIFY_CHANNEL_MAX_LEN};
pub use retry::{MaximumInterval, RetryPolicy, RetryPolicyInput};
