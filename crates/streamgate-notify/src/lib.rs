//! Notification Manager — per-connection `LISTEN`/`NOTIFY` registry,
//! notification demultiplexing, and the bounded fallback poller
//! (`spec.md` §4.3).

pub mod hub;

pub use hub::{ConnectionHub, DeliveryCallback};
