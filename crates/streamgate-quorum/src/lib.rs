//! Quorum Service — pub/sub roll-call and version-activation protocol
//! (`spec.md` §4.6).

pub mod engine;
pub mod message;
pub mod transport;

pub use engine::{
    ActivationCompiler, NoopCallback, QuorumCallback, QuorumConfig, QuorumEngine, QuorumProfile,
};
pub use message::QuorumMessage;
pub use transport::{LocalQuorumTransport, QuorumSubscription, QuorumTransport};
