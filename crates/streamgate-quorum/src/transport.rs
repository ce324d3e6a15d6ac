//! `QuorumTransport` — the pub/sub seam the Quorum Service talks to.
//!
//! `spec.md` §1 puts the real transport (NATS, in the teacher's stack) out
//! of scope; this trait is the boundary a production binding would
//! implement, mirroring how `NatsPublisher`/`TestNats` separate the wire
//! protocol from a real client.

use crate::message::QuorumMessage;
use async_trait::async_trait;
use dashmap::DashMap;
use streamgate_types::StreamError;
use tokio::sync::broadcast;

/// A handle to a live channel subscription.
pub struct QuorumSubscription {
    receiver: broadcast::Receiver<QuorumMessage>,
}

impl QuorumSubscription {
    /// Awaits the next message, transparently resubscribing past any
    /// lagged-receiver gap. Returns `None` once the channel is closed
    /// (no publishers remain and the underlying sender was dropped).
    pub async fn recv(&mut self) -> Option<QuorumMessage> {
        loop {
            match self.receiver.recv().await {
                Ok(message) => return Some(message),
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }
}

/// Publish/subscribe over a named channel. Implementations need not
/// guarantee delivery to zero subscribers is an error — publishing to an
/// empty channel is a normal, successful no-op.
#[async_trait]
pub trait QuorumTransport: Send + Sync {
    async fn publish(&self, channel: &str, message: QuorumMessage) -> Result<(), StreamError>;
    async fn subscribe(&self, channel: &str) -> Result<QuorumSubscription, StreamError>;
}

/// Single-process, in-memory `QuorumTransport` backed by `tokio::sync::broadcast`
/// channels keyed by name — the `streamgate-quorum` analogue of the teacher's
/// `TestNats`. Every `QuorumEngine` instance running in the same process can
/// address each other through a shared `Arc<LocalQuorumTransport>`.
pub struct LocalQuorumTransport {
    channels: DashMap<String, broadcast::Sender<QuorumMessage>>,
    capacity: usize,
}

impl LocalQuorumTransport {
    pub fn new() -> Self {
        Self {
            channels: DashMap::new(),
            capacity: 256,
        }
    }

    fn sender(&self, channel: &str) -> broadcast::Sender<QuorumMessage> {
        self.channels
            .entry(channel.to_string())
            .or_insert_with(|| broadcast::channel(self.capacity).0)
            .clone()
    }
}

impl Default for LocalQuorumTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl QuorumTransport for LocalQuorumTransport {
    async fn publish(&self, channel: &str, message: QuorumMessage) -> Result<(), StreamError> {
        // A `SendError` here only means nobody is currently subscribed,
        // which is not a failure for a pub/sub publish.
        let _ = self.sender(channel).send(message);
        Ok(())
    }

    async fn subscribe(&self, channel: &str) -> Result<QuorumSubscription, StreamError> {
        Ok(QuorumSubscription {
            receiver: self.sender(channel).subscribe(),
        })
    }
}
