use anyhow::Result;
use std::sync::Arc;
use streamgate_notify::ConnectionHub;
use streamgate_quorum::QuorumEngine;
use streamgate_scout::ScoutManager;

/// Enforces the shutdown order `spec.md` §5/§9 call out under "cyclic
/// cleanup": the Scout's role-holding loop stops (and releases its role)
/// before the connection's fallback timer and notification handler are torn
/// down, so a scout mid-scan never races a hub that has already `UNLISTEN`ed.
/// The Quorum Service's dispatch loop is independent of both and is stopped
/// alongside the scout.
pub struct Shutdown {
    scout: Arc<ScoutManager>,
    quorum: Arc<QuorumEngine>,
    hub: Arc<ConnectionHub>,
    instance_id: String,
}

impl Shutdown {
    pub fn new(
        scout: Arc<ScoutManager>,
        quorum: Arc<QuorumEngine>,
        hub: Arc<ConnectionHub>,
        instance_id: String,
    ) -> Self {
        Self {
            scout,
            quorum,
            hub,
            instance_id,
        }
    }

    pub async fn run(self) -> Result<()> {
        self.scout.stop().await;
        self.quorum.stop().await;
        self.hub.cleanup(&self.instance_id).await?;
        Ok(())
    }
}
