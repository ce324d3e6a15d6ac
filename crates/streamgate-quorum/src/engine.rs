//! `QuorumEngine` — per-engine roll-call/activation state machine
//! (`spec.md` §4.6): `init → subscribed → {idle ↔ rolling-call ↔ activating}`.

use crate::message::QuorumMessage;
use crate::transport::QuorumTransport;
use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use streamgate_kv::RoleStore;
use streamgate_types::{KeyMinter, StreamError};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// The engine-external collaborator that actually swaps in a new workflow
/// version once activation has been agreed by quorum. Out of scope per
/// `spec.md` §1; this trait is the seam.
#[async_trait]
pub trait ActivationCompiler: Send + Sync {
    async fn activate(&self, until_version: &str) -> Result<(), StreamError>;
}

/// Dispatch sink for the message kinds the Quorum Service forwards rather
/// than handles itself (`spec.md` §4.6). Default bodies are no-ops so a
/// caller only needs to override the kinds it cares about.
#[async_trait]
pub trait QuorumCallback: Send + Sync {
    async fn on_throttle(&self, _throttle: i64) {}
    async fn on_work(&self) {}
    async fn on_cron(&self) {}
    async fn on_job(&self, _topic: String, _job: Value) {}
}

/// No-op callback, useful when a caller only drives `activate`/`request_quorum`
/// directly and has no interest in forwarded dispatch.
pub struct NoopCallback;

#[async_trait]
impl QuorumCallback for NoopCallback {}

/// Volatile per-member snapshot exchanged during roll-call (`spec.md`
/// GLOSSARY "Quorum profile").
#[derive(Debug, Clone, Serialize)]
pub struct QuorumProfile {
    pub engine_guid: String,
    pub namespace: String,
    pub app_id: String,
    pub stream_name: Option<String>,
    pub throttle: Option<i64>,
}

/// Tunables governing activation retries and roll-call iteration bounds.
#[derive(Debug, Clone)]
pub struct QuorumConfig {
    /// `HMSH_ACTIVATION_MAX_RETRY`: retries allowed after a divergent
    /// three-pass activation before giving up with `QuorumNotReached`.
    pub activation_max_retry: u32,
    /// `HMSH_QUORUM_ROLLCALL_CYCLES`: the hard cap on roll-call iterations,
    /// independent of whatever `max` a `rollcall` message requests.
    pub rollcall_cycles: u32,
}

impl Default for QuorumConfig {
    fn default() -> Self {
        Self {
            activation_max_retry: 5,
            rollcall_cycles: 12,
        }
    }
}

#[derive(Default)]
struct CountingState {
    counting: bool,
    pong_count: i64,
    pong_profiles: Vec<Value>,
}

#[derive(Default)]
struct AdoptedState {
    cache_mode: Option<String>,
    until_version: Option<String>,
}

/// Coordinates one engine's participation in the ping/pong/activation
/// protocol. Subscribes to both the general quorum channel and its own
/// private channel on [`start`](QuorumEngine::start).
pub struct QuorumEngine {
    transport: Arc<dyn QuorumTransport>,
    role_store: Arc<dyn RoleStore>,
    compiler: Option<Arc<dyn ActivationCompiler>>,
    callback: Arc<dyn QuorumCallback>,
    quorum_channel: String,
    private_channel: String,
    activation_role_key: String,
    engine_guid: String,
    profile: QuorumProfile,
    config: QuorumConfig,
    counting: Mutex<CountingState>,
    adopted: Mutex<AdoptedState>,
    stop: Arc<AtomicBool>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl QuorumEngine {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        transport: Arc<dyn QuorumTransport>,
        role_store: Arc<dyn RoleStore>,
        minter: &KeyMinter,
        engine_guid: impl Into<String>,
        profile: QuorumProfile,
        config: QuorumConfig,
        compiler: Option<Arc<dyn ActivationCompiler>>,
        callback: Arc<dyn QuorumCallback>,
    ) -> Arc<Self> {
        let engine_guid = engine_guid.into();
        Arc::new(Self {
            quorum_channel: minter.quorum_channel(),
            private_channel: minter.quorum_private_channel(&engine_guid),
            activation_role_key: minter.activation_role_key(),
            transport,
            role_store,
            compiler,
            callback,
            engine_guid,
            profile,
            config,
            counting: Mutex::new(CountingState::default()),
            adopted: Mutex::new(AdoptedState::default()),
            stop: Arc::new(AtomicBool::new(false)),
            task: Mutex::new(None),
        })
    }

    /// Subscribes to both channels and starts the dispatch loop as a
    /// background task. Idempotent.
    pub async fn start(self: Arc<Self>) -> Result<(), StreamError> {
        let mut task = self.task.lock().await;
        if task.is_some() {
            return Ok(());
        }
        let general = self.transport.subscribe(&self.quorum_channel).await?;
        let private = self.transport.subscribe(&self.private_channel).await?;
        let this = self.clone();
        *task = Some(tokio::spawn(async move { this.run(general, private).await }));
        Ok(())
    }

    /// Stops the dispatch loop. Does not release any activation role —
    /// `activate` releases its own role as part of each pass.
    pub async fn stop(&self) {
        self.stop.store(true, Ordering::SeqCst);
        if let Some(task) = self.task.lock().await.take() {
            let _ = task.await;
        }
    }

    async fn run(
        self: Arc<Self>,
        mut general: crate::transport::QuorumSubscription,
        mut private: crate::transport::QuorumSubscription,
    ) {
        loop {
            if self.stop.load(Ordering::SeqCst) {
                return;
            }
            let message = tokio::select! {
                m = general.recv() => m,
                m = private.recv() => m,
                _ = tokio::time::sleep(Duration::from_secs(1)) => continue,
            };
            match message {
                Some(message) => self.clone().dispatch(message).await,
                None => return,
            }
        }
    }

    async fn dispatch(self: Arc<Self>, message: QuorumMessage) {
        match message {
            QuorumMessage::Ping { originator, .. } => {
                let pong = QuorumMessage::Pong {
                    originator,
                    profile: Some(self.profile_value()),
                };
                if let Err(e) = self.transport.publish(&self.quorum_channel, pong).await {
                    warn!(error = %e, "failed to answer quorum ping");
                }
            }
            QuorumMessage::Pong { originator, profile } => {
                if originator == self.engine_guid {
                    let mut state = self.counting.lock().await;
                    if state.counting {
                        state.pong_count += 1;
                        if let Some(profile) = profile {
                            state.pong_profiles.push(profile);
                        }
                    }
                }
            }
            QuorumMessage::Activate {
                cache_mode,
                until_version,
            } => {
                let mut adopted = self.adopted.lock().await;
                adopted.cache_mode = Some(cache_mode);
                adopted.until_version = Some(until_version);
            }
            QuorumMessage::Throttle { throttle } => self.callback.on_throttle(throttle).await,
            QuorumMessage::Work => self.callback.on_work().await,
            QuorumMessage::Cron => self.callback.on_cron().await,
            QuorumMessage::Job { topic, job } => self.callback.on_job(topic, job).await,
            QuorumMessage::Rollcall { interval_ms, max } => {
                let this = self.clone();
                tokio::spawn(async move {
                    this.do_roll_call(Duration::from_millis(interval_ms), max)
                        .await;
                });
            }
        }
    }

    fn profile_value(&self) -> Value {
        serde_json::to_value(&self.profile).unwrap_or(Value::Null)
    }

    /// `until_version` this engine has locally adopted from the most recent
    /// `activate` broadcast it has seen, if any.
    pub async fn adopted_version(&self) -> Option<String> {
        self.adopted.lock().await.until_version.clone()
    }

    /// Resets the in-flight counter, pings the quorum channel, sleeps
    /// `delay`, and returns however many pongs it accumulated
    /// (`spec.md` §4.6 `requestQuorum`).
    pub async fn request_quorum(
        &self,
        delay: Duration,
        details: Option<Value>,
    ) -> Result<i64, StreamError> {
        {
            let mut state = self.counting.lock().await;
            state.counting = true;
            state.pong_count = 0;
            state.pong_profiles.clear();
        }
        self.transport
            .publish(
                &self.quorum_channel,
                QuorumMessage::Ping {
                    originator: self.engine_guid.clone(),
                    details,
                },
            )
            .await?;
        tokio::time::sleep(delay).await;
        let mut state = self.counting.lock().await;
        state.counting = false;
        Ok(state.pong_count)
    }

    /// Attempts cluster-wide activation of `version` (`spec.md` §4.6
    /// `activate`). Three successive `requestQuorum` passes must agree on a
    /// positive count before the switch is broadcast; divergence backs off
    /// `delay*2` and retries up to `activation_max_retry` times.
    pub async fn activate(&self, version: &str, delay: Duration) -> Result<bool, StreamError> {
        let mut attempt = 0u32;
        let mut current_delay = delay;

        loop {
            let acquired = self
                .role_store
                .acquire(
                    &self.activation_role_key,
                    &self.engine_guid,
                    current_delay * 8,
                )
                .await
                .map_err(|e| StreamError::Transport(e.to_string()))?;

            if !acquired {
                tokio::time::sleep(delay * 6).await;
                return Ok(self.adopted_version().await.as_deref() == Some(version));
            }

            let c1 = self.request_quorum(current_delay, None).await?;
            let c2 = self.request_quorum(current_delay, None).await?;
            let c3 = self.request_quorum(current_delay, None).await?;

            if c1 > 0 && c1 == c2 && c2 == c3 {
                self.transport
                    .publish(
                        &self.quorum_channel,
                        QuorumMessage::Activate {
                            cache_mode: "normal".to_string(),
                            until_version: version.to_string(),
                        },
                    )
                    .await?;
                {
                    let mut adopted = self.adopted.lock().await;
                    adopted.until_version = Some(version.to_string());
                }
                let _ = self
                    .role_store
                    .release(&self.activation_role_key, &self.engine_guid)
                    .await;
                if let Some(compiler) = &self.compiler {
                    compiler.activate(version).await?;
                }
                info!(version, count = c1, "quorum activation agreed");
                return Ok(true);
            }

            let _ = self
                .role_store
                .release(&self.activation_role_key, &self.engine_guid)
                .await;
            attempt += 1;
            if attempt >= self.config.activation_max_retry {
                return Err(StreamError::QuorumNotReached { attempts: attempt });
            }
            debug!(c1, c2, c3, attempt, "activation counts diverged, retrying");
            current_delay *= 2;
        }
    }

    /// Responds to a `rollcall` request with up to `max` pongs (capped by
    /// `config.rollcall_cycles`), jittered between `interval/2` and
    /// `interval/2 + interval/2` (`spec.md` §4.6 `doRollCall`).
    async fn do_roll_call(&self, interval: Duration, max: u32) {
        let cycles = max.min(self.config.rollcall_cycles).max(1);
        let base_ms = (interval.as_millis() as u64 / 2).max(1);
        for _ in 0..cycles {
            if self.stop.load(Ordering::SeqCst) {
                return;
            }
            let jitter_ms = fastrand::u64(0..=base_ms);
            tokio::time::sleep(Duration::from_millis(base_ms + jitter_ms)).await;
            let pong = QuorumMessage::Pong {
                originator: self.engine_guid.clone(),
                profile: Some(self.profile_value()),
            };
            if let Err(e) = self.transport.publish(&self.quorum_channel, pong).await {
                warn!(error = %e, "roll-call pong failed to publish");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::LocalQuorumTransport;
    use streamgate_kv::InMemoryRoleStore;

    fn minter() -> KeyMinter {
        KeyMinter::new("ns", "app")
    }

    fn profile(guid: &str) -> QuorumProfile {
        QuorumProfile {
            engine_guid: guid.to_string(),
            namespace: "ns".to_string(),
            app_id: "app".to_string(),
            stream_name: None,
            throttle: None,
        }
    }

    async fn engine(
        transport: Arc<dyn QuorumTransport>,
        role_store: Arc<dyn RoleStore>,
        guid: &str,
    ) -> Arc<QuorumEngine> {
        QuorumEngine::new(
            transport,
            role_store,
            &minter(),
            guid,
            profile(guid),
            QuorumConfig::default(),
            None,
            Arc::new(NoopCallback),
        )
    }

    #[tokio::test]
    async fn request_quorum_counts_pongs_from_live_peers() {
        let transport: Arc<dyn QuorumTransport> = Arc::new(LocalQuorumTransport::new());
        let role_store: Arc<dyn RoleStore> = Arc::new(InMemoryRoleStore::new());

        let initiator = engine(transport.clone(), role_store.clone(), "e1").await;
        let peer_a = engine(transport.clone(), role_store.clone(), "e2").await;
        let peer_b = engine(transport.clone(), role_store.clone(), "e3").await;

        initiator.clone().start().await.unwrap();
        peer_a.clone().start().await.unwrap();
        peer_b.clone().start().await.unwrap();

        let count = initiator
            .request_quorum(Duration::from_millis(40), None)
            .await
            .unwrap();

        assert_eq!(count, 3);

        initiator.stop().await;
        peer_a.stop().await;
        peer_b.stop().await;
    }

    #[tokio::test]
    async fn activation_succeeds_when_three_passes_agree() {
        let transport: Arc<dyn QuorumTransport> = Arc::new(LocalQuorumTransport::new());
        let role_store: Arc<dyn RoleStore> = Arc::new(InMemoryRoleStore::new());

        let initiator = engine(transport.clone(), role_store.clone(), "e1").await;
        let peer = engine(transport.clone(), role_store.clone(), "e2").await;

        initiator.clone().start().await.unwrap();
        peer.clone().start().await.unwrap();

        let activated = initiator
            .activate("v2", Duration::from_millis(30))
            .await
            .unwrap();

        assert!(activated);
        // give the peer's dispatch loop a tick to process the broadcast `activate`
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(initiator.adopted_version().await, Some("v2".to_string()));
        assert_eq!(peer.adopted_version().await, Some("v2".to_string()));
        assert_eq!(
            role_store
                .holder_of(&minter().activation_role_key())
                .await
                .unwrap(),
            None
        );

        initiator.stop().await;
        peer.stop().await;
    }

    #[tokio::test]
    async fn activation_fails_with_quorum_not_reached_when_no_peers_agree() {
        let transport: Arc<dyn QuorumTransport> = Arc::new(LocalQuorumTransport::new());
        let role_store: Arc<dyn RoleStore> = Arc::new(InMemoryRoleStore::new());

        let mut config = QuorumConfig::default();
        config.activation_max_retry = 2;
        let initiator = QuorumEngine::new(
            transport.clone(),
            role_store.clone(),
            &minter(),
            "e1",
            profile("e1"),
            config,
            None,
            Arc::new(NoopCallback),
        );
        // Deliberately not started: with nobody subscribed to answer its own
        // ping, every `requestQuorum` pass returns 0, which never satisfies
        // `count > 0` and so never agrees across passes.

        let err = initiator
            .activate("v2", Duration::from_millis(10))
            .await
            .unwrap_err();

        match err {
            StreamError::QuorumNotReached { attempts } => assert_eq!(attempts, 2),
            other => panic!("unexpected error: {other:?}"),
        }

        initiator.stop().await;
    }

    #[tokio::test]
    async fn rollcall_message_triggers_bounded_pongs() {
        let transport: Arc<dyn QuorumTransport> = Arc::new(LocalQuorumTransport::new());
        let role_store: Arc<dyn RoleStore> = Arc::new(InMemoryRoleStore::new());

        let responder = engine(transport.clone(), role_store.clone(), "e2").await;
        responder.clone().start().await.unwrap();

        let mut sub = transport.subscribe(&minter().quorum_channel()).await.unwrap();
        transport
            .publish(
                &minter().quorum_channel(),
                QuorumMessage::Rollcall {
                    interval_ms: 10,
                    max: 2,
                },
            )
            .await
            .unwrap();

        let mut pongs = 0;
        while pongs < 2 {
            match tokio::time::timeout(Duration::from_millis(500), sub.recv())
                .await
                .expect("timed out waiting for roll-call pongs")
            {
                Some(QuorumMessage::Pong { originator, .. }) => {
                    assert_eq!(originator, "e2");
                    pongs += 1;
                }
                Some(_) => continue,
                None => panic!("transport closed unexpectedly"),
            }
        }
        assert_eq!(pongs, 2);

        responder.stop().await;
    }
}
