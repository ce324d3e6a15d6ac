//! Scout Manager — ensures delayed messages are surfaced promptly by having
//! exactly one live engine drive the visibility-scan poll loop (`spec.md`
//! §4.4).

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use streamgate_db::VisibilityScanner;
use streamgate_kv::RoleStore;
use streamgate_types::StreamError;
use tokio::sync::{Mutex, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Tunables for the Scout role-acquisition and poll cadence.
#[derive(Debug, Clone)]
pub struct ScoutConfig {
    /// TTL for the role reservation: `interval * safety_factor` (`spec.md` §3).
    pub role_ttl: Duration,
    /// How often the role-holder invokes the visibility scan and re-checks
    /// its hold.
    pub holder_poll_interval: Duration,
    /// How often a non-holder retries acquisition.
    pub idle_poll_interval: Duration,
}

impl Default for ScoutConfig {
    fn default() -> Self {
        Self {
            role_ttl: Duration::from_secs(10),
            holder_poll_interval: Duration::from_millis(100),
            idle_poll_interval: Duration::from_secs(2),
        }
    }
}

/// Drives the "router" role election and, while held, the visibility-scan
/// poll loop.
pub struct ScoutManager {
    role_store: Arc<dyn RoleStore>,
    scanner: Arc<dyn VisibilityScanner>,
    role_key: String,
    holder_id: String,
    config: ScoutConfig,
    stop: Arc<AtomicBool>,
    wake: Arc<Notify>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl ScoutManager {
    pub fn new(
        role_store: Arc<dyn RoleStore>,
        scanner: Arc<dyn VisibilityScanner>,
        role_key: impl Into<String>,
        holder_id: impl Into<String>,
        config: ScoutConfig,
    ) -> Arc<Self> {
        Arc::new(Self {
            role_store,
            scanner,
            role_key: role_key.into(),
            holder_id: holder_id.into(),
            config,
            stop: Arc::new(AtomicBool::new(false)),
            wake: Arc::new(Notify::new()),
            task: Mutex::new(None),
        })
    }

    /// Starts the acquisition/poll loop as a background task. Idempotent:
    /// calling twice on an already-started manager is a no-op.
    pub async fn start(self: Arc<Self>) {
        let mut task = self.task.lock().await;
        if task.is_some() {
            return;
        }
        let this = self.clone();
        *task = Some(tokio::spawn(async move { this.run().await }));
    }

    async fn run(self: Arc<Self>) {
        loop {
            if self.stop.load(Ordering::SeqCst) {
                break;
            }

            let acquired = self
                .role_store
                .acquire(&self.role_key, &self.holder_id, self.config.role_ttl)
                .await
                .unwrap_or(false);

            if !acquired {
                self.sleep_or_wake(self.config.idle_poll_interval).await;
                continue;
            }

            info!(role = %self.role_key, holder = %self.holder_id, "acquired scout role");
            self.hold_role_loop().await;
            info!(role = %self.role_key, holder = %self.holder_id, "released scout role");
        }
    }

    /// Runs while this instance holds the role: scans for newly-visible
    /// messages, then re-checks the hold via a conditional refresh. Exits
    /// cleanly on hold loss or a closed-connection transport error.
    async fn hold_role_loop(&self) {
        loop {
            if self.stop.load(Ordering::SeqCst) {
                let _ = self.role_store.release(&self.role_key, &self.holder_id).await;
                return;
            }

            match self.scanner.notify_visible_messages().await {
                Ok(emitted) => {
                    if emitted > 0 {
                        debug!(emitted, "visibility scan emitted notifications");
                    }
                }
                Err(e) => {
                    if StreamError::is_closed_connection(&e.to_string()) {
                        return;
                    }
                    warn!(error = %e, "visibility scan error in scout loop");
                }
            }

            self.sleep_or_wake(self.config.holder_poll_interval).await;

            let still_holds = self
                .role_store
                .refresh(&self.role_key, &self.holder_id, self.config.role_ttl)
                .await
                .unwrap_or(false);
            if !still_holds {
                return;
            }
        }
    }

    async fn sleep_or_wake(&self, duration: Duration) {
        tokio::select! {
            _ = tokio::time::sleep(duration) => {}
            _ = self.wake.notified() => {}
        }
    }

    /// `stopRouterScoutPoller`: sets the stop flag, waits for the loop to
    /// exit, and releases the role if still held (`spec.md` §4.4).
    pub async fn stop(&self) {
        self.stop.store(true, Ordering::SeqCst);
        self.wake.notify_waiters();
        if let Some(task) = self.task.lock().await.take() {
            let _ = task.await;
        }
        let _ = self.role_store.release(&self.role_key, &self.holder_id).await;
    }
}
