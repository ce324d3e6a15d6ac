use anyhow::{Context, Result};
use dotenvy::dotenv;
use std::env;
use std::time::Duration;

/// Daemon configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    pub database_url: String,
    pub namespace: String,
    pub app_id: String,
    pub max_connections: u32,
    /// `STREAMGATE_DISABLE_NOTIFICATIONS` — the rename of `spec.md` §6's
    /// `HOTMESH_POSTGRES_DISABLE_NOTIFICATIONS` (see `DESIGN.md`). When set,
    /// the daemon skips `LISTEN`/`NOTIFY` entirely and relies solely on the
    /// fallback poller.
    pub disable_notifications: bool,
    pub fallback_interval: Duration,
    pub scout_role_ttl: Duration,
    /// `HMSH_ACTIVATION_MAX_RETRY` (`spec.md` §4.6).
    pub quorum_activation_max_retry: u32,
    /// `HMSH_QUORUM_ROLLCALL_CYCLES` (`spec.md` §4.6).
    pub quorum_rollcall_cycles: u32,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        let _ = dotenv();

        Ok(Self {
            database_url: env::var("DATABASE_URL").context("DATABASE_URL must be set")?,
            namespace: env::var("STREAMGATE_NAMESPACE").unwrap_or_else(|_| "streamgate".to_string()),
            app_id: env::var("STREAMGATE_APP_ID").context("STREAMGATE_APP_ID must be set")?,
            max_connections: env::var("STREAMGATE_MAX_CONNECTIONS")
                .unwrap_or_else(|_| "10".to_string())
                .parse()
                .context("STREAMGATE_MAX_CONNECTIONS must be a valid number")?,
            disable_notifications: env::var("STREAMGATE_DISABLE_NOTIFICATIONS")
                .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
                .unwrap_or(false),
            fallback_interval: Duration::from_secs(
                env::var("STREAMGATE_FALLBACK_INTERVAL_SECS")
                    .unwrap_or_else(|_| "30".to_string())
                    .parse()
                    .context("STREAMGATE_FALLBACK_INTERVAL_SECS must be a valid number")?,
            ),
            scout_role_ttl: Duration::from_secs(
                env::var("STREAMGATE_SCOUT_ROLE_TTL_SECS")
                    .unwrap_or_else(|_| "10".to_string())
                    .parse()
                    .context("STREAMGATE_SCOUT_ROLE_TTL_SECS must be a valid number")?,
            ),
            quorum_activation_max_retry: env::var("HMSH_ACTIVATION_MAX_RETRY")
                .unwrap_or_else(|_| "5".to_string())
                .parse()
                .context("HMSH_ACTIVATION_MAX_RETRY must be a valid number")?,
            quorum_rollcall_cycles: env::var("HMSH_QUORUM_ROLLCALL_CYCLES")
                .unwrap_or_else(|_| "12".to_string())
                .parse()
                .context("HMSH_QUORUM_ROLLCALL_CYCLES must be a valid number")?,
        })
    }
}
