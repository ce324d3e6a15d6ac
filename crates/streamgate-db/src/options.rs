//! Publish/fetch option structs, following the builder-with-defaults shape
//! the teacher uses for its `Job` model.

use std::time::Duration;

/// Options for [`crate::engine::StreamEngine::publish`].
///
/// Staging a publish against a caller-owned transaction (`spec.md` §4.2's
/// `publish(...) -> [id…] | Transaction`) is exposed separately as
/// [`crate::engine::PgStreamEngine::publish_staged`] rather than through this
/// struct, since `sqlx::Transaction` is Postgres-specific and doesn't belong
/// on the provider-agnostic [`crate::engine::StreamEngine`] trait.
#[derive(Debug, Clone, Default)]
pub struct PublishOptions {}

/// Options for [`crate::engine::StreamEngine::fetch`].
#[derive(Debug, Clone)]
pub struct FetchOptions {
    pub batch_size: i64,
    pub reservation_timeout: Duration,
    /// Wall-clock upper bound on the whole fetch, including backoff retries
    /// (`spec.md` §9 "Suspension points"). A canceled fetch releases no rows;
    /// `None` means fetch may block indefinitely across its backoff ladder.
    pub block_timeout: Option<Duration>,
    pub backoff: Option<FetchBackoff>,
}

impl Default for FetchOptions {
    fn default() -> Self {
        Self {
            batch_size: 1,
            reservation_timeout: Duration::from_secs(30),
            block_timeout: None,
            backoff: None,
        }
    }
}

impl FetchOptions {
    pub fn with_batch_size(mut self, batch_size: i64) -> Self {
        self.batch_size = batch_size;
        self
    }

    pub fn with_reservation_timeout(mut self, timeout: Duration) -> Self {
        self.reservation_timeout = timeout;
        self
    }

    pub fn with_block_timeout(mut self, timeout: Duration) -> Self {
        self.block_timeout = Some(timeout);
        self
    }

    pub fn with_backoff(mut self, backoff: FetchBackoff) -> Self {
        self.backoff = Some(backoff);
        self
    }
}

/// Exponential-backoff-on-empty-fetch knobs (`spec.md` §4.2).
#[derive(Debug, Clone, Copy)]
pub struct FetchBackoff {
    pub initial: Duration,
    pub max: Duration,
    pub max_retries: u32,
}

impl Default for FetchBackoff {
    fn default() -> Self {
        Self {
            initial: Duration::from_millis(50),
            max: Duration::from_secs(2),
            max_retries: 5,
        }
    }
}
