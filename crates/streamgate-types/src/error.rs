//! Structured error taxonomy shared across the broker's crates.
//!
//! Mirrors the error-boundary discipline documented in `packages/seesaw-rs`:
//! internal plumbing may use `anyhow`, but anything a caller of `publish`,
//! `fetch`, or `activate` can observe is one of these pattern-matchable
//! variants (`spec.md` §7).

use thiserror::Error;

/// The broker's externally observable error taxonomy.
#[derive(Debug, Error)]
pub enum StreamError {
    /// Connection closed or query pipeline closed. Propagated from
    /// synchronous caller-initiated operations; absorbed in background
    /// loops (scout, fallback poller, cleanup).
    #[error("transport error: {0}")]
    Transport(String),

    /// Schema violation, NULL where forbidden, or row ordering broken.
    /// Always fatal — indicates a caller or schema bug, not a transient
    /// condition.
    #[error("invariant violation: {0}")]
    Invariant(String),

    /// A stream message exceeded `maximumAttempts` without succeeding.
    #[error("retry budget exceeded after {attempts} attempts")]
    RetryExceeded { attempts: i32 },

    /// Schema deployment lost the advisory-lock race to another deployer.
    #[error("schema deployment already in progress for app {app_id}")]
    DeploymentInProgress { app_id: String },

    /// Three successive quorum rounds did not agree, or retries were
    /// exhausted before they did.
    #[error("quorum not reached after {attempts} attempts")]
    QuorumNotReached { attempts: u32 },

    /// The caller supplied an invalid parameter (e.g. `batch_size < 1`).
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
}

impl StreamError {
    /// Best-effort classification of a transport-level error string as
    /// "closed connection" — these are the ones background loops and
    /// cleanup paths should absorb rather than propagate (`spec.md` §4.3,
    /// §4.4, §5).
    pub fn is_closed_connection(message: &str) -> bool {
        message.to_lowercase().contains("closed")
    }
}

impl From<sqlx::Error> for StreamError {
    fn from(err: sqlx::Error) -> Self {
        if let sqlx::Error::Database(ref db_err) = err {
            // Postgres class 23 ("integrity constraint violation") covers
            // NOT NULL, unique, check, and foreign-key violations — a schema
            // invariant was broken, not a transient connection problem.
            let is_constraint_violation = db_err
                .code()
                .as_deref()
                .is_some_and(|code| code.starts_with("23"));
            if is_constraint_violation {
                return StreamError::Invariant(db_err.to_string());
            }
        }
        StreamError::Transport(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn closed_connection_detection_is_case_insensitive() {
        assert!(StreamError::is_closed_connection("Connection Closed"));
        assert!(StreamError::is_closed_connection("pool is closed"));
        assert!(!StreamError::is_closed_connection("timed out"));
    }

    #[test]
    fn display_messages_are_stable() {
        let err = StreamError::DeploymentInProgress {
            app_id: "acme".into(),
        };
        assert_eq!(
            err.to_string(),
            "schema deployment already in progress for app acme"
        );
    }
}
