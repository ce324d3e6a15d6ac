//! Schema Deployer — idempotently creates the `streams` schema, its 8 hash
//! partitions, indexes, the insert-notify trigger, and the visibility-scan
//! function (`spec.md` §4.1, §6).

use sqlx::PgPool;
use streamgate_types::{KeyMinter, StreamError};
use tracing::{info, warn};

const PARTITION_COUNT: i64 = 8;

/// Renders the full DDL for an app's schema without executing it. Exposed
/// separately from [`deploy`] so tests can assert on the generated SQL shape
/// without a live database.
pub fn deploy_sql(app_id: &str) -> Vec<String> {
    let schema = KeyMinter::new("", app_id).schema_name();
    let mut statements = vec![format!(r#"CREATE SCHEMA IF NOT EXISTS "{schema}""#)];

    statements.push(format!(
        r#"
        CREATE TABLE IF NOT EXISTS "{schema}".streams (
            id BIGSERIAL,
            stream_name TEXT NOT NULL,
            group_name TEXT NOT NULL DEFAULT 'ENGINE',
            message TEXT NOT NULL,
            created_at TIMESTAMPTZ DEFAULT NOW(),
            reserved_at TIMESTAMPTZ,
            reserved_by TEXT,
            expired_at TIMESTAMPTZ,
            visible_at TIMESTAMPTZ DEFAULT NOW(),
            retry_attempt INT DEFAULT 0,
            max_retry_attempts INT DEFAULT 3,
            backoff_coefficient NUMERIC DEFAULT 10,
            maximum_interval_seconds INT DEFAULT 120,
            PRIMARY KEY (stream_name, id)
        ) PARTITION BY HASH (stream_name)
        "#
    ));

    for remainder in 0..PARTITION_COUNT {
        statements.push(format!(
            r#"
            CREATE TABLE IF NOT EXISTS "{schema}".streams_part_{remainder}
            PARTITION OF "{schema}".streams
            FOR VALUES WITH (modulus {PARTITION_COUNT}, remainder {remainder})
            "#
        ));
    }

    statements.push(format!(
        r#"
        CREATE INDEX IF NOT EXISTS streams_fetch_idx
        ON "{schema}".streams (group_name, stream_name, reserved_at, id)
        WHERE reserved_at IS NULL AND expired_at IS NULL
        "#
    ));

    statements.push(format!(
        r#"
        CREATE INDEX IF NOT EXISTS streams_depth_idx
        ON "{schema}".streams (stream_name, group_name, id)
        WHERE expired_at IS NULL
        "#
    ));

    statements.push(format!(
        r#"
        CREATE OR REPLACE FUNCTION "{schema}".notify_stream_insert() RETURNS trigger AS $$
        DECLARE
            channel TEXT;
        BEGIN
            IF NEW.visible_at <= NOW() THEN
                channel := left('stream_' || NEW.stream_name || '_' || NEW.group_name, 63);
                PERFORM pg_notify(
                    channel,
                    json_build_object(
                        'id', NEW.id,
                        'stream_name', NEW.stream_name,
                        'group_name', NEW.group_name,
                        'created_at', NEW.created_at
                    )::text
                );
            END IF;
            RETURN NEW;
        END;
        $$ LANGUAGE plpgsql
        "#
    ));

    statements.push(format!(r#"DROP TRIGGER IF EXISTS notify_stream_insert ON "{schema}".streams"#));
    statements.push(format!(
        r#"
        CREATE TRIGGER notify_stream_insert
        AFTER INSERT ON "{schema}".streams
        FOR EACH ROW EXECUTE FUNCTION "{schema}".notify_stream_insert()
        "#
    ));

    // notify_visible_messages() is idempotent within a visibility window via
    // last_notified_at bookkeeping (spec.md §9): once a distinct
    // (stream_name, group_name) pair has been notified for rows visible as
    // of a given instant, re-running the scan before new rows cross the
    // visible_at boundary emits nothing further for that pair.
    statements.push(format!(
        r#"
        CREATE TABLE IF NOT EXISTS "{schema}".visibility_scan_cursor (
            stream_name TEXT NOT NULL,
            group_name TEXT NOT NULL,
            last_notified_at TIMESTAMPTZ NOT NULL,
            PRIMARY KEY (stream_name, group_name)
        )
        "#
    ));

    statements.push(format!(
        r#"
        CREATE OR REPLACE FUNCTION "{schema}".notify_visible_messages() RETURNS INT AS $$
        DECLARE
            emitted INT := 0;
            pair RECORD;
            channel TEXT;
        BEGIN
            FOR pair IN
                SELECT DISTINCT s.stream_name, s.group_name
                FROM "{schema}".streams s
                LEFT JOIN "{schema}".visibility_scan_cursor c
                    ON c.stream_name = s.stream_name AND c.group_name = s.group_name
                WHERE s.expired_at IS NULL
                  AND s.reserved_at IS NULL
                  AND s.visible_at <= NOW()
                  AND (c.last_notified_at IS NULL OR s.visible_at > c.last_notified_at)
            LOOP
                channel := left('stream_' || pair.stream_name || '_' || pair.group_name, 63);
                PERFORM pg_notify(
                    channel,
                    json_build_object(
                        'stream_name', pair.stream_name,
                        'group_name', pair.group_name
                    )::text
                );
                INSERT INTO "{schema}".visibility_scan_cursor (stream_name, group_name, last_notified_at)
                VALUES (pair.stream_name, pair.group_name, NOW())
                ON CONFLICT (stream_name, group_name) DO UPDATE SET last_notified_at = NOW();
                emitted := emitted + 1;
            END LOOP;
            RETURN emitted;
        END;
        $$ LANGUAGE plpgsql
        "#
    ));

    statements
}

/// Idempotently deploys the schema for `app_id`. Acquires a deterministic
/// advisory lock for the duration of deployment so concurrent deployers
/// serialize rather than race on partial DDL (`spec.md` §4.1).
pub async fn deploy(pool: &PgPool, app_id: &str) -> Result<(), StreamError> {
    let lock_key: i64 = advisory_lock_key(app_id);

    let acquired: bool = sqlx::query_scalar("SELECT pg_try_advisory_lock($1)")
        .bind(lock_key)
        .fetch_one(pool)
        .await?;

    if !acquired {
        warn!(app_id, "schema deployment lock contended");
        return Err(StreamError::DeploymentInProgress {
            app_id: app_id.to_string(),
        });
    }

    info!(app_id, "deploying schema");
    let result = deploy_locked(pool, app_id).await;

    let _: bool = sqlx::query_scalar("SELECT pg_advisory_unlock($1)")
        .bind(lock_key)
        .fetch_one(pool)
        .await
        .unwrap_or(false);

    result
}

async fn deploy_locked(pool: &PgPool, app_id: &str) -> Result<(), StreamError> {
    for statement in deploy_sql(app_id) {
        sqlx::query(&statement).execute(pool).await?;
    }
    info!(app_id, "schema deployment complete");
    Ok(())
}

/// Derives a stable 32-bit-range advisory-lock key from `app_id`, matching
/// the "32-bit hash of appId" described in `spec.md` §4.1.
fn advisory_lock_key(app_id: &str) -> i64 {
    let mut hash: u32 = 2166136261; // FNV-1a offset basis
    for byte in app_id.bytes() {
        hash ^= byte as u32;
        hash = hash.wrapping_mul(16777619);
    }
    hash as i64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deploy_sql_is_schema_scoped_and_guarded() {
        let statements = deploy_sql("acme-app");
        let joined = statements.join("\n");
        assert!(joined.contains(r#"CREATE SCHEMA IF NOT EXISTS "acme_app""#));
        assert!(joined.contains("PARTITION BY HASH (stream_name)"));
        for remainder in 0..PARTITION_COUNT {
            assert!(joined.contains(&format!("streams_part_{remainder}")));
        }
        assert!(joined.contains("notify_stream_insert"));
        assert!(joined.contains("notify_visible_messages"));
    }

    #[test]
    fn advisory_lock_key_is_deterministic() {
        assert_eq!(advisory_lock_key("acme"), advisory_lock_key("acme"));
        assert_ne!(advisory_lock_key("acme"), advisory_lock_key("other"));
    }
}
