//! Stream Engine — publish / fetch / soft-delete / trim / depth / stats over
//! the `streams` table (`spec.md` §4.2).
//!
//! [`StreamEngine`] is the provider-agnostic seam described in `spec.md`
//! §9 "Polymorphism for providers": [`PgStreamEngine`] is the Postgres
//! realization; a Redis- or NATS-backed variant would implement the same
//! trait and preserve the envelope contract and universal properties
//! without sharing this module's SQL.

use crate::options::{FetchOptions, PublishOptions};
use crate::row::{FetchedMessage, StreamRow};
use async_trait::async_trait;
use sqlx::{PgPool, Postgres, QueryBuilder};
use std::collections::HashMap;
use std::time::Duration;
use streamgate_types::{GroupName, KeyMinter, RetryPolicy, RetryPolicyInput, StreamError};
use tracing::{debug, instrument, warn};

/// Aggregate counters for a stream, used by operational tooling
/// (`SPEC_FULL.md` §2 "Supplemented features").
#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct StreamStats {
    pub depth: i64,
    pub oldest_created_at: Option<chrono::DateTime<chrono::Utc>>,
    pub newest_id: Option<i64>,
}

/// The provider-agnostic Stream Engine contract (`spec.md` §4.2).
#[async_trait]
pub trait StreamEngine: Send + Sync {
    async fn publish(
        &self,
        stream: &str,
        messages: Vec<serde_json::Value>,
        options: PublishOptions,
    ) -> Result<Vec<String>, StreamError>;

    async fn fetch(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        options: FetchOptions,
    ) -> Result<Vec<FetchedMessage>, StreamError>;

    async fn soft_delete(&self, stream: &str, group: &str, ids: &[String]) -> Result<u64, StreamError>;

    /// `ackAndDelete` is identical to `soft_delete` (`spec.md` §4.2).
    async fn ack_and_delete(&self, stream: &str, group: &str, ids: &[String]) -> Result<u64, StreamError> {
        self.soft_delete(stream, group, ids).await
    }

    /// Messages are retained until soft-deleted; `acknowledge` is a no-op.
    async fn acknowledge(&self, _stream: &str, _group: &str, _ids: &[String]) -> Result<(), StreamError> {
        Ok(())
    }

    async fn trim(
        &self,
        stream: &str,
        max_len: Option<i64>,
        max_age: Option<Duration>,
    ) -> Result<u64, StreamError>;

    async fn depth(&self, stream: &str) -> Result<i64, StreamError>;

    async fn depths(&self, streams: &[String]) -> Result<HashMap<String, i64>, StreamError>;

    async fn stats(&self, stream: &str) -> Result<StreamStats, StreamError>;
}

/// A single post-extraction message, ready to be laid out in an INSERT.
struct ParsedMessage {
    payload: String,
    retry_policy: Option<RetryPolicy>,
    visible_at: Option<chrono::DateTime<chrono::Utc>>,
    retry_attempt: i32,
}

/// Strips `_streamRetryConfig`, `_visibilityDelayMs`, `_retryAttempt` from a
/// message envelope and lifts them into columns (`spec.md` §4.2, §9 "Retry
/// config leakage"). The retry config may arrive already in canonical
/// storage shape, or in the public shape the Retry Policy Normalizer
/// understands (`maximumAttempts`/`backoffCoefficient`/`maximumInterval`);
/// both are accepted here.
fn parse_publish_message(mut value: serde_json::Value) -> Result<ParsedMessage, StreamError> {
    let obj = value.as_object_mut().ok_or_else(|| {
        StreamError::InvalidArgument("published message must be a JSON object".into())
    })?;

    let retry_policy = match obj.remove("_streamRetryConfig") {
        Some(raw) => {
            let policy = serde_json::from_value::<RetryPolicy>(raw.clone())
                .or_else(|_| {
                    serde_json::from_value::<RetryPolicyInput>(raw)
                        .map_err(|e| StreamError::InvalidArgument(e.to_string()))
                        .and_then(|input| {
                            input
                                .normalize()
                                .map_err(StreamError::InvalidArgument)
                        })
                })?;
            Some(policy)
        }
        None => None,
    };

    let visible_at = match obj.remove("_visibilityDelayMs") {
        Some(raw) => {
            let delay_ms = raw
                .as_i64()
                .ok_or_else(|| StreamError::InvalidArgument("_visibilityDelayMs must be an integer".into()))?;
            Some(chrono::Utc::now() + chrono::Duration::milliseconds(delay_ms))
        }
        None => None,
    };

    let retry_attempt = match obj.remove("_retryAttempt") {
        Some(raw) => raw
            .as_i64()
            .ok_or_else(|| StreamError::InvalidArgument("_retryAttempt must be an integer".into()))?
            as i32,
        None => 0,
    };

    let payload = serde_json::to_string(&value).map_err(|e| StreamError::InvalidArgument(e.to_string()))?;

    Ok(ParsedMessage {
        payload,
        retry_policy,
        visible_at,
        retry_attempt,
    })
}

/// Postgres realization of [`StreamEngine`].
pub struct PgStreamEngine {
    pool: PgPool,
    schema: String,
}

impl PgStreamEngine {
    pub fn new(pool: PgPool, app_id: &str) -> Self {
        let schema = KeyMinter::new("", app_id).schema_name();
        Self { pool, schema }
    }

    fn table(&self) -> String {
        format!(r#""{}".streams"#, self.schema)
    }

    async fn fetch_once(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        options: &FetchOptions,
    ) -> Result<Vec<FetchedMessage>, StreamError> {
        if options.batch_size < 1 {
            return Err(StreamError::InvalidArgument("batch_size must be >= 1".into()));
        }

        let table = self.table();
        let sql = format!(
            r#"
            WITH candidate AS (
                SELECT id FROM {table}
                WHERE stream_name = $1 AND group_name = $2
                  AND expired_at IS NULL
                  AND visible_at <= NOW()
                  AND (reserved_at IS NULL OR reserved_at < NOW() - ($3 || ' seconds')::interval)
                ORDER BY id ASC
                LIMIT $4
                FOR UPDATE SKIP LOCKED
            )
            UPDATE {table} s
            SET reserved_at = NOW(), reserved_by = $5
            FROM candidate c
            WHERE s.id = c.id AND s.stream_name = $1
            RETURNING
                s.id, s.stream_name, s.group_name, s.message, s.created_at,
                s.reserved_at, s.reserved_by, s.expired_at, s.visible_at,
                s.retry_attempt, s.max_retry_attempts,
                s.backoff_coefficient::double precision AS backoff_coefficient,
                s.maximum_interval_seconds
            "#
        );

        let rows: Vec<StreamRow> = sqlx::query_as(&sql)
            .bind(stream)
            .bind(group)
            .bind(options.reservation_timeout.as_secs_f64())
            .bind(options.batch_size)
            .bind(consumer)
            .fetch_all(&self.pool)
            .await?;

        Ok(rows.into_iter().map(hydrate).collect())
    }

    async fn fetch_with_backoff(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        options: FetchOptions,
    ) -> Result<Vec<FetchedMessage>, StreamError> {
        let messages = self.fetch_once(stream, group, consumer, &options).await?;
        if !messages.is_empty() {
            return Ok(messages);
        }

        let Some(backoff) = options.backoff else {
            return Ok(messages);
        };

        let mut delay = backoff.initial;
        for attempt in 0..backoff.max_retries {
            tokio::time::sleep(delay).await;
            let messages = self.fetch_once(stream, group, consumer, &options).await?;
            if !messages.is_empty() {
                return Ok(messages);
            }
            delay = (delay * 2).min(backoff.max);
            debug!(attempt, ?delay, "fetch backoff retry produced no messages");
        }
        Ok(Vec::new())
    }
}

/// Re-injects `_streamRetryConfig`/`_retryAttempt` into a row's payload when
/// they differ from the row-level defaults (`spec.md` §4.2).
fn hydrate(row: StreamRow) -> FetchedMessage {
    let retry_policy = row.retry_policy();
    let mut payload: serde_json::Value =
        serde_json::from_str(&row.message).unwrap_or(serde_json::Value::Null);

    if let Some(obj) = payload.as_object_mut() {
        if !retry_policy.is_sentinel_default() {
            obj.insert(
                "_streamRetryConfig".to_string(),
                serde_json::to_value(&retry_policy).unwrap_or(serde_json::Value::Null),
            );
        }
        if row.retry_attempt != 0 {
            obj.insert(
                "_retryAttempt".to_string(),
                serde_json::Value::from(row.retry_attempt),
            );
        }
    }

    FetchedMessage {
        id: row.id.to_string(),
        stream_name: row.stream_name,
        group_name: row.group_name,
        payload,
        retry_policy,
        retry_attempt: row.retry_attempt,
    }
}

impl PgStreamEngine {
    /// Builds and runs the batch INSERT against any executor — the pool for
    /// a plain publish, or a caller-owned transaction for a staged one.
    async fn publish_via<'c, E>(
        &self,
        executor: E,
        stream: &str,
        messages: Vec<serde_json::Value>,
    ) -> Result<Vec<String>, StreamError>
    where
        E: sqlx::Executor<'c, Database = Postgres>,
    {
        if messages.is_empty() {
            return Ok(Vec::new());
        }
        let group = GroupName::derive(stream);

        let parsed: Vec<ParsedMessage> = messages
            .into_iter()
            .map(parse_publish_message)
            .collect::<Result<_, _>>()?;

        let include_policy_columns = parsed
            .iter()
            .any(|m| m.visible_at.is_some() || m.retry_policy.is_some());

        let table = self.table();
        let mut builder: QueryBuilder<Postgres> = QueryBuilder::new(format!(
            "INSERT INTO {table} (stream_name, group_name, message, retry_attempt{extra_cols}) VALUES ",
            extra_cols = if include_policy_columns {
                ", visible_at, max_retry_attempts, backoff_coefficient, maximum_interval_seconds"
            } else {
                ""
            }
        ));

        for (i, message) in parsed.iter().enumerate() {
            if i > 0 {
                builder.push(", ");
            }
            builder.push("(");
            builder.push_bind(stream.to_string());
            builder.push(", ");
            builder.push_bind(group.as_str());
            builder.push(", ");
            builder.push_bind(message.payload.clone());
            builder.push(", ");
            builder.push_bind(message.retry_attempt);

            if include_policy_columns {
                builder.push(", ");
                match message.visible_at {
                    Some(v) => {
                        builder.push_bind(v);
                    }
                    None => {
                        builder.push("DEFAULT");
                    }
                }
                builder.push(", ");
                match &message.retry_policy {
                    Some(p) => {
                        builder.push_bind(p.max_retry_attempts);
                    }
                    None => {
                        builder.push("DEFAULT");
                    }
                }
                builder.push(", ");
                match &message.retry_policy {
                    Some(p) => {
                        builder.push_bind(p.backoff_coefficient);
                    }
                    None => {
                        builder.push("DEFAULT");
                    }
                }
                builder.push(", ");
                match &message.retry_policy {
                    Some(p) => {
                        builder.push_bind(p.maximum_interval_seconds);
                    }
                    None => {
                        builder.push("DEFAULT");
                    }
                }
            }
            builder.push(")");
        }

        builder.push(" RETURNING id");

        debug!(stream, count = parsed.len(), include_policy_columns, "publishing batch");

        let ids: Vec<i64> = builder.build_query_scalar().fetch_all(executor).await?;

        Ok(ids.into_iter().map(|id| id.to_string()).collect())
    }

    /// Stages a publish against a caller-owned transaction instead of
    /// executing it immediately — the `Transaction` branch of
    /// `publish(...) -> [id…] | Transaction` (`spec.md` §4.2). The caller
    /// retains ownership of `tx` and decides whether to commit or roll back;
    /// the inserted ids are still returned so the caller can correlate them
    /// once the transaction lands.
    pub async fn publish_staged<'t>(
        &self,
        tx: &mut sqlx::Transaction<'t, Postgres>,
        stream: &str,
        messages: Vec<serde_json::Value>,
    ) -> Result<Vec<String>, StreamError> {
        self.publish_via(&mut **tx, stream, messages).await
    }
}

#[async_trait]
impl StreamEngine for PgStreamEngine {
    #[instrument(skip(self, messages), fields(stream))]
    async fn publish(
        &self,
        stream: &str,
        messages: Vec<serde_json::Value>,
        _options: PublishOptions,
    ) -> Result<Vec<String>, StreamError> {
        self.publish_via(&self.pool, stream, messages).await
    }

    #[instrument(skip(self, options), fields(stream, group, consumer))]
    async fn fetch(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        options: FetchOptions,
    ) -> Result<Vec<FetchedMessage>, StreamError> {
        let Some(block_timeout) = options.block_timeout else {
            return self.fetch_with_backoff(stream, group, consumer, options).await;
        };

        match tokio::time::timeout(
            block_timeout,
            self.fetch_with_backoff(stream, group, consumer, options),
        )
        .await
        {
            Ok(result) => result,
            Err(_elapsed) => {
                // A canceled fetch releases no rows — anything reserved by an
                // in-flight fetch_once is released implicitly once its
                // reservation expires (`spec.md` §9 "Suspension points").
                debug!(stream, group, consumer, ?block_timeout, "fetch blocked past block_timeout");
                Ok(Vec::new())
            }
        }
    }

    async fn soft_delete(&self, stream: &str, group: &str, ids: &[String]) -> Result<u64, StreamError> {
        if ids.is_empty() {
            return Ok(0);
        }
        let ids: Vec<i64> = ids
            .iter()
            .map(|id| id.parse())
            .collect::<Result<_, _>>()
            .map_err(|_| StreamError::InvalidArgument("ids must be integers".into()))?;

        let table = self.table();
        let sql = format!(
            "UPDATE {table} SET expired_at = NOW() \
             WHERE stream_name = $1 AND group_name = $2 AND id = ANY($3) AND expired_at IS NULL"
        );
        let result = sqlx::query(&sql)
            .bind(stream)
            .bind(group)
            .bind(&ids)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    async fn trim(
        &self,
        stream: &str,
        max_len: Option<i64>,
        max_age: Option<Duration>,
    ) -> Result<u64, StreamError> {
        let table = self.table();
        let mut expired = 0u64;

        if let Some(max_len) = max_len {
            if max_len < 0 {
                return Err(StreamError::InvalidArgument("max_len must be >= 0".into()));
            }
            let sql = format!(
                r#"
                WITH keep AS (
                    SELECT id FROM {table}
                    WHERE stream_name = $1 AND expired_at IS NULL
                    ORDER BY id DESC
                    LIMIT $2
                )
                UPDATE {table} SET expired_at = NOW()
                WHERE stream_name = $1 AND expired_at IS NULL
                  AND id NOT IN (SELECT id FROM keep)
                "#
            );
            let result = sqlx::query(&sql)
                .bind(stream)
                .bind(max_len)
                .execute(&self.pool)
                .await?;
            expired += result.rows_affected();
        }

        if let Some(max_age) = max_age {
            let sql = format!(
                "UPDATE {table} SET expired_at = NOW() \
                 WHERE stream_name = $1 AND expired_at IS NULL \
                   AND created_at < NOW() - ($2 || ' seconds')::interval"
            );
            let result = sqlx::query(&sql)
                .bind(stream)
                .bind(max_age.as_secs_f64())
                .execute(&self.pool)
                .await?;
            expired += result.rows_affected();
        }

        Ok(expired)
    }

    async fn depth(&self, stream: &str) -> Result<i64, StreamError> {
        let table = self.table();
        let sql = format!("SELECT COUNT(*) FROM {table} WHERE stream_name = $1 AND expired_at IS NULL");
        let depth: i64 = sqlx::query_scalar(&sql)
            .bind(stream)
            .fetch_one(&self.pool)
            .await?;
        Ok(depth)
    }

    async fn depths(&self, streams: &[String]) -> Result<HashMap<String, i64>, StreamError> {
        let table = self.table();
        let sql = format!(
            "SELECT stream_name, COUNT(*) AS depth FROM {table} \
             WHERE stream_name = ANY($1) AND expired_at IS NULL GROUP BY stream_name"
        );
        let rows: Vec<(String, i64)> = sqlx::query_as(&sql)
            .bind(streams)
            .fetch_all(&self.pool)
            .await?;

        let mut result: HashMap<String, i64> = streams.iter().map(|s| (s.clone(), 0)).collect();
        for (stream_name, depth) in rows {
            result.insert(stream_name, depth);
        }
        Ok(result)
    }

    async fn stats(&self, stream: &str) -> Result<StreamStats, StreamError> {
        let table = self.table();
        let sql = format!(
            "SELECT COUNT(*) AS depth, MIN(created_at) AS oldest_created_at, MAX(id) AS newest_id \
             FROM {table} WHERE stream_name = $1 AND expired_at IS NULL"
        );
        let (depth, oldest_created_at, newest_id): (
            i64,
            Option<chrono::DateTime<chrono::Utc>>,
            Option<i64>,
        ) = sqlx::query_as(&sql).bind(stream).fetch_one(&self.pool).await?;

        if depth == 0 {
            warn!(stream, "stats requested for empty or unknown stream");
        }

        Ok(StreamStats {
            depth,
            oldest_created_at,
            newest_id,
        })
    }
}

impl PgStreamEngine {
    /// Exposed for Scout and the fallback poller, which call the
    /// visibility-scan function directly rather than fetching messages
    /// (`spec.md` §4.4).
    pub async fn notify_visible_messages(&self) -> Result<i32, StreamError> {
        let sql = format!(r#"SELECT "{}".notify_visible_messages()"#, self.schema);
        let emitted: i32 = sqlx::query_scalar(&sql).fetch_one(&self.pool).await?;
        Ok(emitted)
    }
}

/// The Notification Manager's fallback poller and Scout both need to invoke
/// the visibility-scan function without otherwise depending on the Postgres
/// engine's concrete type (`spec.md` §9 "Polymorphism for providers").
#[async_trait]
pub trait VisibilityScanner: Send + Sync {
    async fn notify_visible_messages(&self) -> Result<i32, StreamError>;
}

#[async_trait]
impl VisibilityScanner for PgStreamEngine {
    async fn notify_visible_messages(&self) -> Result<i32, StreamError> {
        PgStreamEngine::notify_visible_messages(self).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_publish_message_strips_internal_fields() {
        let input = serde_json::json!({
            "metadata": {"guid": "g1", "aid": "a1"},
            "data": {"x": 1},
            "_streamRetryConfig": {"max_retry_attempts": 7, "backoff_coefficient": 3.0, "maximum_interval_seconds": 600},
            "_visibilityDelayMs": 3000,
            "_retryAttempt": 2,
        });
        let parsed = parse_publish_message(input).unwrap();
        assert!(!parsed.payload.contains("_streamRetryConfig"));
        assert!(!parsed.payload.contains("_visibilityDelayMs"));
        assert!(!parsed.payload.contains("_retryAttempt"));
        assert_eq!(parsed.retry_attempt, 2);
        assert!(parsed.visible_at.is_some());
        let policy = parsed.retry_policy.unwrap();
        assert_eq!(policy.max_retry_attempts, 7);
        assert_eq!(policy.maximum_interval_seconds, 600);
    }

    #[test]
    fn parse_publish_message_accepts_public_shape() {
        let input = serde_json::json!({
            "metadata": {"guid": "g1", "aid": "a1"},
            "data": {},
            "_streamRetryConfig": {"maximum_attempts": 7, "backoff_coefficient": 3.0, "maximum_interval": "600s"},
        });
        let parsed = parse_publish_message(input).unwrap();
        let policy = parsed.retry_policy.unwrap();
        assert_eq!(policy.max_retry_attempts, 7);
        assert_eq!(policy.maximum_interval_seconds, 600);
    }

    #[test]
    fn parse_publish_message_without_control_fields_is_plain_passthrough() {
        let input = serde_json::json!({"metadata": {"guid": "g1", "aid": "a1"}, "data": {"x": 1}});
        let parsed = parse_publish_message(input).unwrap();
        assert!(parsed.retry_policy.is_none());
        assert!(parsed.visible_at.is_none());
        assert_eq!(parsed.retry_attempt, 0);
    }

    #[test]
    fn hydrate_reinjects_nondefault_policy_only() {
        let row = StreamRow {
            id: 1,
            stream_name: "s".into(),
            group_name: "WORKER".into(),
            message: serde_json::json!({"data": {}}).to_string(),
            created_at: chrono::Utc::now(),
            reserved_at: None,
            reserved_by: None,
            expired_at: None,
            visible_at: chrono::Utc::now(),
            retry_attempt: 0,
            max_retry_attempts: 3,
            backoff_coefficient: 10.0,
            maximum_interval_seconds: 120,
        };
        let msg = hydrate(row);
        assert!(msg.payload.get("_streamRetryConfig").is_none());

        let row2 = StreamRow {
            id: 2,
            stream_name: "s".into(),
            group_name: "WORKER".into(),
            message: serde_json::json!({"data": {}}).to_string(),
            created_at: chrono::Utc::now(),
            reserved_at: None,
            reserved_by: None,
            expired_at: None,
            visible_at: chrono::Utc::now(),
            retry_attempt: 2,
            max_retry_attempts: 7,
            backoff_coefficient: 3.0,
            maximum_interval_seconds: 600,
        };
        let msg2 = hydrate(row2);
        assert!(msg2.payload.get("_streamRetryConfig").is_some());
        assert_eq!(msg2.payload.get("_retryAttempt").unwrap(), 2);
    }
}
