//! Router / Error Handler — retry-or-structure-error decisions for worker
//! responses (`spec.md` §4.5).

use async_trait::async_trait;
use streamgate_types::{Metadata, MessageType, Policies, Status, StreamData, StreamDataResponse, StreamError};
use tracing::debug;

/// The engine-internal topic a terminal structured error is published to;
/// the trailing `:` marks it as an engine stream per the Key Minter's group
/// derivation rule, so the engine (not a worker) consumes it.
pub const NULL_TOPIC: &str = "engine:dead-letter:";

/// Upper bound on `metadata.try` used when computing backoff delays, distinct
/// from the per-error-code max-retries ladder (`spec.md` §9: the two bounds
/// are independent and both enforced).
pub const SYSTEM_MAX_TRY_COUNT: i32 = 3;

/// Publishes a republished retry or a structured terminal error. Kept as a
/// trait so the Router doesn't depend on `streamgate-db` directly — a thin
/// seam over `StreamEngine::publish`.
#[async_trait]
pub trait Publisher: Send + Sync {
    async fn publish(&self, stream: &str, message: StreamData) -> Result<(), StreamError>;
}

/// Whether another retry is allowed for `output`, and how long to wait
/// before it, per `input.policies.retry[output.code]` (`spec.md` §4.5).
pub fn should_retry(input: &StreamData, output: &StreamDataResponse) -> (bool, u64) {
    let Some(code) = output.code else {
        return (false, 0);
    };
    let Some(policies) = &input.policies else {
        return (false, 0);
    };
    let Some(max_retries) = policies.max_retries_for(&code.to_string()) else {
        return (false, 0);
    };

    let try_count = input
        .metadata
        .try_count
        .unwrap_or(0)
        .clamp(0, SYSTEM_MAX_TRY_COUNT);

    if (max_retries as i32) > try_count {
        let delay_ms = 10u64.pow((try_count + 1) as u32);
        (true, delay_ms)
    } else {
        (false, 0)
    }
}

/// Extracts a best-effort numeric error code from a worker response: the
/// top-level `code`, falling back to `data.code`, falling back to an unknown
/// sentinel.
fn resolve_error_code(output: &StreamDataResponse) -> i32 {
    const UNKNOWN_ERROR_CODE: i32 = 520;
    output
        .code
        .or_else(|| output.data.get("code").and_then(|v| v.as_i64()).map(|c| c as i32))
        .unwrap_or(UNKNOWN_ERROR_CODE)
}

/// Builds a terminal, structured error response. Mints a fresh
/// `metadata.guid` (the retry lineage's guid is not this message's identity
/// any more) but records the originating guid in `metadata.dad` so the
/// retry chain remains traceable for observability (`spec.md` §9 open
/// question, resolved in `DESIGN.md`).
pub fn structure_error(input: &StreamData, output: &StreamDataResponse) -> StreamDataResponse {
    let code = resolve_error_code(output);
    let message = output
        .data
        .get("message")
        .and_then(|v| v.as_str())
        .unwrap_or("unknown error")
        .to_string();
    let stack = output
        .data
        .get("stack")
        .and_then(|v| v.as_str())
        .map(|s| s.to_string());

    StreamData {
        metadata: Metadata {
            guid: uuid::Uuid::new_v4().to_string(),
            dad: Some(input.metadata.guid.clone()),
            aid: input.metadata.aid.clone(),
            topic: input.metadata.topic.clone(),
            jid: input.metadata.jid.clone(),
            gid: input.metadata.gid.clone(),
            ..Default::default()
        },
        kind: Some(MessageType::Response),
        data: serde_json::json!({ "message": message, "stack": stack }),
        policies: None,
        status: Some(Status::Error),
        code: Some(code),
        stream_retry_config: None,
        visibility_delay_ms: None,
        retry_attempt: None,
    }
}

/// Used when a message has exceeded its reclaim count: a terminal error with
/// `metadata.topic` cleared so the engine treats it as consumed rather than
/// forwarding it on (`spec.md` §4.5).
pub fn structure_unacknowledged_error(input: &StreamData) -> StreamDataResponse {
    let synthetic_output = StreamData {
        data: serde_json::json!({ "message": "message exceeded its reclaim count" }),
        code: None,
        ..input.clone()
    };
    let mut structured = structure_error(input, &synthetic_output);
    structured.metadata.topic = None;
    structured
}

/// Decides the outcome for one Router cycle: republish with an incremented
/// attempt (retaining the original `guid`) or publish a structured error to
/// [`NULL_TOPIC`] (`spec.md` §4.5, §8 "Retry attempt increment").
pub async fn handle_retry(
    input: &StreamData,
    output: &StreamDataResponse,
    publisher: &dyn Publisher,
) -> Result<(), StreamError> {
    let (retry, delay_ms) = should_retry(input, output);

    if retry {
        tokio::time::sleep(std::time::Duration::from_millis(delay_ms)).await;
        let mut retried = input.clone();
        retried.metadata.try_count = Some(input.metadata.try_count.unwrap_or(0) + 1);
        let topic = retried
            .metadata
            .topic
            .clone()
            .unwrap_or_else(|| NULL_TOPIC.to_string());
        debug!(guid = %retried.metadata.guid, try_count = ?retried.metadata.try_count, delay_ms, "retrying");
        publisher.publish(&topic, retried).await
    } else {
        let structured = structure_error(input, output);
        publisher.publish(NULL_TOPIC, structured).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use tokio::sync::Mutex;

    fn envelope(guid: &str, try_count: Option<i32>, topic: Option<&str>) -> StreamData {
        let mut policies = Policies::default();
        policies.retry.insert("500".to_string(), vec![2]);
        StreamData {
            metadata: Metadata {
                guid: guid.to_string(),
                aid: "app-1".to_string(),
                try_count,
                topic: topic.map(|t| t.to_string()),
                ..Default::default()
            },
            kind: Some(MessageType::Worker),
            data: serde_json::json!({}),
            policies: Some(policies),
            status: None,
            code: None,
            stream_retry_config: None,
            visibility_delay_ms: None,
            retry_attempt: None,
        }
    }

    fn response(code: i32) -> StreamDataResponse {
        StreamData {
            metadata: Metadata::default(),
            kind: Some(MessageType::Response),
            data: serde_json::json!({"message": "boom"}),
            policies: None,
            status: Some(Status::Error),
            code: Some(code),
            stream_retry_config: None,
            visibility_delay_ms: None,
            retry_attempt: None,
        }
    }

    #[test]
    fn retry_ladder_matches_spec_example() {
        let input = envelope("g1", Some(0), Some("topic:"));
        let output = response(500);
        assert_eq!(should_retry(&input, &output), (true, 10));

        let input = envelope("g1", Some(1), Some("topic:"));
        assert_eq!(should_retry(&input, &output), (true, 100));

        let input = envelope("g1", Some(2), Some("topic:"));
        assert_eq!(should_retry(&input, &output), (false, 0));
    }

    #[test]
    fn structure_error_mints_new_guid_but_records_lineage() {
        let input = envelope("original-guid", Some(2), Some("topic:"));
        let output = response(500);
        let structured = structure_error(&input, &output);
        assert_ne!(structured.metadata.guid, "original-guid");
        assert_eq!(structured.metadata.dad, Some("original-guid".to_string()));
        assert_eq!(structured.status, Some(Status::Error));
        assert_eq!(structured.code, Some(500));
    }

    #[test]
    fn structure_unacknowledged_error_clears_topic() {
        let input = envelope("g1", Some(3), Some("topic:"));
        let structured = structure_unacknowledged_error(&input);
        assert!(structured.metadata.topic.is_none());
        assert_eq!(structured.status, Some(Status::Error));
    }

    struct RecordingPublisher {
        calls: Mutex<Vec<(String, StreamData)>>,
    }

    #[async_trait]
    impl Publisher for RecordingPublisher {
        async fn publish(&self, stream: &str, message: StreamData) -> Result<(), StreamError> {
            self.calls.lock().await.push((stream.to_string(), message));
            Ok(())
        }
    }

    #[tokio::test]
    async fn handle_retry_preserves_guid_and_increments_try_count() {
        let publisher = Arc::new(RecordingPublisher {
            calls: Mutex::new(Vec::new()),
        });
        let input = envelope("g1", Some(0), Some("topic:"));
        let output = response(500);

        handle_retry(&input, &output, publisher.as_ref()).await.unwrap();

        let calls = publisher.calls.lock().await;
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].0, "topic:");
        assert_eq!(calls[0].1.metadata.guid, "g1");
        assert_eq!(calls[0].1.metadata.try_count, Some(1));
    }

    #[tokio::test]
    async fn handle_retry_falls_back_to_structured_error_on_exhaustion() {
        let publisher = Arc::new(RecordingPublisher {
            calls: Mutex::new(Vec::new()),
        });
        let input = envelope("g1", Some(2), Some("topic:"));
        let output = response(500);

        handle_retry(&input, &output, publisher.as_ref()).await.unwrap();

        let calls = publisher.calls.lock().await;
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].0, NULL_TOPIC);
        assert_eq!(calls[0].1.metadata.dad, Some("g1".to_string()));
    }
}
