//! The Notification Manager's per-connection registry (`spec.md` §4.3).
//!
//! One [`ConnectionHub`] is constructed alongside the `PgListener` it owns,
//! mirroring how `ServerKernel` is built once and threaded through as an
//! `Arc` in the teacher. Every `StreamEngine`/consumer pair that wants
//! event-driven delivery registers against the hub for that connection.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgListener;
use sqlx::PgPool;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use streamgate_db::{FetchOptions, StreamEngine, VisibilityScanner};
use streamgate_types::{notify_channel, StreamError};
use tokio::sync::{Mutex, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Receives messages fetched on a consumer's behalf, whether triggered by a
/// notification or by the fallback poller.
#[async_trait]
pub trait DeliveryCallback: Send + Sync {
    async fn deliver(&self, messages: Vec<streamgate_db::FetchedMessage>);
}

struct RegisteredConsumer {
    stream: String,
    group: String,
    consumer_name: String,
    engine: Arc<dyn StreamEngine>,
    callback: Arc<dyn DeliveryCallback>,
    default_options: FetchOptions,
    last_fallback_check: Mutex<DateTime<Utc>>,
}

impl RegisteredConsumer {
    async fn fetch_and_deliver(&self, options: FetchOptions) {
        match self
            .engine
            .fetch(&self.stream, &self.group, &self.consumer_name, options)
            .await
        {
            Ok(messages) if !messages.is_empty() => {
                debug!(stream = %self.stream, group = %self.group, count = messages.len(), "delivering fetched messages");
                self.callback.deliver(messages).await;
            }
            Ok(_) => {}
            Err(e) => {
                if !StreamError::is_closed_connection(&e.to_string()) {
                    warn!(error = %e, stream = %self.stream, group = %self.group, "fetch_and_deliver failed");
                }
            }
        }
        *self.last_fallback_check.lock().await = Utc::now();
    }
}

#[derive(Default)]
struct HubState {
    /// channel -> consumer_key (`stream:group`) -> instance -> consumer
    channels: HashMap<String, HashMap<String, HashMap<String, Arc<RegisteredConsumer>>>>,
}

impl HubState {
    fn all_consumers(&self) -> Vec<Arc<RegisteredConsumer>> {
        self.channels
            .values()
            .flat_map(|by_key| by_key.values())
            .flat_map(|by_instance| by_instance.values())
            .cloned()
            .collect()
    }
}

/// The per-connection notification registry: subscribe/unsubscribe bookkeeping,
/// the notification demultiplexer, and the bounded fallback poller.
pub struct ConnectionHub {
    state: Arc<Mutex<HubState>>,
    listener: Option<Arc<Mutex<PgListener>>>,
    scanner: Arc<dyn VisibilityScanner>,
    fallback_interval: Duration,
    stop: Arc<AtomicBool>,
    wake: Arc<Notify>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl ConnectionHub {
    /// Connects a dedicated `PgListener` to `pool` and spawns the
    /// notification demultiplexer and fallback poller. `scanner` is the
    /// engine whose `notify_visible_messages()` the fallback poller invokes
    /// once per tick (`spec.md` §4.3).
    pub async fn connect(
        pool: &PgPool,
        scanner: Arc<dyn VisibilityScanner>,
        fallback_interval: Duration,
    ) -> Result<Arc<Self>, StreamError> {
        let listener = PgListener::connect_with(pool)
            .await
            .map_err(|e| StreamError::Transport(e.to_string()))?;

        let hub = Arc::new(Self {
            state: Arc::new(Mutex::new(HubState::default())),
            listener: Some(Arc::new(Mutex::new(listener))),
            scanner,
            fallback_interval,
            stop: Arc::new(AtomicBool::new(false)),
            wake: Arc::new(Notify::new()),
            tasks: Mutex::new(Vec::new()),
        });

        hub.spawn_background_loops().await;
        Ok(hub)
    }

    /// Builds a hub with no live `PgListener` — only the fallback poller
    /// runs. This is both the `STREAMGATE_DISABLE_NOTIFICATIONS` production
    /// path (`spec.md` §6) and what tests use to exercise registry
    /// bookkeeping against a fake engine without a database.
    pub async fn without_listener(
        scanner: Arc<dyn VisibilityScanner>,
        fallback_interval: Duration,
    ) -> Arc<Self> {
        let hub = Arc::new(Self {
            state: Arc::new(Mutex::new(HubState::default())),
            listener: None,
            scanner,
            fallback_interval,
            stop: Arc::new(AtomicBool::new(false)),
            wake: Arc::new(Notify::new()),
            tasks: Mutex::new(Vec::new()),
        });
        hub.spawn_background_loops().await;
        hub
    }

    async fn spawn_background_loops(self: &Arc<Self>) {
        let mut tasks = self.tasks.lock().await;

        if let Some(listener) = self.listener.clone() {
            let state = self.state.clone();
            let stop = self.stop.clone();
            tasks.push(tokio::spawn(run_notification_loop(listener, state, stop)));
        }

        let state = self.state.clone();
        let scanner = self.scanner.clone();
        let stop = self.stop.clone();
        let wake = self.wake.clone();
        let interval = self.fallback_interval;
        tasks.push(tokio::spawn(run_fallback_loop(
            scanner, state, interval, stop, wake,
        )));
    }

    /// Registers `callback` for event-driven delivery of `(stream, group)`
    /// messages fetched as `consumer_name`. Issues `LISTEN` if this is the
    /// first subscriber for the channel (`spec.md` §4.3).
    pub async fn subscribe(
        &self,
        instance: &str,
        stream: &str,
        group: &str,
        consumer_name: &str,
        engine: Arc<dyn StreamEngine>,
        callback: Arc<dyn DeliveryCallback>,
        default_options: FetchOptions,
    ) -> Result<(), StreamError> {
        let channel = notify_channel(stream, group);
        let consumer_key = format!("{stream}:{group}");

        let is_first_for_channel = {
            let mut state = self.state.lock().await;
            let by_key = state.channels.entry(channel.clone()).or_default();
            let is_first = by_key.is_empty();
            let by_instance = by_key.entry(consumer_key).or_default();
            by_instance.insert(
                instance.to_string(),
                Arc::new(RegisteredConsumer {
                    stream: stream.to_string(),
                    group: group.to_string(),
                    consumer_name: consumer_name.to_string(),
                    engine,
                    callback,
                    default_options,
                    last_fallback_check: Mutex::new(Utc::now()),
                }),
            );
            is_first
        };

        if is_first_for_channel {
            if let Some(listener) = &self.listener {
                listener
                    .lock()
                    .await
                    .listen(&channel)
                    .await
                    .map_err(|e| StreamError::Transport(e.to_string()))?;
            }
            info!(channel, "listening");
        }

        Ok(())
    }

    /// Removes `instance`'s registration for `(stream, group)`; `UNLISTEN`s
    /// the channel if that was its last subscriber.
    pub async fn unsubscribe(&self, instance: &str, stream: &str, group: &str) -> Result<(), StreamError> {
        let channel = notify_channel(stream, group);
        let consumer_key = format!("{stream}:{group}");

        let channel_emptied = {
            let mut state = self.state.lock().await;
            let mut emptied = false;
            if let Some(by_key) = state.channels.get_mut(&channel) {
                if let Some(by_instance) = by_key.get_mut(&consumer_key) {
                    by_instance.remove(instance);
                    if by_instance.is_empty() {
                        by_key.remove(&consumer_key);
                    }
                }
                if by_key.is_empty() {
                    state.channels.remove(&channel);
                    emptied = true;
                }
            }
            emptied
        };

        if channel_emptied {
            self.unlisten_absorbing_closed(&channel).await;
        }

        Ok(())
    }

    /// Removes `instance`'s registrations from this connection's registry and
    /// `UNLISTEN`s any channel that loses its last subscriber. The shared
    /// fallback timer and notification loop are only aborted once the
    /// registry is empty across *every* instance sharing this connection
    /// (`spec.md` §4.3, §5) — other engines may still be registered against
    /// the same physical connection and depend on those loops staying up.
    pub async fn cleanup(&self, instance: &str) -> Result<(), StreamError> {
        let (emptied_channels, registry_is_empty) = {
            let mut state = self.state.lock().await;
            let mut emptied = Vec::new();
            for (channel, by_key) in state.channels.iter_mut() {
                for by_instance in by_key.values_mut() {
                    by_instance.remove(instance);
                }
                by_key.retain(|_, by_instance| !by_instance.is_empty());
                if by_key.is_empty() {
                    emptied.push(channel.clone());
                }
            }
            state.channels.retain(|_, by_key| !by_key.is_empty());
            (emptied, state.channels.is_empty())
        };

        for channel in &emptied_channels {
            self.unlisten_absorbing_closed(channel).await;
        }

        if registry_is_empty {
            self.stop.store(true, Ordering::SeqCst);
            self.wake.notify_waiters();
            for task in self.tasks.lock().await.drain(..) {
                task.abort();
            }
        }

        Ok(())
    }

    async fn unlisten_absorbing_closed(&self, channel: &str) {
        let Some(listener) = &self.listener else { return };
        if let Err(e) = listener.lock().await.unlisten(channel).await {
            if !StreamError::is_closed_connection(&e.to_string()) {
                warn!(error = %e, channel, "unlisten failed");
            }
        }
    }
}

async fn run_notification_loop(
    listener: Arc<Mutex<PgListener>>,
    state: Arc<Mutex<HubState>>,
    stop: Arc<AtomicBool>,
) {
    loop {
        if stop.load(Ordering::SeqCst) {
            break;
        }
        // Bounds how long a concurrent subscribe/unsubscribe waits on the
        // listener mutex, and gives the stop flag a chance to be observed
        // without busy-polling the connection.
        let received = {
            let mut guard = listener.lock().await;
            tokio::time::timeout(Duration::from_secs(1), guard.recv()).await
        };
        let notification = match received {
            Ok(Ok(n)) => n,
            Ok(Err(e)) => {
                if StreamError::is_closed_connection(&e.to_string()) {
                    break;
                }
                warn!(error = %e, "notification listener error");
                continue;
            }
            Err(_elapsed) => continue,
        };

        // Quorum traffic is multiplexed on the same physical connection;
        // ignore anything not namespaced under "stream_".
        if !notification.channel().starts_with("stream_") {
            continue;
        }

        let payload: serde_json::Value = match serde_json::from_str(notification.payload()) {
            Ok(v) => v,
            Err(_) => continue,
        };
        let (Some(stream_name), Some(group_name)) = (
            payload.get("stream_name").and_then(|v| v.as_str()),
            payload.get("group_name").and_then(|v| v.as_str()),
        ) else {
            continue;
        };
        let consumer_key = format!("{stream_name}:{group_name}");

        let consumers: Vec<Arc<RegisteredConsumer>> = {
            let state = state.lock().await;
            state
                .channels
                .get(notification.channel())
                .and_then(|by_key| by_key.get(&consumer_key))
                .map(|by_instance| by_instance.values().cloned().collect())
                .unwrap_or_default()
        };

        for consumer in consumers {
            let options = consumer.default_options.clone();
            tokio::spawn(async move { consumer.fetch_and_deliver(options).await });
        }
    }
}

async fn run_fallback_loop(
    scanner: Arc<dyn VisibilityScanner>,
    state: Arc<Mutex<HubState>>,
    interval: Duration,
    stop: Arc<AtomicBool>,
    wake: Arc<Notify>,
) {
    loop {
        tokio::select! {
            _ = tokio::time::sleep(interval) => {}
            _ = wake.notified() => {}
        }
        if stop.load(Ordering::SeqCst) {
            break;
        }

        if let Err(e) = scanner.notify_visible_messages().await {
            if !StreamError::is_closed_connection(&e.to_string()) {
                warn!(error = %e, "visibility scan failed in fallback poller");
            }
        }

        let chrono_interval = chrono::Duration::from_std(interval).unwrap_or(chrono::Duration::seconds(30));
        let cutoff = Utc::now() - chrono_interval;
        let consumers = state.lock().await.all_consumers();
        for consumer in consumers {
            let last_check = *consumer.last_fallback_check.lock().await;
            if last_check < cutoff {
                let options = FetchOptions::default()
                    .with_batch_size(10)
                    .with_backoff(streamgate_db::FetchBackoff {
                        initial: Duration::from_millis(50),
                        max: Duration::from_millis(50),
                        max_retries: 1,
                    });
                tokio::spawn(async move { consumer.fetch_and_deliver(options).await });
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use streamgate_db::{FetchedMessage, RetryPolicy, StreamStats};
    use std::sync::atomic::AtomicUsize;
    use tokio::sync::Mutex as TokioMutex;

    struct NoopScanner;
    #[async_trait]
    impl VisibilityScanner for NoopScanner {
        async fn notify_visible_messages(&self) -> Result<i32, StreamError> {
            Ok(0)
        }
    }

    struct FakeEngine {
        fetch_calls: AtomicUsize,
    }

    #[async_trait]
    impl StreamEngine for FakeEngine {
        async fn publish(
            &self,
            _stream: &str,
            _messages: Vec<serde_json::Value>,
            _options: streamgate_db::PublishOptions,
        ) -> Result<Vec<String>, StreamError> {
            Ok(vec![])
        }

        async fn fetch(
            &self,
            _stream: &str,
            _group: &str,
            _consumer: &str,
            _options: FetchOptions,
        ) -> Result<Vec<FetchedMessage>, StreamError> {
            self.fetch_calls.fetch_add(1, Ordering::SeqCst);
            Ok(vec![FetchedMessage {
                id: "1".into(),
                stream_name: "orders".into(),
                group_name: "WORKER".into(),
                payload: serde_json::json!({"data": {}}),
                retry_policy: RetryPolicy::default(),
                retry_attempt: 0,
            }])
        }

        async fn soft_delete(&self, _stream: &str, _group: &str, _ids: &[String]) -> Result<u64, StreamError> {
            Ok(0)
        }

        async fn trim(
            &self,
            _stream: &str,
            _max_len: Option<i64>,
            _max_age: Option<Duration>,
        ) -> Result<u64, StreamError> {
            Ok(0)
        }

        async fn depth(&self, _stream: &str) -> Result<i64, StreamError> {
            Ok(0)
        }

        async fn depths(&self, _streams: &[String]) -> Result<HashMap<String, i64>, StreamError> {
            Ok(HashMap::new())
        }

        async fn stats(&self, _stream: &str) -> Result<StreamStats, StreamError> {
            Ok(StreamStats::default())
        }
    }

    struct CollectingCallback {
        received: TokioMutex<Vec<FetchedMessage>>,
    }

    #[async_trait]
    impl DeliveryCallback for CollectingCallback {
        async fn deliver(&self, messages: Vec<FetchedMessage>) {
            self.received.lock().await.extend(messages);
        }
    }

    #[tokio::test]
    async fn subscribe_then_unsubscribe_empties_registry() {
        let hub = ConnectionHub::without_listener(Arc::new(NoopScanner), Duration::from_secs(30)).await;
        let engine: Arc<dyn StreamEngine> = Arc::new(FakeEngine {
            fetch_calls: AtomicUsize::new(0),
        });
        let callback = Arc::new(CollectingCallback {
            received: TokioMutex::new(Vec::new()),
        });

        hub.subscribe(
            "engine-a",
            "orders",
            "WORKER",
            "consumer-1",
            engine,
            callback,
            FetchOptions::default(),
        )
        .await
        .unwrap();

        assert_eq!(hub.state.lock().await.channels.len(), 1);

        hub.unsubscribe("engine-a", "orders", "WORKER").await.unwrap();
        assert!(hub.state.lock().await.channels.is_empty());
    }

    #[tokio::test]
    async fn cleanup_removes_only_the_given_instance() {
        let hub = ConnectionHub::without_listener(Arc::new(NoopScanner), Duration::from_secs(30)).await;
        let engine: Arc<dyn StreamEngine> = Arc::new(FakeEngine {
            fetch_calls: AtomicUsize::new(0),
        });
        let callback = Arc::new(CollectingCallback {
            received: TokioMutex::new(Vec::new()),
        });

        hub.subscribe(
            "engine-a",
            "orders",
            "WORKER",
            "consumer-1",
            engine.clone(),
            callback.clone(),
            FetchOptions::default(),
        )
        .await
        .unwrap();
        hub.subscribe(
            "engine-b",
            "orders",
            "WORKER",
            "consumer-2",
            engine,
            callback,
            FetchOptions::default(),
        )
        .await
        .unwrap();

        hub.cleanup("engine-a").await.unwrap();

        {
            let state = hub.state.lock().await;
            let by_instance = state
                .channels
                .get("stream_orders_WORKER")
                .unwrap()
                .get("orders:WORKER")
                .unwrap();
            assert_eq!(by_instance.len(), 1);
            assert!(by_instance.contains_key("engine-b"));
        }

        // engine-b is still registered on this connection, so the shared
        // fallback/notification loops must still be running.
        assert!(!hub.stop.load(Ordering::SeqCst));
        assert_eq!(hub.tasks.lock().await.len(), 1);

        hub.cleanup("engine-b").await.unwrap();
        assert!(hub.state.lock().await.channels.is_empty());
        assert!(hub.stop.load(Ordering::SeqCst));
        assert!(hub.tasks.lock().await.is_empty());
    }

    #[tokio::test]
    async fn notification_dispatch_invokes_matching_consumer_only() {
        let hub = ConnectionHub::without_listener(Arc::new(NoopScanner), Duration::from_secs(30)).await;
        let engine = Arc::new(FakeEngine {
            fetch_calls: AtomicUsize::new(0),
        });
        let callback = Arc::new(CollectingCallback {
            received: TokioMutex::new(Vec::new()),
        });

        hub.subscribe(
            "engine-a",
            "orders",
            "WORKER",
            "consumer-1",
            engine.clone() as Arc<dyn StreamEngine>,
            callback.clone() as Arc<dyn DeliveryCallback>,
            FetchOptions::default(),
        )
        .await
        .unwrap();

        let consumers: Vec<Arc<RegisteredConsumer>> = {
            let state = hub.state.lock().await;
            state
                .channels
                .get("stream_orders_WORKER")
                .unwrap()
                .get("orders:WORKER")
                .unwrap()
                .values()
                .cloned()
                .collect()
        };
        assert_eq!(consumers.len(), 1);
        consumers[0].fetch_and_deliver(FetchOptions::default()).await;

        assert_eq!(engine.fetch_calls.load(Ordering::SeqCst), 1);
        assert_eq!(callback.received.lock().await.len(), 1);
    }
}
