//! Broadcast hub
//!
//! Multiplexes live events and request/response traffic to connected UI
//! clients over WebSocket. Each client owns a bounded outbox; a client that
//! cannot keep up is disconnected and must reconnect. Inbound requests are
//! rate-capped per client, and in-flight request tasks are aborted on
//! disconnect.

pub mod messages;

pub use messages::{ClientMessage, ServerMessage};

use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use axum::extract::ws::{Message, WebSocket};
use dashmap::DashMap;
use futures::{SinkExt, StreamExt};
use tokio::sync::{broadcast, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::mqtt::BrokerPool;
use crate::store::Store;
use crate::topic::TopicPattern;
use crate::types::Event;

/// Default bounded outbox size per client.
const OUTBOX_CAPACITY: usize = 256;

/// Most-recent window sent as the initial history batch.
const INIT_WINDOW: usize = 100;

/// History limits for hub RPC, matching the HTTP surface.
const HISTORY_DEFAULT_LIMIT: usize = 20;
const HISTORY_MAX_LIMIT: usize = 1_000;

struct Client {
    user_id: String,
    filter: Mutex<Option<TopicPattern>>,
    outbox: mpsc::Sender<String>,
    cancel: CancellationToken,
}

/// Fixed-window inbound request limiter.
struct RequestLimiter {
    window_start: Instant,
    count: u32,
    cap_per_sec: u32,
}

impl RequestLimiter {
    fn new(cap_per_sec: u32) -> Self {
        Self {
            window_start: Instant::now(),
            count: 0,
            cap_per_sec,
        }
    }

    fn allow(&mut self) -> bool {
        let now = Instant::now();
        if now.duration_since(self.window_start) >= Duration::from_secs(1) {
            self.window_start = now;
            self.count = 0;
        }
        self.count += 1;
        self.count <= self.cap_per_sec
    }
}

/// The server-side multiplexer.
pub struct Hub {
    clients: DashMap<Uuid, Arc<Client>>,
    store: Arc<Store>,
    pool: Arc<BrokerPool>,
    rate_cap_per_sec: u32,
}

impl Hub {
    pub fn new(store: Arc<Store>, pool: Arc<BrokerPool>, rate_cap_per_sec: u32) -> Self {
        Self {
            clients: DashMap::new(),
            store,
            pool,
            rate_cap_per_sec,
        }
    }

    pub fn client_count(&self) -> usize {
        self.clients.len()
    }

    /// Forward live events from the ingest fan-out until cancelled.
    pub async fn run(
        self: Arc<Self>,
        mut fanout: broadcast::Receiver<Arc<Event>>,
        cancel: CancellationToken,
    ) {
        info!("Broadcast hub started");
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!("Broadcast hub stopping");
                    return;
                }
                received = fanout.recv() => match received {
                    Ok(event) => self.broadcast_event(&event),
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped, "Hub lagged behind ingest fan-out");
                    }
                    Err(broadcast::error::RecvError::Closed) => return,
                },
            }
        }
    }

    /// Push one event to every client whose filter matches.
    pub fn broadcast_event(&self, event: &Event) {
        let frame = ServerMessage::Event {
            broker_id: event.broker_id.clone(),
            topic: event.topic.clone(),
            payload: event.decode_payload().to_json(),
            timestamp: event.timestamp.to_rfc3339(),
            generated: event.generated,
        }
        .to_frame();

        self.send_filtered(&frame, Some(&event.topic));
    }

    /// Push a control message to every client.
    pub fn broadcast(&self, message: &ServerMessage) {
        self.send_filtered(&message.to_frame(), None);
    }

    fn send_filtered(&self, frame: &str, topic: Option<&str>) {
        let mut dropped = Vec::new();

        for entry in self.clients.iter() {
            if let Some(topic) = topic {
                let filter = entry.filter.lock().unwrap_or_else(PoisonError::into_inner);
                if let Some(pattern) = filter.as_ref() {
                    if !pattern.matches(topic) {
                        continue;
                    }
                }
            }

            // Back-pressure: a full outbox disconnects the client.
            if entry.outbox.try_send(frame.to_string()).is_err() {
                dropped.push(*entry.key());
            }
        }

        for id in dropped {
            self.disconnect(id, "outbox overflow");
        }
    }

    fn disconnect(&self, id: Uuid, reason: &str) {
        if let Some((_, client)) = self.clients.remove(&id) {
            warn!(client_id = %id, user_id = %client.user_id, reason, "Disconnecting hub client");
            client.cancel.cancel();
        }
    }

    /// Serve one WebSocket connection to completion.
    pub async fn handle_socket(self: Arc<Self>, socket: WebSocket, user_id: String) {
        let id = Uuid::new_v4();
        let (outbox_tx, mut outbox_rx) = mpsc::channel::<String>(OUTBOX_CAPACITY);
        let cancel = CancellationToken::new();

        let client = Arc::new(Client {
            user_id: user_id.clone(),
            filter: Mutex::new(None),
            outbox: outbox_tx.clone(),
            cancel: cancel.clone(),
        });
        self.clients.insert(id, Arc::clone(&client));
        info!(
            client_id = %id,
            user_id = %user_id,
            clients = self.client_count(),
            "Hub client connected"
        );

        let (mut sink, mut stream) = socket.split();

        // Initial batch: recent window, latest mapper config, DB status.
        if outbox_tx.send(self.init_message().to_frame()).await.is_err() {
            self.disconnect(id, "init send failed");
            return;
        }

        // Writer: drains the outbox into the socket.
        let writer_cancel = cancel.clone();
        let writer = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = writer_cancel.cancelled() => break,
                    frame = outbox_rx.recv() => match frame {
                        Some(frame) => {
                            if sink.send(Message::Text(frame)).await.is_err() {
                                break;
                            }
                        }
                        None => break,
                    },
                }
            }
            let _ = sink.close().await;
        });

        // Reader: parses requests, enforces the rate cap, runs request
        // tasks under the client's cancellation token.
        let mut limiter = RequestLimiter::new(self.rate_cap_per_sec);
        loop {
            let frame = tokio::select! {
                _ = cancel.cancelled() => break,
                frame = stream.next() => frame,
            };

            match frame {
                Some(Ok(Message::Text(text))) => {
                    if !limiter.allow() {
                        let _ = outbox_tx.try_send(
                            ServerMessage::Error {
                                message: "rate cap exceeded".to_string(),
                            }
                            .to_frame(),
                        );
                        continue;
                    }
                    match serde_json::from_str::<ClientMessage>(&text) {
                        Ok(message) => {
                            let hub = Arc::clone(&self);
                            let client = Arc::clone(&client);
                            let task_cancel = cancel.clone();
                            tokio::spawn(async move {
                                tokio::select! {
                                    _ = task_cancel.cancelled() => {}
                                    () = hub.handle_request(&client, message) => {}
                                }
                            });
                        }
                        Err(e) => {
                            let _ = outbox_tx.try_send(
                                ServerMessage::Error {
                                    message: format!("bad request: {e}"),
                                }
                                .to_frame(),
                            );
                        }
                    }
                }
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    debug!(client_id = %id, error = %e, "WebSocket read error");
                    break;
                }
            }
        }

        self.disconnect(id, "socket closed");
        cancel.cancel();
        let _ = writer.await;
        info!(client_id = %id, clients = self.client_count(), "Hub client gone");
    }

    fn init_message(&self) -> ServerMessage {
        let recent = self
            .store
            .recent_events(INIT_WINDOW)
            .map(|events| events.iter().map(Event::wire_json).collect())
            .unwrap_or_default();

        let mapper_config = self
            .store
            .load_mapper_config()
            .ok()
            .flatten()
            .and_then(|c| serde_json::to_value(c).ok())
            .unwrap_or(serde_json::Value::Null);

        let db_status = self
            .store
            .stats()
            .ok()
            .and_then(|s| serde_json::to_value(s).ok())
            .unwrap_or(serde_json::Value::Null);

        ServerMessage::Init {
            recent,
            mapper_config,
            db_status,
        }
    }

    async fn handle_request(&self, client: &Client, message: ClientMessage) {
        let reply = |frame: String| {
            // Back-pressure applies to responses too.
            let _ = client.outbox.try_send(frame);
        };

        match message {
            ClientMessage::Subscribe { filter } => {
                let compiled = match filter {
                    Some(raw) => match TopicPattern::compile(&raw) {
                        Ok(pattern) => Some(pattern),
                        Err(e) => {
                            reply(
                                ServerMessage::Error {
                                    message: format!("bad filter: {e}"),
                                }
                                .to_frame(),
                            );
                            return;
                        }
                    },
                    None => None,
                };
                *client.filter.lock().unwrap_or_else(PoisonError::into_inner) = compiled;
            }

            ClientMessage::GetTopicHistory {
                topic,
                broker_id,
                limit,
            } => {
                let limit = limit
                    .unwrap_or(HISTORY_DEFAULT_LIMIT)
                    .min(HISTORY_MAX_LIMIT);
                match self.store.get_history(broker_id.as_deref(), &topic, limit) {
                    Ok(events) => reply(
                        ServerMessage::GetTopicHistoryData {
                            topic,
                            broker_id,
                            events: events.iter().map(Event::wire_json).collect(),
                        }
                        .to_frame(),
                    ),
                    Err(e) => reply(
                        ServerMessage::Error {
                            message: e.to_string(),
                        }
                        .to_frame(),
                    ),
                }
            }

            ClientMessage::GetHistoryRange { start, end, filter } => {
                let pattern = match filter.as_deref().map(TopicPattern::compile).transpose() {
                    Ok(p) => p,
                    Err(e) => {
                        reply(
                            ServerMessage::Error {
                                message: format!("bad filter: {e}"),
                            }
                            .to_frame(),
                        );
                        return;
                    }
                };
                match self.store.range(start, end, pattern.as_ref(), None) {
                    Ok(events) => reply(
                        ServerMessage::GetHistoryRangeData {
                            start,
                            end,
                            filter,
                            events: events.iter().map(Event::wire_json).collect(),
                        }
                        .to_frame(),
                    ),
                    Err(e) => reply(
                        ServerMessage::Error {
                            message: e.to_string(),
                        }
                        .to_frame(),
                    ),
                }
            }

            ClientMessage::Publish {
                broker_id,
                topic,
                payload,
                qos,
                retain,
            } => {
                // Same contract as the HTTP publish passthrough.
                if topic.is_empty() || topic.contains('+') || topic.contains('#') {
                    reply(
                        ServerMessage::Error {
                            message: "publish topic must be exact (no wildcards)".to_string(),
                        }
                        .to_frame(),
                    );
                    return;
                }
                let bytes = match &payload {
                    serde_json::Value::String(s) => s.clone().into_bytes(),
                    other => serde_json::to_vec(other).unwrap_or_default(),
                };
                if let Err(e) = self
                    .pool
                    .publish(
                        &broker_id,
                        &topic,
                        &bytes,
                        qos.unwrap_or(0),
                        retain.unwrap_or(false),
                    )
                    .await
                {
                    reply(
                        ServerMessage::Error {
                            message: e.to_string(),
                        }
                        .to_frame(),
                    );
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hub() -> Hub {
        let store = Arc::new(Store::open_in_memory().unwrap());
        let pool = Arc::new(BrokerPool::new(&[]).unwrap());
        Hub::new(store, pool, 10)
    }

    fn register(hub: &Hub, filter: Option<&str>, capacity: usize) -> mpsc::Receiver<String> {
        let (tx, rx) = mpsc::channel(capacity);
        hub.clients.insert(
            Uuid::new_v4(),
            Arc::new(Client {
                user_id: "u1".to_string(),
                filter: Mutex::new(filter.map(|f| TopicPattern::compile(f).unwrap())),
                outbox: tx,
                cancel: CancellationToken::new(),
            }),
        );
        rx
    }

    #[test]
    fn rate_limiter_caps_within_window() {
        let mut limiter = RequestLimiter::new(3);
        assert!(limiter.allow());
        assert!(limiter.allow());
        assert!(limiter.allow());
        assert!(!limiter.allow());
    }

    #[test]
    fn rate_limiter_resets_after_window() {
        let mut limiter = RequestLimiter::new(1);
        assert!(limiter.allow());
        assert!(!limiter.allow());
        limiter.window_start = Instant::now() - Duration::from_secs(2);
        assert!(limiter.allow());
    }

    #[tokio::test]
    async fn overflowing_outbox_disconnects_client() {
        let hub = hub();
        let _rx = register(&hub, None, 1);

        let event = Event::new("b1", "a/b", b"1".to_vec());
        hub.broadcast_event(&event); // fills the outbox
        assert_eq!(hub.client_count(), 1);
        hub.broadcast_event(&event); // overflows, client dropped
        assert_eq!(hub.client_count(), 0);
    }

    #[tokio::test]
    async fn subscription_filter_scopes_events() {
        let hub = hub();
        let mut rx = register(&hub, Some("plant/#"), 16);

        hub.broadcast_event(&Event::new("b1", "other/x", b"1".to_vec()));
        hub.broadcast_event(&Event::new("b1", "plant/a", b"2".to_vec()));

        let frame = rx.try_recv().unwrap();
        let v: serde_json::Value = serde_json::from_str(&frame).unwrap();
        assert_eq!(v["topic"], "plant/a");
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn publish_rpc_rejects_wildcard_topics() {
        let hub = hub();
        let (tx, mut rx) = mpsc::channel(16);
        let client = Client {
            user_id: "u1".to_string(),
            filter: Mutex::new(None),
            outbox: tx,
            cancel: CancellationToken::new(),
        };

        for topic in ["a/+", "a/#", ""] {
            hub.handle_request(
                &client,
                ClientMessage::Publish {
                    broker_id: "b1".to_string(),
                    topic: topic.to_string(),
                    payload: serde_json::json!({"v": 1}),
                    qos: None,
                    retain: None,
                },
            )
            .await;

            let frame = rx.try_recv().unwrap();
            assert!(frame.contains("no wildcards"), "{topic}: {frame}");
        }
    }

    #[tokio::test]
    async fn control_broadcasts_ignore_filters() {
        let hub = hub();
        let mut rx = register(&hub, Some("plant/#"), 16);

        hub.broadcast(&ServerMessage::AlertsUpdated);
        let frame = rx.try_recv().unwrap();
        assert!(frame.contains("alerts-updated"));
    }
}
