//! Broker pool
//!
//! Owns every configured broker connection. Each connection runs as an
//! independent task: connect, subscribe the declared patterns, forward
//! inbound publishes to the ingest channel, reconnect with exponential
//! back-off on failure. The stop signal is observed inside the back-off
//! wait, so `stop_all` cancels pending retries promptly.

use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use rand::Rng;
use rumqttc::{AsyncClient, Event as MqttEvent, EventLoop, MqttOptions, Packet};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::BrokerSettings;
use crate::topic::TopicPattern;
use crate::types::{ConnectionState, Event};

use super::{qos_from_u8, PublishError};

/// Echo-suppression window: a message we published that comes back from the
/// broker within this window is dropped (its event already entered the
/// pipeline on the internal path).
const ECHO_WINDOW: Duration = Duration::from_secs(2);

const INITIAL_BACKOFF: Duration = Duration::from_secs(1);
const MAX_BACKOFF: Duration = Duration::from_secs(60);

struct Broker {
    settings: BrokerSettings,
    client: AsyncClient,
    allowed: Vec<TopicPattern>,
    state: Arc<std::sync::atomic::AtomicU8>,
}

fn state_code(state: ConnectionState) -> u8 {
    match state {
        ConnectionState::Connecting => 0,
        ConnectionState::Connected => 1,
        ConnectionState::Disconnected => 2,
        ConnectionState::Stopped => 3,
    }
}

fn code_state(code: u8) -> ConnectionState {
    match code {
        1 => ConnectionState::Connected,
        2 => ConnectionState::Disconnected,
        3 => ConnectionState::Stopped,
        _ => ConnectionState::Connecting,
    }
}

/// The pool of broker connections.
pub struct BrokerPool {
    brokers: HashMap<String, Broker>,
    eventloops: std::sync::Mutex<Vec<(String, EventLoop)>>,
    handles: std::sync::Mutex<Vec<JoinHandle<()>>>,
    cancel: CancellationToken,
    started: AtomicBool,
    stopped: AtomicBool,
    /// `(broker_id, topic) → (payload hash, publish time)`
    recent_publishes: DashMap<(String, String), (u64, Instant)>,
}

impl BrokerPool {
    /// Build the pool from configuration. Connections are not opened until
    /// `start_all`.
    pub fn new(brokers: &[BrokerSettings]) -> anyhow::Result<Self> {
        let mut map = HashMap::new();
        let mut eventloops = Vec::new();

        for settings in brokers {
            let mut options = MqttOptions::new(
                format!("uns-gateway-{}", settings.id),
                &settings.host,
                settings.port,
            );
            options.set_keep_alive(Duration::from_secs(30));
            options.set_max_packet_size(1024 * 1024, 1024 * 1024);
            if let (Some(user), Some(pass)) = (&settings.username, &settings.password) {
                options.set_credentials(user, pass);
            }

            let (client, eventloop) = AsyncClient::new(options, 256);

            let allowed = settings
                .publish_allowed_topics
                .iter()
                .map(|p| TopicPattern::compile(p))
                .collect::<Result<Vec<_>, _>>()
                .map_err(|e| anyhow::anyhow!("broker '{}': {e}", settings.id))?;

            for sub in &settings.subscriptions {
                TopicPattern::compile(sub)
                    .map_err(|e| anyhow::anyhow!("broker '{}': {e}", settings.id))?;
            }

            eventloops.push((settings.id.clone(), eventloop));
            map.insert(
                settings.id.clone(),
                Broker {
                    settings: settings.clone(),
                    client,
                    allowed,
                    state: Arc::new(std::sync::atomic::AtomicU8::new(state_code(
                        ConnectionState::Connecting,
                    ))),
                },
            );
        }

        Ok(Self {
            brokers: map,
            eventloops: std::sync::Mutex::new(eventloops),
            handles: std::sync::Mutex::new(Vec::new()),
            cancel: CancellationToken::new(),
            started: AtomicBool::new(false),
            stopped: AtomicBool::new(false),
            recent_publishes: DashMap::new(),
        })
    }

    /// Spawn one connection task per broker. Idempotent.
    pub fn start_all(self: &Arc<Self>, ingest_tx: mpsc::Sender<Event>) {
        if self.started.swap(true, Ordering::SeqCst) {
            return;
        }

        let eventloops = {
            let mut guard = self
                .eventloops
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            std::mem::take(&mut *guard)
        };

        let mut handles = Vec::new();
        for (broker_id, eventloop) in eventloops {
            let pool = Arc::clone(self);
            let tx = ingest_tx.clone();
            let id = broker_id.clone();
            handles.push(tokio::spawn(async move {
                pool.run_connection(&id, eventloop, tx).await;
            }));
        }

        *self
            .handles
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner) = handles;

        info!(brokers = self.brokers.len(), "Broker pool started");
    }

    /// Cancel all connection tasks, including pending reconnect waits.
    /// Idempotent.
    pub async fn stop_all(&self) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        self.cancel.cancel();

        for broker in self.brokers.values() {
            broker
                .state
                .store(state_code(ConnectionState::Stopped), Ordering::Relaxed);
            let _ = broker.client.disconnect().await;
        }

        let handles = {
            let mut guard = self
                .handles
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            std::mem::take(&mut *guard)
        };
        for handle in handles {
            let _ = handle.await;
        }
        info!("Broker pool stopped");
    }

    /// Per-broker connection states for `/context/status` and the hub.
    pub fn connection_states(&self) -> HashMap<String, ConnectionState> {
        self.brokers
            .iter()
            .map(|(id, b)| (id.clone(), code_state(b.state.load(Ordering::Relaxed))))
            .collect()
    }

    pub fn broker_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.brokers.keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn has_broker(&self, broker_id: &str) -> bool {
        self.brokers.contains_key(broker_id)
    }

    /// Publish to one broker, enforcing its allowlist and connection state.
    pub async fn publish(
        &self,
        broker_id: &str,
        topic: &str,
        payload: &[u8],
        qos: u8,
        retain: bool,
    ) -> Result<(), PublishError> {
        let broker = self
            .brokers
            .get(broker_id)
            .ok_or_else(|| PublishError::UnknownBroker(broker_id.to_string()))?;

        if !broker.allowed.iter().any(|p| p.matches(topic)) {
            return Err(PublishError::NotAllowed {
                broker_id: broker_id.to_string(),
                topic: topic.to_string(),
            });
        }

        if code_state(broker.state.load(Ordering::Relaxed)) != ConnectionState::Connected {
            return Err(PublishError::Unavailable(broker_id.to_string()));
        }

        self.recent_publishes.insert(
            (broker_id.to_string(), topic.to_string()),
            (payload_hash(payload), Instant::now()),
        );

        broker
            .client
            .publish(topic, qos_from_u8(qos), retain, payload)
            .await
            .map_err(|_| PublishError::Unavailable(broker_id.to_string()))
    }

    /// Clear retained state on the broker for the given topics by
    /// publishing zero-length retained payloads. Topics outside the
    /// allowlist are skipped with a warning.
    pub async fn purge_retained(&self, broker_id: &str, topics: &[String]) -> usize {
        let mut purged = 0;
        for topic in topics {
            match self.publish(broker_id, topic, &[], 0, true).await {
                Ok(()) => purged += 1,
                Err(e) => warn!(broker_id, topic, error = %e, "Retained purge skipped"),
            }
        }
        purged
    }

    /// True when this inbound message is the echo of one of our own
    /// publishes inside the suppression window.
    fn is_self_echo(&self, broker_id: &str, topic: &str, payload: &[u8]) -> bool {
        let key = (broker_id.to_string(), topic.to_string());
        if let Some(entry) = self.recent_publishes.get(&key) {
            let (hash, at) = *entry;
            drop(entry);
            if at.elapsed() < ECHO_WINDOW && hash == payload_hash(payload) {
                self.recent_publishes.remove(&key);
                return true;
            }
        }
        false
    }

    async fn run_connection(
        &self,
        broker_id: &str,
        mut eventloop: EventLoop,
        ingest_tx: mpsc::Sender<Event>,
    ) {
        let Some(broker) = self.brokers.get(broker_id) else {
            return;
        };
        let mut backoff = INITIAL_BACKOFF;

        info!(
            broker_id,
            host = %broker.settings.host,
            port = broker.settings.port,
            "Broker connection task starting"
        );

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => {
                    broker.state.store(state_code(ConnectionState::Stopped), Ordering::Relaxed);
                    info!(broker_id, "Broker connection task stopping");
                    return;
                }
                polled = eventloop.poll() => {
                    match polled {
                        Ok(MqttEvent::Incoming(Packet::ConnAck(_))) => {
                            info!(broker_id, "Connected");
                            broker.state.store(state_code(ConnectionState::Connected), Ordering::Relaxed);
                            backoff = INITIAL_BACKOFF;
                            self.subscribe_all(broker_id).await;
                        }
                        Ok(MqttEvent::Incoming(Packet::Publish(publish))) => {
                            if self.is_self_echo(broker_id, &publish.topic, &publish.payload) {
                                debug!(broker_id, topic = %publish.topic, "Dropped self-echo");
                                continue;
                            }
                            let mut event = Event::new(
                                broker_id,
                                publish.topic.clone(),
                                publish.payload.to_vec(),
                            );
                            event.qos = publish.qos as u8;
                            event.retain = publish.retain;
                            if ingest_tx.send(event).await.is_err() {
                                warn!(broker_id, "Ingest channel closed, stopping connection task");
                                return;
                            }
                        }
                        Ok(_) => {}
                        Err(e) => {
                            broker.state.store(state_code(ConnectionState::Disconnected), Ordering::Relaxed);
                            let wait = jitter(backoff);
                            warn!(
                                broker_id,
                                error = %e,
                                retry_in_ms = wait.as_millis() as u64,
                                "Broker connection lost, backing off"
                            );
                            tokio::select! {
                                _ = self.cancel.cancelled() => {
                                    broker.state.store(state_code(ConnectionState::Stopped), Ordering::Relaxed);
                                    return;
                                }
                                _ = tokio::time::sleep(wait) => {}
                            }
                            backoff = (backoff * 2).min(MAX_BACKOFF);
                        }
                    }
                }
            }
        }
    }

    async fn subscribe_all(&self, broker_id: &str) {
        let Some(broker) = self.brokers.get(broker_id) else {
            return;
        };
        for pattern in &broker.settings.subscriptions {
            match broker
                .client
                .subscribe(pattern, rumqttc::QoS::AtMostOnce)
                .await
            {
                Ok(()) => debug!(broker_id, pattern, "Subscribed"),
                Err(e) => warn!(broker_id, pattern, error = %e, "Subscribe failed"),
            }
        }
    }
}

fn payload_hash(payload: &[u8]) -> u64 {
    let mut hasher = DefaultHasher::new();
    payload.hash(&mut hasher);
    hasher.finish()
}

/// Add up to 20% random jitter so reconnect storms spread out.
fn jitter(base: Duration) -> Duration {
    let jitter_ms = rand::thread_rng().gen_range(0..=base.as_millis() as u64 / 5);
    base + Duration::from_millis(jitter_ms)
}
