//! Mapper engine
//!
//! Subscribes to the ingest fan-out, matches inbound events against the
//! active version's rules by exact source topic, and invokes the sandbox
//! once per enabled target. Successful outcomes are republished through
//! the broker pool and re-enter the pipeline as `generated` events with an
//! incremented hop count; failures are recorded per target and never stall
//! the pipeline.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use thiserror::Error;
use tokio::sync::{broadcast, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::codec::Payload;
use crate::hub::{Hub, ServerMessage};
use crate::mqtt::BrokerPool;
use crate::sandbox::{Outcome, Sandbox, ScriptMsg};
use crate::store::{Store, StoreError};
use crate::types::Event;

use super::config::{MapperConfig, MapperConfigError, Rule};
use super::metrics::{ExecRecord, MapperMetrics};

/// Hub metrics emission cadence per target.
const METRICS_EMIT_INTERVAL: Duration = Duration::from_millis(500);

/// Errors from the config write path.
#[derive(Debug, Error)]
pub enum ConfigWriteError {
    #[error(transparent)]
    Invalid(#[from] MapperConfigError),
    #[error("persist failed: {0}")]
    Store(#[from] StoreError),
}

struct Snapshot {
    config: MapperConfig,
    /// Exact-match rule index over the active version.
    rules: HashMap<String, Rule>,
}

impl Snapshot {
    fn build(config: MapperConfig) -> Self {
        let rules = config
            .active_version()
            .map(|version| {
                version
                    .rules
                    .iter()
                    .map(|rule| (rule.source_topic.clone(), rule.clone()))
                    .collect()
            })
            .unwrap_or_default();
        Self { config, rules }
    }
}

/// The rule-driven transformation engine.
pub struct MapperEngine {
    snapshot: ArcSwap<Snapshot>,
    metrics: Arc<MapperMetrics>,
    store: Arc<Store>,
    pool: Arc<BrokerPool>,
    sandbox: Sandbox,
    hub: Arc<Hub>,
    /// Generated events re-enter the pipeline through ingest.
    ingest_tx: mpsc::Sender<Event>,
    save_lock: tokio::sync::Mutex<()>,
    known_brokers: Vec<String>,
    max_hop: u8,
    max_versions: usize,
}

impl MapperEngine {
    /// Load the persisted config (or start with the default) and build the
    /// engine.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: Arc<Store>,
        pool: Arc<BrokerPool>,
        sandbox: Sandbox,
        hub: Arc<Hub>,
        ingest_tx: mpsc::Sender<Event>,
        max_hop: u8,
        max_versions: usize,
    ) -> Result<Self, ConfigWriteError> {
        let known_brokers = pool.broker_ids();

        let mut config = store.load_mapper_config()?.unwrap_or_default();
        config.normalize();
        config.validate(&known_brokers)?;

        let rules = config
            .active_version()
            .map(|v| v.rules.len())
            .unwrap_or_default();
        info!(
            active_version = %config.active_version_id,
            rules,
            "Mapper engine initialized"
        );

        Ok(Self {
            snapshot: ArcSwap::from_pointee(Snapshot::build(config)),
            metrics: Arc::new(MapperMetrics::new()),
            store,
            pool,
            sandbox,
            hub,
            ingest_tx,
            save_lock: tokio::sync::Mutex::new(()),
            known_brokers,
            max_hop,
            max_versions,
        })
    }

    pub fn metrics(&self) -> Arc<MapperMetrics> {
        Arc::clone(&self.metrics)
    }

    /// Current config snapshot (copy-on-write clone).
    pub fn config(&self) -> MapperConfig {
        self.snapshot.load().config.clone()
    }

    /// Atomically replace the config: normalize, validate, persist under
    /// the single-writer lock, then swap the in-memory snapshot. In-flight
    /// invocations complete against the old snapshot; new invocations see
    /// the new one.
    pub async fn replace_config(
        &self,
        mut config: MapperConfig,
    ) -> Result<MapperConfig, ConfigWriteError> {
        config.normalize();
        config.validate(&self.known_brokers)?;
        config.cap_versions(self.max_versions);

        let _guard = self.save_lock.lock().await;
        self.store.save_mapper_config(&config)?;
        self.snapshot.store(Arc::new(Snapshot::build(config.clone())));

        // Metrics for deleted targets go with them.
        let live: Vec<(String, String)> = config
            .active_version()
            .map(|version| {
                version
                    .rules
                    .iter()
                    .flat_map(|rule| {
                        rule.targets
                            .iter()
                            .map(|t| (rule.source_topic.clone(), t.id.clone()))
                    })
                    .collect()
            })
            .unwrap_or_default();
        self.metrics.retain_targets(&live);

        if let Ok(value) = serde_json::to_value(&config) {
            self.hub.broadcast(&ServerMessage::ConfigUpdated { config: value });
        }

        info!(active_version = %config.active_version_id, "Mapper config replaced");
        Ok(config)
    }

    /// Consume the ingest fan-out until cancelled.
    pub async fn run(
        self: Arc<Self>,
        mut fanout: broadcast::Receiver<Arc<Event>>,
        cancel: CancellationToken,
    ) {
        info!("Mapper engine started");
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!("Mapper engine stopping");
                    return;
                }
                received = fanout.recv() => match received {
                    Ok(event) => self.process_event(&event).await,
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped, "Mapper lagged behind ingest fan-out");
                    }
                    Err(broadcast::error::RecvError::Closed) => return,
                },
            }
        }
    }

    /// Process one inbound event against the active rules.
    pub async fn process_event(&self, event: &Event) {
        if event.hop >= self.max_hop {
            debug!(
                topic = %event.topic,
                hop = event.hop,
                "Hop ceiling reached, not mapping further"
            );
            return;
        }

        let snapshot = self.snapshot.load_full();
        let Some(rule) = snapshot.rules.get(&event.topic) else {
            return;
        };

        let decoded = event.decode_payload();
        let structured = !matches!(decoded, Payload::Raw(_));
        let payload_json = decoded.to_json();

        for target in rule.targets.iter().filter(|t| t.enabled) {
            let msg = ScriptMsg {
                topic: event.topic.clone(),
                payload: payload_json.clone(),
                broker_id: event.broker_id.clone(),
            };

            let outcome = self.sandbox.evaluate(&target.code, msg).await;
            match outcome {
                Outcome::Ok(value) => {
                    self.republish(event, rule, target, value, structured).await;
                    if self
                        .metrics
                        .should_emit(&rule.source_topic, &target.id, METRICS_EMIT_INTERVAL)
                    {
                        self.emit_metrics();
                    }
                }
                Outcome::Skipped => {
                    self.metrics.record(
                        &rule.source_topic,
                        &target.id,
                        ExecRecord::trace(&event.topic, &target.output_topic, "skipped (nil)"),
                    );
                    if self
                        .metrics
                        .should_emit(&rule.source_topic, &target.id, METRICS_EMIT_INTERVAL)
                    {
                        self.emit_metrics();
                    }
                }
                Outcome::Timeout => {
                    self.record_error(event, rule, target, "Timeout");
                }
                Outcome::SandboxError(message) => {
                    self.record_error(event, rule, target, &format!("script error: {message}"));
                }
                Outcome::SqlError(message) => {
                    self.record_error(event, rule, target, &format!("sql error: {message}"));
                }
            }
        }
    }

    async fn republish(
        &self,
        event: &Event,
        rule: &Rule,
        target: &super::config::Target,
        value: serde_json::Value,
        structured: bool,
    ) {
        // Scripts return the (possibly mutated) msg; the payload field is
        // what gets republished. A bare value is treated as the payload.
        let out_json = match &value {
            serde_json::Value::Object(map) if map.contains_key("payload") => {
                value["payload"].clone()
            }
            _ => value,
        };

        let bytes = if structured {
            serde_json::to_vec(&out_json).unwrap_or_default()
        } else {
            match &out_json {
                serde_json::Value::String(s) => s.clone().into_bytes(),
                other => serde_json::to_vec(other).unwrap_or_default(),
            }
        };

        let dest_broker = target
            .target_broker_id
            .as_deref()
            .unwrap_or(&event.broker_id);

        if let Err(e) = self
            .pool
            .publish(dest_broker, &target.output_topic, &bytes, event.qos, event.retain)
            .await
        {
            self.metrics.record(
                &rule.source_topic,
                &target.id,
                ExecRecord::error(
                    &event.topic,
                    &target.output_topic,
                    format!("publish failed: {e}"),
                ),
            );
            self.emit_metrics();
            return;
        }

        // The derived message re-enters the pipeline on the internal path
        // (the broker echo is suppressed by the pool).
        let mut generated = Event::new(dest_broker, target.output_topic.clone(), bytes);
        generated.hop = event.hop + 1;
        generated.generated = true;
        generated.qos = event.qos;
        generated.retain = event.retain;
        if self.ingest_tx.send(generated).await.is_err() {
            warn!("Ingest channel closed, generated event dropped");
        }

        self.hub.broadcast(&ServerMessage::Generated {
            broker_id: dest_broker.to_string(),
            topic: target.output_topic.clone(),
            source_topic: event.topic.clone(),
        });

        self.metrics.record(
            &rule.source_topic,
            &target.id,
            ExecRecord::ok(&event.topic, &target.output_topic, out_json),
        );
    }

    fn record_error(
        &self,
        event: &Event,
        rule: &Rule,
        target: &super::config::Target,
        message: &str,
    ) {
        warn!(
            source_topic = %rule.source_topic,
            target_id = %target.id,
            error = message,
            "Mapper target failed"
        );
        self.metrics.record(
            &rule.source_topic,
            &target.id,
            ExecRecord::error(&event.topic, &target.output_topic, message),
        );
        // Errors bypass the throttle.
        self.emit_metrics();
    }

    fn emit_metrics(&self) {
        if let Ok(value) = serde_json::to_value(self.metrics.snapshot()) {
            self.hub.broadcast(&ServerMessage::MapperMetrics { metrics: value });
        }
    }
}
