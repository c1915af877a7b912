//! Alert engine
//!
//! Evaluates every inbound event against the pattern-keyed rule set. A
//! truthy condition materializes an alert (or refreshes a debounced one),
//! notifies the hub, fires the rule's webhook and, when a workflow prompt
//! is configured, enqueues LLM enrichment. Sandbox failures silently
//! suppress the rule for that event; nothing here can stall ingest.

use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use chrono::Utc;
use serde_json::json;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::agent::ChatBackend;
use crate::hub::{Hub, ServerMessage};
use crate::sandbox::{is_truthy, Outcome, Sandbox, ScriptMsg};
use crate::store::{Store, StoreError};
use crate::types::Event;

use super::{Alert, AlertRule, AlertStatus};

/// System prompt for the enrichment call.
const ENRICHMENT_SYSTEM: &str =
    "You are an industrial operations assistant. Analyze the alert context and respond with a \
     concise diagnosis and a recommended next action.";

/// The conditional alerting pipeline.
pub struct AlertEngine {
    store: Arc<Store>,
    sandbox: Sandbox,
    hub: Arc<Hub>,
    http: reqwest::Client,
    backend: Option<Arc<dyn ChatBackend>>,
    /// Rule snapshot, swapped atomically on CRUD.
    rules: ArcSwap<Vec<AlertRule>>,
    debounce: Duration,
}

impl AlertEngine {
    pub fn new(
        store: Arc<Store>,
        sandbox: Sandbox,
        hub: Arc<Hub>,
        backend: Option<Arc<dyn ChatBackend>>,
        debounce: Duration,
    ) -> Result<Arc<Self>, StoreError> {
        let rules = store.list_alert_rules()?;
        info!(rules = rules.len(), "Alert engine initialized");

        Ok(Arc::new(Self {
            store,
            sandbox,
            hub,
            http: reqwest::Client::new(),
            backend,
            rules: ArcSwap::from_pointee(rules),
            debounce,
        }))
    }

    /// Reload the rule snapshot from the store. Called after every rule
    /// CRUD; evaluators pick up the new snapshot on their next event.
    pub fn reload_rules(&self) -> Result<(), StoreError> {
        let rules = self.store.list_alert_rules()?;
        debug!(rules = rules.len(), "Alert rules reloaded");
        self.rules.store(Arc::new(rules));
        Ok(())
    }

    /// Consume the ingest fan-out until cancelled.
    pub async fn run(
        self: Arc<Self>,
        mut fanout: broadcast::Receiver<Arc<Event>>,
        cancel: CancellationToken,
    ) {
        info!("Alert engine started");
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!("Alert engine stopping");
                    return;
                }
                received = fanout.recv() => match received {
                    Ok(event) => self.process_event(&event).await,
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped, "Alert engine lagged behind ingest fan-out");
                    }
                    Err(broadcast::error::RecvError::Closed) => return,
                },
            }
        }
    }

    /// Evaluate one event against all matching rules, in stable rule-id
    /// order. Each rule is isolated: one failing webhook or script never
    /// affects the next rule.
    pub async fn process_event(self: &Arc<Self>, event: &Event) {
        let rules = self.rules.load_full();
        let candidates: Vec<&AlertRule> = rules
            .iter()
            .filter(|r| r.topic_pattern.matches(&event.topic))
            .collect();
        if candidates.is_empty() {
            return;
        }

        let payload_json = event.decode_payload().to_json();

        for rule in candidates {
            let msg = ScriptMsg {
                topic: event.topic.clone(),
                payload: payload_json.clone(),
                broker_id: event.broker_id.clone(),
            };

            match self.sandbox.evaluate(&rule.condition_code, msg).await {
                Outcome::Ok(value) if is_truthy(&value) => {
                    self.materialize(rule, event, &payload_json).await;
                }
                Outcome::Ok(_) | Outcome::Skipped => {}
                // Sandbox failures suppress this rule for this event.
                Outcome::Timeout => {
                    debug!(rule_id = %rule.id, topic = %event.topic, "Alert condition timed out");
                }
                Outcome::SandboxError(e) | Outcome::SqlError(e) => {
                    debug!(rule_id = %rule.id, topic = %event.topic, error = %e, "Alert condition failed");
                }
            }
        }
    }

    async fn materialize(
        self: &Arc<Self>,
        rule: &AlertRule,
        event: &Event,
        trigger_value: &serde_json::Value,
    ) {
        // Duplicate suppression: refresh the open alert inside the
        // debounce window instead of creating a new row.
        match self.store.latest_alert_for(&rule.id, &event.topic) {
            Ok(Some(existing))
                if existing.status != AlertStatus::Resolved
                    && (Utc::now() - existing.created_at).to_std().unwrap_or_default()
                        < self.debounce =>
            {
                if let Err(e) = self.store.touch_alert(&existing.id, trigger_value) {
                    warn!(alert_id = %existing.id, error = %e, "Debounce refresh failed");
                }
                self.hub.broadcast(&ServerMessage::AlertsUpdated);
                return;
            }
            Ok(_) => {}
            Err(e) => {
                warn!(rule_id = %rule.id, error = %e, "Debounce lookup failed");
            }
        }

        let now = Utc::now();
        let alert = Alert {
            id: format!("alert_{}", uuid::Uuid::new_v4().simple()),
            rule_id: rule.id.clone(),
            rule_name: rule.name.clone(),
            topic: event.topic.clone(),
            trigger_value: trigger_value.clone(),
            severity: rule.severity,
            status: AlertStatus::New,
            created_at: now,
            updated_at: now,
            handled_by: None,
            analysis_result: None,
        };

        if let Err(e) = self.store.insert_alert(&alert) {
            warn!(rule_id = %rule.id, error = %e, "Alert insert failed");
            return;
        }
        info!(
            alert_id = %alert.id,
            rule = %rule.name,
            topic = %event.topic,
            severity = ?rule.severity,
            "Alert raised"
        );
        self.hub.broadcast(&ServerMessage::AlertsUpdated);

        if let Some(webhook) = &rule.notifications.webhook {
            self.fire_webhook(webhook, &alert).await;
        }

        if let Some(prompt) = &rule.workflow_prompt {
            self.enqueue_enrichment(alert, prompt.clone());
        }
    }

    /// POST a JSON summary. Failures are logged but not retried.
    async fn fire_webhook(&self, url: &str, alert: &Alert) {
        let summary = json!({
            "alert_id": alert.id,
            "rule_name": alert.rule_name,
            "topic": alert.topic,
            "severity": alert.severity,
            "trigger_value": alert.trigger_value,
            "created_at": alert.created_at.to_rfc3339(),
        });

        match self
            .http
            .post(url)
            .json(&summary)
            .timeout(Duration::from_secs(10))
            .send()
            .await
        {
            Ok(response) if response.status().is_success() => {
                debug!(alert_id = %alert.id, "Webhook delivered");
            }
            Ok(response) => {
                warn!(alert_id = %alert.id, status = %response.status(), "Webhook rejected");
            }
            Err(e) => {
                warn!(alert_id = %alert.id, error = %e, "Webhook failed");
            }
        }
    }

    /// Transition to `analyzing` and run the LLM enrichment in the
    /// background. On completion the alert returns to `new` (or stays
    /// `acknowledged` if the operator got there first).
    fn enqueue_enrichment(self: &Arc<Self>, alert: Alert, prompt: String) {
        let Some(backend) = self.backend.clone() else {
            debug!(alert_id = %alert.id, "No LLM backend, skipping enrichment");
            return;
        };

        if let Err(e) = self
            .store
            .set_alert_analysis(&alert.id, AlertStatus::Analyzing, None)
        {
            warn!(alert_id = %alert.id, error = %e, "Could not mark alert analyzing");
            return;
        }
        self.hub.broadcast(&ServerMessage::AlertsUpdated);

        let engine = Arc::clone(self);
        tokio::spawn(async move {
            let user_prompt = format!(
                "{prompt}\n\nAlert context:\n- rule: {}\n- topic: {}\n- severity: {:?}\n- trigger value: {}",
                alert.rule_name, alert.topic, alert.severity, alert.trigger_value
            );

            let analysis = match backend.complete_text(ENRICHMENT_SYSTEM, &user_prompt).await {
                Ok(text) => text,
                Err(e) => {
                    warn!(alert_id = %alert.id, error = %e, "Enrichment failed");
                    format!("analysis unavailable: {e}")
                }
            };

            // Keep an operator acknowledgment that happened meanwhile.
            let next = match engine.store.get_alert(&alert.id) {
                Ok(Some(current)) if current.status == AlertStatus::Acknowledged => {
                    AlertStatus::Acknowledged
                }
                _ => AlertStatus::New,
            };

            if let Err(e) = engine
                .store
                .set_alert_analysis(&alert.id, next, Some(&analysis))
            {
                warn!(alert_id = %alert.id, error = %e, "Could not store analysis");
            }
            engine.hub.broadcast(&ServerMessage::AlertsUpdated);
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alerts::{AlertRuleSpec, Notifications, Severity};
    use crate::mqtt::BrokerPool;
    use crate::sandbox::SandboxLimits;
    use crate::topic::TopicPattern;

    struct Rig {
        _dir: tempfile::TempDir,
        engine: Arc<AlertEngine>,
        store: Arc<Store>,
    }

    fn rig(debounce: Duration) -> Rig {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("alerts.db");
        let store = Arc::new(Store::open(&path, u64::MAX).unwrap());
        let pool = Arc::new(BrokerPool::new(&[]).unwrap());
        let hub = Arc::new(Hub::new(Arc::clone(&store), pool, 10));
        let sandbox = Sandbox::new(&path, SandboxLimits::default());
        let engine = AlertEngine::new(Arc::clone(&store), sandbox, hub, None, debounce).unwrap();
        Rig {
            _dir: dir,
            engine,
            store,
        }
    }

    fn rule_spec(pattern: &str, condition: &str) -> AlertRuleSpec {
        AlertRuleSpec {
            name: "high temp".to_string(),
            topic_pattern: TopicPattern::compile(pattern).unwrap(),
            severity: Severity::Warning,
            condition_code: condition.to_string(),
            workflow_prompt: None,
            notifications: Notifications::default(),
        }
    }

    #[tokio::test]
    async fn truthy_condition_raises_one_alert() {
        let rig = rig(Duration::from_secs(60));
        rig.store
            .insert_alert_rule(&rule_spec("f/+/temp", "return msg.payload.v > 70"))
            .unwrap();
        rig.engine.reload_rules().unwrap();

        rig.engine
            .process_event(&Event::new("b1", "f/1/temp", br#"{"v":80}"#.to_vec()))
            .await;

        let alerts = rig.store.list_alerts(10).unwrap();
        assert_eq!(alerts.len(), 1);
        assert_eq!(alerts[0].status, AlertStatus::New);
        assert_eq!(alerts[0].trigger_value["v"], 80);
    }

    #[tokio::test]
    async fn falsy_condition_never_alerts() {
        let rig = rig(Duration::from_secs(60));
        rig.store
            .insert_alert_rule(&rule_spec("f/+/temp", "return msg.payload.v > 70"))
            .unwrap();
        rig.engine.reload_rules().unwrap();

        for _ in 0..3 {
            rig.engine
                .process_event(&Event::new("b1", "f/1/temp", br#"{"v":20}"#.to_vec()))
                .await;
        }
        assert!(rig.store.list_alerts(10).unwrap().is_empty());
    }

    #[tokio::test]
    async fn debounce_updates_instead_of_inserting() {
        let rig = rig(Duration::from_secs(60));
        rig.store
            .insert_alert_rule(&rule_spec("f/+/temp", "return msg.payload.v > 70"))
            .unwrap();
        rig.engine.reload_rules().unwrap();

        for v in [80, 85, 90] {
            rig.engine
                .process_event(&Event::new(
                    "b1",
                    "f/1/temp",
                    format!(r#"{{"v":{v}}}"#).into_bytes(),
                ))
                .await;
        }

        let alerts = rig.store.list_alerts(10).unwrap();
        assert_eq!(alerts.len(), 1);
        // Refreshed with the last trigger value
        assert_eq!(alerts[0].trigger_value["v"], 90);
        assert!(alerts[0].updated_at >= alerts[0].created_at);
    }

    #[tokio::test]
    async fn zero_debounce_creates_separate_rows() {
        let rig = rig(Duration::ZERO);
        rig.store
            .insert_alert_rule(&rule_spec("f/+/temp", "return true"))
            .unwrap();
        rig.engine.reload_rules().unwrap();

        for _ in 0..2 {
            rig.engine
                .process_event(&Event::new("b1", "f/1/temp", br#"{}"#.to_vec()))
                .await;
        }
        assert_eq!(rig.store.list_alerts(10).unwrap().len(), 2);
    }

    #[tokio::test]
    async fn non_matching_topic_is_ignored() {
        let rig = rig(Duration::from_secs(60));
        rig.store
            .insert_alert_rule(&rule_spec("f/+/temp", "return true"))
            .unwrap();
        rig.engine.reload_rules().unwrap();

        rig.engine
            .process_event(&Event::new("b1", "g/1/pressure", br#"{}"#.to_vec()))
            .await;
        assert!(rig.store.list_alerts(10).unwrap().is_empty());
    }

    #[tokio::test]
    async fn failing_condition_suppresses_rule_only() {
        let rig = rig(Duration::from_secs(60));
        rig.store
            .insert_alert_rule(&rule_spec("f/#", "error('broken rule')"))
            .unwrap();
        rig.store
            .insert_alert_rule(&rule_spec("f/#", "return true"))
            .unwrap();
        rig.engine.reload_rules().unwrap();

        rig.engine
            .process_event(&Event::new("b1", "f/1/temp", br#"{}"#.to_vec()))
            .await;

        // The healthy rule still fired
        assert_eq!(rig.store.list_alerts(10).unwrap().len(), 1);
    }
}
