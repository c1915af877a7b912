//! Pipeline regression tests
//!
//! Wire the ingest loop, mapper engine and alert engine together over the
//! real fan-out channels (no broker, no HTTP) and drive end-to-end
//! scenarios through the internal path.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use uns_gateway::alerts::AlertEngine;
use uns_gateway::hub::Hub;
use uns_gateway::ingest;
use uns_gateway::mapper::{MapperEngine, Rule, Target};
use uns_gateway::mqtt::BrokerPool;
use uns_gateway::sandbox::{Sandbox, SandboxLimits};
use uns_gateway::store::Store;
use uns_gateway::topic::TopicPattern;
use uns_gateway::types::Event;

struct Pipeline {
    _dir: tempfile::TempDir,
    store: Arc<Store>,
    mapper: Arc<MapperEngine>,
    alerts: Arc<AlertEngine>,
    ingest_tx: tokio::sync::mpsc::Sender<Event>,
    cancel: CancellationToken,
}

impl Pipeline {
    async fn start() -> Self {
        let dir = tempfile::tempdir().unwrap();
        let db_path = dir.path().join("pipeline.db");
        let store = Arc::new(Store::open(&db_path, u64::MAX).unwrap());
        let pool = Arc::new(BrokerPool::new(&[]).unwrap());
        let hub = Arc::new(Hub::new(Arc::clone(&store), Arc::clone(&pool), 10));
        let sandbox = Sandbox::new(&db_path, SandboxLimits::default());

        let (ingest_tx, ingest_rx, fanout) = ingest::channels();
        let cancel = CancellationToken::new();

        let mapper = Arc::new(
            MapperEngine::new(
                Arc::clone(&store),
                Arc::clone(&pool),
                sandbox.clone(),
                Arc::clone(&hub),
                ingest_tx.clone(),
                4,
                10,
            )
            .unwrap(),
        );
        let alerts = AlertEngine::new(
            Arc::clone(&store),
            sandbox,
            Arc::clone(&hub),
            None,
            Duration::from_secs(60),
        )
        .unwrap();

        tokio::spawn(ingest::run_ingest(
            Arc::clone(&store),
            ingest_rx,
            fanout.clone(),
            cancel.clone(),
        ));
        tokio::spawn(Arc::clone(&mapper).run(fanout.subscribe(), cancel.clone()));
        tokio::spawn(Arc::clone(&alerts).run(fanout.subscribe(), cancel.clone()));

        Self {
            _dir: dir,
            store,
            mapper,
            alerts,
            ingest_tx,
            cancel,
        }
    }

    async fn inject(&self, topic: &str, payload: &[u8]) {
        self.ingest_tx
            .send(Event::new("b1", topic, payload.to_vec()))
            .await
            .unwrap();
    }

    /// Wait until `check` passes or a deadline expires.
    async fn eventually<F: Fn() -> bool>(&self, check: F) -> bool {
        for _ in 0..100 {
            if check() {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        check()
    }
}

impl Drop for Pipeline {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

#[tokio::test]
async fn inbound_events_are_stored() {
    let p = Pipeline::start().await;
    p.inject("plant/a/temp", br#"{"value":22.5}"#).await;

    assert!(
        p.eventually(|| p
            .store
            .get_latest(Some("b1"), "plant/a/temp")
            .unwrap()
            .is_some())
            .await
    );
}

#[tokio::test]
async fn mapper_rule_fires_once_per_matching_event() {
    let p = Pipeline::start().await;

    let mut config = p.mapper.config();
    let rule = Rule {
        source_topic: "plant/a/temp".to_string(),
        targets: vec![Target::new("uns/a/temp_c", "return msg")],
    };
    let target_id = rule.targets[0].id.clone();
    config.versions[0].rules.push(rule);
    p.mapper.replace_config(config).await.unwrap();

    p.inject("plant/a/temp", br#"{"value":22.5}"#).await;

    let metrics = p.mapper.metrics();
    assert!(
        p.eventually(|| metrics.count("plant/a/temp", &target_id) == 1)
            .await,
        "expected exactly one sandbox invocation"
    );

    // A non-matching topic does not touch the counter
    p.inject("plant/b/temp", br#"{"value":1}"#).await;
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(metrics.count("plant/a/temp", &target_id), 1);
}

#[tokio::test]
async fn script_timeout_is_isolated_from_the_pipeline() {
    let p = Pipeline::start().await;

    let mut config = p.mapper.config();
    let rule = Rule {
        source_topic: "plant/slow".to_string(),
        targets: vec![Target::new("uns/slow", "while true do end")],
    };
    let target_id = rule.targets[0].id.clone();
    config.versions[0].rules.push(rule);
    p.mapper.replace_config(config).await.unwrap();

    p.inject("plant/slow", br#"{}"#).await;

    let metrics = p.mapper.metrics();
    assert!(
        p.eventually(|| metrics.count("plant/slow", &target_id) == 1)
            .await
    );
    let snapshot = metrics.snapshot();
    let entry = snapshot.iter().find(|t| t.target_id == target_id).unwrap();
    assert_eq!(entry.logs[0].error.as_deref(), Some("Timeout"));

    // A second, unrelated message flows through normally
    p.inject("plant/ok", br#"{"v":1}"#).await;
    assert!(
        p.eventually(|| p.store.get_latest(None, "plant/ok").unwrap().is_some())
            .await
    );
}

#[tokio::test]
async fn alert_debounce_keeps_one_row_across_bursts() {
    let p = Pipeline::start().await;

    p.store
        .insert_alert_rule(&uns_gateway::alerts::AlertRuleSpec {
            name: "hot".to_string(),
            topic_pattern: TopicPattern::compile("f/+/temp").unwrap(),
            severity: uns_gateway::alerts::Severity::Warning,
            condition_code: "return msg.payload.v > 70".to_string(),
            workflow_prompt: None,
            notifications: uns_gateway::alerts::Notifications::default(),
        })
        .unwrap();
    p.alerts.reload_rules().unwrap();

    for _ in 0..3 {
        p.inject("f/1/temp", br#"{"v":80}"#).await;
    }

    assert!(
        p.eventually(|| p.store.list_alerts(10).unwrap().len() == 1)
            .await
    );
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(p.store.list_alerts(10).unwrap().len(), 1);
}

#[tokio::test]
async fn prune_then_range_scenario() {
    let p = Pipeline::start().await;

    for i in 0..10 {
        p.inject("a/1/x", format!("{i}").as_bytes()).await;
        p.inject("a/2/x", format!("{i}").as_bytes()).await;
    }
    assert!(
        p.eventually(|| {
            p.store
                .range(
                    chrono::Utc::now() - chrono::Duration::hours(1),
                    chrono::Utc::now() + chrono::Duration::hours(1),
                    None,
                    None,
                )
                .unwrap()
                .len()
                == 20
        })
        .await
    );

    let pattern = TopicPattern::compile("a/1/#").unwrap();
    assert_eq!(p.store.prune_pattern(&pattern, None).unwrap(), 10);

    let all = TopicPattern::compile("a/#").unwrap();
    let remaining = p
        .store
        .range(
            chrono::Utc::now() - chrono::Duration::hours(1),
            chrono::Utc::now() + chrono::Duration::hours(1),
            Some(&all),
            None,
        )
        .unwrap();
    assert_eq!(remaining.len(), 10);
    assert!(remaining.iter().all(|e| e.topic == "a/2/x"));
}
