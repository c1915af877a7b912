//! API regression tests
//!
//! In-process tests that build the Axum app via `create_app()` and exercise
//! the HTTP surface with `tower::ServiceExt::oneshot()`. No binary spawn,
//! no network port, no broker.

use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use tower::ServiceExt;

use uns_gateway::agent::{AgentRunner, ToolCapabilities, ToolCatalog};
use uns_gateway::alerts::AlertEngine;
use uns_gateway::api::create_app;
use uns_gateway::config::AppConfig;
use uns_gateway::hub::Hub;
use uns_gateway::mapper::MapperEngine;
use uns_gateway::mqtt::BrokerPool;
use uns_gateway::sandbox::{Sandbox, SandboxLimits};
use uns_gateway::state::AppContext;
use uns_gateway::store::Store;
use uns_gateway::types::Event;

const ADMIN_TOKEN: &str = "admin-token";
const USER_TOKEN: &str = "user-token";

struct TestApp {
    _dir: tempfile::TempDir,
    app: axum::Router,
    store: Arc<Store>,
    alerts: Arc<AlertEngine>,
}

fn test_app() -> TestApp {
    let dir = tempfile::tempdir().unwrap();
    let db_path = dir.path().join("gateway.db");

    let config = AppConfig {
        listen_addr: "127.0.0.1:0".to_string(),
        base_path: String::new(),
        db_path: db_path.clone(),
        db_size_limit_bytes: u64::MAX,
        max_saved_mapper_versions: 10,
        mapper_max_hop: 4,
        alert_debounce: Duration::from_secs(60),
        sandbox_limits: SandboxLimits::default(),
        hub_rate_cap_per_sec: 10,
        chat_max_steps: 8,
        admin_token: Some(ADMIN_TOKEN.to_string()),
        brokers: Vec::new(),
        llm: None,
        tool_capabilities: ToolCapabilities::default(),
    };

    let store = Arc::new(Store::open(&db_path, config.db_size_limit_bytes).unwrap());
    store.ensure_user("admin", ADMIN_TOKEN, true).unwrap();
    store.ensure_user("alice", USER_TOKEN, false).unwrap();

    let pool = Arc::new(BrokerPool::new(&config.brokers).unwrap());
    let hub = Arc::new(Hub::new(Arc::clone(&store), Arc::clone(&pool), 10));
    let sandbox = Sandbox::new(&db_path, config.sandbox_limits);
    let (ingest_tx, _ingest_rx) = tokio::sync::mpsc::channel(64);

    let mapper = Arc::new(
        MapperEngine::new(
            Arc::clone(&store),
            Arc::clone(&pool),
            sandbox.clone(),
            Arc::clone(&hub),
            ingest_tx,
            config.mapper_max_hop,
            config.max_saved_mapper_versions,
        )
        .unwrap(),
    );
    let alerts = AlertEngine::new(
        Arc::clone(&store),
        sandbox.clone(),
        Arc::clone(&hub),
        None,
        config.alert_debounce,
    )
    .unwrap();
    let catalog = Arc::new(ToolCatalog::build(
        Arc::clone(&store),
        Arc::clone(&pool),
        Arc::clone(&mapper),
        sandbox.clone(),
        config.tool_capabilities,
    ));
    let agent = Arc::new(AgentRunner::new(
        None,
        catalog,
        Arc::clone(&store),
        Arc::clone(&hub),
        config.chat_max_steps,
    ));

    let ctx = AppContext {
        config: Arc::new(config),
        store: Arc::clone(&store),
        pool,
        hub,
        mapper,
        alerts: Arc::clone(&alerts),
        sandbox,
        agent,
        started_at: chrono::Utc::now(),
    };

    TestApp {
        _dir: dir,
        app: create_app(ctx),
        store,
        alerts,
    }
}

fn get(path: &str, token: &str) -> Request<Body> {
    Request::builder()
        .uri(path)
        .header("authorization", format!("Bearer {token}"))
        .body(Body::empty())
        .unwrap()
}

fn post_json(path: &str, token: &str, body: serde_json::Value) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(path)
        .header("authorization", format!("Bearer {token}"))
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

async fn body_json(response: axum::response::Response) -> serde_json::Value {
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

#[tokio::test]
async fn missing_credentials_is_401() {
    let t = test_app();
    let response = t
        .app
        .oneshot(Request::get("/context/status").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn unknown_token_is_401() {
    let t = test_app();
    let response = t
        .app
        .oneshot(get("/context/status", "bogus"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn status_reports_db_and_connections() {
    let t = test_app();
    let response = t
        .app
        .oneshot(get("/context/status", USER_TOKEN))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let v = body_json(response).await;
    assert!(v["data"]["db"]["total_rows"].is_number());
    assert_eq!(v["data"]["db"]["pruning_active"], false);
    assert!(v["data"]["simulators"].as_array().unwrap().is_empty());
}

#[tokio::test]
async fn short_search_query_is_400() {
    let t = test_app();
    let response = t
        .app
        .oneshot(get("/context/search?q=a", USER_TOKEN))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn topic_latest_404_when_empty() {
    let t = test_app();
    let response = t
        .app
        .oneshot(get("/context/topic/plant/a/temp", USER_TOKEN))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn topic_history_caps_limit() {
    let t = test_app();
    for i in 0..5 {
        t.store
            .append_event(&Event::new("b1", "a/b", format!("{i}").into_bytes()))
            .unwrap();
    }

    let response = t
        .app
        .oneshot(get("/context/history/a/b?limit=10001", USER_TOKEN))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let v = body_json(response).await;
    let events = v["data"].as_array().unwrap();
    assert!(events.len() <= 1_000);
    assert_eq!(events.len(), 5);
}

#[tokio::test]
async fn prune_topic_is_admin_only() {
    let t = test_app();
    let body = serde_json::json!({"pattern": "a/#"});

    let response = t
        .app
        .clone()
        .oneshot(post_json("/context/prune-topic", USER_TOKEN, body.clone()))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::FORBIDDEN);

    let response = t
        .app
        .oneshot(post_json("/context/prune-topic", ADMIN_TOKEN, body))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn mapper_config_rejects_sparkplug_output() {
    let t = test_app();

    // Read the current config, add a forbidden rule
    let response = t
        .app
        .clone()
        .oneshot(get("/mapper/config", USER_TOKEN))
        .await
        .unwrap();
    let mut config = body_json(response).await["data"].clone();
    config["versions"][0]["rules"] = serde_json::json!([{
        "source_topic": "plant/x",
        "targets": [{
            "id": "tgt_1",
            "enabled": true,
            "output_topic": "spBv1.0/y",
            "target_broker_id": null,
            "code": "return msg"
        }]
    }]);

    let response = t
        .app
        .clone()
        .oneshot(post_json("/mapper/config", USER_TOKEN, config))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);

    // No rule was added
    let response = t
        .app
        .oneshot(get("/mapper/config", USER_TOKEN))
        .await
        .unwrap();
    let v = body_json(response).await;
    assert!(v["data"]["versions"][0]["rules"].as_array().unwrap().is_empty());
}

#[tokio::test]
async fn mapper_config_round_trip_is_stable() {
    let t = test_app();

    let response = t
        .app
        .clone()
        .oneshot(get("/mapper/config", USER_TOKEN))
        .await
        .unwrap();
    let mut config = body_json(response).await["data"].clone();
    config["versions"][0]["rules"] = serde_json::json!([{
        "source_topic": "plant/a/temp",
        "targets": [{
            "id": "tgt_1",
            "enabled": true,
            "output_topic": "uns/a/temp_c",
            "target_broker_id": null,
            "code": "return msg"
        }]
    }]);

    let response = t
        .app
        .clone()
        .oneshot(post_json("/mapper/config", USER_TOKEN, config.clone()))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let response = t
        .app
        .oneshot(get("/mapper/config", USER_TOKEN))
        .await
        .unwrap();
    let loaded = body_json(response).await["data"].clone();
    assert_eq!(loaded["versions"][0]["rules"], config["versions"][0]["rules"]);
}

#[tokio::test]
async fn alert_rule_crud_and_transition_conflict() {
    let t = test_app();

    // Create a rule
    let response = t
        .app
        .clone()
        .oneshot(post_json(
            "/alerts/rules",
            USER_TOKEN,
            serde_json::json!({
                "name": "high temp",
                "topic_pattern": "f/+/temp",
                "severity": "warning",
                "condition_code": "return msg.payload.v > 70"
            }),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::CREATED);

    // Trigger it through the engine
    t.alerts
        .process_event(&Event::new("b1", "f/1/temp", br#"{"v":80}"#.to_vec()))
        .await;

    let response = t
        .app
        .clone()
        .oneshot(get("/alerts/active", USER_TOKEN))
        .await
        .unwrap();
    let v = body_json(response).await;
    let alerts = v["data"].as_array().unwrap();
    assert_eq!(alerts.len(), 1);
    let alert_id = alerts[0]["id"].as_str().unwrap().to_string();

    // new -> resolved
    let response = t
        .app
        .clone()
        .oneshot(post_json(
            &format!("/alerts/{alert_id}/status"),
            USER_TOKEN,
            serde_json::json!({"status": "resolved"}),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    // resolved is absorbing: 409
    let response = t
        .app
        .oneshot(post_json(
            &format!("/alerts/{alert_id}/status"),
            USER_TOKEN,
            serde_json::json!({"status": "acknowledged"}),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::CONFLICT);
}

#[tokio::test]
async fn publish_to_unknown_broker_is_400() {
    let t = test_app();
    let response = t
        .app
        .oneshot(post_json(
            "/publish/message",
            USER_TOKEN,
            serde_json::json!({"broker_id": "nope", "topic": "a/b", "payload": {"v": 1}}),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn chat_completion_without_llm_is_503() {
    let t = test_app();
    let response = t
        .app
        .oneshot(post_json(
            "/chat/completion",
            USER_TOKEN,
            serde_json::json!({"message": "hello"}),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
}

#[tokio::test]
async fn chat_sessions_are_scoped_to_their_user() {
    let t = test_app();
    t.store
        .put_session(
            "s1",
            "someone-else",
            &[uns_gateway::store::sessions::ChatMessage {
                role: "user".to_string(),
                content: serde_json::json!("secret"),
                tool_calls: None,
                tool_call_id: None,
                name: None,
            }],
        )
        .unwrap();

    // Another user cannot see it
    let response = t
        .app
        .clone()
        .oneshot(get("/chat/session/s1", USER_TOKEN))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);

    // Admin can
    let response = t
        .app
        .oneshot(get("/chat/session/s1", ADMIN_TOKEN))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn admin_users_listing() {
    let t = test_app();

    let response = t
        .app
        .clone()
        .oneshot(get("/admin/users", USER_TOKEN))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::FORBIDDEN);

    let response = t
        .app
        .oneshot(get("/admin/users", ADMIN_TOKEN))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let v = body_json(response).await;
    assert_eq!(v["data"].as_array().unwrap().len(), 2);
}
