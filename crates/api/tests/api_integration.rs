//! Integration tests for the API server.

use std::sync::{Arc, OnceLock};

use axum::body::Body;
use axum::http::{Request, StatusCode};
use common::CorrelationId;
use event_store::InMemoryEventStore;
use metrics_exporter_prometheus::PrometheusHandle;
use saga::financing::InMemoryFinancingServices;
use saga::{EngineConfig, InMemoryDedupeLedger, InMemoryWaitRegistry, RetryPolicy, WaitRegistry};
use serde_json::{Value, json};
use tower::ServiceExt;

static METRICS_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

fn get_metrics_handle() -> PrometheusHandle {
    METRICS_HANDLE
        .get_or_init(|| {
            let builder = metrics_exporter_prometheus::PrometheusBuilder::new();
            builder
                .install_recorder()
                .expect("failed to install Prometheus recorder")
        })
        .clone()
}

fn engine_config() -> EngineConfig {
    EngineConfig {
        retry: RetryPolicy::immediate(3),
        compensation_retry: RetryPolicy::immediate(3),
        ..EngineConfig::default()
    }
}

fn setup() -> (axum::Router, InMemoryFinancingServices) {
    let (state, services) =
        api::create_default_state(InMemoryEventStore::new(), engine_config()).unwrap();
    (api::create_app(state, get_metrics_handle()), services)
}

fn application(invoice_id: &str) -> Value {
    json!({
        "definition_id": "invoice-financing",
        "context": {
            "invoice_id": invoice_id,
            "amount_cents": 250_000,
            "seller_account": "ACCT-42",
        }
    })
}

async fn send(app: &axum::Router, request: Request<Body>) -> (StatusCode, Value) {
    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let body = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let json = if body.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&body).unwrap()
    };
    (status, json)
}

fn post(uri: &str, body: &Value) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(uri)
        .header("content-type", "application/json")
        .body(Body::from(serde_json::to_string(body).unwrap()))
        .unwrap()
}

fn get(uri: &str) -> Request<Body> {
    Request::builder().uri(uri).body(Body::empty()).unwrap()
}

/// Starts an application and returns its instance id and correlation id.
async fn start_parked(app: &axum::Router, invoice_id: &str) -> (String, String) {
    let (status, json) = send(app, post("/workflows/start", &application(invoice_id))).await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(json["status"], "AWAITING_EVENT");
    let instance_id = json["instance_id"].as_str().unwrap().to_string();

    let (_, view) = send(app, get(&format!("/instances/{instance_id}"))).await;
    let correlation_id = view["awaiting"]["correlation_id"]
        .as_str()
        .unwrap()
        .to_string();
    (instance_id, correlation_id)
}

#[tokio::test]
async fn test_health_check() {
    let (app, _) = setup();

    let (status, json) = send(&app, get("/health")).await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["status"], "ok");
    assert_eq!(json["pending_waits"], 0);
}

#[tokio::test]
async fn test_start_parks_on_offers() {
    let (app, _) = setup();
    let (instance_id, correlation_id) = start_parked(&app, "INV-A1").await;

    let (status, view) = send(&app, get(&format!("/instances/{instance_id}"))).await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(view["status"], "AWAITING_EVENT");
    assert_eq!(view["definition_id"], "invoice-financing");
    assert_eq!(view["awaiting"]["step_name"], "request_offers");
    assert!(correlation_id.contains("INV-A1"));
    let history = view["history"].as_array().unwrap();
    assert_eq!(history[0]["step_name"], "lock_invoice");

    let (_, health) = send(&app, get("/health")).await;
    assert_eq!(health["pending_waits"], 1);
}

#[tokio::test]
async fn test_resume_completes_and_second_resume_is_unknown() {
    let (app, services) = setup();
    let (instance_id, correlation_id) = start_parked(&app, "INV-A2").await;
    let resume = json!({
        "correlation_id": correlation_id,
        "payload": { "offer_id": "OFFER-7", "rate_bps": 180 }
    });

    let (status, json) = send(&app, post("/workflows/resume", &resume)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["status"], "COMPLETED");
    assert_eq!(json["instance_id"], instance_id.as_str());
    assert_eq!(services.payments.effects(), 1);

    let (status, json) = send(&app, post("/workflows/resume", &resume)).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(json["code"], "UNKNOWN_CORRELATION");
    assert_eq!(services.payments.effects(), 1);
}

#[tokio::test]
async fn test_expired_token_is_gone() {
    let waits = Arc::new(InMemoryWaitRegistry::new());
    let (state, _) = api::create_state(
        InMemoryEventStore::new(),
        waits.clone(),
        Arc::new(InMemoryDedupeLedger::new()),
        engine_config(),
    )
    .unwrap();
    let app = api::create_app(state, get_metrics_handle());
    let (_, correlation_id) = start_parked(&app, "INV-A3").await;

    let correlation_id = CorrelationId::new(correlation_id);
    let mut token = waits.take(&correlation_id).await.unwrap().unwrap();
    token.expires_at = chrono::Utc::now() - chrono::Duration::seconds(1);
    waits.register(token).await.unwrap();

    let resume = json!({ "correlation_id": correlation_id.as_str(), "payload": {} });
    let (status, json) = send(&app, post("/workflows/resume", &resume)).await;

    assert_eq!(status, StatusCode::GONE);
    assert_eq!(json["code"], "EXPIRED_TOKEN");
}

#[tokio::test]
async fn test_cancel_then_cancel_again_conflicts() {
    let (app, services) = setup();
    let (instance_id, _) = start_parked(&app, "INV-A4").await;
    let cancel = json!({ "instance_id": instance_id, "reason": "seller withdrew" });

    let (status, json) = send(&app, post("/workflows/cancel", &cancel)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["status"], "FAILED");

    let (_, view) = send(&app, get(&format!("/instances/{instance_id}"))).await;
    assert_eq!(view["failure_reason"], "cancelled: seller withdrew");
    assert!(view["awaiting"].is_null());
    assert!(!services.invoices.is_locked("INV-A4"));

    let (status, json) = send(&app, post("/workflows/cancel", &cancel)).await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(json["code"], "INVALID_STATE");
}

#[tokio::test]
async fn test_unknown_definition_is_not_found() {
    let (app, _) = setup();
    let body = json!({ "definition_id": "mortgage", "context": {} });

    let (status, json) = send(&app, post("/workflows/start", &body)).await;

    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(json["code"], "UNKNOWN_DEFINITION");
}

#[tokio::test]
async fn test_malformed_requests_are_bad_requests() {
    let (app, _) = setup();

    let request = Request::builder()
        .method("POST")
        .uri("/workflows/start")
        .header("content-type", "application/json")
        .body(Body::from("{not json"))
        .unwrap();
    let (status, json) = send(&app, request).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(json["code"], "BAD_REQUEST");

    let (status, json) = send(&app, get("/instances/not-a-uuid")).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(json["code"], "BAD_REQUEST");

    let cancel = json!({ "instance_id": "nope" });
    let (status, _) = send(&app, post("/workflows/cancel", &cancel)).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_unknown_instance_is_not_found() {
    let (app, _) = setup();
    let id = uuid::Uuid::new_v4();

    let (status, json) = send(&app, get(&format!("/instances/{id}"))).await;

    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(json["code"], "INSTANCE_NOT_FOUND");
}

#[tokio::test]
async fn test_instance_at_version() {
    let (app, _) = setup();
    let (instance_id, _) = start_parked(&app, "INV-A5").await;

    let (status, view) = send(&app, get(&format!("/instances/{instance_id}?at_version=1"))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(view["status"], "RUNNING");
    assert_eq!(view["history"].as_array().unwrap().len(), 0);

    let (status, json) = send(&app, get(&format!("/instances/{instance_id}?at_version=0"))).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(json["code"], "BAD_REQUEST");
}

#[tokio::test]
async fn test_list_active_instances() {
    let (app, _) = setup();
    let (parked, _) = start_parked(&app, "INV-A6").await;
    let (cancelled, _) = start_parked(&app, "INV-A7").await;
    send(&app, post("/workflows/cancel", &json!({ "instance_id": cancelled }))).await;

    let (status, json) = send(&app, get("/instances")).await;
    assert_eq!(status, StatusCode::OK);
    let instances = json.as_array().unwrap();
    assert_eq!(instances.len(), 1);
    assert_eq!(instances[0]["instance_id"], parked.as_str());
    assert_eq!(instances[0]["status"], "AWAITING_EVENT");
    assert!(!instances[0]["awaiting"].is_null());

    let (_, json) = send(&app, get("/instances?status=AWAITING_EVENT")).await;
    assert_eq!(json.as_array().unwrap().len(), 1);

    let (_, json) = send(&app, get("/instances?status=RUNNING")).await;
    assert!(json.as_array().unwrap().is_empty());
}

#[tokio::test]
async fn test_operator_queue_lists_reconciliation() {
    let (app, services) = setup();
    services.lenders.lose_next_accept_responses(1);
    let (instance_id, correlation_id) = start_parked(&app, "INV-A8").await;

    let (_, json) = send(&app, get("/operator-queue")).await;
    assert!(json.as_array().unwrap().is_empty());

    let resume = json!({
        "correlation_id": correlation_id,
        "payload": { "offer_id": "OFFER-7", "rate_bps": 180 }
    });
    let (status, json) = send(&app, post("/workflows/resume", &resume)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["status"], "COMPENSATION_FAILED");

    let (status, json) = send(&app, get("/operator-queue")).await;
    assert_eq!(status, StatusCode::OK);
    let entries = json.as_array().unwrap();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0]["instance_id"], instance_id.as_str());
    assert_eq!(entries[0]["failed_steps"], json!(["accept_offer"]));
}

#[tokio::test]
async fn test_metrics_endpoint() {
    let (app, _) = setup();
    start_parked(&app, "INV-A9").await;

    let response = app.oneshot(get("/metrics")).await.unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let body = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let text = String::from_utf8(body.to_vec()).unwrap();
    assert!(text.contains("workflow_pending_waits"));
    assert!(text.contains("workflow_instances_started_total"));
}
