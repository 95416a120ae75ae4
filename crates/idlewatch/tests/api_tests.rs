//! Integration tests for the idlewatch API endpoints

use async_trait::async_trait;
use axum::{
    body::Body,
    http::{Request, StatusCode},
    Router,
};
use idle_lib::{
    admin::{AdminService, StatusBoard},
    audit::AuditLog,
    detector::StaticInventory,
    executor::{ActionExecutor, ExecutorConfig, LifecycleActions, TransitionResult},
    health::{components, HealthRegistry},
    models::{AuditEntry, AuditOutcome, Instance},
    policy::{PolicyConfig, PolicyResolver},
    state::{MemoryStateStore, StateStore, StateSync, SyncConfig},
};
use idlewatch::api::{create_router, AppState};
use std::sync::Arc;
use std::time::Duration;
use tower::ServiceExt;

struct AcceptingPlatform;

#[async_trait]
impl LifecycleActions for AcceptingPlatform {
    async fn stop(&self, _instance: &Instance) -> TransitionResult {
        TransitionResult::Accepted
    }

    async fn hibernate(&self, _instance: &Instance) -> TransitionResult {
        TransitionResult::Unsupported("hibernation not configured".to_string())
    }
}

struct TestApp {
    router: Router,
    health: HealthRegistry,
    store: Arc<dyn StateStore>,
    audit: Arc<AuditLog>,
}

fn sync_config() -> SyncConfig {
    SyncConfig {
        claim_settle: Duration::from_millis(5),
        ..SyncConfig::default()
    }
}

async fn setup_test_app() -> TestApp {
    let health = HealthRegistry::new();
    health.register(components::FLEET_DETECTOR).await;
    health.register(components::EXECUTOR).await;

    let store: Arc<dyn StateStore> = Arc::new(MemoryStateStore::new());
    let audit = Arc::new(AuditLog::in_memory());
    let executor = ActionExecutor::new(
        StateSync::new(store.clone(), "fleet-detector", sync_config()),
        Arc::new(AcceptingPlatform),
        audit.clone(),
        ExecutorConfig::default(),
    );
    let admin = AdminService::new(
        Arc::new(StaticInventory::new(vec![Instance::new("i-1")])),
        Arc::new(PolicyResolver::new(PolicyConfig::default()).unwrap()),
        StateSync::new(store.clone(), "operator", sync_config()),
        audit.clone(),
        Arc::new(StatusBoard::new()),
    )
    .with_executor(Arc::new(executor));

    let state = Arc::new(AppState::new(health.clone()).with_admin(Arc::new(admin)));
    TestApp {
        router: create_router(state),
        health,
        store,
        audit,
    }
}

async fn send(router: Router, request: Request<Body>) -> (StatusCode, serde_json::Value) {
    let response = router.oneshot(request).await.unwrap();
    let status = response.status();
    let body = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let json = if body.is_empty() {
        serde_json::Value::Null
    } else {
        serde_json::from_slice(&body).unwrap_or(serde_json::Value::Null)
    };
    (status, json)
}

fn get(uri: &str) -> Request<Body> {
    Request::builder().uri(uri).body(Body::empty()).unwrap()
}

fn post_json(uri: &str, body: serde_json::Value) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(uri)
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

#[tokio::test]
async fn test_healthz_returns_ok_when_healthy() {
    let app = setup_test_app().await;

    let (status, health) = send(app.router, get("/healthz")).await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(health["status"], "healthy");
}

#[tokio::test]
async fn test_healthz_returns_ok_when_degraded() {
    let app = setup_test_app().await;
    app.health
        .record_failure(components::EXECUTOR, "stop command failed")
        .await;

    let (status, health) = send(app.router, get("/healthz")).await;

    // Degraded still returns 200 (operational)
    assert_eq!(status, StatusCode::OK);
    assert_eq!(health["status"], "degraded");
}

#[tokio::test]
async fn test_healthz_returns_503_when_unhealthy() {
    let app = setup_test_app().await;
    for _ in 0..3 {
        app.health
            .record_failure(components::FLEET_DETECTOR, "inventory unavailable")
            .await;
    }

    let (status, health) = send(app.router, get("/healthz")).await;

    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(health["status"], "unhealthy");
    assert_eq!(
        health["components"]["fleet_detector"]["consecutive_failures"],
        3
    );
}

#[tokio::test]
async fn test_readyz_follows_registry() {
    let app = setup_test_app().await;

    let (status, readiness) = send(app.router.clone(), get("/readyz")).await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(readiness["ready"], false);

    app.health.set_ready(true).await;
    let (status, _) = send(app.router, get("/readyz")).await;
    assert_eq!(status, StatusCode::OK);
}

#[tokio::test]
async fn test_metrics_endpoint_serves_text() {
    let app = setup_test_app().await;
    idle_lib::observability::IdleMetrics::new().inc_unreachable();

    let response = app.router.oneshot(get("/metrics")).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let body = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let text = String::from_utf8(body.to_vec()).unwrap();
    assert!(text.contains("idlewatch_"));
}

#[tokio::test]
async fn test_unknown_instance_returns_404() {
    let app = setup_test_app().await;

    let (status, body) = send(app.router, get("/v1/instances/i-missing")).await;

    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["kind"], "instance_not_found");
}

#[tokio::test]
async fn test_override_then_inspect() {
    let app = setup_test_app().await;

    let (status, record) = send(
        app.router.clone(),
        post_json(
            "/v1/instances/i-1/override",
            serde_json::json!({"idle_status": "idle", "idle_action": "notified", "reason": "manual"}),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(record["idle_action"], "notified");
    assert_eq!(record["last_writer"], "operator");

    let (status, view) = send(app.router, get("/v1/instances/i-1")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(view["record"]["idle_status"], "idle");
    assert_eq!(view["profile"]["name"], "standard");
}

#[tokio::test]
async fn test_invalid_override_returns_400() {
    let app = setup_test_app().await;

    let (status, body) = send(
        app.router,
        post_json(
            "/v1/instances/i-1/override",
            serde_json::json!({"idle_status": "active", "idle_action": "stopped"}),
        ),
    )
    .await;

    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["kind"], "invalid_request");
}

#[tokio::test]
async fn test_trigger_action_stops_instance() {
    let app = setup_test_app().await;

    let (status, body) = send(
        app.router,
        post_json(
            "/v1/instances/i-1/actions",
            serde_json::json!({"action": "hibernate", "reason": "end of project"}),
        ),
    )
    .await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["outcome"], "completed");
    assert_eq!(body["final_state"], "stopped");
    assert_eq!(body["fallback"], true);

    let record = app.store.load("i-1").await.unwrap().unwrap();
    assert_eq!(record.idle_action.to_string(), "stopped");
}

#[tokio::test]
async fn test_audit_query_filters_by_range() {
    let app = setup_test_app().await;
    let mut old = AuditEntry::new("i-1", "fleet-detector", AuditOutcome::Classified, "quiet");
    old.timestamp = chrono::Utc::now() - chrono::Duration::hours(3);
    app.audit.record(old).await;
    app.audit
        .record(AuditEntry::new(
            "i-1",
            "fleet-detector",
            AuditOutcome::Classified,
            "busy",
        ))
        .await;

    let (status, all) = send(app.router.clone(), get("/v1/instances/i-1/audit")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(all.as_array().unwrap().len(), 2);

    let from = (chrono::Utc::now() - chrono::Duration::hours(1))
        .to_rfc3339_opts(chrono::SecondsFormat::Secs, true);
    let (status, recent) = send(
        app.router,
        get(&format!("/v1/instances/i-1/audit?from={}", from)),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let recent = recent.as_array().unwrap();
    assert_eq!(recent.len(), 1);
    assert_eq!(recent[0]["reason"], "busy");
}

#[tokio::test]
async fn test_admin_routes_disabled_without_admin() {
    let router = create_router(Arc::new(AppState::new(HealthRegistry::new())));

    let (status, body) = send(router, get("/v1/instances")).await;

    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["kind"], "admin_disabled");
}
