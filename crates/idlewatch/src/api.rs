//! HTTP API for health checks, Prometheus metrics and operator actions

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use chrono::{DateTime, Utc};
use idle_lib::{
    admin::AdminService,
    executor::ActionOutcome,
    health::{ComponentStatus, HealthRegistry},
    models::{ActionKind, IdleAction, IdleStatus},
    IdleError,
};
use prometheus::{Encoder, TextEncoder};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{error, info};

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub health_registry: HealthRegistry,
    /// Absent in agent mode, where only health and metrics are served
    pub admin: Option<Arc<AdminService>>,
}

impl AppState {
    pub fn new(health_registry: HealthRegistry) -> Self {
        Self {
            health_registry,
            admin: None,
        }
    }

    pub fn with_admin(mut self, admin: Arc<AdminService>) -> Self {
        self.admin = Some(admin);
        self
    }

    fn admin(&self) -> Result<&Arc<AdminService>, ApiError> {
        self.admin.as_ref().ok_or(ApiError::AdminDisabled)
    }
}

/// Error body returned by every admin endpoint
#[derive(Debug, Serialize)]
struct ErrorBody {
    error: String,
    kind: &'static str,
}

pub enum ApiError {
    AdminDisabled,
    Idle(IdleError),
}

impl From<IdleError> for ApiError {
    fn from(e: IdleError) -> Self {
        ApiError::Idle(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, body) = match self {
            ApiError::AdminDisabled => (
                StatusCode::NOT_FOUND,
                ErrorBody {
                    error: "admin endpoints are not served in this mode".to_string(),
                    kind: "admin_disabled",
                },
            ),
            ApiError::Idle(e) => {
                let status = match &e {
                    IdleError::InstanceNotFound(_) => StatusCode::NOT_FOUND,
                    IdleError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
                    IdleError::WriteConflict { .. } => StatusCode::CONFLICT,
                    IdleError::Unreachable { .. } | IdleError::Timeout { .. } => {
                        StatusCode::SERVICE_UNAVAILABLE
                    }
                    IdleError::ActionFailed { .. } | IdleError::UnsupportedAction { .. } => {
                        StatusCode::BAD_GATEWAY
                    }
                    _ => StatusCode::INTERNAL_SERVER_ERROR,
                };
                if status == StatusCode::INTERNAL_SERVER_ERROR {
                    error!(error = %e, "Admin request failed");
                }
                (
                    status,
                    ErrorBody {
                        error: e.to_string(),
                        kind: e.kind(),
                    },
                )
            }
        };
        (status, Json(body)).into_response()
    }
}

/// Health check response - returns 200 if healthy, 503 if unhealthy
async fn healthz(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let health = state.health_registry.health().await;

    let status_code = match health.status {
        ComponentStatus::Healthy => StatusCode::OK,
        ComponentStatus::Degraded => StatusCode::OK, // Still operational
        ComponentStatus::Unhealthy => StatusCode::SERVICE_UNAVAILABLE,
    };

    (status_code, Json(health))
}

/// Readiness check response - returns 200 if ready, 503 if not ready
async fn readyz(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let readiness = state.health_registry.readiness().await;

    let status_code = if readiness.ready {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    (status_code, Json(readiness))
}

/// Prometheus metrics endpoint
async fn metrics() -> Response {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();

    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        error!(error = %e, "Failed to encode metrics");
        return StatusCode::INTERNAL_SERVER_ERROR.into_response();
    }

    (
        StatusCode::OK,
        [("content-type", "text/plain; charset=utf-8")],
        buffer,
    )
        .into_response()
}

async fn list_instances(State(state): State<Arc<AppState>>) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(state.admin()?.list().await))
}

async fn get_instance(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(state.admin()?.status(&id).await?))
}

#[derive(Debug, Deserialize)]
pub struct AuditQuery {
    pub from: Option<DateTime<Utc>>,
    pub to: Option<DateTime<Utc>>,
}

async fn get_audit(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Query(range): Query<AuditQuery>,
) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(state.admin()?.audit(&id, range.from, range.to).await?))
}

#[derive(Debug, Deserialize)]
pub struct OverrideRequest {
    pub idle_status: IdleStatus,
    #[serde(default)]
    pub idle_action: IdleAction,
    #[serde(default)]
    pub reason: String,
}

async fn override_state(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Json(request): Json<OverrideRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let record = state
        .admin()?
        .force_state(&id, request.idle_status, request.idle_action, &request.reason)
        .await?;
    info!(instance_id = %id, status = %record.idle_status, "Override applied");
    Ok(Json(record))
}

#[derive(Debug, Default, Deserialize)]
pub struct ActionTrigger {
    /// Defaults to the instance's profile action
    #[serde(default)]
    pub action: Option<ActionKind>,
    #[serde(default)]
    pub reason: String,
}

#[derive(Debug, Serialize)]
pub struct ActionResponse {
    pub outcome: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub final_state: Option<IdleAction>,
    pub fallback: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub holder: Option<String>,
}

impl From<ActionOutcome> for ActionResponse {
    fn from(outcome: ActionOutcome) -> Self {
        match outcome {
            ActionOutcome::Completed {
                final_state,
                fallback,
            } => Self {
                outcome: "completed",
                final_state: Some(final_state),
                fallback,
                holder: None,
            },
            ActionOutcome::NoOp { holder } => Self {
                outcome: "no_op",
                final_state: None,
                fallback: false,
                holder,
            },
            ActionOutcome::DryRun => Self {
                outcome: "dry_run",
                final_state: None,
                fallback: false,
                holder: None,
            },
            ActionOutcome::RateLimited => Self {
                outcome: "rate_limited",
                final_state: None,
                fallback: false,
                holder: None,
            },
        }
    }
}

async fn trigger_action(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Json(request): Json<ActionTrigger>,
) -> Result<impl IntoResponse, ApiError> {
    let outcome = state
        .admin()?
        .trigger_action(&id, request.action, &request.reason)
        .await?;
    Ok(Json(ActionResponse::from(outcome)))
}

/// Create the API router
pub fn create_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        .route("/metrics", get(metrics))
        .route("/v1/instances", get(list_instances))
        .route("/v1/instances/:id", get(get_instance))
        .route("/v1/instances/:id/audit", get(get_audit))
        .route("/v1/instances/:id/override", post(override_state))
        .route("/v1/instances/:id/actions", post(trigger_action))
        .with_state(state)
}

/// Start the API server
pub async fn serve(port: u16, state: Arc<AppState>) -> anyhow::Result<()> {
    let app = create_router(state);

    let addr = format!("0.0.0.0:{}", port);
    info!(addr = %addr, "Starting API server");

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
