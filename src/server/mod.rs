//! Administrative REST API
//!
//! ## Endpoints
//!
//! - `POST   /api/v1/tenants`                          - Register a tenant and start consuming
//! - `GET    /api/v1/tenants`                          - List tenants
//! - `GET    /api/v1/tenants/:id`                      - Get one tenant
//! - `DELETE /api/v1/tenants/:id`                      - Remove a tenant and its queue
//! - `PUT    /api/v1/tenants/:id/config/concurrency`   - Resize the tenant's worker pool
//! - `POST   /api/v1/tenants/:id/messages`             - Publish a message to the tenant's queue
//! - `GET    /health`                                  - Liveness plus broker connection state
//! - `GET    /metrics`                                 - Prometheus exposition
//!
//! Tenant-scoped writes require an `X-Tenant-ID` header matching the tenant
//! in the path: missing header is 401, mismatch is 403.

use crate::consumer::{TenantManager, TenantSnapshot};
use crate::error::CarrierError;
use axum::{
    extract::{Path, Request, State},
    http::StatusCode,
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{get, post, put},
    Json, Router,
};
use metrics_exporter_prometheus::PrometheusHandle;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::debug;

const TENANT_ID_HEADER: &str = "x-tenant-id";

/// Shared state for the admin API
#[derive(Clone)]
pub struct AppState {
    pub manager: Arc<TenantManager>,
    pub prometheus: Option<PrometheusHandle>,
}

// ---------------------------------------------------------------------------
// Request / Response DTOs
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
pub struct CreateTenantRequest {
    pub name: String,
    pub worker_count: usize,
}

#[derive(Debug, Deserialize)]
pub struct UpdateConcurrencyRequest {
    pub worker_count: usize,
}

#[derive(Debug, Deserialize)]
pub struct PublishRequest {
    pub payload: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub connection: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
}

fn error_json(msg: impl Into<String>) -> Json<ErrorResponse> {
    Json(ErrorResponse { error: msg.into() })
}

fn error_response(err: CarrierError) -> (StatusCode, Json<ErrorResponse>) {
    let status =
        StatusCode::from_u16(err.http_status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    (status, error_json(err.to_string()))
}

// ---------------------------------------------------------------------------
// Router
// ---------------------------------------------------------------------------

/// Build the admin API router
pub fn create_router(state: AppState) -> Router {
    let tenant_scoped = Router::new()
        .route("/api/v1/tenants/:id", axum::routing::delete(remove_tenant))
        .route(
            "/api/v1/tenants/:id/config/concurrency",
            put(update_concurrency),
        )
        .route("/api/v1/tenants/:id/messages", post(publish_message))
        .route_layer(middleware::from_fn(require_tenant_header));

    Router::new()
        .route("/api/v1/tenants", post(create_tenant).get(list_tenants))
        .route("/api/v1/tenants/:id", get(get_tenant))
        .merge(tenant_scoped)
        .route("/health", get(health))
        .route("/metrics", get(metrics))
        .with_state(state)
}

/// Require an `X-Tenant-ID` header matching the tenant id in the path
async fn require_tenant_header(req: Request, next: Next) -> Response {
    let header = req
        .headers()
        .get(TENANT_ID_HEADER)
        .and_then(|v| v.to_str().ok());
    let Some(header_id) = header else {
        return (
            StatusCode::UNAUTHORIZED,
            error_json("missing X-Tenant-ID header"),
        )
            .into_response();
    };

    let path_id = req
        .uri()
        .path()
        .strip_prefix("/api/v1/tenants/")
        .map(|rest| rest.split('/').next().unwrap_or(""))
        .unwrap_or("");
    if !path_id.is_empty() && path_id != header_id {
        return (
            StatusCode::FORBIDDEN,
            error_json("X-Tenant-ID does not match the addressed tenant"),
        )
            .into_response();
    }
    next.run(req).await
}

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

async fn create_tenant(
    State(state): State<AppState>,
    Json(req): Json<CreateTenantRequest>,
) -> Result<(StatusCode, Json<TenantSnapshot>), (StatusCode, Json<ErrorResponse>)> {
    let tenant = state
        .manager
        .add_tenant(&req.name, req.worker_count)
        .await
        .map_err(error_response)?;
    Ok((StatusCode::CREATED, Json(tenant)))
}

async fn list_tenants(State(state): State<AppState>) -> Json<Vec<TenantSnapshot>> {
    Json(state.manager.list_tenants().await)
}

async fn get_tenant(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<TenantSnapshot>, (StatusCode, Json<ErrorResponse>)> {
    state
        .manager
        .get_tenant(&id)
        .await
        .map(Json)
        .map_err(error_response)
}

async fn remove_tenant(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<StatusCode, (StatusCode, Json<ErrorResponse>)> {
    state
        .manager
        .remove_tenant(&id)
        .await
        .map_err(error_response)?;
    Ok(StatusCode::NO_CONTENT)
}

async fn update_concurrency(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(req): Json<UpdateConcurrencyRequest>,
) -> Result<Json<TenantSnapshot>, (StatusCode, Json<ErrorResponse>)> {
    state
        .manager
        .update_concurrency(&id, req.worker_count)
        .await
        .map(Json)
        .map_err(error_response)
}

async fn publish_message(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(req): Json<PublishRequest>,
) -> Result<StatusCode, (StatusCode, Json<ErrorResponse>)> {
    state
        .manager
        .publish(&id, req.payload.as_bytes())
        .await
        .map_err(error_response)?;
    debug!(tenant_id = %id, bytes = req.payload.len(), "Message accepted");
    Ok(StatusCode::ACCEPTED)
}

async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        connection: state.manager.connection_state().to_string(),
    })
}

async fn metrics(State(state): State<AppState>) -> Response {
    match state.prometheus {
        Some(handle) => handle.render().into_response(),
        None => (
            StatusCode::SERVICE_UNAVAILABLE,
            error_json("metrics recorder not installed"),
        )
            .into_response(),
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
