use std::sync::Arc;

use axum::{
    Json,
    Router,
    extract::{Request, State},
    http::{HeaderName, HeaderValue},
    middleware::{self, Next},
    response::Response,
    routing::{get, post},
};
use nanoid::nanoid;
use data_model::{
    AckResponse,
    EnsureRequest,
    EnsureResponse,
    EvictRequest,
    HeartbeatRequest,
    get_epoch_time_in_ms,
};
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::{
    ensure::Provisioner,
    http_objects::{ApiError, ContainerList},
    lifecycle_store::LifecycleStore,
};

#[derive(Clone)]
pub struct RouteState {
    pub store: Arc<LifecycleStore>,
    pub provisioner: Arc<Provisioner>,
}

pub fn create_routes(route_state: RouteState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/containers/ensure", post(ensure_container))
        .route("/containers/heartbeat", post(heartbeat))
        .route("/containers/evict", post(evict_container))
        .route("/containers", get(list_containers))
        .layer(middleware::from_fn(request_id_middleware))
        .layer(TraceLayer::new_for_http())
        .with_state(route_state)
}

/// Propagate the gateway's `X-Request-Id` (or mint one) and emit an access
/// log line per RPC.
async fn request_id_middleware(request: Request, next: Next) -> Response {
    let started = std::time::Instant::now();
    let request_id = request
        .headers()
        .get("x-request-id")
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
        .unwrap_or_else(|| format!("req-{}", nanoid!(12)));
    let method = request.method().clone();
    let path = request.uri().path().to_string();

    let mut response = next.run(request).await;
    if let Ok(value) = HeaderValue::from_str(&request_id) {
        response
            .headers_mut()
            .insert(HeaderName::from_static("x-request-id"), value);
    }
    tracing::info!(
        method = %method,
        path = %path,
        status = response.status().as_u16(),
        latency_ms = started.elapsed().as_millis() as u64,
        request_id = %request_id,
        "request"
    );
    response
}

async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({"status": "ok"}))
}

/// Guarantee a ready container for the function, creating one if needed.
async fn ensure_container(
    State(state): State<RouteState>,
    Json(request): Json<EnsureRequest>,
) -> Result<Json<EnsureResponse>, ApiError> {
    let response = state.provisioner.ensure(&request.function_name).await?;
    Ok(Json(response))
}

/// Gateway liveness report; refreshes `last_used_at` so the reaper leaves
/// checked-out and cached containers alone.
async fn heartbeat(
    State(state): State<RouteState>,
    Json(request): Json<HeartbeatRequest>,
) -> Result<Json<AckResponse>, ApiError> {
    let now = get_epoch_time_in_ms();
    let touched = state
        .store
        .apply_heartbeat(&request.ids, &request.idle_ids, now)
        .await;
    tracing::debug!(reported = request.ids.len(), touched, "Heartbeat received");
    Ok(Json(AckResponse { ok: true }))
}

/// Gateway-initiated removal of a container it observed failing.
async fn evict_container(
    State(state): State<RouteState>,
    Json(request): Json<EvictRequest>,
) -> Result<Json<AckResponse>, ApiError> {
    info!(container_id = %request.container_id, "Evict requested");
    state
        .provisioner
        .teardown(&request.container_id, "gateway evict")
        .await
        .map_err(ApiError::internal_error)?;
    Ok(Json(AckResponse { ok: true }))
}

async fn list_containers(
    State(state): State<RouteState>,
) -> Result<Json<ContainerList>, ApiError> {
    let containers = state.store.snapshot().await;
    Ok(Json(ContainerList { containers }))
}
