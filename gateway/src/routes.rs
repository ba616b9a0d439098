use std::sync::Arc;

use axum::{
    Json,
    Router,
    body::Body,
    extract::{Path, Request, State},
    http::{HeaderMap, HeaderName, HeaderValue, Method, StatusCode, Uri, header},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{get, post},
};
use bytes::Bytes;
use data_model::FunctionRegistry;
use nanoid::nanoid;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use crate::{
    auth::{bearer_token, create_access_token, verify_access_token},
    config::GatewayConfig,
    event::{build_event, parse_lambda_response},
    http_objects::{
        AuthRequest,
        AuthResponse,
        AuthenticationResult,
        GatewayError,
        PoolStatsResponse,
    },
    pool::PoolManager,
    pool_orchestrator::PoolOrchestrator,
    route_matcher::{MatchOutcome, RouteMatcher},
};

/// Header confirming the request passed the API-key gate; absent on a bad
/// api key, present (even on bad credentials) otherwise.
const USER_AUTHORIZED_HEADER: &str = "padma_user_authorized";

const MAX_BODY_BYTES: usize = 10 * 1024 * 1024;

#[derive(Clone)]
pub struct RouteState {
    pub config: Arc<GatewayConfig>,
    pub registry: Arc<FunctionRegistry>,
    pub matcher: Arc<RouteMatcher>,
    pub pool_orchestrator: Arc<PoolOrchestrator>,
    pub pools: Arc<PoolManager>,
}

#[derive(Clone)]
pub struct RequestId(pub String);

pub fn create_routes(route_state: RouteState) -> Router {
    Router::new()
        .route(&route_state.config.auth_endpoint_path, post(authenticate_user))
        .route("/health", get(health))
        .route("/_internal/pools", get(pool_stats))
        .route(
            "/2015-03-31/functions/{function_name}/invocations",
            post(invoke_lambda_api),
        )
        .fallback(gateway_handler)
        .layer(middleware::from_fn(request_id_middleware))
        .layer(TraceLayer::new_for_http())
        .with_state(route_state)
}

/// Assign/propagate `X-Request-Id` and emit one access-log line per request.
async fn request_id_middleware(mut request: Request, next: Next) -> Response {
    let started = std::time::Instant::now();
    let request_id = request
        .headers()
        .get("x-request-id")
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
        .unwrap_or_else(|| format!("req-{}", nanoid!(12)));
    let method = request.method().clone();
    let path = request.uri().path().to_string();

    request
        .extensions_mut()
        .insert(RequestId(request_id.clone()));
    let mut response = next.run(request).await;

    if let Ok(value) = HeaderValue::from_str(&request_id) {
        response
            .headers_mut()
            .insert(HeaderName::from_static("x-request-id"), value);
    }
    info!(
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

async fn pool_stats(State(state): State<RouteState>) -> Json<PoolStatsResponse> {
    let pools = state
        .pools
        .stats()
        .into_iter()
        .map(|mut stats| {
            stats.breaker = state
                .pool_orchestrator
                .breakers
                .breaker(&stats.function_name)
                .state()
                .to_string();
            stats
        })
        .collect();
    Json(PoolStatsResponse { pools })
}

/// Token endpoint. A bad api key gets a bare 401; a good api key always
/// gets the authorized marker header, with 401 only for bad credentials.
async fn authenticate_user(
    State(state): State<RouteState>,
    headers: HeaderMap,
    Json(request): Json<AuthRequest>,
) -> Response {
    let api_key = headers.get("x-api-key").and_then(|v| v.to_str().ok());
    if api_key != Some(state.config.x_api_key.as_str()) {
        warn!("Auth failed: invalid api key");
        return (
            StatusCode::UNAUTHORIZED,
            Json(serde_json::json!({"message": "Unauthorized"})),
        )
            .into_response();
    }

    let authorized_header = (
        HeaderName::from_static(USER_AUTHORIZED_HEADER),
        HeaderValue::from_static("true"),
    );

    let credentials_ok = request.auth_parameters.username == state.config.auth_user
        && request.auth_parameters.password == state.config.auth_pass;
    if !credentials_ok {
        warn!("Auth failed: invalid credentials");
        return (
            StatusCode::UNAUTHORIZED,
            [authorized_header],
            Json(serde_json::json!({"message": "Unauthorized"})),
        )
            .into_response();
    }

    match create_access_token(
        &request.auth_parameters.username,
        &state.config.jwt_secret_key,
        state.config.jwt_expires_secs,
    ) {
        Ok(id_token) => (
            StatusCode::OK,
            [authorized_header],
            Json(AuthResponse {
                authentication_result: AuthenticationResult { id_token },
            }),
        )
            .into_response(),
        Err(e) => GatewayError::Internal(e).into_response(),
    }
}

/// boto3-compatible Invoke API: forwards the raw payload, no event
/// envelope. `X-Amz-Invocation-Type: Event` runs detached and returns 202.
async fn invoke_lambda_api(
    State(state): State<RouteState>,
    Path(function_name): Path<String>,
    request: Request,
) -> Response {
    if state.registry.get(&function_name).is_none() {
        return GatewayError::FunctionNotFound(function_name).into_response();
    }

    let request_id = request
        .extensions()
        .get::<RequestId>()
        .map(|r| r.0.clone());
    let invocation_type = request
        .headers()
        .get("x-amz-invocation-type")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("RequestResponse")
        .to_string();

    let payload = match read_body(request).await {
        Ok(payload) => payload,
        Err(response) => return response,
    };

    if invocation_type == "Event" {
        let orchestrator = state.pool_orchestrator.clone();
        tokio::spawn(async move {
            if let Err(e) = orchestrator
                .invoke_function(&function_name, payload, request_id.as_deref())
                .await
            {
                warn!(function = %function_name, error = %e, "Async invocation failed");
            }
        });
        return (StatusCode::ACCEPTED, Bytes::new()).into_response();
    }

    match state
        .pool_orchestrator
        .invoke_function(&function_name, payload, request_id.as_deref())
        .await
    {
        Ok(result) => {
            let mut response = Response::builder()
                .status(result.status)
                .header(header::CONTENT_TYPE, "application/json");
            if let Some(fn_error) = result.headers.get("x-amz-function-error") {
                response = response.header("x-amz-function-error", fn_error);
            }
            response
                .body(Body::from(result.body))
                .unwrap_or_else(|_| GatewayError::BadUpstreamResponse.into_response())
        }
        Err(e) => e.into_response(),
    }
}

/// Catch-all route: authenticate, match the routing table, wrap the request
/// into a proxy event and hand it to a worker.
async fn gateway_handler(State(state): State<RouteState>, request: Request) -> Response {
    let principal = match authorize(&state.config, request.headers()) {
        Ok(principal) => principal,
        Err(e) => return e.into_response(),
    };

    let method: Method = request.method().clone();
    let uri: Uri = request.uri().clone();
    let path = uri.path().to_string();

    let matched = match state.matcher.match_route(&path, method.as_str()) {
        MatchOutcome::Matched(matched) => matched,
        MatchOutcome::MethodNotAllowed => {
            return GatewayError::MethodNotAllowed.into_response();
        }
        MatchOutcome::NotFound => return GatewayError::RouteNotFound.into_response(),
    };

    let request_id = request
        .extensions()
        .get::<RequestId>()
        .map(|r| r.0.clone())
        .unwrap_or_else(|| format!("req-{}", nanoid!(12)));
    let headers = request.headers().clone();
    let source_ip = headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .unwrap_or("unknown")
        .to_string();

    let body = match read_body(request).await {
        Ok(body) => body,
        Err(response) => return response,
    };

    let event = build_event(
        &method,
        &path,
        &headers,
        uri.query(),
        &body,
        &principal,
        &matched.path_params,
        &matched.route_path,
        &request_id,
        &source_ip,
    );
    let payload = match serde_json::to_vec(&event) {
        Ok(payload) => Bytes::from(payload),
        Err(e) => return GatewayError::Internal(e.into()).into_response(),
    };

    let result = match state
        .pool_orchestrator
        .invoke_function(&matched.function_name, payload, Some(&request_id))
        .await
    {
        Ok(result) => result,
        Err(e) => return e.into_response(),
    };

    let Some(parsed) = parse_lambda_response(&result.body) else {
        return GatewayError::BadUpstreamResponse.into_response();
    };

    let mut builder = Response::builder().status(parsed.status);
    for (name, value) in &parsed.headers {
        if name.eq_ignore_ascii_case("content-length")
            || name.eq_ignore_ascii_case("transfer-encoding")
        {
            continue;
        }
        if let (Ok(name), Ok(value)) = (
            HeaderName::try_from(name.as_str()),
            HeaderValue::from_str(value),
        ) {
            builder = builder.header(name, value);
        }
    }
    builder
        .body(Body::from(parsed.body))
        .unwrap_or_else(|_| GatewayError::BadUpstreamResponse.into_response())
}

fn authorize(config: &GatewayConfig, headers: &HeaderMap) -> Result<String, GatewayError> {
    let token = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(bearer_token)
        .ok_or(GatewayError::Unauthorized)?;
    verify_access_token(token, &config.jwt_secret_key).map_err(|_| GatewayError::Unauthorized)
}

async fn read_body(request: Request) -> Result<Bytes, Response> {
    axum::body::to_bytes(request.into_body(), MAX_BODY_BYTES)
        .await
        .map_err(|e| {
            GatewayError::Internal(anyhow::anyhow!("failed to read request body: {e}"))
                .into_response()
        })
}
