use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde::{Deserialize, Serialize};

/// Errors surfaced by the request path, reduced to the gateway's HTTP
/// status taxonomy. The original cause stays in the logs.
#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    #[error("no route matches the request")]
    RouteNotFound,
    #[error("function not found: {0}")]
    FunctionNotFound(String),
    #[error("method not allowed")]
    MethodNotAllowed,
    #[error("unauthorized")]
    Unauthorized,
    #[error("circuit breaker open for {0}")]
    BreakerOpen(String),
    #[error("no capacity available for {0}")]
    AcquireTimedOut(String),
    #[error("function {0} is disabled")]
    FunctionDisabled(String),
    #[error("orchestrator unavailable: {0}")]
    OrchestratorUnavailable(String),
    #[error("container provisioning failed: {0}")]
    ProvisioningFailed(String),
    #[error("invocation of {0} timed out")]
    UpstreamTimeout(String),
    #[error("worker unreachable for {0}")]
    UpstreamUnreachable(String),
    #[error("function {0} returned an error")]
    UpstreamServerError(String),
    #[error("worker returned a malformed response")]
    BadUpstreamResponse,
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl GatewayError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            GatewayError::RouteNotFound | GatewayError::FunctionNotFound(_) => {
                StatusCode::NOT_FOUND
            }
            GatewayError::MethodNotAllowed => StatusCode::METHOD_NOT_ALLOWED,
            GatewayError::Unauthorized => StatusCode::UNAUTHORIZED,
            GatewayError::BreakerOpen(_)
            | GatewayError::AcquireTimedOut(_)
            | GatewayError::FunctionDisabled(_)
            | GatewayError::OrchestratorUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            GatewayError::ProvisioningFailed(_)
            | GatewayError::UpstreamUnreachable(_)
            | GatewayError::UpstreamServerError(_)
            | GatewayError::BadUpstreamResponse => StatusCode::BAD_GATEWAY,
            GatewayError::UpstreamTimeout(_) => StatusCode::GATEWAY_TIMEOUT,
            GatewayError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        if status.is_server_error() {
            tracing::error!("request failed: {} - {}", status, self);
        }
        (status, Json(serde_json::json!({"message": self.to_string()}))).into_response()
    }
}

// ---------------------------------------------------------------------------
// Auth endpoint payloads
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize, Deserialize)]
pub struct AuthParameters {
    #[serde(rename = "USERNAME")]
    pub username: String,
    #[serde(rename = "PASSWORD")]
    pub password: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct AuthRequest {
    #[serde(rename = "AuthParameters")]
    pub auth_parameters: AuthParameters,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct AuthenticationResult {
    #[serde(rename = "IdToken")]
    pub id_token: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct AuthResponse {
    #[serde(rename = "AuthenticationResult")]
    pub authentication_result: AuthenticationResult,
}

// ---------------------------------------------------------------------------
// Internal observability payloads
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolStats {
    pub function_name: String,
    pub max_capacity: usize,
    pub in_use: usize,
    pub idle: usize,
    pub waiters: usize,
    /// Circuit breaker state for the function, filled in by the handler.
    #[serde(default)]
    pub breaker: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct PoolStatsResponse {
    pub pools: Vec<PoolStats>,
}
