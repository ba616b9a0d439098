use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
};
use data_model::ContainerRecord;
use serde::{Deserialize, Serialize};

use crate::ensure::EnsureError;

#[derive(Debug, Serialize, Deserialize)]
pub struct ApiError {
    #[serde(skip)]
    status_code: StatusCode,
    message: String,
}

impl ApiError {
    pub fn new(status_code: StatusCode, message: &str) -> Self {
        Self {
            status_code,
            message: message.to_string(),
        }
    }

    pub fn internal_error(e: anyhow::Error) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, &e.to_string())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        tracing::error!("API error: {} - {}", self.status_code, self.message);
        (self.status_code, self.message).into_response()
    }
}

impl From<EnsureError> for ApiError {
    fn from(e: EnsureError) -> Self {
        let status = match &e {
            EnsureError::UnknownFunction(_) => StatusCode::NOT_FOUND,
            EnsureError::ImagePullFailed { .. } => StatusCode::NOT_FOUND,
            EnsureError::ReadinessTimedOut(_) => StatusCode::REQUEST_TIMEOUT,
            EnsureError::Conflict(_) => StatusCode::CONFLICT,
            EnsureError::AtCapacity(_) => StatusCode::SERVICE_UNAVAILABLE,
            EnsureError::ContainerStartFailed { .. } | EnsureError::Internal(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };
        ApiError::new(status, &e.to_string())
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ContainerList {
    pub containers: Vec<ContainerRecord>,
}
