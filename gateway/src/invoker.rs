//! HTTP invocation of a worker container's runtime interface.

use std::time::Duration;

use axum::http::{HeaderMap, StatusCode};
use bytes::Bytes;
use data_model::{RIE_INVOKE_PATH, WorkerAddr};
use tracing::debug;

/// Size cap for sniffing a 200 response for a Lambda logical error.
const LOGICAL_ERROR_SNIFF_LIMIT: usize = 10 * 1024;

#[derive(Debug, thiserror::Error)]
pub enum InvokeFailure {
    #[error("invocation timed out")]
    Timeout,
    #[error("network error calling worker: {0}")]
    Network(String),
}

#[derive(Debug)]
pub struct InvokeResult {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Bytes,
}

impl InvokeResult {
    /// Whether this response counts as a failure for the circuit breaker:
    /// a 5xx, a Lambda system-error header, or a 200 whose body is a Lambda
    /// error document. Client-side 4xx do not trip the breaker.
    pub fn is_failure(&self) -> bool {
        if self.status.is_server_error() {
            return true;
        }
        if self.headers.contains_key("x-amz-function-error") {
            return true;
        }
        if self.status == StatusCode::OK && self.body.len() < LOGICAL_ERROR_SNIFF_LIMIT {
            if let Ok(value) = serde_json::from_slice::<serde_json::Value>(&self.body) {
                if let Some(obj) = value.as_object() {
                    return obj.contains_key("errorType") || obj.contains_key("errorMessage");
                }
            }
        }
        false
    }
}

pub struct Invoker {
    client: reqwest::Client,
}

impl Default for Invoker {
    fn default() -> Self {
        Self::new()
    }
}

impl Invoker {
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::new(),
        }
    }

    /// POST `payload` to the worker's invocation endpoint with a hard
    /// deadline covering connect, send and the full response body.
    pub async fn invoke(
        &self,
        address: &WorkerAddr,
        payload: Bytes,
        request_id: Option<&str>,
        timeout: Duration,
    ) -> Result<InvokeResult, InvokeFailure> {
        let url = format!("http://{}{}", address, RIE_INVOKE_PATH);
        debug!(url = %url, "Invoking worker");

        let mut request = self
            .client
            .post(&url)
            .header("Content-Type", "application/json")
            .body(payload)
            .timeout(timeout);
        if let Some(request_id) = request_id {
            request = request.header("X-Request-Id", request_id);
        }

        let response = request.send().await.map_err(classify_reqwest_error)?;
        let status = response.status();
        let headers = response.headers().clone();
        let body = response.bytes().await.map_err(classify_reqwest_error)?;

        Ok(InvokeResult {
            status,
            headers,
            body,
        })
    }
}

fn classify_reqwest_error(e: reqwest::Error) -> InvokeFailure {
    if e.is_timeout() {
        InvokeFailure::Timeout
    } else {
        InvokeFailure::Network(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn result(status: u16, body: &'static [u8]) -> InvokeResult {
        InvokeResult {
            status: StatusCode::from_u16(status).unwrap(),
            headers: HeaderMap::new(),
            body: Bytes::from_static(body),
        }
    }

    #[test]
    fn test_5xx_is_failure() {
        assert!(result(500, b"").is_failure());
        assert!(result(503, b"").is_failure());
    }

    #[test]
    fn test_4xx_is_not_failure() {
        assert!(!result(400, b"").is_failure());
        assert!(!result(404, b"").is_failure());
    }

    #[test]
    fn test_system_error_header_is_failure() {
        let mut r = result(200, b"{}");
        r.headers
            .insert("x-amz-function-error", "Unhandled".parse().unwrap());
        assert!(r.is_failure());
    }

    #[test]
    fn test_logical_error_body_is_failure() {
        assert!(result(
            200,
            br#"{"errorType": "ZeroDivisionError", "errorMessage": "division by zero"}"#
        )
        .is_failure());
    }

    #[test]
    fn test_ordinary_200_is_success() {
        assert!(!result(200, br#"{"statusCode": 200, "body": "ok"}"#).is_failure());
        assert!(!result(200, b"plain text").is_failure());
    }
}
