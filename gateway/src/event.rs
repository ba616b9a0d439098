//! API-Gateway-style Lambda proxy integration envelope.
//!
//! Requests through the catch-all route are wrapped into a proxy event for
//! the worker, and the worker's `statusCode`/`headers`/`body` envelope is
//! unwrapped back into an HTTP response.

use std::collections::HashMap;

use axum::http::{HeaderMap, Method, StatusCode};
use base64::Engine;
use bytes::Bytes;
use serde_json::{Value, json};

#[allow(clippy::too_many_arguments)]
pub fn build_event(
    method: &Method,
    path: &str,
    headers: &HeaderMap,
    query: Option<&str>,
    body: &Bytes,
    principal: &str,
    path_params: &HashMap<String, String>,
    resource: &str,
    request_id: &str,
    source_ip: &str,
) -> Value {
    let is_gzip = headers
        .get("content-encoding")
        .and_then(|v| v.to_str().ok())
        .map(|v| v.to_lowercase().contains("gzip"))
        .unwrap_or(false);

    let (body_content, is_base64) = if is_gzip {
        (
            Value::String(base64::engine::general_purpose::STANDARD.encode(body)),
            true,
        )
    } else {
        match std::str::from_utf8(body) {
            Ok(text) => (Value::String(text.to_string()), false),
            Err(_) => (
                Value::String(base64::engine::general_purpose::STANDARD.encode(body)),
                true,
            ),
        }
    };

    let header_map: HashMap<String, String> = headers
        .iter()
        .filter_map(|(k, v)| {
            v.to_str()
                .ok()
                .map(|value| (k.as_str().to_string(), value.to_string()))
        })
        .collect();

    let query_params: Option<HashMap<String, String>> = query.map(|q| {
        q.split('&')
            .filter(|pair| !pair.is_empty())
            .map(|pair| match pair.split_once('=') {
                Some((k, v)) => (k.to_string(), v.to_string()),
                None => (pair.to_string(), String::new()),
            })
            .collect()
    });

    json!({
        "resource": resource,
        "path": path,
        "httpMethod": method.as_str(),
        "headers": header_map,
        "queryStringParameters": query_params,
        "pathParameters": if path_params.is_empty() { Value::Null } else { json!(path_params) },
        "requestContext": {
            "identity": {"sourceIp": source_ip},
            "authorizer": {"claims": {"cognito:username": principal}, "cognito:username": principal},
            "requestId": request_id,
        },
        "body": body_content,
        "isBase64Encoded": is_base64,
    })
}

/// A worker response unwrapped into HTTP pieces.
#[derive(Debug)]
pub struct LambdaHttpResponse {
    pub status: StatusCode,
    pub headers: HashMap<String, String>,
    pub body: Bytes,
}

/// Unwrap a worker's proxy-integration envelope. A plain JSON response
/// (no `statusCode`) passes through as a 200; invalid base64 is a malformed
/// envelope.
pub fn parse_lambda_response(raw: &Bytes) -> Option<LambdaHttpResponse> {
    let value: Value = serde_json::from_slice(raw).ok()?;

    let Some(envelope) = value.as_object() else {
        return Some(LambdaHttpResponse {
            status: StatusCode::OK,
            headers: HashMap::new(),
            body: raw.clone(),
        });
    };

    if !envelope.contains_key("statusCode") {
        return Some(LambdaHttpResponse {
            status: StatusCode::OK,
            headers: HashMap::new(),
            body: raw.clone(),
        });
    }

    let status = envelope
        .get("statusCode")
        .and_then(Value::as_u64)
        .and_then(|code| StatusCode::from_u16(code as u16).ok())?;

    let headers = envelope
        .get("headers")
        .and_then(Value::as_object)
        .map(|map| {
            map.iter()
                .filter_map(|(k, v)| v.as_str().map(|s| (k.clone(), s.to_string())))
                .collect()
        })
        .unwrap_or_default();

    let is_base64 = envelope
        .get("isBase64Encoded")
        .and_then(Value::as_bool)
        .unwrap_or(false);

    let body = match envelope.get("body") {
        None | Some(Value::Null) => Bytes::new(),
        Some(Value::String(s)) => {
            if is_base64 {
                Bytes::from(base64::engine::general_purpose::STANDARD.decode(s).ok()?)
            } else {
                Bytes::from(s.clone())
            }
        }
        Some(other) => Bytes::from(serde_json::to_vec(other).ok()?),
    };

    Some(LambdaHttpResponse {
        status,
        headers,
        body,
    })
}
