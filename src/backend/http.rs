//! Shared HTTP plumbing for the REST warehouse backends
//!
//! Status codes map onto the error taxonomy the same way for Databricks and
//! Snowflake, except that throttling means different things during a
//! handshake (the service is not reachable yet) and during a tool call (the
//! statement was refused and the caller may try again).

use reqwest::{Client, RequestBuilder, Response, StatusCode};
use serde::de::DeserializeOwned;
use std::time::Duration;

use crate::error::{GatewayError, Result};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(60);
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Where a request is made from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    /// Opening a session
    Handshake,
    /// Serving a tool call on a live session
    Call,
}

/// HTTP client shared by one session
pub fn build_client(backend: &str) -> Result<Client> {
    Client::builder()
        .connect_timeout(CONNECT_TIMEOUT)
        .timeout(REQUEST_TIMEOUT)
        .user_agent(concat!("sqlgate/", env!("CARGO_PKG_VERSION")))
        .build()
        .map_err(|e| GatewayError::connection(format!("Failed to build {backend} HTTP client: {e}")))
}

/// `https://{host}` unless an explicit base URL is configured
pub fn base_url(host: &str, override_url: Option<&str>) -> String {
    override_url.map_or_else(|| format!("https://{host}"), |url| url.trim_end_matches('/').to_string())
}

/// Send a request and classify transport failures
pub async fn send(request: RequestBuilder, backend: &str, context: &str) -> Result<Response> {
    request.send().await.map_err(|e| transport_error(&e, backend, context))
}

/// Decode a successful response body, or classify the failure status
pub async fn read_json<T: DeserializeOwned>(response: Response, backend: &str, phase: Phase) -> Result<T> {
    let status = response.status();
    if !status.is_success() {
        let body = response.text().await.unwrap_or_default();
        return Err(status_error(status, &body, backend, phase));
    }
    response
        .json()
        .await
        .map_err(|e| GatewayError::backend(backend, format!("Unexpected response from {backend}: {e}")))
}

fn transport_error(err: &reqwest::Error, backend: &str, context: &str) -> GatewayError {
    // Request URLs never carry credentials, they travel in headers
    if err.is_decode() || err.is_builder() {
        GatewayError::backend(backend, format!("{context}: {err}"))
    } else {
        GatewayError::connection(format!("{context}: {err}"))
    }
}

/// Message field of a JSON error body, or the raw body
fn error_detail(body: &str) -> String {
    let parsed: Option<serde_json::Value> = serde_json::from_str(body).ok();
    let message = parsed.as_ref().and_then(|v| v.get("message")).and_then(serde_json::Value::as_str);
    match message {
        Some(message) => message.to_string(),
        None if body.trim().is_empty() => "no response body".to_string(),
        None => body.chars().take(500).collect(),
    }
}

/// Fires a cancel request if an in-flight statement is abandoned
///
/// Dropping a tool call future (call timeout, client cancellation) would
/// otherwise leave the statement running on the warehouse.
pub struct CancelOnDrop {
    request: Option<RequestBuilder>,
}

impl CancelOnDrop {
    pub const fn new(request: RequestBuilder) -> Self {
        Self { request: Some(request) }
    }

    /// The statement finished; nothing to cancel
    pub fn disarm(mut self) {
        self.request = None;
    }
}

impl Drop for CancelOnDrop {
    fn drop(&mut self) {
        if let Some(request) = self.request.take() {
            if let Ok(runtime) = tokio::runtime::Handle::try_current() {
                runtime.spawn(async move {
                    let _ = request.send().await;
                });
            }
        }
    }
}

/// Classify a non-success HTTP status
pub fn status_error(status: StatusCode, body: &str, backend: &str, phase: Phase) -> GatewayError {
    let detail = format!("HTTP {}: {}", status.as_u16(), error_detail(body));
    match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
            GatewayError::authentication(format!("{backend} rejected the access token ({detail})"))
        }
        StatusCode::TOO_MANY_REQUESTS
        | StatusCode::BAD_GATEWAY
        | StatusCode::SERVICE_UNAVAILABLE
        | StatusCode::GATEWAY_TIMEOUT => match phase {
            Phase::Handshake => GatewayError::connection(format!("{backend} is unavailable ({detail})")),
            Phase::Call => GatewayError::transient(backend, detail),
        },
        _ => GatewayError::backend(backend, detail),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    #[test]
    fn test_status_classification() {
        let err = status_error(StatusCode::UNAUTHORIZED, "", "databricks", Phase::Call);
        assert_eq!(err.kind(), ErrorKind::AuthenticationError);

        let err = status_error(StatusCode::TOO_MANY_REQUESTS, "", "snowflake", Phase::Handshake);
        assert_eq!(err.kind(), ErrorKind::ConnectionError);

        let err = status_error(StatusCode::SERVICE_UNAVAILABLE, "", "snowflake", Phase::Call);
        assert_eq!(err.kind(), ErrorKind::BackendOperationError);
        assert!(err.retryable());

        let err = status_error(StatusCode::BAD_REQUEST, r#"{"message": "bad sql"}"#, "databricks", Phase::Call);
        assert!(!err.retryable());
        assert!(err.message().contains("bad sql"));
    }

    #[test]
    fn test_base_url_override() {
        assert_eq!(base_url("acme.cloud.databricks.com", None), "https://acme.cloud.databricks.com");
        assert_eq!(base_url("ignored", Some("http://127.0.0.1:8080/")), "http://127.0.0.1:8080");
    }
}
