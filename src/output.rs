//! JSON Output Envelope Types
//!
//! Every dispatch produces exactly one [`ToolCallResult`]: a success envelope
//! or an error envelope, never both and never neither.
//!
//! # Output Contract
//! - Success: `{"success": true, "data": ..., "metadata": {"executionTimeMs": n, "backend": "..."}}`
//! - Error: `{"success": false, "error": "...", "errorKind": "...", "retryable": false}`

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{ErrorKind, GatewayError};

/// Success envelope for tool results
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SuccessEnvelope {
    /// Always true for success envelopes
    pub success: bool,

    /// Backend-specific result payload
    pub data: Value,

    /// Execution metadata
    pub metadata: Metadata,
}

impl SuccessEnvelope {
    /// Create a new success envelope
    #[must_use]
    pub const fn new(data: Value, metadata: Metadata) -> Self {
        Self { success: true, data, metadata }
    }
}

/// Error envelope for tool failures
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorEnvelope {
    /// Always false for error envelopes
    pub success: bool,

    /// Human-readable message (secret values already scrubbed)
    pub error: String,

    /// Taxonomy value
    pub error_kind: ErrorKind,

    /// Whether the caller may retry the same call
    pub retryable: bool,
}

impl ErrorEnvelope {
    /// Create a new error envelope
    pub fn new(error_kind: ErrorKind, error: impl Into<String>, retryable: bool) -> Self {
        Self { success: false, error: error.into(), error_kind, retryable }
    }

    /// Create error envelope from a `GatewayError` with an already-scrubbed message
    pub fn from_error(err: &GatewayError, message: impl Into<String>) -> Self {
        Self::new(err.kind(), message, err.retryable())
    }
}

/// Execution metadata included in all success responses
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Metadata {
    /// Wall-clock time of the whole dispatch in milliseconds
    pub execution_time_ms: u64,

    /// Backend that served the call
    pub backend: String,

    /// Number of rows returned (query-like tools only)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rows_returned: Option<usize>,
}

impl Metadata {
    /// Create new metadata with just execution time
    pub fn new(execution_time_ms: u64, backend: impl Into<String>) -> Self {
        Self { execution_time_ms, backend: backend.into(), rows_returned: None }
    }

    /// Attach a row count
    #[must_use]
    pub const fn with_rows(mut self, rows_returned: Option<usize>) -> Self {
        self.rows_returned = rows_returned;
        self
    }
}

/// Result of one dispatch
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ToolCallResult {
    Success(SuccessEnvelope),
    Failure(ErrorEnvelope),
}

impl ToolCallResult {
    #[must_use]
    pub const fn success(data: Value, metadata: Metadata) -> Self {
        Self::Success(SuccessEnvelope::new(data, metadata))
    }

    pub fn failure(error_kind: ErrorKind, error: impl Into<String>, retryable: bool) -> Self {
        Self::Failure(ErrorEnvelope::new(error_kind, error, retryable))
    }

    #[must_use]
    pub const fn is_success(&self) -> bool {
        matches!(self, Self::Success(_))
    }

    /// Error kind of a failure, `None` on success
    #[must_use]
    pub const fn error_kind(&self) -> Option<ErrorKind> {
        match self {
            Self::Success(_) => None,
            Self::Failure(envelope) => Some(envelope.error_kind),
        }
    }

    #[must_use]
    pub const fn retryable(&self) -> bool {
        match self {
            Self::Success(_) => false,
            Self::Failure(envelope) => envelope.retryable,
        }
    }

    /// Serialize to a JSON value
    #[must_use]
    pub fn to_json(&self) -> Value {
        // Both variants are plain structs of JSON-safe fields
        serde_json::to_value(self).unwrap_or(Value::Null)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_success_envelope_serialization() {
        let result = ToolCallResult::success(
            json!({"columns": ["id"], "rows": [[1]]}),
            Metadata::new(42, "sqlite").with_rows(Some(1)),
        );

        let json = serde_json::to_string(&result).unwrap();
        assert!(json.contains(r#""success":true"#));
        assert!(json.contains(r#""executionTimeMs":42"#));
        assert!(json.contains(r#""backend":"sqlite""#));
        assert!(json.contains(r#""rowsReturned":1"#));
    }

    #[test]
    fn test_error_envelope_serialization() {
        let result = ToolCallResult::failure(ErrorKind::UnknownTool, "Unknown tool: drop_everything", false);

        let json = serde_json::to_string(&result).unwrap();
        assert!(json.contains(r#""success":false"#));
        assert!(json.contains(r#""errorKind":"UnknownTool""#));
        assert!(json.contains(r#""retryable":false"#));
        assert!(!json.contains("metadata"));
    }

    #[test]
    fn test_error_envelope_from_gateway_error() {
        let err = GatewayError::Timeout(1500);
        let envelope = ErrorEnvelope::from_error(&err, err.message());

        assert!(!envelope.success);
        assert_eq!(envelope.error_kind, ErrorKind::Timeout);
        assert!(envelope.retryable);
        assert!(envelope.error.contains("1500"));
    }

    #[test]
    fn test_metadata_without_rows() {
        let meta = Metadata::new(100, "postgres");
        let json = serde_json::to_string(&meta).unwrap();

        assert!(json.contains(r#""executionTimeMs":100"#));
        assert!(!json.contains("rowsReturned"));
    }

    #[test]
    fn test_untagged_round_trip_keeps_variant() {
        let failure = ToolCallResult::failure(ErrorKind::ConnectionError, "reset", true);
        let back: ToolCallResult = serde_json::from_value(failure.to_json()).unwrap();
        assert_eq!(back, failure);
        assert_eq!(back.error_kind(), Some(ErrorKind::ConnectionError));
        assert!(back.retryable());
    }
}
