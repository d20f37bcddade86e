//! Error Handling Infrastructure
//!
//! Every failure that crosses the dispatcher boundary is a [`GatewayError`].
//! Backends convert driver and HTTP errors into it where they occur, so the
//! dispatcher and the MCP layer never see backend-specific error types.
//!
//! # Error Kinds
//! - `ConfigurationError`: missing or invalid resolved configuration
//! - `AuthenticationError`: credential rejected by the backend
//! - `ConnectionError`: transport failure reaching the backend
//! - `SuspendedResourceError`: backend compute is asleep or starting
//! - `UnknownTool` / `InvalidArguments`: caller errors
//! - `Timeout`: the call exceeded its allotted time
//! - `BackendOperationError`: the backend rejected the operation

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::config::ConfigError;

/// Backend-agnostic error classification reported in failure envelopes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorKind {
    ConfigurationError,
    AuthenticationError,
    ConnectionError,
    SuspendedResourceError,
    UnknownTool,
    InvalidArguments,
    Timeout,
    BackendOperationError,
}

impl ErrorKind {
    /// Stable name used on the wire
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::ConfigurationError => "ConfigurationError",
            Self::AuthenticationError => "AuthenticationError",
            Self::ConnectionError => "ConnectionError",
            Self::SuspendedResourceError => "SuspendedResourceError",
            Self::UnknownTool => "UnknownTool",
            Self::InvalidArguments => "InvalidArguments",
            Self::Timeout => "Timeout",
            Self::BackendOperationError => "BackendOperationError",
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Main error type for gateway operations
#[derive(Error, Debug, Clone)]
pub enum GatewayError {
    /// Resolved configuration is missing or invalid
    #[error("Configuration error: {0}")]
    Configuration(#[from] ConfigError),

    /// Credential rejected (never includes the credential value)
    #[error("Authentication failed: {0}")]
    Authentication(String),

    /// Network or transport failure
    #[error("Connection failed: {0}")]
    Connection(String),

    /// Backend compute is powered down or still starting
    #[error("Resource suspended: {0}")]
    SuspendedResource(String),

    /// No tool registered under this name
    #[error("Unknown tool: {0}")]
    UnknownTool(String),

    /// Every argument violation found for one call
    #[error("Invalid arguments: {}", .0.join("; "))]
    InvalidArguments(Vec<String>),

    /// Call exceeded its allotted time (milliseconds)
    #[error("Call timed out after {0} ms")]
    Timeout(u64),

    /// The backend received the operation and rejected it
    #[error("Backend error ({backend}): {detail}")]
    BackendOperation { backend: String, detail: String, transient: bool },
}

impl GatewayError {
    /// Taxonomy value for this error
    #[must_use]
    pub const fn kind(&self) -> ErrorKind {
        match self {
            Self::Configuration(_) => ErrorKind::ConfigurationError,
            Self::Authentication(_) => ErrorKind::AuthenticationError,
            Self::Connection(_) => ErrorKind::ConnectionError,
            Self::SuspendedResource(_) => ErrorKind::SuspendedResourceError,
            Self::UnknownTool(_) => ErrorKind::UnknownTool,
            Self::InvalidArguments(_) => ErrorKind::InvalidArguments,
            Self::Timeout(_) => ErrorKind::Timeout,
            Self::BackendOperation { .. } => ErrorKind::BackendOperationError,
        }
    }

    /// Whether a caller may reasonably retry the same call
    #[must_use]
    pub const fn retryable(&self) -> bool {
        match self {
            Self::Connection(_) | Self::SuspendedResource(_) | Self::Timeout(_) => true,
            Self::BackendOperation { transient, .. } => *transient,
            Self::Configuration(_)
            | Self::Authentication(_)
            | Self::UnknownTool(_)
            | Self::InvalidArguments(_) => false,
        }
    }

    /// Human-readable message
    ///
    /// Callers that emit this outside the process must pass it through
    /// [`SecretRedactor::scrub`](crate::redact::SecretRedactor::scrub) first:
    /// driver messages can echo connection strings.
    #[must_use]
    pub fn message(&self) -> String {
        self.to_string()
    }

    /// Create an authentication error
    pub fn authentication(message: impl Into<String>) -> Self {
        Self::Authentication(message.into())
    }

    /// Create a connection error
    pub fn connection(message: impl Into<String>) -> Self {
        Self::Connection(message.into())
    }

    /// Create a suspended-resource error
    pub fn suspended(message: impl Into<String>) -> Self {
        Self::SuspendedResource(message.into())
    }

    /// Create an unknown-tool error
    pub fn unknown_tool(name: impl Into<String>) -> Self {
        Self::UnknownTool(name.into())
    }

    /// Create an invalid-arguments error from a single violation
    pub fn invalid_argument(message: impl Into<String>) -> Self {
        Self::InvalidArguments(vec![message.into()])
    }

    /// Create a non-transient backend error
    pub fn backend(backend: impl Into<String>, detail: impl Into<String>) -> Self {
        Self::BackendOperation { backend: backend.into(), detail: detail.into(), transient: false }
    }

    /// Create a backend error the caller may retry (throttling, serialization failures)
    pub fn transient(backend: impl Into<String>, detail: impl Into<String>) -> Self {
        Self::BackendOperation { backend: backend.into(), detail: detail.into(), transient: true }
    }
}

/// Result type alias for gateway operations
pub type Result<T> = std::result::Result<T, GatewayError>;
