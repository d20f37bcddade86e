//! Fields shared by every backend
//!
//! Pool sizing, timeouts and the two retry profiles. Environment variables
//! use the `SQLGATE_` prefix.

use super::schema::{ConfigError, ConfigSchema, FieldSpec, FieldViolation};
use crate::backend::BackendKind;

/// Accepted values of the `backend` field
pub const BACKEND_NAMES: &[&str] = &["databricks", "snowflake", "postgres", "sqlite"];

/// The `backend` selector, resolved before anything else
#[must_use]
pub fn backend_field() -> FieldSpec {
    FieldSpec::one_of("backend", BACKEND_NAMES).env("SQLGATE_BACKEND").required()
}

/// Fields every backend understands
#[must_use]
pub fn common_fields() -> Vec<FieldSpec> {
    vec![
        backend_field(),
        FieldSpec::positive_int("pool_size").env("SQLGATE_POOL_SIZE").default_int(4),
        FieldSpec::positive_int("call_timeout_secs").env("SQLGATE_CALL_TIMEOUT_SECS").default_int(120),
        FieldSpec::positive_int("acquire_timeout_secs").env("SQLGATE_ACQUIRE_TIMEOUT_SECS").default_int(60),
        FieldSpec::positive_int("idle_timeout_secs").env("SQLGATE_IDLE_TIMEOUT_SECS").default_int(300),
        FieldSpec::positive_int("probe_timeout_secs").env("SQLGATE_PROBE_TIMEOUT_SECS").default_int(10),
        FieldSpec::positive_int("call_max_attempts").env("SQLGATE_CALL_MAX_ATTEMPTS").default_int(1),
        FieldSpec::positive_int("network_retry_max_attempts").env("SQLGATE_NETWORK_RETRY_MAX_ATTEMPTS").default_int(4),
        FieldSpec::positive_int("network_retry_initial_ms").env("SQLGATE_NETWORK_RETRY_INITIAL_MS").default_int(200),
        FieldSpec::positive_int("network_retry_max_backoff_ms").env("SQLGATE_NETWORK_RETRY_MAX_BACKOFF_MS").default_int(5_000),
        FieldSpec::positive_int("network_retry_max_wait_ms").env("SQLGATE_NETWORK_RETRY_MAX_WAIT_MS").default_int(15_000),
        FieldSpec::positive_int("wake_retry_max_attempts").env("SQLGATE_WAKE_RETRY_MAX_ATTEMPTS").default_int(40),
        FieldSpec::positive_int("wake_retry_initial_ms").env("SQLGATE_WAKE_RETRY_INITIAL_MS").default_int(2_000),
        FieldSpec::positive_int("wake_retry_max_backoff_ms").env("SQLGATE_WAKE_RETRY_MAX_BACKOFF_MS").default_int(15_000),
        FieldSpec::positive_int("wake_retry_max_wait_ms").env("SQLGATE_WAKE_RETRY_MAX_WAIT_MS").default_int(300_000),
    ]
}

/// Full schema for one backend: common fields plus the backend's own
pub fn backend_schema(kind: BackendKind) -> Result<ConfigSchema, ConfigError> {
    let fields = kind.config_fields().ok_or_else(|| {
        ConfigError::invalid(vec![FieldViolation::constraint(
            "backend",
            format!("backend '{kind}' is not enabled in this build"),
        )])
    })?;
    Ok(ConfigSchema::new(common_fields()).extend(fields))
}
