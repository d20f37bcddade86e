//! Backend Trait and Core Types
//!
//! Each data platform implements [`Backend`]: authenticate a session from the
//! resolved configuration, probe a session for health, and register its tool
//! handlers. Backends convert driver and HTTP failures into
//! [`GatewayError`](crate::error::GatewayError) at this boundary.
//!
//! # Backend Isolation
//! Each backend lives behind its own cargo feature and shares nothing but
//! the result types below.

use serde::{Deserialize, Serialize};
use std::future::Future;

use crate::config::{ConfigError, FieldSpec, FieldViolation, ResolvedConfig};
use crate::error::{GatewayError, Result};
use crate::tools::{RegistryError, ToolArgs, ToolRegistry};

#[cfg(any(feature = "databricks", feature = "snowflake"))]
mod http;

#[cfg(feature = "databricks")]
pub mod databricks;

#[cfg(feature = "snowflake")]
pub mod snowflake;

#[cfg(feature = "postgres")]
pub mod postgres;

#[cfg(feature = "sqlite")]
pub mod sqlite;

/// Supported backends
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    /// Databricks SQL warehouse (Statement Execution API)
    Databricks,
    /// Snowflake warehouse (SQL API v2)
    Snowflake,
    /// `PostgreSQL` database
    Postgres,
    /// `SQLite` database file
    Sqlite,
}

impl BackendKind {
    /// Get the backend name as a string
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Databricks => "databricks",
            Self::Snowflake => "snowflake",
            Self::Postgres => "postgres",
            Self::Sqlite => "sqlite",
        }
    }

    #[must_use]
    pub fn parse(name: &str) -> Option<Self> {
        match name {
            "databricks" => Some(Self::Databricks),
            "snowflake" => Some(Self::Snowflake),
            "postgres" => Some(Self::Postgres),
            "sqlite" => Some(Self::Sqlite),
            _ => None,
        }
    }

    /// Backend-specific config fields, `None` when the backend is compiled out
    #[must_use]
    pub fn config_fields(&self) -> Option<Vec<FieldSpec>> {
        match self {
            #[cfg(feature = "databricks")]
            Self::Databricks => Some(databricks::config_fields()),
            #[cfg(feature = "snowflake")]
            Self::Snowflake => Some(snowflake::config_fields()),
            #[cfg(feature = "postgres")]
            Self::Postgres => Some(postgres::config_fields()),
            #[cfg(feature = "sqlite")]
            Self::Sqlite => Some(sqlite::config_fields()),
            #[allow(unreachable_patterns)]
            _ => None,
        }
    }
}

impl std::fmt::Display for BackendKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Capability contract every backend implements
///
/// `authenticate` performs one handshake and returns a live session. The
/// connection manager decides when to call it and retries it according to
/// the error kind it returns.
pub trait Backend: Send + Sync + 'static {
    /// Live session; shared with handlers for the duration of one call
    type Session: Send + Sync + 'static;

    /// Backend name reported in success metadata
    fn name(&self) -> &'static str;

    /// Open and authenticate a new session
    fn authenticate(&self, config: &ResolvedConfig) -> impl Future<Output = Result<Self::Session>> + Send;

    /// Cheap health check of an existing session
    fn probe(&self, session: &Self::Session) -> impl Future<Output = bool> + Send;

    /// Register this backend's tools
    fn register_tools(&self, registry: &mut ToolRegistry<Self::Session>) -> std::result::Result<(), RegistryError>;
}

/// Table information
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TableInfo {
    /// Table name
    pub name: String,

    /// Schema name (for backends that support schemas)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub schema: Option<String>,

    /// Table columns
    pub columns: Vec<ColumnInfo>,

    /// Primary key columns
    #[serde(skip_serializing_if = "Option::is_none")]
    pub primary_key: Option<Vec<String>>,

    /// Foreign keys
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub foreign_keys: Vec<ForeignKeyInfo>,

    /// Indexes
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub indexes: Vec<IndexInfo>,
}

/// Column information
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ColumnInfo {
    pub name: String,

    /// Column data type (backend-specific)
    pub data_type: String,

    pub nullable: bool,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub default: Option<String>,
}

/// Foreign key information
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ForeignKeyInfo {
    pub name: String,
    pub columns: Vec<String>,
    pub referenced_table: String,
    pub referenced_columns: Vec<String>,
}

/// Index information
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexInfo {
    pub name: String,
    pub columns: Vec<String>,
    pub unique: bool,
}

/// Query execution result
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct QueryResult {
    /// Column names in result set
    pub columns: Vec<String>,

    /// Result rows, values in column order
    pub rows: Vec<Vec<serde_json::Value>>,

    /// Number of rows affected (for INSERT/UPDATE/DELETE)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rows_affected: Option<u64>,

    /// Set when `max_rows` cut the result short
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub truncated: bool,
}

/// Row cap applied when `execute_query` is called without `max_rows`
pub const DEFAULT_MAX_ROWS: usize = 1000;

/// Effective row cap for a query tool call
pub fn row_limit(args: &ToolArgs) -> Result<usize> {
    Ok(args.usize("max_rows")?.unwrap_or(DEFAULT_MAX_ROWS))
}

/// Configuration error naming one field, for failures found at handshake time
pub fn config_violation(field: &str, rule: impl Into<String>) -> GatewayError {
    GatewayError::Configuration(ConfigError::invalid(vec![FieldViolation::constraint(field, rule)]))
}

/// Quote an identifier with double quotes (`PostgreSQL`, `SQLite`, Snowflake)
#[must_use]
pub fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

/// Quote an identifier with backticks (Databricks SQL)
#[must_use]
pub fn quote_backtick(name: &str) -> String {
    format!("`{}`", name.replace('`', "``"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backend_kind_serialization() {
        assert_eq!(serde_json::to_string(&BackendKind::Databricks).unwrap(), r#""databricks""#);
        assert_eq!(serde_json::to_string(&BackendKind::Sqlite).unwrap(), r#""sqlite""#);
        assert_eq!(BackendKind::parse("snowflake"), Some(BackendKind::Snowflake));
        assert_eq!(BackendKind::parse("mysql"), None);
    }

    #[test]
    fn test_backend_names_match_config_enum() {
        for name in crate::config::BACKEND_NAMES {
            assert_eq!(BackendKind::parse(name).map(|k| k.as_str()), Some(*name));
        }
    }

    #[test]
    fn test_identifier_quoting() {
        assert_eq!(quote_ident("users"), r#""users""#);
        assert_eq!(quote_ident(r#"we"ird"#), r#""we""ird""#);
        assert_eq!(quote_backtick("my`table"), "`my``table`");
    }

    #[test]
    fn test_query_result_omits_defaults() {
        let result = QueryResult { columns: vec!["n".into()], rows: vec![vec![1.into()]], ..Default::default() };
        let json = serde_json::to_string(&result).unwrap();
        assert!(!json.contains("truncated"));
        assert!(!json.contains("rows_affected"));
    }
}
