//! sqlgate - Uniform Tool-Calling Gateway for SQL Platforms
//!
//! sqlgate exposes one SQL-capable data platform (a Databricks SQL warehouse,
//! Snowflake, `PostgreSQL` or `SQLite`) as a set of named tools with typed
//! arguments. Every call returns one structured envelope: success with data
//! and metadata, or failure with a closed error kind and a retryable flag.
//!
//! # Core Principles
//! - One contract for every backend (same envelopes, same error kinds)
//! - Configuration resolved once, with explicit precedence, and passed explicitly
//! - Credentials never appear in output or logs
//! - Transient failures (network, suspended compute) absorbed within a budget
//!
//! # Module Organization
//! - [`config`] - Configuration resolution (files, environment, overrides)
//! - [`redact`] - Secret classification and masking
//! - [`backend`] - Backend trait and the four backends
//! - [`connection`] - Per-backend session pool with single-flight connect
//! - [`retry`] - Backoff profiles and the retry policy
//! - [`tools`] - Tool descriptors, argument schemas and the registry
//! - [`dispatch`] - Tool dispatcher producing envelopes
//! - [`output`] - JSON envelope types
//! - [`error`] - Error taxonomy
//! - [`mcp`] - MCP server (manual JSON-RPC 2.0 over stdio)

pub mod backend;
pub mod config;
pub mod connection;
pub mod dispatch;
pub mod error;
pub mod mcp;
pub mod output;
pub mod redact;
pub mod retry;
pub mod tools;

// Re-export commonly used types for convenience
pub use backend::{Backend, BackendKind, ColumnInfo, ForeignKeyInfo, IndexInfo, QueryResult, TableInfo};
pub use config::{resolve_config, ConfigError, ConfigInputs, ConfigResolver, LoadOptions, ResolvedConfig};
pub use connection::{BackendState, ConnectionHandle, ConnectionManager, PoolSettings};
pub use dispatch::ToolDispatcher;
pub use error::{ErrorKind, GatewayError, Result};
pub use output::{ErrorEnvelope, Metadata, SuccessEnvelope, ToolCallResult};
pub use redact::SecretRedactor;
pub use retry::{BackoffProfile, RetryPolicy};
pub use tools::{ArgSchema, ArgType, ToolArgs, ToolDescriptor, ToolOutput, ToolRegistry};
