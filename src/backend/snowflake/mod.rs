//! Snowflake Backend
//!
//! # Features
//! - SQL API v2 (`/api/v2/statements`) over HTTPS
//! - OAuth, key-pair JWT and programmatic access tokens, selected by `auth_scheme`
//! - Database/schema/table browsing via `SHOW` and `DESCRIBE` statements
//!
//! # Implementation Notes
//! - HTTP 202 means the statement is still running. During the handshake
//!   that is the warehouse resuming, reported as a suspended resource.
//! - Result sets larger than one partition are fetched partition by
//!   partition until `max_rows` is reached
//! - Values arrive as strings and are converted using `rowType`

use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

use super::http::{self, CancelOnDrop, Phase};
use crate::backend::{config_violation, quote_ident, row_limit, Backend, ColumnInfo, QueryResult, TableInfo};
use crate::config::{Constraint, FieldSpec, ResolvedConfig};
use crate::error::{GatewayError, Result};
use crate::tools::{ArgSchema, ArgType, RegistryError, ToolArgs, ToolDescriptor, ToolOutput, ToolRegistry};

const BACKEND: &str = "snowflake";

/// Accepted values of `auth_scheme`
pub const AUTH_SCHEMES: &[&str] = &["oauth", "keypair_jwt", "programmatic_access_token"];

/// Server-side statement timeout, seconds
const STATEMENT_TIMEOUT_SECS: u64 = 600;

const POLL_INITIAL: Duration = Duration::from_millis(250);
const POLL_MAX: Duration = Duration::from_secs(5);

/// Snowflake config fields
#[must_use]
pub fn config_fields() -> Vec<FieldSpec> {
    vec![
        FieldSpec::string("account").env("SNOWFLAKE_ACCOUNT").required().constraint(Constraint::NoScheme),
        FieldSpec::string("access_token").env("SNOWFLAKE_TOKEN").required(),
        FieldSpec::one_of("auth_scheme", AUTH_SCHEMES).env("SNOWFLAKE_AUTH_SCHEME").default_str("oauth"),
        FieldSpec::string("warehouse").env("SNOWFLAKE_WAREHOUSE").required(),
        FieldSpec::string("database").env("SNOWFLAKE_DATABASE"),
        FieldSpec::string("schema").env("SNOWFLAKE_SCHEMA"),
        FieldSpec::string("role").env("SNOWFLAKE_ROLE"),
        FieldSpec::string("api_base_url").env("SNOWFLAKE_API_BASE_URL").constraint(Constraint::HttpUrl),
    ]
}

/// Snowflake backend
#[derive(Debug, Clone, Copy, Default)]
pub struct SnowflakeBackend;

/// Authenticated SQL API client
pub struct SnowflakeSession {
    http: reqwest::Client,
    base_url: String,
    token: String,
    token_type: &'static str,
    warehouse: String,
    database: Option<String>,
    schema: Option<String>,
    role: Option<String>,
}

impl std::fmt::Debug for SnowflakeSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SnowflakeSession")
            .field("base_url", &self.base_url)
            .field("token_type", &self.token_type)
            .field("warehouse", &self.warehouse)
            .finish_non_exhaustive()
    }
}

impl Backend for SnowflakeBackend {
    type Session = SnowflakeSession;

    fn name(&self) -> &'static str {
        BACKEND
    }

    async fn authenticate(&self, config: &ResolvedConfig) -> Result<SnowflakeSession> {
        let session = SnowflakeSession::from_config(config)?;

        let response = session.submit("SELECT 1", StatementTarget::default(), Phase::Handshake).await?;
        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Err(config_violation("account", "no Snowflake account at this address"));
        }
        let accepted = response.status() == reqwest::StatusCode::ACCEPTED;
        let body: ResultSet = http::read_json(response, BACKEND, Phase::Handshake).await?;

        if accepted {
            if let Some(handle) = body.statement_handle.as_deref() {
                session.cancel(handle).await;
            }
            return Err(GatewayError::suspended(format!("warehouse {} is resuming", session.warehouse)));
        }

        debug!(warehouse = %session.warehouse, "Snowflake session authenticated");
        Ok(session)
    }

    async fn probe(&self, session: &SnowflakeSession) -> bool {
        match session.submit("SELECT 1", StatementTarget::default(), Phase::Call).await {
            Ok(response) => response.status() == reqwest::StatusCode::OK,
            Err(_) => false,
        }
    }

    fn register_tools(&self, registry: &mut ToolRegistry<SnowflakeSession>) -> std::result::Result<(), RegistryError> {
        registry.register(ToolDescriptor::new(
            "execute_query",
            "Execute one SQL statement on Snowflake. Results are capped at max_rows (default 1000).",
            ArgSchema::new()
                .required("sql", ArgType::String, "SQL statement (Snowflake dialect)")
                .optional("database", ArgType::String, "Database for unqualified names")
                .optional("schema", ArgType::String, "Schema for unqualified names")
                .optional("max_rows", ArgType::Integer, "Maximum rows to return"),
            tool_execute_query,
        ))?;
        registry.register(ToolDescriptor::new(
            "list_databases",
            "List databases visible to the current role.",
            ArgSchema::new(),
            tool_list_databases,
        ))?;
        registry.register(ToolDescriptor::new(
            "list_schemas",
            "List schemas in a database (default: the configured database).",
            ArgSchema::new().optional("database", ArgType::String, "Database name"),
            tool_list_schemas,
        ))?;
        registry.register(ToolDescriptor::new(
            "list_tables",
            "List tables in a schema or database (default: the configured database and schema).",
            ArgSchema::new()
                .optional("database", ArgType::String, "Database name")
                .optional("schema", ArgType::String, "Schema name"),
            tool_list_tables,
        ))?;
        registry.register(ToolDescriptor::new(
            "describe_table",
            "Describe a table's columns and primary key. Accepts `table`, `schema.table` or \
             `database.schema.table`.",
            ArgSchema::new().required("table", ArgType::String, "Table name, optionally qualified"),
            tool_describe_table,
        ))
    }
}

// ============================================================================
// Tool Handlers
// ============================================================================

async fn tool_execute_query(session: Arc<SnowflakeSession>, args: ToolArgs) -> Result<ToolOutput> {
    let sql = args.require_str("sql")?;
    let target = StatementTarget { database: args.str("database"), schema: args.str("schema") };
    let result = session.execute(sql, target, row_limit(&args)?).await?;
    ToolOutput::rows(&result)
}

async fn tool_list_databases(session: Arc<SnowflakeSession>, _args: ToolArgs) -> Result<ToolOutput> {
    let result = session.execute("SHOW DATABASES", StatementTarget::default(), usize::MAX).await?;
    Ok(ToolOutput::json(json!({ "databases": named_column(&result, "name") })))
}

async fn tool_list_schemas(session: Arc<SnowflakeSession>, args: ToolArgs) -> Result<ToolOutput> {
    let database = args.str("database").or(session.database.as_deref());
    let sql = match database {
        Some(database) => format!("SHOW SCHEMAS IN DATABASE {}", identifier(database)),
        None => "SHOW SCHEMAS".to_string(),
    };

    let result = session.execute(&sql, StatementTarget::default(), usize::MAX).await?;
    Ok(ToolOutput::json(json!({ "database": database, "schemas": named_column(&result, "name") })))
}

async fn tool_list_tables(session: Arc<SnowflakeSession>, args: ToolArgs) -> Result<ToolOutput> {
    let database = args.str("database").or(session.database.as_deref());
    let schema = args.str("schema").or(session.schema.as_deref());
    let sql = match (database, schema) {
        (Some(database), Some(schema)) => {
            format!("SHOW TABLES IN SCHEMA {}.{}", identifier(database), identifier(schema))
        }
        (None, Some(schema)) => format!("SHOW TABLES IN SCHEMA {}", identifier(schema)),
        (Some(database), None) => format!("SHOW TABLES IN DATABASE {}", identifier(database)),
        (None, None) => "SHOW TABLES".to_string(),
    };

    let result = session.execute(&sql, StatementTarget::default(), usize::MAX).await?;
    Ok(ToolOutput::json(json!({
        "database": database,
        "schema": schema,
        "tables": named_column(&result, "name"),
    })))
}

async fn tool_describe_table(session: Arc<SnowflakeSession>, args: ToolArgs) -> Result<ToolOutput> {
    let table = args.require_str("table")?;
    let qualified = qualify(table)?;

    let result = session
        .execute(&format!("DESCRIBE TABLE {qualified}"), StatementTarget::default(), usize::MAX)
        .await?;
    ToolOutput::serialize(&describe_rows(table, &result))
}

// ============================================================================
// SQL API Client
// ============================================================================

/// `ResultSet` and `QueryStatus` bodies share these fields
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ResultSet {
    #[serde(default)]
    statement_handle: Option<String>,
    #[serde(default)]
    result_set_meta_data: Option<ResultSetMetaData>,
    #[serde(default)]
    data: Vec<Vec<Option<String>>>,
    #[serde(default)]
    stats: Option<DmlStats>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ResultSetMetaData {
    #[serde(default)]
    row_type: Vec<RowType>,
    #[serde(default)]
    partition_info: Vec<Value>,
}

#[derive(Debug, Deserialize)]
struct RowType {
    name: String,
    #[serde(rename = "type", default)]
    type_name: String,
    #[serde(default)]
    scale: Option<i64>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DmlStats {
    #[serde(default)]
    num_rows_inserted: u64,
    #[serde(default)]
    num_rows_updated: u64,
    #[serde(default)]
    num_rows_deleted: u64,
}

/// Database and schema overrides for one statement
#[derive(Debug, Clone, Copy, Default)]
struct StatementTarget<'a> {
    database: Option<&'a str>,
    schema: Option<&'a str>,
}

impl SnowflakeSession {
    fn from_config(config: &ResolvedConfig) -> Result<Self> {
        let account = config.require_str("account")?;
        let token = config.require_str("access_token")?;
        let warehouse = config.require_str("warehouse")?;
        let token_type = token_type(config.get_str("auth_scheme").unwrap_or("oauth"))
            .ok_or_else(|| config_violation("auth_scheme", format!("must be one of: {}", AUTH_SCHEMES.join(", "))))?;

        Ok(Self {
            http: http::build_client(BACKEND)?,
            base_url: http::base_url(&format!("{account}.snowflakecomputing.com"), config.get_str("api_base_url")),
            token: token.to_string(),
            token_type,
            warehouse: warehouse.to_string(),
            database: config.get_str("database").map(str::to_string),
            schema: config.get_str("schema").map(str::to_string),
            role: config.get_str("role").map(str::to_string),
        })
    }

    fn authorized(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        request
            .bearer_auth(&self.token)
            .header("X-Snowflake-Authorization-Token-Type", self.token_type)
            .header(reqwest::header::ACCEPT, "application/json")
    }

    fn statement_url(&self, handle: &str) -> String {
        format!("{}/api/v2/statements/{handle}", self.base_url)
    }

    async fn submit(&self, sql: &str, target: StatementTarget<'_>, phase: Phase) -> Result<reqwest::Response> {
        let mut body = json!({
            "statement": sql,
            "timeout": STATEMENT_TIMEOUT_SECS,
            "warehouse": self.warehouse,
        });
        if let Some(database) = target.database.or(self.database.as_deref()) {
            body["database"] = json!(database);
        }
        if let Some(schema) = target.schema.or(self.schema.as_deref()) {
            body["schema"] = json!(schema);
        }
        if let Some(role) = &self.role {
            body["role"] = json!(role);
        }

        let context = match phase {
            Phase::Handshake => "Failed to reach Snowflake",
            Phase::Call => "Failed to submit statement",
        };
        let request = self.authorized(self.http.post(format!("{}/api/v2/statements", self.base_url))).json(&body);
        http::send(request, BACKEND, context).await
    }

    async fn cancel(&self, handle: &str) {
        let request = self.authorized(self.http.post(format!("{}/cancel", self.statement_url(handle))));
        let _ = request.send().await;
    }

    /// Run one statement to completion and collect up to `max_rows` rows
    async fn execute(&self, sql: &str, target: StatementTarget<'_>, max_rows: usize) -> Result<QueryResult> {
        let response = self.submit(sql, target, Phase::Call).await?;
        let mut accepted = response.status() == reqwest::StatusCode::ACCEPTED;
        let mut body: ResultSet = http::read_json(response, BACKEND, Phase::Call).await?;

        let guard = match (&body.statement_handle, accepted) {
            (Some(handle), true) => Some(CancelOnDrop::new(
                self.authorized(self.http.post(format!("{}/cancel", self.statement_url(handle)))),
            )),
            _ => None,
        };

        let mut delay = POLL_INITIAL;
        while accepted {
            let handle = body
                .statement_handle
                .clone()
                .ok_or_else(|| GatewayError::backend(BACKEND, "running statement has no statement handle"))?;
            tokio::time::sleep(delay).await;
            delay = (delay * 2).min(POLL_MAX);

            let request = self.authorized(self.http.get(self.statement_url(&handle)));
            let response = http::send(request, BACKEND, "Failed to poll statement").await?;
            accepted = response.status() == reqwest::StatusCode::ACCEPTED;
            body = http::read_json(response, BACKEND, Phase::Call).await?;
            body.statement_handle.get_or_insert(handle);
        }
        if let Some(guard) = guard {
            guard.disarm();
        }

        self.collect(body, max_rows).await
    }

    async fn collect(&self, body: ResultSet, max_rows: usize) -> Result<QueryResult> {
        let Some(meta) = body.result_set_meta_data else {
            return Ok(QueryResult::default());
        };

        let mut result = QueryResult {
            columns: meta.row_type.iter().map(|c| c.name.clone()).collect(),
            rows_affected: body
                .stats
                .map(|s| s.num_rows_inserted + s.num_rows_updated + s.num_rows_deleted),
            ..QueryResult::default()
        };

        let mut data = body.data;
        let mut partition = 0;
        loop {
            for row in data {
                if result.rows.len() >= max_rows {
                    result.truncated = true;
                    return Ok(result);
                }
                result.rows.push(row.into_iter().zip(&meta.row_type).map(|(v, t)| convert_value(v, t)).collect());
            }

            partition += 1;
            let Some(handle) = body.statement_handle.as_deref().filter(|_| partition < meta.partition_info.len())
            else {
                return Ok(result);
            };
            let request = self
                .authorized(self.http.get(self.statement_url(handle)))
                .query(&[("partition", partition)]);
            let response = http::send(request, BACKEND, "Failed to fetch result partition").await?;
            let next: ResultSet = http::read_json(response, BACKEND, Phase::Call).await?;
            data = next.data;
        }
    }
}

/// `X-Snowflake-Authorization-Token-Type` header value
fn token_type(auth_scheme: &str) -> Option<&'static str> {
    match auth_scheme {
        "oauth" => Some("OAUTH"),
        "keypair_jwt" => Some("KEYPAIR_JWT"),
        "programmatic_access_token" => Some("PROGRAMMATIC_ACCESS_TOKEN"),
        _ => None,
    }
}

/// Unquoted when it is a plain identifier (Snowflake upper-cases those), quoted otherwise
fn identifier(name: &str) -> String {
    let mut chars = name.chars();
    let plain = chars.next().is_some_and(|c| c.is_ascii_alphabetic() || c == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '$');
    if plain {
        name.to_string()
    } else {
        quote_ident(name)
    }
}

fn qualify(table: &str) -> Result<String> {
    let parts: Vec<&str> = table.split('.').collect();
    if parts.len() > 3 || parts.iter().any(|p| p.trim().is_empty()) {
        return Err(GatewayError::invalid_argument(format!(
            "argument 'table' must be table, schema.table or database.schema.table, got '{table}'"
        )));
    }
    Ok(parts.iter().map(|p| identifier(p.trim())).collect::<Vec<_>>().join("."))
}

/// Convert one cell using its `rowType`
fn convert_value(value: Option<String>, column: &RowType) -> Value {
    let Some(text) = value else {
        return Value::Null;
    };

    match column.type_name.as_str() {
        "fixed" if column.scale.unwrap_or(0) == 0 => text.parse::<i64>().map_or(Value::String(text), Value::from),
        "real" => match text.parse::<f64>().ok().and_then(serde_json::Number::from_f64) {
            Some(n) => Value::Number(n),
            None => Value::String(text),
        },
        "boolean" => match text.as_str() {
            "true" => Value::Bool(true),
            "false" => Value::Bool(false),
            _ => Value::String(text),
        },
        "variant" | "object" | "array" => serde_json::from_str(&text).unwrap_or(Value::String(text)),
        _ => Value::String(text),
    }
}

fn named_column(result: &QueryResult, name: &str) -> Vec<Value> {
    let idx = result.columns.iter().position(|c| c == name).unwrap_or(0);
    result.rows.iter().filter_map(|row| row.get(idx).cloned()).collect()
}

/// `DESCRIBE TABLE` rows: name, type, kind, null?, default, primary key, ...
fn describe_rows(table: &str, result: &QueryResult) -> TableInfo {
    let column = |name: &str| result.columns.iter().position(|c| c.eq_ignore_ascii_case(name));
    let (name_idx, type_idx, null_idx, default_idx, pk_idx) =
        (column("name"), column("type"), column("null?"), column("default"), column("primary key"));

    let text = |row: &[Value], idx: Option<usize>| {
        idx.and_then(|i| row.get(i)).and_then(Value::as_str).map(str::to_string)
    };

    let mut columns = Vec::new();
    let mut primary_key = Vec::new();
    for row in &result.rows {
        let Some(name) = text(row, name_idx) else { continue };
        if text(row, pk_idx).as_deref() == Some("Y") {
            primary_key.push(name.clone());
        }
        columns.push(ColumnInfo {
            name,
            data_type: text(row, type_idx).unwrap_or_default(),
            nullable: text(row, null_idx).as_deref() != Some("N"),
            default: text(row, default_idx),
        });
    }

    let (schema, name) = match table.rsplit_once('.') {
        Some((schema, name)) => (Some(schema.to_string()), name.to_string()),
        None => (None, table.to_string()),
    };

    TableInfo {
        name,
        schema,
        columns,
        primary_key: (!primary_key.is_empty()).then_some(primary_key),
        foreign_keys: Vec::new(),
        indexes: Vec::new(),
    }
}
