//! Databricks SQL Warehouse Backend
//!
//! # Features
//! - Statement Execution API (`/api/2.0/sql/statements`) over HTTPS, bearer token
//! - Warehouse lifecycle: a stopped warehouse is started during the handshake
//!   and reported as suspended until it is `RUNNING`
//! - Catalog/schema/table browsing via `SHOW` and `DESCRIBE` statements
//!
//! # Implementation Notes
//! - Results use `INLINE` disposition and `JSON_ARRAY` format; every value
//!   arrives as a string and is converted using the manifest's column types
//! - Long statements are polled until terminal; dropping a call cancels the
//!   statement server-side
//! - The warehouse id is the last segment of `http_path`

use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

use super::http::{self, CancelOnDrop, Phase};
use crate::backend::{config_violation, quote_backtick, row_limit, Backend, ColumnInfo, QueryResult, TableInfo};
use crate::config::{Constraint, FieldSpec, ResolvedConfig};
use crate::error::{GatewayError, Result};
use crate::tools::{ArgSchema, ArgType, RegistryError, ToolArgs, ToolDescriptor, ToolOutput, ToolRegistry};

const BACKEND: &str = "databricks";

const POLL_INITIAL: Duration = Duration::from_millis(250);
const POLL_MAX: Duration = Duration::from_secs(5);

/// Databricks config fields
#[must_use]
pub fn config_fields() -> Vec<FieldSpec> {
    vec![
        FieldSpec::string("server_hostname")
            .env("DATABRICKS_SERVER_HOSTNAME")
            .required()
            .constraint(Constraint::NoScheme),
        FieldSpec::string("http_path").env("DATABRICKS_HTTP_PATH").required().constraint(Constraint::LeadingSlash),
        FieldSpec::string("access_token").env("DATABRICKS_TOKEN").required(),
        FieldSpec::string("catalog").env("DATABRICKS_CATALOG"),
        FieldSpec::string("schema").env("DATABRICKS_SCHEMA"),
        FieldSpec::string("api_base_url").env("DATABRICKS_API_BASE_URL").constraint(Constraint::HttpUrl),
    ]
}

/// Databricks SQL warehouse backend
#[derive(Debug, Clone, Copy, Default)]
pub struct DatabricksBackend;

/// Authenticated client bound to one warehouse
pub struct DatabricksSession {
    http: reqwest::Client,
    base_url: String,
    token: String,
    warehouse_id: String,
    catalog: Option<String>,
    schema: Option<String>,
}

impl std::fmt::Debug for DatabricksSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DatabricksSession")
            .field("base_url", &self.base_url)
            .field("warehouse_id", &self.warehouse_id)
            .finish_non_exhaustive()
    }
}

impl Backend for DatabricksBackend {
    type Session = DatabricksSession;

    fn name(&self) -> &'static str {
        BACKEND
    }

    async fn authenticate(&self, config: &ResolvedConfig) -> Result<DatabricksSession> {
        let session = DatabricksSession::from_config(config)?;
        let warehouse = session.warehouse(Phase::Handshake).await?;

        match warehouse.state.as_str() {
            "RUNNING" => {
                debug!(warehouse_id = %session.warehouse_id, "Databricks warehouse is running");
                Ok(session)
            }
            "STARTING" => Err(GatewayError::suspended(format!("warehouse {} is starting", session.warehouse_id))),
            "STOPPED" => {
                session.start_warehouse().await?;
                info!(warehouse_id = %session.warehouse_id, "Requested Databricks warehouse start");
                Err(GatewayError::suspended(format!("warehouse {} was stopped, start requested", session.warehouse_id)))
            }
            // Started once the stop completes, on the next attempt
            "STOPPING" => Err(GatewayError::suspended(format!("warehouse {} is stopping", session.warehouse_id))),
            "DELETING" | "DELETED" => Err(GatewayError::backend(
                BACKEND,
                format!("warehouse {} has been deleted", session.warehouse_id),
            )),
            other => Err(GatewayError::connection(format!(
                "warehouse {} is in unexpected state {other}",
                session.warehouse_id
            ))),
        }
    }

    async fn probe(&self, session: &DatabricksSession) -> bool {
        session.warehouse(Phase::Call).await.is_ok_and(|w| w.state == "RUNNING")
    }

    fn register_tools(&self, registry: &mut ToolRegistry<DatabricksSession>) -> std::result::Result<(), RegistryError> {
        registry.register(ToolDescriptor::new(
            "execute_query",
            "Execute one SQL statement on the Databricks SQL warehouse. Results are capped at \
             max_rows (default 1000).",
            ArgSchema::new()
                .required("sql", ArgType::String, "SQL statement (Databricks SQL dialect)")
                .optional("catalog", ArgType::String, "Catalog for unqualified names")
                .optional("schema", ArgType::String, "Schema for unqualified names")
                .optional("max_rows", ArgType::Integer, "Maximum rows to return"),
            tool_execute_query,
        ))?;
        registry.register(ToolDescriptor::new(
            "list_catalogs",
            "List Unity Catalog catalogs visible to the token.",
            ArgSchema::new(),
            tool_list_catalogs,
        ))?;
        registry.register(ToolDescriptor::new(
            "list_schemas",
            "List schemas in a catalog (default: the configured catalog).",
            ArgSchema::new().optional("catalog", ArgType::String, "Catalog name"),
            tool_list_schemas,
        ))?;
        registry.register(ToolDescriptor::new(
            "list_tables",
            "List tables in a schema (default: the configured catalog and schema).",
            ArgSchema::new()
                .optional("catalog", ArgType::String, "Catalog name")
                .optional("schema", ArgType::String, "Schema name"),
            tool_list_tables,
        ))?;
        registry.register(ToolDescriptor::new(
            "describe_table",
            "Describe a table's columns. Accepts `table`, `schema.table` or `catalog.schema.table`.",
            ArgSchema::new().required("table", ArgType::String, "Table name, optionally qualified"),
            tool_describe_table,
        ))?;
        registry.register(ToolDescriptor::new(
            "get_warehouse_status",
            "Report the SQL warehouse's state and size.",
            ArgSchema::new(),
            tool_get_warehouse_status,
        ))
    }
}

// ============================================================================
// Tool Handlers
// ============================================================================

async fn tool_execute_query(session: Arc<DatabricksSession>, args: ToolArgs) -> Result<ToolOutput> {
    let sql = args.require_str("sql")?;
    let context = StatementContext {
        catalog: args.str("catalog").or(session.catalog.as_deref()),
        schema: args.str("schema").or(session.schema.as_deref()),
    };
    let result = session.execute(sql, context, row_limit(&args)?).await?;
    ToolOutput::rows(&result)
}

async fn tool_list_catalogs(session: Arc<DatabricksSession>, _args: ToolArgs) -> Result<ToolOutput> {
    let result = session.execute("SHOW CATALOGS", StatementContext::default(), usize::MAX).await?;
    Ok(ToolOutput::json(json!({ "catalogs": first_column(&result) })))
}

async fn tool_list_schemas(session: Arc<DatabricksSession>, args: ToolArgs) -> Result<ToolOutput> {
    let catalog = args.str("catalog").or(session.catalog.as_deref());
    let sql = match catalog {
        Some(catalog) => format!("SHOW SCHEMAS IN {}", quote_backtick(catalog)),
        None => "SHOW SCHEMAS".to_string(),
    };

    let result = session.execute(&sql, StatementContext::default(), usize::MAX).await?;
    Ok(ToolOutput::json(json!({ "catalog": catalog, "schemas": first_column(&result) })))
}

async fn tool_list_tables(session: Arc<DatabricksSession>, args: ToolArgs) -> Result<ToolOutput> {
    let catalog = args.str("catalog").or(session.catalog.as_deref());
    let schema = args.str("schema").or(session.schema.as_deref());
    let sql = match (catalog, schema) {
        (Some(catalog), Some(schema)) => {
            format!("SHOW TABLES IN {}.{}", quote_backtick(catalog), quote_backtick(schema))
        }
        (None, Some(schema)) => format!("SHOW TABLES IN {}", quote_backtick(schema)),
        (_, None) => "SHOW TABLES".to_string(),
    };

    let result = session.execute(&sql, StatementContext::default(), usize::MAX).await?;
    let tables = named_column(&result, "tableName").unwrap_or_else(|| first_column(&result));
    Ok(ToolOutput::json(json!({ "catalog": catalog, "schema": schema, "tables": tables })))
}

async fn tool_describe_table(session: Arc<DatabricksSession>, args: ToolArgs) -> Result<ToolOutput> {
    let table = args.require_str("table")?;
    let qualified = qualify(table)?;
    let context = StatementContext { catalog: session.catalog.as_deref(), schema: session.schema.as_deref() };

    let result = session.execute(&format!("DESCRIBE TABLE {qualified}"), context, usize::MAX).await?;
    ToolOutput::serialize(&describe_rows(table, &result))
}

async fn tool_get_warehouse_status(session: Arc<DatabricksSession>, _args: ToolArgs) -> Result<ToolOutput> {
    let warehouse = session.warehouse(Phase::Call).await?;
    Ok(ToolOutput::json(json!({
        "warehouse_id": session.warehouse_id,
        "name": warehouse.name,
        "state": warehouse.state,
        "cluster_size": warehouse.cluster_size,
        "num_clusters": warehouse.num_clusters,
        "auto_stop_mins": warehouse.auto_stop_mins,
    })))
}

// ============================================================================
// REST Client
// ============================================================================

#[derive(Debug, Deserialize)]
struct WarehouseInfo {
    #[serde(default)]
    name: Option<String>,
    state: String,
    #[serde(default)]
    cluster_size: Option<String>,
    #[serde(default)]
    num_clusters: Option<u64>,
    #[serde(default)]
    auto_stop_mins: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct StatementResponse {
    statement_id: String,
    status: StatementStatus,
    #[serde(default)]
    manifest: Option<Manifest>,
    #[serde(default)]
    result: Option<ResultChunk>,
}

#[derive(Debug, Deserialize)]
struct StatementStatus {
    state: String,
    #[serde(default)]
    error: Option<StatementError>,
}

#[derive(Debug, Deserialize)]
struct StatementError {
    #[serde(default)]
    error_code: Option<String>,
    #[serde(default)]
    message: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Manifest {
    schema: ManifestSchema,
    #[serde(default)]
    truncated: bool,
}

#[derive(Debug, Deserialize)]
struct ManifestSchema {
    #[serde(default)]
    columns: Vec<ManifestColumn>,
}

#[derive(Debug, Deserialize)]
struct ManifestColumn {
    name: String,
    #[serde(default)]
    type_name: String,
}

#[derive(Debug, Default, Deserialize)]
struct ResultChunk {
    #[serde(default)]
    data_array: Vec<Vec<Option<String>>>,
    #[serde(default)]
    next_chunk_internal_link: Option<String>,
}

/// Default catalog and schema for one statement
#[derive(Debug, Clone, Copy, Default)]
struct StatementContext<'a> {
    catalog: Option<&'a str>,
    schema: Option<&'a str>,
}

impl DatabricksSession {
    fn from_config(config: &ResolvedConfig) -> Result<Self> {
        let host = config.require_str("server_hostname")?;
        let http_path = config.require_str("http_path")?;
        let token = config.require_str("access_token")?;

        let warehouse_id = warehouse_id(http_path)
            .ok_or_else(|| config_violation("http_path", "must end with the warehouse id"))?;

        Ok(Self {
            http: http::build_client(BACKEND)?,
            base_url: http::base_url(host, config.get_str("api_base_url")),
            token: token.to_string(),
            warehouse_id: warehouse_id.to_string(),
            catalog: config.get_str("catalog").map(str::to_string),
            schema: config.get_str("schema").map(str::to_string),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.base_url)
    }

    async fn warehouse(&self, phase: Phase) -> Result<WarehouseInfo> {
        let request = self
            .http
            .get(self.url(&format!("/api/2.0/sql/warehouses/{}", self.warehouse_id)))
            .bearer_auth(&self.token);
        let response = http::send(request, BACKEND, "Failed to reach Databricks").await?;

        if phase == Phase::Handshake && response.status() == reqwest::StatusCode::NOT_FOUND {
            return Err(config_violation("http_path", "no SQL warehouse with this id"));
        }
        http::read_json(response, BACKEND, phase).await
    }

    async fn start_warehouse(&self) -> Result<()> {
        let request = self
            .http
            .post(self.url(&format!("/api/2.0/sql/warehouses/{}/start", self.warehouse_id)))
            .bearer_auth(&self.token)
            .json(&json!({}));
        let response = http::send(request, BACKEND, "Failed to start Databricks warehouse").await?;
        http::read_json::<Value>(response, BACKEND, Phase::Handshake).await.map(|_| ())
    }

    /// Run one statement to completion and collect up to `max_rows` rows
    async fn execute(&self, sql: &str, context: StatementContext<'_>, max_rows: usize) -> Result<QueryResult> {
        let mut body = json!({
            "statement": sql,
            "warehouse_id": self.warehouse_id,
            "wait_timeout": "30s",
            "on_wait_timeout": "CONTINUE",
            "disposition": "INLINE",
            "format": "JSON_ARRAY",
        });
        if let Some(catalog) = context.catalog {
            body["catalog"] = json!(catalog);
        }
        if let Some(schema) = context.schema {
            body["schema"] = json!(schema);
        }
        if max_rows < usize::MAX {
            // One extra row reveals truncation
            body["row_limit"] = json!(max_rows.saturating_add(1));
        }

        let request = self.http.post(self.url("/api/2.0/sql/statements")).bearer_auth(&self.token).json(&body);
        let response = http::send(request, BACKEND, "Failed to submit statement").await?;
        let submitted: StatementResponse = http::read_json(response, BACKEND, Phase::Call).await?;

        let cancel = self
            .http
            .post(self.url(&format!("/api/2.0/sql/statements/{}/cancel", submitted.statement_id)))
            .bearer_auth(&self.token);
        let guard = CancelOnDrop::new(cancel);
        let finished = self.wait_for(submitted).await?;
        // Terminal either way; a failed statement has nothing left to cancel
        guard.disarm();

        match finished.status.state.as_str() {
            "SUCCEEDED" => self.collect(finished, max_rows).await,
            state => Err(statement_failure(state, finished.status.error.as_ref())),
        }
    }

    /// Poll a statement until it leaves `PENDING`/`RUNNING`
    async fn wait_for(&self, mut statement: StatementResponse) -> Result<StatementResponse> {
        let mut delay = POLL_INITIAL;
        while matches!(statement.status.state.as_str(), "PENDING" | "RUNNING") {
            tokio::time::sleep(delay).await;
            delay = (delay * 2).min(POLL_MAX);

            let request = self
                .http
                .get(self.url(&format!("/api/2.0/sql/statements/{}", statement.statement_id)))
                .bearer_auth(&self.token);
            let response = http::send(request, BACKEND, "Failed to poll statement").await?;
            statement = http::read_json(response, BACKEND, Phase::Call).await?;
        }
        Ok(statement)
    }

    async fn collect(&self, statement: StatementResponse, max_rows: usize) -> Result<QueryResult> {
        let Some(manifest) = statement.manifest else {
            return Ok(QueryResult::default());
        };

        let types: Vec<String> = manifest.schema.columns.iter().map(|c| c.type_name.to_ascii_uppercase()).collect();
        let mut result = QueryResult {
            columns: manifest.schema.columns.into_iter().map(|c| c.name).collect(),
            truncated: manifest.truncated,
            ..QueryResult::default()
        };

        let mut chunk = statement.result.unwrap_or_default();
        loop {
            for row in chunk.data_array {
                if result.rows.len() >= max_rows {
                    result.truncated = true;
                    return Ok(result);
                }
                result.rows.push(row.into_iter().zip(&types).map(|(v, t)| convert_value(v, t)).collect());
            }

            let Some(link) = chunk.next_chunk_internal_link else {
                return Ok(result);
            };
            let request = self.http.get(self.url(&link)).bearer_auth(&self.token);
            let response = http::send(request, BACKEND, "Failed to fetch result chunk").await?;
            chunk = http::read_json(response, BACKEND, Phase::Call).await?;
        }
    }
}

fn statement_failure(state: &str, error: Option<&StatementError>) -> GatewayError {
    let code = error.and_then(|e| e.error_code.as_deref()).unwrap_or("UNKNOWN");
    let message = error.and_then(|e| e.message.as_deref()).unwrap_or("no error message");
    let detail = format!("statement {}: {message} ({code})", state.to_ascii_lowercase());

    match code {
        "TEMPORARILY_UNAVAILABLE" | "RESOURCE_EXHAUSTED" => GatewayError::transient(BACKEND, detail),
        "UNAUTHENTICATED" | "PERMISSION_DENIED" => GatewayError::authentication(detail),
        _ => GatewayError::backend(BACKEND, detail),
    }
}

/// Warehouse id from an `http_path` like `/sql/1.0/warehouses/abc123`
fn warehouse_id(http_path: &str) -> Option<&str> {
    http_path.trim_end_matches('/').rsplit('/').next().filter(|id| !id.is_empty())
}

/// Backtick-quote each part of a dotted table name
fn qualify(table: &str) -> Result<String> {
    let parts: Vec<&str> = table.split('.').collect();
    if parts.len() > 3 || parts.iter().any(|p| p.trim().is_empty()) {
        return Err(GatewayError::invalid_argument(format!(
            "argument 'table' must be table, schema.table or catalog.schema.table, got '{table}'"
        )));
    }
    Ok(parts.iter().map(|p| quote_backtick(p.trim())).collect::<Vec<_>>().join("."))
}

/// Convert one `JSON_ARRAY` cell using its manifest type
fn convert_value(value: Option<String>, type_name: &str) -> Value {
    let Some(text) = value else {
        return Value::Null;
    };

    match type_name {
        "BYTE" | "SHORT" | "INT" | "LONG" | "TINYINT" | "SMALLINT" | "INTEGER" | "BIGINT" => {
            text.parse::<i64>().map_or(Value::String(text), Value::from)
        }
        "FLOAT" | "DOUBLE" => match text.parse::<f64>().ok().and_then(serde_json::Number::from_f64) {
            Some(n) => Value::Number(n),
            None => Value::String(text),
        },
        "BOOLEAN" => match text.as_str() {
            "true" => Value::Bool(true),
            "false" => Value::Bool(false),
            _ => Value::String(text),
        },
        // DECIMAL stays textual to keep its precision
        _ => Value::String(text),
    }
}

fn first_column(result: &QueryResult) -> Vec<Value> {
    result.rows.iter().filter_map(|row| row.first().cloned()).collect()
}

fn named_column(result: &QueryResult, name: &str) -> Option<Vec<Value>> {
    let idx = result.columns.iter().position(|c| c == name)?;
    Some(result.rows.iter().filter_map(|row| row.get(idx).cloned()).collect())
}

/// Column section of `DESCRIBE TABLE` output; partition and detail sections follow a blank or `#` row
fn describe_rows(table: &str, result: &QueryResult) -> TableInfo {
    let columns = result
        .rows
        .iter()
        .map_while(|row| {
            let name = row.first().and_then(Value::as_str)?;
            if name.is_empty() || name.starts_with('#') {
                return None;
            }
            Some(ColumnInfo {
                name: name.to_string(),
                data_type: row.get(1).and_then(Value::as_str).unwrap_or_default().to_string(),
                nullable: true,
                default: None,
            })
        })
        .collect();

    // `catalog.schema.table`, `schema.table` or `table`
    let mut parts = table.rsplit('.');
    let name = parts.next().unwrap_or(table).to_string();
    let schema = parts.next().map(str::to_string);

    TableInfo { name, schema, columns, primary_key: None, foreign_keys: Vec::new(), indexes: Vec::new() }
}
