//! MCP (Model Context Protocol) Server
//!
//! Manual JSON-RPC 2.0 over stdio, one JSON object per line.
//!
//! # Architecture
//!
//! - **Transport**: line-delimited JSON-RPC 2.0 on stdin/stdout; logs go to stderr
//! - **Dependencies**: `serde_json`, `tokio` and `anyhow` only (no MCP-specific crates)
//! - **Tools**: whatever the configured backend registers, listed with their
//!   JSON Schema from the tool registry
//!
//! # Concurrency
//!
//! Every `tools/call` runs as its own task, so a slow warehouse query does not
//! block `ping` or other calls. Responses funnel through a single writer task.
//! `notifications/cancelled` aborts the matching call; end of input aborts
//! every call still running.
//!
//! # Usage
//!
//! ```json
//! {
//!   "mcpServers": {
//!     "warehouse": {
//!       "command": "sqlgate",
//!       "args": ["serve", "--config", "/etc/sqlgate/databricks.toml"]
//!     }
//!   }
//! }
//! ```

use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::mpsc;
use tokio::task::{AbortHandle, JoinSet};
use tracing::{debug, info, warn};

use crate::backend::{Backend, BackendKind};
use crate::config::ResolvedConfig;
use crate::dispatch::ToolDispatcher;
use crate::output::ToolCallResult;

#[cfg(feature = "databricks")]
use crate::backend::databricks::DatabricksBackend;
#[cfg(feature = "postgres")]
use crate::backend::postgres::PostgresBackend;
#[cfg(feature = "snowflake")]
use crate::backend::snowflake::SnowflakeBackend;
#[cfg(feature = "sqlite")]
use crate::backend::sqlite::SqliteBackend;

/// MCP protocol revision this server speaks
pub const PROTOCOL_VERSION: &str = "2024-11-05";

const PARSE_ERROR: i32 = -32700;
const METHOD_NOT_FOUND: i32 = -32601;
const INVALID_PARAMS: i32 = -32602;
const INTERNAL_ERROR: i32 = -32603;

// ============================================================================
// JSON-RPC 2.0 Structures
// ============================================================================

/// JSON-RPC 2.0 Request (or notification, when `id` is absent)
#[derive(Debug, Deserialize)]
struct JsonRpcRequest {
    #[allow(dead_code)]
    jsonrpc: Option<String>,
    id: Option<Value>,
    method: String,
    params: Option<Value>,
}

/// JSON-RPC 2.0 Response
#[derive(Debug, Serialize)]
struct JsonRpcResponse {
    jsonrpc: &'static str,
    id: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<JsonRpcError>,
}

/// JSON-RPC 2.0 Error
#[derive(Debug, Serialize)]
struct JsonRpcError {
    code: i32,
    message: String,
}

impl JsonRpcResponse {
    const fn result(id: Option<Value>, result: Value) -> Self {
        Self { jsonrpc: "2.0", id, result: Some(result), error: None }
    }

    fn error(id: Option<Value>, code: i32, message: impl Into<String>) -> Self {
        Self { jsonrpc: "2.0", id, result: None, error: Some(JsonRpcError { code, message: message.into() }) }
    }
}

// ============================================================================
// MCP Tool Result Structures
// ============================================================================

/// Text content block for MCP tool results
#[derive(Debug, Serialize)]
struct TextContent {
    #[serde(rename = "type")]
    content_type: &'static str,
    text: String,
}

/// MCP tool call result
#[derive(Debug, Serialize)]
struct CallToolResult {
    content: Vec<TextContent>,
    #[serde(rename = "isError")]
    is_error: bool,
}

impl CallToolResult {
    /// Wrap a dispatcher envelope; failures set `isError` but stay tool results
    fn from_envelope(envelope: &ToolCallResult) -> Result<Value> {
        let text = serde_json::to_string_pretty(&envelope.to_json())?;
        let result = Self { content: vec![TextContent { content_type: "text", text }], is_error: !envelope.is_success() };
        Ok(serde_json::to_value(result)?)
    }
}

/// `tools/call` parameters
#[derive(Debug, Deserialize)]
struct CallParams {
    name: String,
    #[serde(default)]
    arguments: Option<Value>,
}

// ============================================================================
// MCP Server
// ============================================================================

/// Start the MCP server on stdio for the configured backend
///
/// # Errors
///
/// Returns an error if the backend is compiled out, its tools fail to
/// register, or stdio fails.
pub async fn serve(config: Arc<ResolvedConfig>) -> Result<()> {
    let kind = config
        .backend()
        .and_then(BackendKind::parse)
        .context("configuration does not select a backend")?;

    match kind {
        #[cfg(feature = "databricks")]
        BackendKind::Databricks => serve_stdio(DatabricksBackend, config).await,
        #[cfg(feature = "snowflake")]
        BackendKind::Snowflake => serve_stdio(SnowflakeBackend, config).await,
        #[cfg(feature = "postgres")]
        BackendKind::Postgres => serve_stdio(PostgresBackend, config).await,
        #[cfg(feature = "sqlite")]
        BackendKind::Sqlite => serve_stdio(SqliteBackend, config).await,
        #[allow(unreachable_patterns)]
        other => Err(anyhow!("backend '{other}' is not enabled in this build")),
    }
}

async fn serve_stdio<B: Backend>(backend: B, config: Arc<ResolvedConfig>) -> Result<()> {
    let dispatcher = ToolDispatcher::for_backend(backend, config)?;
    info!(backend = dispatcher.backend_name(), "MCP server listening on stdio");
    serve_io(dispatcher, BufReader::new(tokio::io::stdin()), tokio::io::stdout()).await
}

/// Run the JSON-RPC loop over any line reader and writer
///
/// Returns once `reader` reaches end of input and every response has been
/// written.
///
/// # Errors
///
/// Returns an error if reading or writing fails.
pub async fn serve_io<B, R, W>(dispatcher: ToolDispatcher<B>, reader: R, writer: W) -> Result<()>
where
    B: Backend,
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin + Send + 'static,
{
    let (tx, rx) = mpsc::unbounded_channel();
    let writer_task = tokio::spawn(write_responses(rx, writer));

    let mut server = Server { dispatcher, tx, calls: JoinSet::new(), in_flight: HashMap::new() };
    let mut lines = reader.lines();

    loop {
        tokio::select! {
            line = lines.next_line() => {
                let Some(line) = line.context("failed to read from stdin")? else { break };
                if !line.trim().is_empty() {
                    server.handle_line(&line);
                }
            }
            Some(_) = server.calls.join_next(), if !server.calls.is_empty() => {}
        }
    }

    if !server.calls.is_empty() {
        debug!(in_flight = server.calls.len(), "Input closed, aborting in-flight calls");
    }
    server.calls.abort_all();
    while server.calls.join_next().await.is_some() {}

    drop(server);
    writer_task.await.context("response writer panicked")?
}

async fn write_responses<W: AsyncWrite + Unpin>(mut rx: mpsc::UnboundedReceiver<JsonRpcResponse>, mut writer: W) -> Result<()> {
    while let Some(response) = rx.recv().await {
        let mut line = serde_json::to_string(&response)?;
        line.push('\n');
        writer.write_all(line.as_bytes()).await.context("failed to write to stdout")?;
        writer.flush().await?;
    }
    Ok(())
}

struct Server<B: Backend> {
    dispatcher: ToolDispatcher<B>,
    tx: mpsc::UnboundedSender<JsonRpcResponse>,
    calls: JoinSet<()>,
    /// Running `tools/call` tasks by JSON-encoded request id
    in_flight: HashMap<String, AbortHandle>,
}

impl<B: Backend> Server<B> {
    fn send(&self, response: JsonRpcResponse) {
        // The writer only stops once every sender is gone
        let _ = self.tx.send(response);
    }

    fn handle_line(&mut self, line: &str) {
        let request: JsonRpcRequest = match serde_json::from_str(line) {
            Ok(request) => request,
            Err(e) => {
                self.send(JsonRpcResponse::error(None, PARSE_ERROR, format!("Parse error: {e}")));
                return;
            }
        };

        let Some(id) = request.id else {
            self.handle_notification(&request.method, request.params.as_ref());
            return;
        };

        let response = match request.method.as_str() {
            "initialize" => JsonRpcResponse::result(Some(id), handle_initialize()),
            "ping" => JsonRpcResponse::result(Some(id), json!({})),
            "tools/list" => JsonRpcResponse::result(Some(id), self.handle_list_tools()),
            "tools/call" => {
                self.handle_call_tool(id, request.params);
                return;
            }
            method => JsonRpcResponse::error(Some(id), METHOD_NOT_FOUND, format!("Method not found: {method}")),
        };
        self.send(response);
    }

    fn handle_notification(&mut self, method: &str, params: Option<&Value>) {
        match method {
            "notifications/cancelled" => {
                let Some(request_id) = params.and_then(|p| p.get("requestId")) else {
                    return;
                };
                if let Some(handle) = self.in_flight.remove(&request_id.to_string()) {
                    debug!(request_id = %request_id, "Cancelling tool call");
                    handle.abort();
                }
            }
            "notifications/initialized" => debug!("Client initialized"),
            other => debug!(method = other, "Ignoring notification"),
        }
    }

    /// Returns the list of registered tools with their input schemas
    fn handle_list_tools(&self) -> Value {
        let tools: Vec<Value> = self
            .dispatcher
            .tools()
            .map(|tool| {
                json!({
                    "name": tool.name,
                    "description": tool.description,
                    "inputSchema": tool.args.to_json_schema(),
                })
            })
            .collect();
        json!({ "tools": tools })
    }

    fn handle_call_tool(&mut self, id: Value, params: Option<Value>) {
        let params: CallParams = match params.map(serde_json::from_value).transpose() {
            Ok(Some(params)) => params,
            Ok(None) => {
                self.send(JsonRpcResponse::error(Some(id), INVALID_PARAMS, "Missing params"));
                return;
            }
            Err(e) => {
                self.send(JsonRpcResponse::error(Some(id), INVALID_PARAMS, format!("Invalid params: {e}")));
                return;
            }
        };

        let dispatcher = self.dispatcher.clone();
        let tx = self.tx.clone();
        let key = id.to_string();
        let arguments = params.arguments.unwrap_or_else(|| json!({}));

        let handle = self.calls.spawn(async move {
            let envelope = dispatcher.dispatch(&params.name, &arguments).await;
            let response = match CallToolResult::from_envelope(&envelope) {
                Ok(result) => JsonRpcResponse::result(Some(id), result),
                Err(e) => {
                    warn!(tool = %params.name, error = %e, "Failed to encode tool result");
                    JsonRpcResponse::error(Some(id), INTERNAL_ERROR, format!("Internal error: {e}"))
                }
            };
            let _ = tx.send(response);
        });

        self.in_flight.retain(|_, running| !running.is_finished());
        self.in_flight.insert(key, handle);
    }
}

/// Handle MCP initialize request
///
/// Returns server capabilities and metadata.
fn handle_initialize() -> Value {
    json!({
        "protocolVersion": PROTOCOL_VERSION,
        "capabilities": {
            "tools": {}
        },
        "serverInfo": {
            "name": "sqlgate",
            "version": env!("CARGO_PKG_VERSION")
        }
    })
}
