//! `SQLite` Backend
//!
//! File-backed sessions over `rusqlite`.
//!
//! # Implementation Notes
//! - `rusqlite` is synchronous: every statement runs on the blocking pool
//!   with the session's connection locked
//! - A call abandoned mid-statement (timeout, cancellation) interrupts the
//!   running statement
//! - BLOB data is Base64-encoded for JSON safety
//! - Lock waits are bounded by `busy_timeout`; BUSY and LOCKED surface as
//!   transient backend errors
//! - Row limits enforced in application code
//! - No schema support (`SQLite` uses attached catalogs)

use parking_lot::Mutex;
use rusqlite::types::ValueRef;
use rusqlite::{Connection, ErrorCode, InterruptHandle, OpenFlags, Row};
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

use crate::backend::{
    config_violation, row_limit, Backend, ColumnInfo, ForeignKeyInfo, IndexInfo, QueryResult, TableInfo,
};
use crate::config::{ConfigError, FieldSpec, FieldViolation, ResolvedConfig};
use crate::error::{GatewayError, Result};
use crate::tools::{ArgSchema, ArgType, RegistryError, ToolArgs, ToolDescriptor, ToolOutput, ToolRegistry};

const BACKEND: &str = "sqlite";

const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// `SQLite` config fields
#[must_use]
pub fn config_fields() -> Vec<FieldSpec> {
    vec![
        FieldSpec::path("path").env("SQLITE_PATH").required(),
        FieldSpec::boolean("read_only").env("SQLITE_READ_ONLY").default_bool(false),
    ]
}

/// `SQLite` backend
#[derive(Debug, Clone, Copy, Default)]
pub struct SqliteBackend;

/// One open database connection
pub struct SqliteSession {
    conn: Arc<Mutex<Connection>>,
    interrupt: InterruptHandle,
    path: PathBuf,
}

impl SqliteSession {
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Run `work` on the blocking pool with the connection locked
    async fn run<T, F>(&self, work: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&Connection) -> Result<T> + Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        let mut guard = InterruptOnDrop { handle: &self.interrupt, armed: true };
        let outcome = tokio::task::spawn_blocking(move || work(&conn.lock())).await;
        guard.armed = false;
        outcome.map_err(|e| GatewayError::backend(BACKEND, format!("SQLite worker failed: {e}")))?
    }
}

impl std::fmt::Debug for SqliteSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteSession").field("path", &self.path).finish_non_exhaustive()
    }
}

/// Interrupts the running statement if the awaiting future is dropped
struct InterruptOnDrop<'a> {
    handle: &'a InterruptHandle,
    armed: bool,
}

impl Drop for InterruptOnDrop<'_> {
    fn drop(&mut self) {
        if self.armed {
            debug!("Interrupting abandoned SQLite statement");
            self.handle.interrupt();
        }
    }
}

impl Backend for SqliteBackend {
    type Session = SqliteSession;

    fn name(&self) -> &'static str {
        BACKEND
    }

    async fn authenticate(&self, config: &ResolvedConfig) -> Result<SqliteSession> {
        let path = config
            .get_path("path")
            .ok_or_else(|| GatewayError::from(ConfigError::invalid(vec![FieldViolation::missing("path")])))?
            .to_path_buf();
        let read_only = config.get_bool("read_only").unwrap_or(false);

        let open_path = path.clone();
        let conn = tokio::task::spawn_blocking(move || open_connection(&open_path, read_only))
            .await
            .map_err(|e| GatewayError::connection(format!("SQLite open task failed: {e}")))??;

        debug!(path = %path.display(), read_only, "Opened SQLite database");
        let interrupt = conn.get_interrupt_handle();
        Ok(SqliteSession { conn: Arc::new(Mutex::new(conn)), interrupt, path })
    }

    async fn probe(&self, session: &SqliteSession) -> bool {
        session
            .run(|conn| {
                conn.query_row("SELECT 1", [], |row| row.get::<_, i64>(0))
                    .map_err(|e| query_error(&e, "probe"))
            })
            .await
            .is_ok()
    }

    fn register_tools(&self, registry: &mut ToolRegistry<SqliteSession>) -> std::result::Result<(), RegistryError> {
        registry.register(ToolDescriptor::new(
            "execute_query",
            "Execute one SQL statement against the SQLite database. SELECT results are capped at max_rows \
             (default 1000); other statements report rows_affected.",
            ArgSchema::new()
                .required("sql", ArgType::String, "SQL statement (SQLite dialect)")
                .optional("max_rows", ArgType::Integer, "Maximum rows to return"),
            tool_execute_query,
        ))?;
        registry.register(ToolDescriptor::new(
            "list_tables",
            "List tables and views in the database.",
            ArgSchema::new(),
            tool_list_tables,
        ))?;
        registry.register(ToolDescriptor::new(
            "describe_table",
            "Describe a table: columns, primary key, foreign keys and indexes.",
            ArgSchema::new().required("table", ArgType::String, "Table name"),
            tool_describe_table,
        ))
    }
}

// ============================================================================
// Tool Handlers
// ============================================================================

async fn tool_execute_query(session: Arc<SqliteSession>, args: ToolArgs) -> Result<ToolOutput> {
    let sql = args.require_str("sql")?.to_string();
    let max_rows = row_limit(&args)?;
    let result = session.run(move |conn| run_statement(conn, &sql, max_rows)).await?;
    ToolOutput::rows(&result)
}

async fn tool_list_tables(session: Arc<SqliteSession>, _args: ToolArgs) -> Result<ToolOutput> {
    let tables = session.run(list_tables).await?;
    Ok(ToolOutput::json(json!({ "tables": tables })))
}

async fn tool_describe_table(session: Arc<SqliteSession>, args: ToolArgs) -> Result<ToolOutput> {
    let table = args.require_str("table")?.to_string();
    let info = session.run(move |conn| introspect_table(conn, &table)).await?;
    ToolOutput::serialize(&info)
}

// ============================================================================
// Driver Helpers
// ============================================================================

/// Open `SQLite` connection with appropriate flags
fn open_connection(path: &Path, read_only: bool) -> Result<Connection> {
    let flags = if read_only {
        OpenFlags::SQLITE_OPEN_READ_ONLY
    } else {
        OpenFlags::SQLITE_OPEN_READ_WRITE | OpenFlags::SQLITE_OPEN_CREATE
    };

    let conn = Connection::open_with_flags(path, flags).map_err(|e| open_error(&e))?;
    conn.busy_timeout(BUSY_TIMEOUT).map_err(|e| open_error(&e))?;

    // A file that is not a database only fails on first read
    conn.query_row("SELECT count(*) FROM sqlite_master", [], |row| row.get::<_, i64>(0))
        .map_err(|e| open_error(&e))?;

    Ok(conn)
}

fn sqlite_code(err: &rusqlite::Error) -> Option<ErrorCode> {
    match err {
        rusqlite::Error::SqliteFailure(failure, _) => Some(failure.code),
        _ => None,
    }
}

/// Classify a failure while opening the database
fn open_error(err: &rusqlite::Error) -> GatewayError {
    match sqlite_code(err) {
        Some(ErrorCode::CannotOpen | ErrorCode::NotADatabase) => {
            config_violation("path", "must name a readable SQLite database")
        }
        Some(ErrorCode::AuthorizationForStatementDenied | ErrorCode::PermissionDenied) => {
            GatewayError::authentication("SQLite database access denied")
        }
        Some(ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked) => {
            GatewayError::connection(format!("SQLite database is busy: {err}"))
        }
        _ => GatewayError::connection(format!("Failed to open SQLite database: {err}")),
    }
}

/// Classify a failure while running a statement
fn query_error(err: &rusqlite::Error, context: &str) -> GatewayError {
    match sqlite_code(err) {
        Some(ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked) => {
            GatewayError::transient(BACKEND, format!("{context}: {err}"))
        }
        Some(ErrorCode::OperationInterrupted) => {
            GatewayError::backend(BACKEND, format!("{context}: statement interrupted"))
        }
        _ => GatewayError::backend(BACKEND, format!("{context}: {err}")),
    }
}

/// Execute one statement and return `QueryResult`
fn run_statement(conn: &Connection, sql: &str, max_rows: usize) -> Result<QueryResult> {
    let mut stmt = conn.prepare(sql).map_err(|e| query_error(&e, "Failed to prepare query"))?;

    let columns: Vec<String> = stmt.column_names().iter().map(|s| (*s).to_string()).collect();

    // Statements without result columns (INSERT, UPDATE, DELETE, DDL)
    if columns.is_empty() {
        let changed = stmt.execute([]).map_err(|e| query_error(&e, "Failed to execute query"))?;
        return Ok(QueryResult { rows_affected: Some(changed as u64), ..QueryResult::default() });
    }

    let mut rows = stmt.query([]).map_err(|e| query_error(&e, "Failed to execute query"))?;
    let mut data = Vec::new();
    let mut truncated = false;

    while let Some(row) = rows.next().map_err(|e| query_error(&e, "Failed to fetch row"))? {
        if data.len() >= max_rows {
            truncated = true;
            break;
        }
        data.push(row_to_json(columns.len(), row).map_err(|e| query_error(&e, "Failed to decode row"))?);
    }

    Ok(QueryResult { columns, rows: data, rows_affected: None, truncated })
}

fn list_tables(conn: &Connection) -> Result<Vec<Value>> {
    let mut stmt = conn
        .prepare(
            "SELECT name, type FROM sqlite_master
             WHERE type IN ('table', 'view')
             AND name NOT LIKE 'sqlite_%'
             ORDER BY name",
        )
        .map_err(|e| query_error(&e, "Failed to query tables"))?;

    let tables = stmt
        .query_map([], |row| {
            Ok(json!({ "name": row.get::<_, String>(0)?, "type": row.get::<_, String>(1)? }))
        })
        .map_err(|e| query_error(&e, "Failed to fetch table names"))?
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(|e| query_error(&e, "Failed to collect table names"));
    tables
}

/// Introspect a single table and return `TableInfo`
fn introspect_table(conn: &Connection, table_name: &str) -> Result<TableInfo> {
    let context = format!("Failed to describe {table_name}");

    // (cid, name, type, notnull, dflt_value, pk)
    let mut stmt = conn
        .prepare("SELECT name, type, \"notnull\", dflt_value, pk FROM pragma_table_info(?1) ORDER BY cid")
        .map_err(|e| query_error(&e, &context))?;

    let mut primary_key_columns: Vec<(i64, String)> = Vec::new();
    let columns: Vec<ColumnInfo> = stmt
        .query_map([table_name], |row| {
            let column = ColumnInfo {
                name: row.get(0)?,
                data_type: row.get(1)?,
                nullable: row.get::<_, i64>(2)? == 0,
                default: row.get(3)?,
            };
            Ok((column, row.get::<_, i64>(4)?))
        })
        .map_err(|e| query_error(&e, &context))?
        .map(|r| {
            r.map(|(column, pk)| {
                if pk > 0 {
                    primary_key_columns.push((pk, column.name.clone()));
                }
                column
            })
        })
        .collect::<std::result::Result<_, _>>()
        .map_err(|e| query_error(&e, &context))?;

    if columns.is_empty() {
        return Err(GatewayError::backend(BACKEND, format!("no such table: {table_name}")));
    }

    primary_key_columns.sort();
    let primary_key = if primary_key_columns.is_empty() {
        None
    } else {
        Some(primary_key_columns.into_iter().map(|(_, name)| name).collect())
    };

    // Foreign keys grouped by constraint id
    let mut fk_stmt = conn
        .prepare("SELECT id, \"table\", \"from\", \"to\" FROM pragma_foreign_key_list(?1) ORDER BY id, seq")
        .map_err(|e| query_error(&e, &context))?;

    let mut fk_map: BTreeMap<i64, (String, Vec<String>, Vec<String>)> = BTreeMap::new();
    let fk_rows = fk_stmt
        .query_map([table_name], |row| {
            Ok((
                row.get::<_, i64>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, Option<String>>(3)?,
            ))
        })
        .map_err(|e| query_error(&e, &context))?;

    for fk in fk_rows {
        let (id, ref_table, from_col, to_col) = fk.map_err(|e| query_error(&e, &context))?;
        let entry = fk_map.entry(id).or_insert_with(|| (ref_table, Vec::new(), Vec::new()));
        entry.1.push(from_col);
        // `to` is NULL when the reference targets the parent's primary key
        entry.2.extend(to_col);
    }

    let foreign_keys = fk_map
        .into_iter()
        .map(|(id, (referenced_table, columns, referenced_columns))| ForeignKeyInfo {
            name: format!("fk_{table_name}_{id}"),
            columns,
            referenced_table,
            referenced_columns,
        })
        .collect();

    let mut idx_stmt = conn
        .prepare("SELECT name, \"unique\" FROM pragma_index_list(?1) ORDER BY name")
        .map_err(|e| query_error(&e, &context))?;

    let index_list: Vec<(String, bool)> = idx_stmt
        .query_map([table_name], |row| Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)? != 0)))
        .map_err(|e| query_error(&e, &context))?
        .collect::<std::result::Result<_, _>>()
        .map_err(|e| query_error(&e, &context))?;

    let mut indexes = Vec::new();
    for (index_name, unique) in index_list {
        // Created implicitly for PRIMARY KEY and UNIQUE constraints
        if index_name.starts_with("sqlite_autoindex_") {
            continue;
        }

        let mut info_stmt = conn
            .prepare("SELECT name FROM pragma_index_info(?1) ORDER BY seqno")
            .map_err(|e| query_error(&e, &context))?;
        let index_columns: Vec<String> = info_stmt
            .query_map([&index_name], |row| row.get::<_, Option<String>>(0))
            .map_err(|e| query_error(&e, &context))?
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(|e| query_error(&e, &context))?
            .into_iter()
            .flatten()
            .collect();

        indexes.push(IndexInfo { name: index_name, columns: index_columns, unique });
    }

    Ok(TableInfo { name: table_name.to_string(), schema: None, columns, primary_key, foreign_keys, indexes })
}

/// Convert a `SQLite` row to a JSON-safe `Vec`
fn row_to_json(width: usize, row: &Row) -> std::result::Result<Vec<Value>, rusqlite::Error> {
    (0..width).map(|idx| sqlite_value_to_json(row, idx)).collect()
}

/// Convert `SQLite` value to JSON value
fn sqlite_value_to_json(row: &Row, idx: usize) -> std::result::Result<Value, rusqlite::Error> {
    Ok(match row.get_ref(idx)? {
        ValueRef::Null => Value::Null,
        ValueRef::Integer(i) => Value::Number(i.into()),
        // NaN and infinities have no JSON form
        ValueRef::Real(f) => serde_json::Number::from_f64(f).map_or(Value::Null, Value::Number),
        ValueRef::Text(s) => Value::String(String::from_utf8_lossy(s).into_owned()),
        ValueRef::Blob(b) => {
            use base64::Engine;
            Value::String(base64::engine::general_purpose::STANDARD.encode(b))
        }
    })
}
