//! `PostgreSQL` Backend
//!
//! # Features
//! - Client-server sessions via TCP (`tokio-postgres`, no TLS)
//! - Schema introspection via `information_schema` and `pg_indexes`
//! - Rich type conversion (JSON/JSONB, timestamps, UUID, NUMERIC)
//!
//! # Implementation Notes
//! - Each session owns one client; its connection future runs in a spawned task
//! - BYTEA data is Base64-encoded for JSON safety
//! - NUMERIC is rendered as a decimal string so no precision is lost
//! - Row limits enforced while streaming, the rest of the result is discarded
//! - SQLSTATE classes map onto the error taxonomy: 28xxx authentication,
//!   57P03 suspended, 08xxx connection, 40001/40P01/55P03/57014 and 53xxx transient

use futures::{pin_mut, TryStreamExt};
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_postgres::types::{FromSql, Type};
use tokio_postgres::{Client, Config, NoTls, Row};
use tracing::debug;

use crate::backend::{
    config_violation, row_limit, Backend, ColumnInfo, ForeignKeyInfo, IndexInfo, QueryResult, TableInfo,
};
use crate::config::{FieldSpec, ResolvedConfig};
use crate::error::{GatewayError, Result};
use crate::tools::{ArgSchema, ArgType, RegistryError, ToolArgs, ToolDescriptor, ToolOutput, ToolRegistry};

const BACKEND: &str = "postgres";

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// `PostgreSQL` config fields, with libpq's environment variable names
#[must_use]
pub fn config_fields() -> Vec<FieldSpec> {
    vec![
        FieldSpec::string("host").env("PGHOST").required(),
        FieldSpec::positive_int("port").env("PGPORT").default_int(5432),
        FieldSpec::string("user").env("PGUSER").required(),
        FieldSpec::string("password").env("PGPASSWORD"),
        FieldSpec::string("database").env("PGDATABASE").required(),
    ]
}

/// `PostgreSQL` backend
#[derive(Debug, Clone, Copy, Default)]
pub struct PostgresBackend;

/// One authenticated client
pub struct PostgresSession {
    client: Client,
    connection: JoinHandle<()>,
}

impl PostgresSession {
    #[must_use]
    pub const fn client(&self) -> &Client {
        &self.client
    }
}

impl Drop for PostgresSession {
    fn drop(&mut self) {
        self.connection.abort();
    }
}

impl Backend for PostgresBackend {
    type Session = PostgresSession;

    fn name(&self) -> &'static str {
        BACKEND
    }

    async fn authenticate(&self, config: &ResolvedConfig) -> Result<PostgresSession> {
        let pg_config = build_pg_config(config)?;

        let (client, connection) = pg_config.connect(NoTls).await.map_err(|e| connect_error(&e))?;

        // Connection errors are not logged: they can carry connection parameters
        let connection = tokio::spawn(async move {
            let _ = connection.await;
        });

        debug!(host = config.get_str("host").unwrap_or_default(), "Connected to PostgreSQL");
        Ok(PostgresSession { client, connection })
    }

    async fn probe(&self, session: &PostgresSession) -> bool {
        !session.client.is_closed() && session.client.simple_query("SELECT 1").await.is_ok()
    }

    fn register_tools(&self, registry: &mut ToolRegistry<PostgresSession>) -> std::result::Result<(), RegistryError> {
        registry.register(ToolDescriptor::new(
            "execute_query",
            "Execute one SQL statement against PostgreSQL. SELECT results are capped at max_rows \
             (default 1000); other statements report rows_affected.",
            ArgSchema::new()
                .required("sql", ArgType::String, "SQL statement (PostgreSQL dialect)")
                .optional("max_rows", ArgType::Integer, "Maximum rows to return"),
            tool_execute_query,
        ))?;
        registry.register(ToolDescriptor::new(
            "list_schemas",
            "List user schemas in the current database.",
            ArgSchema::new(),
            tool_list_schemas,
        ))?;
        registry.register(ToolDescriptor::new(
            "list_tables",
            "List base tables in a schema (default: the current schema).",
            ArgSchema::new().optional("schema", ArgType::String, "Schema name"),
            tool_list_tables,
        ))?;
        registry.register(ToolDescriptor::new(
            "describe_table",
            "Describe a table: columns, primary key, foreign keys and indexes.",
            ArgSchema::new()
                .required("table", ArgType::String, "Table name")
                .optional("schema", ArgType::String, "Schema name (default: the current schema)"),
            tool_describe_table,
        ))
    }
}

// ============================================================================
// Tool Handlers
// ============================================================================

async fn tool_execute_query(session: Arc<PostgresSession>, args: ToolArgs) -> Result<ToolOutput> {
    let sql = args.require_str("sql")?;
    let result = run_statement(&session.client, sql, row_limit(&args)?).await?;
    ToolOutput::rows(&result)
}

async fn tool_list_schemas(session: Arc<PostgresSession>, _args: ToolArgs) -> Result<ToolOutput> {
    let query = "
        SELECT schema_name
        FROM information_schema.schemata
        WHERE schema_name <> 'information_schema'
        AND schema_name NOT LIKE 'pg\\_%'
        ORDER BY schema_name";

    let rows = session.client.query(query, &[]).await.map_err(|e| query_error(&e, "Failed to list schemas"))?;
    let schemas: Vec<String> = rows.iter().map(|row| row.get(0)).collect();

    Ok(ToolOutput::json(json!({ "schemas": schemas })))
}

async fn tool_list_tables(session: Arc<PostgresSession>, args: ToolArgs) -> Result<ToolOutput> {
    let schema = target_schema(&session.client, args.str("schema")).await?;
    let query = "
        SELECT table_name
        FROM information_schema.tables
        WHERE table_schema = $1
        AND table_type = 'BASE TABLE'
        ORDER BY table_name";

    let rows = session
        .client
        .query(query, &[&schema])
        .await
        .map_err(|e| query_error(&e, &format!("Failed to list tables in schema '{schema}'")))?;
    let tables: Vec<String> = rows.iter().map(|row| row.get(0)).collect();

    Ok(ToolOutput::json(json!({ "schema": schema, "tables": tables })))
}

async fn tool_describe_table(session: Arc<PostgresSession>, args: ToolArgs) -> Result<ToolOutput> {
    let table = args.require_str("table")?;
    let schema = target_schema(&session.client, args.str("schema")).await?;
    let info = describe_table(&session.client, &schema, table).await?;
    ToolOutput::serialize(&info)
}

// ============================================================================
// Driver Helpers
// ============================================================================

/// Build `PostgreSQL` connection config from the resolved configuration
fn build_pg_config(config: &ResolvedConfig) -> Result<Config> {
    let host = config.require_str("host")?;
    let user = config.require_str("user")?;
    let database = config.require_str("database")?;
    let port = u16::try_from(config.get_u64("port").unwrap_or(5432))
        .map_err(|_| config_violation("port", "must be a TCP port number"))?;

    let mut pg_config = Config::new();
    pg_config
        .host(host)
        .port(port)
        .user(user)
        .dbname(database)
        .application_name("sqlgate")
        .connect_timeout(CONNECT_TIMEOUT);

    if let Some(password) = config.get_str("password").filter(|p| !p.is_empty()) {
        pg_config.password(password);
    }

    Ok(pg_config)
}

fn is_io_error(err: &tokio_postgres::Error) -> bool {
    std::error::Error::source(err).is_some_and(|source| source.is::<std::io::Error>())
}

/// Classify a failure while connecting
fn connect_error(err: &tokio_postgres::Error) -> GatewayError {
    let Some(db) = err.as_db_error() else {
        // The server asked for a password and none is configured; retrying cannot help
        if err.to_string().contains("password missing") {
            return GatewayError::authentication(
                "PostgreSQL requires a password but none is configured (set password or PGPASSWORD)",
            );
        }
        return GatewayError::connection(format!("Failed to connect to PostgreSQL: {err}"));
    };

    match db.code().code() {
        code if code.starts_with("28") => {
            GatewayError::authentication(format!("PostgreSQL rejected the credentials: {}", db.message()))
        }
        "57P03" => GatewayError::suspended(format!("PostgreSQL is not accepting connections yet: {}", db.message())),
        "3D000" => config_violation("database", "database does not exist"),
        // 53300 too_many_connections and anything else the server refuses with
        code => GatewayError::connection(format!("PostgreSQL refused the connection: {} ({code})", db.message())),
    }
}

/// Classify a failure while running a statement
fn query_error(err: &tokio_postgres::Error, context: &str) -> GatewayError {
    if let Some(db) = err.as_db_error() {
        let code = db.code().code();
        let detail = format!("{context}: {} ({code})", db.message());
        return match code {
            "40001" | "40P01" | "55P03" | "57014" => GatewayError::transient(BACKEND, detail),
            "57P03" => GatewayError::suspended(detail),
            "57P01" | "57P02" => GatewayError::connection(detail),
            c if c.starts_with("08") => GatewayError::connection(detail),
            c if c.starts_with("53") => GatewayError::transient(BACKEND, detail),
            c if c.starts_with("28") => GatewayError::authentication(detail),
            _ => GatewayError::backend(BACKEND, detail),
        };
    }

    if err.is_closed() || is_io_error(err) {
        GatewayError::connection(format!("{context}: {err}"))
    } else {
        GatewayError::backend(BACKEND, format!("{context}: {err}"))
    }
}

/// Requested schema, or the session's current schema
async fn target_schema(client: &Client, requested: Option<&str>) -> Result<String> {
    if let Some(schema) = requested {
        return Ok(schema.to_string());
    }

    let row = client
        .query_one("SELECT current_schema()", &[])
        .await
        .map_err(|e| query_error(&e, "Failed to query current schema"))?;
    Ok(row.get(0))
}

async fn describe_table(client: &Client, schema: &str, table_name: &str) -> Result<TableInfo> {
    let columns = introspect_columns(client, schema, table_name).await?;
    if columns.is_empty() {
        return Err(GatewayError::backend(
            BACKEND,
            format!("Table '{table_name}' not found in schema '{schema}'"),
        ));
    }

    Ok(TableInfo {
        name: table_name.to_string(),
        schema: Some(schema.to_string()),
        columns,
        primary_key: introspect_primary_key(client, schema, table_name).await?,
        foreign_keys: introspect_foreign_keys(client, schema, table_name).await?,
        indexes: introspect_indexes(client, schema, table_name).await?,
    })
}

async fn introspect_columns(client: &Client, schema: &str, table_name: &str) -> Result<Vec<ColumnInfo>> {
    let query = "
        SELECT column_name, data_type, is_nullable, column_default
        FROM information_schema.columns
        WHERE table_schema = $1 AND table_name = $2
        ORDER BY ordinal_position";

    let rows = client
        .query(query, &[&schema, &table_name])
        .await
        .map_err(|e| query_error(&e, &format!("Failed to query columns for {schema}.{table_name}")))?;

    Ok(rows
        .iter()
        .map(|row| ColumnInfo {
            name: row.get(0),
            data_type: row.get(1),
            nullable: row.get::<_, String>(2) == "YES",
            default: row.get(3),
        })
        .collect())
}

async fn introspect_primary_key(client: &Client, schema: &str, table_name: &str) -> Result<Option<Vec<String>>> {
    let query = "
        SELECT kcu.column_name
        FROM information_schema.table_constraints tc
        JOIN information_schema.key_column_usage kcu
          ON tc.constraint_name = kcu.constraint_name
          AND tc.table_schema = kcu.table_schema
        WHERE tc.constraint_type = 'PRIMARY KEY'
          AND tc.table_schema = $1
          AND tc.table_name = $2
        ORDER BY kcu.ordinal_position";

    let rows = client
        .query(query, &[&schema, &table_name])
        .await
        .map_err(|e| query_error(&e, &format!("Failed to query primary key for {schema}.{table_name}")))?;

    if rows.is_empty() {
        return Ok(None);
    }
    Ok(Some(rows.iter().map(|row| row.get(0)).collect()))
}

async fn introspect_foreign_keys(client: &Client, schema: &str, table_name: &str) -> Result<Vec<ForeignKeyInfo>> {
    let query = "
        SELECT
            tc.constraint_name,
            kcu.column_name,
            ccu.table_name AS foreign_table_name,
            ccu.column_name AS foreign_column_name
        FROM information_schema.table_constraints AS tc
        JOIN information_schema.key_column_usage AS kcu
          ON tc.constraint_name = kcu.constraint_name
          AND tc.table_schema = kcu.table_schema
        JOIN information_schema.constraint_column_usage AS ccu
          ON ccu.constraint_name = tc.constraint_name
          AND ccu.table_schema = tc.table_schema
        WHERE tc.constraint_type = 'FOREIGN KEY'
          AND tc.table_schema = $1
          AND tc.table_name = $2
        ORDER BY tc.constraint_name, kcu.ordinal_position";

    let rows = client
        .query(query, &[&schema, &table_name])
        .await
        .map_err(|e| query_error(&e, &format!("Failed to query foreign keys for {schema}.{table_name}")))?;

    // Grouped by constraint name
    let mut fk_map: BTreeMap<String, (Vec<String>, String, Vec<String>)> = BTreeMap::new();
    for row in rows {
        let entry = fk_map
            .entry(row.get(0))
            .or_insert_with(|| (Vec::new(), row.get(2), Vec::new()));
        entry.0.push(row.get(1));
        entry.2.push(row.get(3));
    }

    Ok(fk_map
        .into_iter()
        .map(|(name, (columns, referenced_table, referenced_columns))| ForeignKeyInfo {
            name,
            columns,
            referenced_table,
            referenced_columns,
        })
        .collect())
}

async fn introspect_indexes(client: &Client, schema: &str, table_name: &str) -> Result<Vec<IndexInfo>> {
    let query = "
        SELECT indexname, indexdef
        FROM pg_indexes
        WHERE schemaname = $1 AND tablename = $2
        ORDER BY indexname";

    let rows = client
        .query(query, &[&schema, &table_name])
        .await
        .map_err(|e| query_error(&e, &format!("Failed to query indexes for {schema}.{table_name}")))?;

    let mut indexes = Vec::new();
    for row in rows {
        let index_name: String = row.get(0);
        let index_def: String = row.get(1);

        // Primary key indexes are reported as `primary_key`
        if index_name.ends_with("_pkey") {
            continue;
        }

        indexes.push(IndexInfo {
            columns: extract_index_columns(&index_def),
            unique: index_def.starts_with("CREATE UNIQUE INDEX"),
            name: index_name,
        });
    }

    Ok(indexes)
}

/// Column list of an index definition
///
/// `CREATE INDEX idx ON public.users USING btree (lower(email), id) WHERE ...`
/// yields `["lower(email)", "id"]`.
fn extract_index_columns(index_def: &str) -> Vec<String> {
    let Some(using) = index_def.find(" USING ") else {
        return Vec::new();
    };
    let Some(open) = index_def[using..].find('(').map(|i| using + i) else {
        return Vec::new();
    };

    let mut depth = 0usize;
    let mut columns = Vec::new();
    let mut current = String::new();
    for ch in index_def[open + 1..].chars() {
        match ch {
            '(' => {
                depth += 1;
                current.push(ch);
            }
            ')' if depth == 0 => break,
            ')' => {
                depth -= 1;
                current.push(ch);
            }
            ',' if depth == 0 => columns.push(std::mem::take(&mut current).trim().to_string()),
            _ => current.push(ch),
        }
    }
    if !current.trim().is_empty() {
        columns.push(current.trim().to_string());
    }
    columns
}

/// Execute one statement and return `QueryResult`
async fn run_statement(client: &Client, sql: &str, max_rows: usize) -> Result<QueryResult> {
    let stmt = client.prepare(sql).await.map_err(|e| query_error(&e, "Failed to prepare query"))?;

    // Statements without result columns (INSERT, UPDATE, DELETE, DDL)
    if stmt.columns().is_empty() {
        let rows_affected = client
            .execute(&stmt, &[])
            .await
            .map_err(|e| query_error(&e, "Failed to execute query"))?;
        return Ok(QueryResult { rows_affected: Some(rows_affected), ..QueryResult::default() });
    }

    let columns: Vec<String> = stmt.columns().iter().map(|c| c.name().to_string()).collect();
    let stream = client
        .query_raw(&stmt, Vec::<String>::new())
        .await
        .map_err(|e| query_error(&e, "Failed to execute query"))?;
    pin_mut!(stream);

    let mut rows = Vec::new();
    let mut truncated = false;
    while let Some(row) = stream.try_next().await.map_err(|e| query_error(&e, "Failed to fetch row"))? {
        if rows.len() >= max_rows {
            truncated = true;
            break;
        }
        rows.push(row_to_json(&row)?);
    }

    Ok(QueryResult { columns, rows, rows_affected: None, truncated })
}

/// Convert a `PostgreSQL` row to a JSON-safe `Vec`
fn row_to_json(row: &Row) -> Result<Vec<Value>> {
    (0..row.len()).map(|idx| postgres_value_to_json(row, idx)).collect()
}

/// Decode a nullable cell as `T` and map it to JSON
fn cell<'a, T: FromSql<'a>>(row: &'a Row, idx: usize, to_json: impl FnOnce(T) -> Value) -> Result<Value> {
    row.try_get::<_, Option<T>>(idx).map(|v| v.map_or(Value::Null, to_json)).map_err(|e| {
        let column = &row.columns()[idx];
        GatewayError::backend(
            BACKEND,
            format!(
                "Column '{}' of type '{}' has no JSON conversion ({e}); cast it to text",
                column.name(),
                column.type_().name()
            ),
        )
    })
}

fn float_to_json(v: f64) -> Value {
    // NaN and infinities have no JSON form
    serde_json::Number::from_f64(v).map_or(Value::Null, Value::Number)
}

/// Convert `PostgreSQL` value to JSON value
fn postgres_value_to_json(row: &Row, idx: usize) -> Result<Value> {
    use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime, Utc};

    match *row.columns()[idx].type_() {
        Type::BOOL => cell(row, idx, Value::Bool),
        Type::INT2 => cell::<i16>(row, idx, Value::from),
        Type::INT4 => cell::<i32>(row, idx, Value::from),
        Type::INT8 => cell::<i64>(row, idx, Value::from),
        Type::OID => cell::<u32>(row, idx, Value::from),
        Type::FLOAT4 => cell::<f32>(row, idx, |v| float_to_json(f64::from(v))),
        Type::FLOAT8 => cell::<f64>(row, idx, float_to_json),
        Type::NUMERIC => cell::<NumericText>(row, idx, |v| Value::String(v.0)),
        Type::JSON | Type::JSONB => cell::<Value>(row, idx, |v| v),
        Type::BYTEA => cell::<Vec<u8>>(row, idx, |v| {
            use base64::Engine;
            Value::String(base64::engine::general_purpose::STANDARD.encode(v))
        }),
        Type::TIMESTAMP => {
            cell::<NaiveDateTime>(row, idx, |v| Value::String(v.format("%Y-%m-%dT%H:%M:%S%.f").to_string()))
        }
        Type::TIMESTAMPTZ => cell::<DateTime<Utc>>(row, idx, |v| Value::String(v.to_rfc3339())),
        Type::DATE => cell::<NaiveDate>(row, idx, |v| Value::String(v.format("%Y-%m-%d").to_string())),
        Type::TIME => cell::<NaiveTime>(row, idx, |v| Value::String(v.format("%H:%M:%S%.f").to_string())),
        Type::UUID => cell::<uuid::Uuid>(row, idx, |v| Value::String(v.to_string())),
        Type::TEXT_ARRAY | Type::VARCHAR_ARRAY => {
            cell::<Vec<Option<String>>>(row, idx, |v| Value::Array(v.into_iter().map(Value::from).collect()))
        }
        Type::INT4_ARRAY => {
            cell::<Vec<Option<i32>>>(row, idx, |v| Value::Array(v.into_iter().map(Value::from).collect()))
        }
        Type::INT8_ARRAY => {
            cell::<Vec<Option<i64>>>(row, idx, |v| Value::Array(v.into_iter().map(Value::from).collect()))
        }
        // VARCHAR, TEXT, BPCHAR, NAME and other text-like types
        _ => cell::<String>(row, idx, Value::String),
    }
}

/// NUMERIC decoded from the binary wire format into a decimal string
struct NumericText(String);

impl<'a> FromSql<'a> for NumericText {
    fn from_sql(_ty: &Type, raw: &'a [u8]) -> std::result::Result<Self, Box<dyn std::error::Error + Sync + Send>> {
        numeric_to_string(raw).map(Self).ok_or_else(|| "malformed NUMERIC value".into())
    }

    fn accepts(ty: &Type) -> bool {
        *ty == Type::NUMERIC
    }
}

/// Header: ndigits, weight, sign, dscale (all 16-bit), then base-10000 digits
fn numeric_to_string(raw: &[u8]) -> Option<String> {
    let word = |i: usize| raw.get(i * 2..i * 2 + 2).map(|b| u16::from_be_bytes([b[0], b[1]]));

    let ndigits = usize::from(word(0)?);
    let weight = i64::from(word(1)? as i16);
    let sign = word(2)?;
    let dscale = usize::from(word(3)?);
    let digits: Vec<u16> = (0..ndigits).map(|i| word(4 + i)).collect::<Option<_>>()?;

    match sign {
        0xC000 => return Some("NaN".to_string()),
        0xD000 => return Some("Infinity".to_string()),
        0xF000 => return Some("-Infinity".to_string()),
        _ => {}
    }

    let digit_at = |pos: i64| usize::try_from(pos).ok().and_then(|p| digits.get(p)).copied().unwrap_or(0);

    let mut text = String::new();
    if sign == 0x4000 {
        text.push('-');
    }

    if weight < 0 {
        text.push('0');
    } else {
        for pos in 0..=weight {
            if pos == 0 {
                text.push_str(&digit_at(pos).to_string());
            } else {
                text.push_str(&format!("{:04}", digit_at(pos)));
            }
        }
    }

    if dscale > 0 {
        let mut fraction = String::new();
        let groups = dscale.div_ceil(4);
        for group in 0..groups {
            fraction.push_str(&format!("{:04}", digit_at(weight + 1 + group as i64)));
        }
        fraction.truncate(dscale);
        text.push('.');
        text.push_str(&fraction);
    }

    Some(text)
}
