//! Snowflake Backend Tests
//!
//! Runs the Snowflake backend against a wiremock server standing in for the
//! SQL API v2 (`/api/v2/statements`).

#![cfg(feature = "snowflake")]

use pretty_assertions::assert_eq;
use serde_json::{json, Value};
use std::sync::Arc;
use wiremock::matchers::{body_partial_json, header, method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

use sqlgate::backend::snowflake::SnowflakeBackend;
use sqlgate::config::ConfigValue;
use sqlgate::{ErrorKind, ResolvedConfig, SuccessEnvelope, ToolCallResult, ToolDispatcher};

const TOKEN: &str = "ver:1-hint:abc-ETMsDgAAAY0ffa";
const STATEMENTS: &str = "/api/v2/statements";

fn config(server: &MockServer) -> Arc<ResolvedConfig> {
    let text = |s: &str| ConfigValue::String(s.to_string());
    let values = vec![
        ("backend".to_string(), text("snowflake")),
        ("account".to_string(), text("xy12345")),
        ("access_token".to_string(), text(TOKEN)),
        ("auth_scheme".to_string(), text("oauth")),
        ("warehouse".to_string(), text("COMPUTE_WH")),
        ("database".to_string(), text("ANALYTICS")),
        ("api_base_url".to_string(), text(&server.uri())),
        ("network_retry_max_attempts".to_string(), ConfigValue::Int(3)),
        ("network_retry_initial_ms".to_string(), ConfigValue::Int(10)),
        ("wake_retry_max_attempts".to_string(), ConfigValue::Int(5)),
        ("wake_retry_initial_ms".to_string(), ConfigValue::Int(10)),
        ("wake_retry_max_backoff_ms".to_string(), ConfigValue::Int(50)),
    ];
    Arc::new(ResolvedConfig::from_values(values))
}

fn gateway(server: &MockServer) -> ToolDispatcher<SnowflakeBackend> {
    ToolDispatcher::for_backend(SnowflakeBackend, config(server)).expect("tools register")
}

fn result_set(handle: &str, row_type: Value, data: Value) -> Value {
    json!({
        "statementHandle": handle,
        "resultSetMetaData": { "rowType": row_type, "partitionInfo": [{ "rowCount": data.as_array().map_or(0, Vec::len) }] },
        "data": data,
    })
}

/// Handshake `SELECT 1` answered immediately
async fn healthy_handshake(server: &MockServer) {
    Mock::given(method("POST"))
        .and(path(STATEMENTS))
        .and(body_partial_json(json!({ "statement": "SELECT 1" })))
        .respond_with(ResponseTemplate::new(200).set_body_json(result_set(
            "h-select-1",
            json!([{ "name": "1", "type": "fixed", "scale": 0 }]),
            json!([["1"]]),
        )))
        .mount(server)
        .await;
}

fn expect_success(result: ToolCallResult) -> SuccessEnvelope {
    match result {
        ToolCallResult::Success(envelope) => envelope,
        ToolCallResult::Failure(envelope) => panic!("expected success, got {envelope:?}"),
    }
}

// ============================================================================
// Handshake
// ============================================================================

#[tokio::test]
async fn test_handshake_sends_token_type_and_warehouse() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path(STATEMENTS))
        .and(header("authorization", format!("Bearer {TOKEN}").as_str()))
        .and(header("x-snowflake-authorization-token-type", "OAUTH"))
        .and(body_partial_json(json!({ "statement": "SELECT 1", "warehouse": "COMPUTE_WH", "database": "ANALYTICS" })))
        .respond_with(ResponseTemplate::new(200).set_body_json(result_set(
            "h1",
            json!([{ "name": "1", "type": "fixed", "scale": 0 }]),
            json!([["1"]]),
        )))
        .expect(1..)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path(STATEMENTS))
        .and(body_partial_json(json!({ "statement": "SHOW DATABASES" })))
        .respond_with(ResponseTemplate::new(200).set_body_json(result_set(
            "h2",
            json!([{ "name": "created_on", "type": "timestamp_ltz" }, { "name": "name", "type": "text" }]),
            json!([["1700000000.000", "ANALYTICS"], ["1700000000.000", "RAW"]]),
        )))
        .mount(&server)
        .await;

    let gate = gateway(&server);
    let envelope = expect_success(gate.dispatch("list_databases", &json!({})).await);

    assert_eq!(envelope.data, json!({ "databases": ["ANALYTICS", "RAW"] }));
    assert_eq!(envelope.metadata.backend, "snowflake");
}

#[tokio::test]
async fn test_resuming_warehouse_is_waited_for() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path(STATEMENTS))
        .and(body_partial_json(json!({ "statement": "SELECT 1" })))
        .respond_with(ResponseTemplate::new(202).set_body_json(json!({
            "statementHandle": "h-resume",
            "message": "Asynchronous execution in progress.",
        })))
        .up_to_n_times(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path(format!("{STATEMENTS}/h-resume/cancel")))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({})))
        .expect(1)
        .mount(&server)
        .await;
    healthy_handshake(&server).await;
    Mock::given(method("POST"))
        .and(path(STATEMENTS))
        .and(body_partial_json(json!({ "statement": "SELECT 2 AS two" })))
        .respond_with(ResponseTemplate::new(200).set_body_json(result_set(
            "h3",
            json!([{ "name": "TWO", "type": "fixed", "scale": 0 }]),
            json!([["2"]]),
        )))
        .mount(&server)
        .await;

    let gate = gateway(&server);
    let envelope = expect_success(gate.dispatch("execute_query", &json!({ "sql": "SELECT 2 AS two" })).await);

    assert_eq!(envelope.data["rows"], json!([[2]]));
    assert_eq!(gate.connections().handshake_count(), 1);
}

#[tokio::test]
async fn test_rejected_token_is_authentication_error() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path(STATEMENTS))
        .respond_with(ResponseTemplate::new(401).set_body_json(json!({
            "code": "390303",
            "message": "Invalid OAuth access token.",
        })))
        .expect(1)
        .mount(&server)
        .await;

    let gate = gateway(&server);
    let ToolCallResult::Failure(envelope) = gate.dispatch("list_databases", &json!({})).await else {
        panic!("expected failure");
    };

    assert_eq!(envelope.error_kind, ErrorKind::AuthenticationError);
    assert!(!envelope.retryable);
    assert!(!envelope.error.contains(TOKEN));
}

#[tokio::test]
async fn test_unknown_account_is_configuration_error() {
    let server = MockServer::start().await;
    Mock::given(method("POST")).and(path(STATEMENTS)).respond_with(ResponseTemplate::new(404)).mount(&server).await;

    let gate = gateway(&server);
    let result = gate.dispatch("list_databases", &json!({})).await;

    assert_eq!(result.error_kind(), Some(ErrorKind::ConfigurationError));
    assert!(!result.retryable());
}

// ============================================================================
// Statement execution
// ============================================================================

#[tokio::test]
async fn test_async_statement_is_polled_and_partitions_collected() {
    let server = MockServer::start().await;
    healthy_handshake(&server).await;
    Mock::given(method("POST"))
        .and(path(STATEMENTS))
        .and(body_partial_json(json!({ "statement": "SELECT id, score, tags FROM events" })))
        .respond_with(ResponseTemplate::new(202).set_body_json(json!({ "statementHandle": "h-big" })))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path(format!("{STATEMENTS}/h-big")))
        .and(query_param("partition", "1"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "data": [["3", "0.25", null]] })))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path(format!("{STATEMENTS}/h-big")))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "statementHandle": "h-big",
            "resultSetMetaData": {
                "rowType": [
                    { "name": "ID", "type": "fixed", "scale": 0 },
                    { "name": "SCORE", "type": "real" },
                    { "name": "TAGS", "type": "array" },
                ],
                "partitionInfo": [{ "rowCount": 2 }, { "rowCount": 1 }],
            },
            "data": [["1", "1.5", "[\"a\",\"b\"]"], ["2", "2.0", "[]"]],
        })))
        .mount(&server)
        .await;

    let gate = gateway(&server);
    let envelope =
        expect_success(gate.dispatch("execute_query", &json!({ "sql": "SELECT id, score, tags FROM events" })).await);

    assert_eq!(envelope.data["columns"], json!(["ID", "SCORE", "TAGS"]));
    assert_eq!(envelope.data["rows"], json!([[1, 1.5, ["a", "b"]], [2, 2.0, []], [3, 0.25, null]]));
    assert_eq!(envelope.metadata.rows_returned, Some(3));
}

#[tokio::test]
async fn test_dml_reports_rows_affected() {
    let server = MockServer::start().await;
    healthy_handshake(&server).await;
    Mock::given(method("POST"))
        .and(path(STATEMENTS))
        .and(body_partial_json(json!({ "statement": "DELETE FROM events WHERE id < 3" })))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "statementHandle": "h-dml",
            "resultSetMetaData": {
                "rowType": [{ "name": "number of rows deleted", "type": "fixed", "scale": 0 }],
                "partitionInfo": [{ "rowCount": 1 }],
            },
            "data": [["2"]],
            "stats": { "numRowsDeleted": 2 },
        })))
        .mount(&server)
        .await;

    let gate = gateway(&server);
    let envelope =
        expect_success(gate.dispatch("execute_query", &json!({ "sql": "DELETE FROM events WHERE id < 3" })).await);
    assert_eq!(envelope.data["rows_affected"], json!(2));
}

#[tokio::test]
async fn test_throttled_statement_is_retryable() {
    let server = MockServer::start().await;
    healthy_handshake(&server).await;
    Mock::given(method("POST"))
        .and(path(STATEMENTS))
        .and(body_partial_json(json!({ "statement": "SELECT 3" })))
        .respond_with(ResponseTemplate::new(429))
        .mount(&server)
        .await;

    let gate = gateway(&server);
    let result = gate.dispatch("execute_query", &json!({ "sql": "SELECT 3" })).await;

    assert_eq!(result.error_kind(), Some(ErrorKind::BackendOperationError));
    assert!(result.retryable());
    assert_eq!(gate.connections().live_count(), 1);
}

#[tokio::test]
async fn test_describe_table_reports_primary_key() {
    let server = MockServer::start().await;
    healthy_handshake(&server).await;
    let text = |name: &str| json!({ "name": name, "type": "text" });
    Mock::given(method("POST"))
        .and(path(STATEMENTS))
        .and(body_partial_json(json!({ "statement": "DESCRIBE TABLE PUBLIC.\"Order Items\"" })))
        .respond_with(ResponseTemplate::new(200).set_body_json(result_set(
            "h-desc",
            json!([text("name"), text("type"), text("kind"), text("null?"), text("default"), text("primary key")]),
            json!([
                ["ID", "NUMBER(38,0)", "COLUMN", "N", null, "Y"],
                ["NOTE", "VARCHAR(16777216)", "COLUMN", "Y", "'none'", "N"],
            ]),
        )))
        .mount(&server)
        .await;

    let gate = gateway(&server);
    let envelope = expect_success(gate.dispatch("describe_table", &json!({ "table": "PUBLIC.Order Items" })).await);

    assert_eq!(
        envelope.data,
        json!({
            "name": "Order Items",
            "schema": "PUBLIC",
            "columns": [
                { "name": "ID", "data_type": "NUMBER(38,0)", "nullable": false },
                { "name": "NOTE", "data_type": "VARCHAR(16777216)", "nullable": true, "default": "'none'" },
            ],
            "primary_key": ["ID"],
        })
    );
}
