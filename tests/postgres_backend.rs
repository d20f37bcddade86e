//! PostgreSQL Backend Tests
//!
//! Tests marked `#[ignore]` need a running server; they read the usual
//! `PGHOST`/`PGPORT`/`PGUSER`/`PGPASSWORD`/`PGDATABASE` variables and fall
//! back to `postgres:postgres@localhost:5432/postgres`. Run them with:
//! cargo test --features postgres -- --ignored

#![cfg(feature = "postgres")]

use pretty_assertions::assert_eq;
use serde_json::json;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;

use sqlgate::backend::postgres::PostgresBackend;
use sqlgate::config::ConfigValue;
use sqlgate::{ErrorKind, ResolvedConfig, ToolCallResult, ToolDispatcher};

fn env_or(name: &str, fallback: &str) -> String {
    std::env::var(name).ok().filter(|v| !v.is_empty()).unwrap_or_else(|| fallback.to_string())
}

fn gateway_with(host: &str, port: u64, password: &str) -> ToolDispatcher<PostgresBackend> {
    let text = |s: String| ConfigValue::String(s);
    let mut values = vec![
        ("backend".to_string(), text("postgres".into())),
        ("host".to_string(), text(host.to_string())),
        ("port".to_string(), ConfigValue::Int(port)),
        ("user".to_string(), text(env_or("PGUSER", "postgres"))),
        ("database".to_string(), text(env_or("PGDATABASE", "postgres"))),
        ("pool_size".to_string(), ConfigValue::Int(1)),
        ("network_retry_max_attempts".to_string(), ConfigValue::Int(3)),
        ("network_retry_initial_ms".to_string(), ConfigValue::Int(10)),
    ];
    if !password.is_empty() {
        values.push(("password".to_string(), text(password.to_string())));
    }
    let config = ResolvedConfig::from_values(values);
    ToolDispatcher::for_backend(PostgresBackend, Arc::new(config)).expect("tools register")
}

/// Accepts startup messages and answers each with `AuthenticationCleartextPassword`
async fn password_demanding_server() -> (u16, Arc<AtomicUsize>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let startups = Arc::new(AtomicUsize::new(0));
    let seen = Arc::clone(&startups);
    tokio::spawn(async move {
        while let Ok((mut stream, _)) = listener.accept().await {
            let seen = Arc::clone(&seen);
            tokio::spawn(async move {
                let mut len = [0u8; 4];
                if stream.read_exact(&mut len).await.is_err() {
                    return;
                }
                let mut body = vec![0u8; (u32::from_be_bytes(len) as usize).saturating_sub(4)];
                if stream.read_exact(&mut body).await.is_err() {
                    return;
                }
                seen.fetch_add(1, Ordering::SeqCst);
                let mut reply = vec![b'R'];
                reply.extend_from_slice(&8u32.to_be_bytes());
                reply.extend_from_slice(&3u32.to_be_bytes());
                let _ = stream.write_all(&reply).await;
                let mut rest = Vec::new();
                let _ = stream.read_to_end(&mut rest).await;
            });
        }
    });
    (port, startups)
}

fn gateway() -> ToolDispatcher<PostgresBackend> {
    let port = env_or("PGPORT", "5432").parse().unwrap_or(5432);
    gateway_with(&env_or("PGHOST", "localhost"), port, &env_or("PGPASSWORD", "postgres"))
}

#[tokio::test]
async fn test_unreachable_server_is_connection_error() {
    let gate = gateway_with("127.0.0.1", 1, "irrelevant-password");

    let result = gate.dispatch("list_schemas", &json!({})).await;
    let ToolCallResult::Failure(envelope) = result else { panic!("expected failure") };
    assert_eq!(envelope.error_kind, ErrorKind::ConnectionError);
    assert!(envelope.retryable);
    assert!(!envelope.error.contains("irrelevant-password"));
}

#[tokio::test]
async fn test_missing_password_is_authentication_error() {
    let (port, startups) = password_demanding_server().await;
    let gate = gateway_with("127.0.0.1", u64::from(port), "");

    let result = gate.dispatch("list_schemas", &json!({})).await;
    let ToolCallResult::Failure(envelope) = result else { panic!("expected failure") };
    assert_eq!(envelope.error_kind, ErrorKind::AuthenticationError);
    assert!(!envelope.retryable);
    assert!(envelope.error.contains("PGPASSWORD"));
    assert_eq!(startups.load(Ordering::SeqCst), 1);
}

#[tokio::test]
#[ignore = "Requires running PostgreSQL instance"]
async fn test_query_and_introspection() {
    let gate = gateway();

    let setup = gate
        .dispatch(
            "execute_query",
            &json!({ "sql": "CREATE TABLE IF NOT EXISTS sqlgate_it_orders (
                        id SERIAL PRIMARY KEY,
                        customer TEXT NOT NULL,
                        total NUMERIC(10, 2) DEFAULT 0
                    )" }),
        )
        .await;
    assert!(setup.is_success(), "{setup:?}");

    let result = gate
        .dispatch(
            "execute_query",
            &json!({ "sql": "SELECT 1::int4 AS one, 'x'::text AS label, 12.50::numeric AS amount" }),
        )
        .await;
    let ToolCallResult::Success(envelope) = result else { panic!("expected success") };
    assert_eq!(envelope.data["columns"], json!(["one", "label", "amount"]));
    assert_eq!(envelope.data["rows"], json!([[1, "x", "12.50"]]));

    let result = gate.dispatch("list_schemas", &json!({})).await;
    let ToolCallResult::Success(envelope) = result else { panic!("expected success") };
    assert!(envelope.data["schemas"].as_array().unwrap().contains(&json!("public")));

    let result = gate.dispatch("describe_table", &json!({ "table": "sqlgate_it_orders", "schema": "public" })).await;
    let ToolCallResult::Success(envelope) = result else { panic!("expected success") };
    assert_eq!(envelope.data["primary_key"], json!(["id"]));
    assert_eq!(envelope.data["columns"][1]["nullable"], json!(false));

    let cleanup = gate.dispatch("execute_query", &json!({ "sql": "DROP TABLE sqlgate_it_orders" })).await;
    assert!(cleanup.is_success());
    assert_eq!(gate.connections().handshake_count(), 1);
}

#[tokio::test]
#[ignore = "Requires running PostgreSQL instance"]
async fn test_wrong_password_is_authentication_error() {
    let port = env_or("PGPORT", "5432").parse().unwrap_or(5432);
    let gate = gateway_with(&env_or("PGHOST", "localhost"), port, "definitely-not-the-password");

    let result = gate.dispatch("list_schemas", &json!({})).await;
    let ToolCallResult::Failure(envelope) = result else { panic!("expected failure") };
    assert_eq!(envelope.error_kind, ErrorKind::AuthenticationError);
    assert!(!envelope.retryable);
    assert!(!envelope.error.contains("definitely-not-the-password"));
}

#[tokio::test]
#[ignore = "Requires running PostgreSQL instance"]
async fn test_sql_error_is_backend_error() {
    let gate = gateway();

    let result = gate.dispatch("execute_query", &json!({ "sql": "SELECT * FROM no_such_table_here" })).await;
    let ToolCallResult::Failure(envelope) = result else { panic!("expected failure") };
    assert_eq!(envelope.error_kind, ErrorKind::BackendOperationError);
    assert!(!envelope.retryable);
    assert!(envelope.error.contains("42P01"));
}
