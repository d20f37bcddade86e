//! Shared test backend
//!
//! `Scripted` plays back a list of handshake outcomes and exposes a few
//! tools that make pool behaviour observable: `whoami` returns the session
//! id, `sleep` holds the session, `fail` returns a chosen error.

#![allow(dead_code)]

use serde_json::json;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use sqlgate::config::ConfigValue;
use sqlgate::tools::RegistryError;
use sqlgate::{
    ArgSchema, ArgType, Backend, GatewayError, ResolvedConfig, Result, ToolArgs, ToolDescriptor, ToolDispatcher,
    ToolOutput, ToolRegistry,
};

/// Token used in configs built by [`config`]
pub const TOKEN: &str = "dapi-0123456789abcdef";

/// Characters that never occur in log formatting or gateway messages
const RARE: &[u8] = b"!#$%&+;?@^`|~";
const ALPHABET: &[u8] = b"abcdefghijklmnopqrstuvwxyzABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789-_.!#$%&+;?@^`|~";

/// Random credential, sometimes short, sometimes all punctuation
///
/// The first character comes from [`RARE`], so any occurrence of the value
/// in captured output can only be a leak of the value itself.
pub fn random_secret(rng: &mut impl rand::Rng) -> String {
    let len = if rng.random_bool(0.25) { 4 } else { rng.random_range(5..=40) };
    let pool = if rng.random_bool(0.3) { RARE } else { ALPHABET };
    let mut secret = String::with_capacity(len);
    secret.push(char::from(RARE[rng.random_range(0..RARE.len())]));
    while secret.len() < len {
        secret.push(char::from(pool[rng.random_range(0..pool.len())]));
    }
    secret
}

pub struct Scripted {
    outcomes: Mutex<VecDeque<GatewayError>>,
    handshake_delay: Duration,
    pub authenticate_calls: AtomicU64,
    /// Handshakes running right now, and the most seen at once
    active_handshakes: AtomicU64,
    pub peak_handshakes: AtomicU64,
    next_session: AtomicU64,
}

impl Scripted {
    /// Handshakes fail with `failures` in order, then succeed
    pub fn new(failures: Vec<GatewayError>) -> Self {
        Self {
            outcomes: Mutex::new(failures.into()),
            handshake_delay: Duration::from_millis(100),
            authenticate_calls: AtomicU64::new(0),
            active_handshakes: AtomicU64::new(0),
            peak_handshakes: AtomicU64::new(0),
            next_session: AtomicU64::new(1),
        }
    }

    pub fn healthy() -> Self {
        Self::new(Vec::new())
    }
}

async fn whoami(session: Arc<u64>, _args: ToolArgs) -> Result<ToolOutput> {
    Ok(ToolOutput::json(json!({ "session": *session })))
}

async fn sleep(session: Arc<u64>, args: ToolArgs) -> Result<ToolOutput> {
    let ms = args.i64("ms").unwrap_or(0).max(0) as u64;
    tokio::time::sleep(Duration::from_millis(ms)).await;
    Ok(ToolOutput::json(json!({ "session": *session, "slept_ms": ms })))
}

async fn fail(_session: Arc<u64>, args: ToolArgs) -> Result<ToolOutput> {
    let message = args.str("message").unwrap_or("failed").to_string();
    Err(match args.require_str("kind")? {
        "connection" => GatewayError::connection(message),
        "suspended" => GatewayError::suspended(message),
        "transient" => GatewayError::transient("scripted", message),
        "authentication" => GatewayError::authentication(message),
        _ => GatewayError::backend("scripted", message),
    })
}

impl Backend for Scripted {
    type Session = u64;

    fn name(&self) -> &'static str {
        "scripted"
    }

    async fn authenticate(&self, _config: &ResolvedConfig) -> Result<u64> {
        self.authenticate_calls.fetch_add(1, Ordering::SeqCst);
        let active = self.active_handshakes.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak_handshakes.fetch_max(active, Ordering::SeqCst);

        tokio::time::sleep(self.handshake_delay).await;
        self.active_handshakes.fetch_sub(1, Ordering::SeqCst);

        if let Some(err) = self.outcomes.lock().pop_front() {
            return Err(err);
        }
        Ok(self.next_session.fetch_add(1, Ordering::SeqCst))
    }

    async fn probe(&self, _session: &u64) -> bool {
        true
    }

    fn register_tools(&self, registry: &mut ToolRegistry<u64>) -> std::result::Result<(), RegistryError> {
        registry.register(ToolDescriptor::new("whoami", "Report the session id", ArgSchema::new(), whoami))?;
        registry.register(ToolDescriptor::new(
            "sleep",
            "Hold the session for a while",
            ArgSchema::new().required("ms", ArgType::Integer, "Milliseconds"),
            sleep,
        ))?;
        registry.register(ToolDescriptor::new(
            "fail",
            "Return an error of the given kind",
            ArgSchema::new()
                .required("kind", ArgType::String, "Error kind")
                .optional("message", ArgType::String, "Error message"),
            fail,
        ))
    }
}

/// Config with fast retries, a short call timeout and a secret token
pub fn config(extra: &[(&str, u64)]) -> Arc<ResolvedConfig> {
    let mut values: Vec<(String, ConfigValue)> = vec![
        ("backend".into(), ConfigValue::String("scripted".into())),
        ("access_token".into(), ConfigValue::String(TOKEN.into())),
        ("pool_size".into(), ConfigValue::Int(4)),
        ("call_timeout_secs".into(), ConfigValue::Int(2)),
        ("network_retry_max_attempts".into(), ConfigValue::Int(3)),
        ("network_retry_initial_ms".into(), ConfigValue::Int(100)),
        ("wake_retry_max_attempts".into(), ConfigValue::Int(5)),
        ("wake_retry_initial_ms".into(), ConfigValue::Int(1_000)),
    ];
    for (key, value) in extra {
        values.retain(|(k, _)| k != key);
        values.push(((*key).to_string(), ConfigValue::Int(*value)));
    }
    Arc::new(ResolvedConfig::from_values(values))
}

pub fn dispatcher(backend: Scripted, extra: &[(&str, u64)]) -> ToolDispatcher<Scripted> {
    ToolDispatcher::for_backend(backend, config(extra)).expect("tools register")
}
