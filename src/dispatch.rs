//! Tool Dispatcher
//!
//! Single entry point for tool calls. One dispatch:
//! 1. looks the tool up (`UnknownTool`, no session touched),
//! 2. validates arguments (`InvalidArguments`, no session touched),
//! 3. leases a session from the [`ConnectionManager`],
//! 4. runs the handler under the call timeout,
//! 5. releases or invalidates the session and wraps the outcome in an
//!    envelope.
//!
//! Every failure message passes through the [`SecretRedactor`] before it
//! leaves this module, in the envelope or in a log line.

use futures::FutureExt;
use serde_json::Value;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use crate::backend::Backend;
use crate::config::ResolvedConfig;
use crate::connection::{ConnectionManager, PoolSettings};
use crate::error::{GatewayError, Result};
use crate::output::{ErrorEnvelope, Metadata, ToolCallResult};
use crate::redact::SecretRedactor;
use crate::retry::RetryPolicy;
use crate::tools::{RegistryError, ToolArgs, ToolDescriptor, ToolHandler, ToolOutput, ToolRegistry};

const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_secs(120);

/// Routes tool calls for one backend
pub struct ToolDispatcher<B: Backend> {
    registry: Arc<ToolRegistry<B::Session>>,
    connections: ConnectionManager<B>,
    redactor: Arc<SecretRedactor>,
    call_timeout: Duration,
    /// Retries around a whole call; one attempt unless configured otherwise
    call_policy: RetryPolicy,
}

impl<B: Backend> Clone for ToolDispatcher<B> {
    fn clone(&self) -> Self {
        Self {
            registry: Arc::clone(&self.registry),
            connections: self.connections.clone(),
            redactor: Arc::clone(&self.redactor),
            call_timeout: self.call_timeout,
            call_policy: self.call_policy.clone(),
        }
    }
}

impl<B: Backend> ToolDispatcher<B> {
    /// Register the backend's tools and build its connection pool
    ///
    /// A duplicate tool name is a startup error.
    pub fn for_backend(backend: B, config: Arc<ResolvedConfig>) -> std::result::Result<Self, RegistryError> {
        let mut registry = ToolRegistry::new();
        backend.register_tools(&mut registry)?;

        let redactor = Arc::new(SecretRedactor::for_config(&config));
        let policy = RetryPolicy::from_config(&config);
        let call_timeout = config.get_secs("call_timeout_secs").unwrap_or(DEFAULT_CALL_TIMEOUT);
        let call_attempts = config
            .get_u64("call_max_attempts")
            .map_or(1, |n| u32::try_from(n).unwrap_or(u32::MAX));

        let connections = ConnectionManager::with_settings(
            Arc::new(backend),
            Arc::clone(&config),
            PoolSettings::from_config(&config),
            policy.clone(),
            Arc::clone(&redactor),
        );

        info!(
            backend = connections.backend().name(),
            tools = registry.len(),
            pool_size = connections.settings().max_size,
            call_timeout_secs = call_timeout.as_secs(),
            "Dispatcher ready"
        );

        Ok(Self::from_parts(registry, connections, redactor, call_timeout, policy.limited(call_attempts)))
    }

    #[must_use]
    pub fn from_parts(
        registry: ToolRegistry<B::Session>,
        connections: ConnectionManager<B>,
        redactor: Arc<SecretRedactor>,
        call_timeout: Duration,
        call_policy: RetryPolicy,
    ) -> Self {
        Self { registry: Arc::new(registry), connections, redactor, call_timeout, call_policy }
    }

    #[must_use]
    pub fn backend_name(&self) -> &'static str {
        self.connections.backend().name()
    }

    #[must_use]
    pub const fn connections(&self) -> &ConnectionManager<B> {
        &self.connections
    }

    #[must_use]
    pub const fn redactor(&self) -> &Arc<SecretRedactor> {
        &self.redactor
    }

    /// Registered tools in name order
    pub fn tools(&self) -> impl Iterator<Item = &ToolDescriptor<B::Session>> {
        self.registry.descriptors()
    }

    /// Run one tool call and wrap the outcome
    ///
    /// Always returns exactly one envelope.
    pub async fn dispatch(&self, name: &str, args: &Value) -> ToolCallResult {
        let started = Instant::now();
        let outcome = self.try_dispatch(name, args).await;
        let elapsed_ms = started.elapsed().as_millis() as u64;

        match outcome {
            Ok(output) => {
                debug!(tool = name, backend = self.backend_name(), elapsed_ms, "Tool call succeeded");
                ToolCallResult::success(
                    output.data,
                    Metadata::new(elapsed_ms, self.backend_name()).with_rows(output.rows_returned),
                )
            }
            Err(err) => {
                let message = self.redactor.scrub(&err.message());
                warn!(
                    tool = name,
                    backend = self.backend_name(),
                    kind = %err.kind(),
                    retryable = err.retryable(),
                    elapsed_ms,
                    error = %message,
                    "Tool call failed"
                );
                ToolCallResult::Failure(ErrorEnvelope::from_error(&err, message))
            }
        }
    }

    async fn try_dispatch(&self, name: &str, args: &Value) -> Result<ToolOutput> {
        let descriptor = self.registry.lookup(name)?;
        let args = descriptor.args.validate(args)?;
        let handler = &descriptor.handler;

        self.call_policy
            .run(
                |_| self.invoke(name, handler, args.clone()),
                |err, delay, next_attempt| {
                    info!(
                        tool = name,
                        kind = %err.kind(),
                        next_attempt,
                        delay_ms = delay.as_millis() as u64,
                        "Retrying tool call"
                    );
                },
            )
            .await
    }

    /// One attempt: lease, run under the timeout, settle the lease
    async fn invoke(&self, name: &str, handler: &ToolHandler<B::Session>, args: ToolArgs) -> Result<ToolOutput> {
        let handle = self.connections.acquire().await?;
        let call = AssertUnwindSafe(handler(Arc::clone(handle.session()), args)).catch_unwind();

        match tokio::time::timeout(self.call_timeout, call).await {
            Err(_) => {
                // Abandoned mid-call: the session's state is unknown
                self.connections.invalidate(handle);
                Err(GatewayError::Timeout(self.call_timeout.as_millis() as u64))
            }
            Ok(Err(_)) => {
                self.connections.invalidate(handle);
                Err(GatewayError::backend(self.backend_name(), format!("tool '{name}' panicked")))
            }
            Ok(Ok(Ok(output))) => {
                self.connections.release(handle);
                Ok(output)
            }
            Ok(Ok(Err(err))) => {
                match err {
                    GatewayError::Connection(_) | GatewayError::SuspendedResource(_) | GatewayError::Timeout(_) => {
                        self.connections.invalidate(handle);
                    }
                    _ => self.connections.release(handle),
                }
                Err(err)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::tools::{ArgSchema, ArgType};
    use serde_json::json;

    struct Echo;

    async fn echo(_session: Arc<()>, args: ToolArgs) -> Result<ToolOutput> {
        Ok(ToolOutput::json(json!({ "message": args.require_str("message")? })))
    }

    async fn leak(_session: Arc<()>, _args: ToolArgs) -> Result<ToolOutput> {
        Err(GatewayError::backend("echo", "rejected token dapi-secret-123"))
    }

    impl Backend for Echo {
        type Session = ();

        fn name(&self) -> &'static str {
            "echo"
        }

        async fn authenticate(&self, _config: &ResolvedConfig) -> Result<()> {
            Ok(())
        }

        async fn probe(&self, _session: &()) -> bool {
            true
        }

        fn register_tools(&self, registry: &mut ToolRegistry<()>) -> std::result::Result<(), RegistryError> {
            registry.register(ToolDescriptor::new(
                "echo",
                "Return the message",
                ArgSchema::new().required("message", ArgType::String, "Text to echo"),
                echo,
            ))?;
            registry.register(ToolDescriptor::new("leak", "Fail with the token in the message", ArgSchema::new(), leak))
        }
    }

    fn dispatcher() -> ToolDispatcher<Echo> {
        let config = ResolvedConfig::from_values([(
            "access_token".to_string(),
            crate::config::ConfigValue::String("dapi-secret-123".to_string()),
        )]);
        ToolDispatcher::for_backend(Echo, Arc::new(config)).unwrap()
    }

    #[tokio::test]
    async fn test_success_envelope() {
        let dispatcher = dispatcher();
        let result = dispatcher.dispatch("echo", &json!({"message": "hi"})).await;
        let ToolCallResult::Success(envelope) = result else { panic!("expected success") };
        assert_eq!(envelope.data, json!({"message": "hi"}));
        assert_eq!(envelope.metadata.backend, "echo");
    }

    #[tokio::test]
    async fn test_unknown_tool_never_connects() {
        let dispatcher = dispatcher();
        let result = dispatcher.dispatch("nonexistent_tool", &json!({})).await;
        assert_eq!(result.error_kind(), Some(ErrorKind::UnknownTool));
        assert!(!result.retryable());
        assert_eq!(dispatcher.connections().handshake_count(), 0);
    }

    #[tokio::test]
    async fn test_invalid_arguments_never_connect() {
        let dispatcher = dispatcher();
        let result = dispatcher.dispatch("echo", &json!({"message": null})).await;
        assert_eq!(result.error_kind(), Some(ErrorKind::InvalidArguments));
        assert_eq!(dispatcher.connections().handshake_count(), 0);
    }

    #[tokio::test]
    async fn test_failure_message_is_scrubbed() {
        let dispatcher = dispatcher();
        let result = dispatcher.dispatch("leak", &json!({})).await;
        let ToolCallResult::Failure(envelope) = result else { panic!("expected failure") };
        assert_eq!(envelope.error_kind, ErrorKind::BackendOperationError);
        assert!(!envelope.error.contains("dapi-secret-123"));
        // Handler errors other than transport failures keep the session
        assert_eq!(dispatcher.connections().live_count(), 1);
    }
}
