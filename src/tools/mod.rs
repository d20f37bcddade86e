//! Tool Registry
//!
//! Maps tool names to handlers and shallow argument schemas. Tools are
//! registered once at startup; a duplicate name is a fatal startup error.
//!
//! Argument schemas are one level deep: each argument has a primitive type
//! and a required flag. Nested structure is the handler's concern.

use futures::future::BoxFuture;
use futures::FutureExt;
use serde_json::{json, Map, Value};
use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;
use thiserror::Error;

use crate::backend::QueryResult;
use crate::error::{GatewayError, Result};

/// Startup-time registration failure
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RegistryError {
    #[error("tool '{0}' is already registered")]
    DuplicateTool(String),
}

/// Primitive argument type
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArgType {
    String,
    Integer,
    Number,
    Boolean,
    Array,
    Object,
}

impl ArgType {
    /// JSON Schema type name
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::String => "string",
            Self::Integer => "integer",
            Self::Number => "number",
            Self::Boolean => "boolean",
            Self::Array => "array",
            Self::Object => "object",
        }
    }

    /// Coerce a JSON value to this type, `None` when impossible
    fn coerce(self, value: &Value) -> Option<Value> {
        match (self, value) {
            (Self::String, Value::String(_)) => Some(value.clone()),
            (Self::String, Value::Number(n)) => Some(Value::String(n.to_string())),
            (Self::String, Value::Bool(b)) => Some(Value::String(b.to_string())),

            (Self::Integer, Value::Number(n)) => n
                .as_i64()
                .or_else(|| n.as_f64().filter(|f| f.fract() == 0.0 && f.abs() < 9.0e15).map(|f| f as i64))
                .map(Value::from),
            (Self::Integer, Value::String(s)) => s.trim().parse::<i64>().ok().map(Value::from),

            (Self::Number, Value::Number(_)) => Some(value.clone()),
            (Self::Number, Value::String(s)) => s
                .trim()
                .parse::<f64>()
                .ok()
                .and_then(serde_json::Number::from_f64)
                .map(Value::Number),

            (Self::Boolean, Value::Bool(_)) => Some(value.clone()),
            (Self::Boolean, Value::String(s)) => match s.trim().to_ascii_lowercase().as_str() {
                "true" => Some(Value::Bool(true)),
                "false" => Some(Value::Bool(false)),
                _ => None,
            },

            (Self::Array, Value::Array(_)) | (Self::Object, Value::Object(_)) => Some(value.clone()),
            _ => None,
        }
    }
}

/// One argument of a tool
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArgSpec {
    pub name: &'static str,
    pub arg_type: ArgType,
    pub required: bool,
    pub description: &'static str,
}

/// Shallow argument schema
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ArgSchema {
    args: Vec<ArgSpec>,
}

impl ArgSchema {
    #[must_use]
    pub const fn new() -> Self {
        Self { args: Vec::new() }
    }

    #[must_use]
    pub fn required(mut self, name: &'static str, arg_type: ArgType, description: &'static str) -> Self {
        self.args.push(ArgSpec { name, arg_type, required: true, description });
        self
    }

    #[must_use]
    pub fn optional(mut self, name: &'static str, arg_type: ArgType, description: &'static str) -> Self {
        self.args.push(ArgSpec { name, arg_type, required: false, description });
        self
    }

    #[must_use]
    pub fn args(&self) -> &[ArgSpec] {
        &self.args
    }

    /// Check `args` and coerce each declared argument to its type
    ///
    /// Every violation is reported. `null` counts as absent. Undeclared
    /// arguments are dropped.
    pub fn validate(&self, args: &Value) -> Result<ToolArgs> {
        let empty = Map::new();
        let object = match args {
            Value::Object(map) => map,
            Value::Null => &empty,
            _ => return Err(GatewayError::invalid_argument("arguments must be a JSON object")),
        };

        let mut values = BTreeMap::new();
        let mut violations = Vec::new();

        for spec in &self.args {
            match object.get(spec.name) {
                None | Some(Value::Null) => {
                    if spec.required {
                        violations.push(format!("missing required argument '{}'", spec.name));
                    }
                }
                Some(raw) => match spec.arg_type.coerce(raw) {
                    Some(value) => {
                        values.insert(spec.name.to_string(), value);
                    }
                    None => violations.push(format!(
                        "argument '{}' must be of type {}",
                        spec.name,
                        spec.arg_type.as_str()
                    )),
                },
            }
        }

        if violations.is_empty() {
            Ok(ToolArgs { values })
        } else {
            Err(GatewayError::InvalidArguments(violations))
        }
    }

    /// JSON Schema (`inputSchema`) for MCP `tools/list`
    #[must_use]
    pub fn to_json_schema(&self) -> Value {
        let mut properties = Map::new();
        for spec in &self.args {
            properties.insert(
                spec.name.to_string(),
                json!({ "type": spec.arg_type.as_str(), "description": spec.description }),
            );
        }
        let required: Vec<&str> = self.args.iter().filter(|a| a.required).map(|a| a.name).collect();
        json!({ "type": "object", "properties": properties, "required": required })
    }
}

/// Validated, coerced arguments of one call
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ToolArgs {
    values: BTreeMap<String, Value>,
}

impl ToolArgs {
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&Value> {
        self.values.get(name)
    }

    #[must_use]
    pub fn str(&self, name: &str) -> Option<&str> {
        self.get(name).and_then(Value::as_str)
    }

    /// String argument declared as required
    pub fn require_str(&self, name: &str) -> Result<&str> {
        self.str(name)
            .ok_or_else(|| GatewayError::invalid_argument(format!("missing required argument '{name}'")))
    }

    #[must_use]
    pub fn i64(&self, name: &str) -> Option<i64> {
        self.get(name).and_then(Value::as_i64)
    }

    #[must_use]
    pub fn bool(&self, name: &str) -> Option<bool> {
        self.get(name).and_then(Value::as_bool)
    }

    /// Non-negative integer argument as `usize`
    pub fn usize(&self, name: &str) -> Result<Option<usize>> {
        match self.i64(name) {
            None => Ok(None),
            Some(n) => usize::try_from(n)
                .map(Some)
                .map_err(|_| GatewayError::invalid_argument(format!("argument '{name}' must not be negative"))),
        }
    }
}

/// Handler output before it is wrapped in an envelope
#[derive(Debug, Clone, PartialEq)]
pub struct ToolOutput {
    pub data: Value,
    pub rows_returned: Option<usize>,
}

impl ToolOutput {
    /// Arbitrary JSON payload
    #[must_use]
    pub const fn json(data: Value) -> Self {
        Self { data, rows_returned: None }
    }

    /// Serialize any value as the payload
    pub fn serialize(data: &impl serde::Serialize) -> Result<Self> {
        serde_json::to_value(data)
            .map(Self::json)
            .map_err(|e| GatewayError::backend("gateway", format!("Failed to serialize result: {e}")))
    }

    /// Query result payload, counting rows
    pub fn rows(result: &QueryResult) -> Result<Self> {
        let mut output = Self::serialize(result)?;
        output.rows_returned = Some(result.rows.len());
        Ok(output)
    }
}

/// Type-erased handler: `(session, args) -> output`
pub type ToolHandler<S> = Arc<dyn Fn(Arc<S>, ToolArgs) -> BoxFuture<'static, Result<ToolOutput>> + Send + Sync>;

/// A registered tool
pub struct ToolDescriptor<S> {
    pub name: String,
    pub description: String,
    pub args: ArgSchema,
    pub handler: ToolHandler<S>,
}

impl<S: Send + Sync + 'static> ToolDescriptor<S> {
    pub fn new<F, Fut>(name: impl Into<String>, description: impl Into<String>, args: ArgSchema, handler: F) -> Self
    where
        F: Fn(Arc<S>, ToolArgs) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<ToolOutput>> + Send + 'static,
    {
        Self {
            name: name.into(),
            description: description.into(),
            args,
            handler: Arc::new(move |session, args| handler(session, args).boxed()),
        }
    }
}

impl<S> Clone for ToolDescriptor<S> {
    fn clone(&self) -> Self {
        Self {
            name: self.name.clone(),
            description: self.description.clone(),
            args: self.args.clone(),
            handler: Arc::clone(&self.handler),
        }
    }
}

impl<S> std::fmt::Debug for ToolDescriptor<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ToolDescriptor")
            .field("name", &self.name)
            .field("args", &self.args)
            .finish_non_exhaustive()
    }
}

/// Name → descriptor map, immutable after startup
pub struct ToolRegistry<S> {
    tools: BTreeMap<String, ToolDescriptor<S>>,
}

impl<S> Default for ToolRegistry<S> {
    fn default() -> Self {
        Self { tools: BTreeMap::new() }
    }
}

impl<S> ToolRegistry<S> {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a tool; duplicate names are rejected
    pub fn register(&mut self, descriptor: ToolDescriptor<S>) -> std::result::Result<(), RegistryError> {
        if self.tools.contains_key(&descriptor.name) {
            return Err(RegistryError::DuplicateTool(descriptor.name));
        }
        self.tools.insert(descriptor.name.clone(), descriptor);
        Ok(())
    }

    pub fn lookup(&self, name: &str) -> Result<&ToolDescriptor<S>> {
        self.tools.get(name).ok_or_else(|| GatewayError::unknown_tool(name))
    }

    /// Descriptors in name order
    pub fn descriptors(&self) -> impl Iterator<Item = &ToolDescriptor<S>> {
        self.tools.values()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.tools.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }
}
