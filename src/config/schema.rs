//! Declarative configuration schema
//!
//! Each backend describes its options as a list of [`FieldSpec`]s. The
//! resolver checks every field against its spec and collects every
//! violation instead of stopping at the first one.

use serde::Serialize;
use serde_json::Value;
use std::path::PathBuf;
use thiserror::Error;

use crate::redact::is_secret_name;

/// Primitive type of a configuration field
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FieldType {
    String,
    PositiveInt,
    Bool,
    Path,
    /// One of a fixed set of lowercase values
    Enum(&'static [&'static str]),
}

impl FieldType {
    fn expected(&self) -> String {
        match self {
            Self::String => "a string".to_string(),
            Self::PositiveInt => "a positive integer".to_string(),
            Self::Bool => "true or false".to_string(),
            Self::Path => "a file path".to_string(),
            Self::Enum(values) => format!("one of: {}", values.join(", ")),
        }
    }
}

/// Format constraint checked after type conversion
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Constraint {
    /// Host-like values must not carry `https://` or similar
    NoScheme,
    /// Path-like values must start with `/`
    LeadingSlash,
    /// Value must be an `http://` or `https://` URL
    HttpUrl,
}

impl Constraint {
    const fn rule(self) -> &'static str {
        match self {
            Self::NoScheme => "must not contain a scheme prefix",
            Self::LeadingSlash => "must start with '/'",
            Self::HttpUrl => "must be an http(s) URL",
        }
    }

    fn check(self, value: &str) -> bool {
        match self {
            Self::NoScheme => !value.contains("://"),
            Self::LeadingSlash => value.starts_with('/'),
            Self::HttpUrl => value.starts_with("http://") || value.starts_with("https://"),
        }
    }
}

/// Typed configuration value after resolution
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(untagged)]
pub enum ConfigValue {
    String(String),
    Int(u64),
    Bool(bool),
    Path(PathBuf),
}

impl ConfigValue {
    /// Raw JSON form, used when a default enters the source list
    #[must_use]
    pub fn to_raw(&self) -> Value {
        match self {
            Self::String(s) => Value::String(s.clone()),
            Self::Int(n) => Value::from(*n),
            Self::Bool(b) => Value::Bool(*b),
            Self::Path(p) => Value::String(p.to_string_lossy().into_owned()),
        }
    }

    /// Plain text form, used when a value has to be scrubbed from messages
    #[must_use]
    pub fn as_text(&self) -> String {
        match self {
            Self::String(s) => s.clone(),
            Self::Int(n) => n.to_string(),
            Self::Bool(b) => b.to_string(),
            Self::Path(p) => p.to_string_lossy().into_owned(),
        }
    }
}

/// Specification of one configuration field
#[derive(Debug, Clone, PartialEq)]
pub struct FieldSpec {
    /// Canonical option name, also the key used in config files
    pub name: &'static str,
    /// Environment variable read for this field
    pub env: Option<&'static str>,
    pub required: bool,
    pub field_type: FieldType,
    pub constraints: Vec<Constraint>,
    pub default: Option<ConfigValue>,
    /// Classified from the name when the spec is built
    pub secret: bool,
}

impl FieldSpec {
    fn new(name: &'static str, field_type: FieldType) -> Self {
        Self {
            name,
            env: None,
            required: false,
            field_type,
            constraints: Vec::new(),
            default: None,
            secret: is_secret_name(name),
        }
    }

    pub fn string(name: &'static str) -> Self {
        Self::new(name, FieldType::String)
    }

    pub fn positive_int(name: &'static str) -> Self {
        Self::new(name, FieldType::PositiveInt)
    }

    pub fn boolean(name: &'static str) -> Self {
        Self::new(name, FieldType::Bool)
    }

    pub fn path(name: &'static str) -> Self {
        Self::new(name, FieldType::Path)
    }

    pub fn one_of(name: &'static str, values: &'static [&'static str]) -> Self {
        Self::new(name, FieldType::Enum(values))
    }

    #[must_use]
    pub const fn env(mut self, var: &'static str) -> Self {
        self.env = Some(var);
        self
    }

    #[must_use]
    pub const fn required(mut self) -> Self {
        self.required = true;
        self
    }

    #[must_use]
    pub fn constraint(mut self, constraint: Constraint) -> Self {
        self.constraints.push(constraint);
        self
    }

    #[must_use]
    pub fn default_int(mut self, value: u64) -> Self {
        self.default = Some(ConfigValue::Int(value));
        self
    }

    #[must_use]
    pub fn default_bool(mut self, value: bool) -> Self {
        self.default = Some(ConfigValue::Bool(value));
        self
    }

    #[must_use]
    pub fn default_str(mut self, value: &str) -> Self {
        self.default = Some(ConfigValue::String(value.to_string()));
        self
    }

    /// Convert and check a raw value, never echoing it in the violation
    pub(crate) fn convert(&self, raw: &Value) -> std::result::Result<ConfigValue, FieldViolation> {
        let invalid_type = || FieldViolation::InvalidType {
            field: self.name.to_string(),
            expected: self.field_type.expected(),
        };

        let value = match (&self.field_type, raw) {
            (FieldType::String, Value::String(s)) => ConfigValue::String(s.clone()),
            (FieldType::String, Value::Number(n)) => ConfigValue::String(n.to_string()),
            (FieldType::Path, Value::String(s)) => ConfigValue::Path(PathBuf::from(s)),
            (FieldType::PositiveInt, Value::Number(n)) => match n.as_u64() {
                Some(v) if v > 0 => ConfigValue::Int(v),
                _ => return Err(invalid_type()),
            },
            (FieldType::PositiveInt, Value::String(s)) => match s.trim().parse::<u64>() {
                Ok(v) if v > 0 => ConfigValue::Int(v),
                _ => return Err(invalid_type()),
            },
            (FieldType::Bool, Value::Bool(b)) => ConfigValue::Bool(*b),
            (FieldType::Bool, Value::String(s)) => match s.trim().to_ascii_lowercase().as_str() {
                "true" | "1" | "yes" => ConfigValue::Bool(true),
                "false" | "0" | "no" => ConfigValue::Bool(false),
                _ => return Err(invalid_type()),
            },
            (FieldType::Enum(allowed), Value::String(s)) => {
                let lowered = s.trim().to_ascii_lowercase();
                if !allowed.contains(&lowered.as_str()) {
                    return Err(invalid_type());
                }
                ConfigValue::String(lowered)
            }
            _ => return Err(invalid_type()),
        };

        if let ConfigValue::String(text) = &value {
            for constraint in &self.constraints {
                if !constraint.check(text) {
                    return Err(FieldViolation::Constraint {
                        field: self.name.to_string(),
                        rule: constraint.rule().to_string(),
                    });
                }
            }
        }

        Ok(value)
    }
}

/// Ordered set of field specifications
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ConfigSchema {
    fields: Vec<FieldSpec>,
}

impl ConfigSchema {
    #[must_use]
    pub const fn new(fields: Vec<FieldSpec>) -> Self {
        Self { fields }
    }

    /// Append fields, replacing any earlier spec with the same name
    #[must_use]
    pub fn extend(mut self, fields: impl IntoIterator<Item = FieldSpec>) -> Self {
        for field in fields {
            self.fields.retain(|existing| existing.name != field.name);
            self.fields.push(field);
        }
        self
    }

    #[must_use]
    pub fn fields(&self) -> &[FieldSpec] {
        &self.fields
    }

    #[must_use]
    pub fn field(&self, name: &str) -> Option<&FieldSpec> {
        self.fields.iter().find(|field| field.name == name)
    }
}

/// One problem with one field. Values are never included.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "problem", rename_all = "snake_case")]
pub enum FieldViolation {
    Missing { field: String },
    InvalidType { field: String, expected: String },
    Constraint { field: String, rule: String },
}

impl FieldViolation {
    pub fn missing(field: impl Into<String>) -> Self {
        Self::Missing { field: field.into() }
    }

    pub fn constraint(field: impl Into<String>, rule: impl Into<String>) -> Self {
        Self::Constraint { field: field.into(), rule: rule.into() }
    }

    #[must_use]
    pub fn field(&self) -> &str {
        match self {
            Self::Missing { field } | Self::InvalidType { field, .. } | Self::Constraint { field, .. } => field,
        }
    }
}

impl std::fmt::Display for FieldViolation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Missing { field } => write!(f, "{field}: required but not set"),
            Self::InvalidType { field, expected } => write!(f, "{field}: expected {expected}"),
            Self::Constraint { field, rule } => write!(f, "{field}: {rule}"),
        }
    }
}

/// Configuration failure
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    /// Every violation found while resolving
    #[error("{} invalid field(s): {}", .0.len(), join_violations(.0))]
    Invalid(Vec<FieldViolation>),

    /// A config file could not be read or parsed
    #[error("could not load {path}: {detail}")]
    Source { path: String, detail: String },
}

fn join_violations(violations: &[FieldViolation]) -> String {
    violations.iter().map(ToString::to_string).collect::<Vec<_>>().join("; ")
}

impl ConfigError {
    #[must_use]
    pub const fn invalid(violations: Vec<FieldViolation>) -> Self {
        Self::Invalid(violations)
    }

    pub fn unreadable(path: impl Into<String>, detail: impl Into<String>) -> Self {
        Self::Source { path: path.into(), detail: detail.into() }
    }

    /// Violations reported by a failed resolution (empty for source errors)
    #[must_use]
    pub fn violations(&self) -> &[FieldViolation] {
        match self {
            Self::Invalid(violations) => violations,
            Self::Source { .. } => &[],
        }
    }

    /// Names of required fields that were not set
    #[must_use]
    pub fn missing_fields(&self) -> Vec<&str> {
        self.violations()
            .iter()
            .filter(|v| matches!(v, FieldViolation::Missing { .. }))
            .map(FieldViolation::field)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_secret_classified_at_definition() {
        assert!(FieldSpec::string("access_token").secret);
        assert!(FieldSpec::string("password").secret);
        assert!(!FieldSpec::string("server_hostname").secret);
    }

    #[test]
    fn test_positive_int_conversion() {
        let spec = FieldSpec::positive_int("pool_size");
        assert_eq!(spec.convert(&json!(4)), Ok(ConfigValue::Int(4)));
        assert_eq!(spec.convert(&json!("8")), Ok(ConfigValue::Int(8)));
        assert!(matches!(spec.convert(&json!(0)), Err(FieldViolation::InvalidType { .. })));
        assert!(matches!(spec.convert(&json!(-3)), Err(FieldViolation::InvalidType { .. })));
        assert!(matches!(spec.convert(&json!("many")), Err(FieldViolation::InvalidType { .. })));
    }

    #[test]
    fn test_enum_is_case_insensitive() {
        let spec = FieldSpec::one_of("backend", &["databricks", "sqlite"]);
        assert_eq!(spec.convert(&json!("SQLite")), Ok(ConfigValue::String("sqlite".into())));
        let err = spec.convert(&json!("oracle")).unwrap_err();
        assert_eq!(err.to_string(), "backend: expected one of: databricks, sqlite");
    }

    #[test]
    fn test_constraints() {
        let host = FieldSpec::string("server_hostname").constraint(Constraint::NoScheme);
        assert!(host.convert(&json!("adb-1.cloud.databricks.com")).is_ok());
        assert_eq!(
            host.convert(&json!("https://adb-1.cloud.databricks.com")),
            Err(FieldViolation::constraint("server_hostname", "must not contain a scheme prefix"))
        );

        let path = FieldSpec::string("http_path").constraint(Constraint::LeadingSlash);
        assert!(path.convert(&json!("/sql/1.0/warehouses/abc")).is_ok());
        assert!(path.convert(&json!("sql/1.0/warehouses/abc")).is_err());
    }

    #[test]
    fn test_violation_never_contains_value() {
        let spec = FieldSpec::positive_int("access_token");
        let err = spec.convert(&json!("dapi-super-secret")).unwrap_err();
        assert!(!err.to_string().contains("dapi-super-secret"));
    }

    #[test]
    fn test_non_scalar_rejected() {
        let spec = FieldSpec::string("catalog");
        assert!(matches!(spec.convert(&json!(["a", "b"])), Err(FieldViolation::InvalidType { .. })));
    }

    #[test]
    fn test_config_error_lists_missing_fields() {
        let err = ConfigError::invalid(vec![
            FieldViolation::missing("server_hostname"),
            FieldViolation::constraint("http_path", "must start with '/'"),
            FieldViolation::missing("access_token"),
        ]);
        assert_eq!(err.missing_fields(), vec!["server_hostname", "access_token"]);
        assert!(err.to_string().starts_with("3 invalid field(s): server_hostname: required but not set"));
    }
}
