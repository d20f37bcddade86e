//! Configuration Management
//!
//! Configuration is gathered once at startup from several sources and
//! resolved into a read-only [`ResolvedConfig`] that is passed explicitly to
//! every component that needs it.
//!
//! # Resolution Precedence
//! 1. Explicit overrides (`--set key=value`, highest priority)
//! 2. Environment variables (names supplied by each field spec)
//! 3. Config file at an explicitly given path (`--config`)
//! 4. Config files at default locations (`.sqlgate/config.json` then
//!    `~/.config/sqlgate/config.json`)
//! 5. Built-in defaults
//!
//! A lower-precedence source never overrides a key already set by a higher
//! one. Empty values count as unset. Errors name fields, never values.

use serde::Serialize;
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub mod common;
pub mod loader;
pub mod schema;

pub use common::{backend_schema, common_fields, BACKEND_NAMES};
pub use loader::{parse_override, resolve_config, ConfigInputs, EnvLookup, LoadOptions};
pub use schema::{ConfigError, ConfigSchema, ConfigValue, Constraint, FieldSpec, FieldType, FieldViolation};

use crate::redact::MASK;

/// Where a configuration value came from, in ascending precedence
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SourceOrigin {
    Default,
    /// File found at a default search location
    DefaultFile { path: PathBuf },
    /// File given explicitly (`--config`)
    ExplicitFile { path: PathBuf },
    Env,
    Override,
}

impl SourceOrigin {
    /// Precedence rank, higher wins
    #[must_use]
    pub const fn rank(&self) -> u8 {
        match self {
            Self::Default => 0,
            Self::DefaultFile { .. } => 1,
            Self::ExplicitFile { .. } => 2,
            Self::Env => 3,
            Self::Override => 4,
        }
    }

    /// Short label (`default`, `file`, `env`, `override`)
    #[must_use]
    pub const fn label(&self) -> &'static str {
        match self {
            Self::Default => "default",
            Self::DefaultFile { .. } | Self::ExplicitFile { .. } => "file",
            Self::Env => "env",
            Self::Override => "override",
        }
    }
}

/// One key/value mapping tagged with its origin
#[derive(Debug, Clone, PartialEq)]
pub struct ConfigSource {
    pub origin: SourceOrigin,
    pub values: BTreeMap<String, Value>,
}

impl ConfigSource {
    #[must_use]
    pub const fn new(origin: SourceOrigin) -> Self {
        Self { origin, values: BTreeMap::new() }
    }

    /// Builder-style insert
    #[must_use]
    pub fn with(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.values.insert(key.into(), value.into());
        self
    }

    pub fn from_map(origin: SourceOrigin, map: Map<String, Value>) -> Self {
        Self { origin, values: map.into_iter().collect() }
    }
}

/// Ordered, immutable list of sources
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RawConfigSources {
    sources: Vec<ConfigSource>,
}

impl RawConfigSources {
    #[must_use]
    pub const fn new(sources: Vec<ConfigSource>) -> Self {
        Self { sources }
    }

    #[must_use]
    pub fn sources(&self) -> &[ConfigSource] {
        &self.sources
    }

    /// Keys present in some source but unknown to `schema`
    #[must_use]
    pub fn unknown_keys(&self, schema: &ConfigSchema) -> Vec<String> {
        let mut keys: Vec<String> = self
            .sources
            .iter()
            .flat_map(|source| source.values.keys())
            .filter(|key| schema.field(key).is_none())
            .cloned()
            .collect();
        keys.sort();
        keys.dedup();
        keys
    }

    /// Highest-precedence non-empty value for `key`
    ///
    /// Within one precedence level the earlier-listed source wins.
    fn winning(&self, key: &str) -> Option<(&Value, &SourceOrigin)> {
        let mut best: Option<(&Value, &SourceOrigin)> = None;
        for source in &self.sources {
            let Some(value) = source.values.get(key) else { continue };
            if is_unset(value) {
                continue;
            }
            let beats = best.map_or(true, |(_, origin)| source.origin.rank() > origin.rank());
            if beats {
                best = Some((value, &source.origin));
            }
        }
        best
    }
}

fn is_unset(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::String(s) => s.trim().is_empty(),
        _ => false,
    }
}

/// One resolved field
#[derive(Debug, Clone, PartialEq, Eq)]
struct ResolvedEntry {
    value: ConfigValue,
    origin: SourceOrigin,
    secret: bool,
}

/// Validated, typed configuration, read-only for the process lifetime
#[derive(Clone, Default, PartialEq, Eq)]
pub struct ResolvedConfig {
    entries: BTreeMap<String, ResolvedEntry>,
}

impl ResolvedConfig {
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&ConfigValue> {
        self.entries.get(name).map(|entry| &entry.value)
    }

    #[must_use]
    pub fn get_str(&self, name: &str) -> Option<&str> {
        match self.get(name)? {
            ConfigValue::String(s) => Some(s.as_str()),
            _ => None,
        }
    }

    #[must_use]
    pub fn get_u64(&self, name: &str) -> Option<u64> {
        match self.get(name)? {
            ConfigValue::Int(n) => Some(*n),
            _ => None,
        }
    }

    #[must_use]
    pub fn get_bool(&self, name: &str) -> Option<bool> {
        match self.get(name)? {
            ConfigValue::Bool(b) => Some(*b),
            _ => None,
        }
    }

    #[must_use]
    pub fn get_path(&self, name: &str) -> Option<&Path> {
        match self.get(name)? {
            ConfigValue::Path(p) => Some(p.as_path()),
            _ => None,
        }
    }

    /// Seconds-valued field as a `Duration`
    #[must_use]
    pub fn get_secs(&self, name: &str) -> Option<Duration> {
        self.get_u64(name).map(Duration::from_secs)
    }

    /// String field that must be present
    pub fn require_str(&self, name: &str) -> std::result::Result<&str, ConfigError> {
        self.get_str(name).ok_or_else(|| ConfigError::invalid(vec![FieldViolation::missing(name)]))
    }

    /// Where a field's value came from
    #[must_use]
    pub fn origin(&self, name: &str) -> Option<&SourceOrigin> {
        self.entries.get(name).map(|entry| &entry.origin)
    }

    /// Selected backend name, if the config carries one
    #[must_use]
    pub fn backend(&self) -> Option<&str> {
        self.get_str("backend")
    }

    /// Names and text of every secret field, for the redactor
    pub fn secret_values(&self) -> impl Iterator<Item = (&str, String)> {
        self.entries
            .iter()
            .filter(|(_, entry)| entry.secret)
            .map(|(name, entry)| (name.as_str(), entry.value.as_text()))
    }

    /// JSON view with secrets masked, suitable for `check` output
    #[must_use]
    pub fn to_redacted_json(&self) -> Value {
        let mut out = Map::new();
        for (name, entry) in &self.entries {
            let value = if entry.secret {
                Value::String(MASK.to_string())
            } else {
                entry.value.to_raw()
            };
            out.insert(
                name.clone(),
                serde_json::json!({ "value": value, "source": entry.origin.label() }),
            );
        }
        Value::Object(out)
    }

    /// Build from already-validated values (tests and embedding)
    #[must_use]
    pub fn from_values(values: impl IntoIterator<Item = (String, ConfigValue)>) -> Self {
        Self {
            entries: values
                .into_iter()
                .map(|(name, value)| {
                    let secret = crate::redact::is_secret_name(&name);
                    (name, ResolvedEntry { value, origin: SourceOrigin::Override, secret })
                })
                .collect(),
        }
    }
}

impl std::fmt::Debug for ResolvedConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut map = f.debug_map();
        for (name, entry) in &self.entries {
            if entry.secret {
                map.entry(name, &MASK);
            } else {
                map.entry(name, &entry.value);
            }
        }
        map.finish()
    }
}

/// Merges sources by precedence and validates them against a schema
#[derive(Debug, Clone)]
pub struct ConfigResolver {
    schema: ConfigSchema,
}

impl ConfigResolver {
    #[must_use]
    pub const fn new(schema: ConfigSchema) -> Self {
        Self { schema }
    }

    #[must_use]
    pub const fn schema(&self) -> &ConfigSchema {
        &self.schema
    }

    /// Source holding the schema's built-in defaults
    #[must_use]
    pub fn defaults(&self) -> ConfigSource {
        let mut source = ConfigSource::new(SourceOrigin::Default);
        for field in self.schema.fields() {
            if let Some(default) = &field.default {
                source.values.insert(field.name.to_string(), default.to_raw());
            }
        }
        source
    }

    /// Resolve `sources` into a typed config
    ///
    /// Defaults declared on the schema apply even when `sources` carries no
    /// default source. Every violation is collected before failing.
    pub fn resolve(&self, sources: &RawConfigSources) -> std::result::Result<ResolvedConfig, ConfigError> {
        let mut entries = BTreeMap::new();
        let mut violations = Vec::new();
        let defaults = self.defaults();

        for field in self.schema.fields() {
            let winner = sources.winning(field.name).or_else(|| {
                defaults
                    .values
                    .get(field.name)
                    .map(|value| (value, &defaults.origin))
            });

            let Some((raw, origin)) = winner else {
                if field.required {
                    violations.push(FieldViolation::missing(field.name));
                }
                continue;
            };

            match field.convert(raw) {
                Ok(value) => {
                    entries.insert(
                        field.name.to_string(),
                        ResolvedEntry { value, origin: origin.clone(), secret: field.secret },
                    );
                }
                Err(violation) => violations.push(violation),
            }
        }

        if violations.is_empty() {
            Ok(ResolvedConfig { entries })
        } else {
            Err(ConfigError::invalid(violations))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn schema() -> ConfigSchema {
        ConfigSchema::new(vec![
            FieldSpec::string("server_hostname").required().constraint(Constraint::NoScheme),
            FieldSpec::string("http_path").required().constraint(Constraint::LeadingSlash),
            FieldSpec::string("access_token").required(),
            FieldSpec::positive_int("call_timeout_secs").default_int(120),
        ])
    }

    fn file(path: &str) -> ConfigSource {
        ConfigSource::new(SourceOrigin::ExplicitFile { path: PathBuf::from(path) })
    }

    #[test]
    fn test_file_overrides_default() {
        let sources = RawConfigSources::new(vec![
            file("cfg.json")
                .with("server_hostname", "h")
                .with("http_path", "/p")
                .with("access_token", "t")
                .with("call_timeout_secs", 60),
        ]);

        let resolved = ConfigResolver::new(schema()).resolve(&sources).unwrap();
        assert_eq!(resolved.get_u64("call_timeout_secs"), Some(60));
        assert_eq!(resolved.origin("call_timeout_secs").map(SourceOrigin::label), Some("file"));
    }

    #[test]
    fn test_empty_value_counts_as_unset() {
        let sources = RawConfigSources::new(vec![
            file("cfg.json").with("server_hostname", "from-file"),
            ConfigSource::new(SourceOrigin::Env).with("server_hostname", ""),
        ]);

        let err = ConfigResolver::new(schema()).resolve(&sources).unwrap_err();
        assert_eq!(err.missing_fields(), vec!["http_path", "access_token"]);
    }

    #[test]
    fn test_all_violations_collected() {
        let sources = RawConfigSources::new(vec![ConfigSource::new(SourceOrigin::Env)
            .with("server_hostname", "https://x")
            .with("call_timeout_secs", "soon")]);

        let err = ConfigResolver::new(schema()).resolve(&sources).unwrap_err();
        assert_eq!(err.violations().len(), 4);
        assert_eq!(err.missing_fields(), vec!["http_path", "access_token"]);
    }

    #[test]
    fn test_same_level_earlier_source_wins() {
        let local = ConfigSource::new(SourceOrigin::DefaultFile { path: ".sqlgate/config.json".into() })
            .with("http_path", "/local");
        let global = ConfigSource::new(SourceOrigin::DefaultFile { path: "/home/u/.config/sqlgate/config.json".into() })
            .with("http_path", "/global");
        let sources = RawConfigSources::new(vec![local, global]);

        let resolver = ConfigResolver::new(ConfigSchema::new(vec![FieldSpec::string("http_path")]));
        assert_eq!(resolver.resolve(&sources).unwrap().get_str("http_path"), Some("/local"));
    }

    #[test]
    fn test_debug_and_json_mask_secrets() {
        let sources = RawConfigSources::new(vec![ConfigSource::new(SourceOrigin::Override)
            .with("server_hostname", "h")
            .with("http_path", "/p")
            .with("access_token", "dapi-123")]);
        let resolved = ConfigResolver::new(schema()).resolve(&sources).unwrap();

        assert!(!format!("{resolved:?}").contains("dapi-123"));
        let json = resolved.to_redacted_json();
        assert_eq!(json["access_token"], json!({"value": MASK, "source": "override"}));
        assert_eq!(json["call_timeout_secs"], json!({"value": 120, "source": "default"}));
    }

    #[test]
    fn test_unknown_keys_reported_by_name() {
        let sources = RawConfigSources::new(vec![file("cfg.json").with("htpp_path", "/typo")]);
        assert_eq!(sources.unknown_keys(&schema()), vec!["htpp_path".to_string()]);
    }
}
