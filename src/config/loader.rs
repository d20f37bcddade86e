//! Source collection
//!
//! Reads config files (JSON or TOML, chosen by extension), environment
//! variables and explicit overrides into [`RawConfigSources`], then resolves
//! in two phases: the `backend` selector first, then the full schema of the
//! selected backend.

use serde_json::{Map, Value};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::debug;

use super::common::{backend_field, backend_schema};
use super::schema::{ConfigError, ConfigSchema, FieldViolation};
use super::{ConfigResolver, ConfigSource, RawConfigSources, ResolvedConfig, SourceOrigin};
use crate::backend::BackendKind;

/// Environment lookup, injectable for tests
pub type EnvLookup = Arc<dyn Fn(&str) -> Option<String> + Send + Sync>;

/// Where to look for configuration
#[derive(Clone)]
pub struct LoadOptions {
    /// File given with `--config`; must exist when set
    pub explicit_path: Option<PathBuf>,
    /// Files tried in order when present, skipped when absent
    pub search_paths: Vec<PathBuf>,
    /// `key=value` overrides, highest precedence
    pub overrides: Vec<(String, String)>,
    pub env: EnvLookup,
}

impl Default for LoadOptions {
    fn default() -> Self {
        Self {
            explicit_path: None,
            search_paths: default_search_paths(),
            overrides: Vec::new(),
            env: Arc::new(|name| std::env::var(name).ok()),
        }
    }
}

impl std::fmt::Debug for LoadOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoadOptions")
            .field("explicit_path", &self.explicit_path)
            .field("search_paths", &self.search_paths)
            .field("overrides", &self.overrides.iter().map(|(k, _)| k).collect::<Vec<_>>())
            .finish_non_exhaustive()
    }
}

/// Default search locations: project-local first, then per-user
#[must_use]
pub fn default_search_paths() -> Vec<PathBuf> {
    let mut paths = Vec::new();
    if let Ok(current_dir) = std::env::current_dir() {
        let local = current_dir.join(".sqlgate");
        paths.push(local.join("config.json"));
        paths.push(local.join("config.toml"));
    }
    if let Some(config_dir) = dirs::config_dir() {
        let global = config_dir.join("sqlgate");
        paths.push(global.join("config.json"));
        paths.push(global.join("config.toml"));
    }
    paths
}

/// Parse a `key=value` override
///
/// A malformed argument is reported without any of its text: a value
/// passed without its key may be a credential.
pub fn parse_override(raw: &str) -> Result<(String, String), ConfigError> {
    match raw.split_once('=') {
        Some((key, value)) if !key.trim().is_empty() => Ok((key.trim().to_string(), value.to_string())),
        _ => Err(ConfigError::invalid(vec![FieldViolation::constraint(
            "--set",
            "override must have the form key=value",
        )])),
    }
}

/// Read one config file into a flat map
pub fn read_config_file(path: &Path) -> Result<Map<String, Value>, ConfigError> {
    let display = path.display().to_string();
    let contents =
        fs::read_to_string(path).map_err(|e| ConfigError::unreadable(&display, e.to_string()))?;

    let is_toml = path.extension().and_then(|ext| ext.to_str()) == Some("toml");
    let parsed: Value = if is_toml {
        // `message()` omits the source excerpt, which could contain a credential
        let table: toml::Table = toml::from_str(&contents)
            .map_err(|e| ConfigError::unreadable(&display, e.message().to_string()))?;
        serde_json::to_value(table).map_err(|e| ConfigError::unreadable(&display, e.to_string()))?
    } else {
        serde_json::from_str(&contents).map_err(|e| {
            ConfigError::unreadable(&display, format!("invalid JSON at line {} column {}", e.line(), e.column()))
        })?
    };

    match parsed {
        Value::Object(map) => Ok(map),
        _ => Err(ConfigError::unreadable(display, "top level must be an object")),
    }
}

/// File and override sources, read once and reused for both resolution phases
#[derive(Clone)]
pub struct ConfigInputs {
    files: Vec<ConfigSource>,
    overrides: ConfigSource,
    env: EnvLookup,
}

impl ConfigInputs {
    /// Read every file named by `options`
    pub fn load(options: &LoadOptions) -> Result<Self, ConfigError> {
        let mut files = Vec::new();

        for path in &options.search_paths {
            if !path.is_file() {
                continue;
            }
            debug!(path = %path.display(), "Loading default config file");
            files.push(ConfigSource::from_map(
                SourceOrigin::DefaultFile { path: path.clone() },
                read_config_file(path)?,
            ));
        }

        if let Some(path) = &options.explicit_path {
            if !path.is_file() {
                return Err(ConfigError::unreadable(path.display().to_string(), "file not found"));
            }
            debug!(path = %path.display(), "Loading explicit config file");
            files.push(ConfigSource::from_map(
                SourceOrigin::ExplicitFile { path: path.clone() },
                read_config_file(path)?,
            ));
        }

        let mut overrides = ConfigSource::new(SourceOrigin::Override);
        for (key, value) in &options.overrides {
            overrides.values.insert(key.clone(), Value::String(value.clone()));
        }

        Ok(Self { files, overrides, env: options.env.clone() })
    }

    /// Sources for `schema`, in listing order: files, env, overrides
    #[must_use]
    pub fn sources_for(&self, schema: &ConfigSchema) -> RawConfigSources {
        let mut env = ConfigSource::new(SourceOrigin::Env);
        for field in schema.fields() {
            if let Some(value) = field.env.and_then(|var| (self.env)(var)) {
                env.values.insert(field.name.to_string(), Value::String(value));
            }
        }

        let mut sources = self.files.clone();
        sources.push(env);
        sources.push(self.overrides.clone());
        RawConfigSources::new(sources)
    }
}

/// Resolve the complete configuration
///
/// Phase one resolves `backend` alone; phase two resolves the common fields
/// plus the selected backend's fields. Keys unknown to the final schema are
/// ignored and logged by name.
pub fn resolve_config(inputs: &ConfigInputs) -> Result<ResolvedConfig, ConfigError> {
    let bootstrap = ConfigResolver::new(ConfigSchema::new(vec![backend_field()]));
    let selected = bootstrap.resolve(&inputs.sources_for(bootstrap.schema()))?;

    let kind = selected
        .backend()
        .and_then(BackendKind::parse)
        .ok_or_else(|| ConfigError::invalid(vec![FieldViolation::missing("backend")]))?;

    let resolver = ConfigResolver::new(backend_schema(kind)?);
    let sources = inputs.sources_for(resolver.schema());
    for key in sources.unknown_keys(resolver.schema()) {
        debug!(key = %key, backend = %kind, "Ignoring unknown config key");
    }
    resolver.resolve(&sources)
}
