//! Configuration Resolution Tests
//!
//! End-to-end resolution through [`LoadOptions`]: files on disk, an
//! injected environment and `--set` overrides.

#![cfg(feature = "sqlite")]

use pretty_assertions::assert_eq;
use std::collections::HashMap;
use std::fs;
use std::path::Path;
use std::sync::Arc;
use tempfile::TempDir;

mod common;

use sqlgate::config::{parse_override, EnvLookup, SourceOrigin};
use sqlgate::{resolve_config, ConfigError, ConfigInputs, LoadOptions, ResolvedConfig};

fn env_of(pairs: &[(&str, &str)]) -> EnvLookup {
    let map: HashMap<String, String> = pairs.iter().map(|(k, v)| ((*k).to_string(), (*v).to_string())).collect();
    Arc::new(move |name| map.get(name).cloned())
}

fn write(dir: &TempDir, name: &str, contents: &str) -> std::path::PathBuf {
    let path = dir.path().join(name);
    fs::write(&path, contents).unwrap();
    path
}

fn resolve(
    search_paths: &[&Path],
    explicit: Option<&Path>,
    env: &[(&str, &str)],
    overrides: &[&str],
) -> Result<ResolvedConfig, ConfigError> {
    let options = LoadOptions {
        explicit_path: explicit.map(Path::to_path_buf),
        search_paths: search_paths.iter().map(|p| p.to_path_buf()).collect(),
        overrides: overrides.iter().map(|raw| parse_override(raw)).collect::<Result<_, _>>()?,
        env: env_of(env),
    };
    resolve_config(&ConfigInputs::load(&options)?)
}

#[test]
fn test_file_value_beats_default_when_env_unset() {
    let dir = TempDir::new().unwrap();
    let file = write(&dir, "gate.json", r#"{"backend": "sqlite", "path": "/tmp/app.db", "call_timeout_secs": 60}"#);

    let config = resolve(&[], Some(&file), &[], &[]).unwrap();
    assert_eq!(config.get_u64("call_timeout_secs"), Some(60));
    assert_eq!(config.get_u64("pool_size"), Some(4));
    assert_eq!(config.origin("pool_size"), Some(&SourceOrigin::Default));
}

#[test]
fn test_precedence_for_every_level_combination() {
    let dir = TempDir::new().unwrap();
    let default_file = write(&dir, "default.json", r#"{"backend": "sqlite", "path": "/db", "pool_size": 2}"#);
    let explicit_file = write(&dir, "explicit.toml", "backend = \"sqlite\"\npath = \"/db\"\npool_size = 3\n");

    // (default file, explicit file, env, override) present? -> expected pool_size
    for mask in 0u8..16 {
        let mut search: Vec<&Path> = Vec::new();
        let mut expected = 4; // built-in default
        if mask & 1 != 0 {
            search.push(&default_file);
            expected = 2;
        }
        let explicit = (mask & 2 != 0).then_some(explicit_file.as_path());
        if explicit.is_some() {
            expected = 3;
        }
        let mut env = vec![("SQLGATE_BACKEND", "sqlite"), ("SQLITE_PATH", "/db")];
        if mask & 4 != 0 {
            env.push(("SQLGATE_POOL_SIZE", "5"));
            expected = 5;
        }
        let mut overrides = Vec::new();
        if mask & 8 != 0 {
            overrides.push("pool_size=6");
            expected = 6;
        }

        let config = resolve(&search, explicit, &env, &overrides).unwrap();
        assert_eq!(config.get_u64("pool_size"), Some(expected), "source mask {mask:04b}");
    }
}

#[test]
fn test_explicit_file_beats_default_location() {
    let dir = TempDir::new().unwrap();
    let local = write(&dir, "local.json", r#"{"backend": "sqlite", "path": "/local.db", "read_only": true}"#);
    let explicit = write(&dir, "explicit.toml", "path = \"/explicit.db\"\n");

    let config = resolve(&[&local], Some(&explicit), &[], &[]).unwrap();
    assert_eq!(config.get_path("path"), Some(Path::new("/explicit.db")));
    assert_eq!(config.get_bool("read_only"), Some(true));
}

#[test]
fn test_empty_env_counts_as_unset() {
    let dir = TempDir::new().unwrap();
    let file = write(&dir, "gate.json", r#"{"backend": "sqlite", "path": "/from-file.db"}"#);

    let config = resolve(&[], Some(&file), &[("SQLITE_PATH", "")], &[]).unwrap();
    assert_eq!(config.get_path("path"), Some(Path::new("/from-file.db")));
}

#[test]
fn test_resolution_is_deterministic() {
    let dir = TempDir::new().unwrap();
    let file = write(&dir, "gate.json", r#"{"backend": "sqlite", "path": "/db", "pool_size": 7}"#);
    let env = [("SQLGATE_CALL_TIMEOUT_SECS", "30")];

    let first = resolve(&[], Some(&file), &env, &["read_only=true"]).unwrap();
    let second = resolve(&[], Some(&file), &env, &["read_only=true"]).unwrap();
    assert_eq!(first, second);
    assert_eq!(first.to_redacted_json(), second.to_redacted_json());
}

#[test]
fn test_invalid_values_reported_by_field() {
    let err = resolve(&[], None, &[("SQLGATE_BACKEND", "sqlite"), ("SQLGATE_POOL_SIZE", "zero")], &[]).unwrap_err();

    let fields: Vec<&str> = err.violations().iter().map(|v| v.field()).collect();
    assert_eq!(fields, vec!["pool_size", "path"]);
    assert_eq!(err.missing_fields(), vec!["path"]);
}

#[test]
fn test_unknown_backend_is_rejected() {
    let err = resolve(&[], None, &[("SQLGATE_BACKEND", "oracle")], &[]).unwrap_err();
    assert_eq!(err.violations()[0].field(), "backend");
}

#[test]
fn test_malformed_override_is_rejected() {
    let err = resolve(&[], None, &[], &["pool_size"]).unwrap_err();
    assert!(err.to_string().contains("key=value"));
}

#[cfg(feature = "databricks")]
mod databricks {
    use super::*;
    use pretty_assertions::assert_eq;

    const TOKEN: &str = "dapi-feedfacecafebeef";

    #[test]
    fn test_each_missing_required_field_reported_once() {
        let err = resolve(&[], None, &[("SQLGATE_BACKEND", "databricks")], &[]).unwrap_err();
        assert_eq!(err.missing_fields(), vec!["server_hostname", "http_path", "access_token"]);
    }

    #[test]
    fn test_violations_never_echo_values() {
        let env = [
            ("SQLGATE_BACKEND", "databricks"),
            ("DATABRICKS_SERVER_HOSTNAME", "https://acme.cloud.databricks.com"),
            ("DATABRICKS_HTTP_PATH", TOKEN),
            ("DATABRICKS_TOKEN", TOKEN),
        ];
        let err = resolve(&[], None, &env, &[]).unwrap_err();

        let message = err.to_string();
        assert!(message.contains("server_hostname"));
        assert!(message.contains("http_path"));
        assert!(!message.contains(TOKEN));
        assert!(!message.contains("acme"));
    }

    #[test]
    fn test_generated_secrets_never_echoed() {
        let mut rng = rand::rng();
        for _ in 0..64 {
            let secret = common::random_secret(&mut rng);
            let env = [
                ("SQLGATE_BACKEND", "databricks"),
                ("DATABRICKS_SERVER_HOSTNAME", secret.as_str()),
                ("DATABRICKS_HTTP_PATH", secret.as_str()),
                ("DATABRICKS_TOKEN", secret.as_str()),
            ];
            let pool_size = format!("pool_size={secret}");
            let err = resolve(&[], None, &env, &[pool_size.as_str()]).unwrap_err();

            let message = err.to_string();
            assert!(message.contains("http_path"));
            assert!(message.contains("pool_size"));
            assert!(!message.contains(&secret), "{message}");
            assert!(!format!("{err:?}").contains(&secret));

            let env = [
                ("SQLGATE_BACKEND", "databricks"),
                ("DATABRICKS_SERVER_HOSTNAME", "acme.cloud.databricks.com"),
                ("DATABRICKS_HTTP_PATH", "/sql/1.0/warehouses/abc"),
                ("DATABRICKS_TOKEN", secret.as_str()),
            ];
            let config = resolve(&[], None, &env, &[]).unwrap();
            assert!(!config.to_redacted_json().to_string().contains(&secret));
            assert!(!format!("{config:?}").contains(&secret));
        }
    }

    #[test]
    fn test_check_output_masks_token() {
        let env = [
            ("SQLGATE_BACKEND", "databricks"),
            ("DATABRICKS_SERVER_HOSTNAME", "acme.cloud.databricks.com"),
            ("DATABRICKS_HTTP_PATH", "/sql/1.0/warehouses/abc"),
            ("DATABRICKS_TOKEN", TOKEN),
        ];
        let config = resolve(&[], None, &env, &[]).unwrap();

        let json = config.to_redacted_json();
        assert_eq!(json["access_token"]["value"], sqlgate::redact::MASK);
        assert_eq!(json["access_token"]["source"], "env");
        assert!(!json.to_string().contains(TOKEN));
    }
}
