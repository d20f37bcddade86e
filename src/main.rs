//! sqlgate CLI Entry Point
//!
//! Subcommands:
//! - `serve` - MCP server on stdio (the default)
//! - `check` - resolve the configuration and print it with secrets masked
//!
//! stdout carries JSON only (JSON-RPC in `serve`, a JSON document in
//! `check`). Logs go to stderr.

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tracing::error;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use sqlgate::config::{parse_override, resolve_config, ConfigError, ConfigInputs, LoadOptions, ResolvedConfig};
use sqlgate::{ErrorEnvelope, GatewayError};

/// sqlgate - uniform tool-calling gateway for SQL warehouses and databases
#[derive(Parser)]
#[command(name = "sqlgate")]
#[command(about = "Expose a SQL warehouse or database as MCP tools with a uniform result contract")]
#[command(version)]
struct Cli {
    /// Config file (JSON or TOML); overrides the default locations
    #[arg(long, global = true, env = "SQLGATE_CONFIG", value_name = "PATH")]
    config: Option<PathBuf>,

    /// Override one option, highest precedence (repeatable)
    #[arg(long = "set", global = true, value_name = "KEY=VALUE")]
    overrides: Vec<String>,

    /// Log filter used when RUST_LOG is unset
    #[arg(long, global = true, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the MCP server on stdin/stdout
    Serve,

    /// Resolve the configuration and print it with secrets masked
    Check,
}

fn init_tracing(log_level: &str) {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(log_level)),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
}

fn load_config(cli: &Cli) -> Result<ResolvedConfig, ConfigError> {
    let overrides = cli.overrides.iter().map(|raw| parse_override(raw)).collect::<Result<Vec<_>, _>>()?;
    let options = LoadOptions { explicit_path: cli.config.clone(), overrides, ..LoadOptions::default() };
    resolve_config(&ConfigInputs::load(&options)?)
}

fn print_json(value: &serde_json::Value) {
    match serde_json::to_string_pretty(value) {
        Ok(text) => println!("{text}"),
        Err(e) => error!(error = %e, "Failed to encode output"),
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing(&cli.log_level);

    let config = load_config(&cli);

    match cli.command.unwrap_or(Commands::Serve) {
        Commands::Check => match config {
            Ok(config) => {
                print_json(&config.to_redacted_json());
                ExitCode::SUCCESS
            }
            Err(e) => {
                let err = GatewayError::from(e);
                let envelope = ErrorEnvelope::from_error(&err, err.message());
                print_json(&serde_json::to_value(envelope).unwrap_or_default());
                ExitCode::FAILURE
            }
        },
        Commands::Serve => {
            let config = match config {
                Ok(config) => Arc::new(config),
                Err(e) => {
                    error!(error = %e, "Invalid configuration");
                    return ExitCode::FAILURE;
                }
            };

            match sqlgate::mcp::serve(config).await {
                Ok(()) => ExitCode::SUCCESS,
                Err(e) => {
                    error!(error = %format!("{e:#}"), "MCP server stopped");
                    ExitCode::FAILURE
                }
            }
        }
    }
}
