//! Steadylink CLI
//!
//! Probe, discover and call a backend over an unreliable link. Output is JSON
//! on stdout; logs go to stderr.

mod commands;
mod config;

use anyhow::{Context, Result};
use clap::Parser;
use commands::Command;
use config::CliConfig;
use std::path::PathBuf;
use std::sync::Arc;
use steadylink::provider::{FileStore, ResilientClient};
use tracing_subscriber::EnvFilter;

const DEFAULT_LOG_FILTER: &str = "steadylink=info";

#[derive(Debug, Parser)]
#[command(name = "steadylink", version, about = "Adaptive resilient HTTP client")]
struct Cli {
    /// JSON config file
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Backend URL, tried before discovery
    #[arg(long, global = true)]
    url: Option<String>,

    /// Backend port for discovery
    #[arg(long, global = true)]
    port: Option<u16>,

    /// Log as JSON lines
    #[arg(long, global = true)]
    json_logs: bool,

    #[command(subcommand)]
    command: Command,
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| DEFAULT_LOG_FILTER.into());
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let _ = dotenvy::dotenv();
    let cli = Cli::parse();
    init_tracing(cli.json_logs);

    let mut config = CliConfig::load(cli.config.as_deref())?;
    config.apply_env(|key| std::env::var(key).ok())?;
    config.apply_flags(cli.url, cli.port);

    let data_dir = config.data_dir();
    tracing::debug!(data_dir = %data_dir.display(), "Using data directory");

    let client = ResilientClient::builder()
        .config(config.client)
        .store(Arc::new(FileStore::new(data_dir)))
        .build()
        .await
        .context("failed to set up client")?;

    let outcome = commands::run(&client, cli.command).await?;
    println!("{}", serde_json::to_string_pretty(&outcome.output)?);

    if !outcome.success {
        std::process::exit(1);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_request() {
        let cli = Cli::parse_from([
            "steadylink",
            "--url",
            "http://localhost:8000",
            "request",
            "post",
            "/api/jobs",
            "--body",
            r#"{"name":"x"}"#,
            "--group",
            "jobs",
        ]);
        assert_eq!(cli.url.as_deref(), Some("http://localhost:8000"));
        match cli.command {
            Command::Request { method, path, body, group, .. } => {
                assert_eq!(method, "post");
                assert_eq!(path, "/api/jobs");
                assert!(body.is_some());
                assert_eq!(group.as_deref(), Some("jobs"));
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn test_global_flags_after_subcommand() {
        let cli = Cli::parse_from(["steadylink", "monitor", "--checks", "3", "--json-logs"]);
        assert!(cli.json_logs);
        assert!(matches!(cli.command, Command::Monitor { checks: 3 }));
    }
}
