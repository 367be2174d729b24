//! Subcommand handlers
//!
//! Each handler returns a JSON document and whether the operation succeeded.

use anyhow::{anyhow, Context, Result};
use clap::Subcommand;
use serde_json::{json, Value};
use steadylink::error::Error;
use steadylink::provider::{PreflightOptions, RequestOptions, ResilientClient};
use steadylink::traits::HttpMethod;
use tokio::sync::broadcast::error::RecvError;

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Check that the backend answers its health route
    Preflight {
        /// Two-second check without retries
        #[arg(long)]
        quick: bool,
        /// Extra attempts when unreachable
        #[arg(long, default_value_t = 0)]
        retries: u32,
    },
    /// Measure the link and print the recommendation
    Assess,
    /// Find the backend
    Discover {
        /// Ignore the remembered result
        #[arg(long)]
        refresh: bool,
    },
    /// Send a request through the resilient client
    Request {
        /// HTTP method
        method: String,
        /// Path relative to the backend
        path: String,
        /// JSON body
        #[arg(long)]
        body: Option<String>,
        /// Circuit breaker group
        #[arg(long)]
        group: Option<String>,
        /// Retry cap
        #[arg(long)]
        max_retries: Option<u32>,
    },
    /// Run the health monitor
    Monitor {
        /// Number of checks before exiting
        #[arg(long, default_value_t = 1)]
        checks: u32,
    },
    /// Show circuit breaker state
    Breakers,
}

pub struct Outcome {
    pub output: Value,
    pub success: bool,
}

impl Outcome {
    fn ok(output: Value) -> Self {
        Self { output, success: true }
    }
}

pub async fn run(client: &ResilientClient, command: Command) -> Result<Outcome> {
    match command {
        Command::Preflight { quick, retries } => preflight(client, quick, retries).await,
        Command::Assess => assess(client).await,
        Command::Discover { refresh } => discover(client, refresh).await,
        Command::Request {
            method,
            path,
            body,
            group,
            max_retries,
        } => request(client, &method, &path, body.as_deref(), group, max_retries).await,
        Command::Monitor { checks } => monitor(client, checks).await,
        Command::Breakers => breakers(client),
    }
}

async fn preflight(client: &ResilientClient, quick: bool, retries: u32) -> Result<Outcome> {
    let backend = client.resolve_backend().await;
    let result = if quick {
        client.preflight().quick_check().await
    } else {
        let options = if retries > 0 {
            PreflightOptions::default().with_retries(retries)
        } else {
            PreflightOptions::default()
        };
        client.preflight().validate(options).await
    };

    Ok(Outcome {
        success: result.reachable,
        output: json!({ "backend": backend, "preflight": result }),
    })
}

async fn assess(client: &ResilientClient) -> Result<Outcome> {
    let backend = client.resolve_backend().await;
    let assessment = client.assessor().assess().await;
    let timeout = client.effective_timeout(&assessment);

    Ok(Outcome::ok(json!({
        "backend": backend,
        "assessment": assessment,
        "effective_timeout_ms": timeout.as_millis() as u64,
    })))
}

async fn discover(client: &ResilientClient, refresh: bool) -> Result<Outcome> {
    let result = if refresh {
        client.discovery().refresh().await
    } else {
        client.discovery().discover().await
    };

    Ok(Outcome {
        success: result.validated,
        output: json!({
            "result": result,
            "cached_endpoints": client.discovery().cached_endpoints(),
        }),
    })
}

async fn request(
    client: &ResilientClient,
    method: &str,
    path: &str,
    body: Option<&str>,
    group: Option<String>,
    max_retries: Option<u32>,
) -> Result<Outcome> {
    let method: HttpMethod = method.parse().map_err(|e| anyhow!("{e}"))?;
    let body = body
        .map(serde_json::from_str::<Value>)
        .transpose()
        .context("--body is not valid JSON")?;

    let mut options = RequestOptions::new();
    options.group = group;
    options.max_retries = max_retries;

    match client.request(method, path, body, options).await {
        Ok(response) => {
            let body = response.json::<Value>().unwrap_or_else(|_| Value::String(response.text()));
            Ok(Outcome::ok(json!({
                "status": response.status,
                "attempts": response.attempts,
                "duration_ms": response.duration.as_millis() as u64,
                "url": response.url,
                "body": body,
            })))
        }
        Err(Error::Request {
            classification,
            status,
            attempts,
        }) => Ok(Outcome {
            success: false,
            output: json!({
                "status": status,
                "attempts": attempts,
                "error": classification,
            }),
        }),
        Err(e) => Err(e.into()),
    }
}

async fn monitor(client: &ResilientClient, checks: u32) -> Result<Outcome> {
    client.resolve_backend().await;
    let monitor = client.monitor();
    let mut reports = monitor.subscribe();
    monitor.start();

    let mut collected = Vec::new();
    while collected.len() < checks as usize {
        match reports.recv().await {
            Ok(report) => {
                eprintln!("check {}: {}", collected.len() + 1, report.status);
                collected.push(report);
            }
            Err(RecvError::Lagged(skipped)) => {
                tracing::debug!(skipped, "Monitor output lagged");
            }
            Err(RecvError::Closed) => break,
        }
    }
    monitor.stop();

    let healthy = collected.last().is_some_and(|r| r.is_healthy);
    Ok(Outcome {
        success: healthy,
        output: json!({
            "reports": collected,
            "uptime_pct": monitor.uptime_pct(),
        }),
    })
}

fn breakers(client: &ResilientClient) -> Result<Outcome> {
    Ok(Outcome::ok(json!({
        "breakers": client.breakers().health_snapshot(),
        "open": client.breakers().open_breakers(),
    })))
}
