//! toolhub: supervises the tool servers listed in a YAML config.
//!
//! Usage: `toolhub [CONFIG]` (default: `$TOOLHUB_CONFIG`, then `toolhub.yaml`).

use std::path::PathBuf;

use anyhow::Context;
use tokio::sync::broadcast::error::RecvError;

use toolhub::logging;
use toolhub::mcp_client::{Orchestrator, ServerEvent, ServiceConfig};

const DEFAULT_CONFIG: &str = "toolhub.yaml";

fn config_path() -> PathBuf {
    std::env::args_os()
        .nth(1)
        .map(PathBuf::from)
        .or_else(|| std::env::var_os("TOOLHUB_CONFIG").map(PathBuf::from))
        .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let path = config_path();
    let config = ServiceConfig::load(&path)
        .with_context(|| format!("loading config from {}", path.display()))?;

    logging::init_tracing(&config.logging).context("initializing logging")?;
    tracing::info!(config = %path.display(), servers = config.servers.len(), "configuration loaded");

    let orchestrator = Orchestrator::from_config(config).context("building orchestrator")?;

    let mut events = orchestrator.subscribe();
    let event_log = tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(event) => log_event(&event),
                Err(RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "event log fell behind");
                }
                Err(RecvError::Closed) => break,
            }
        }
    });

    let failures = orchestrator.start().await;
    let summaries = orchestrator.list_servers(&Default::default());
    tracing::info!(
        registered = summaries.len(),
        failed = failures.len(),
        "startup complete"
    );

    tokio::signal::ctrl_c()
        .await
        .context("waiting for shutdown signal")?;
    tracing::info!("shutdown requested");

    orchestrator.shutdown_all().await;
    event_log.abort();
    Ok(())
}

fn log_event(event: &ServerEvent) {
    match event {
        ServerEvent::StatusChanged { server_id, status, error, .. } => {
            tracing::info!(server = %server_id, %status, error = ?error, "status changed");
        }
        ServerEvent::CatalogRefreshed { server_id, tool_count } => {
            tracing::info!(server = %server_id, tools = tool_count, "catalog refreshed");
        }
        ServerEvent::ToolExecuted {
            server_id,
            tool_name,
            success,
            elapsed_ms,
            ..
        } => {
            tracing::debug!(server = %server_id, tool = %tool_name, success, elapsed_ms, "tool executed");
        }
        ServerEvent::ReconnectScheduled {
            server_id,
            attempt,
            delay_ms,
        } => {
            tracing::info!(server = %server_id, attempt, delay_ms, "reconnect scheduled");
        }
    }
}
