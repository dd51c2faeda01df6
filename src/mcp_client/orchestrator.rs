//! Orchestrator: the façade over all connection managers.
//!
//! Holds the id → `ConnectionManager` map plus the shared catalog, ledger,
//! executor and event bus. Every operation delegates to the per-server
//! managers, which synchronize themselves; the map lock is never held
//! across an await.

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};

use chrono::Utc;
use serde::Serialize;
use tokio::sync::broadcast;

use super::catalog::ToolCatalog;
use super::config::{validate_descriptor, ServerDescriptor, ServiceConfig, ServiceSettings};
use super::connection::ConnectionManager;
use super::errors::McpError;
use super::events::{EventBus, ServerEvent};
use super::executor::ToolExecutor;
use super::ledger::{ExecutionRecord, HistoryFilter, Ledger, ServerStats};
use super::lifecycle::{Launcher, StdioLauncher};
use super::types::{
    CallerContext, ExecutionResult, ServerState, ServerStatus, ToolArguments, ToolDescriptor,
};

/// Which servers `list_servers` returns.
#[derive(Debug, Clone, Default)]
pub struct ServerFilter {
    pub status: Option<ServerStatus>,
    pub enabled: Option<bool>,
    pub connected_only: bool,
}

impl ServerFilter {
    fn matches(&self, summary: &ServerSummary) -> bool {
        self.status.map_or(true, |s| summary.status == s)
            && self.enabled.map_or(true, |e| summary.enabled == e)
            && (!self.connected_only || summary.status == ServerStatus::Connected)
    }
}

/// One row of `list_servers`.
#[derive(Debug, Clone, Serialize)]
pub struct ServerSummary {
    pub id: String,
    pub name: String,
    pub status: ServerStatus,
    pub tool_count: usize,
    pub last_connected: Option<chrono::DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub enabled: bool,
    pub restart_attempts: u32,
}

/// Entry point for the façade.
pub struct Orchestrator {
    settings: Arc<ServiceSettings>,
    launcher: Arc<dyn Launcher>,
    catalog: Arc<ToolCatalog>,
    ledger: Arc<Ledger>,
    executor: ToolExecutor,
    events: EventBus,
    servers: RwLock<HashMap<String, Arc<ConnectionManager>>>,
    /// Serializes register/replace so two upserts of one id cannot interleave.
    registration: tokio::sync::Mutex<()>,
}

impl Orchestrator {
    /// An orchestrator spawning real processes.
    pub fn new(settings: ServiceSettings) -> Result<Self, McpError> {
        let launcher = Arc::new(StdioLauncher::new(settings.working_dir.clone()));
        Self::with_launcher(settings, launcher)
    }

    /// An orchestrator using a custom process launcher.
    pub fn with_launcher(
        settings: ServiceSettings,
        launcher: Arc<dyn Launcher>,
    ) -> Result<Self, McpError> {
        let ledger = match &settings.history_log_path {
            Some(path) => Ledger::with_append_log(settings.history_capacity, path)?,
            None => Ledger::new(settings.history_capacity),
        };
        let ledger = Arc::new(ledger);
        let settings = Arc::new(settings);
        let events = EventBus::new();
        let executor = ToolExecutor::new(Arc::clone(&settings), Arc::clone(&ledger), events.clone());

        Ok(Self {
            settings,
            launcher,
            catalog: Arc::new(ToolCatalog::new()),
            ledger,
            executor,
            events,
            servers: RwLock::new(HashMap::new()),
            registration: tokio::sync::Mutex::new(()),
        })
    }

    /// Build from a loaded config and register (but do not connect) every
    /// server in it. Call [`Orchestrator::start`] to auto-connect.
    pub fn from_config(config: ServiceConfig) -> Result<Self, McpError> {
        config.validate()?;
        let orchestrator = Self::new(config.settings)?;
        for descriptor in config.servers {
            orchestrator.insert(descriptor);
        }
        Ok(orchestrator)
    }

    fn insert(&self, descriptor: ServerDescriptor) -> Arc<ConnectionManager> {
        let id = descriptor.id.clone();
        let manager = ConnectionManager::new(
            descriptor,
            Arc::clone(&self.settings),
            Arc::clone(&self.launcher),
            Arc::clone(&self.catalog),
            self.events.clone(),
        );
        self.ledger.reset_server(&id);
        self.servers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(id, Arc::clone(&manager));
        manager
    }

    fn manager(&self, server_id: &str) -> Result<Arc<ConnectionManager>, McpError> {
        self.servers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(server_id)
            .cloned()
            .ok_or_else(|| McpError::UnknownServer {
                server: server_id.to_string(),
            })
    }

    /// Managers ordered by id.
    fn managers(&self) -> Vec<Arc<ConnectionManager>> {
        let mut all: Vec<Arc<ConnectionManager>> = self
            .servers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect();
        all.sort_by(|a, b| a.id().cmp(b.id()));
        all
    }

    pub fn settings(&self) -> &ServiceSettings {
        &self.settings
    }

    // ─── Registration & Lifecycle ────────────────────────────────────────

    /// Register or replace a descriptor.
    ///
    /// An existing connection under the same id is stopped first and its
    /// stats are reset. If it was connected, the new descriptor is
    /// connected before returning.
    pub async fn register_server(&self, descriptor: ServerDescriptor) -> Result<(), McpError> {
        validate_descriptor(&descriptor)?;
        let _registration = self.registration.lock().await;

        let mut was_connected = false;
        if let Ok(previous) = self.manager(&descriptor.id) {
            tracing::info!(server = %descriptor.id, "replacing server descriptor");
            was_connected = previous.retire().await == ServerStatus::Connected;
        }

        let manager = self.insert(descriptor);
        tracing::info!(server = %manager.id(), command = %manager.descriptor().command, "server registered");

        if was_connected && manager.descriptor().enabled {
            manager.connect().await?;
        }
        Ok(())
    }

    /// Connect by id. If the descriptor is replaced while this waits, the
    /// replacement is connected instead.
    pub async fn connect_server(&self, server_id: &str) -> Result<(), McpError> {
        loop {
            let manager = self.manager(server_id)?;
            let result = manager.connect().await;
            if !manager.is_retired() {
                return result;
            }
            tokio::task::yield_now().await;
        }
    }

    pub async fn disconnect_server(&self, server_id: &str) -> Result<(), McpError> {
        loop {
            let manager = self.manager(server_id)?;
            manager.disconnect().await;
            if !manager.is_retired() {
                return Ok(());
            }
            tokio::task::yield_now().await;
        }
    }

    /// Connect every enabled, auto-connect server concurrently.
    ///
    /// Returns the servers that failed (partial startup is fine).
    pub async fn start(&self) -> Vec<(String, McpError)> {
        let targets: Vec<_> = self
            .managers()
            .into_iter()
            .filter(|m| m.descriptor().enabled && m.descriptor().auto_connect)
            .collect();
        tracing::info!(servers = targets.len(), "auto-connecting servers");

        let results = futures::future::join_all(targets.iter().map(|manager| async move {
            (manager.id().to_string(), manager.connect().await)
        }))
        .await;

        let failures: Vec<(String, McpError)> = results
            .into_iter()
            .filter_map(|(id, result)| result.err().map(|e| (id, e)))
            .collect();
        for (id, error) in &failures {
            tracing::warn!(server = %id, error = %error, "server failed to start");
        }
        failures
    }

    /// Stop every server.
    pub async fn shutdown_all(&self) {
        let managers = self.managers();
        tracing::info!(servers = managers.len(), "shutting down all servers");
        futures::future::join_all(managers.iter().map(|m| m.disconnect())).await;
    }

    // ─── Queries ─────────────────────────────────────────────────────────

    pub fn server_state(&self, server_id: &str) -> Result<ServerState, McpError> {
        Ok(self.manager(server_id)?.state())
    }

    /// Live state of every server matching `filter`, ordered by id.
    pub fn list_servers(&self, filter: &ServerFilter) -> Vec<ServerSummary> {
        self.managers()
            .iter()
            .map(|manager| {
                let state = manager.state();
                let descriptor = manager.descriptor();
                ServerSummary {
                    id: state.id,
                    name: descriptor.display_name().to_string(),
                    status: state.status,
                    tool_count: self.catalog.tool_count(manager.id()),
                    last_connected: state.last_connected,
                    error: state.last_error,
                    enabled: descriptor.enabled,
                    restart_attempts: state.restart_attempts,
                }
            })
            .filter(|summary| filter.matches(summary))
            .collect()
    }

    /// Tools of one server, or of every server ordered by `(server, name)`.
    pub fn list_tools(&self, server_id: Option<&str>) -> Result<Vec<ToolDescriptor>, McpError> {
        match server_id {
            Some(id) => {
                self.manager(id)?;
                Ok(self.catalog.tools_for(id))
            }
            None => Ok(self.catalog.merged()),
        }
    }

    pub fn get_stats(&self, server_id: &str) -> Result<ServerStats, McpError> {
        let manager = self.manager(server_id)?;
        Ok(self.stats_for(&manager))
    }

    /// Stats of every registered server, ordered by id.
    pub fn get_all_stats(&self) -> Vec<ServerStats> {
        self.managers().iter().map(|m| self.stats_for(m)).collect()
    }

    fn stats_for(&self, manager: &ConnectionManager) -> ServerStats {
        let mut stats = self
            .ledger
            .stats(manager.id())
            .unwrap_or_else(|| ServerStats::new(manager.id()));
        stats.uptime_secs = manager
            .state()
            .connected_since
            .map(|since| (Utc::now() - since).num_seconds().max(0) as u64);
        stats
    }

    /// Most recent execution records, newest first.
    pub fn history(&self, filter: &HistoryFilter) -> Vec<ExecutionRecord> {
        self.ledger.history(filter)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ServerEvent> {
        self.events.subscribe()
    }

    // ─── Execution ───────────────────────────────────────────────────────

    pub async fn execute_tool(
        &self,
        server_id: &str,
        tool_name: &str,
        arguments: ToolArguments,
        context: CallerContext,
    ) -> Result<ExecutionResult, McpError> {
        let manager = match self.manager(server_id) {
            Ok(manager) => manager,
            Err(e) => {
                self.executor
                    .record_rejected(server_id, tool_name, arguments, context, &e);
                return Err(e);
            }
        };
        self.executor
            .execute(&manager, &self.catalog, tool_name, arguments, context)
            .await
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────
