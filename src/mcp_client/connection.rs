//! Connection manager: one per registered server.
//!
//! Owns the server's state machine (`disconnected → connecting → connected`,
//! with `error` on failure), its process channel and process handle.
//!
//! - `connect` / `disconnect` / automatic reconnects are serialized by the
//!   lifecycle lock; snapshot reads never wait on it.
//! - Every status change goes through `transition`, which also applies the
//!   side effects (timestamps, restart counter, catalog eviction) and
//!   publishes a `StatusChanged` event.
//! - Each established connection gets an `epoch`; a supervisor task watches
//!   that epoch's stream and exit report and ignores them once the epoch
//!   is superseded. Explicit connect/disconnect bump a `generation` that
//!   cancels pending reconnect loops.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::Utc;
use futures::future::BoxFuture;
use serde_json::{json, Value};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use super::catalog::ToolCatalog;
use super::config::{ServerDescriptor, ServiceSettings};
use super::errors::McpError;
use super::events::{EventBus, ServerEvent};
use super::lifecycle::{
    reconnect_delay, spawn_stderr_drain, ExitReport, LaunchedProcess, Launcher, ProcessHandle,
    StderrTail,
};
use super::transport::{ChannelEvent, ProcessChannel};
use super::types::{
    error_codes, methods, CallToolResult, InitializeResult, ListToolsResult, ServerCapabilities,
    ServerState, ServerStatus, ToolArguments, ToolDescriptor, PROTOCOL_VERSION,
};

/// Client name sent in `initialize`.
const CLIENT_NAME: &str = "toolhub";

/// Upper bound on `tools/list` pages followed during discovery.
const MAX_TOOL_PAGES: usize = 64;

/// Extra time allowed for the exit watcher after the shutdown grace period.
const EXIT_WAIT_SLACK: Duration = Duration::from_secs(1);

struct Inner {
    state: ServerState,
    channel: Option<Arc<ProcessChannel>>,
    process: Option<ProcessHandle>,
    supervisor: Option<JoinHandle<()>>,
    stderr: StderrTail,
    epoch: u64,
    generation: u64,
    /// Set when the descriptor was replaced; a retired manager never connects.
    retired: bool,
}

/// Supervises one server process.
pub struct ConnectionManager {
    descriptor: ServerDescriptor,
    settings: Arc<ServiceSettings>,
    launcher: Arc<dyn Launcher>,
    catalog: Arc<ToolCatalog>,
    events: EventBus,
    lifecycle: tokio::sync::Mutex<()>,
    inner: Mutex<Inner>,
}

impl ConnectionManager {
    pub fn new(
        descriptor: ServerDescriptor,
        settings: Arc<ServiceSettings>,
        launcher: Arc<dyn Launcher>,
        catalog: Arc<ToolCatalog>,
        events: EventBus,
    ) -> Arc<Self> {
        let state = ServerState::new(&descriptor.id);
        Arc::new(Self {
            descriptor,
            settings,
            launcher,
            catalog,
            events,
            lifecycle: tokio::sync::Mutex::new(()),
            inner: Mutex::new(Inner {
                state,
                channel: None,
                process: None,
                supervisor: None,
                stderr: StderrTail::new(),
                epoch: 0,
                generation: 0,
                retired: false,
            }),
        })
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn id(&self) -> &str {
        &self.descriptor.id
    }

    pub fn descriptor(&self) -> &ServerDescriptor {
        &self.descriptor
    }

    pub fn status(&self) -> ServerStatus {
        self.lock().state.status
    }

    /// Snapshot of the runtime state.
    pub fn state(&self) -> ServerState {
        self.lock().state.clone()
    }

    pub fn is_retired(&self) -> bool {
        self.lock().retired
    }

    // ─── Lifecycle ───────────────────────────────────────────────────────

    /// Explicit connect. Resets the restart counter and cancels any
    /// pending automatic reconnect. A no-op if already connected.
    ///
    /// A failed explicit connect leaves the server in `error` and is not
    /// retried automatically. On a retired manager this does nothing; the
    /// caller should look up the replacement.
    pub async fn connect(self: &Arc<Self>) -> Result<(), McpError> {
        if !self.descriptor.enabled {
            return Err(McpError::ServerDisabled {
                server: self.descriptor.id.clone(),
            });
        }

        let _guard = self.lifecycle.lock().await;
        {
            let mut inner = self.lock();
            if inner.retired {
                return Ok(());
            }
            inner.state.restart_attempts = 0;
            if inner.state.status == ServerStatus::Connected {
                return Ok(());
            }
            inner.generation += 1;
        }
        self.establish().await
    }

    /// Explicit stop: terminate the process and stop reading from it.
    pub async fn disconnect(&self) {
        self.stop(false).await;
    }

    /// Stop for good, because the descriptor is being replaced. Returns the
    /// status the server had when the stop began.
    pub async fn retire(&self) -> ServerStatus {
        self.stop(true).await
    }

    async fn stop(&self, retire: bool) -> ServerStatus {
        let _guard = self.lifecycle.lock().await;

        let (channel, process, supervisor, previous) = {
            let mut inner = self.lock();
            let previous = inner.state.status;
            inner.retired |= retire;
            inner.generation += 1;
            inner.epoch += 1;
            let taken = (
                inner.channel.take(),
                inner.process.take(),
                inner.supervisor.take(),
            );
            if inner.state.status != ServerStatus::Disconnected {
                self.transition(&mut inner, ServerStatus::Disconnected, None);
            }
            (taken.0, taken.1, taken.2, previous)
        };

        self.release(channel, process, "disconnected", self.settings.shutdown_grace());

        // The supervisor finishes once the exit watcher reports.
        if let Some(supervisor) = supervisor {
            let wait = self.settings.shutdown_grace() + EXIT_WAIT_SLACK;
            if tokio::time::timeout(wait, supervisor).await.is_err() {
                tracing::warn!(server = %self.descriptor.id, "process exit not observed after shutdown");
            }
        }
        previous
    }

    /// Close the channel (which closes the process's stdin), then ask the
    /// process to exit within `grace`.
    fn release(
        &self,
        channel: Option<Arc<ProcessChannel>>,
        process: Option<ProcessHandle>,
        reason: &str,
        grace: Duration,
    ) {
        if let Some(channel) = channel {
            channel.close(reason);
        }
        if let Some(mut process) = process {
            process.terminate(grace);
        }
    }

    /// Launch the process, run the handshake and discovery, and enter
    /// `connected`. Caller holds the lifecycle lock.
    async fn establish(self: &Arc<Self>) -> Result<(), McpError> {
        let id = self.descriptor.id.clone();

        let (old_channel, old_process, epoch) = {
            let mut inner = self.lock();
            inner.epoch += 1;
            let old = (inner.channel.take(), inner.process.take());
            inner.supervisor = None;
            self.transition(&mut inner, ServerStatus::Connecting, None);
            (old.0, old.1, inner.epoch)
        };
        self.release(old_channel, old_process, "reconnecting", Duration::ZERO);

        let LaunchedProcess {
            stdin,
            stdout,
            stderr,
            handle: mut process,
        } = match self.launcher.launch(&self.descriptor) {
            Ok(launched) => launched,
            Err(e) => {
                tracing::error!(server = %id, error = %e, "launch failed");
                self.fail(epoch, &e);
                return Err(e);
            }
        };

        let tail = StderrTail::new();
        if let Some(stderr) = stderr {
            spawn_stderr_drain(&id, stderr, tail.clone());
        }

        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let channel = Arc::new(ProcessChannel::start(&id, stdout, stdin, event_tx));
        let exit = process.take_exit();

        let connect_timeout = self.settings.connect_timeout();
        let outcome = tokio::time::timeout(connect_timeout, handshake(&channel, connect_timeout)).await;

        let (capabilities, tools) = match outcome {
            Ok(Ok(found)) => found,
            Ok(Err(e)) => {
                let error = match e {
                    McpError::Timeout { .. } => McpError::HandshakeTimeout {
                        server: id.clone(),
                        timeout_ms: connect_timeout.as_millis() as u64,
                    },
                    other => McpError::HandshakeFailed {
                        server: id.clone(),
                        reason: format!("{other}{}", tail.error_suffix()),
                    },
                };
                return Err(self.abort_handshake(epoch, channel, process, tail, error));
            }
            Err(_) => {
                let error = McpError::HandshakeTimeout {
                    server: id.clone(),
                    timeout_ms: connect_timeout.as_millis() as u64,
                };
                return Err(self.abort_handshake(epoch, channel, process, tail, error));
            }
        };

        let tool_count = tools.len();
        {
            let mut inner = self.lock();
            self.catalog.replace(&id, tools);
            self.events.emit(ServerEvent::CatalogRefreshed {
                server_id: id.clone(),
                tool_count,
            });
            inner.channel = Some(Arc::clone(&channel));
            inner.process = Some(process);
            inner.stderr = tail;
            inner.state.capabilities = capabilities;
            self.transition(&mut inner, ServerStatus::Connected, None);

            // Started only now: stream events and an early exit that
            // happened during the handshake are buffered until then.
            let supervisor = tokio::spawn(Arc::clone(self).supervise(epoch, event_rx, exit));
            inner.supervisor = Some(supervisor);
        }

        tracing::info!(server = %id, tools = tool_count, "server connected");
        Ok(())
    }

    fn abort_handshake(
        &self,
        epoch: u64,
        channel: Arc<ProcessChannel>,
        process: ProcessHandle,
        tail: StderrTail,
        error: McpError,
    ) -> McpError {
        tracing::error!(server = %self.descriptor.id, error = %error, "handshake failed");
        self.release(Some(channel), Some(process), "handshake failed", Duration::ZERO);
        self.lock().stderr = tail;
        self.fail(epoch, &error);
        error
    }

    /// Enter `error` for `epoch`, unless it has been superseded.
    fn fail(&self, epoch: u64, error: &McpError) {
        let mut inner = self.lock();
        if inner.epoch == epoch {
            self.transition(&mut inner, ServerStatus::Error, Some(error.to_string()));
        }
    }

    /// The single state transition path.
    fn transition(&self, inner: &mut Inner, status: ServerStatus, error: Option<String>) {
        let id = &self.descriptor.id;
        let now = Utc::now();
        let previous = inner.state.status;

        match status {
            ServerStatus::Connected => {
                inner.state.last_connected = Some(now);
                inner.state.connected_since = Some(now);
                inner.state.last_error = None;
            }
            ServerStatus::Error => {
                inner.state.restart_attempts = inner.state.restart_attempts.saturating_add(1);
                inner.state.last_error = error.clone();
                inner.state.connected_since = None;
                self.catalog.remove(id);
            }
            ServerStatus::Disconnected => {
                inner.state.last_error = None;
                inner.state.connected_since = None;
                self.catalog.remove(id);
            }
            ServerStatus::Connecting => {
                inner.state.connected_since = None;
                self.catalog.remove(id);
            }
        }
        inner.state.status = status;

        match &error {
            Some(reason) => {
                tracing::warn!(server = %id, from = %previous, to = %status, error = %reason, "server status changed")
            }
            None => tracing::info!(server = %id, from = %previous, to = %status, "server status changed"),
        }

        self.events.emit(ServerEvent::StatusChanged {
            server_id: id.clone(),
            status,
            error,
            at: now,
        });
    }

    // ─── Supervision ─────────────────────────────────────────────────────

    /// Watch one connection epoch until its stream closes or its process
    /// exits, then hand over to `on_connection_lost`.
    async fn supervise(
        self: Arc<Self>,
        epoch: u64,
        mut events: mpsc::UnboundedReceiver<ChannelEvent>,
        exit: Option<oneshot::Receiver<ExitReport>>,
    ) {
        let exit = exit_description(exit);
        tokio::pin!(exit);
        let mut events_open = true;

        let reason = loop {
            tokio::select! {
                event = events.recv(), if events_open => match event {
                    Some(ChannelEvent::Notification { method, .. }) => {
                        self.on_notification(epoch, &method).await;
                    }
                    Some(ChannelEvent::Closed { reason }) => break reason,
                    None => events_open = false,
                },
                description = &mut exit => break description,
            }
        };

        self.on_connection_lost(epoch, reason).await;
    }

    async fn on_notification(&self, epoch: u64, method: &str) {
        if method == methods::TOOLS_LIST_CHANGED {
            self.refresh_catalog(epoch).await;
        } else {
            tracing::debug!(server = %self.descriptor.id, method, "server notification");
        }
    }

    /// Re-run discovery and replace the server's catalog entry wholesale.
    async fn refresh_catalog(&self, epoch: u64) {
        let channel = {
            let inner = self.lock();
            if inner.epoch != epoch || inner.state.status != ServerStatus::Connected {
                return;
            }
            inner.channel.clone()
        };
        let Some(channel) = channel else { return };

        match list_tools(&channel, self.settings.connect_timeout()).await {
            Ok(tools) => {
                let inner = self.lock();
                if inner.epoch != epoch || inner.state.status != ServerStatus::Connected {
                    return;
                }
                let tool_count = tools.len();
                self.catalog.replace(&self.descriptor.id, tools);
                self.events.emit(ServerEvent::CatalogRefreshed {
                    server_id: self.descriptor.id.clone(),
                    tool_count,
                });
                tracing::info!(server = %self.descriptor.id, tools = tool_count, "tool list refreshed");
            }
            Err(e) => {
                tracing::warn!(server = %self.descriptor.id, error = %e, "tool list refresh failed");
            }
        }
    }

    /// `connected → error` after an unexpected exit or stream closure.
    async fn on_connection_lost(self: Arc<Self>, epoch: u64, reason: String) {
        let (channel, process, generation) = {
            let mut inner = self.lock();
            if inner.epoch != epoch || inner.state.status != ServerStatus::Connected {
                return;
            }
            let taken = (inner.channel.take(), inner.process.take());
            inner.supervisor = None;
            let suffix = inner.stderr.error_suffix();
            self.transition(&mut inner, ServerStatus::Error, Some(format!("{reason}{suffix}")));
            (taken.0, taken.1, inner.generation)
        };

        tracing::error!(server = %self.descriptor.id, reason = %reason, "connection lost");
        self.release(channel, process, &reason, Duration::ZERO);

        tokio::spawn(self.reconnect_loop(generation));
    }

    /// Automatic reconnects with exponential backoff while the restart
    /// policy allows; parks in `error` once the budget is spent.
    fn reconnect_loop(self: Arc<Self>, generation: u64) -> BoxFuture<'static, ()> {
        Box::pin(async move {
            let policy = &self.descriptor.restart;
            let max_attempts = self.settings.max_attempts_for(&self.descriptor);

            loop {
                let attempt = {
                    let inner = self.lock();
                    if inner.generation != generation || inner.state.status != ServerStatus::Error {
                        return;
                    }
                    inner.state.restart_attempts
                };

                if !policy.auto_restart || attempt > max_attempts {
                    tracing::warn!(
                        server = %self.descriptor.id,
                        attempts = attempt,
                        max_attempts,
                        "reconnect budget exhausted, parking in error"
                    );
                    return;
                }

                let delay = reconnect_delay(
                    attempt,
                    self.settings.reconnect_base_delay(),
                    self.settings.reconnect_max_delay(),
                );
                tracing::info!(
                    server = %self.descriptor.id,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    "scheduling reconnect"
                );
                self.events.emit(ServerEvent::ReconnectScheduled {
                    server_id: self.descriptor.id.clone(),
                    attempt,
                    delay_ms: delay.as_millis() as u64,
                });
                tokio::time::sleep(delay).await;

                let _guard = self.lifecycle.lock().await;
                {
                    let inner = self.lock();
                    if inner.generation != generation || inner.state.status != ServerStatus::Error {
                        return;
                    }
                }
                if self.establish().await.is_ok() {
                    return;
                }
            }
        })
    }

    // ─── Calls ───────────────────────────────────────────────────────────

    /// Send `tools/call` and parse the result.
    ///
    /// A result flagged `isError` is returned as `ToolReportedError`. Call
    /// failures never change the connection state.
    pub async fn call_tool(
        &self,
        tool_name: &str,
        arguments: &ToolArguments,
        timeout: Duration,
    ) -> Result<CallToolResult, McpError> {
        let channel = {
            let inner = self.lock();
            match (&inner.channel, inner.state.status) {
                (Some(channel), ServerStatus::Connected) => Arc::clone(channel),
                (_, status) => {
                    return Err(McpError::ServerUnavailable {
                        server: self.descriptor.id.clone(),
                        status: status.to_string(),
                    })
                }
            }
        };

        let params = json!({ "name": tool_name, "arguments": arguments });
        let value = channel
            .request(methods::TOOLS_CALL, Some(params), timeout)
            .await?
            .into_result()?;
        let result: CallToolResult = decode(value, "tools/call")?;

        if result.is_error {
            let message = result
                .content
                .iter()
                .filter_map(|c| c.as_text())
                .collect::<Vec<_>>()
                .join("\n");
            return Err(McpError::ToolReportedError {
                code: error_codes::INTERNAL_ERROR,
                message: if message.is_empty() {
                    format!("tool '{tool_name}' reported an error")
                } else {
                    message
                },
                data: serde_json::to_value(&result.content).ok(),
            });
        }
        Ok(result)
    }
}

// ─── Protocol Steps ──────────────────────────────────────────────────────────

async fn exit_description(exit: Option<oneshot::Receiver<ExitReport>>) -> String {
    match exit {
        Some(rx) => match rx.await {
            Ok(report) => report.description,
            Err(_) => "process exit watcher stopped".to_string(),
        },
        None => std::future::pending().await,
    }
}

fn decode<T: serde::de::DeserializeOwned>(value: Value, what: &str) -> Result<T, McpError> {
    serde_json::from_value(value).map_err(|e| McpError::ProtocolDecode {
        reason: format!("invalid {what} result: {e}"),
    })
}

/// `initialize` → `notifications/initialized` → `tools/list`.
async fn handshake(
    channel: &ProcessChannel,
    timeout: Duration,
) -> Result<(ServerCapabilities, Vec<ToolDescriptor>), McpError> {
    let params = json!({
        "protocolVersion": PROTOCOL_VERSION,
        "capabilities": {},
        "clientInfo": {
            "name": CLIENT_NAME,
            "version": env!("CARGO_PKG_VERSION"),
        },
    });

    let init = channel
        .request(methods::INITIALIZE, Some(params), timeout)
        .await?
        .into_result()?;
    let init: InitializeResult = decode(init, "initialize")?;
    tracing::debug!(
        server = %channel.server_id(),
        protocol = ?init.protocol_version,
        "initialize acknowledged"
    );

    channel.notify(methods::INITIALIZED, None)?;

    let capabilities = ServerCapabilities::from(init);
    let tools = list_tools(channel, timeout).await?;
    Ok((capabilities, tools))
}

/// Fetch every page of `tools/list`.
async fn list_tools(
    channel: &ProcessChannel,
    timeout: Duration,
) -> Result<Vec<ToolDescriptor>, McpError> {
    let mut tools = Vec::new();
    let mut cursor: Option<String> = None;

    for _ in 0..MAX_TOOL_PAGES {
        let params = cursor.as_ref().map(|c| json!({ "cursor": c }));
        let page = channel
            .request(methods::TOOLS_LIST, params, timeout)
            .await?
            .into_result()?;
        let page: ListToolsResult = decode(page, "tools/list")?;

        tools.extend(
            page.tools
                .into_iter()
                .map(|t| ToolDescriptor::from_wire(channel.server_id(), t)),
        );

        match page.next_cursor {
            Some(next) if !next.is_empty() => cursor = Some(next),
            _ => return Ok(tools),
        }
    }

    tracing::warn!(server = %channel.server_id(), pages = MAX_TOOL_PAGES, "tools/list pagination truncated");
    Ok(tools)
}

// ─── Tests ───────────────────────────────────────────────────────────────────
