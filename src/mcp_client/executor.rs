//! Tool executor: precondition checks, admission and dispatch.
//!
//! Every execute call, whatever its outcome, appends exactly one
//! `ExecutionRecord` to the ledger and publishes `ToolExecuted`.

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use tokio::sync::Semaphore;
use uuid::Uuid;

use super::catalog::ToolCatalog;
use super::config::ServiceSettings;
use super::connection::ConnectionManager;
use super::errors::McpError;
use super::events::{EventBus, ServerEvent};
use super::ledger::{ExecutionOutcome, ExecutionRecord, Ledger};
use super::types::{CallToolResult, CallerContext, ExecutionResult, ServerStatus, ToolArguments};

/// Admits tool calls under a global concurrency ceiling.
pub struct ToolExecutor {
    settings: Arc<ServiceSettings>,
    /// FIFO: waiters are admitted in arrival order.
    permits: Arc<Semaphore>,
    ledger: Arc<Ledger>,
    events: EventBus,
}

impl ToolExecutor {
    pub fn new(settings: Arc<ServiceSettings>, ledger: Arc<Ledger>, events: EventBus) -> Self {
        let permits = Arc::new(Semaphore::new(settings.max_concurrent_calls));
        Self {
            settings,
            permits,
            ledger,
            events,
        }
    }

    /// Free admission slots.
    pub fn available_permits(&self) -> usize {
        self.permits.available_permits()
    }

    /// Execute a tool on a connected server.
    ///
    /// Checks, in order: the server is `connected`, the tool is in its
    /// catalog, every required argument is present. Only then does the
    /// call wait for an admission slot and go out on the wire.
    pub async fn execute(
        &self,
        connection: &ConnectionManager,
        catalog: &ToolCatalog,
        tool_name: &str,
        arguments: ToolArguments,
        context: CallerContext,
    ) -> Result<ExecutionResult, McpError> {
        let execution_id = Uuid::new_v4();
        let started_at = Utc::now();
        let start = Instant::now();

        let outcome = self
            .dispatch(connection, catalog, tool_name, &arguments)
            .await;

        let elapsed = start.elapsed();
        let latency = match &outcome {
            Ok(_) | Err(McpError::ToolReportedError { .. }) => Some(elapsed),
            Err(_) => None,
        };

        let server_id = connection.id();
        let (result, recorded) = match outcome {
            Ok(call) => {
                let result = ExecutionResult {
                    execution_id,
                    server_id: server_id.to_string(),
                    tool_name: tool_name.to_string(),
                    content: call.content.clone(),
                    structured_content: call.structured_content.clone(),
                    execution_time_ms: elapsed.as_millis() as u64,
                };
                let recorded = ExecutionOutcome::Success {
                    content: call.content,
                    structured_content: call.structured_content,
                };
                (Ok(result), recorded)
            }
            Err(e) => {
                let recorded = ExecutionOutcome::Failure { error: e.payload() };
                (Err(e), recorded)
            }
        };

        self.finish(
            ExecutionRecord {
                execution_id,
                server_id: server_id.to_string(),
                tool_name: tool_name.to_string(),
                arguments,
                outcome: recorded,
                started_at,
                finished_at: Utc::now(),
                elapsed_ms: elapsed.as_millis() as u64,
                context,
            },
            latency,
        );
        result
    }

    async fn dispatch(
        &self,
        connection: &ConnectionManager,
        catalog: &ToolCatalog,
        tool_name: &str,
        arguments: &ToolArguments,
    ) -> Result<CallToolResult, McpError> {
        let server_id = connection.id();

        let status = connection.status();
        if status != ServerStatus::Connected {
            return Err(McpError::ServerUnavailable {
                server: server_id.to_string(),
                status: status.to_string(),
            });
        }

        catalog.resolve_call(server_id, tool_name, arguments)?;

        let _permit = Arc::clone(&self.permits)
            .acquire_owned()
            .await
            .map_err(|_| McpError::Transport {
                server: server_id.to_string(),
                reason: "executor is shut down".into(),
            })?;

        let timeout = self.settings.call_timeout_for(connection.descriptor());
        tracing::debug!(server = %server_id, tool = %tool_name, timeout_ms = timeout.as_millis() as u64, "dispatching tool call");
        connection.call_tool(tool_name, arguments, timeout).await
    }

    /// Record a call rejected before it reached a connection manager
    /// (for example, an unknown server id).
    pub fn record_rejected(
        &self,
        server_id: &str,
        tool_name: &str,
        arguments: ToolArguments,
        context: CallerContext,
        error: &McpError,
    ) {
        let now = Utc::now();
        self.finish(
            ExecutionRecord {
                execution_id: Uuid::new_v4(),
                server_id: server_id.to_string(),
                tool_name: tool_name.to_string(),
                arguments,
                outcome: ExecutionOutcome::Failure {
                    error: error.payload(),
                },
                started_at: now,
                finished_at: now,
                elapsed_ms: 0,
                context,
            },
            None,
        );
    }

    fn finish(&self, record: ExecutionRecord, latency: Option<Duration>) {
        let success = record.outcome.is_success();
        match &record.outcome {
            ExecutionOutcome::Success { .. } => tracing::info!(
                server = %record.server_id,
                tool = %record.tool_name,
                execution_id = %record.execution_id,
                elapsed_ms = record.elapsed_ms,
                "tool call succeeded"
            ),
            ExecutionOutcome::Failure { error } => tracing::warn!(
                server = %record.server_id,
                tool = %record.tool_name,
                execution_id = %record.execution_id,
                elapsed_ms = record.elapsed_ms,
                kind = ?error.kind,
                error = %error.message,
                "tool call failed"
            ),
        }

        let event = ServerEvent::ToolExecuted {
            server_id: record.server_id.clone(),
            tool_name: record.tool_name.clone(),
            execution_id: record.execution_id,
            success,
            elapsed_ms: record.elapsed_ms,
        };
        self.ledger.record(record, latency);
        self.events.emit(event);
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mcp_client::config::ServerDescriptor;
    use crate::mcp_client::errors::ErrorKind;
    use crate::mcp_client::ledger::HistoryFilter;
    use crate::mcp_client::testing::{FakeLauncher, FakeTool, ToolBehavior};
    use serde_json::json;

    struct Harness {
        launcher: Arc<FakeLauncher>,
        connection: Arc<ConnectionManager>,
        catalog: Arc<ToolCatalog>,
        ledger: Arc<Ledger>,
        executor: Arc<ToolExecutor>,
    }

    fn harness(tools: Vec<FakeTool>, settings: ServiceSettings) -> Harness {
        let settings = Arc::new(settings);
        let launcher = Arc::new(FakeLauncher::new(tools));
        let catalog = Arc::new(ToolCatalog::new());
        let events = EventBus::new();
        let ledger = Arc::new(Ledger::new(settings.history_capacity));
        ledger.ensure_server("fake");
        let connection = ConnectionManager::new(
            ServerDescriptor::new("fake", "fake-server"),
            Arc::clone(&settings),
            launcher.clone(),
            Arc::clone(&catalog),
            events.clone(),
        );
        let executor = Arc::new(ToolExecutor::new(settings, Arc::clone(&ledger), events));
        Harness {
            launcher,
            connection,
            catalog,
            ledger,
            executor,
        }
    }

    fn args(value: serde_json::Value) -> ToolArguments {
        value.as_object().cloned().unwrap()
    }

    impl Harness {
        async fn execute(&self, tool: &str, arguments: ToolArguments) -> Result<ExecutionResult, McpError> {
            self.executor
                .execute(&self.connection, &self.catalog, tool, arguments, CallerContext::default())
                .await
        }
    }

    #[tokio::test]
    async fn test_success_is_recorded() {
        let h = harness(vec![FakeTool::new("ping", ToolBehavior::Echo)], ServiceSettings::default());
        h.connection.connect().await.unwrap();

        let result = h.execute("ping", ToolArguments::new()).await.unwrap();
        assert_eq!(result.server_id, "fake");
        assert_eq!(result.tool_name, "ping");

        let stats = h.ledger.stats("fake").unwrap();
        assert_eq!((stats.total_calls, stats.successful_calls, stats.failed_calls), (1, 1, 0));
        assert_eq!(stats.latency_samples, 1);

        let history = h.ledger.history(&HistoryFilter::default());
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].execution_id, result.execution_id);
    }

    #[tokio::test]
    async fn test_disconnected_server_never_reaches_process() {
        let h = harness(vec![FakeTool::new("ping", ToolBehavior::Echo)], ServiceSettings::default());

        let err = h.execute("ping", ToolArguments::new()).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ServerUnavailable);
        assert_eq!(h.launcher.calls_received(), 0);

        let stats = h.ledger.stats("fake").unwrap();
        assert_eq!((stats.total_calls, stats.failed_calls), (1, 1));
        assert_eq!(stats.latency_samples, 0);
    }

    #[tokio::test]
    async fn test_missing_arguments_not_dispatched() {
        let h = harness(
            vec![FakeTool::new("write", ToolBehavior::Echo).requires(&["path", "content"])],
            ServiceSettings::default(),
        );
        h.connection.connect().await.unwrap();

        match h.execute("write", args(json!({"content": "x"}))).await {
            Err(McpError::MissingArguments { missing, .. }) => assert_eq!(missing, vec!["path"]),
            other => panic!("expected MissingArguments, got {other:?}"),
        }
        assert_eq!(h.launcher.calls_received(), 0);
    }

    #[tokio::test]
    async fn test_unknown_tool_lists_available() {
        let h = harness(vec![FakeTool::new("ping", ToolBehavior::Echo)], ServiceSettings::default());
        h.connection.connect().await.unwrap();

        match h.execute("foo", ToolArguments::new()).await {
            Err(McpError::ToolNotFound { available, .. }) => assert_eq!(available, vec!["ping"]),
            other => panic!("expected ToolNotFound, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_timeout_then_late_reply_is_discarded() {
        let settings = ServiceSettings {
            tool_call_timeout_ms: 100,
            ..ServiceSettings::default()
        };
        let h = harness(
            vec![
                FakeTool::new("slow", ToolBehavior::Delay(Duration::from_millis(300))),
                FakeTool::new("ping", ToolBehavior::Echo),
            ],
            settings,
        );
        h.connection.connect().await.unwrap();

        let started = Instant::now();
        let err = h.execute("slow", ToolArguments::new()).await.unwrap_err();
        let waited = started.elapsed();
        assert!(matches!(err, McpError::Timeout { timeout_ms: 100, .. }));
        assert!(waited >= Duration::from_millis(100));
        assert!(waited < Duration::from_millis(300));
        assert_eq!(h.executor.available_permits(), 16);

        // Let the late reply arrive; it must not disturb anything.
        tokio::time::sleep(Duration::from_millis(300)).await;
        h.execute("ping", ToolArguments::new()).await.unwrap();

        let stats = h.ledger.stats("fake").unwrap();
        assert_eq!((stats.total_calls, stats.successful_calls, stats.failed_calls), (2, 1, 1));
        assert_eq!(stats.timed_out_calls, 1);
        assert_eq!(stats.latency_samples, 1);
        assert_eq!(h.connection.status(), ServerStatus::Connected);
    }

    #[tokio::test]
    async fn test_tool_reported_error_counts_latency() {
        let h = harness(
            vec![FakeTool::new("fail", ToolBehavior::ReportError("nope".into()))],
            ServiceSettings::default(),
        );
        h.connection.connect().await.unwrap();

        let err = h.execute("fail", ToolArguments::new()).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ToolReportedError);
        let stats = h.ledger.stats("fake").unwrap();
        assert_eq!(stats.failed_calls, 1);
        assert_eq!(stats.latency_samples, 1);
    }

    #[tokio::test]
    async fn test_concurrency_ceiling() {
        let settings = ServiceSettings {
            max_concurrent_calls: 2,
            ..ServiceSettings::default()
        };
        let h = Arc::new(harness(
            vec![FakeTool::new("slow", ToolBehavior::Delay(Duration::from_millis(50)))],
            settings,
        ));
        h.connection.connect().await.unwrap();

        let calls: Vec<_> = (0..6)
            .map(|_| {
                let h = Arc::clone(&h);
                tokio::spawn(async move { h.execute("slow", ToolArguments::new()).await })
            })
            .collect();
        for call in futures::future::join_all(calls).await {
            call.unwrap().unwrap();
        }

        assert_eq!(h.launcher.calls_received(), 6);
        assert_eq!(h.launcher.peak_in_flight(), 2);
        assert_eq!(h.ledger.stats("fake").unwrap().successful_calls, 6);
    }
}
