//! In-process fake tool server for tests.
//!
//! `FakeLauncher` implements [`Launcher`] by spawning a task that speaks
//! the protocol over `tokio::io::duplex` pipes instead of a child process.
//! Tools can echo, delay, never reply, fail, or crash the "process", and
//! the launcher counts launches, received calls and in-flight calls.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, DuplexStream};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinSet;

use super::config::ServerDescriptor;
use super::errors::McpError;
use super::lifecycle::{ExitReport, LaunchedProcess, Launcher, ProcessHandle};
use super::types::{error_codes, methods, JSONRPC_VERSION, PROTOCOL_VERSION};

const PIPE_CAPACITY: usize = 64 * 1024;

/// How a fake tool answers `tools/call`.
#[derive(Debug, Clone)]
pub enum ToolBehavior {
    /// Reply at once; the arguments come back as structured content.
    Echo,
    /// Echo after a delay.
    Delay(Duration),
    /// Never reply.
    NeverReply,
    /// Reply with a JSON-RPC error object.
    Error { code: i64, message: String },
    /// Reply with a result flagged `isError`, carrying this text.
    ReportError(String),
    /// Terminate the fake process.
    Crash,
}

/// A tool exposed by the fake server.
#[derive(Debug, Clone)]
pub struct FakeTool {
    pub name: String,
    pub description: Option<String>,
    pub required: Vec<String>,
    pub behavior: ToolBehavior,
}

impl FakeTool {
    pub fn new(name: &str, behavior: ToolBehavior) -> Self {
        Self {
            name: name.to_string(),
            description: None,
            required: Vec::new(),
            behavior,
        }
    }

    pub fn requires(mut self, keys: &[&str]) -> Self {
        self.required = keys.iter().map(|k| k.to_string()).collect();
        self
    }

    pub fn describe(mut self, description: &str) -> Self {
        self.description = Some(description.to_string());
        self
    }

    fn wire(&self) -> Value {
        let properties: serde_json::Map<String, Value> = self
            .required
            .iter()
            .map(|k| (k.clone(), json!({ "type": "string" })))
            .collect();
        json!({
            "name": self.name,
            "description": self.description,
            "inputSchema": {
                "type": "object",
                "properties": properties,
                "required": self.required,
            },
        })
    }
}

/// How a launched fake behaves before serving tools.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartupMode {
    Normal,
    /// `launch` itself fails.
    LaunchFails,
    /// Reads requests but never answers the handshake.
    Silent,
    /// Answers `initialize` with an error.
    RejectInitialize,
    /// Exits before reading anything.
    ExitImmediately,
}

enum Control {
    Crash,
    ToolsChanged,
}

#[derive(Default)]
struct Counters {
    launches: AtomicUsize,
    running: AtomicUsize,
    calls: AtomicUsize,
    in_flight: AtomicUsize,
    peak_in_flight: AtomicUsize,
}

impl Counters {
    fn call_started(&self) {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak_in_flight.fetch_max(now, Ordering::SeqCst);
    }

    fn call_finished(&self) {
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
    }
}

struct Startup {
    modes: Vec<StartupMode>,
    next: usize,
}

/// A [`Launcher`] whose "processes" are in-process protocol fakes.
pub struct FakeLauncher {
    tools: Arc<Mutex<Vec<FakeTool>>>,
    startup: Mutex<Startup>,
    page_size: Option<usize>,
    counters: Arc<Counters>,
    controls: Mutex<Vec<mpsc::UnboundedSender<Control>>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl FakeLauncher {
    pub fn new(tools: Vec<FakeTool>) -> Self {
        Self {
            tools: Arc::new(Mutex::new(tools)),
            startup: Mutex::new(Startup {
                modes: vec![StartupMode::Normal],
                next: 0,
            }),
            page_size: None,
            counters: Arc::new(Counters::default()),
            controls: Mutex::new(Vec::new()),
        }
    }

    /// Startup mode per launch; the last entry repeats.
    pub fn with_startup(self, modes: Vec<StartupMode>) -> Self {
        self.set_startup(modes);
        self
    }

    /// Split `tools/list` into pages of `size`.
    pub fn with_page_size(mut self, size: usize) -> Self {
        self.page_size = Some(size.max(1));
        self
    }

    /// Replace the startup sequence; the next launch uses its first entry.
    pub fn set_startup(&self, modes: Vec<StartupMode>) {
        let modes = if modes.is_empty() {
            vec![StartupMode::Normal]
        } else {
            modes
        };
        *lock(&self.startup) = Startup { modes, next: 0 };
    }

    /// Replace the tool set served by current and future instances.
    pub fn set_tools(&self, tools: Vec<FakeTool>) {
        *lock(&self.tools) = tools;
    }

    /// Make the most recently launched instance exit.
    pub fn crash_latest(&self) {
        if let Some(control) = lock(&self.controls).last() {
            let _ = control.send(Control::Crash);
        }
    }

    /// Send `notifications/tools/list_changed` from the latest instance.
    pub fn notify_tools_changed(&self) {
        if let Some(control) = lock(&self.controls).last() {
            let _ = control.send(Control::ToolsChanged);
        }
    }

    pub fn launches(&self) -> usize {
        self.counters.launches.load(Ordering::SeqCst)
    }

    /// Instances that have not exited yet.
    pub fn running(&self) -> usize {
        self.counters.running.load(Ordering::SeqCst)
    }

    /// `tools/call` requests received across all instances.
    pub fn calls_received(&self) -> usize {
        self.counters.calls.load(Ordering::SeqCst)
    }

    pub fn in_flight(&self) -> usize {
        self.counters.in_flight.load(Ordering::SeqCst)
    }

    /// Highest number of simultaneously unanswered calls observed.
    pub fn peak_in_flight(&self) -> usize {
        self.counters.peak_in_flight.load(Ordering::SeqCst)
    }

    fn next_mode(&self) -> StartupMode {
        let mut startup = lock(&self.startup);
        let index = startup.next.min(startup.modes.len() - 1);
        startup.next += 1;
        startup.modes[index]
    }
}

impl Launcher for FakeLauncher {
    fn launch(&self, descriptor: &ServerDescriptor) -> Result<LaunchedProcess, McpError> {
        self.counters.launches.fetch_add(1, Ordering::SeqCst);
        let mode = self.next_mode();
        if mode == StartupMode::LaunchFails {
            return Err(McpError::LaunchFailed {
                server: descriptor.id.clone(),
                reason: format!("{}: No such file or directory", descriptor.command),
            });
        }

        let (client_stdin, server_stdin) = tokio::io::duplex(PIPE_CAPACITY);
        let (server_stdout, client_stdout) = tokio::io::duplex(PIPE_CAPACITY);
        let (kill_tx, kill_rx) = oneshot::channel();
        let (exit_tx, exit_rx) = oneshot::channel();
        let (control_tx, control_rx) = mpsc::unbounded_channel();
        lock(&self.controls).push(control_tx);

        self.counters.running.fetch_add(1, Ordering::SeqCst);
        let instance = Instance {
            mode,
            tools: Arc::clone(&self.tools),
            page_size: self.page_size,
            counters: Arc::clone(&self.counters),
        };
        tokio::spawn(async move {
            let report = instance.run(server_stdin, server_stdout, kill_rx, control_rx).await;
            instance.counters.running.fetch_sub(1, Ordering::SeqCst);
            let _ = exit_tx.send(report);
        });

        Ok(LaunchedProcess {
            stdin: Box::new(client_stdin),
            stdout: Box::new(client_stdout),
            stderr: None,
            handle: ProcessHandle::new(kill_tx, exit_rx),
        })
    }
}

// ─── Fake Instance ───────────────────────────────────────────────────────────

struct Instance {
    mode: StartupMode,
    tools: Arc<Mutex<Vec<FakeTool>>>,
    page_size: Option<usize>,
    counters: Arc<Counters>,
}

impl Instance {
    async fn run(
        &self,
        stdin: DuplexStream,
        stdout: DuplexStream,
        mut kill_rx: oneshot::Receiver<Duration>,
        mut control_rx: mpsc::UnboundedReceiver<Control>,
    ) -> ExitReport {
        if self.mode == StartupMode::ExitImmediately {
            return ExitReport::new(Some(1), "exited during startup");
        }

        let (out_tx, out_rx) = mpsc::unbounded_channel::<Value>();
        let writer = tokio::spawn(write_lines(stdout, out_rx));
        let mut replies = JoinSet::new();
        let mut lines = BufReader::new(stdin).lines();

        let report = loop {
            tokio::select! {
                line = lines.next_line() => match line {
                    Ok(Some(line)) => {
                        if let Some(report) = self.handle_line(&line, &out_tx, &mut replies) {
                            break report;
                        }
                    }
                    _ => break ExitReport::new(Some(0), "stdin closed"),
                },
                _ = &mut kill_rx => break ExitReport::new(None, "terminated"),
                Some(control) = control_rx.recv() => match control {
                    Control::Crash => break ExitReport::new(Some(1), "crashed"),
                    Control::ToolsChanged => {
                        let _ = out_tx.send(json!({
                            "jsonrpc": JSONRPC_VERSION,
                            "method": methods::TOOLS_LIST_CHANGED,
                        }));
                    }
                },
            }
        };

        replies.abort_all();
        drop(replies);
        drop(out_tx);
        let _ = writer.await;
        report
    }

    /// Answer one request. Returns an exit report if the fake should stop.
    fn handle_line(
        &self,
        line: &str,
        out: &mpsc::UnboundedSender<Value>,
        replies: &mut JoinSet<()>,
    ) -> Option<ExitReport> {
        let Ok(message) = serde_json::from_str::<Value>(line) else {
            return None;
        };
        let method = message.get("method").and_then(Value::as_str).unwrap_or_default();
        let Some(id) = message.get("id").cloned() else {
            return None;
        };
        let params = message.get("params").cloned().unwrap_or(Value::Null);

        if self.mode == StartupMode::Silent {
            return None;
        }

        let reply = |result: Value| json!({ "jsonrpc": JSONRPC_VERSION, "id": id, "result": result });
        let error = |code: i64, message: &str| {
            json!({ "jsonrpc": JSONRPC_VERSION, "id": id, "error": { "code": code, "message": message } })
        };

        match method {
            methods::INITIALIZE if self.mode == StartupMode::RejectInitialize => {
                let _ = out.send(error(error_codes::INTERNAL_ERROR, "initialize rejected"));
            }
            methods::INITIALIZE => {
                let _ = out.send(reply(json!({
                    "protocolVersion": PROTOCOL_VERSION,
                    "capabilities": { "tools": { "listChanged": true } },
                    "serverInfo": { "name": "fake-server", "version": "0.0.0" },
                })));
            }
            methods::TOOLS_LIST => {
                let _ = out.send(reply(self.list_page(&params)));
            }
            methods::PING => {
                let _ = out.send(reply(json!({})));
            }
            methods::TOOLS_CALL => {
                let name = params.get("name").and_then(Value::as_str).unwrap_or_default();
                let arguments = params.get("arguments").cloned().unwrap_or_else(|| json!({}));
                let tool = lock(&self.tools).iter().find(|t| t.name == name).cloned();
                let Some(tool) = tool else {
                    let _ = out.send(error(error_codes::INVALID_PARAMS, &format!("unknown tool: {name}")));
                    return None;
                };

                self.counters.call_started();
                let echo = reply(json!({
                    "content": [{ "type": "text", "text": arguments.to_string() }],
                    "structuredContent": arguments,
                }));

                match tool.behavior {
                    ToolBehavior::Echo => {
                        self.counters.call_finished();
                        let _ = out.send(echo);
                    }
                    ToolBehavior::Delay(delay) => {
                        let out = out.clone();
                        let counters = Arc::clone(&self.counters);
                        replies.spawn(async move {
                            tokio::time::sleep(delay).await;
                            counters.call_finished();
                            let _ = out.send(echo);
                        });
                    }
                    ToolBehavior::NeverReply => {}
                    ToolBehavior::Error { code, message } => {
                        self.counters.call_finished();
                        let _ = out.send(error(code, &message));
                    }
                    ToolBehavior::ReportError(text) => {
                        self.counters.call_finished();
                        let _ = out.send(reply(json!({
                            "content": [{ "type": "text", "text": text }],
                            "isError": true,
                        })));
                    }
                    ToolBehavior::Crash => {
                        self.counters.call_finished();
                        return Some(ExitReport::new(Some(1), "crashed while handling a call"));
                    }
                }
            }
            _ => {
                let _ = out.send(error(error_codes::METHOD_NOT_FOUND, "method not found"));
            }
        }
        None
    }

    fn list_page(&self, params: &Value) -> Value {
        let tools: Vec<Value> = lock(&self.tools).iter().map(FakeTool::wire).collect();
        let Some(size) = self.page_size else {
            return json!({ "tools": tools });
        };

        let offset = params
            .get("cursor")
            .and_then(Value::as_str)
            .and_then(|c| c.parse::<usize>().ok())
            .unwrap_or(0)
            .min(tools.len());
        let end = (offset + size).min(tools.len());
        let mut page = json!({ "tools": tools[offset..end].to_vec() });
        if end < tools.len() {
            page["nextCursor"] = json!(end.to_string());
        }
        page
    }
}

async fn write_lines(mut stdout: DuplexStream, mut rx: mpsc::UnboundedReceiver<Value>) {
    while let Some(message) = rx.recv().await {
        let mut line = message.to_string();
        line.push('\n');
        if stdout.write_all(line.as_bytes()).await.is_err() {
            break;
        }
    }
    let _ = stdout.shutdown().await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mcp_client::codec::{self, Incoming};
    use tokio::io::AsyncReadExt;

    async fn read_message(stdout: &mut Box<dyn tokio::io::AsyncRead + Send + Unpin>) -> Incoming {
        let mut buf = Vec::new();
        let mut byte = [0u8; 1];
        loop {
            stdout.read_exact(&mut byte).await.unwrap();
            if byte[0] == b'\n' {
                break;
            }
            buf.push(byte[0]);
        }
        codec::decode_line(&buf).unwrap()
    }

    #[tokio::test]
    async fn test_fake_answers_initialize_and_pages() {
        let launcher = FakeLauncher::new(vec![
            FakeTool::new("a", ToolBehavior::Echo),
            FakeTool::new("b", ToolBehavior::Echo),
            FakeTool::new("c", ToolBehavior::Echo),
        ])
        .with_page_size(2);
        let mut process = launcher
            .launch(&ServerDescriptor::new("fake", "fake-server"))
            .unwrap();

        process
            .stdin
            .write_all(b"{\"jsonrpc\":\"2.0\",\"id\":1,\"method\":\"tools/list\"}\n")
            .await
            .unwrap();
        match read_message(&mut process.stdout).await {
            Incoming::Response(response) => {
                let result = response.result.unwrap();
                assert_eq!(result["tools"].as_array().unwrap().len(), 2);
                assert_eq!(result["nextCursor"], "2");
            }
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(launcher.launches(), 1);
        assert_eq!(launcher.running(), 1);
    }

    #[tokio::test]
    async fn test_fake_exits_on_stdin_close() {
        let launcher = FakeLauncher::new(vec![]);
        let LaunchedProcess { stdin, mut handle, .. } = launcher
            .launch(&ServerDescriptor::new("fake", "fake-server"))
            .unwrap();
        let exit = handle.take_exit().unwrap();
        drop(stdin);
        let report = exit.await.unwrap();
        assert_eq!(report.code, Some(0));
        assert_eq!(launcher.running(), 0);
    }

    #[tokio::test]
    async fn test_launch_failure_mode() {
        let launcher = FakeLauncher::new(vec![]).with_startup(vec![StartupMode::LaunchFails]);
        let result = launcher.launch(&ServerDescriptor::new("fake", "fake-server"));
        assert!(matches!(result, Err(McpError::LaunchFailed { .. })));
        assert_eq!(launcher.launches(), 1);
    }
}
