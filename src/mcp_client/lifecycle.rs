//! Server process lifecycle management.
//!
//! Handles spawning MCP server child processes, watching them for exit,
//! capturing their stderr for diagnostics, terminating them, and computing
//! the delay between automatic restart attempts.

use std::collections::VecDeque;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tokio::sync::oneshot;

use super::config::ServerDescriptor;
use super::errors::McpError;
use super::transport::{BoxedReader, BoxedWriter};

// ─── Constants ───────────────────────────────────────────────────────────────

/// Number of stderr lines kept for failure diagnostics.
const STDERR_TAIL_LINES: usize = 20;

/// Maximum characters of stderr appended to an error message.
const STDERR_SUFFIX_CHARS: usize = 2000;

// ─── Launcher ────────────────────────────────────────────────────────────────

/// Starts server processes.
///
/// The production implementation is [`StdioLauncher`]; tests plug in
/// in-process fakes that speak the protocol over pipes.
pub trait Launcher: Send + Sync {
    /// Start the process described by `descriptor`.
    ///
    /// Called from within a tokio runtime.
    fn launch(&self, descriptor: &ServerDescriptor) -> Result<LaunchedProcess, McpError>;
}

/// A started process: its stdio streams and a handle to control it.
pub struct LaunchedProcess {
    pub stdin: BoxedWriter,
    pub stdout: BoxedReader,
    pub stderr: Option<BoxedReader>,
    pub handle: ProcessHandle,
}

/// How a process ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExitReport {
    pub code: Option<i32>,
    pub description: String,
}

impl ExitReport {
    pub fn new(code: Option<i32>, description: impl Into<String>) -> Self {
        Self {
            code,
            description: description.into(),
        }
    }
}

/// Control handle for a launched process.
///
/// Termination is requested through `kill_tx` (carrying the grace period
/// before a forced kill); the exit watcher reports on `exit_rx`.
pub struct ProcessHandle {
    kill_tx: Option<oneshot::Sender<Duration>>,
    exit_rx: Option<oneshot::Receiver<ExitReport>>,
}

impl ProcessHandle {
    pub fn new(
        kill_tx: oneshot::Sender<Duration>,
        exit_rx: oneshot::Receiver<ExitReport>,
    ) -> Self {
        Self {
            kill_tx: Some(kill_tx),
            exit_rx: Some(exit_rx),
        }
    }

    /// Take the exit notification. Only the first caller gets it.
    pub fn take_exit(&mut self) -> Option<oneshot::Receiver<ExitReport>> {
        self.exit_rx.take()
    }

    /// Ask the process to stop: wait up to `grace` for it to exit on its
    /// own (stdin is already closed by then), then kill it.
    pub fn terminate(&mut self, grace: Duration) {
        if let Some(tx) = self.kill_tx.take() {
            let _ = tx.send(grace);
        }
    }
}

// ─── Stdio Launcher ──────────────────────────────────────────────────────────

/// Spawns real child processes with piped stdio.
#[derive(Debug, Clone, Default)]
pub struct StdioLauncher {
    /// Working directory for servers without their own `cwd`.
    working_dir: Option<PathBuf>,
}

impl StdioLauncher {
    pub fn new(working_dir: Option<PathBuf>) -> Self {
        Self { working_dir }
    }
}

impl Launcher for StdioLauncher {
    fn launch(&self, descriptor: &ServerDescriptor) -> Result<LaunchedProcess, McpError> {
        let mut cmd = Command::new(&descriptor.command);
        cmd.args(&descriptor.args);

        for (key, value) in &descriptor.env {
            cmd.env(key, value);
        }

        // Per-server cwd overrides the global working_dir
        let effective_dir = descriptor.cwd.as_ref().or(self.working_dir.as_ref());
        if let Some(dir) = effective_dir {
            cmd.current_dir(dir);
        }

        cmd.stdin(Stdio::piped());
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::piped());
        cmd.kill_on_drop(true);

        let mut child = cmd.spawn().map_err(|e| McpError::LaunchFailed {
            server: descriptor.id.clone(),
            reason: format!("{}: {e}", descriptor.command),
        })?;

        let missing = |stream: &str| McpError::LaunchFailed {
            server: descriptor.id.clone(),
            reason: format!("failed to capture {stream}"),
        };
        let stdin = child.stdin.take().ok_or_else(|| missing("stdin"))?;
        let stdout = child.stdout.take().ok_or_else(|| missing("stdout"))?;
        let stderr = child.stderr.take();
        let pid = child.id();

        let (kill_tx, kill_rx) = oneshot::channel::<Duration>();
        let (exit_tx, exit_rx) = oneshot::channel();
        let server = descriptor.id.clone();

        // Exit watcher: owns the child until it exits or is told to stop.
        tokio::spawn(async move {
            let status = tokio::select! {
                status = child.wait() => status,
                grace = kill_rx => {
                    let grace = grace.unwrap_or_default();
                    match tokio::time::timeout(grace, child.wait()).await {
                        Ok(status) => status,
                        Err(_) => {
                            tracing::warn!(server = %server, "graceful shutdown timed out, killing");
                            let _ = child.kill().await;
                            child.wait().await
                        }
                    }
                }
            };

            let report = match status {
                Ok(status) => ExitReport::new(status.code(), format!("process exited: {status}")),
                Err(e) => ExitReport::new(None, format!("failed to wait for process: {e}")),
            };
            tracing::debug!(server = %server, exit = %report.description, "process exit observed");
            let _ = exit_tx.send(report);
        });

        tracing::info!(server = %descriptor.id, pid, command = %descriptor.command, "spawned server process");

        Ok(LaunchedProcess {
            stdin: Box::new(stdin),
            stdout: Box::new(stdout),
            stderr: stderr.map(|s| Box::new(s) as BoxedReader),
            handle: ProcessHandle::new(kill_tx, exit_rx),
        })
    }
}

// ─── Stderr Capture ──────────────────────────────────────────────────────────

/// Bounded tail of a process's stderr output.
#[derive(Debug, Clone, Default)]
pub struct StderrTail {
    lines: Arc<Mutex<VecDeque<String>>>,
}

impl StderrTail {
    pub fn new() -> Self {
        Self::default()
    }

    fn push(&self, line: String) {
        let mut lines = self.lines.lock().unwrap_or_else(PoisonError::into_inner);
        if lines.len() == STDERR_TAIL_LINES {
            lines.pop_front();
        }
        lines.push_back(line);
    }

    /// The captured lines joined with newlines.
    pub fn contents(&self) -> String {
        let lines = self.lines.lock().unwrap_or_else(PoisonError::into_inner);
        lines.iter().cloned().collect::<Vec<_>>().join("\n")
    }

    /// Suffix for error messages (empty string if nothing was captured).
    pub fn error_suffix(&self) -> String {
        format_stderr_suffix(&self.contents())
    }
}

/// Drain a process's stderr, logging each line and keeping a short tail.
///
/// Never parsed as protocol traffic.
pub fn spawn_stderr_drain<R>(server_id: &str, stderr: R, tail: StderrTail)
where
    R: AsyncRead + Send + Unpin + 'static,
{
    let server = server_id.to_string();
    tokio::spawn(async move {
        let mut lines = BufReader::new(stderr).lines();
        loop {
            match lines.next_line().await {
                Ok(Some(line)) => {
                    tracing::debug!(server = %server, stderr = %line, "server stderr");
                    tail.push(line);
                }
                Ok(None) => break,
                Err(e) => {
                    tracing::debug!(server = %server, error = %e, "stderr read failed");
                    break;
                }
            }
        }
    });
}

/// Format a stderr suffix for error messages (empty string if no stderr).
fn format_stderr_suffix(stderr: &str) -> String {
    let trimmed = stderr.trim();
    if trimmed.is_empty() {
        return String::new();
    }
    if trimmed.chars().count() > STDERR_SUFFIX_CHARS {
        let cut: String = trimmed.chars().take(STDERR_SUFFIX_CHARS).collect();
        format!(" | stderr: {cut}...(truncated)")
    } else {
        format!(" | stderr: {trimmed}")
    }
}

// ─── Backoff ─────────────────────────────────────────────────────────────────

/// Delay before automatic reconnect attempt number `attempt` (1-based).
///
/// Exponential: `base * 2^(attempt-1)`, capped at `max`. Non-decreasing in
/// `attempt`.
pub fn reconnect_delay(attempt: u32, base: Duration, max: Duration) -> Duration {
    if attempt == 0 {
        return Duration::ZERO;
    }
    let exp = (attempt - 1).min(30);
    base.saturating_mul(1u32 << exp).min(max)
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reconnect_delay_doubles_and_caps() {
        let base = Duration::from_secs(1);
        let max = Duration::from_secs(5);
        assert_eq!(reconnect_delay(0, base, max), Duration::ZERO);
        assert_eq!(reconnect_delay(1, base, max), Duration::from_secs(1));
        assert_eq!(reconnect_delay(2, base, max), Duration::from_secs(2));
        assert_eq!(reconnect_delay(3, base, max), Duration::from_secs(4));
        assert_eq!(reconnect_delay(4, base, max), Duration::from_secs(5));
        assert_eq!(reconnect_delay(40, base, max), Duration::from_secs(5));
    }

    #[test]
    fn test_reconnect_delay_is_non_decreasing() {
        let base = Duration::from_millis(250);
        let max = Duration::from_secs(30);
        let delays: Vec<_> = (1..20).map(|n| reconnect_delay(n, base, max)).collect();
        assert!(delays.windows(2).all(|w| w[0] <= w[1]));
    }

    #[test]
    fn test_stderr_suffix() {
        assert_eq!(format_stderr_suffix("   "), "");
        assert_eq!(format_stderr_suffix("boom\n"), " | stderr: boom");
        let long = "x".repeat(STDERR_SUFFIX_CHARS + 10);
        assert!(format_stderr_suffix(&long).ends_with("...(truncated)"));
    }

    #[test]
    fn test_stderr_tail_keeps_last_lines() {
        let tail = StderrTail::new();
        for i in 0..(STDERR_TAIL_LINES + 5) {
            tail.push(format!("line {i}"));
        }
        let contents = tail.contents();
        assert!(!contents.contains("line 4\n"));
        assert!(contents.starts_with("line 5"));
        assert!(contents.ends_with(&format!("line {}", STDERR_TAIL_LINES + 4)));
    }

    #[tokio::test]
    async fn test_stderr_drain_collects_lines() {
        let tail = StderrTail::new();
        let input: &[u8] = b"warming up\nready\n";
        spawn_stderr_drain("t", input, tail.clone());
        for _ in 0..50 {
            if tail.contents().contains("ready") {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(tail.contents(), "warming up\nready");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_stdio_launcher_reports_missing_binary() {
        let descriptor = ServerDescriptor::new("ghost", "/nonexistent/toolhub-test-binary");
        let err = StdioLauncher::default().launch(&descriptor).err().unwrap();
        assert!(matches!(err, McpError::LaunchFailed { ref server, .. } if server == "ghost"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_stdio_launcher_reports_exit() {
        let mut descriptor = ServerDescriptor::new("short", "sh");
        descriptor.args = vec!["-c".into(), "echo oops >&2; exit 3".into()];
        let mut process = StdioLauncher::default().launch(&descriptor).unwrap();

        let tail = StderrTail::new();
        if let Some(stderr) = process.stderr.take() {
            spawn_stderr_drain("short", stderr, tail.clone());
        }
        let report = process.handle.take_exit().unwrap().await.unwrap();
        assert_eq!(report.code, Some(3));

        for _ in 0..50 {
            if !tail.contents().is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(tail.contents(), "oops");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_stdio_launcher_terminate_kills_after_grace() {
        let mut descriptor = ServerDescriptor::new("sleeper", "sleep");
        descriptor.args = vec!["30".into()];
        let mut process = StdioLauncher::default().launch(&descriptor).unwrap();
        let exit = process.handle.take_exit().unwrap();

        process.handle.terminate(Duration::from_millis(50));
        let report = tokio::time::timeout(Duration::from_secs(5), exit)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(report.code, None);
    }
}
