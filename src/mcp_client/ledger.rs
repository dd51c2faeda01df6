//! Stats & history ledger.
//!
//! One shared structure updated by every server's completed executions:
//! per-server counters with a running average latency, plus a bounded
//! history of execution records (oldest evicted first). All updates go
//! through one mutex so `total == success + failure` holds at every
//! observation point.

use std::collections::{HashMap, VecDeque};
use std::fs::File;
use std::io::Write;
use std::path::Path;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use uuid::Uuid;

use super::errors::{ErrorPayload, McpError};
use super::types::{CallerContext, ToolArguments, ToolContent};

// ─── Records ─────────────────────────────────────────────────────────────────

/// Outcome of one execution.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ExecutionOutcome {
    Success {
        content: Vec<ToolContent>,
        #[serde(skip_serializing_if = "Option::is_none")]
        structured_content: Option<Value>,
    },
    Failure {
        error: ErrorPayload,
    },
}

impl ExecutionOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success { .. })
    }
}

/// Append-only record of one execute call.
#[derive(Debug, Clone, Serialize)]
pub struct ExecutionRecord {
    pub execution_id: Uuid,
    pub server_id: String,
    pub tool_name: String,
    pub arguments: ToolArguments,
    pub outcome: ExecutionOutcome,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub elapsed_ms: u64,
    pub context: CallerContext,
}

/// Per-server counters.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ServerStats {
    pub server_id: String,
    pub total_calls: u64,
    pub successful_calls: u64,
    pub failed_calls: u64,
    /// Subset of `failed_calls` that hit their deadline.
    pub timed_out_calls: u64,
    /// Mean latency of completed, non-timeout calls.
    pub average_execution_ms: f64,
    pub latency_samples: u64,
    /// Seconds in the current `connected` period; filled in by the orchestrator.
    pub uptime_secs: Option<u64>,
    pub last_activity: Option<DateTime<Utc>>,
}

impl ServerStats {
    pub fn new(server_id: &str) -> Self {
        Self {
            server_id: server_id.to_string(),
            total_calls: 0,
            successful_calls: 0,
            failed_calls: 0,
            timed_out_calls: 0,
            average_execution_ms: 0.0,
            latency_samples: 0,
            uptime_secs: None,
            last_activity: None,
        }
    }

    fn apply(&mut self, record: &ExecutionRecord, latency: Option<Duration>) {
        self.total_calls += 1;
        match &record.outcome {
            ExecutionOutcome::Success { .. } => self.successful_calls += 1,
            ExecutionOutcome::Failure { error } => {
                self.failed_calls += 1;
                if error.kind == super::errors::ErrorKind::Timeout {
                    self.timed_out_calls += 1;
                }
            }
        }
        if let Some(latency) = latency {
            self.latency_samples += 1;
            let sample = latency.as_secs_f64() * 1000.0;
            self.average_execution_ms +=
                (sample - self.average_execution_ms) / self.latency_samples as f64;
        }
        self.last_activity = Some(record.finished_at);
    }
}

/// Which records `Ledger::history` returns.
#[derive(Debug, Clone, Default)]
pub struct HistoryFilter {
    pub server_id: Option<String>,
    pub limit: Option<usize>,
}

// ─── Ledger ──────────────────────────────────────────────────────────────────

struct LedgerInner {
    stats: HashMap<String, ServerStats>,
    history: VecDeque<ExecutionRecord>,
    log: Option<File>,
}

/// Shared stats counters and bounded execution history.
pub struct Ledger {
    inner: Mutex<LedgerInner>,
    capacity: usize,
}

impl Ledger {
    /// An in-memory ledger keeping at most `capacity` records.
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(LedgerInner {
                stats: HashMap::new(),
                history: VecDeque::with_capacity(capacity.min(1024)),
                log: None,
            }),
            capacity: capacity.max(1),
        }
    }

    /// Like `new`, additionally appending each record as a JSON line to `path`.
    pub fn with_append_log(capacity: usize, path: &Path) -> Result<Self, McpError> {
        let file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .map_err(|e| McpError::Config {
                reason: format!("failed to open history log {}: {e}", path.display()),
            })?;
        let ledger = Self::new(capacity);
        ledger.lock().log = Some(file);
        Ok(ledger)
    }

    fn lock(&self) -> MutexGuard<'_, LedgerInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Start tracking a server (no-op if already tracked).
    pub fn ensure_server(&self, server_id: &str) {
        self.lock()
            .stats
            .entry(server_id.to_string())
            .or_insert_with(|| ServerStats::new(server_id));
    }

    /// Zero a server's counters (full re-registration).
    pub fn reset_server(&self, server_id: &str) {
        self.lock()
            .stats
            .insert(server_id.to_string(), ServerStats::new(server_id));
    }

    /// Append a record and update the owning server's counters atomically.
    ///
    /// `latency` is `Some` only for calls that completed (success or a
    /// tool-reported error); it feeds the running average. Records for
    /// servers that are not tracked only enter the history.
    pub fn record(&self, record: ExecutionRecord, latency: Option<Duration>) {
        let mut inner = self.lock();

        if let Some(stats) = inner.stats.get_mut(&record.server_id) {
            stats.apply(&record, latency);
        }

        if let Some(log) = inner.log.as_mut() {
            if let Err(e) = append_json_line(log, &record) {
                tracing::warn!(error = %e, "failed to append execution record to history log");
            }
        }

        if inner.history.len() == self.capacity {
            inner.history.pop_front();
        }
        inner.history.push_back(record);
    }

    pub fn stats(&self, server_id: &str) -> Option<ServerStats> {
        self.lock().stats.get(server_id).cloned()
    }

    /// Stats of every tracked server, ordered by id.
    pub fn all_stats(&self) -> Vec<ServerStats> {
        let mut all: Vec<ServerStats> = self.lock().stats.values().cloned().collect();
        all.sort_by(|a, b| a.server_id.cmp(&b.server_id));
        all
    }

    /// Retained records, newest first.
    pub fn history(&self, filter: &HistoryFilter) -> Vec<ExecutionRecord> {
        let inner = self.lock();
        let matching = inner.history.iter().rev().filter(|r| {
            filter
                .server_id
                .as_deref()
                .map_or(true, |id| r.server_id == id)
        });
        match filter.limit {
            Some(limit) => matching.take(limit).cloned().collect(),
            None => matching.cloned().collect(),
        }
    }

    pub fn history_len(&self) -> usize {
        self.lock().history.len()
    }
}

fn append_json_line(log: &mut File, record: &ExecutionRecord) -> std::io::Result<()> {
    let mut line = serde_json::to_vec(record).map_err(std::io::Error::other)?;
    line.push(b'\n');
    log.write_all(&line)?;
    log.flush()
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mcp_client::errors::ErrorKind;
    use std::sync::Arc;

    fn record(server: &str, tool: &str, success: bool) -> ExecutionRecord {
        let outcome = if success {
            ExecutionOutcome::Success {
                content: vec![],
                structured_content: None,
            }
        } else {
            ExecutionOutcome::Failure {
                error: McpError::Timeout {
                    server: server.into(),
                    method: "tools/call".into(),
                    timeout_ms: 10,
                }
                .payload(),
            }
        };
        let now = Utc::now();
        ExecutionRecord {
            execution_id: Uuid::new_v4(),
            server_id: server.to_string(),
            tool_name: tool.to_string(),
            arguments: ToolArguments::new(),
            outcome,
            started_at: now,
            finished_at: now,
            elapsed_ms: 0,
            context: CallerContext::default(),
        }
    }

    #[test]
    fn test_counters_and_running_average() {
        let ledger = Ledger::new(10);
        ledger.ensure_server("a");

        ledger.record(record("a", "ping", true), Some(Duration::from_millis(10)));
        ledger.record(record("a", "ping", true), Some(Duration::from_millis(30)));
        ledger.record(record("a", "ping", false), None);

        let stats = ledger.stats("a").unwrap();
        assert_eq!(stats.total_calls, 3);
        assert_eq!(stats.successful_calls, 2);
        assert_eq!(stats.failed_calls, 1);
        assert_eq!(stats.timed_out_calls, 1);
        assert_eq!(stats.latency_samples, 2);
        assert!((stats.average_execution_ms - 20.0).abs() < 1e-9);
        assert!(stats.last_activity.is_some());
    }

    #[test]
    fn test_history_is_bounded_oldest_first_out() {
        let ledger = Ledger::new(3);
        for i in 0..5 {
            ledger.record(record("a", &format!("t{i}"), true), None);
        }
        assert_eq!(ledger.history_len(), 3);
        let names: Vec<String> = ledger
            .history(&HistoryFilter::default())
            .into_iter()
            .map(|r| r.tool_name)
            .collect();
        assert_eq!(names, vec!["t4", "t3", "t2"]);
    }

    #[test]
    fn test_history_filter() {
        let ledger = Ledger::new(10);
        ledger.record(record("a", "one", true), None);
        ledger.record(record("b", "two", true), None);
        ledger.record(record("a", "three", true), None);

        let only_a = ledger.history(&HistoryFilter {
            server_id: Some("a".into()),
            limit: Some(1),
        });
        assert_eq!(only_a.len(), 1);
        assert_eq!(only_a[0].tool_name, "three");
    }

    #[test]
    fn test_untracked_server_only_enters_history() {
        let ledger = Ledger::new(10);
        ledger.record(record("ghost", "x", false), None);
        assert!(ledger.stats("ghost").is_none());
        assert_eq!(ledger.history_len(), 1);
    }

    #[test]
    fn test_reset_server_zeroes_counters() {
        let ledger = Ledger::new(10);
        ledger.ensure_server("a");
        ledger.record(record("a", "ping", true), Some(Duration::from_millis(5)));
        ledger.reset_server("a");
        assert_eq!(ledger.stats("a").unwrap(), ServerStats::new("a"));

        // ensure_server leaves existing counters alone
        ledger.record(record("a", "ping", true), None);
        ledger.ensure_server("a");
        assert_eq!(ledger.stats("a").unwrap().total_calls, 1);
    }

    #[test]
    fn test_invariant_under_concurrent_updates() {
        let ledger = Arc::new(Ledger::new(50));
        ledger.ensure_server("a");

        let handles: Vec<_> = (0..8)
            .map(|n| {
                let ledger = Arc::clone(&ledger);
                std::thread::spawn(move || {
                    for i in 0..100 {
                        ledger.record(record("a", "t", (n + i) % 3 != 0), None);
                        let s = ledger.stats("a").unwrap();
                        assert_eq!(s.total_calls, s.successful_calls + s.failed_calls);
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        let stats = ledger.stats("a").unwrap();
        assert_eq!(stats.total_calls, 800);
        assert_eq!(stats.total_calls, stats.successful_calls + stats.failed_calls);
        assert_eq!(ledger.history_len(), 50);
    }

    #[test]
    fn test_append_log_writes_json_lines() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("history.jsonl");
        let ledger = Ledger::with_append_log(2, &path).unwrap();
        ledger.record(record("a", "one", true), None);
        ledger.record(record("a", "two", false), None);
        ledger.record(record("a", "three", true), None);

        let contents = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<serde_json::Value> = contents
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect();
        // The log keeps everything even though memory holds two.
        assert_eq!(lines.len(), 3);
        assert_eq!(lines[1]["tool_name"], "two");
        assert_eq!(lines[1]["outcome"]["status"], "failure");
        assert_eq!(lines[1]["outcome"]["error"]["kind"], "timeout");
        assert_eq!(ledger.history_len(), 2);
    }

    #[test]
    fn test_outcome_kind() {
        let r = record("a", "t", false);
        match &r.outcome {
            ExecutionOutcome::Failure { error } => assert_eq!(error.kind, ErrorKind::Timeout),
            _ => panic!("expected failure"),
        }
        assert!(!r.outcome.is_success());
    }
}
