//! JSON-RPC over stdio transport.
//!
//! A `ProcessChannel` owns one server's input/output streams:
//! - outgoing lines are queued to a writer task that owns stdin, so a
//!   server that stops reading never blocks a caller or `close`
//! - a background read pump splits stdout into lines, decodes each one and
//!   resolves the matching `PendingCall` by correlation id
//! - unsolicited notifications and the end of the stream are reported on an
//!   event channel to the owning connection
//!
//! Responses are matched strictly by id, so concurrent calls may be answered
//! in any order.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use serde_json::Value;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use super::codec::{self, Incoming, LineReader, ReadLine, MAX_LINE_BYTES};
use super::errors::McpError;
use super::types::{error_codes, methods, JsonRpcNotification, JsonRpcRequest, JsonRpcResponse};

pub type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;
pub type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

type LineSender = mpsc::UnboundedSender<Vec<u8>>;

/// Something the read pump observed that the connection must react to.
#[derive(Debug, Clone)]
pub enum ChannelEvent {
    Notification { method: String, params: Option<Value> },
    /// The stream ended or became unreadable; no further replies will arrive.
    Closed { reason: String },
}

// ─── Pending Calls ───────────────────────────────────────────────────────────

struct PendingCall {
    method: String,
    issued_at: Instant,
    reply: oneshot::Sender<JsonRpcResponse>,
}

#[derive(Default)]
struct PendingTable {
    calls: HashMap<u64, PendingCall>,
    /// Set once the channel is closed; new requests fail immediately.
    closed: Option<String>,
}

impl PendingTable {
    /// Close the table. Dropping the reply senders wakes every waiter.
    fn close(&mut self, reason: &str) -> usize {
        if self.closed.is_none() {
            self.closed = Some(reason.to_string());
        }
        let dropped = self.calls.len();
        self.calls.clear();
        dropped
    }
}

fn lock(table: &Mutex<PendingTable>) -> MutexGuard<'_, PendingTable> {
    table.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Removes a pending entry when the waiting request ends, whether it got a
/// reply, timed out, failed to send or was dropped by its caller.
struct PendingGuard<'a> {
    table: &'a Mutex<PendingTable>,
    id: u64,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        lock(self.table).calls.remove(&self.id);
    }
}

// ─── Channel ─────────────────────────────────────────────────────────────────

/// Bi-directional JSON-RPC channel over a server process's stdio.
pub struct ProcessChannel {
    server_id: String,
    outgoing: Mutex<Option<LineSender>>,
    pending: Arc<Mutex<PendingTable>>,
    next_id: AtomicU64,
    pump: JoinHandle<()>,
}

impl ProcessChannel {
    /// Wrap a process's stdout/stdin and start the read pump and writer.
    ///
    /// Must be called from within a tokio runtime.
    pub fn start(
        server_id: &str,
        reader: BoxedReader,
        writer: BoxedWriter,
        events: mpsc::UnboundedSender<ChannelEvent>,
    ) -> Self {
        let pending = Arc::new(Mutex::new(PendingTable::default()));
        let (line_tx, line_rx) = mpsc::unbounded_channel();

        tokio::spawn(write_pump(
            server_id.to_string(),
            writer,
            line_rx,
            Arc::clone(&pending),
        ));
        let pump = tokio::spawn(read_pump(
            server_id.to_string(),
            reader,
            Arc::clone(&pending),
            line_tx.clone(),
            events,
        ));

        Self {
            server_id: server_id.to_string(),
            outgoing: Mutex::new(Some(line_tx)),
            pending,
            next_id: AtomicU64::new(1),
            pump,
        }
    }

    pub fn server_id(&self) -> &str {
        &self.server_id
    }

    /// Send a request and wait for the matching response, up to `timeout`.
    ///
    /// The deadline covers queueing, writing and the reply. On timeout the
    /// pending entry is dropped, so a late reply is discarded as unmatched.
    /// The remote work is not cancelled.
    pub async fn request(
        &self,
        method: &str,
        params: Option<Value>,
        timeout: Duration,
    ) -> Result<JsonRpcResponse, McpError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let line = codec::encode_line(&JsonRpcRequest::new(id, method, params))?;
        let (tx, rx) = oneshot::channel();

        {
            let mut table = lock(&self.pending);
            if let Some(reason) = &table.closed {
                return Err(self.transport_error(reason.clone()));
            }
            let previous = table.calls.insert(
                id,
                PendingCall {
                    method: method.to_string(),
                    issued_at: Instant::now(),
                    reply: tx,
                },
            );
            debug_assert!(previous.is_none(), "correlation id {id} reused while pending");
        }
        let _pending = PendingGuard {
            table: &self.pending,
            id,
        };

        self.send_line(line)?;

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(response)) => Ok(response),
            Ok(Err(_)) => {
                let reason = lock(&self.pending)
                    .closed
                    .clone()
                    .unwrap_or_else(|| "channel closed".to_string());
                Err(self.transport_error(reason))
            }
            Err(_) => {
                tracing::warn!(
                    server = %self.server_id,
                    id,
                    method,
                    timeout_ms = timeout.as_millis() as u64,
                    "request timed out; a late reply will be discarded"
                );
                Err(McpError::Timeout {
                    server: self.server_id.clone(),
                    method: method.to_string(),
                    timeout_ms: timeout.as_millis() as u64,
                })
            }
        }
    }

    /// Queue a notification (no response expected).
    pub fn notify(&self, method: &str, params: Option<Value>) -> Result<(), McpError> {
        let line = codec::encode_line(&JsonRpcNotification::new(method, params))?;
        self.send_line(line)
    }

    /// Number of requests still awaiting a reply.
    pub fn pending_count(&self) -> usize {
        lock(&self.pending).calls.len()
    }

    pub fn is_closed(&self) -> bool {
        lock(&self.pending).closed.is_some()
    }

    /// Fail every pending call and stop the pump. The writer closes the
    /// process's stdin once queued lines are flushed; it never blocks this
    /// call.
    pub fn close(&self, reason: &str) {
        let dropped = lock(&self.pending).close(reason);
        if dropped > 0 {
            tracing::debug!(server = %self.server_id, dropped, reason, "failed pending calls on close");
        }
        self.outgoing
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        self.pump.abort();
    }

    fn send_line(&self, line: Vec<u8>) -> Result<(), McpError> {
        let outgoing = self.outgoing.lock().unwrap_or_else(PoisonError::into_inner);
        match outgoing.as_ref() {
            Some(tx) => tx
                .send(line)
                .map_err(|_| self.transport_error("stdin writer stopped".to_string())),
            None => {
                let reason = lock(&self.pending)
                    .closed
                    .clone()
                    .unwrap_or_else(|| "channel closed".to_string());
                Err(self.transport_error(reason))
            }
        }
    }

    fn transport_error(&self, reason: String) -> McpError {
        McpError::Transport {
            server: self.server_id.clone(),
            reason,
        }
    }
}

impl Drop for ProcessChannel {
    fn drop(&mut self) {
        self.pump.abort();
    }
}

// ─── Write Pump ──────────────────────────────────────────────────────────────

/// Owns stdin. Runs until every sender is gone, then shuts stdin down; a
/// write failure fails all pending calls.
async fn write_pump(
    server_id: String,
    mut writer: BoxedWriter,
    mut lines: mpsc::UnboundedReceiver<Vec<u8>>,
    pending: Arc<Mutex<PendingTable>>,
) {
    while let Some(line) = lines.recv().await {
        let written = match writer.write_all(&line).await {
            Ok(()) => writer.flush().await,
            Err(e) => Err(e),
        };
        if let Err(e) = written {
            let reason = format!("failed to write to stdin: {e}");
            let dropped = lock(&pending).close(&reason);
            tracing::warn!(server = %server_id, dropped, %reason, "stdin writer stopped");
            return;
        }
    }
    let _ = writer.shutdown().await;
    tracing::debug!(server = %server_id, "stdin closed");
}

// ─── Read Pump ───────────────────────────────────────────────────────────────

async fn read_pump(
    server_id: String,
    reader: BoxedReader,
    pending: Arc<Mutex<PendingTable>>,
    outgoing: LineSender,
    events: mpsc::UnboundedSender<ChannelEvent>,
) {
    let mut reader = LineReader::new(reader);

    let reason = loop {
        match reader.next_line().await {
            Ok(ReadLine::Line(line)) => {
                dispatch_line(&server_id, &line, &pending, &outgoing, &events);
            }
            Ok(ReadLine::Eof { discarded }) => {
                if discarded > 0 {
                    tracing::warn!(
                        server = %server_id,
                        bytes = discarded,
                        "discarding unterminated line at end of stream"
                    );
                }
                break "server stdout closed (process may have exited)".to_string();
            }
            Ok(ReadLine::TooLong) => {
                break format!("line exceeded {MAX_LINE_BYTES} bytes without a newline")
            }
            Err(e) => break format!("failed to read from stdout: {e}"),
        }
    };

    let dropped = lock(&pending).close(&reason);
    tracing::info!(server = %server_id, dropped, %reason, "read pump stopped");
    let _ = events.send(ChannelEvent::Closed { reason });
}

fn dispatch_line(
    server_id: &str,
    line: &[u8],
    pending: &Mutex<PendingTable>,
    outgoing: &LineSender,
    events: &mpsc::UnboundedSender<ChannelEvent>,
) {
    let incoming = match codec::decode_line(line) {
        Ok(incoming) => incoming,
        Err(e) => {
            tracing::warn!(
                server = %server_id,
                error = %e,
                line = %String::from_utf8_lossy(&line[..line.len().min(200)]),
                "discarding undecodable line"
            );
            return;
        }
    };

    match incoming {
        Incoming::Response(response) => {
            let call = response
                .correlation_id()
                .and_then(|id| lock(pending).calls.remove(&id));
            match call {
                Some(call) => {
                    tracing::trace!(
                        server = %server_id,
                        method = %call.method,
                        elapsed_ms = call.issued_at.elapsed().as_millis() as u64,
                        "response matched"
                    );
                    let _ = call.reply.send(response);
                }
                None => {
                    tracing::debug!(
                        server = %server_id,
                        id = %response.id,
                        "discarding response with no pending call"
                    );
                }
            }
        }
        Incoming::Notification { method, params } => {
            let _ = events.send(ChannelEvent::Notification { method, params });
        }
        Incoming::Request { id, method, .. } => {
            let reply = if method == methods::PING {
                JsonRpcResponse::success(id, serde_json::json!({}))
            } else {
                tracing::debug!(server = %server_id, %method, "rejecting server-initiated request");
                JsonRpcResponse::failure(id, error_codes::METHOD_NOT_FOUND, "method not found")
            };
            let sent = codec::encode_line(&reply)
                .map_err(|e| e.to_string())
                .and_then(|line| outgoing.send(line).map_err(|_| "stdin writer stopped".to_string()));
            if let Err(reason) = sent {
                tracing::warn!(server = %server_id, %reason, "failed to answer server request");
            }
        }
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncBufReadExt, BufReader, DuplexStream, ReadHalf, WriteHalf};

    struct Peer {
        lines: tokio::io::Lines<BufReader<ReadHalf<DuplexStream>>>,
        out: WriteHalf<DuplexStream>,
    }

    impl Peer {
        async fn next_message(&mut self) -> Value {
            let line = self.lines.next_line().await.unwrap().unwrap();
            serde_json::from_str(&line).unwrap()
        }

        async fn send_raw(&mut self, line: &str) {
            self.out.write_all(line.as_bytes()).await.unwrap();
            self.out.write_all(b"\n").await.unwrap();
            self.out.flush().await.unwrap();
        }

        async fn reply(&mut self, id: &Value, result: Value) {
            let msg = serde_json::json!({"jsonrpc": "2.0", "id": id, "result": result});
            self.send_raw(&msg.to_string()).await;
        }
    }

    fn channel_pair() -> (
        Arc<ProcessChannel>,
        Peer,
        mpsc::UnboundedReceiver<ChannelEvent>,
    ) {
        channel_pair_with_capacity(64 * 1024)
    }

    fn channel_pair_with_capacity(
        capacity: usize,
    ) -> (
        Arc<ProcessChannel>,
        Peer,
        mpsc::UnboundedReceiver<ChannelEvent>,
    ) {
        let (client, server) = tokio::io::duplex(capacity);
        let (client_read, client_write) = tokio::io::split(client);
        let (server_read, server_write) = tokio::io::split(server);
        let (tx, rx) = mpsc::unbounded_channel();
        let channel = ProcessChannel::start(
            "test",
            Box::new(client_read),
            Box::new(client_write),
            tx,
        );
        let peer = Peer {
            lines: BufReader::new(server_read).lines(),
            out: server_write,
        };
        (Arc::new(channel), peer, rx)
    }

    const LONG: Duration = Duration::from_secs(5);

    #[tokio::test]
    async fn test_request_round_trip() {
        let (channel, mut peer, _events) = channel_pair();

        let ch = Arc::clone(&channel);
        let call = tokio::spawn(async move { ch.request("tools/list", None, LONG).await });

        let msg = peer.next_message().await;
        assert_eq!(msg["method"], "tools/list");
        assert_eq!(msg["jsonrpc"], "2.0");
        peer.reply(&msg["id"], serde_json::json!({"tools": []})).await;

        let response = call.await.unwrap().unwrap();
        assert!(response.result.is_some());
        assert_eq!(channel.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_out_of_order_replies_are_matched_by_id() {
        let (channel, mut peer, _events) = channel_pair();

        let ch1 = Arc::clone(&channel);
        let first = tokio::spawn(async move {
            ch1.request("tools/call", Some(serde_json::json!({"n": 1})), LONG).await
        });
        let msg1 = peer.next_message().await;

        let ch2 = Arc::clone(&channel);
        let second = tokio::spawn(async move {
            ch2.request("tools/call", Some(serde_json::json!({"n": 2})), LONG).await
        });
        let msg2 = peer.next_message().await;
        assert_eq!(channel.pending_count(), 2);

        peer.reply(&msg2["id"], serde_json::json!({"answer": 2})).await;
        peer.reply(&msg1["id"], serde_json::json!({"answer": 1})).await;

        let r1 = first.await.unwrap().unwrap();
        let r2 = second.await.unwrap().unwrap();
        assert_eq!(r1.result.unwrap()["answer"], 1);
        assert_eq!(r2.result.unwrap()["answer"], 2);
    }

    #[tokio::test]
    async fn test_timeout_discards_late_reply() {
        let (channel, mut peer, _events) = channel_pair();

        let ch = Arc::clone(&channel);
        let started = Instant::now();
        let call = tokio::spawn(async move {
            ch.request("tools/call", None, Duration::from_millis(80)).await
        });
        let msg = peer.next_message().await;

        let err = call.await.unwrap().unwrap_err();
        assert!(started.elapsed() >= Duration::from_millis(80));
        assert!(matches!(err, McpError::Timeout { timeout_ms: 80, .. }));
        assert_eq!(channel.pending_count(), 0);

        // The late reply is unmatched and must not disturb the next call.
        peer.reply(&msg["id"], serde_json::json!({"late": true})).await;

        let ch = Arc::clone(&channel);
        let call = tokio::spawn(async move { ch.request("ping", None, LONG).await });
        let msg = peer.next_message().await;
        peer.reply(&msg["id"], serde_json::json!({"fresh": true})).await;
        let response = call.await.unwrap().unwrap();
        assert_eq!(response.result.unwrap()["fresh"], true);
    }

    #[tokio::test]
    async fn test_garbage_line_is_skipped() {
        let (channel, mut peer, _events) = channel_pair();

        let ch = Arc::clone(&channel);
        let call = tokio::spawn(async move { ch.request("tools/list", None, LONG).await });
        let msg = peer.next_message().await;

        peer.send_raw("INFO: server warming up").await;
        peer.send_raw("{\"jsonrpc\":\"2.0\",").await;
        peer.reply(&msg["id"], serde_json::json!({"ok": true})).await;

        let response = call.await.unwrap().unwrap();
        assert_eq!(response.result.unwrap()["ok"], true);
    }

    #[tokio::test]
    async fn test_stream_close_fails_pending_calls() {
        let (channel, mut peer, mut events) = channel_pair();

        let ch = Arc::clone(&channel);
        let call = tokio::spawn(async move { ch.request("tools/call", None, LONG).await });
        let _ = peer.next_message().await;
        drop(peer);

        let err = call.await.unwrap().unwrap_err();
        assert!(matches!(err, McpError::Transport { .. }));

        match events.recv().await.unwrap() {
            ChannelEvent::Closed { reason } => assert!(reason.contains("closed")),
            other => panic!("expected Closed, got {other:?}"),
        }
        assert!(channel.is_closed());

        let err = channel.request("ping", None, LONG).await.unwrap_err();
        assert!(matches!(err, McpError::Transport { .. }));
    }

    #[tokio::test]
    async fn test_notifications_are_forwarded() {
        let (_channel, mut peer, mut events) = channel_pair();

        peer.send_raw(r#"{"jsonrpc":"2.0","method":"notifications/tools/list_changed"}"#)
            .await;

        match events.recv().await.unwrap() {
            ChannelEvent::Notification { method, .. } => {
                assert_eq!(method, methods::TOOLS_LIST_CHANGED);
            }
            other => panic!("expected notification, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_server_ping_is_answered() {
        let (_channel, mut peer, _events) = channel_pair();

        peer.send_raw(r#"{"jsonrpc":"2.0","id":"srv-1","method":"ping"}"#).await;
        let reply = peer.next_message().await;
        assert_eq!(reply["id"], "srv-1");
        assert!(reply["result"].is_object());

        peer.send_raw(r#"{"jsonrpc":"2.0","id":7,"method":"sampling/createMessage"}"#)
            .await;
        let reply = peer.next_message().await;
        assert_eq!(reply["error"]["code"], error_codes::METHOD_NOT_FOUND);
    }

    #[tokio::test]
    async fn test_notify_writes_without_id() {
        let (channel, mut peer, _events) = channel_pair();
        channel.notify(methods::INITIALIZED, None).unwrap();
        let msg = peer.next_message().await;
        assert_eq!(msg["method"], methods::INITIALIZED);
        assert!(msg.get("id").is_none());
    }

    #[tokio::test]
    async fn test_close_rejects_further_requests() {
        let (channel, _peer, _events) = channel_pair();
        channel.close("disconnect requested");
        let err = channel.request("ping", None, LONG).await.unwrap_err();
        match err {
            McpError::Transport { reason, .. } => assert_eq!(reason, "disconnect requested"),
            other => panic!("expected transport error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_stalled_stdin_still_times_out() {
        // The peer never reads, so the pipe fills after a few hundred bytes.
        let (channel, _peer, _events) = channel_pair_with_capacity(256);
        let blob = "x".repeat(256 * 1024);

        let started = Instant::now();
        let err = channel
            .request(
                "tools/call",
                Some(serde_json::json!({ "blob": blob })),
                Duration::from_millis(100),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, McpError::Timeout { timeout_ms: 100, .. }));
        assert!(started.elapsed() < Duration::from_secs(2));
        assert_eq!(channel.pending_count(), 0);

        let err = channel
            .request("ping", None, Duration::from_millis(50))
            .await
            .unwrap_err();
        assert!(matches!(err, McpError::Timeout { .. }));

        channel.close("disconnect requested");
        assert!(channel.is_closed());
        let err = channel.request("ping", None, LONG).await.unwrap_err();
        assert!(matches!(err, McpError::Transport { .. }));
    }

    #[tokio::test]
    async fn test_dropped_caller_forgets_pending_call() {
        let (channel, mut peer, _events) = channel_pair();

        let ch = Arc::clone(&channel);
        let call = tokio::spawn(async move { ch.request("tools/call", None, LONG).await });
        let msg = peer.next_message().await;
        assert_eq!(channel.pending_count(), 1);

        call.abort();
        assert!(call.await.unwrap_err().is_cancelled());
        assert_eq!(channel.pending_count(), 0);

        // A reply for the abandoned call is just unmatched.
        peer.reply(&msg["id"], serde_json::json!({"late": true})).await;
        let ch = Arc::clone(&channel);
        let call = tokio::spawn(async move { ch.request("ping", None, LONG).await });
        let msg = peer.next_message().await;
        peer.reply(&msg["id"], serde_json::json!({"fresh": true})).await;
        assert_eq!(call.await.unwrap().unwrap().result.unwrap()["fresh"], true);
    }
}
