//! Line-delimited JSON-RPC codec.
//!
//! One envelope per line in both directions. Outgoing messages are
//! serialized and terminated with `\n`; incoming bytes are buffered until a
//! full line is available and each line is classified independently, so a
//! malformed line never affects its neighbours.

use serde::Serialize;
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, BufReader};

use super::errors::McpError;
use super::types::{JsonRpcResponse, JSONRPC_VERSION};

/// Longest line accepted from a server before the stream is considered
/// unrecoverably out of frame.
pub const MAX_LINE_BYTES: usize = 8 * 1024 * 1024;

// ─── Encoding ────────────────────────────────────────────────────────────────

/// Serialize an envelope as a single newline-terminated line.
pub fn encode_line<T: Serialize>(message: &T) -> Result<Vec<u8>, McpError> {
    let mut bytes = serde_json::to_vec(message).map_err(|e| McpError::ProtocolDecode {
        reason: format!("failed to serialize message: {e}"),
    })?;
    bytes.push(b'\n');
    Ok(bytes)
}

// ─── Decoding ────────────────────────────────────────────────────────────────

/// A classified incoming envelope.
#[derive(Debug, Clone)]
pub enum Incoming {
    /// Reply to one of our requests.
    Response(JsonRpcResponse),
    /// Server-initiated message with no reply expected.
    Notification { method: String, params: Option<Value> },
    /// Server-initiated request; the server expects a reply.
    Request {
        id: Value,
        method: String,
        params: Option<Value>,
    },
}

/// Decode one complete line into an envelope.
pub fn decode_line(line: &[u8]) -> Result<Incoming, McpError> {
    let value: Value = serde_json::from_slice(line).map_err(|e| McpError::ProtocolDecode {
        reason: format!("invalid JSON: {e}"),
    })?;

    let Value::Object(mut obj) = value else {
        return Err(McpError::ProtocolDecode {
            reason: "envelope is not a JSON object".into(),
        });
    };

    match obj.get("jsonrpc").and_then(Value::as_str) {
        Some(JSONRPC_VERSION) => {}
        Some(other) => {
            return Err(McpError::ProtocolDecode {
                reason: format!("unsupported jsonrpc version '{other}'"),
            })
        }
        None => {
            return Err(McpError::ProtocolDecode {
                reason: "missing jsonrpc version tag".into(),
            })
        }
    }

    let id = obj.remove("id").filter(|id| !id.is_null());
    let method = match obj.remove("method") {
        Some(Value::String(m)) => Some(m),
        Some(_) => {
            return Err(McpError::ProtocolDecode {
                reason: "method is not a string".into(),
            })
        }
        None => None,
    };
    let params = obj.remove("params");

    match (method, id) {
        (Some(method), Some(id)) => Ok(Incoming::Request { id, method, params }),
        (Some(method), None) => Ok(Incoming::Notification { method, params }),
        (None, Some(id)) => {
            let has_result = obj.contains_key("result");
            let has_error = obj.contains_key("error");
            if !has_result && !has_error {
                return Err(McpError::ProtocolDecode {
                    reason: "response carries neither result nor error".into(),
                });
            }
            obj.insert("id".into(), id);
            let response: JsonRpcResponse = serde_json::from_value(Value::Object(obj))
                .map_err(|e| McpError::ProtocolDecode {
                    reason: format!("malformed response: {e}"),
                })?;
            Ok(Incoming::Response(response))
        }
        (None, None) => Err(McpError::ProtocolDecode {
            reason: "envelope has neither method nor id".into(),
        }),
    }
}

// ─── Line Framing ────────────────────────────────────────────────────────────

/// One read from a [`LineReader`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReadLine {
    /// A complete line, without its `\n` / `\r\n` terminator.
    Line(Vec<u8>),
    /// End of stream. `discarded` counts the bytes of an unterminated last line.
    Eof { discarded: usize },
    /// A line grew past [`MAX_LINE_BYTES`] without a newline.
    TooLong,
}

/// Splits a byte stream into lines, capped at [`MAX_LINE_BYTES`].
///
/// Blank lines are skipped.
pub struct LineReader<R> {
    inner: BufReader<R>,
    buf: Vec<u8>,
}

impl<R: AsyncRead + Unpin> LineReader<R> {
    pub fn new(reader: R) -> Self {
        Self {
            inner: BufReader::new(reader),
            buf: Vec::new(),
        }
    }

    /// Read the next non-blank line. Not cancel safe.
    pub async fn next_line(&mut self) -> std::io::Result<ReadLine> {
        loop {
            self.buf.clear();
            let limit = MAX_LINE_BYTES as u64 + 1;
            let n = (&mut self.inner)
                .take(limit)
                .read_until(b'\n', &mut self.buf)
                .await?;
            if n == 0 {
                return Ok(ReadLine::Eof { discarded: 0 });
            }

            if self.buf.last() != Some(&b'\n') {
                if self.buf.len() > MAX_LINE_BYTES {
                    self.buf.clear();
                    return Ok(ReadLine::TooLong);
                }
                return Ok(ReadLine::Eof {
                    discarded: self.buf.len(),
                });
            }

            self.buf.pop();
            if self.buf.last() == Some(&b'\r') {
                self.buf.pop();
            }
            if !self.buf.iter().all(u8::is_ascii_whitespace) {
                return Ok(ReadLine::Line(std::mem::take(&mut self.buf)));
            }
        }
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────
