//! MCP Client error types.
//!
//! One enum covers every failure the orchestration core can surface. The
//! façade never sees a raw `McpError`; it receives the serializable
//! [`ErrorPayload`] built by [`McpError::payload`].

use serde::Serialize;
use thiserror::Error;

/// Errors that can occur during tool-server orchestration.
#[derive(Debug, Clone, Error)]
pub enum McpError {
    /// The server process could not be started.
    #[error("failed to launch server '{server}': {reason}")]
    LaunchFailed { server: String, reason: String },

    /// The process started but the initialize / tools/list exchange failed.
    #[error("server '{server}' handshake failed: {reason}")]
    HandshakeFailed { server: String, reason: String },

    /// The handshake did not complete within the connect timeout.
    #[error("server '{server}' handshake timed out after {timeout_ms}ms")]
    HandshakeTimeout { server: String, timeout_ms: u64 },

    /// The call targets a server that is not `connected`.
    #[error("server '{server}' is unavailable ({status})")]
    ServerUnavailable { server: String, status: String },

    /// The descriptor is disabled and may not be connected.
    #[error("server '{server}' is disabled")]
    ServerDisabled { server: String },

    /// No descriptor is registered under this id.
    #[error("unknown server: '{server}'")]
    UnknownServer { server: String },

    /// The tool is not in the server's catalog.
    #[error("unknown tool '{tool}' on server '{server}'")]
    ToolNotFound {
        server: String,
        tool: String,
        available: Vec<String>,
        suggestions: Vec<String>,
    },

    /// Required arguments declared by the input schema are absent.
    #[error("missing required arguments for '{tool}': {}", missing.join(", "))]
    MissingArguments { tool: String, missing: Vec<String> },

    /// The supplied arguments are not a JSON object.
    #[error("invalid arguments: {reason}")]
    InvalidArguments { reason: String },

    /// A request exceeded its deadline.
    #[error("call '{method}' on server '{server}' timed out after {timeout_ms}ms")]
    Timeout {
        server: String,
        method: String,
        timeout_ms: u64,
    },

    /// The server answered with a structured error.
    #[error("server error [{code}]: {message}")]
    ToolReportedError {
        code: i64,
        message: String,
        data: Option<serde_json::Value>,
    },

    /// A line from the server could not be decoded as an envelope.
    #[error("protocol decode error: {reason}")]
    ProtocolDecode { reason: String },

    /// I/O failure or closed stream on the process channel.
    #[error("transport error for server '{server}': {reason}")]
    Transport { server: String, reason: String },

    /// Invalid or unreadable configuration.
    #[error("config error: {reason}")]
    Config { reason: String },
}

/// Stable, machine-readable name of a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    LaunchFailure,
    HandshakeFailure,
    HandshakeTimeout,
    ServerUnavailable,
    ServerDisabled,
    UnknownServer,
    ToolNotFound,
    MissingArguments,
    InvalidArguments,
    Timeout,
    ToolReportedError,
    ProtocolDecodeError,
    Transport,
    Config,
}

/// Structured error object handed to the façade.
#[derive(Debug, Clone, Serialize)]
pub struct ErrorPayload {
    pub kind: ErrorKind,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

impl McpError {
    /// Classify this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::LaunchFailed { .. } => ErrorKind::LaunchFailure,
            Self::HandshakeFailed { .. } => ErrorKind::HandshakeFailure,
            Self::HandshakeTimeout { .. } => ErrorKind::HandshakeTimeout,
            Self::ServerUnavailable { .. } => ErrorKind::ServerUnavailable,
            Self::ServerDisabled { .. } => ErrorKind::ServerDisabled,
            Self::UnknownServer { .. } => ErrorKind::UnknownServer,
            Self::ToolNotFound { .. } => ErrorKind::ToolNotFound,
            Self::MissingArguments { .. } => ErrorKind::MissingArguments,
            Self::InvalidArguments { .. } => ErrorKind::InvalidArguments,
            Self::Timeout { .. } => ErrorKind::Timeout,
            Self::ToolReportedError { .. } => ErrorKind::ToolReportedError,
            Self::ProtocolDecode { .. } => ErrorKind::ProtocolDecodeError,
            Self::Transport { .. } => ErrorKind::Transport,
            Self::Config { .. } => ErrorKind::Config,
        }
    }

    /// Build the façade-facing error object.
    ///
    /// Variants that carry data useful for a retry (available tool names,
    /// missing keys, the server's error data) expose it under `details`.
    pub fn payload(&self) -> ErrorPayload {
        let details = match self {
            Self::ToolNotFound {
                available,
                suggestions,
                ..
            } => Some(serde_json::json!({
                "available": available,
                "suggestions": suggestions,
            })),
            Self::MissingArguments { missing, .. } => {
                Some(serde_json::json!({ "missing": missing }))
            }
            Self::ToolReportedError { code, data, .. } => {
                Some(serde_json::json!({ "code": code, "data": data }))
            }
            Self::Timeout { timeout_ms, .. } | Self::HandshakeTimeout { timeout_ms, .. } => {
                Some(serde_json::json!({ "timeout_ms": timeout_ms }))
            }
            _ => None,
        };

        ErrorPayload {
            kind: self.kind(),
            message: self.to_string(),
            details,
        }
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────
