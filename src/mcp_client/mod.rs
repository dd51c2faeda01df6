//! MCP Client: supervision of external tool servers over stdio JSON-RPC.
//!
//! This module handles:
//! - Spawning server processes and watching them exit
//! - JSON-RPC 2.0 framing and request/response correlation over stdio
//! - The per-server connection state machine with automatic reconnects
//! - Tool discovery into a shared catalog
//! - Tool call validation, admission under a global ceiling, and dispatch
//! - Per-server stats and a bounded execution history
//!
//! [`Orchestrator`] is the entry point used by the façade.

pub mod catalog;
pub mod codec;
pub mod config;
pub mod connection;
pub mod errors;
pub mod events;
pub mod executor;
pub mod ledger;
pub mod lifecycle;
pub mod orchestrator;
pub mod testing;
pub mod transport;
pub mod types;

// Re-exports for convenience
pub use config::{LoggingConfig, RestartPolicy, ServerDescriptor, ServiceConfig, ServiceSettings};
pub use errors::{ErrorKind, ErrorPayload, McpError};
pub use events::ServerEvent;
pub use ledger::{ExecutionOutcome, ExecutionRecord, HistoryFilter, ServerStats};
pub use lifecycle::{Launcher, StdioLauncher};
pub use orchestrator::{Orchestrator, ServerFilter, ServerSummary};
pub use types::{
    arguments_from_value, CallerContext, ExecutionResult, ServerState, ServerStatus,
    ToolArguments, ToolContent, ToolDescriptor,
};
