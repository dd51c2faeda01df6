//! Shared types for the MCP client.
//!
//! JSON-RPC 2.0 envelopes, MCP protocol payloads, and the runtime views
//! (server state, tool descriptors, execution results) the façade consumes.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use super::errors::McpError;

// ─── JSON-RPC 2.0 ───────────────────────────────────────────────────────────

/// Version tag carried by every envelope.
pub const JSONRPC_VERSION: &str = "2.0";

/// MCP protocol revision announced in `initialize`.
pub const PROTOCOL_VERSION: &str = "2024-11-05";

/// JSON-RPC 2.0 request message.
#[derive(Debug, Clone, Serialize)]
pub struct JsonRpcRequest {
    pub jsonrpc: String,
    pub id: u64,
    pub method: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

impl JsonRpcRequest {
    /// Create a new JSON-RPC request.
    pub fn new(id: u64, method: &str, params: Option<Value>) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id,
            method: method.to_string(),
            params,
        }
    }
}

/// JSON-RPC 2.0 notification (no id, no reply).
#[derive(Debug, Clone, Serialize)]
pub struct JsonRpcNotification {
    pub jsonrpc: String,
    pub method: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

impl JsonRpcNotification {
    pub fn new(method: &str, params: Option<Value>) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            method: method.to_string(),
            params,
        }
    }
}

/// JSON-RPC 2.0 response message (success or error).
///
/// `id` stays a raw value: servers answering their own requests may use
/// string ids, while our outgoing requests always use integers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcResponse {
    pub jsonrpc: String,
    pub id: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<JsonRpcError>,
}

impl JsonRpcResponse {
    pub fn success(id: Value, result: Value) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id,
            result: Some(result),
            error: None,
        }
    }

    pub fn failure(id: Value, code: i64, message: &str) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id,
            result: None,
            error: Some(JsonRpcError {
                code,
                message: message.to_string(),
                data: None,
            }),
        }
    }

    /// Numeric correlation id, if the id is an integer or an integer string.
    pub fn correlation_id(&self) -> Option<u64> {
        match &self.id {
            Value::Number(n) => n.as_u64(),
            Value::String(s) => s.parse().ok(),
            _ => None,
        }
    }

    /// Extract the result, converting an error object to `McpError`.
    pub fn into_result(self) -> Result<Value, McpError> {
        if let Some(err) = self.error {
            return Err(McpError::ToolReportedError {
                code: err.code,
                message: err.message,
                data: err.data,
            });
        }

        self.result.ok_or(McpError::ToolReportedError {
            code: error_codes::INTERNAL_ERROR,
            message: "response missing both result and error".into(),
            data: None,
        })
    }
}

/// JSON-RPC 2.0 error object.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcError {
    pub code: i64,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

/// Well-known JSON-RPC error codes.
pub mod error_codes {
    /// The method does not exist or is not available.
    pub const METHOD_NOT_FOUND: i64 = -32601;
    /// Invalid method parameters.
    pub const INVALID_PARAMS: i64 = -32602;
    /// Internal JSON-RPC error.
    pub const INTERNAL_ERROR: i64 = -32603;
}

// ─── MCP Protocol Types ──────────────────────────────────────────────────────

/// MCP method names used by the client.
pub mod methods {
    pub const INITIALIZE: &str = "initialize";
    pub const INITIALIZED: &str = "notifications/initialized";
    pub const TOOLS_LIST: &str = "tools/list";
    pub const TOOLS_CALL: &str = "tools/call";
    pub const PING: &str = "ping";
    pub const TOOLS_LIST_CHANGED: &str = "notifications/tools/list_changed";
}

/// `initialize` response payload.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct InitializeResult {
    #[serde(default, alias = "protocolVersion")]
    pub protocol_version: Option<String>,
    #[serde(default)]
    pub capabilities: Value,
    #[serde(default, alias = "serverInfo")]
    pub server_info: Option<ServerInfo>,
}

/// Server info returned in the initialize response.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ServerInfo {
    pub name: Option<String>,
    pub version: Option<String>,
}

/// `tools/list` response payload.
#[derive(Debug, Clone, Deserialize)]
pub struct ListToolsResult {
    #[serde(default)]
    pub tools: Vec<WireTool>,
    #[serde(default, alias = "nextCursor")]
    pub next_cursor: Option<String>,
}

/// A tool as it appears on the wire.
#[derive(Debug, Clone, Deserialize)]
pub struct WireTool {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default, alias = "inputSchema")]
    pub input_schema: Value,
}

/// `tools/call` response payload.
#[derive(Debug, Clone, Deserialize)]
pub struct CallToolResult {
    #[serde(default)]
    pub content: Vec<ToolContent>,
    #[serde(default, alias = "structuredContent")]
    pub structured_content: Option<Value>,
    #[serde(default, alias = "isError")]
    pub is_error: bool,
}

/// One item of a tool's ordered output.
///
/// Item kinds this crate does not know are kept verbatim.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ToolContent {
    Typed(TypedContent),
    Other(Value),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TypedContent {
    Text {
        text: String,
    },
    Image {
        data: String,
        #[serde(rename = "mimeType")]
        mime_type: String,
    },
    Audio {
        data: String,
        #[serde(rename = "mimeType")]
        mime_type: String,
    },
    Resource {
        resource: Value,
    },
    ResourceLink {
        uri: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        name: Option<String>,
        #[serde(default, rename = "mimeType", skip_serializing_if = "Option::is_none")]
        mime_type: Option<String>,
    },
}

impl ToolContent {
    /// The text of a `text` item.
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Self::Typed(TypedContent::Text { text }) => Some(text),
            _ => None,
        }
    }
}

// ─── Tool Descriptors ────────────────────────────────────────────────────────

/// A tool's input schema, kept as the server sent it.
///
/// Only the structural parts matter here: property names and the
/// `required` subset. Value typing is left to the server.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct InputSchema(pub Value);

impl InputSchema {
    /// Names listed under `required`.
    pub fn required(&self) -> Vec<&str> {
        self.0
            .get("required")
            .and_then(Value::as_array)
            .map(|arr| arr.iter().filter_map(Value::as_str).collect())
            .unwrap_or_default()
    }
}

/// A discovered tool, owned by one server.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ToolDescriptor {
    pub server_id: String,
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub input_schema: InputSchema,
}

impl ToolDescriptor {
    pub fn from_wire(server_id: &str, tool: WireTool) -> Self {
        Self {
            server_id: server_id.to_string(),
            name: tool.name,
            description: tool.description,
            input_schema: InputSchema(tool.input_schema),
        }
    }
}

// ─── Server State ────────────────────────────────────────────────────────────

/// Lifecycle status of one configured server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServerStatus {
    Disconnected,
    Connecting,
    Connected,
    Error,
}

impl fmt::Display for ServerStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Error => "error",
        };
        f.write_str(s)
    }
}

/// Capability flags reported by the server during `initialize`.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ServerCapabilities {
    pub tools: bool,
    pub resources: bool,
    pub prompts: bool,
    pub logging: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub protocol_version: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub server_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub server_version: Option<String>,
}

impl From<InitializeResult> for ServerCapabilities {
    fn from(init: InitializeResult) -> Self {
        let has = |key: &str| init.capabilities.get(key).is_some_and(|v| !v.is_null());
        let info = init.server_info.unwrap_or_default();
        Self {
            tools: has("tools"),
            resources: has("resources"),
            prompts: has("prompts"),
            logging: has("logging"),
            protocol_version: init.protocol_version,
            server_name: info.name,
            server_version: info.version,
        }
    }
}

/// Read-only snapshot of a server's runtime state.
#[derive(Debug, Clone, Serialize)]
pub struct ServerState {
    pub id: String,
    pub status: ServerStatus,
    pub last_connected: Option<DateTime<Utc>>,
    /// Start of the current `connected` period, cleared on leaving it.
    pub connected_since: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub capabilities: ServerCapabilities,
    pub restart_attempts: u32,
}

impl ServerState {
    pub fn new(id: &str) -> Self {
        Self {
            id: id.to_string(),
            status: ServerStatus::Disconnected,
            last_connected: None,
            connected_since: None,
            last_error: None,
            capabilities: ServerCapabilities::default(),
            restart_attempts: 0,
        }
    }
}

// ─── Execution ───────────────────────────────────────────────────────────────

/// Tool arguments: a map of argument name to value.
pub type ToolArguments = serde_json::Map<String, Value>;

/// Convert a loosely-typed JSON value into tool arguments.
///
/// `null` means "no arguments"; anything other than an object is rejected.
pub fn arguments_from_value(value: Value) -> Result<ToolArguments, McpError> {
    match value {
        Value::Null => Ok(ToolArguments::new()),
        Value::Object(map) => Ok(map),
        other => Err(McpError::InvalidArguments {
            reason: format!("expected a JSON object, got {}", json_type_name(&other)),
        }),
    }
}

fn json_type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

/// Opaque correlation bundle attached to executions.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CallerContext {
    #[serde(default)]
    pub session_id: Option<String>,
    #[serde(default)]
    pub user_id: Option<String>,
}

/// Successful result of a tool execution.
#[derive(Debug, Clone, Serialize)]
pub struct ExecutionResult {
    pub execution_id: Uuid,
    pub server_id: String,
    pub tool_name: String,
    pub content: Vec<ToolContent>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub structured_content: Option<Value>,
    pub execution_time_ms: u64,
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_json_rpc_request_serialization() {
        let req = JsonRpcRequest::new(1, "initialize", None);
        let json = serde_json::to_string(&req).unwrap();
        assert!(json.contains("\"jsonrpc\":\"2.0\""));
        assert!(json.contains("\"id\":1"));
        assert!(json.contains("\"method\":\"initialize\""));
        assert!(!json.contains("params"));
    }

    #[test]
    fn test_response_correlation_id_accepts_numeric_string() {
        let resp: JsonRpcResponse =
            serde_json::from_str(r#"{"jsonrpc":"2.0","id":"7","result":{}}"#).unwrap();
        assert_eq!(resp.correlation_id(), Some(7));

        let resp: JsonRpcResponse =
            serde_json::from_str(r#"{"jsonrpc":"2.0","id":"abc","result":{}}"#).unwrap();
        assert_eq!(resp.correlation_id(), None);
    }

    #[test]
    fn test_into_result_error() {
        let resp = JsonRpcResponse::failure(serde_json::json!(3), -32601, "Method not found");
        match resp.into_result().unwrap_err() {
            McpError::ToolReportedError { code, message, .. } => {
                assert_eq!(code, error_codes::METHOD_NOT_FOUND);
                assert_eq!(message, "Method not found");
            }
            other => panic!("expected ToolReportedError, got {other:?}"),
        }
    }

    #[test]
    fn test_into_result_missing_both() {
        let resp: JsonRpcResponse =
            serde_json::from_str(r#"{"jsonrpc":"2.0","id":1}"#).unwrap();
        assert!(matches!(
            resp.into_result(),
            Err(McpError::ToolReportedError { .. })
        ));
    }

    #[test]
    fn test_input_schema_required() {
        let schema = InputSchema(serde_json::json!({
            "type": "object",
            "properties": {"path": {"type": "string"}, "depth": {"type": "integer"}},
            "required": ["path"]
        }));
        assert_eq!(schema.required(), vec!["path"]);
    }

    #[test]
    fn test_input_schema_without_required() {
        let schema = InputSchema(serde_json::json!({"type": "object"}));
        assert!(schema.required().is_empty());
        assert!(InputSchema::default().required().is_empty());
    }

    #[test]
    fn test_call_tool_result_content_items() {
        let json = serde_json::json!({
            "content": [
                {"type": "text", "text": "pong"},
                {"type": "image", "data": "AAAA", "mimeType": "image/png"},
                {"type": "resource", "resource": {"uri": "file:///tmp/a"}},
                {"type": "hologram", "beam": 3}
            ]
        });
        let result: CallToolResult = serde_json::from_value(json).unwrap();
        assert!(!result.is_error);
        assert_eq!(result.content.len(), 4);
        assert_eq!(result.content[0].as_text(), Some("pong"));
        assert!(matches!(
            &result.content[1],
            ToolContent::Typed(TypedContent::Image { mime_type, .. }) if mime_type == "image/png"
        ));
        assert!(matches!(
            &result.content[2],
            ToolContent::Typed(TypedContent::Resource { .. })
        ));
        assert!(matches!(&result.content[3], ToolContent::Other(_)));
    }

    #[test]
    fn test_capabilities_from_initialize() {
        let init: InitializeResult = serde_json::from_value(serde_json::json!({
            "protocolVersion": "2024-11-05",
            "capabilities": {"tools": {"listChanged": true}, "logging": {}},
            "serverInfo": {"name": "echo", "version": "1.2.0"}
        }))
        .unwrap();
        let caps = ServerCapabilities::from(init);
        assert!(caps.tools);
        assert!(caps.logging);
        assert!(!caps.resources);
        assert_eq!(caps.server_name.as_deref(), Some("echo"));
        assert_eq!(caps.protocol_version.as_deref(), Some("2024-11-05"));
    }

    #[test]
    fn test_arguments_from_value() {
        assert!(arguments_from_value(Value::Null).unwrap().is_empty());
        let args = arguments_from_value(serde_json::json!({"a": 1})).unwrap();
        assert_eq!(args["a"], 1);
        assert!(matches!(
            arguments_from_value(serde_json::json!([1, 2])),
            Err(McpError::InvalidArguments { .. })
        ));
    }

    #[test]
    fn test_server_status_display_matches_serde() {
        for status in [
            ServerStatus::Disconnected,
            ServerStatus::Connecting,
            ServerStatus::Connected,
            ServerStatus::Error,
        ] {
            let json = serde_json::to_value(status).unwrap();
            assert_eq!(json, status.to_string());
        }
    }
}
