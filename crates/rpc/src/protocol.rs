//! Wire types for the tool-server protocol.
//!
//! Requests go out as JSON-RPC 2.0 envelopes. Responses are accepted in both
//! the plain `{id, result}` / `{id, error: {kind, message}}` form and the MCP
//! form (`code` errors, `content` blocks), so the client talks to either kind
//! of server.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Protocol version sent during the handshake.
pub const PROTOCOL_VERSION: &str = "2024-11-05";

/// JSON-RPC 2.0 request.
#[derive(Debug, Clone, Serialize)]
pub struct JsonRpcRequest {
    pub jsonrpc: &'static str,
    pub id: RequestId,
    pub method: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

impl JsonRpcRequest {
    pub fn new(id: impl Into<RequestId>, method: impl Into<String>) -> Self {
        Self {
            jsonrpc: "2.0",
            id: id.into(),
            method: method.into(),
            params: None,
        }
    }

    pub fn with_params(mut self, params: Value) -> Self {
        self.params = Some(params);
        self
    }
}

/// JSON-RPC 2.0 response.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct JsonRpcResponse {
    #[serde(default, skip_serializing)]
    pub jsonrpc: Option<String>,
    pub id: RequestId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<JsonRpcError>,
}

impl JsonRpcResponse {
    pub fn success(id: RequestId, result: Value) -> Self {
        Self {
            jsonrpc: None,
            id,
            result: Some(result),
            error: None,
        }
    }

    pub fn failure(id: RequestId, error: JsonRpcError) -> Self {
        Self {
            jsonrpc: None,
            id,
            result: None,
            error: Some(error),
        }
    }

    /// Returns the result if successful, or an error.
    ///
    /// Some servers omit `result` for void methods; a missing result is
    /// treated as `null` rather than an error.
    pub fn into_result(self) -> Result<Value, JsonRpcError> {
        if let Some(error) = self.error {
            Err(error)
        } else {
            Ok(self.result.unwrap_or(Value::Null))
        }
    }
}

/// Error object carried by a failed response.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct JsonRpcError {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retryable: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl JsonRpcError {
    pub fn new(kind: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: None,
            kind: Some(kind.into()),
            message: message.into(),
            retryable: None,
            data: None,
        }
    }

    pub fn retryable(mut self, retryable: bool) -> Self {
        self.retryable = Some(retryable);
        self
    }

    /// Whether the server flagged this failure as transient.
    pub fn is_retryable(&self) -> bool {
        self.retryable.unwrap_or(false) || self.kind.as_deref() == Some("transient")
    }
}

impl std::fmt::Display for JsonRpcError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let message = &self.message;
        match (&self.kind, self.code) {
            (Some(kind), _) => write!(f, "[{kind}] {message}"),
            (None, Some(code)) => write!(f, "[{code}] {message}"),
            (None, None) => write!(f, "{message}"),
        }
    }
}

impl std::error::Error for JsonRpcError {}

/// Request ID (can be string or number).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RequestId {
    String(String),
    Number(i64),
}

impl std::fmt::Display for RequestId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::String(s) => write!(f, "{s:?}"),
            Self::Number(n) => write!(f, "{n}"),
        }
    }
}

impl From<i64> for RequestId {
    fn from(n: i64) -> Self {
        Self::Number(n)
    }
}

impl From<String> for RequestId {
    fn from(s: String) -> Self {
        Self::String(s)
    }
}

impl From<&str> for RequestId {
    fn from(s: &str) -> Self {
        Self::String(s.to_string())
    }
}

/// One decoded line or body received from a server.
#[derive(Debug)]
pub enum Incoming {
    Response(JsonRpcResponse),
    /// A message without an id (or a server-initiated request), by method.
    Notification(String),
}

/// Decode a received envelope.
pub fn decode(text: &str) -> Result<Incoming, String> {
    let value: Value = serde_json::from_str(text).map_err(|e| format!("not JSON: {e}"))?;
    let Some(object) = value.as_object() else {
        return Err("envelope is not an object".into());
    };

    if let Some(method) = object.get("method").and_then(Value::as_str) {
        return Ok(Incoming::Notification(method.to_string()));
    }
    if !object.contains_key("id") {
        return Err("response has no id".into());
    }

    serde_json::from_value(value)
        .map(Incoming::Response)
        .map_err(|e| format!("malformed response: {e}"))
}

// --- Method-specific types ---

/// `initialize` request params.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InitializeParams {
    pub protocol_version: String,
    pub capabilities: Value,
    pub client_info: ClientInfo,
}

impl Default for InitializeParams {
    fn default() -> Self {
        Self {
            protocol_version: PROTOCOL_VERSION.to_string(),
            capabilities: Value::Object(Default::default()),
            client_info: ClientInfo {
                name: "bridge".to_string(),
                version: env!("CARGO_PKG_VERSION").to_string(),
            },
        }
    }
}

/// Client info sent during initialization.
#[derive(Debug, Clone, Serialize)]
pub struct ClientInfo {
    pub name: String,
    pub version: String,
}

/// `initialize` result: a summary of the server.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InitializeResult {
    #[serde(default)]
    pub server_name: Option<String>,
    #[serde(default)]
    pub protocol_version: Option<String>,
    #[serde(default)]
    pub server_info: Option<ServerInfo>,
    #[serde(default)]
    pub capabilities: Value,
}

impl InitializeResult {
    /// The server's self-reported name, whichever field carried it.
    pub fn name(&self) -> Option<&str> {
        self.server_name
            .as_deref()
            .or_else(|| self.server_info.as_ref().map(|i| i.name.as_str()))
    }
}

/// Server info returned during initialization.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerInfo {
    pub name: String,
    #[serde(default)]
    pub version: Option<String>,
}

/// Tool definition returned by `tools/list`.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Tool {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default = "empty_object_schema", alias = "input_schema")]
    pub input_schema: Value,
}

fn empty_object_schema() -> Value {
    serde_json::json!({ "type": "object" })
}

/// Result of `tools/list`.
#[derive(Debug, Clone, Deserialize)]
pub struct ListToolsResult {
    pub tools: Vec<Tool>,
}

/// Params for `tools/call`.
#[derive(Debug, Clone, Serialize)]
pub struct CallToolParams {
    pub name: String,
    pub arguments: Value,
}

/// Result of `tools/call`.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CallToolResult {
    /// `Some(Value::Null)` when the server sent an explicit `null`.
    #[serde(default, deserialize_with = "present")]
    pub output: Option<Value>,
    #[serde(default)]
    pub content: Vec<ToolContent>,
    #[serde(default)]
    pub is_error: bool,
}

impl CallToolResult {
    /// Collapse either result shape into a single output value.
    ///
    /// MCP results flagged `isError` become a `tool_error`.
    pub fn into_output(self) -> Result<Value, JsonRpcError> {
        if self.is_error {
            return Err(JsonRpcError::new("tool_error", self.text()));
        }
        if let Some(output) = self.output {
            return Ok(output);
        }
        if self.content.iter().all(|c| c.as_text().is_some()) {
            return Ok(Value::String(self.text()));
        }
        serde_json::to_value(&self.content).map_err(|e| JsonRpcError::new("tool_error", e.to_string()))
    }

    fn text(&self) -> String {
        self.content
            .iter()
            .filter_map(ToolContent::as_text)
            .collect::<Vec<_>>()
            .join("\n")
    }
}

fn present<'de, D>(deserializer: D) -> Result<Option<Value>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    Value::deserialize(deserializer).map(Some)
}

/// Content returned by a tool.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ToolContent {
    Text {
        text: String,
    },
    Image {
        data: String,
        #[serde(rename = "mimeType")]
        mime_type: String,
    },
    Resource {
        resource: Value,
    },
    /// A block type this client does not know.
    #[serde(other)]
    Unknown,
}

impl ToolContent {
    /// Get text content if this is a text content block.
    pub fn as_text(&self) -> Option<&str> {
        match self {
            ToolContent::Text { text } => Some(text),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn serialize_request() {
        let req = JsonRpcRequest::new(1i64, "tools/call")
            .with_params(json!({"name": "add", "arguments": {"a": 3}}));
        let json = serde_json::to_string(&req).unwrap();
        assert!(json.contains("\"jsonrpc\":\"2.0\""));
        assert!(json.contains("\"id\":1"));
        assert!(json.contains("\"method\":\"tools/call\""));
    }

    #[test]
    fn decode_plain_error_response() {
        let line = r#"{"id":4,"error":{"kind":"transient","message":"busy"}}"#;
        let Incoming::Response(resp) = decode(line).unwrap() else {
            panic!("expected a response");
        };
        assert_eq!(resp.id, RequestId::Number(4));
        let err = resp.into_result().unwrap_err();
        assert!(err.is_retryable());
        assert_eq!(err.to_string(), "[transient] busy");
    }

    #[test]
    fn decode_mcp_error_response() {
        let line = r#"{"jsonrpc":"2.0","id":"a","error":{"code":-32000,"message":"Unknown tool: x"}}"#;
        let Incoming::Response(resp) = decode(line).unwrap() else {
            panic!("expected a response");
        };
        let err = resp.into_result().unwrap_err();
        assert!(!err.is_retryable());
        assert_eq!(err.to_string(), "[-32000] Unknown tool: x");
    }

    #[test]
    fn decode_notification_and_garbage() {
        let note = r#"{"jsonrpc":"2.0","method":"notifications/progress","params":{}}"#;
        assert!(matches!(decode(note), Ok(Incoming::Notification(m)) if m == "notifications/progress"));
        assert!(decode("not json").is_err());
        assert!(decode("[1,2]").is_err());
        assert!(decode(r#"{"result":1}"#).is_err());
        assert!(decode(r#"{"id":null,"result":1}"#).is_err());
    }

    #[test]
    fn call_result_shapes() {
        let plain: CallToolResult = serde_json::from_value(json!({"output": 7})).unwrap();
        assert_eq!(plain.into_output().unwrap(), json!(7));

        let mcp: CallToolResult = serde_json::from_value(json!({
            "content": [{"type": "text", "text": "7.0"}]
        }))
        .unwrap();
        assert_eq!(mcp.into_output().unwrap(), json!("7.0"));

        let failed: CallToolResult = serde_json::from_value(json!({
            "content": [{"type": "text", "text": "division by zero"}],
            "isError": true
        }))
        .unwrap();
        let err = failed.into_output().unwrap_err();
        assert_eq!(err.kind.as_deref(), Some("tool_error"));
        assert_eq!(err.message, "division by zero");
    }

    #[test]
    fn explicit_null_output_stays_null() {
        let null: CallToolResult = serde_json::from_value(json!({"output": null})).unwrap();
        assert_eq!(null.into_output().unwrap(), Value::Null);

        let missing: CallToolResult = serde_json::from_value(json!({"content": []})).unwrap();
        assert_eq!(missing.into_output().unwrap(), json!(""));
    }

    #[test]
    fn unknown_content_type_is_tolerated() {
        let result: CallToolResult = serde_json::from_value(json!({
            "content": [
                {"type": "text", "text": "done"},
                {"type": "audio", "data": "AAAA", "mimeType": "audio/wav"}
            ]
        }))
        .unwrap();
        assert!(matches!(result.content[1], ToolContent::Unknown));
        assert_eq!(result.content[0].as_text(), Some("done"));
        assert!(result.into_output().is_ok());
    }

    #[test]
    fn initialize_result_name() {
        let plain: InitializeResult =
            serde_json::from_value(json!({"serverName": "calc", "protocolVersion": "1"})).unwrap();
        assert_eq!(plain.name(), Some("calc"));

        let mcp: InitializeResult = serde_json::from_value(json!({
            "protocolVersion": "2024-11-05",
            "capabilities": {"tools": {}},
            "serverInfo": {"name": "example-mcp-server", "version": "1.0.0"}
        }))
        .unwrap();
        assert_eq!(mcp.name(), Some("example-mcp-server"));
    }

    #[test]
    fn deserialize_tool() {
        let json = r#"{
            "name": "add",
            "description": "Adds two numbers together.",
            "inputSchema": {"type": "object", "properties": {"a": {"type": "number"}}}
        }"#;
        let tool: Tool = serde_json::from_str(json).unwrap();
        assert_eq!(tool.name, "add");
        assert_eq!(tool.input_schema["properties"]["a"]["type"], "number");
    }
}
