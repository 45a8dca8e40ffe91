//! RPC client for tool servers.
//!
//! Requests are `{id, method, params}` envelopes; responses echo the id with
//! either a `result` or an `error`. Two bindings carry the same envelopes:
//! one JSON object per line over a byte stream (usually a child process's
//! stdio), or one HTTP POST per envelope.
//!
//! # Example
//!
//! ```no_run
//! use rpc::{CallOptions, Endpoint, ServerConfig};
//!
//! # async fn example() -> rpc::Result<()> {
//! let config = ServerConfig {
//!     name: "calculator".to_string(),
//!     endpoint: Endpoint::Http {
//!         url: "http://localhost:8000/mcp".to_string(),
//!     },
//!     options: CallOptions::default(),
//! };
//!
//! let client = config.connect()?;
//! client.initialize().await?;
//!
//! for tool in client.list_tools().await? {
//!     println!("Tool: {}", tool.name);
//! }
//!
//! let output = client
//!     .call_tool("add", serde_json::json!({ "a": 3, "b": 4 }))
//!     .await?;
//! println!("{output}");
//! # Ok(())
//! # }
//! ```

mod client;
mod error;
mod http;
mod protocol;
mod server;
mod stream;

pub use client::{CallOptions, Client, DEFAULT_TIMEOUT, RetryPolicy, Transport};
pub use error::{Error, Result};
pub use http::HttpTransport;
pub use protocol::{
    CallToolParams, CallToolResult, InitializeParams, InitializeResult, JsonRpcError,
    JsonRpcRequest, JsonRpcResponse, ListToolsResult, PROTOCOL_VERSION, RequestId, ServerInfo,
    Tool, ToolContent,
};
pub use server::{Endpoint, ServerAddress, ServerConfig};
pub use stream::{MAX_LINE_SIZE, StreamTransport};
