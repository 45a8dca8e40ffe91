//! Runtime for a tool-using reasoning loop.
//!
//! A [`Session`] takes a user's input, asks a reasoning [`Backend`] what to
//! do, turns the reply into tool call directives, runs them against tools
//! discovered from remote servers, feeds the results back, and repeats until
//! the backend gives a final answer or a limit is reached.
//!
//! # Overview
//!
//! - **Registry**: live catalog of tools discovered from connected servers.
//! - **Backend**: trait over reasoning providers (OpenAI-compatible, Anthropic).
//! - **Extractor**: reads tool calls from structured fields or free text.
//! - **Dispatcher**: validates arguments and runs calls with bounded concurrency.
//! - **History**: append-only conversation log with windowed snapshots.
//!
//! # Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use runtime::{OpenAiBackend, Registry, Session, SessionConfig};
//! use rpc::{CallOptions, Endpoint, ServerConfig};
//!
//! # async fn example() -> runtime::Result<()> {
//! let registry = Arc::new(Registry::new());
//! let calculator = ServerConfig {
//!     name: "calculator".to_string(),
//!     endpoint: Endpoint::Http {
//!         url: "http://localhost:8000/mcp".to_string(),
//!     },
//!     options: CallOptions::default(),
//! };
//! registry.connect(&calculator).await?;
//!
//! let backend = OpenAiBackend::builder("llama3.1").build();
//! let mut session = Session::new(backend, registry, SessionConfig::default())?;
//! let outcome = session.run("What is 3 + 4?").await?;
//! println!("{}", outcome.message.content);
//! # Ok(())
//! # }
//! ```

mod backend;
mod dispatch;
mod error;
pub mod extract;
pub mod history;
mod registry;
pub mod schema;
mod session;
mod types;

pub use backend::{
    AnthropicBackend, AnthropicBackendBuilder, Backend, BackendError, Completion,
    CompletionRequest, OpenAiBackend, OpenAiBackendBuilder, StructuredCall, Usage,
};
pub use dispatch::{DispatchLimits, Dispatcher};
pub use error::{Error, Result};
pub use extract::{Extraction, Extractor};
pub use history::{History, HistoryError, Snapshot, WindowPolicy};
pub use registry::{Registry, ToolDescriptor};
pub use schema::{Violation, ViolationKind};
pub use session::{FailureReason, Outcome, Session, SessionConfig, SessionState};
pub use types::{
    Confidence, ErrorKind, Message, ToolCall, ToolCallDirective, ToolError, ToolOutcome,
    ToolResult,
};

pub use storage::{Role, SessionId};
