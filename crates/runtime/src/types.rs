//! Core data model shared by the loop, the backends, and the dispatcher.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use storage::Role;

use crate::schema::Violation;

/// A tool call issued by an assistant turn, as recorded in history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    /// Correlates the call with its tool-role result message.
    pub id: String,
    pub name: String,
    pub arguments: Map<String, Value>,
}

/// A message in the conversation. Immutable once appended to history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: String,
    /// Set on tool-role messages.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
    /// Calls issued by an assistant message.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<ToolCall>,
    pub timestamp: DateTime<Utc>,
}

impl Message {
    fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
            tool_call_id: None,
            tool_calls: Vec::new(),
            timestamp: Utc::now(),
        }
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self::new(Role::System, content)
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::new(Role::User, content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new(Role::Assistant, content)
    }

    /// An assistant turn that issued tool calls.
    pub fn assistant_with_calls(content: impl Into<String>, calls: Vec<ToolCall>) -> Self {
        Self {
            tool_calls: calls,
            ..Self::new(Role::Assistant, content)
        }
    }

    /// The observation of a tool result.
    pub fn tool(result: &ToolResult) -> Self {
        Self {
            tool_call_id: Some(result.tool_call_id.clone()),
            ..Self::new(Role::Tool, result.render())
        }
    }
}

/// How much the extractor trusts a directive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Confidence {
    /// Taken verbatim from the backend's structured call field.
    Structured,
    /// Recovered from a single unambiguous blob in free text.
    Parsed,
    /// Text looked like a tool call but could not be resolved.
    Ambiguous,
}

impl std::fmt::Display for Confidence {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::Structured => "structured",
            Self::Parsed => "parsed",
            Self::Ambiguous => "ambiguous",
        })
    }
}

/// A structured intent to invoke a tool, derived from one backend turn.
#[derive(Debug, Clone, PartialEq)]
pub struct ToolCallDirective {
    pub call_id: String,
    pub tool_name: String,
    pub arguments: Map<String, Value>,
    pub raw_source_text: String,
    pub confidence: Confidence,
}

impl ToolCallDirective {
    pub fn to_call(&self) -> ToolCall {
        ToolCall {
            id: self.call_id.clone(),
            name: self.tool_name.clone(),
            arguments: self.arguments.clone(),
        }
    }
}

/// Failure taxonomy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    TransportError,
    ProtocolError,
    ToolNotFound,
    ArgumentValidationError,
    ToolExecutionError,
    ParseAmbiguityError,
    LoopBudgetExceeded,
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::TransportError => "transport_error",
            Self::ProtocolError => "protocol_error",
            Self::ToolNotFound => "tool_not_found",
            Self::ArgumentValidationError => "argument_validation_error",
            Self::ToolExecutionError => "tool_execution_error",
            Self::ParseAmbiguityError => "parse_ambiguity_error",
            Self::LoopBudgetExceeded => "loop_budget_exceeded",
        })
    }
}

/// Why a tool call produced no output.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolError {
    pub kind: ErrorKind,
    pub message: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub violations: Vec<Violation>,
    #[serde(default)]
    pub retryable: bool,
}

impl ToolError {
    pub fn not_found(tool: &str) -> Self {
        Self {
            kind: ErrorKind::ToolNotFound,
            message: format!("no tool named '{tool}' is available"),
            violations: Vec::new(),
            retryable: false,
        }
    }

    pub fn invalid_arguments(tool: &str, violations: Vec<Violation>) -> Self {
        Self {
            kind: ErrorKind::ArgumentValidationError,
            message: format!("arguments for '{tool}' do not match its schema"),
            violations,
            retryable: false,
        }
    }

    pub fn execution(message: impl Into<String>, retryable: bool) -> Self {
        Self {
            kind: ErrorKind::ToolExecutionError,
            message: message.into(),
            violations: Vec::new(),
            retryable,
        }
    }

    /// Wrap a transport or protocol failure from a tool server.
    pub fn from_rpc(error: &rpc::Error) -> Self {
        let category = if error.is_transport() {
            ErrorKind::TransportError.to_string()
        } else if error.is_protocol() {
            ErrorKind::ProtocolError.to_string()
        } else {
            "server error".to_string()
        };
        Self::execution(format!("{category}: {error}"), error.is_retryable())
    }
}

impl std::fmt::Display for ToolError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)?;
        for violation in &self.violations {
            write!(f, "\n- {violation}")?;
        }
        if self.retryable {
            write!(f, "\n(retryable)")?;
        }
        Ok(())
    }
}

/// Outcome of a tool execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum ToolOutcome {
    Success { output: Value },
    Failure { error: ToolError },
}

/// Result of a tool execution, paired with call ID.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolResult {
    pub tool_call_id: String,
    pub tool_name: String,
    pub outcome: ToolOutcome,
}

impl ToolResult {
    pub fn success(directive: &ToolCallDirective, output: Value) -> Self {
        Self {
            tool_call_id: directive.call_id.clone(),
            tool_name: directive.tool_name.clone(),
            outcome: ToolOutcome::Success { output },
        }
    }

    pub fn failure(directive: &ToolCallDirective, error: ToolError) -> Self {
        Self {
            tool_call_id: directive.call_id.clone(),
            tool_name: directive.tool_name.clone(),
            outcome: ToolOutcome::Failure { error },
        }
    }

    pub fn output(&self) -> Option<&Value> {
        match &self.outcome {
            ToolOutcome::Success { output } => Some(output),
            ToolOutcome::Failure { .. } => None,
        }
    }

    pub fn error(&self) -> Option<&ToolError> {
        match &self.outcome {
            ToolOutcome::Success { .. } => None,
            ToolOutcome::Failure { error } => Some(error),
        }
    }

    /// Text shown to the backend as the observation.
    pub fn render(&self) -> String {
        match &self.outcome {
            ToolOutcome::Success { output: Value::String(s) } => s.clone(),
            ToolOutcome::Success { output } => output.to_string(),
            ToolOutcome::Failure { error } => format!("error {error}"),
        }
    }
}
