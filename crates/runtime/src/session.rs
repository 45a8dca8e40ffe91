//! The reasoning loop.
//!
//! A session is a state machine:
//!
//! ```text
//! INIT -> THINKING -> DISPATCHING -> OBSERVING -> THINKING -> ... -> DONE
//!             \                          \
//!              `-> DONE | FAILED          `-> FAILED (budget, cancelled)
//! ```
//!
//! Every tool failure is turned into an observation the backend sees on its
//! next turn. Only backend failures, budget exhaustion, cancellation, and
//! unresolvable turns end the session in `FAILED`, and each of those leaves a
//! terminal assistant message explaining what happened.

use std::sync::Arc;

use serde_json::Value;
use storage::{Event, EventKind, EventStore, SessionId};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::backend::{Backend, CompletionRequest};
use crate::dispatch::{DispatchLimits, Dispatcher};
use crate::error::{Error, Result};
use crate::extract::Extractor;
use crate::history::{History, WindowPolicy};
use crate::registry::Registry;
use crate::types::{ErrorKind, Message, ToolCallDirective, ToolResult};

/// Session settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionConfig {
    /// Maximum tool rounds before the session fails.
    pub turn_budget: u32,
    pub allow_multi_call: bool,
    pub dispatch: DispatchLimits,
    pub window: WindowPolicy,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            turn_budget: 8,
            allow_multi_call: true,
            dispatch: DispatchLimits::default(),
            window: WindowPolicy::default(),
        }
    }
}

/// Why a session ended in `FAILED`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureReason {
    BudgetExceeded,
    BackendUnreachable,
    BackendProtocol,
    Ambiguity,
    Cancelled,
}

impl FailureReason {
    /// Error category, where one applies.
    pub fn kind(&self) -> Option<ErrorKind> {
        match self {
            Self::BudgetExceeded => Some(ErrorKind::LoopBudgetExceeded),
            Self::BackendUnreachable => Some(ErrorKind::TransportError),
            Self::BackendProtocol => Some(ErrorKind::ProtocolError),
            Self::Ambiguity => Some(ErrorKind::ParseAmbiguityError),
            Self::Cancelled => None,
        }
    }

    fn terminal_message(&self, detail: Option<&str>) -> String {
        let summary = match self {
            Self::BudgetExceeded => "the turn budget was used up before a final answer",
            Self::BackendUnreachable => "the reasoning backend could not be reached",
            Self::BackendProtocol => "the reasoning backend returned an unusable response",
            Self::Ambiguity => "the response could not be resolved into an answer or a tool call",
            Self::Cancelled => "the session was cancelled",
        };
        match detail {
            Some(detail) => format!("Stopped: {summary} ({detail})."),
            None => format!("Stopped: {summary}."),
        }
    }
}

impl std::fmt::Display for FailureReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::BudgetExceeded => "budget_exceeded",
            Self::BackendUnreachable => "backend_unreachable",
            Self::BackendProtocol => "backend_protocol",
            Self::Ambiguity => "ambiguity",
            Self::Cancelled => "cancelled",
        })
    }
}

/// Where the loop is.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionState {
    Init,
    Thinking,
    Dispatching(Vec<ToolCallDirective>),
    Observing(Vec<ToolResult>),
    Done,
    Failed(FailureReason),
}

impl SessionState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Done | Self::Failed(_))
    }
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Init => f.write_str("init"),
            Self::Thinking => f.write_str("thinking"),
            Self::Dispatching(_) => f.write_str("dispatching"),
            Self::Observing(_) => f.write_str("observing"),
            Self::Done => f.write_str("done"),
            Self::Failed(reason) => write!(f, "failed: {reason}"),
        }
    }
}

/// Terminal state and the assistant message that ended the session.
#[derive(Debug, Clone)]
pub struct Outcome {
    pub state: SessionState,
    pub message: Message,
}

impl Outcome {
    pub fn is_failed(&self) -> bool {
        matches!(self.state, SessionState::Failed(_))
    }
}

/// One conversation driven to a terminal state.
pub struct Session<B> {
    pub id: SessionId,
    backend: B,
    registry: Arc<Registry>,
    dispatcher: Dispatcher,
    extractor: Extractor,
    history: History,
    system: Option<String>,
    turn_count: u32,
    turn_budget: u32,
    state: SessionState,
    cancel: CancellationToken,
    store: Option<EventStore>,
}

impl<B: Backend> Session<B> {
    pub fn new(backend: B, registry: Arc<Registry>, config: SessionConfig) -> Result<Self> {
        if config.turn_budget == 0 {
            return Err(Error::Config("turn budget must be at least 1".into()));
        }
        if config.dispatch.max_in_flight == 0 {
            return Err(Error::Config("max_in_flight must be at least 1".into()));
        }
        Ok(Self {
            id: SessionId::new(),
            backend,
            dispatcher: Dispatcher::new(registry.clone(), config.dispatch),
            registry,
            extractor: Extractor::new().allow_multi_call(config.allow_multi_call),
            history: History::new().with_window(config.window),
            system: None,
            turn_count: 0,
            turn_budget: config.turn_budget,
            state: SessionState::Init,
            cancel: CancellationToken::new(),
            store: None,
        })
    }

    /// Set the system prompt.
    pub fn with_system(mut self, prompt: impl Into<String>) -> Self {
        self.system = Some(prompt.into());
        self
    }

    /// Continue an earlier conversation. The configured window still applies.
    pub fn with_history(mut self, history: History) -> Self {
        let window = self.history.window();
        self.history = history.with_window(window);
        self
    }

    /// Record events to an audit log.
    pub fn with_store(mut self, store: EventStore) -> Self {
        self.store = Some(store);
        self
    }

    /// Token that cancels this session at the next phase boundary, or
    /// immediately while waiting on the backend or on tools.
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn state(&self) -> &SessionState {
        &self.state
    }

    pub fn history(&self) -> &History {
        &self.history
    }

    pub fn turn_count(&self) -> u32 {
        self.turn_count
    }

    /// Take the session apart once it is finished with.
    pub fn into_parts(self) -> (B, History, Option<EventStore>) {
        (self.backend, self.history, self.store)
    }

    /// Append the user's input and move to `THINKING`.
    pub fn start(&mut self, input: &str) -> Result<()> {
        if self.state != SessionState::Init {
            return Err(Error::InvalidState(format!(
                "session {} already started ({})",
                self.id, self.state
            )));
        }
        self.log(EventKind::SessionStart);
        self.record(Message::user(input))?;
        self.transition(SessionState::Thinking);
        Ok(())
    }

    /// Perform one transition.
    pub async fn step(&mut self) -> Result<&SessionState> {
        let next = match &self.state {
            SessionState::Init => {
                return Err(Error::InvalidState("session has no input yet".into()));
            }
            SessionState::Done | SessionState::Failed(_) => {
                return Err(Error::InvalidState(format!(
                    "session {} already finished ({})",
                    self.id, self.state
                )));
            }
            SessionState::Thinking => self.think().await?,
            SessionState::Dispatching(directives) => {
                let directives = directives.clone();
                self.dispatch(&directives).await
            }
            SessionState::Observing(results) => {
                let results = results.clone();
                self.observe(results)?
            }
        };
        self.transition(next);
        Ok(&self.state)
    }

    /// Drive the session from `input` to a terminal state.
    pub async fn run(&mut self, input: &str) -> Result<Outcome> {
        self.start(input)?;
        while !self.state.is_terminal() {
            self.step().await?;
        }
        Ok(Outcome {
            state: self.state.clone(),
            message: self
                .history
                .last_assistant()
                .cloned()
                .unwrap_or_else(|| Message::assistant("")),
        })
    }

    // --- Phases ---

    async fn think(&mut self) -> Result<SessionState> {
        if self.cancel.is_cancelled() {
            return self.fail(FailureReason::Cancelled, None);
        }

        let snapshot = self.history.snapshot();
        if snapshot.truncated > 0 {
            debug!(session = %self.id, truncated = snapshot.truncated, "history windowed");
        }
        let tools = self.registry.descriptors();
        let request = CompletionRequest {
            messages: &snapshot.messages,
            system: self.system.as_deref(),
            tools: &tools,
        };

        let result = tokio::select! {
            _ = self.cancel.cancelled() => None,
            result = self.backend.complete(request) => Some(result),
        };
        let completion = match result {
            None => return self.fail(FailureReason::Cancelled, None),
            Some(Err(e)) => {
                warn!(session = %self.id, error = %e, "backend failed");
                let reason = if e.is_unreachable() {
                    FailureReason::BackendUnreachable
                } else {
                    FailureReason::BackendProtocol
                };
                return self.fail(reason, Some(e.to_string()));
            }
            Some(Ok(completion)) => completion,
        };
        debug!(
            session = %self.id,
            input_tokens = completion.usage.input_tokens,
            output_tokens = completion.usage.output_tokens,
            "completion received"
        );

        let names: Vec<&str> = tools.iter().map(|t| t.name.as_str()).collect();
        let extraction = self.extractor.extract(&completion, &names);

        if extraction.directives.is_empty() {
            if let Some(reason) = &extraction.ambiguity {
                warn!(session = %self.id, reason = %reason, "ambiguous tool call, treating as final answer");
                if extraction.raw_text.trim().is_empty() {
                    return self.fail(FailureReason::Ambiguity, Some(reason.clone()));
                }
            }
            self.record(Message::assistant(extraction.raw_text))?;
            return Ok(SessionState::Done);
        }

        let mut directives = extraction.directives;
        for directive in &mut directives {
            // Providers may reuse ids across turns; results must stay unique.
            if self.history.has_call(&directive.call_id) {
                directive.call_id = Uuid::new_v4().to_string();
            }
        }
        let calls = directives.iter().map(ToolCallDirective::to_call).collect();
        self.record(Message::assistant_with_calls(extraction.raw_text, calls))?;
        for directive in &directives {
            info!(
                session = %self.id,
                tool = %directive.tool_name,
                call_id = %directive.call_id,
                confidence = %directive.confidence,
                "tool call"
            );
            self.log(EventKind::ToolCall {
                call_id: directive.call_id.clone(),
                name: directive.tool_name.clone(),
                input: Value::Object(directive.arguments.clone()),
                confidence: directive.confidence.to_string(),
            });
        }
        Ok(SessionState::Dispatching(directives))
    }

    async fn dispatch(&mut self, directives: &[ToolCallDirective]) -> SessionState {
        let results = self.dispatcher.dispatch_all(directives, &self.cancel).await;
        SessionState::Observing(results)
    }

    fn observe(&mut self, results: Vec<ToolResult>) -> Result<SessionState> {
        for result in &results {
            self.record(Message::tool(result))?;
            self.log(EventKind::ToolResult {
                call_id: result.tool_call_id.clone(),
                name: result.tool_name.clone(),
                output: result.output().cloned().unwrap_or(Value::Null),
                error: result.error().map(ToString::to_string),
            });
        }
        self.turn_count += 1;

        if self.cancel.is_cancelled() {
            return self.fail(FailureReason::Cancelled, None);
        }
        if self.turn_count >= self.turn_budget {
            let detail = format!("{} of {} tool rounds", self.turn_count, self.turn_budget);
            return self.fail(FailureReason::BudgetExceeded, Some(detail));
        }
        Ok(SessionState::Thinking)
    }

    // --- Internal methods ---

    fn fail(&mut self, reason: FailureReason, detail: Option<String>) -> Result<SessionState> {
        self.record(Message::assistant(reason.terminal_message(detail.as_deref())))?;
        Ok(SessionState::Failed(reason))
    }

    fn transition(&mut self, next: SessionState) {
        debug!(session = %self.id, from = %self.state, to = %next, turn = self.turn_count, "transition");
        if next.is_terminal() {
            info!(session = %self.id, state = %next, turns = self.turn_count, "session finished");
            self.log(EventKind::SessionEnd {
                state: next.to_string(),
            });
        }
        self.state = next;
    }

    fn record(&mut self, message: Message) -> Result<()> {
        let kind = EventKind::Message {
            role: message.role,
            content: message.content.clone(),
        };
        self.history.append(message)?;
        self.log(kind);
        Ok(())
    }

    fn log(&self, kind: EventKind) {
        if let Some(store) = &self.store {
            if let Err(e) = store.append(&Event::new(self.id, kind)) {
                warn!(session = %self.id, error = %e, "failed to record event");
            }
        }
    }
}
