//! Append-only conversation history with windowed snapshots.

use std::collections::HashSet;

use storage::Role;
use thiserror::Error;

use crate::types::Message;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum HistoryError {
    #[error("tool message is missing its tool_call_id")]
    MissingToolCallId,

    #[error("tool result for unknown call '{0}'")]
    UnknownToolCall(String),

    #[error("call '{0}' already has a result")]
    DuplicateToolResult(String),
}

/// Estimate tokens for a string: about four bytes per token, rounded up.
pub fn estimate_tokens(text: &str) -> usize {
    text.len().div_ceil(4)
}

/// Estimate tokens for one message, with overhead for role and framing.
pub fn estimate_message_tokens(message: &Message) -> usize {
    let calls: usize = message
        .tool_calls
        .iter()
        .map(|call| {
            let arguments = serde_json::Value::Object(call.arguments.clone());
            estimate_tokens(&call.name) + estimate_tokens(&arguments.to_string())
        })
        .sum();
    4 + estimate_tokens(&message.content) + calls
}

/// Limits applied when a snapshot is taken. `None` means unbounded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowPolicy {
    pub max_messages: Option<usize>,
    pub max_tokens: Option<usize>,
    /// Most recent messages that are never dropped.
    pub tail_messages: usize,
}

impl Default for WindowPolicy {
    fn default() -> Self {
        Self {
            max_messages: None,
            max_tokens: None,
            tail_messages: 4,
        }
    }
}

impl WindowPolicy {
    pub fn unbounded() -> Self {
        Self::default()
    }

    fn is_bounded(&self) -> bool {
        self.max_messages.is_some() || self.max_tokens.is_some()
    }
}

/// What the backend sees for one turn.
#[derive(Debug, Clone, PartialEq)]
pub struct Snapshot {
    pub messages: Vec<Message>,
    /// How many messages the window left out.
    pub truncated: usize,
}

/// Ordered conversation log. Messages are never edited or removed; windowing
/// only affects snapshots.
#[derive(Debug, Clone, Default)]
pub struct History {
    messages: Vec<Message>,
    issued: HashSet<String>,
    answered: HashSet<String>,
    window: WindowPolicy,
}

impl History {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_window(mut self, window: WindowPolicy) -> Self {
        self.window = window;
        self
    }

    pub fn window(&self) -> WindowPolicy {
        self.window
    }

    /// Append a message. A tool message must answer a call issued earlier
    /// by an assistant message, exactly once.
    pub fn append(&mut self, message: Message) -> Result<(), HistoryError> {
        if message.role == Role::Tool {
            let id = message
                .tool_call_id
                .as_ref()
                .ok_or(HistoryError::MissingToolCallId)?;
            if !self.issued.contains(id) {
                return Err(HistoryError::UnknownToolCall(id.clone()));
            }
            if !self.answered.insert(id.clone()) {
                return Err(HistoryError::DuplicateToolResult(id.clone()));
            }
        }
        for call in &message.tool_calls {
            self.issued.insert(call.id.clone());
        }
        self.messages.push(message);
        Ok(())
    }

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn last(&self) -> Option<&Message> {
        self.messages.last()
    }

    /// Whether an assistant message already issued a call with this id.
    pub fn has_call(&self, id: &str) -> bool {
        self.issued.contains(id)
    }

    /// The most recent assistant message, if any.
    pub fn last_assistant(&self) -> Option<&Message> {
        self.messages.iter().rev().find(|m| m.role == Role::Assistant)
    }

    /// Messages to send to the backend under the window policy.
    ///
    /// Oldest non-system messages are dropped first. System messages, the
    /// most recent user turn and everything after it, and the last
    /// `tail_messages` are always kept. Dropping an assistant message drops
    /// the tool results that answer it, so no kept tool message is orphaned.
    pub fn snapshot(&self) -> Snapshot {
        if !self.window.is_bounded() {
            return Snapshot {
                messages: self.messages.clone(),
                truncated: 0,
            };
        }

        let n = self.messages.len();
        let protected = self.protected_from();
        let mut keep = vec![true; n];
        let mut kept_count = n;
        let mut kept_tokens: usize = self.messages.iter().map(estimate_message_tokens).sum();

        let over = |count: usize, tokens: usize| {
            self.window.max_messages.is_some_and(|max| count > max)
                || self.window.max_tokens.is_some_and(|max| tokens > max)
        };

        for i in 0..protected {
            if !over(kept_count, kept_tokens) {
                break;
            }
            let msg = &self.messages[i];
            if msg.role == Role::System || !keep[i] {
                continue;
            }
            keep[i] = false;
            kept_count -= 1;
            kept_tokens -= estimate_message_tokens(msg);

            if msg.tool_calls.is_empty() {
                continue;
            }
            let ids: HashSet<&str> = msg.tool_calls.iter().map(|c| c.id.as_str()).collect();
            for j in i + 1..protected {
                let answer = &self.messages[j];
                if keep[j]
                    && answer.role == Role::Tool
                    && answer.tool_call_id.as_deref().is_some_and(|id| ids.contains(id))
                {
                    keep[j] = false;
                    kept_count -= 1;
                    kept_tokens -= estimate_message_tokens(answer);
                }
            }
        }

        let messages: Vec<Message> = self
            .messages
            .iter()
            .zip(&keep)
            .filter(|(_, keep)| **keep)
            .map(|(m, _)| m.clone())
            .collect();
        Snapshot {
            truncated: n - messages.len(),
            messages,
        }
    }

    /// Index from which every message is kept.
    fn protected_from(&self) -> usize {
        let n = self.messages.len();
        let last_user = self
            .messages
            .iter()
            .rposition(|m| m.role == Role::User)
            .unwrap_or(n);
        let mut from = last_user.min(n.saturating_sub(self.window.tail_messages));
        // Never start the protected range on a tool result whose call would
        // fall outside it.
        while from > 0 && from < n && self.messages[from].role == Role::Tool {
            from -= 1;
        }
        from
    }
}
