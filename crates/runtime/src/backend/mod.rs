//! Reasoning backend abstraction.
//!
//! A backend turns the conversation so far, plus the advertised tools, into
//! one completion: free text and, when the provider supports it, structured
//! tool calls.

mod anthropic;
mod openai;

pub use anthropic::{AnthropicBackend, AnthropicBackendBuilder};
pub use openai::{OpenAiBackend, OpenAiBackendBuilder};

use std::future::Future;
use std::sync::Arc;

use serde_json::Value;
use thiserror::Error;

use crate::registry::ToolDescriptor;
use crate::types::Message;

/// Request to send to a backend.
#[derive(Debug, Clone, Copy)]
pub struct CompletionRequest<'a> {
    pub messages: &'a [Message],
    pub system: Option<&'a str>,
    pub tools: &'a [Arc<ToolDescriptor>],
}

/// A tool call reported in the provider's structured field.
#[derive(Debug, Clone, PartialEq)]
pub struct StructuredCall {
    /// Provider-assigned id, if any.
    pub id: Option<String>,
    pub name: String,
    /// Normally an object. Left as whatever the provider sent so the
    /// extractor can reject malformed calls.
    pub arguments: Value,
}

/// Token usage for a completion.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Usage {
    pub input_tokens: u32,
    pub output_tokens: u32,
}

impl Usage {
    pub fn total_tokens(&self) -> u32 {
        self.input_tokens + self.output_tokens
    }
}

/// One backend turn.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Completion {
    pub content: String,
    pub structured_calls: Vec<StructuredCall>,
    pub usage: Usage,
}

impl Completion {
    /// A text-only completion.
    pub fn text(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            ..Self::default()
        }
    }
}

#[derive(Debug, Error)]
pub enum BackendError {
    #[error("network error: {0}")]
    Network(String),

    #[error("API error {status}: {body}")]
    Api { status: u16, body: String },

    #[error("invalid response: {0}")]
    InvalidResponse(String),
}

impl BackendError {
    /// True when the backend could not be reached or failed server-side,
    /// as opposed to answering with something unusable.
    pub fn is_unreachable(&self) -> bool {
        match self {
            Self::Network(_) => true,
            Self::Api { status, .. } => *status >= 500 || *status == 429,
            Self::InvalidResponse(_) => false,
        }
    }
}

/// Trait for reasoning backends.
pub trait Backend: Send + Sync {
    /// Produce one completion for the conversation so far.
    fn complete(
        &self,
        request: CompletionRequest<'_>,
    ) -> impl Future<Output = Result<Completion, BackendError>> + Send;
}

impl<B: Backend> Backend for Arc<B> {
    fn complete(
        &self,
        request: CompletionRequest<'_>,
    ) -> impl Future<Output = Result<Completion, BackendError>> + Send {
        B::complete(&**self, request)
    }
}

/// Decode a successful JSON body, or turn the status into an error.
pub(crate) async fn read_json<T: serde::de::DeserializeOwned>(
    response: reqwest::Response,
) -> Result<T, BackendError> {
    let status = response.status();
    if !status.is_success() {
        let body = response.text().await.unwrap_or_default();
        return Err(BackendError::Api {
            status: status.as_u16(),
            body,
        });
    }
    response
        .json()
        .await
        .map_err(|e| BackendError::InvalidResponse(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn usage_total_tokens() {
        let usage = Usage {
            input_tokens: 100,
            output_tokens: 50,
        };
        assert_eq!(usage.total_tokens(), 150);
    }

    #[test]
    fn unreachable_classification() {
        assert!(BackendError::Network("refused".into()).is_unreachable());
        assert!(
            BackendError::Api {
                status: 503,
                body: String::new()
            }
            .is_unreachable()
        );
        assert!(
            !BackendError::Api {
                status: 400,
                body: String::new()
            }
            .is_unreachable()
        );
        assert!(!BackendError::InvalidResponse("not json".into()).is_unreachable());
    }
}
