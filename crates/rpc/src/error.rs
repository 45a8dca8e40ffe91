//! RPC error types.

use std::time::Duration;

use crate::protocol::{JsonRpcError, RequestId};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("failed to spawn server: {0}")]
    Spawn(std::io::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("connection failed: {message}")]
    Connect { message: String, retryable: bool },

    #[error("server exited unexpectedly")]
    ServerExited,

    #[error("timeout after {0:?} waiting for response")]
    Timeout(Duration),

    #[error("HTTP {status}: {body}")]
    HttpStatus { status: u16, body: String },

    #[error("failed to encode request: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("invalid response: {0}")]
    InvalidResponse(String),

    #[error("response id {0} matches no outstanding request")]
    UnmatchedId(RequestId),

    #[error("output too large: {size} bytes (max {max})")]
    OutputTooLarge { size: usize, max: usize },

    #[error("remote error: {0}")]
    Remote(#[from] JsonRpcError),
}

impl Error {
    /// Connectivity failures and timeouts.
    pub fn is_transport(&self) -> bool {
        matches!(
            self,
            Self::Spawn(_)
                | Self::Io(_)
                | Self::Connect { .. }
                | Self::ServerExited
                | Self::Timeout(_)
                | Self::HttpStatus { .. }
        )
    }

    /// Malformed or uncorrelated responses.
    pub fn is_protocol(&self) -> bool {
        matches!(
            self,
            Self::Encode(_)
                | Self::InvalidResponse(_)
                | Self::UnmatchedId(_)
                | Self::OutputTooLarge { .. }
        )
    }

    /// Whether a non-idempotent call may be attempted again.
    ///
    /// True only when the request provably never reached the server, or the
    /// server itself flagged the failure as transient.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Connect { retryable, .. } => *retryable,
            Self::Remote(e) => e.is_retryable(),
            _ => false,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
