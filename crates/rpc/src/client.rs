//! Correlating client with per-call timeouts and bounded retries.

use std::future::Future;
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::Duration;

use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio::sync::OnceCell;
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::http::HttpTransport;
use crate::protocol::{
    CallToolParams, CallToolResult, InitializeParams, InitializeResult, JsonRpcRequest,
    ListToolsResult, RequestId, Tool,
};
use crate::server::ServerAddress;
use crate::stream::StreamTransport;

/// Default timeout for a single RPC call.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(15);

/// The two wire bindings. Semantically equivalent; only framing differs.
pub enum Transport {
    Stream(StreamTransport),
    Http(HttpTransport),
}

impl Transport {
    async fn send(&self, request: &JsonRpcRequest, timeout: Duration) -> Result<Value> {
        let response = match self {
            Self::Stream(t) => t.send(request, timeout).await?,
            Self::Http(t) => t.send(request, timeout).await?,
        };
        Ok(response.into_result()?)
    }

    async fn notify(&self, method: &str, params: Option<Value>, timeout: Duration) -> Result<()> {
        match self {
            Self::Stream(t) => t.notify(method, params).await,
            Self::Http(t) => t.notify(method, params, timeout).await,
        }
    }
}

/// Exponential backoff for retried calls.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts including the first one.
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_secs(2),
        }
    }
}

impl RetryPolicy {
    /// Never retry.
    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            ..Self::default()
        }
    }

    /// Delay before attempt `attempt + 1`, where `attempt` starts at 1.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
        self.initial_backoff
            .saturating_mul(factor)
            .min(self.max_backoff)
    }
}

/// Per-client call options.
#[derive(Debug, Clone, Copy)]
pub struct CallOptions {
    pub timeout: Duration,
    pub retry: RetryPolicy,
}

impl Default for CallOptions {
    fn default() -> Self {
        Self {
            timeout: DEFAULT_TIMEOUT,
            retry: RetryPolicy::default(),
        }
    }
}

/// Handle to one tool server.
pub struct Client {
    address: ServerAddress,
    transport: Transport,
    options: CallOptions,
    next_id: AtomicI64,
    server_info: OnceCell<InitializeResult>,
}

impl Client {
    pub fn new(address: ServerAddress, transport: Transport, options: CallOptions) -> Self {
        Self {
            address,
            transport,
            options,
            next_id: AtomicI64::new(1),
            server_info: OnceCell::new(),
        }
    }

    pub fn address(&self) -> &ServerAddress {
        &self.address
    }

    pub fn options(&self) -> CallOptions {
        self.options
    }

    /// Server summary from the last successful handshake.
    pub fn server_info(&self) -> Option<&InitializeResult> {
        self.server_info.get()
    }

    /// Single attempt: send `method` with `params` and return the raw result.
    pub async fn send(&self, method: &str, params: Value) -> Result<Value> {
        let id = self.next_request_id();
        let request = JsonRpcRequest::new(id.clone(), method).with_params(params);
        debug!(server = %self.address, %id, method, "sending request");
        self.transport.send(&request, self.options.timeout).await
    }

    /// Handshake. Idempotent, so retried on any transport failure.
    pub async fn initialize(&self) -> Result<InitializeResult> {
        let params = to_params(InitializeParams::default())?;
        let result: InitializeResult = self
            .with_retry("initialize", Error::is_transport, || {
                self.request("initialize", params.clone())
            })
            .await?;

        // Send initialized notification
        if let Err(e) = self
            .transport
            .notify("notifications/initialized", None, self.options.timeout)
            .await
        {
            debug!(server = %self.address, error = %e, "initialized notification failed");
        }

        let _ = self.server_info.set(result.clone());
        Ok(result)
    }

    /// List the server's tools. Idempotent, so retried on any transport failure.
    pub async fn list_tools(&self) -> Result<Vec<Tool>> {
        let result: ListToolsResult = self
            .with_retry("tools/list", Error::is_transport, || {
                self.request("tools/list", Value::Object(Default::default()))
            })
            .await?;
        Ok(result.tools)
    }

    /// Invoke a tool.
    ///
    /// Retried only when the failure is known to be retryable; each attempt
    /// carries a fresh correlation id. At-most-once execution is not
    /// guaranteed across retries unless the tool itself is idempotent.
    pub async fn call_tool(&self, name: &str, arguments: Value) -> Result<Value> {
        let params = to_params(CallToolParams {
            name: name.to_string(),
            arguments,
        })?;
        let result: CallToolResult = self
            .with_retry("tools/call", Error::is_retryable, || {
                self.request("tools/call", params.clone())
            })
            .await?;
        Ok(result.into_output()?)
    }

    /// Best-effort shutdown of the underlying connection.
    pub async fn shutdown(&self) {
        if let Transport::Stream(t) = &self.transport {
            t.shutdown().await;
        }
    }

    // --- Internal methods ---

    fn next_request_id(&self) -> RequestId {
        RequestId::Number(self.next_id.fetch_add(1, Ordering::SeqCst))
    }

    async fn request<R: DeserializeOwned>(&self, method: &str, params: Value) -> Result<R> {
        let value = self.send(method, params).await?;
        serde_json::from_value(value)
            .map_err(|e| Error::InvalidResponse(format!("{method} result: {e}")))
    }

    async fn with_retry<T, F, Fut>(
        &self,
        method: &str,
        should_retry: fn(&Error) -> bool,
        mut attempt_fn: F,
    ) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let policy = self.options.retry;
        let mut attempt = 1;
        loop {
            match attempt_fn().await {
                Ok(value) => return Ok(value),
                Err(e) if attempt < policy.max_attempts && should_retry(&e) => {
                    let delay = policy.backoff(attempt);
                    warn!(
                        server = %self.address,
                        method,
                        attempt,
                        error = %e,
                        "retrying in {delay:?}"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

fn to_params(params: impl Serialize) -> Result<Value> {
    Ok(serde_json::to_value(params)?)
}
