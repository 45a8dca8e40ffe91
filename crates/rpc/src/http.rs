//! HTTP binding: the same envelope POSTed as a JSON body to a fixed path.

use std::time::Duration;

use serde_json::Value;

use crate::error::{Error, Result};
use crate::protocol::{self, Incoming, JsonRpcRequest, JsonRpcResponse};

/// Transport that POSTs each envelope to one URL.
pub struct HttpTransport {
    client: reqwest::Client,
    url: String,
}

impl HttpTransport {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            url: url.into(),
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    /// POST a request and decode the response body.
    pub async fn send(&self, request: &JsonRpcRequest, timeout: Duration) -> Result<JsonRpcResponse> {
        let body = self.post(&serde_json::to_value(request)?, timeout).await?;

        match protocol::decode(&body).map_err(Error::InvalidResponse)? {
            Incoming::Response(response) if response.id == request.id => Ok(response),
            Incoming::Response(response) => Err(Error::UnmatchedId(response.id)),
            Incoming::Notification(method) => Err(Error::InvalidResponse(format!(
                "expected a response, got {method}"
            ))),
        }
    }

    /// POST a notification; any response body is ignored.
    pub async fn notify(&self, method: &str, params: Option<Value>, timeout: Duration) -> Result<()> {
        let mut note = serde_json::json!({ "jsonrpc": "2.0", "method": method });
        if let Some(params) = params {
            note["params"] = params;
        }
        self.post(&note, timeout).await.map(|_| ())
    }

    async fn post(&self, body: &Value, timeout: Duration) -> Result<String> {
        let response = self
            .client
            .post(&self.url)
            .timeout(timeout)
            .header("accept", "application/json")
            .json(body)
            .send()
            .await
            .map_err(|e| classify(e, timeout))?;

        let status = response.status();
        let text = response.text().await.map_err(|e| classify(e, timeout))?;
        if !status.is_success() {
            return Err(Error::HttpStatus {
                status: status.as_u16(),
                body: text,
            });
        }
        Ok(text)
    }
}

/// A refused connection never reached the server, so it is safe to retry.
fn classify(e: reqwest::Error, timeout: Duration) -> Error {
    if e.is_timeout() {
        Error::Timeout(timeout)
    } else {
        Error::Connect {
            retryable: e.is_connect(),
            message: e.to_string(),
        }
    }
}
