//! Validated, bounded tool dispatch.

use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use futures::stream;
use serde_json::Value;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::registry::Registry;
use crate::types::{ToolCallDirective, ToolError, ToolResult};

/// Limits for one dispatch phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DispatchLimits {
    /// Calls running at once.
    pub max_in_flight: usize,
    /// Wall-clock bound for the whole phase.
    pub phase_deadline: Duration,
}

impl Default for DispatchLimits {
    fn default() -> Self {
        Self {
            max_in_flight: 4,
            phase_deadline: Duration::from_secs(60),
        }
    }
}

/// Executes directives against the registry's tools.
#[derive(Clone)]
pub struct Dispatcher {
    registry: Arc<Registry>,
    limits: DispatchLimits,
}

enum Interrupted {
    Cancelled,
    DeadlineExceeded,
}

impl Dispatcher {
    pub fn new(registry: Arc<Registry>, limits: DispatchLimits) -> Self {
        Self { registry, limits }
    }

    pub fn limits(&self) -> DispatchLimits {
        self.limits
    }

    /// Run one directive. Every failure comes back as a `ToolResult`.
    ///
    /// Unknown tools and invalid arguments are rejected before anything is
    /// sent to a server.
    pub async fn dispatch(&self, directive: &ToolCallDirective) -> ToolResult {
        let descriptor = match self.registry.resolve(&directive.tool_name) {
            Ok(descriptor) => descriptor,
            Err(_) => {
                debug!(tool = %directive.tool_name, "unknown tool");
                return ToolResult::failure(directive, ToolError::not_found(&directive.tool_name));
            }
        };

        if let Err(violations) = Registry::validate(&descriptor, &directive.arguments) {
            debug!(tool = %directive.tool_name, violations = violations.len(), "invalid arguments");
            return ToolResult::failure(
                directive,
                ToolError::invalid_arguments(&directive.tool_name, violations),
            );
        }

        let Some(client) = self.registry.client_for(&descriptor.server) else {
            return ToolResult::failure(
                directive,
                ToolError::execution(format!("server {} is not connected", descriptor.server), true),
            );
        };

        debug!(tool = %directive.tool_name, call_id = %directive.call_id, "calling tool");
        match client
            .call_tool(&directive.tool_name, Value::Object(directive.arguments.clone()))
            .await
        {
            Ok(output) => ToolResult::success(directive, output),
            Err(e) => {
                warn!(tool = %directive.tool_name, call_id = %directive.call_id, error = %e, "tool call failed");
                ToolResult::failure(directive, ToolError::from_rpc(&e))
            }
        }
    }

    /// Run directives with bounded concurrency under the phase deadline.
    ///
    /// Results come back in directive order regardless of completion order.
    /// Directives still pending when the deadline passes or `cancel` fires
    /// are reported as retryable execution errors; their in-flight requests
    /// are dropped, which cancels them on the wire.
    pub async fn dispatch_all(
        &self,
        directives: &[ToolCallDirective],
        cancel: &CancellationToken,
    ) -> Vec<ToolResult> {
        let deadline = Instant::now() + self.limits.phase_deadline;
        let mut slots: Vec<Option<ToolResult>> = vec![None; directives.len()];

        let mut running = stream::iter(directives.iter().enumerate())
            .map(|(index, directive)| async move { (index, self.dispatch(directive).await) })
            .buffer_unordered(self.limits.max_in_flight.max(1));

        let interrupted = loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break Some(Interrupted::Cancelled),
                _ = tokio::time::sleep_until(deadline) => break Some(Interrupted::DeadlineExceeded),
                next = running.next() => match next {
                    Some((index, result)) => slots[index] = Some(result),
                    None => break None,
                },
            }
        };
        drop(running);

        let reason = match interrupted {
            Some(Interrupted::Cancelled) => "cancelled",
            Some(Interrupted::DeadlineExceeded) => "dispatch deadline exceeded",
            None => "not executed",
        };
        slots
            .into_iter()
            .zip(directives)
            .map(|(slot, directive)| {
                slot.unwrap_or_else(|| ToolResult::failure(directive, ToolError::execution(reason, true)))
            })
            .collect()
    }
}
