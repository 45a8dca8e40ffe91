//! Line-delimited binding: one JSON envelope per line over a byte stream.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use serde_json::Value;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::process::Child;
use tokio::sync::{Mutex as AsyncMutex, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::protocol::{self, Incoming, JsonRpcRequest, JsonRpcResponse, RequestId};

/// Maximum size of a single received line (1MB).
/// Sized for large tool outputs (file reads, search results).
pub const MAX_LINE_SIZE: usize = 1024 * 1024;

/// Abandoned ids remembered so their late responses are dropped quietly.
const ABANDONED_CAPACITY: usize = 1024;

type Writer = Arc<AsyncMutex<Box<dyn AsyncWrite + Send + Unpin>>>;
type Waiter = oneshot::Sender<Result<JsonRpcResponse>>;

#[derive(Default)]
struct Pending {
    waiters: HashMap<RequestId, Waiter>,
    abandoned: HashSet<RequestId>,
    closed: bool,
}

#[derive(Clone, Default)]
struct Shared(Arc<Mutex<Pending>>);

impl Shared {
    fn lock(&self) -> MutexGuard<'_, Pending> {
        self.0.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Transport over any async byte stream pair, usually a child's stdio.
///
/// A reader task owns the receive half and routes each response to the
/// request with the same id, so concurrent calls share one stream.
pub struct StreamTransport {
    label: String,
    writer: Writer,
    pending: Shared,
    reader: JoinHandle<()>,
    child: Option<AsyncMutex<Child>>,
}

impl StreamTransport {
    /// Wrap a reader/writer pair.
    pub fn new<R, W>(label: impl Into<String>, reader: R, writer: W) -> Self
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        let label = label.into();
        let pending = Shared::default();
        let reader = tokio::spawn(read_loop(
            BufReader::new(reader),
            pending.clone(),
            label.clone(),
        ));

        Self {
            label,
            writer: Arc::new(AsyncMutex::new(Box::new(writer))),
            pending,
            reader,
            child: None,
        }
    }

    /// Take ownership of a spawned child whose stdio is already piped.
    pub fn from_child(label: impl Into<String>, mut child: Child) -> Result<Self> {
        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| Error::Spawn(std::io::Error::other("failed to capture stdin")))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| Error::Spawn(std::io::Error::other("failed to capture stdout")))?;

        let mut transport = Self::new(label, stdout, stdin);
        transport.child = Some(AsyncMutex::new(child));
        Ok(transport)
    }

    /// Send a request and wait for its correlated response.
    pub async fn send(&self, request: &JsonRpcRequest, timeout: Duration) -> Result<JsonRpcResponse> {
        let (tx, rx) = oneshot::channel();
        {
            let mut pending = self.pending.lock();
            if pending.closed {
                return Err(Error::ServerExited);
            }
            pending.waiters.insert(request.id.clone(), tx);
        }

        let mut guard = InFlight {
            id: request.id.clone(),
            pending: self.pending.clone(),
            writer: self.writer.clone(),
            notify_cancel: false,
            armed: true,
        };

        let line = serde_json::to_string(request)?;
        // The deadline covers the write too: a server that stops reading
        // its input must not stall the caller.
        let exchange = async {
            write_line(&self.writer, &line).await?;
            guard.notify_cancel = true;
            rx.await.map_err(|_| Error::ServerExited)?
        };

        let response = match tokio::time::timeout(timeout, exchange).await {
            Err(_) => {
                warn!(server = %self.label, id = %request.id, method = %request.method, "request timed out");
                return Err(Error::Timeout(timeout));
            }
            Ok(result) => result?,
        };

        guard.armed = false;
        Ok(response)
    }

    /// Send a notification (no id, no response).
    pub async fn notify(&self, method: &str, params: Option<Value>) -> Result<()> {
        let line = serde_json::to_string(&notification(method, params))?;
        write_line(&self.writer, &line).await
    }

    /// Check if the reader is still attached to a live stream.
    pub fn is_open(&self) -> bool {
        !self.pending.lock().closed
    }

    /// Kill the child process, if this transport owns one.
    pub async fn shutdown(&self) {
        let _ = self.notify("shutdown", None).await;
        if let Some(child) = &self.child {
            let _ = child.lock().await.kill().await;
        }
        self.reader.abort();
    }
}

impl Drop for StreamTransport {
    fn drop(&mut self) {
        self.reader.abort();
    }
}

/// Removes the pending entry of a request that did not complete, and tells
/// the server it may stop working on it.
struct InFlight {
    id: RequestId,
    pending: Shared,
    writer: Writer,
    notify_cancel: bool,
    armed: bool,
}

impl Drop for InFlight {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }

        {
            let mut pending = self.pending.lock();
            pending.waiters.remove(&self.id);
            if pending.abandoned.len() >= ABANDONED_CAPACITY {
                pending.abandoned.clear();
            }
            pending.abandoned.insert(self.id.clone());
        }

        if !self.notify_cancel {
            return;
        }
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            return;
        };
        let params = serde_json::json!({ "requestId": self.id, "reason": "cancelled by client" });
        let writer = self.writer.clone();
        handle.spawn(async move {
            if let Ok(line) = serde_json::to_string(&notification("notifications/cancelled", Some(params))) {
                let _ = write_line(&writer, &line).await;
            }
        });
    }
}

fn notification(method: &str, params: Option<Value>) -> Value {
    // Notifications have no ID
    let mut note = serde_json::json!({ "jsonrpc": "2.0", "method": method });
    if let Some(params) = params {
        note["params"] = params;
    }
    note
}

async fn write_line(writer: &Writer, line: &str) -> Result<()> {
    let mut writer = writer.lock().await;
    writer.write_all(line.as_bytes()).await?;
    writer.write_all(b"\n").await?;
    writer.flush().await?;
    Ok(())
}

/// Read one newline-terminated line into `buf`, keeping at most `max`
/// bytes of it. Returns the full length of the line including the
/// terminator, or 0 at end of stream. Bytes past `max` are discarded as
/// they arrive, so an oversized line never grows the buffer.
async fn read_bounded_line<R>(reader: &mut R, buf: &mut Vec<u8>, max: usize) -> std::io::Result<usize>
where
    R: AsyncBufRead + Unpin,
{
    buf.clear();
    let mut total = 0;
    loop {
        let (used, done) = {
            let available = reader.fill_buf().await?;
            if available.is_empty() {
                return Ok(total);
            }
            let (chunk, done) = match available.iter().position(|&b| b == b'\n') {
                Some(i) => (&available[..=i], true),
                None => (available, false),
            };
            if total + chunk.len() <= max {
                buf.extend_from_slice(chunk);
            } else {
                buf.clear();
            }
            (chunk.len(), done)
        };
        reader.consume(used);
        total += used;
        if done {
            return Ok(total);
        }
    }
}

async fn read_loop<R>(mut reader: R, pending: Shared, label: String)
where
    R: AsyncBufRead + Unpin,
{
    let mut buf = Vec::new();
    loop {
        let size = match read_bounded_line(&mut reader, &mut buf, MAX_LINE_SIZE).await {
            Ok(0) => break,
            Ok(size) => size,
            Err(e) => {
                warn!(server = %label, error = %e, "read failed");
                break;
            }
        };

        if size > MAX_LINE_SIZE {
            fail_sole(
                &pending,
                &label,
                Error::OutputTooLarge {
                    size,
                    max: MAX_LINE_SIZE,
                },
            );
            continue;
        }

        let line = match std::str::from_utf8(&buf) {
            Ok(line) => line,
            Err(e) => {
                fail_sole(&pending, &label, Error::InvalidResponse(format!("invalid UTF-8: {e}")));
                continue;
            }
        };

        let text = line.trim();
        if text.is_empty() {
            continue;
        }

        match protocol::decode(text) {
            Ok(Incoming::Response(response)) => route(&pending, &label, response),
            Ok(Incoming::Notification(method)) => {
                debug!(server = %label, %method, "ignoring server notification");
            }
            Err(reason) => fail_sole(&pending, &label, Error::InvalidResponse(reason)),
        }
    }

    debug!(server = %label, "stream closed");
    let waiters = {
        let mut pending = pending.lock();
        pending.closed = true;
        std::mem::take(&mut pending.waiters)
    };
    for (_, waiter) in waiters {
        let _ = waiter.send(Err(Error::ServerExited));
    }
}

fn route(pending: &Shared, label: &str, response: JsonRpcResponse) {
    let waiter = {
        let mut pending = pending.lock();
        if pending.abandoned.remove(&response.id) {
            debug!(server = %label, id = %response.id, "dropping response to abandoned request");
            return;
        }
        pending.waiters.remove(&response.id)
    };

    match waiter {
        Some(waiter) => {
            let _ = waiter.send(Ok(response));
        }
        None => fail_sole(pending, label, Error::UnmatchedId(response.id)),
    }
}

/// A bad line can only be attributed when exactly one request is in flight.
fn fail_sole(pending: &Shared, label: &str, error: Error) {
    let waiter = {
        let mut pending = pending.lock();
        if pending.waiters.len() == 1 {
            let id = pending.waiters.keys().next().cloned();
            id.and_then(|id| pending.waiters.remove(&id))
        } else {
            None
        }
    };

    match waiter {
        Some(waiter) => {
            let _ = waiter.send(Err(error));
        }
        None => warn!(server = %label, %error, "protocol violation"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, DuplexStream, duplex};

    const TIMEOUT: Duration = Duration::from_secs(5);

    /// Returns the transport plus the server's ends of both pipes.
    fn pipe() -> (StreamTransport, BufReader<DuplexStream>, DuplexStream) {
        let (client_read, server_write) = duplex(64 * 1024);
        let (server_read, client_write) = duplex(64 * 1024);
        let transport = StreamTransport::new("test", client_read, client_write);
        (transport, BufReader::new(server_read), server_write)
    }

    async fn next_request(reader: &mut BufReader<DuplexStream>) -> Value {
        let mut line = String::new();
        reader.read_line(&mut line).await.unwrap();
        serde_json::from_str(&line).unwrap()
    }

    async fn reply(writer: &mut DuplexStream, value: Value) {
        let line = format!("{value}\n");
        writer.write_all(line.as_bytes()).await.unwrap();
    }

    #[tokio::test]
    async fn correlates_out_of_order_responses() {
        let (transport, mut server_in, mut server_out) = pipe();
        let transport = Arc::new(transport);

        let first = {
            let t = transport.clone();
            tokio::spawn(async move { t.send(&JsonRpcRequest::new(1i64, "a"), TIMEOUT).await })
        };
        let req1 = next_request(&mut server_in).await;
        let second = {
            let t = transport.clone();
            tokio::spawn(async move { t.send(&JsonRpcRequest::new(2i64, "b"), TIMEOUT).await })
        };
        let req2 = next_request(&mut server_in).await;
        assert_eq!(req1["method"], "a");
        assert_eq!(req2["method"], "b");

        reply(&mut server_out, json!({"id": 2, "result": "second"})).await;
        reply(&mut server_out, json!({"id": 1, "result": "first"})).await;

        let first = first.await.unwrap().unwrap();
        let second = second.await.unwrap().unwrap();
        assert_eq!(first.result, Some(json!("first")));
        assert_eq!(second.result, Some(json!("second")));
    }

    #[tokio::test]
    async fn unmatched_id_fails_sole_request() {
        let (transport, mut server_in, mut server_out) = pipe();
        let call = tokio::spawn(async move {
            transport.send(&JsonRpcRequest::new(1i64, "a"), TIMEOUT).await
        });
        next_request(&mut server_in).await;
        reply(&mut server_out, json!({"id": 99, "result": null})).await;

        let err = call.await.unwrap().unwrap_err();
        assert!(matches!(err, Error::UnmatchedId(RequestId::Number(99))));
        assert!(err.is_protocol());
    }

    #[tokio::test]
    async fn malformed_line_fails_sole_request() {
        let (transport, mut server_in, mut server_out) = pipe();
        let call = tokio::spawn(async move {
            transport.send(&JsonRpcRequest::new(1i64, "a"), TIMEOUT).await
        });
        next_request(&mut server_in).await;
        server_out.write_all(b"{not json\n").await.unwrap();

        let err = call.await.unwrap().unwrap_err();
        assert!(matches!(err, Error::InvalidResponse(_)));
    }

    #[tokio::test]
    async fn invalid_utf8_fails_sole_request_and_keeps_stream() {
        let (transport, mut server_in, mut server_out) = pipe();
        let transport = Arc::new(transport);
        let call = {
            let t = transport.clone();
            tokio::spawn(async move { t.send(&JsonRpcRequest::new(1i64, "a"), TIMEOUT).await })
        };
        next_request(&mut server_in).await;
        server_out.write_all(b"\xff\xfe garbage\n").await.unwrap();

        let err = call.await.unwrap().unwrap_err();
        assert!(matches!(err, Error::InvalidResponse(_)));
        assert!(err.is_protocol());
        assert!(transport.is_open());

        let call = {
            let t = transport.clone();
            tokio::spawn(async move { t.send(&JsonRpcRequest::new(2i64, "b"), TIMEOUT).await })
        };
        next_request(&mut server_in).await;
        reply(&mut server_out, json!({"id": 2, "result": "ok"})).await;
        let response = call.await.unwrap().unwrap();
        assert_eq!(response.result, Some(json!("ok")));
    }

    #[tokio::test]
    async fn oversized_line_is_rejected_and_skipped() {
        let (transport, mut server_in, mut server_out) = pipe();
        let transport = Arc::new(transport);
        let call = {
            let t = transport.clone();
            tokio::spawn(async move { t.send(&JsonRpcRequest::new(1i64, "a"), TIMEOUT).await })
        };
        next_request(&mut server_in).await;

        let mut huge = vec![b'x'; MAX_LINE_SIZE + 512 * 1024];
        huge.push(b'\n');
        server_out.write_all(&huge).await.unwrap();

        let err = call.await.unwrap().unwrap_err();
        match err {
            Error::OutputTooLarge { size, max } => {
                assert_eq!(max, MAX_LINE_SIZE);
                assert_eq!(size, huge.len());
            }
            other => panic!("expected OutputTooLarge, got {other:?}"),
        }
        assert!(transport.is_open());

        let call = {
            let t = transport.clone();
            tokio::spawn(async move { t.send(&JsonRpcRequest::new(2i64, "b"), TIMEOUT).await })
        };
        next_request(&mut server_in).await;
        reply(&mut server_out, json!({"id": 2, "result": "ok"})).await;
        let response = call.await.unwrap().unwrap();
        assert_eq!(response.result, Some(json!("ok")));
    }

    #[tokio::test]
    async fn bounded_line_reader_discards_overflow() {
        let input: &[u8] = b"0123456789\nok\n";
        let mut reader = BufReader::with_capacity(4, input);
        let mut buf = Vec::new();

        let size = read_bounded_line(&mut reader, &mut buf, 5).await.unwrap();
        assert_eq!(size, 11);
        assert!(buf.len() <= 5);

        let size = read_bounded_line(&mut reader, &mut buf, 5).await.unwrap();
        assert_eq!(size, 3);
        assert_eq!(buf, b"ok\n");

        assert_eq!(read_bounded_line(&mut reader, &mut buf, 5).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn timeout_covers_a_stalled_write() {
        // The server never reads, so the 64-byte pipe fills and the write blocks.
        let (client_read, _server_write) = duplex(64);
        let (_server_read, client_write) = duplex(64);
        let transport = StreamTransport::new("stalled", client_read, client_write);

        let request = JsonRpcRequest::new(1i64, "big").with_params(json!({"blob": "x".repeat(4096)}));
        let result = tokio::time::timeout(
            Duration::from_secs(2),
            transport.send(&request, Duration::from_millis(50)),
        )
        .await
        .expect("send must honour its own timeout");

        assert!(matches!(result, Err(Error::Timeout(_))));
        assert!(transport.is_open());
    }

    #[tokio::test]
    async fn notifications_are_skipped() {
        let (transport, mut server_in, mut server_out) = pipe();
        let call = tokio::spawn(async move {
            transport.send(&JsonRpcRequest::new(5i64, "a"), TIMEOUT).await
        });
        next_request(&mut server_in).await;
        reply(&mut server_out, json!({"jsonrpc": "2.0", "method": "notifications/message"})).await;
        reply(&mut server_out, json!({"jsonrpc": "2.0", "id": 5, "result": {"ok": true}})).await;

        let response = call.await.unwrap().unwrap();
        assert_eq!(response.result, Some(json!({"ok": true})));
    }

    #[tokio::test]
    async fn closed_stream_fails_pending_and_later_requests() {
        let (transport, mut server_in, server_out) = pipe();
        let transport = Arc::new(transport);
        let call = {
            let t = transport.clone();
            tokio::spawn(async move { t.send(&JsonRpcRequest::new(1i64, "a"), TIMEOUT).await })
        };
        next_request(&mut server_in).await;
        drop(server_out);

        let err = call.await.unwrap().unwrap_err();
        assert!(matches!(err, Error::ServerExited));
        assert!(!transport.is_open());

        let err = transport
            .send(&JsonRpcRequest::new(2i64, "b"), TIMEOUT)
            .await
            .unwrap_err();
        assert!(err.is_transport());
    }

    #[tokio::test]
    async fn timeout_abandons_request_and_sends_cancellation() {
        let (transport, mut server_in, mut server_out) = pipe();
        let err = transport
            .send(&JsonRpcRequest::new(1i64, "slow"), Duration::from_millis(50))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Timeout(_)));

        let request = next_request(&mut server_in).await;
        assert_eq!(request["id"], 1);
        let cancel = next_request(&mut server_in).await;
        assert_eq!(cancel["method"], "notifications/cancelled");
        assert_eq!(cancel["params"]["requestId"], 1);

        // The late answer is dropped; the next request still correlates.
        let transport = Arc::new(transport);
        let call = {
            let t = transport.clone();
            tokio::spawn(async move { t.send(&JsonRpcRequest::new(2i64, "b"), TIMEOUT).await })
        };
        next_request(&mut server_in).await;
        reply(&mut server_out, json!({"id": 1, "result": "late"})).await;
        reply(&mut server_out, json!({"id": 2, "result": "fresh"})).await;
        let response = call.await.unwrap().unwrap();
        assert_eq!(response.result, Some(json!("fresh")));
    }
}
