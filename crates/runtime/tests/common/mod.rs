//! Shared fixtures: a scripted backend and an in-process tool server.

#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use rpc::{CallOptions, Client, RetryPolicy, ServerAddress, StreamTransport, Transport};
use runtime::{
    Backend, BackendError, Completion, CompletionRequest, Message, Registry, StructuredCall,
};
use serde_json::{Value, json};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, duplex};

pub type Turn = Result<Completion, BackendError>;

/// Replays canned turns and remembers what it was shown.
#[derive(Default)]
pub struct ScriptedBackend {
    turns: Mutex<VecDeque<Turn>>,
    /// Returned once the script runs out, if set.
    repeat: Option<Completion>,
    seen: Mutex<Vec<Vec<Message>>>,
}

impl ScriptedBackend {
    pub fn new(turns: Vec<Turn>) -> Self {
        Self {
            turns: Mutex::new(turns.into()),
            ..Self::default()
        }
    }

    /// Answer every turn with the same completion.
    pub fn repeating(completion: Completion) -> Self {
        Self {
            repeat: Some(completion),
            ..Self::default()
        }
    }

    pub fn calls(&self) -> usize {
        self.seen.lock().unwrap().len()
    }

    /// Messages sent on each turn.
    pub fn seen(&self) -> Vec<Vec<Message>> {
        self.seen.lock().unwrap().clone()
    }
}

impl Backend for ScriptedBackend {
    async fn complete(&self, request: CompletionRequest<'_>) -> Result<Completion, BackendError> {
        self.seen.lock().unwrap().push(request.messages.to_vec());
        if let Some(turn) = self.turns.lock().unwrap().pop_front() {
            return turn;
        }
        match &self.repeat {
            Some(completion) => Ok(completion.clone()),
            None => Err(BackendError::InvalidResponse("script exhausted".into())),
        }
    }
}

/// A completion carrying structured calls.
pub fn calls(calls: &[(&str, &str, Value)]) -> Completion {
    Completion {
        structured_calls: calls
            .iter()
            .map(|(id, name, arguments)| StructuredCall {
                id: Some(id.to_string()),
                name: name.to_string(),
                arguments: arguments.clone(),
            })
            .collect(),
        ..Completion::default()
    }
}

/// A calculator served over an in-memory pipe.
///
/// `add` sums `a` and `b` after sleeping `delay_ms`; `fail` always answers
/// with a server error. `hits` counts `tools/call` requests received.
pub fn calculator(hits: Arc<AtomicUsize>) -> Client {
    let (client_read, server_write) = duplex(64 * 1024);
    let (server_read, client_write) = duplex(64 * 1024);
    let writer = Arc::new(tokio::sync::Mutex::new(server_write));

    tokio::spawn(async move {
        let mut lines = BufReader::new(server_read).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            let request: Value = serde_json::from_str(&line).unwrap();
            let id = request["id"].clone();
            let params = request["params"].clone();
            let writer = writer.clone();
            let reply = match request["method"].as_str() {
                Some("initialize") => json!({"id": id, "result": {"serverName": "calculator"}}),
                Some("tools/list") => json!({"id": id, "result": {"tools": [
                    {
                        "name": "add",
                        "description": "Add two numbers",
                        "inputSchema": {
                            "type": "object",
                            "properties": {
                                "a": {"type": "number"},
                                "b": {"type": "number"},
                                "delay_ms": {"type": "integer"}
                            },
                            "required": ["a", "b"]
                        }
                    },
                    {"name": "fail", "description": "Always fails", "inputSchema": {"type": "object"}}
                ]}}),
                Some("tools/call") => {
                    hits.fetch_add(1, Ordering::SeqCst);
                    tokio::spawn(async move {
                        let args = &params["arguments"];
                        let delay = args["delay_ms"].as_u64().unwrap_or(0);
                        tokio::time::sleep(Duration::from_millis(delay)).await;
                        let reply = if params["name"] == "fail" {
                            json!({"id": id, "error": {"kind": "tool_error", "message": "division by zero"}})
                        } else {
                            let sum = args["a"].as_f64().unwrap() + args["b"].as_f64().unwrap();
                            json!({"id": id, "result": {"output": sum}})
                        };
                        let mut w = writer.lock().await;
                        w.write_all(format!("{reply}\n").as_bytes()).await.unwrap();
                    });
                    continue;
                }
                _ => continue,
            };
            let mut w = writer.lock().await;
            w.write_all(format!("{reply}\n").as_bytes()).await.unwrap();
        }
    });

    let transport = Transport::Stream(StreamTransport::new("calculator", client_read, client_write));
    let options = CallOptions {
        timeout: Duration::from_secs(5),
        retry: RetryPolicy::none(),
    };
    Client::new(ServerAddress::stdio("calculator"), transport, options)
}

/// A registry with the calculator attached and discovered.
pub async fn registry() -> (Arc<Registry>, Arc<AtomicUsize>) {
    let hits = Arc::new(AtomicUsize::new(0));
    let registry = Arc::new(Registry::new());
    let address = registry.attach(calculator(hits.clone())).await;
    registry.discover(&address).await.unwrap();
    (registry, hits)
}
