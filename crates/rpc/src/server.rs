//! Tool server configuration and connection setup.

use std::collections::HashMap;
use std::process::Stdio;

use tokio::process::Command;
use tracing::info;

use crate::client::{CallOptions, Client, Transport};
use crate::error::{Error, Result};
use crate::http::HttpTransport;
use crate::stream::StreamTransport;

/// Identifies a tool server endpoint.
///
/// HTTP servers are addressed by URL; child-process servers by
/// `stdio://<name>`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ServerAddress(String);

impl ServerAddress {
    pub fn new(address: impl Into<String>) -> Self {
        Self(address.into())
    }

    pub fn stdio(name: &str) -> Self {
        Self(format!("stdio://{name}"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for ServerAddress {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// How to reach a tool server.
#[derive(Debug, Clone)]
pub enum Endpoint {
    /// Spawn a process and speak line-delimited envelopes over its stdio.
    Command {
        command: String,
        args: Vec<String>,
        env: HashMap<String, String>,
    },
    /// POST envelopes to this URL.
    Http { url: String },
}

/// Configuration for a tool server.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub name: String,
    pub endpoint: Endpoint,
    pub options: CallOptions,
}

impl ServerConfig {
    pub fn address(&self) -> ServerAddress {
        match &self.endpoint {
            Endpoint::Command { .. } => ServerAddress::stdio(&self.name),
            Endpoint::Http { url } => ServerAddress::new(url.clone()),
        }
    }

    /// Open the connection. No protocol traffic is exchanged yet.
    pub fn connect(&self) -> Result<Client> {
        let address = self.address();
        let transport = match &self.endpoint {
            Endpoint::Command { command, args, env } => {
                let child = Command::new(command)
                    .args(args)
                    .envs(env)
                    .stdin(Stdio::piped())
                    .stdout(Stdio::piped())
                    .stderr(Stdio::inherit())
                    .kill_on_drop(true)
                    .spawn()
                    .map_err(Error::Spawn)?;
                info!(server = %self.name, %command, "spawned tool server");
                Transport::Stream(StreamTransport::from_child(self.name.clone(), child)?)
            }
            Endpoint::Http { url } => Transport::Http(HttpTransport::new(url.clone())),
        };
        Ok(Client::new(address, transport, self.options))
    }
}
