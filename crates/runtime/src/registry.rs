//! Tool discovery and lookup across connected servers.
//!
//! Readers take a cheap snapshot (an `Arc` behind a short lock) and never
//! wait on discovery. Writers (`attach`, `discover`, `invalidate`) serialize
//! on a separate async mutex, build a new catalog, and swap it in whole, so
//! a reader sees either the old tool set or the new one.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, PoisonError, RwLock};

use rpc::{Client, ServerAddress, ServerConfig};
use serde_json::{Map, Value};
use tokio::sync::Mutex as AsyncMutex;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::schema::{Schema, Violation};

/// A tool advertised by a server.
#[derive(Debug, Clone)]
pub struct ToolDescriptor {
    pub name: String,
    pub description: String,
    pub input_schema: Value,
    pub server: ServerAddress,
    schema: Schema,
}

impl ToolDescriptor {
    pub fn new(
        name: impl Into<String>,
        description: impl Into<String>,
        input_schema: Value,
        server: ServerAddress,
    ) -> Self {
        let schema = Schema::compile(&input_schema);
        Self {
            name: name.into(),
            description: description.into(),
            input_schema,
            server,
            schema,
        }
    }

    fn from_tool(tool: rpc::Tool, server: &ServerAddress) -> Self {
        Self::new(
            tool.name,
            tool.description.unwrap_or_default(),
            tool.input_schema,
            server.clone(),
        )
    }
}

#[derive(Default, Clone)]
struct Catalog {
    clients: HashMap<ServerAddress, Arc<Client>>,
    tools: BTreeMap<String, Arc<ToolDescriptor>>,
}

impl Catalog {
    fn without_server(&self, address: &ServerAddress) -> Self {
        let mut next = self.clone();
        next.tools.retain(|_, tool| &tool.server != address);
        next
    }
}

/// Live catalog of tools, keyed by name.
#[derive(Default)]
pub struct Registry {
    current: RwLock<Arc<Catalog>>,
    writer: AsyncMutex<()>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    fn snapshot(&self) -> Arc<Catalog> {
        self.current
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn publish(&self, catalog: Catalog) {
        *self.current.write().unwrap_or_else(PoisonError::into_inner) = Arc::new(catalog);
    }

    /// Open a connection to `config` and discover its tools.
    pub async fn connect(&self, config: &ServerConfig) -> Result<Vec<Arc<ToolDescriptor>>> {
        let client = config.connect()?;
        let address = self.attach(client).await;
        self.discover(&address).await
    }

    /// Register an already-open client without discovering.
    pub async fn attach(&self, client: Client) -> ServerAddress {
        let _guard = self.writer.lock().await;
        let address = client.address().clone();
        let mut next = (*self.snapshot()).clone();
        if next.clients.insert(address.clone(), Arc::new(client)).is_some() {
            debug!(server = %address, "replaced client");
        }
        self.publish(next);
        address
    }

    /// Handshake with a server and replace its tools in the catalog.
    ///
    /// Fails without touching the catalog if the server is unreachable or
    /// advertises a name another server already provides.
    pub async fn discover(&self, address: &ServerAddress) -> Result<Vec<Arc<ToolDescriptor>>> {
        let _guard = self.writer.lock().await;
        let client = self
            .snapshot()
            .clients
            .get(address)
            .cloned()
            .ok_or_else(|| Error::UnknownServer(address.clone()))?;

        let info = client.initialize().await?;
        let tools = client.list_tools().await?;

        let current = self.snapshot();
        let mut next = current.without_server(address);
        let mut added = Vec::with_capacity(tools.len());
        for tool in tools {
            let descriptor = Arc::new(ToolDescriptor::from_tool(tool, address));
            if let Some(existing) = next.tools.get(&descriptor.name) {
                return Err(Error::NameCollision {
                    name: descriptor.name.clone(),
                    first: existing.server.clone(),
                    second: address.clone(),
                });
            }
            next.tools.insert(descriptor.name.clone(), descriptor.clone());
            added.push(descriptor);
        }

        info!(
            server = %address,
            name = info.name().unwrap_or("unknown"),
            tools = added.len(),
            "discovered tools"
        );
        self.publish(next);
        Ok(added)
    }

    /// Rediscover every attached server. Servers that fail keep their
    /// previous tools and are reported back.
    pub async fn refresh_all(&self) -> Vec<(ServerAddress, Error)> {
        let mut addresses: Vec<_> = self.snapshot().clients.keys().cloned().collect();
        addresses.sort();

        let mut failures = Vec::new();
        for address in addresses {
            if let Err(e) = self.discover(&address).await {
                warn!(server = %address, error = %e, "refresh failed");
                failures.push((address, e));
            }
        }
        failures
    }

    /// Drop a server's tools from the catalog. The connection stays attached
    /// so a later `discover` can restore them.
    pub async fn invalidate(&self, address: &ServerAddress) {
        let _guard = self.writer.lock().await;
        let next = self.snapshot().without_server(address);
        self.publish(next);
        debug!(server = %address, "invalidated tools");
    }

    /// Look up a tool by name.
    pub fn resolve(&self, name: &str) -> Result<Arc<ToolDescriptor>> {
        self.snapshot()
            .tools
            .get(name)
            .cloned()
            .ok_or_else(|| Error::ToolNotFound(name.to_string()))
    }

    /// All tools, ordered by name.
    pub fn descriptors(&self) -> Vec<Arc<ToolDescriptor>> {
        self.snapshot().tools.values().cloned().collect()
    }

    /// Client for an attached server.
    pub fn client_for(&self, address: &ServerAddress) -> Option<Arc<Client>> {
        self.snapshot().clients.get(address).cloned()
    }

    /// Check arguments against a descriptor's schema.
    pub fn validate(
        descriptor: &ToolDescriptor,
        arguments: &Map<String, Value>,
    ) -> std::result::Result<(), Vec<Violation>> {
        let violations = descriptor.schema.validate(arguments);
        if violations.is_empty() {
            Ok(())
        } else {
            Err(violations)
        }
    }

    /// Shut down every attached connection.
    pub async fn shutdown(&self) {
        let clients: Vec<_> = self.snapshot().clients.values().cloned().collect();
        for client in clients {
            client.shutdown().await;
        }
    }
}
