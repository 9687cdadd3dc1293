use agent_core::{SharedTool, ToolRegistry};
use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::{McpConfig, McpServerConfig};
use crate::error::{McpError, Result};
use crate::protocol::{BoxedReader, BoxedWriter, McpCallResult, McpConnection, McpToolInfo};
use crate::tool::McpProxyTool;
use crate::transports::{StdioProcess, StdioTransport};

/// Runtime state for a connected tool server
struct ServerHandle {
    connection: Arc<McpConnection>,
    process: Mutex<Option<StdioProcess>>,
    tools: Vec<McpToolInfo>,
    shutdown: CancellationToken,
    connected_at: DateTime<Utc>,
}

impl ServerHandle {
    fn advertises(&self, tool: &str) -> bool {
        self.tools.iter().any(|info| info.name == tool)
    }

    /// Ready and still answering. A server that rejects `ping` as an
    /// unknown method is alive too.
    async fn is_alive(&self) -> bool {
        if !self.connection.is_ready() {
            return false;
        }
        match self.connection.ping(&self.shutdown).await {
            Ok(()) | Err(McpError::Rpc { .. }) => true,
            Err(e) => {
                debug!("MCP server '{}' failed ping: {}", self.connection.name(), e);
                false
            }
        }
    }

    async fn teardown(&self) {
        self.shutdown.cancel();
        self.connection.close().await;
        if let Some(process) = self.process.lock().await.take() {
            process.shutdown().await;
        }
    }
}

/// Snapshot of one connection for status displays.
#[derive(Debug, Clone)]
pub struct ServerStatus {
    pub name: String,
    pub ready: bool,
    pub tool_count: usize,
    pub connected_at: DateTime<Utc>,
}

/// Owns every tool-server connection, keyed by server name.
pub struct McpClientManager {
    servers: DashMap<String, Arc<ServerHandle>>,
}

impl Default for McpClientManager {
    fn default() -> Self {
        Self::new()
    }
}

impl McpClientManager {
    pub fn new() -> Self {
        Self {
            servers: DashMap::new(),
        }
    }

    /// Spawn the server, run the handshake and record its tools.
    ///
    /// Returns the allowed tools. Connecting a name whose server is still
    /// alive is a no-op returning the existing tools; a dead one is torn
    /// down and replaced.
    pub async fn connect(&self, config: McpServerConfig) -> Result<Vec<McpToolInfo>> {
        config.validate()?;
        if let Some(existing) = self.live_tools(&config.name).await {
            return Ok(existing);
        }

        let (process, reader, writer) = StdioTransport::spawn(&config)?;
        self.attach(config, reader, writer, Some(process)).await
    }

    /// Like [`connect`](Self::connect) over caller-supplied pipes, for
    /// servers reached by something other than a child process.
    pub async fn connect_with_io(
        &self,
        config: McpServerConfig,
        reader: BoxedReader,
        writer: BoxedWriter,
    ) -> Result<Vec<McpToolInfo>> {
        config.validate()?;
        if let Some(existing) = self.live_tools(&config.name).await {
            return Ok(existing);
        }
        self.attach(config, reader, writer, None).await
    }

    async fn live_tools(&self, name: &str) -> Option<Vec<McpToolInfo>> {
        let handle = self.handle(name).ok()?;
        if handle.is_alive().await {
            debug!("MCP server '{}' already connected", name);
            return Some(handle.tools.clone());
        }

        warn!("MCP server '{}' is not responding, reconnecting", name);
        self.servers
            .remove_if(name, |_, current| Arc::ptr_eq(current, &handle));
        handle.teardown().await;
        None
    }

    async fn attach(
        &self,
        config: McpServerConfig,
        reader: BoxedReader,
        writer: BoxedWriter,
        process: Option<StdioProcess>,
    ) -> Result<Vec<McpToolInfo>> {
        let name = config.name.clone();
        let connection = Arc::new(McpConnection::new(
            name.clone(),
            reader,
            writer,
            Duration::from_millis(config.request_timeout_ms),
        ));
        let shutdown = CancellationToken::new();

        let tools = match handshake(&connection, &config, &shutdown).await {
            Ok(tools) => tools,
            Err(e) => {
                error!("MCP server '{}' failed to initialize: {}", name, e);
                connection.close().await;
                if let Some(process) = process {
                    process.shutdown().await;
                }
                return Err(e);
            }
        };

        let handle = Arc::new(ServerHandle {
            connection,
            process: Mutex::new(process),
            tools: tools.clone(),
            shutdown,
            connected_at: Utc::now(),
        });

        // A concurrent connect for the same name may have finished first.
        let mut replaced = None;
        let lost_race = match self.servers.entry(name.clone()) {
            Entry::Occupied(existing) if existing.get().connection.is_ready() => {
                Some(existing.get().tools.clone())
            }
            Entry::Occupied(mut existing) => {
                replaced = Some(existing.insert(Arc::clone(&handle)));
                None
            }
            Entry::Vacant(slot) => {
                slot.insert(Arc::clone(&handle));
                None
            }
        };
        if let Some(stale) = replaced {
            stale.teardown().await;
        }
        if let Some(existing) = lost_race {
            handle.teardown().await;
            return Ok(existing);
        }

        info!("MCP server '{}' ready with {} tools", name, tools.len());
        Ok(tools)
    }

    /// Close the connection and stop the process. Unknown names are ignored.
    pub async fn disconnect(&self, name: &str) -> bool {
        let Some((_, handle)) = self.servers.remove(name) else {
            debug!("MCP server '{}' not connected", name);
            return false;
        };
        info!("Disconnecting MCP server '{}'", name);
        handle.teardown().await;
        true
    }

    pub async fn disconnect_all(&self) {
        for name in self.server_names() {
            self.disconnect(&name).await;
        }
    }

    /// Call a tool by its advertised name on whichever server owns it.
    ///
    /// When two servers advertise the same name the one whose name sorts
    /// first wins.
    pub async fn call_tool(
        &self,
        tool: &str,
        arguments: Value,
        cancel: &CancellationToken,
    ) -> Result<McpCallResult> {
        let owner = self
            .server_names()
            .into_iter()
            .find(|server| {
                self.servers
                    .get(server)
                    .map(|handle| handle.advertises(tool))
                    .unwrap_or(false)
            })
            .ok_or_else(|| McpError::ToolNotFound(tool.to_string()))?;

        self.call_server_tool(&owner, tool, arguments, cancel).await
    }

    pub async fn call_server_tool(
        &self,
        server: &str,
        tool: &str,
        arguments: Value,
        cancel: &CancellationToken,
    ) -> Result<McpCallResult> {
        let handle = self.handle(server)?;
        if !handle.advertises(tool) {
            return Err(McpError::ToolNotFound(format!("{server}/{tool}")));
        }
        handle.connection.call_tool(tool, arguments, cancel).await
    }

    /// Proxy tools for every allowed tool of `server`.
    pub fn tools_for(&self, server: &str) -> Result<Vec<SharedTool>> {
        let handle = self.handle(server)?;
        Ok(handle
            .tools
            .iter()
            .map(|info| {
                Arc::new(McpProxyTool::new(
                    server,
                    info.clone(),
                    Arc::clone(&handle.connection),
                    handle.shutdown.clone(),
                )) as SharedTool
            })
            .collect())
    }

    /// Connect and register the server's tools under its name as source id.
    pub async fn connect_into_registry(
        &self,
        config: McpServerConfig,
        registry: &ToolRegistry,
    ) -> Result<usize> {
        let name = config.name.clone();
        self.connect(config).await?;
        let tools = self.tools_for(&name)?;
        // A reconnected server may no longer offer every tool it used to.
        registry.unregister_from_source(&name);
        Ok(registry.register_from_source(&name, tools))
    }

    /// Unregister the server's tools, then disconnect it.
    pub async fn disconnect_from_registry(&self, name: &str, registry: &ToolRegistry) -> usize {
        let removed = registry.unregister_from_source(name);
        self.disconnect(name).await;
        removed
    }

    /// Connect every enabled server, registering its tools. A server that
    /// fails to start is logged and skipped. Returns the failures.
    pub async fn connect_all(
        &self,
        config: &McpConfig,
        registry: &ToolRegistry,
    ) -> Vec<(String, McpError)> {
        let mut failures = Vec::new();
        for server in config.enabled_servers() {
            match self.connect_into_registry(server.clone(), registry).await {
                Ok(count) => info!("Registered {} tools from MCP server '{}'", count, server.name),
                Err(e) => {
                    warn!("Skipping MCP server '{}': {}", server.name, e);
                    failures.push((server.name.clone(), e));
                }
            }
        }
        failures
    }

    /// Re-register tools of every connected server and drop tools of
    /// servers in `known_sources` that are no longer connected.
    pub fn sync_registry(&self, registry: &ToolRegistry, known_sources: &[String]) {
        for source in known_sources {
            if !self.servers.contains_key(source) {
                registry.unregister_from_source(source);
            }
        }
        for name in self.server_names() {
            if let Ok(tools) = self.tools_for(&name) {
                registry.register_from_source(&name, tools);
            }
        }
    }

    /// Connected server names, sorted.
    pub fn server_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.servers.iter().map(|e| e.key().clone()).collect();
        names.sort();
        names
    }

    pub fn is_ready(&self, server: &str) -> bool {
        self.servers
            .get(server)
            .map(|handle| handle.connection.is_ready())
            .unwrap_or(false)
    }

    pub fn status(&self) -> Vec<ServerStatus> {
        self.server_names()
            .into_iter()
            .filter_map(|name| {
                let handle = self.servers.get(&name)?;
                Some(ServerStatus {
                    ready: handle.connection.is_ready(),
                    tool_count: handle.tools.len(),
                    connected_at: handle.connected_at,
                    name,
                })
            })
            .collect()
    }

    fn handle(&self, server: &str) -> Result<Arc<ServerHandle>> {
        self.servers
            .get(server)
            .map(|handle| Arc::clone(handle.value()))
            .ok_or_else(|| McpError::ServerNotFound(server.to_string()))
    }
}

async fn handshake(
    connection: &McpConnection,
    config: &McpServerConfig,
    cancel: &CancellationToken,
) -> Result<Vec<McpToolInfo>> {
    connection.initialize(cancel).await?;

    let advertised = connection.list_tools(cancel).await?;
    let total = advertised.len();
    let tools: Vec<McpToolInfo> = advertised
        .into_iter()
        .filter(|tool| config.allows_tool(&tool.name))
        .collect();
    if tools.len() < total {
        debug!(
            "MCP server '{}': {} of {} tools filtered by allow/deny lists",
            config.name,
            total - tools.len(),
            total
        );
    }
    Ok(tools)
}

#[cfg(test)]
mod tests {
    use super::*;
    use agent_core::Tool;
    use serde_json::json;
    use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};

    #[derive(Clone, Copy, PartialEq)]
    enum Behaviour {
        Healthy,
        /// Answers the handshake with an error object.
        FailInitialize,
        /// Completes the handshake, then exits on the next request.
        ExitAfterHandshake,
    }

    /// In-memory server advertising `tools`; `tools/call` echoes the tool
    /// name and arguments.
    fn fake_server(tools: &[&str], behaviour: Behaviour) -> (BoxedReader, BoxedWriter) {
        let (client, server) = tokio::io::duplex(64 * 1024);
        let (client_read, client_write) = tokio::io::split(client);
        let (server_read, mut server_write) = tokio::io::split(server);
        let tools: Vec<Value> = tools
            .iter()
            .map(|name| json!({"name": name, "description": format!("{name} tool")}))
            .collect();

        tokio::spawn(async move {
            let mut lines = BufReader::new(server_read).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                let request: Value = serde_json::from_str(&line).unwrap();
                let Some(id) = request.get("id").cloned() else {
                    continue;
                };
                let method = request["method"].as_str().unwrap_or_default();
                if behaviour == Behaviour::ExitAfterHandshake
                    && !matches!(method, "initialize" | "tools/list")
                {
                    break;
                }
                let reply = match request["method"].as_str() {
                    Some("initialize") if behaviour == Behaviour::FailInitialize => json!({
                        "jsonrpc": "2.0", "id": id,
                        "error": {"code": -32603, "message": "boom"}
                    }),
                    Some("initialize") => json!({
                        "jsonrpc": "2.0", "id": id,
                        "result": {"protocolVersion": "2024-11-05", "capabilities": {}}
                    }),
                    Some("tools/list") => json!({
                        "jsonrpc": "2.0", "id": id, "result": {"tools": tools}
                    }),
                    Some("tools/call") => {
                        let text = format!(
                            "{} {}",
                            request["params"]["name"].as_str().unwrap_or_default(),
                            request["params"]["arguments"]
                        );
                        json!({
                            "jsonrpc": "2.0", "id": id,
                            "result": {"content": [{"type": "text", "text": text}]}
                        })
                    }
                    _ => json!({
                        "jsonrpc": "2.0", "id": id,
                        "error": {"code": -32601, "message": "Method not found"}
                    }),
                };
                let line = format!("{reply}\n");
                if server_write.write_all(line.as_bytes()).await.is_err() {
                    break;
                }
            }
        });

        (
            Box::new(BufReader::new(client_read)),
            Box::new(client_write),
        )
    }

    async fn connect_fake(manager: &McpClientManager, config: McpServerConfig, tools: &[&str]) {
        let (reader, writer) = fake_server(tools, Behaviour::Healthy);
        manager.connect_with_io(config, reader, writer).await.unwrap();
    }

    #[tokio::test]
    async fn connect_filters_tools_and_marks_ready() {
        let manager = McpClientManager::new();
        let mut config = McpServerConfig::new("docs", "unused");
        config.denied_tools = vec!["admin".to_string()];

        let (reader, writer) = fake_server(&["search", "admin"], Behaviour::Healthy);
        let tools = manager.connect_with_io(config, reader, writer).await.unwrap();

        let names: Vec<_> = tools.iter().map(|t| t.name.as_str()).collect();
        assert_eq!(names, vec!["search"]);
        assert!(manager.is_ready("docs"));
        assert_eq!(manager.server_names(), vec!["docs"]);
    }

    #[tokio::test]
    async fn connecting_twice_is_a_noop() {
        let manager = McpClientManager::new();
        connect_fake(&manager, McpServerConfig::new("docs", "unused"), &["search"]).await;

        // A second handshake would fail; the existing connection is reused.
        let (reader, writer) = fake_server(&[], Behaviour::FailInitialize);
        let tools = manager
            .connect_with_io(McpServerConfig::new("docs", "unused"), reader, writer)
            .await
            .unwrap();
        assert_eq!(tools.len(), 1);
        assert!(manager.is_ready("docs"));
    }

    #[tokio::test]
    async fn connect_replaces_a_server_that_died() {
        let manager = McpClientManager::new();
        let cancel = CancellationToken::new();
        let (reader, writer) = fake_server(&["search"], Behaviour::ExitAfterHandshake);
        manager
            .connect_with_io(McpServerConfig::new("docs", "unused"), reader, writer)
            .await
            .unwrap();

        assert!(manager.call_tool("search", json!({}), &cancel).await.is_err());
        assert!(!manager.is_ready("docs"));

        let (reader, writer) = fake_server(&["search", "fetch"], Behaviour::Healthy);
        let tools = manager
            .connect_with_io(McpServerConfig::new("docs", "unused"), reader, writer)
            .await
            .unwrap();
        assert_eq!(tools.len(), 2);
        assert!(manager.is_ready("docs"));

        let result = manager.call_tool("fetch", json!({}), &cancel).await.unwrap();
        assert_eq!(result.text, "fetch {}");
    }

    #[tokio::test]
    async fn connect_pings_before_reusing_a_connection() {
        let manager = McpClientManager::new();
        let (reader, writer) = fake_server(&["search"], Behaviour::ExitAfterHandshake);
        manager
            .connect_with_io(McpServerConfig::new("docs", "unused"), reader, writer)
            .await
            .unwrap();
        // Still marked ready: nothing has talked to the server since it exited.
        assert!(manager.is_ready("docs"));

        let (reader, writer) = fake_server(&["search", "fetch"], Behaviour::Healthy);
        let tools = manager
            .connect_with_io(McpServerConfig::new("docs", "unused"), reader, writer)
            .await
            .unwrap();

        assert_eq!(tools.len(), 2);
        assert!(manager.is_ready("docs"));
        assert_eq!(manager.server_names(), vec!["docs"]);
    }

    #[tokio::test]
    async fn failed_handshake_leaves_nothing_behind() {
        let manager = McpClientManager::new();
        let (reader, writer) = fake_server(&["search"], Behaviour::FailInitialize);

        let result = manager
            .connect_with_io(McpServerConfig::new("docs", "unused"), reader, writer)
            .await;
        assert!(matches!(result, Err(McpError::Rpc { code: -32603, .. })));
        assert!(manager.server_names().is_empty());
    }

    #[tokio::test]
    async fn call_tool_routes_by_advertised_name() {
        let manager = McpClientManager::new();
        connect_fake(&manager, McpServerConfig::new("alpha", "unused"), &["shared", "a_only"]).await;
        connect_fake(&manager, McpServerConfig::new("beta", "unused"), &["shared", "b_only"]).await;
        let cancel = CancellationToken::new();

        let result = manager.call_tool("b_only", json!({"x": 1}), &cancel).await.unwrap();
        assert_eq!(result.text, r#"b_only {"x":1}"#);

        let result = manager.call_tool("shared", json!({}), &cancel).await.unwrap();
        assert_eq!(result.text, "shared {}");

        assert!(matches!(
            manager.call_tool("missing", json!({}), &cancel).await,
            Err(McpError::ToolNotFound(_))
        ));
        assert!(matches!(
            manager.call_server_tool("gamma", "shared", json!({}), &cancel).await,
            Err(McpError::ServerNotFound(_))
        ));
    }

    #[tokio::test]
    async fn registry_round_trip_by_source() {
        let manager = McpClientManager::new();
        let registry = ToolRegistry::new();
        connect_fake(&manager, McpServerConfig::new("docs", "unused"), &["search", "fetch"]).await;
        connect_fake(&manager, McpServerConfig::new("ops", "unused"), &["restart"]).await;

        for server in manager.server_names() {
            registry.register_from_source(&server, manager.tools_for(&server).unwrap());
        }
        assert_eq!(registry.list_tool_names(), vec!["fetch", "restart", "search"]);

        let call = agent_core::ToolCall::new("c1", "search", r#"{"q":"pods"}"#);
        let result = registry.execute(&call).await;
        assert_eq!(result.content, r#"search {"q":"pods"}"#);

        assert_eq!(manager.disconnect_from_registry("docs", &registry).await, 2);
        assert_eq!(registry.list_tool_names(), vec!["restart"]);
        assert!(!manager.is_ready("docs"));
    }

    #[tokio::test]
    async fn sync_registry_drops_disconnected_sources() {
        let manager = McpClientManager::new();
        let registry = ToolRegistry::new();
        connect_fake(&manager, McpServerConfig::new("docs", "unused"), &["search"]).await;
        manager.sync_registry(&registry, &[]);
        assert!(registry.contains("search"));

        manager.disconnect("docs").await;
        manager.sync_registry(&registry, &["docs".to_string()]);
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn disconnect_tolerates_unknown_server() {
        let manager = McpClientManager::new();
        assert!(!manager.disconnect("nope").await);

        connect_fake(&manager, McpServerConfig::new("a", "unused"), &["t"]).await;
        connect_fake(&manager, McpServerConfig::new("b", "unused"), &["u"]).await;
        manager.disconnect_all().await;
        assert!(manager.server_names().is_empty());
        assert!(manager.status().is_empty());
    }

    #[tokio::test]
    async fn proxy_fails_after_disconnect() {
        let manager = McpClientManager::new();
        connect_fake(&manager, McpServerConfig::new("docs", "unused"), &["search"]).await;
        let tool = manager.tools_for("docs").unwrap().remove(0);

        manager.disconnect("docs").await;
        assert!(tool.execute(json!({})).await.is_err());
    }

    #[tokio::test]
    async fn connect_all_skips_failing_servers() {
        let manager = McpClientManager::new();
        let registry = ToolRegistry::new();
        let config = McpConfig {
            servers: vec![McpServerConfig::new("broken", "/nonexistent/mcp-server")],
        };

        let failures = manager.connect_all(&config, &registry).await;
        assert_eq!(failures.len(), 1);
        assert_eq!(failures[0].0, "broken");
        assert!(registry.is_empty());
    }
}
