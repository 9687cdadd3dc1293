//! JSON-RPC 2.0 client for subprocess tool servers.
//!
//! [`McpClientManager`] spawns each configured server, runs the handshake and
//! exposes the advertised tools as [`McpProxyTool`]s that a
//! [`agent_core::ToolRegistry`] can host under the server's name.

pub mod config;
pub mod error;
pub mod manager;
pub mod protocol;
pub mod tool;
pub mod transports;

pub use config::{McpConfig, McpServerConfig};
pub use error::{McpError, Result};
pub use manager::{McpClientManager, ServerStatus};
pub use protocol::{McpCallResult, McpConnection, McpToolInfo, PROTOCOL_VERSION};
pub use tool::McpProxyTool;
pub use transports::{StdioProcess, StdioTransport};
