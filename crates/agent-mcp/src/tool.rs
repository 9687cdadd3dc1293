use agent_core::{Tool, ToolError};
use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use crate::error::McpError;
use crate::protocol::{McpConnection, McpToolInfo};

/// Registry entry that forwards to a tool advertised by a connected server.
pub struct McpProxyTool {
    server: String,
    info: McpToolInfo,
    connection: Arc<McpConnection>,
    /// Cancelled when the owning server disconnects.
    shutdown: CancellationToken,
}

impl McpProxyTool {
    pub fn new(
        server: impl Into<String>,
        info: McpToolInfo,
        connection: Arc<McpConnection>,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            server: server.into(),
            info,
            connection,
            shutdown,
        }
    }

    pub fn server(&self) -> &str {
        &self.server
    }
}

#[async_trait]
impl Tool for McpProxyTool {
    fn name(&self) -> &str {
        &self.info.name
    }

    fn description(&self) -> &str {
        &self.info.description
    }

    fn parameters_schema(&self) -> Value {
        self.info.input_schema.clone()
    }

    async fn execute(&self, args: Value) -> Result<String, ToolError> {
        let result = self
            .connection
            .call_tool(&self.info.name, args, &self.shutdown)
            .await
            .map_err(|e| to_tool_error(&self.server, e))?;

        if result.is_error {
            return Err(ToolError::Execution(result.text));
        }
        Ok(result.text)
    }
}

fn to_tool_error(server: &str, error: McpError) -> ToolError {
    match error {
        McpError::Timeout { timeout_ms, .. } => ToolError::Timeout {
            seconds: timeout_ms.div_ceil(1000),
            partial_output: String::new(),
        },
        other => ToolError::Execution(format!("tool server '{server}': {other}")),
    }
}
