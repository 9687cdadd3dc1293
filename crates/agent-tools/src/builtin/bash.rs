use std::sync::Arc;

use agent_core::tools::{Tool, ToolError};
use async_trait::async_trait;
use serde_json::{json, Value};

use super::{output_to_result, required_command, timeout_from_args};
use crate::executor::{CommandExecutor, CommandSpec};

/// Runs a shell script with `sh -c`.
pub struct BashTool {
    executor: Arc<dyn CommandExecutor>,
}

impl BashTool {
    pub fn new(executor: Arc<dyn CommandExecutor>) -> Self {
        Self { executor }
    }
}

#[async_trait]
impl Tool for BashTool {
    fn name(&self) -> &str {
        "bash"
    }

    fn description(&self) -> &str {
        "Execute a shell command on the host and return its combined stdout and stderr. \
         Commands time out after 30 seconds unless a timeout (max 300) is given."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "command": {
                    "type": "string",
                    "description": "Shell command to run"
                },
                "timeout": {
                    "type": "integer",
                    "description": "Timeout in seconds (optional, default 30, max 300)"
                }
            },
            "required": ["command"]
        })
    }

    async fn execute(&self, args: Value) -> Result<String, ToolError> {
        let command = required_command(&args)?;
        let spec = CommandSpec::shell(command, timeout_from_args(&args));

        output_to_result(self.executor.run(&spec).await?)
    }
}
