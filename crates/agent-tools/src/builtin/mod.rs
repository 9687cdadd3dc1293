//! Built-in command tools.

mod bash;
mod kubectl;

pub use bash::BashTool;
pub use kubectl::{render_kubectl_args, KubectlTool};

use std::sync::Arc;
use std::time::Duration;

use agent_core::tools::{RegistryError, SharedTool, ToolError, ToolRegistry};
use serde_json::Value;

use crate::executor::{CommandExecutor, CommandOutput};

pub const DEFAULT_TIMEOUT_SECS: u64 = 30;
pub const MAX_TIMEOUT_SECS: u64 = 300;

/// Requested `timeout` argument, defaulted and capped.
pub(crate) fn timeout_from_args(args: &Value) -> Duration {
    let requested = args
        .get("timeout")
        .and_then(|value| value.as_u64().or_else(|| value.as_f64().map(|secs| secs as u64)))
        .filter(|secs| *secs > 0)
        .unwrap_or(DEFAULT_TIMEOUT_SECS);
    Duration::from_secs(requested.min(MAX_TIMEOUT_SECS))
}

pub(crate) fn required_command(args: &Value) -> Result<&str, ToolError> {
    args.get("command")
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|command| !command.is_empty())
        .ok_or_else(|| ToolError::InvalidArguments("Missing 'command' parameter".to_string()))
}

/// Text handed back to the model. Non-zero exits are failures that still carry the output.
pub(crate) fn output_to_result(output: CommandOutput) -> Result<String, ToolError> {
    let text = if output.output.trim().is_empty() {
        "(no output)".to_string()
    } else {
        output.output
    };

    match output.exit_code {
        Some(0) => Ok(text),
        Some(code) => Err(ToolError::Execution(format!("exit code {code}\n{text}"))),
        None => Err(ToolError::Execution(format!("terminated by signal\n{text}"))),
    }
}

/// Both built-ins sharing one executor.
pub fn builtin_tools(executor: Arc<dyn CommandExecutor>) -> Vec<SharedTool> {
    vec![
        Arc::new(KubectlTool::new(executor.clone())),
        Arc::new(BashTool::new(executor)),
    ]
}

pub fn register_builtin_tools(
    registry: &ToolRegistry,
    executor: Arc<dyn CommandExecutor>,
) -> Result<(), RegistryError> {
    for tool in builtin_tools(executor) {
        registry.register_shared(tool)?;
    }
    Ok(())
}
