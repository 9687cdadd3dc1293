use std::sync::Arc;

use agent_core::tools::{Tool, ToolError};
use async_trait::async_trait;
use serde_json::{json, Value};

use super::{output_to_result, required_command, timeout_from_args};
use crate::executor::{CommandExecutor, CommandSpec};

const NAMESPACE_FLAGS: &[&str] = &["-n", "--namespace", "-A", "--all-namespaces"];

fn has_namespace_flag(args: &[String]) -> bool {
    args.iter().any(|arg| {
        NAMESPACE_FLAGS.contains(&arg.as_str())
            || arg.starts_with("--namespace=")
            || (arg.starts_with("-n") && arg.len() > 2 && !arg.starts_with("--"))
    })
}

/// Split the `command` argument into kubectl arguments.
///
/// A leading `kubectl` is dropped and `namespace` becomes `-n <ns>` unless
/// the command already selects a namespace.
pub fn render_kubectl_args(args: &Value) -> Result<Vec<String>, ToolError> {
    let command = required_command(args)?;
    let mut words = shell_words::split(command)
        .map_err(|error| ToolError::InvalidArguments(format!("Invalid command: {error}")))?;

    if words.first().map(String::as_str) == Some("kubectl") {
        words.remove(0);
    }
    if words.is_empty() {
        return Err(ToolError::InvalidArguments(
            "Missing kubectl subcommand".to_string(),
        ));
    }

    if let Some(namespace) = args
        .get("namespace")
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|ns| !ns.is_empty())
    {
        if !has_namespace_flag(&words) {
            words.push("-n".to_string());
            words.push(namespace.to_string());
        }
    }

    Ok(words)
}

/// Runs `kubectl` against the current kubeconfig context.
pub struct KubectlTool {
    executor: Arc<dyn CommandExecutor>,
}

impl KubectlTool {
    pub fn new(executor: Arc<dyn CommandExecutor>) -> Self {
        Self { executor }
    }
}

#[async_trait]
impl Tool for KubectlTool {
    fn name(&self) -> &str {
        "kubectl"
    }

    fn description(&self) -> &str {
        "Run a kubectl command against the Kubernetes cluster and return its combined output. \
         Pass the arguments without the leading 'kubectl', e.g. 'get pods -n default'."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "command": {
                    "type": "string",
                    "description": "kubectl arguments, e.g. 'get pods -n default'"
                },
                "namespace": {
                    "type": "string",
                    "description": "Namespace to use when the command does not set one (optional)"
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
        let kubectl_args = render_kubectl_args(&args)?;
        let spec = CommandSpec::new("kubectl", kubectl_args, timeout_from_args(&args));

        output_to_result(self.executor.run(&spec).await?)
    }
}
