use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ToolError {
    #[error("unknown tool '{0}'")]
    NotFound(String),

    #[error("Execution failed: {0}")]
    Execution(String),

    #[error("Invalid arguments: {0}")]
    InvalidArguments(String),

    #[error("command timed out after {seconds}s")]
    Timeout { seconds: u64, partial_output: String },
}

impl ToolError {
    /// Text handed back to the model when a tool fails.
    ///
    /// Timeouts keep whatever output the command produced before the deadline.
    pub fn to_result_text(&self) -> String {
        match self {
            ToolError::Timeout { partial_output, .. } if !partial_output.is_empty() => {
                format!("Error: {self}\nPartial output:\n{partial_output}")
            }
            other => format!("Error: {other}"),
        }
    }
}

pub type Result<T> = std::result::Result<T, ToolError>;

/// Parse the raw argument string of a tool call. Empty input is treated as `{}`.
pub fn parse_tool_args(arguments: &str) -> Result<serde_json::Value> {
    let trimmed = arguments.trim();
    if trimmed.is_empty() {
        return Ok(serde_json::Value::Object(serde_json::Map::new()));
    }

    serde_json::from_str(trimmed)
        .map_err(|error| ToolError::InvalidArguments(format!("Invalid JSON: {error}")))
}
