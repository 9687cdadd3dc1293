use agent_core::tools::ToolCallDelta;

/// Why the vendor stopped producing output for a round.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FinishReason {
    Stop,
    ToolCalls,
    Length,
    Other(String),
}

impl FinishReason {
    /// Map the vendor spellings (`tool_calls`, `tool_use`, `end_turn`, ...) onto one enum.
    pub fn from_vendor(reason: &str) -> Self {
        match reason {
            "stop" | "end_turn" | "stop_sequence" => FinishReason::Stop,
            "tool_calls" | "tool_use" | "function_call" => FinishReason::ToolCalls,
            "length" | "max_tokens" => FinishReason::Length,
            other => FinishReason::Other(other.to_string()),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum LLMChunk {
    Token(String),
    ToolCalls(Vec<ToolCallDelta>),
    Finished(FinishReason),
    Done,
}
