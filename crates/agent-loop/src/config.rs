use serde::{Deserialize, Serialize};

/// Preamble prepended to every run unless the caller supplies its own.
pub const DEFAULT_AGENT_SYSTEM_PROMPT: &str = "You are an operations assistant with access to \
tools. Use the kubectl tool for cluster questions and the bash tool for host commands. Call a \
tool whenever the answer depends on live state, read its output, and then answer. Some commands \
need human approval; if one is denied, explain what you would have run instead of retrying it.";

/// Configuration for the agent loop.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentLoopConfig {
    pub max_rounds: usize,
    /// Replaces [`DEFAULT_AGENT_SYSTEM_PROMPT`]. An empty string sends no preamble.
    pub system_prompt: Option<String>,
    /// Tool output longer than this many characters is cut before it enters
    /// the transcript.
    pub tool_result_preview_chars: usize,
    /// If true, skip appending the initial user message (already present in session).
    pub skip_initial_user_message: bool,
}

impl Default for AgentLoopConfig {
    fn default() -> Self {
        Self {
            max_rounds: 10,
            system_prompt: None,
            tool_result_preview_chars: 4000,
            skip_initial_user_message: false,
        }
    }
}

impl AgentLoopConfig {
    pub fn effective_system_prompt(&self) -> &str {
        self.system_prompt
            .as_deref()
            .unwrap_or(DEFAULT_AGENT_SYSTEM_PROMPT)
    }
}
