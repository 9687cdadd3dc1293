use crate::tools::ToolResult;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Risk class of a tool invocation, decided before it runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalCategory {
    ReadOnly,
    Write,
    Dangerous,
}

impl ApprovalCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            ApprovalCategory::ReadOnly => "read_only",
            ApprovalCategory::Write => "write",
            ApprovalCategory::Dangerous => "dangerous",
        }
    }
}

impl fmt::Display for ApprovalCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AgentEvent {
    Token {
        content: String,
    },

    ToolStart {
        tool_call_id: String,
        tool_name: String,
        arguments: serde_json::Value,
    },

    /// A tool invocation is waiting for a human decision.
    ApprovalRequired {
        id: String,
        tool_name: String,
        command: String,
        category: ApprovalCategory,
    },

    ToolComplete {
        tool_call_id: String,
        result: ToolResult,
    },

    Complete,

    Error {
        message: String,
    },
}
