//! Shared conversation and tool types for the agent workspace.

pub mod agent;
pub mod tools;

pub use agent::events::{AgentEvent, ApprovalCategory};
pub use agent::types::{Message, Role, Session};
pub use agent::AgentError;
pub use tools::{
    finalize_tool_calls, parse_tool_args, SharedTool, Tool, ToolCall, ToolCallAccumulator,
    ToolCallDelta, ToolError, ToolRegistry, ToolResult, ToolSchema,
};
