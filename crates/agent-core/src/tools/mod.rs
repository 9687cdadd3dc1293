pub mod accumulator;
pub mod executor;
pub mod registry;
pub mod types;

pub use accumulator::{
    finalize_tool_calls, update_partial_tool_call, ToolCallAccumulator, ToolCallDelta,
};
pub use executor::{parse_tool_args, ToolError};
pub use registry::{RegistryError, SharedTool, Tool, ToolRegistry};
pub use types::{FunctionCall, FunctionSchema, ToolCall, ToolResult, ToolSchema};
