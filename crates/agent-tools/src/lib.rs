//! Built-in command tools and the approval gate in front of them.
//!
//! Tools implement [`agent_core::Tool`] and run processes through a
//! [`CommandExecutor`], so tests can swap in a fake.

pub mod approval;
pub mod builtin;
pub mod executor;

pub use approval::{
    ApprovalDecision, ApprovalError, ApprovalGate, ApprovalOutcome, ApprovalPolicy,
    ApprovalVerdict, PendingToolApproval, DEFAULT_APPROVAL_TIMEOUT,
};
pub use builtin::{
    builtin_tools, register_builtin_tools, BashTool, KubectlTool, DEFAULT_TIMEOUT_SECS,
    MAX_TIMEOUT_SECS,
};
pub use executor::{CommandExecutor, CommandOutput, CommandSpec, ShellCommandExecutor};
