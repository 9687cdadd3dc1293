//! Human approval for tool calls that change state.

mod gate;
mod policy;

pub use gate::{
    ApprovalDecision, ApprovalGate, ApprovalOutcome, ApprovalVerdict, PendingToolApproval,
    DEFAULT_APPROVAL_TIMEOUT,
};
pub use policy::ApprovalPolicy;

use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ApprovalError {
    #[error("no pending approval with id '{0}'")]
    NotFound(String),

    #[error("approval '{0}' was already processed")]
    AlreadyProcessed(String),

    #[error("invalid approval policy: {0}")]
    InvalidPolicy(String),
}
