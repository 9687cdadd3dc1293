use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AgentError {
    #[error("LLM error: {0}")]
    LLM(String),

    #[error("exceeded maximum tool call iterations ({0})")]
    MaxRoundsExceeded(usize),

    #[error("Cancelled")]
    Cancelled,
}
