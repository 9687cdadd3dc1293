use crate::types::LLMChunk;
use agent_core::{tools::ToolSchema, Message};
use async_trait::async_trait;
use futures::Stream;
use std::pin::Pin;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

#[derive(Error, Debug)]
pub enum LLMError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Stream error: {0}")]
    Stream(String),

    #[error("API error (HTTP {status}): {body}")]
    Api { status: u16, body: String },

    #[error("Authentication error: {0}")]
    Auth(String),

    #[error("Invalid response: {0}")]
    InvalidResponse(String),

    #[error("{0} does not support tool calling")]
    ToolsUnsupported(String),

    #[error("Request cancelled")]
    Cancelled,

    #[error("max retries exceeded after {attempts} attempts: {source}")]
    MaxRetriesExceeded {
        attempts: u32,
        #[source]
        source: Box<LLMError>,
    },
}

/// Text fragments that mark an error as transient when no structured kind is available.
const TRANSIENT_SIGNATURES: &[&str] = &[
    "rate limit",
    "too many requests",
    "timeout",
    "timed out",
    "connection refused",
    "connection reset",
    "connection closed",
    "broken pipe",
    "temporarily unavailable",
    "service unavailable",
    "try again",
    "overloaded",
    "bad gateway",
    "gateway timeout",
];

fn is_retryable_status(status: u16) -> bool {
    status == 408 || status == 429 || (500..=599).contains(&status)
}

fn matches_transient_signature(message: &str) -> bool {
    let lowered = message.to_ascii_lowercase();
    TRANSIENT_SIGNATURES
        .iter()
        .any(|signature| lowered.contains(signature))
}

impl LLMError {
    /// Whether repeating the same request may succeed.
    ///
    /// Structured kinds decide first: transport failures and 408/429/5xx
    /// statuses are transient, other statuses are not. Free-form stream
    /// errors fall back to matching known transient phrases.
    pub fn is_retryable(&self) -> bool {
        match self {
            LLMError::Http(error) => {
                if let Some(status) = error.status() {
                    return is_retryable_status(status.as_u16());
                }
                error.is_timeout()
                    || error.is_connect()
                    || error.is_request()
                    || error.is_body()
                    || matches_transient_signature(&error.to_string())
            }
            LLMError::Api { status, .. } => is_retryable_status(*status),
            LLMError::Stream(message) => matches_transient_signature(message),
            LLMError::Json(_)
            | LLMError::Auth(_)
            | LLMError::InvalidResponse(_)
            | LLMError::ToolsUnsupported(_)
            | LLMError::Cancelled
            | LLMError::MaxRetriesExceeded { .. } => false,
        }
    }
}

pub type Result<T> = std::result::Result<T, LLMError>;

pub type LLMStream = Pin<Box<dyn Stream<Item = Result<LLMChunk>> + Send>>;

#[async_trait]
pub trait LLMProvider: Send + Sync {
    /// Registry key of the backend, e.g. `openai`.
    fn name(&self) -> &str;

    /// Whether [`LLMProvider::chat_stream`] accepts a tool catalog.
    fn supports_tools(&self) -> bool {
        false
    }

    /// Stream the answer to a single prompt, with the provider's system preamble prepended.
    async fn ask(&self, prompt: &str, cancel: &CancellationToken) -> Result<LLMStream>;

    /// Non-streaming variant of [`LLMProvider::ask`]. Fails when the vendor returns no choices.
    async fn ask_blocking(&self, prompt: &str, cancel: &CancellationToken) -> Result<String>;

    /// Run one streaming round over a full transcript with the given tool catalog.
    async fn chat_stream(
        &self,
        messages: &[Message],
        tools: &[ToolSchema],
        cancel: &CancellationToken,
    ) -> Result<LLMStream> {
        let _ = (messages, tools, cancel);
        Err(LLMError::ToolsUnsupported(self.name().to_string()))
    }

    /// Whether credentials and endpoint are usable.
    async fn is_ready(&self) -> bool;

    /// List available models
    async fn list_models(&self) -> Result<Vec<String>> {
        Ok(vec![])
    }
}
