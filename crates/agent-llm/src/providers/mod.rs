//! Vendor adapters.
//!
//! Each adapter maps the vendor wire format onto [`crate::LLMChunk`]s.

pub(crate) mod common;
pub mod azure;
pub mod bedrock;
pub mod ollama;
pub mod openai;

pub use azure::AzureOpenAIProvider;
pub use bedrock::{AwsCredentials, BedrockProvider};
pub use ollama::OllamaProvider;
pub use openai::OpenAIProvider;
