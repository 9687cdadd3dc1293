//! Vendor adapters behind one streaming chat contract.

pub mod client;
pub mod config;
pub mod provider;
pub mod provider_factory;
pub mod providers;
pub mod types;

pub use client::{RetryConfig, RetryProvider};
pub use config::{ProviderConfig, DEFAULT_SYSTEM_PROMPT};
pub use provider::{LLMError, LLMProvider, LLMStream};
pub use provider_factory::{create_provider, validate_provider_config, AVAILABLE_PROVIDERS};
pub use providers::{AzureOpenAIProvider, BedrockProvider, OllamaProvider, OpenAIProvider};
pub use types::{FinishReason, LLMChunk};
