//! Provider Factory
//!
//! Creates LLM providers from a [`ProviderConfig`]. Every provider comes back
//! wrapped in [`RetryProvider`].

use std::sync::Arc;

use crate::client::RetryProvider;
use crate::config::ProviderConfig;
use crate::provider::{LLMError, LLMProvider};
use crate::providers::{
    AwsCredentials, AzureOpenAIProvider, BedrockProvider, OllamaProvider, OpenAIProvider,
};

/// Available provider types
pub const AVAILABLE_PROVIDERS: &[&str] = &["openai", "azure", "ollama", "bedrock", "deepseek", "qwen"];

/// OpenAI-compatible vendors: name, default base URL, default model.
const OPENAI_COMPATIBLE: &[(&str, &str, &str)] = &[
    ("deepseek", "https://api.deepseek.com/v1", "deepseek-chat"),
    (
        "qwen",
        "https://dashscope.aliyuncs.com/compatible-mode/v1",
        "qwen-plus",
    ),
];

fn require<'a>(value: &'a Option<String>, what: &str) -> Result<&'a str, LLMError> {
    ProviderConfig::non_empty(value).ok_or_else(|| LLMError::Auth(format!("{what} is required")))
}

fn require_api_key(config: &ProviderConfig, vendor: &str) -> Result<(), LLMError> {
    if config.api_key.trim().is_empty() {
        return Err(LLMError::Auth(format!("{vendor} API key is required")));
    }
    Ok(())
}

fn unknown_provider(name: &str) -> LLMError {
    LLMError::Auth(format!(
        "Unknown provider: {}. Available providers: {}",
        name,
        AVAILABLE_PROVIDERS.join(", ")
    ))
}

fn build_openai(config: &ProviderConfig, name: &str) -> OpenAIProvider {
    let mut provider = OpenAIProvider::new(config.api_key.trim()).with_name(name);

    if let Some((_, base_url, model)) = OPENAI_COMPATIBLE.iter().find(|(alias, ..)| *alias == name) {
        provider = provider.with_base_url(*base_url).with_model(*model);
    }
    if let Some(base_url) = ProviderConfig::non_empty(&config.base_url) {
        provider = provider.with_base_url(base_url);
    }
    if let Some(model) = ProviderConfig::non_empty(&config.model) {
        provider = provider.with_model(model);
    }
    if let Some(prompt) = ProviderConfig::non_empty(&config.system_prompt) {
        provider = provider.with_system_prompt(prompt);
    }
    if let Some(max_tokens) = config.max_tokens {
        provider = provider.with_max_tokens(max_tokens);
    }
    provider
}

fn build_azure(config: &ProviderConfig) -> Result<AzureOpenAIProvider, LLMError> {
    let endpoint = require(&config.base_url, "Azure endpoint (base_url)")?;
    let deployment = require(&config.deployment, "Azure deployment")?;

    let mut provider = AzureOpenAIProvider::new(config.api_key.trim(), endpoint, deployment);
    if let Some(version) = ProviderConfig::non_empty(&config.api_version) {
        provider = provider.with_api_version(version);
    }
    if let Some(prompt) = ProviderConfig::non_empty(&config.system_prompt) {
        provider = provider.with_system_prompt(prompt);
    }
    if let Some(max_tokens) = config.max_tokens {
        provider = provider.with_max_tokens(max_tokens);
    }
    Ok(provider)
}

fn build_ollama(config: &ProviderConfig) -> Result<OllamaProvider, LLMError> {
    let model = require(&config.model, "Ollama model")?;

    let mut provider = OllamaProvider::new(model);
    if let Some(base_url) = ProviderConfig::non_empty(&config.base_url) {
        provider = provider.with_base_url(base_url);
    }
    if let Some(prompt) = ProviderConfig::non_empty(&config.system_prompt) {
        provider = provider.with_system_prompt(prompt);
    }
    Ok(provider)
}

fn build_bedrock(config: &ProviderConfig) -> Result<BedrockProvider, LLMError> {
    let region = require(&config.region, "AWS region")?;
    let access_key_id = require(&config.access_key_id, "AWS access key id")?;
    let secret = require(&config.secret_access_key, "AWS secret access key")?;

    let mut credentials = AwsCredentials::new(access_key_id, secret);
    if let Some(token) = ProviderConfig::non_empty(&config.session_token) {
        credentials = credentials.with_session_token(token);
    }

    let mut provider = BedrockProvider::new(credentials, region);
    if let Some(model) = ProviderConfig::non_empty(&config.model) {
        provider = provider.with_model(model);
    }
    if let Some(endpoint) = ProviderConfig::non_empty(&config.base_url) {
        provider = provider.with_endpoint(endpoint);
    }
    if let Some(prompt) = ProviderConfig::non_empty(&config.system_prompt) {
        provider = provider.with_system_prompt(prompt);
    }
    if let Some(max_tokens) = config.max_tokens {
        provider = provider.with_max_tokens(max_tokens);
    }
    Ok(provider)
}

/// Create a provider based on the configuration
pub fn create_provider(config: &ProviderConfig) -> Result<Arc<dyn LLMProvider>, LLMError> {
    validate_provider_config(config)?;
    let retry = config.retry.clone();
    let name = config.provider.trim();

    log::info!("Creating LLM provider: {}", name);

    let provider: Arc<dyn LLMProvider> = match name {
        "openai" | "deepseek" | "qwen" => {
            Arc::new(RetryProvider::new(build_openai(config, name), retry))
        }
        "azure" => Arc::new(RetryProvider::new(build_azure(config)?, retry)),
        "ollama" => Arc::new(RetryProvider::new(build_ollama(config)?, retry)),
        "bedrock" => Arc::new(RetryProvider::new(build_bedrock(config)?, retry)),
        other => return Err(unknown_provider(other)),
    };

    Ok(provider)
}

/// Validate provider configuration without creating the provider
pub fn validate_provider_config(config: &ProviderConfig) -> Result<(), LLMError> {
    match config.provider.trim() {
        "openai" => require_api_key(config, "OpenAI"),
        "deepseek" => require_api_key(config, "DeepSeek"),
        "qwen" => require_api_key(config, "Qwen"),
        "azure" => {
            require_api_key(config, "Azure OpenAI")?;
            require(&config.base_url, "Azure endpoint (base_url)")?;
            require(&config.deployment, "Azure deployment")?;
            Ok(())
        }
        "ollama" => require(&config.model, "Ollama model").map(|_| ()),
        "bedrock" => {
            require(&config.region, "AWS region")?;
            require(&config.access_key_id, "AWS access key id")?;
            require(&config.secret_access_key, "AWS secret access key")?;
            Ok(())
        }
        other => Err(unknown_provider(other)),
    }
}
