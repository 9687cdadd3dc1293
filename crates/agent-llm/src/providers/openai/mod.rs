use async_trait::async_trait;
use reqwest::Client;
use tokio_util::sync::CancellationToken;

use crate::config::DEFAULT_SYSTEM_PROMPT;
use crate::provider::{LLMProvider, LLMStream, Result};
use agent_core::{tools::ToolSchema, Message};

use super::common::http::{cancellable, read_json, send_checked};
use super::common::openai_compat::{
    build_openai_compat_body, openai_compat_sse_handler, OpenAICompatCompletion,
    OpenAICompatModelList,
};
use super::common::sse::llm_stream_from_sse;

pub const DEFAULT_OPENAI_BASE_URL: &str = "https://api.openai.com/v1";

/// OpenAI chat completions, also used for OpenAI-compatible vendors.
pub struct OpenAIProvider {
    client: Client,
    name: String,
    api_key: String,
    base_url: String,
    model: String,
    system_prompt: String,
    max_tokens: Option<u32>,
}

impl OpenAIProvider {
    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            client: Client::new(),
            name: "openai".to_string(),
            api_key: api_key.into(),
            base_url: DEFAULT_OPENAI_BASE_URL.to_string(),
            model: "gpt-4o-mini".to_string(),
            system_prompt: DEFAULT_SYSTEM_PROMPT.to_string(),
            max_tokens: None,
        }
    }

    pub fn with_base_url(mut self, url: impl Into<String>) -> Self {
        self.base_url = url.into().trim_end_matches('/').to_string();
        self
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = model.into();
        self
    }

    /// Registry name reported by [`LLMProvider::name`], for compatible vendors.
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_system_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.system_prompt = prompt.into();
        self
    }

    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = Some(max_tokens);
        self
    }

    fn prompt_messages(&self, prompt: &str) -> Vec<Message> {
        vec![Message::system(&self.system_prompt), Message::user(prompt)]
    }

    async fn stream_request(
        &self,
        messages: &[Message],
        tools: &[ToolSchema],
        cancel: &CancellationToken,
    ) -> Result<LLMStream> {
        let body = build_openai_compat_body(&self.model, messages, tools, true, self.max_tokens);

        let request = self
            .client
            .post(format!("{}/chat/completions", self.base_url))
            .header("Authorization", format!("Bearer {}", self.api_key))
            .json(&body);
        let response = send_checked(request, cancel).await?;

        let stream = llm_stream_from_sse(response, openai_compat_sse_handler("openai"));
        Ok(cancellable(stream, cancel))
    }
}

#[async_trait]
impl LLMProvider for OpenAIProvider {
    fn name(&self) -> &str {
        &self.name
    }

    fn supports_tools(&self) -> bool {
        true
    }

    async fn ask(&self, prompt: &str, cancel: &CancellationToken) -> Result<LLMStream> {
        self.stream_request(&self.prompt_messages(prompt), &[], cancel)
            .await
    }

    async fn ask_blocking(&self, prompt: &str, cancel: &CancellationToken) -> Result<String> {
        let body = build_openai_compat_body(
            &self.model,
            &self.prompt_messages(prompt),
            &[],
            false,
            self.max_tokens,
        );

        let request = self
            .client
            .post(format!("{}/chat/completions", self.base_url))
            .header("Authorization", format!("Bearer {}", self.api_key))
            .json(&body);
        let response = send_checked(request, cancel).await?;

        read_json::<OpenAICompatCompletion>(response, cancel)
            .await?
            .into_text()
    }

    async fn chat_stream(
        &self,
        messages: &[Message],
        tools: &[ToolSchema],
        cancel: &CancellationToken,
    ) -> Result<LLMStream> {
        log::debug!(
            "{} chat_stream: {} messages, {} tools, model {}",
            self.name,
            messages.len(),
            tools.len(),
            self.model
        );
        self.stream_request(messages, tools, cancel).await
    }

    async fn is_ready(&self) -> bool {
        !self.api_key.trim().is_empty()
    }

    async fn list_models(&self) -> Result<Vec<String>> {
        let request = self
            .client
            .get(format!("{}/models", self.base_url))
            .header("Authorization", format!("Bearer {}", self.api_key));
        let cancel = CancellationToken::new();
        let response = send_checked(request, &cancel).await?;

        Ok(read_json::<OpenAICompatModelList>(response, &cancel)
            .await?
            .into_ids())
    }
}
