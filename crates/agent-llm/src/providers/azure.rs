//! Azure OpenAI deployments.
//!
//! Same body and stream shape as OpenAI; the deployment is addressed through
//! the URL and the key travels in an `api-key` header.

use async_trait::async_trait;
use reqwest::{Client, RequestBuilder};
use tokio_util::sync::CancellationToken;

use crate::config::DEFAULT_SYSTEM_PROMPT;
use crate::provider::{LLMProvider, LLMStream, Result};
use agent_core::{tools::ToolSchema, Message};

use super::common::http::{cancellable, read_json, send_checked};
use super::common::openai_compat::{
    build_openai_compat_body, openai_compat_sse_handler, OpenAICompatCompletion,
};
use super::common::sse::llm_stream_from_sse;

pub const DEFAULT_AZURE_API_VERSION: &str = "2024-06-01";

pub struct AzureOpenAIProvider {
    client: Client,
    api_key: String,
    endpoint: String,
    deployment: String,
    api_version: String,
    system_prompt: String,
    max_tokens: Option<u32>,
}

impl AzureOpenAIProvider {
    pub fn new(
        api_key: impl Into<String>,
        endpoint: impl Into<String>,
        deployment: impl Into<String>,
    ) -> Self {
        Self {
            client: Client::new(),
            api_key: api_key.into(),
            endpoint: endpoint.into().trim_end_matches('/').to_string(),
            deployment: deployment.into(),
            api_version: DEFAULT_AZURE_API_VERSION.to_string(),
            system_prompt: DEFAULT_SYSTEM_PROMPT.to_string(),
            max_tokens: None,
        }
    }

    pub fn with_api_version(mut self, version: impl Into<String>) -> Self {
        self.api_version = version.into();
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

    fn completions_url(&self) -> String {
        format!(
            "{}/openai/deployments/{}/chat/completions?api-version={}",
            self.endpoint, self.deployment, self.api_version
        )
    }

    fn request(&self, messages: &[Message], tools: &[ToolSchema], stream: bool) -> RequestBuilder {
        let body =
            build_openai_compat_body(&self.deployment, messages, tools, stream, self.max_tokens);

        self.client
            .post(self.completions_url())
            .header("api-key", &self.api_key)
            .json(&body)
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
        let response = send_checked(self.request(messages, tools, true), cancel).await?;
        let stream = llm_stream_from_sse(response, openai_compat_sse_handler("azure"));
        Ok(cancellable(stream, cancel))
    }
}

#[async_trait]
impl LLMProvider for AzureOpenAIProvider {
    fn name(&self) -> &str {
        "azure"
    }

    fn supports_tools(&self) -> bool {
        true
    }

    async fn ask(&self, prompt: &str, cancel: &CancellationToken) -> Result<LLMStream> {
        self.stream_request(&self.prompt_messages(prompt), &[], cancel)
            .await
    }

    async fn ask_blocking(&self, prompt: &str, cancel: &CancellationToken) -> Result<String> {
        let request = self.request(&self.prompt_messages(prompt), &[], false);
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
        self.stream_request(messages, tools, cancel).await
    }

    async fn is_ready(&self) -> bool {
        !self.api_key.trim().is_empty()
            && !self.endpoint.is_empty()
            && !self.deployment.trim().is_empty()
    }

    /// A deployment serves exactly one model.
    async fn list_models(&self) -> Result<Vec<String>> {
        Ok(vec![self.deployment.clone()])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::LLMChunk;
    use futures::StreamExt;
    use serde_json::json;
    use wiremock::matchers::{header, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[test]
    fn completions_url_includes_deployment_and_version() {
        let provider = AzureOpenAIProvider::new("key", "https://acme.openai.azure.com/", "gpt4o")
            .with_api_version("2024-02-01");

        assert_eq!(
            provider.completions_url(),
            "https://acme.openai.azure.com/openai/deployments/gpt4o/chat/completions?api-version=2024-02-01"
        );
    }

    #[tokio::test]
    async fn readiness_and_models() {
        let provider = AzureOpenAIProvider::new("key", "https://acme.openai.azure.com", "gpt4o");
        assert!(provider.is_ready().await);
        assert_eq!(provider.list_models().await.unwrap(), vec!["gpt4o"]);

        let missing = AzureOpenAIProvider::new("", "https://acme.openai.azure.com", "gpt4o");
        assert!(!missing.is_ready().await);
    }

    #[tokio::test]
    async fn ask_streams_with_api_key_header() {
        if std::env::var_os("CODEX_SANDBOX_NETWORK_DISABLED").is_some() {
            return;
        }

        let mock_server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/openai/deployments/gpt4o/chat/completions"))
            .and(query_param("api-version", DEFAULT_AZURE_API_VERSION))
            .and(header("api-key", "azure-key"))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header("content-type", "text/event-stream")
                    .set_body_string(concat!(
                        "data: {\"choices\":[{\"delta\":{\"content\":\"Hi\"}}]}\n\n",
                        "data: [DONE]\n\n",
                    )),
            )
            .mount(&mock_server)
            .await;

        let provider = AzureOpenAIProvider::new("azure-key", mock_server.uri(), "gpt4o");
        let mut stream = provider
            .ask("hello", &CancellationToken::new())
            .await
            .expect("stream");

        let first = stream.next().await.expect("chunk").expect("ok");
        assert_eq!(first, LLMChunk::Token("Hi".to_string()));
    }

    #[tokio::test]
    async fn ask_blocking_reads_first_choice() {
        if std::env::var_os("CODEX_SANDBOX_NETWORK_DISABLED").is_some() {
            return;
        }

        let mock_server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/openai/deployments/gpt4o/chat/completions"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "choices": [{"message": {"role": "assistant", "content": "pong"}}]
            })))
            .mount(&mock_server)
            .await;

        let provider = AzureOpenAIProvider::new("azure-key", mock_server.uri(), "gpt4o");
        let answer = provider
            .ask_blocking("ping", &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(answer, "pong");
    }
}
