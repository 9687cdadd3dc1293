//! Local Ollama server (`/api/chat`, newline-delimited JSON stream).

use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::config::DEFAULT_SYSTEM_PROMPT;
use crate::provider::{LLMError, LLMProvider, LLMStream, Result};
use crate::types::{FinishReason, LLMChunk};
use agent_core::{
    tools::{parse_tool_args, ToolCallDelta, ToolSchema},
    Message,
};

use super::common::http::{cancellable, read_json, send_checked};
use super::common::ndjson::llm_stream_from_ndjson;

pub const DEFAULT_OLLAMA_BASE_URL: &str = "http://localhost:11434";

pub struct OllamaProvider {
    client: Client,
    base_url: String,
    model: String,
    system_prompt: String,
}

#[derive(Debug, Deserialize)]
struct OllamaChatLine {
    #[serde(default)]
    message: Option<OllamaMessage>,
    #[serde(default)]
    done: bool,
    #[serde(default)]
    done_reason: Option<String>,
    #[serde(default)]
    error: Option<String>,
}

#[derive(Debug, Deserialize)]
struct OllamaMessage {
    #[serde(default)]
    content: String,
    #[serde(default)]
    tool_calls: Vec<OllamaToolCall>,
}

#[derive(Debug, Deserialize)]
struct OllamaToolCall {
    #[serde(default)]
    id: Option<String>,
    function: OllamaFunction,
}

#[derive(Debug, Deserialize)]
struct OllamaFunction {
    name: String,
    #[serde(default)]
    arguments: Value,
}

#[derive(Debug, Deserialize)]
struct OllamaTags {
    #[serde(default)]
    models: Vec<OllamaModel>,
}

#[derive(Debug, Deserialize)]
struct OllamaModel {
    name: String,
}

/// Ollama expects tool-call arguments as a JSON object, not a string.
fn messages_to_ollama_json(messages: &[Message]) -> Vec<Value> {
    messages
        .iter()
        .map(|m| {
            let mut msg = json!({
                "role": m.role.as_str(),
                "content": m.content,
            });

            if let Some(tool_calls) = &m.tool_calls {
                let calls: Vec<Value> = tool_calls
                    .iter()
                    .map(|call| {
                        let arguments =
                            parse_tool_args(&call.function.arguments).unwrap_or_else(|_| json!({}));
                        json!({
                            "function": {
                                "name": call.function.name,
                                "arguments": arguments,
                            }
                        })
                    })
                    .collect();
                msg["tool_calls"] = json!(calls);
            }

            msg
        })
        .collect()
}

/// State carried across lines of one response.
#[derive(Default)]
struct OllamaStreamState {
    saw_tool_calls: bool,
}

impl OllamaStreamState {
    fn handle_line(&mut self, line: &str) -> Result<Vec<LLMChunk>> {
        let parsed: OllamaChatLine = match serde_json::from_str(line) {
            Ok(parsed) => parsed,
            Err(error) if is_terminal_line(line) => {
                return Err(LLMError::InvalidResponse(format!(
                    "malformed final ollama line: {error}"
                )));
            }
            Err(error) => {
                log::debug!("ollama skipped malformed stream line: {}", error);
                return Ok(Vec::new());
            }
        };

        if let Some(error) = parsed.error {
            return Err(LLMError::Stream(error));
        }

        let mut out = Vec::new();

        if let Some(message) = parsed.message {
            if !message.content.is_empty() {
                out.push(LLMChunk::Token(message.content));
            }

            if !message.tool_calls.is_empty() {
                self.saw_tool_calls = true;
                // Each call arrives whole; give it its own id so calls never merge.
                let deltas = message
                    .tool_calls
                    .into_iter()
                    .map(|call| {
                        let id = call
                            .id
                            .filter(|id| !id.is_empty())
                            .unwrap_or_else(|| format!("call_{}", Uuid::new_v4()));
                        let arguments = match call.function.arguments {
                            Value::String(raw) => raw,
                            Value::Null => "{}".to_string(),
                            other => other.to_string(),
                        };
                        ToolCallDelta::new(id, call.function.name, arguments)
                    })
                    .collect();
                out.push(LLMChunk::ToolCalls(deltas));
            }
        }

        if parsed.done {
            let reason = if self.saw_tool_calls {
                FinishReason::ToolCalls
            } else {
                FinishReason::from_vendor(parsed.done_reason.as_deref().unwrap_or("stop"))
            };
            out.push(LLMChunk::Finished(reason));
            out.push(LLMChunk::Done);
        }

        Ok(out)
    }
}

/// Whether a line that failed to decode still claims to end the response.
fn is_terminal_line(line: &str) -> bool {
    match serde_json::from_str::<Value>(line) {
        Ok(value) => value.get("done").and_then(Value::as_bool).unwrap_or(false),
        Err(_) => line
            .split_whitespace()
            .collect::<String>()
            .contains("\"done\":true"),
    }
}

impl OllamaProvider {
    pub fn new(model: impl Into<String>) -> Self {
        Self {
            client: Client::new(),
            base_url: DEFAULT_OLLAMA_BASE_URL.to_string(),
            model: model.into(),
            system_prompt: DEFAULT_SYSTEM_PROMPT.to_string(),
        }
    }

    pub fn with_base_url(mut self, url: impl Into<String>) -> Self {
        self.base_url = url.into().trim_end_matches('/').to_string();
        self
    }

    pub fn with_system_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.system_prompt = prompt.into();
        self
    }

    fn body(&self, messages: &[Message], tools: &[ToolSchema], stream: bool) -> Value {
        let mut body = json!({
            "model": self.model,
            "messages": messages_to_ollama_json(messages),
            "stream": stream,
        });
        if !tools.is_empty() {
            body["tools"] = json!(tools);
        }
        body
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
        let request = self
            .client
            .post(format!("{}/api/chat", self.base_url))
            .json(&self.body(messages, tools, true));
        let response = send_checked(request, cancel).await?;

        let mut state = OllamaStreamState::default();
        let stream = llm_stream_from_ndjson(response, move |line| state.handle_line(line));
        Ok(cancellable(stream, cancel))
    }

    async fn tags(&self, cancel: &CancellationToken) -> Result<OllamaTags> {
        let request = self.client.get(format!("{}/api/tags", self.base_url));
        let response = send_checked(request, cancel).await?;
        read_json(response, cancel).await
    }
}

#[async_trait]
impl LLMProvider for OllamaProvider {
    fn name(&self) -> &str {
        "ollama"
    }

    fn supports_tools(&self) -> bool {
        true
    }

    async fn ask(&self, prompt: &str, cancel: &CancellationToken) -> Result<LLMStream> {
        self.stream_request(&self.prompt_messages(prompt), &[], cancel)
            .await
    }

    async fn ask_blocking(&self, prompt: &str, cancel: &CancellationToken) -> Result<String> {
        let request = self
            .client
            .post(format!("{}/api/chat", self.base_url))
            .json(&self.body(&self.prompt_messages(prompt), &[], false));
        let response = send_checked(request, cancel).await?;

        let line: OllamaChatLine = read_json(response, cancel).await?;
        if let Some(error) = line.error {
            return Err(LLMError::InvalidResponse(error));
        }

        line.message
            .map(|message| message.content)
            .ok_or_else(|| LLMError::InvalidResponse("response has no message".to_string()))
    }

    async fn chat_stream(
        &self,
        messages: &[Message],
        tools: &[ToolSchema],
        cancel: &CancellationToken,
    ) -> Result<LLMStream> {
        self.stream_request(messages, tools, cancel).await
    }

    /// Probes `/api/tags`; a local server needs no credentials.
    async fn is_ready(&self) -> bool {
        self.tags(&CancellationToken::new()).await.is_ok()
    }

    async fn list_models(&self) -> Result<Vec<String>> {
        let tags = self.tags(&CancellationToken::new()).await?;
        Ok(tags.models.into_iter().map(|model| model.name).collect())
    }
}
