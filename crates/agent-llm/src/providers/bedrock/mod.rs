//! Amazon Bedrock through the Converse API.
//!
//! Requests are signed with SigV4 (`service = "bedrock"`). Converse answers
//! with one JSON document, which is replayed as a chunk stream so callers see
//! the same shape as the streaming adapters.

mod sigv4;

pub use sigv4::{AwsCredentials, SigV4Signer, SignedHeaders, SigningRequest};

use async_trait::async_trait;
use chrono::Utc;
use futures::stream;
use reqwest::{Client, Method, Url};
use serde::Deserialize;
use serde_json::{json, Map, Value};
use tokio_util::sync::CancellationToken;

use crate::config::DEFAULT_SYSTEM_PROMPT;
use crate::provider::{LLMError, LLMProvider, LLMStream, Result};
use crate::types::{FinishReason, LLMChunk};
use agent_core::tools::{ToolCallDelta, ToolSchema};
use agent_core::{Message, Role};

use super::common::http::{cancellable, read_json, send_checked};

pub const DEFAULT_BEDROCK_MODEL: &str = "anthropic.claude-3-5-sonnet-20240620-v1:0";
const SIGNING_SERVICE: &str = "bedrock";
const CONTENT_TYPE: &str = "application/json";

pub struct BedrockProvider {
    client: Client,
    signer: SigV4Signer,
    runtime_endpoint: String,
    control_endpoint: String,
    model: String,
    system_prompt: String,
    max_tokens: Option<u32>,
}

impl BedrockProvider {
    pub fn new(credentials: AwsCredentials, region: impl Into<String>) -> Self {
        let region = region.into();
        Self {
            client: Client::new(),
            runtime_endpoint: format!("https://bedrock-runtime.{region}.amazonaws.com"),
            control_endpoint: format!("https://bedrock.{region}.amazonaws.com"),
            signer: SigV4Signer::new(credentials, region, SIGNING_SERVICE),
            model: DEFAULT_BEDROCK_MODEL.to_string(),
            system_prompt: DEFAULT_SYSTEM_PROMPT.to_string(),
            max_tokens: None,
        }
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = model.into();
        self
    }

    /// Send runtime and model-listing calls to one base URL instead of the regional hosts.
    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        let endpoint = endpoint.into().trim_end_matches('/').to_string();
        self.runtime_endpoint = endpoint.clone();
        self.control_endpoint = endpoint;
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

    fn converse_url(&self) -> Result<Url> {
        let url = format!(
            "{}/model/{}/converse",
            self.runtime_endpoint,
            sigv4::uri_encode(&self.model, true)
        );
        Url::parse(&url).map_err(|e| LLMError::InvalidResponse(format!("invalid endpoint {url}: {e}")))
    }

    fn models_url(&self) -> Result<Url> {
        let url = format!("{}/foundation-models", self.control_endpoint);
        Url::parse(&url).map_err(|e| LLMError::InvalidResponse(format!("invalid endpoint {url}: {e}")))
    }

    /// Build a request whose signed headers match exactly what goes on the wire.
    fn signed_request(&self, method: Method, url: Url, payload: Vec<u8>) -> Result<reqwest::RequestBuilder> {
        let host = host_header(&url)?;
        let signed = self.signer.sign(
            &SigningRequest {
                method: method.as_str(),
                host: &host,
                path: url.path(),
                query: url.query().unwrap_or(""),
                content_type: CONTENT_TYPE,
                payload: &payload,
            },
            Utc::now(),
        );

        let mut request = self
            .client
            .request(method, url)
            .header("content-type", CONTENT_TYPE)
            .header("host", host)
            .header("x-amz-date", signed.amz_date)
            .header("x-amz-content-sha256", signed.content_sha256)
            .header("authorization", signed.authorization);
        if let Some(token) = signed.security_token {
            request = request.header("x-amz-security-token", token);
        }
        Ok(request.body(payload))
    }

    async fn converse(
        &self,
        messages: &[Message],
        tools: &[ToolSchema],
        cancel: &CancellationToken,
    ) -> Result<ConverseResponse> {
        let body = build_converse_body(messages, tools, self.max_tokens);
        let payload = serde_json::to_vec(&body)?;
        let request = self.signed_request(Method::POST, self.converse_url()?, payload)?;

        let response = send_checked(request, cancel).await?;
        read_json::<ConverseResponse>(response, cancel).await
    }

    fn prompt_messages(&self, prompt: &str) -> Vec<Message> {
        vec![Message::system(&self.system_prompt), Message::user(prompt)]
    }

    async fn stream_converse(
        &self,
        messages: &[Message],
        tools: &[ToolSchema],
        cancel: &CancellationToken,
    ) -> Result<LLMStream> {
        let chunks = self.converse(messages, tools, cancel).await?.into_chunks();
        let stream: LLMStream = Box::pin(stream::iter(chunks.into_iter().map(Ok)));
        Ok(cancellable(stream, cancel))
    }
}

/// `host[:port]` as it appears in the Host header; default ports are omitted.
fn host_header(url: &Url) -> Result<String> {
    let host = url
        .host_str()
        .ok_or_else(|| LLMError::InvalidResponse(format!("endpoint has no host: {url}")))?;
    Ok(match url.port() {
        Some(port) => format!("{host}:{port}"),
        None => host.to_string(),
    })
}

fn text_block(text: &str) -> Value {
    json!({ "text": text })
}

fn message_blocks(message: &Message) -> Vec<Value> {
    match message.role {
        Role::Tool => vec![json!({
            "toolResult": {
                "toolUseId": message.tool_call_id.clone().unwrap_or_default(),
                "content": [text_block(&message.content)],
                "status": if message.content.starts_with("Error:") { "error" } else { "success" },
            }
        })],
        _ => {
            let mut blocks = Vec::new();
            if !message.content.is_empty() {
                blocks.push(text_block(&message.content));
            }
            for call in message.tool_calls.iter().flatten() {
                let input = serde_json::from_str::<Value>(&call.function.arguments)
                    .ok()
                    .filter(Value::is_object)
                    .unwrap_or_else(|| Value::Object(Map::new()));
                blocks.push(json!({
                    "toolUse": {
                        "toolUseId": call.id,
                        "name": call.function.name,
                        "input": input,
                    }
                }));
            }
            blocks
        }
    }
}

/// Converse wants system text out of band, tool results as user turns and
/// strictly alternating roles, so consecutive same-role turns are merged.
pub fn build_converse_body(messages: &[Message], tools: &[ToolSchema], max_tokens: Option<u32>) -> Value {
    let mut system = Vec::new();
    let mut turns: Vec<(&'static str, Vec<Value>)> = Vec::new();

    for message in messages {
        let role = match message.role {
            Role::System => {
                if !message.content.is_empty() {
                    system.push(text_block(&message.content));
                }
                continue;
            }
            Role::Assistant => "assistant",
            Role::User | Role::Tool => "user",
        };

        let blocks = message_blocks(message);
        if blocks.is_empty() {
            continue;
        }
        match turns.last_mut() {
            Some((last_role, content)) if *last_role == role => content.extend(blocks),
            _ => turns.push((role, blocks)),
        }
    }

    let mut body = json!({
        "messages": turns
            .into_iter()
            .map(|(role, content)| json!({ "role": role, "content": content }))
            .collect::<Vec<_>>(),
    });

    if !system.is_empty() {
        body["system"] = Value::Array(system);
    }
    if let Some(max_tokens) = max_tokens {
        body["inferenceConfig"] = json!({ "maxTokens": max_tokens });
    }
    if !tools.is_empty() {
        let specs = tools
            .iter()
            .map(|tool| {
                json!({
                    "toolSpec": {
                        "name": tool.function.name,
                        "description": tool.function.description,
                        "inputSchema": { "json": tool.function.parameters },
                    }
                })
            })
            .collect::<Vec<_>>();
        body["toolConfig"] = json!({ "tools": specs });
    }

    body
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConverseResponse {
    output: ConverseOutput,
    #[serde(default)]
    stop_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ConverseOutput {
    message: Option<ConverseMessage>,
}

#[derive(Debug, Deserialize)]
struct ConverseMessage {
    #[serde(default)]
    content: Vec<ContentBlock>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ContentBlock {
    text: Option<String>,
    tool_use: Option<ToolUseBlock>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ToolUseBlock {
    tool_use_id: String,
    name: String,
    #[serde(default)]
    input: Value,
}

impl ConverseResponse {
    fn blocks(self) -> (Vec<ContentBlock>, Option<String>) {
        let blocks = self.output.message.map(|m| m.content).unwrap_or_default();
        (blocks, self.stop_reason)
    }

    pub fn into_chunks(self) -> Vec<LLMChunk> {
        let (blocks, stop_reason) = self.blocks();
        let mut chunks = Vec::new();
        let mut calls = Vec::new();

        for block in blocks {
            if let Some(text) = block.text.filter(|text| !text.is_empty()) {
                chunks.push(LLMChunk::Token(text));
            }
            if let Some(tool_use) = block.tool_use {
                let arguments = if tool_use.input.is_null() {
                    "{}".to_string()
                } else {
                    tool_use.input.to_string()
                };
                calls.push(ToolCallDelta::new(tool_use.tool_use_id, tool_use.name, arguments));
            }
        }

        let saw_calls = !calls.is_empty();
        if saw_calls {
            chunks.push(LLMChunk::ToolCalls(calls));
        }
        let reason = match stop_reason.as_deref() {
            Some(reason) => FinishReason::from_vendor(reason),
            None if saw_calls => FinishReason::ToolCalls,
            None => FinishReason::Stop,
        };
        chunks.push(LLMChunk::Finished(reason));
        chunks.push(LLMChunk::Done);
        chunks
    }

    pub fn into_text(self) -> Result<String> {
        let (blocks, _) = self.blocks();
        if blocks.is_empty() {
            return Err(LLMError::InvalidResponse("no content in response".to_string()));
        }
        Ok(blocks.into_iter().filter_map(|block| block.text).collect())
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct FoundationModels {
    #[serde(default)]
    model_summaries: Vec<ModelSummary>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ModelSummary {
    model_id: String,
}

#[async_trait]
impl LLMProvider for BedrockProvider {
    fn name(&self) -> &str {
        "bedrock"
    }

    fn supports_tools(&self) -> bool {
        true
    }

    async fn ask(&self, prompt: &str, cancel: &CancellationToken) -> Result<LLMStream> {
        self.stream_converse(&self.prompt_messages(prompt), &[], cancel)
            .await
    }

    async fn ask_blocking(&self, prompt: &str, cancel: &CancellationToken) -> Result<String> {
        self.converse(&self.prompt_messages(prompt), &[], cancel)
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
            "bedrock converse: {} messages, {} tools, model {}",
            messages.len(),
            tools.len(),
            self.model
        );
        self.stream_converse(messages, tools, cancel).await
    }

    async fn is_ready(&self) -> bool {
        let credentials = self.signer.credentials();
        !credentials.access_key_id.trim().is_empty()
            && !credentials.secret_access_key.trim().is_empty()
            && !self.signer.region().trim().is_empty()
    }

    async fn list_models(&self) -> Result<Vec<String>> {
        let request = self.signed_request(Method::GET, self.models_url()?, Vec::new())?;
        let cancel = CancellationToken::new();
        let response = send_checked(request, &cancel).await?;

        Ok(read_json::<FoundationModels>(response, &cancel)
            .await?
            .model_summaries
            .into_iter()
            .map(|summary| summary.model_id)
            .collect())
    }
}
