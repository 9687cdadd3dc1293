//! OpenAI-compatible request serialization and stream parsing.
//!
//! OpenAI, Azure OpenAI and the OpenAI-style aliases share one request and
//! stream shape. These helpers build that body without leaking internal
//! `agent_core::Message` fields (like `id` / `created_at`).

use agent_core::{tools::ToolCallDelta, tools::ToolSchema, Message};
use serde::Deserialize;
use serde_json::{json, Value};

use crate::provider::{LLMError, Result};
use crate::types::{FinishReason, LLMChunk};

/// Convert internal [`Message`] values to an OpenAI-compatible JSON array.
pub fn messages_to_openai_compat_json(messages: &[Message]) -> Vec<Value> {
    messages
        .iter()
        .map(|m| {
            let mut msg = json!({
                "role": m.role.as_str(),
                "content": m.content,
            });

            if let Some(tool_call_id) = &m.tool_call_id {
                msg["tool_call_id"] = json!(tool_call_id);
            }

            if let Some(tool_calls) = &m.tool_calls {
                msg["tool_calls"] = json!(tool_calls);
            }

            msg
        })
        .collect()
}

/// Convert internal [`ToolSchema`] values to the OpenAI `tools` array JSON.
pub fn tools_to_openai_compat_json(tools: &[ToolSchema]) -> Vec<Value> {
    tools.iter().map(|t| json!(t)).collect()
}

/// Build an OpenAI-compatible chat request body.
///
/// `tools` is omitted entirely when empty; the API rejects an empty array.
pub fn build_openai_compat_body(
    model: &str,
    messages: &[Message],
    tools: &[ToolSchema],
    stream: bool,
    max_output_tokens: Option<u32>,
) -> Value {
    let mut body = json!({
        "model": model,
        "messages": messages_to_openai_compat_json(messages),
        "stream": stream,
    });

    if !tools.is_empty() {
        body["tools"] = json!(tools_to_openai_compat_json(tools));
        body["tool_choice"] = json!("auto");
    }

    if let Some(max_tokens) = max_output_tokens {
        body["max_tokens"] = json!(max_tokens);
    }

    body
}

// --- streaming chunk parsing ---

#[derive(Debug, Deserialize)]
pub struct OpenAICompatStreamChunk {
    #[serde(default)]
    choices: Vec<OpenAICompatChoice>,
}

#[derive(Debug, Deserialize)]
struct OpenAICompatChoice {
    #[serde(default)]
    delta: OpenAICompatDelta,
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
struct OpenAICompatDelta {
    content: Option<String>,
    tool_calls: Option<Vec<OpenAICompatToolCallDelta>>,
}

#[derive(Debug, Deserialize)]
struct OpenAICompatToolCallDelta {
    id: Option<String>,
    function: Option<OpenAICompatFunctionDelta>,
}

#[derive(Debug, Deserialize)]
struct OpenAICompatFunctionDelta {
    name: Option<String>,
    arguments: Option<String>,
}

/// Convert a single OpenAI-compatible stream chunk into zero or more [`LLMChunk`]s.
///
/// Only the first choice is read.
pub fn parse_openai_compat_chunk(chunk: OpenAICompatStreamChunk) -> Vec<LLMChunk> {
    let Some(choice) = chunk.choices.into_iter().next() else {
        return Vec::new();
    };

    let mut out = Vec::new();

    if let Some(content) = choice.delta.content.filter(|content| !content.is_empty()) {
        out.push(LLMChunk::Token(content));
    }

    if let Some(tool_calls) = choice.delta.tool_calls {
        let deltas: Vec<ToolCallDelta> = tool_calls
            .into_iter()
            .map(|tc| {
                let (name, arguments) = tc
                    .function
                    .map(|f| (f.name.unwrap_or_default(), f.arguments.unwrap_or_default()))
                    .unwrap_or_default();
                ToolCallDelta::new(tc.id.unwrap_or_default(), name, arguments)
            })
            .filter(|delta| !delta.is_empty())
            .collect();

        if !deltas.is_empty() {
            out.push(LLMChunk::ToolCalls(deltas));
        }
    }

    if let Some(reason) = choice.finish_reason {
        out.push(LLMChunk::Finished(FinishReason::from_vendor(&reason)));
    }

    out
}

/// Parse an SSE `data:` payload.
///
/// - `"[DONE]"` -> `[LLMChunk::Done]`
/// - Invalid JSON -> error
pub fn parse_openai_compat_sse_data(data: &str) -> Result<Vec<LLMChunk>> {
    if data.trim() == "[DONE]" {
        return Ok(vec![LLMChunk::Done]);
    }

    let chunk: OpenAICompatStreamChunk = serde_json::from_str(data)?;
    Ok(parse_openai_compat_chunk(chunk))
}

/// SSE handler used by every OpenAI-style adapter. Malformed events are skipped.
pub fn openai_compat_sse_handler(
    provider: &'static str,
) -> impl FnMut(&str, &str) -> Result<Vec<LLMChunk>> + Send + 'static {
    move |_event, data| {
        if data.trim().is_empty() {
            return Ok(Vec::new());
        }

        match parse_openai_compat_sse_data(data) {
            Ok(chunks) => Ok(chunks),
            Err(error) => {
                log::debug!("{} skipped malformed stream chunk: {}", provider, error);
                Ok(Vec::new())
            }
        }
    }
}

// --- non-streaming responses ---

#[derive(Debug, Deserialize)]
pub struct OpenAICompatCompletion {
    #[serde(default)]
    choices: Vec<OpenAICompatCompletionChoice>,
}

#[derive(Debug, Deserialize)]
struct OpenAICompatCompletionChoice {
    message: OpenAICompatCompletionMessage,
}

#[derive(Debug, Deserialize)]
struct OpenAICompatCompletionMessage {
    content: Option<String>,
}

impl OpenAICompatCompletion {
    /// Text of the first choice. Zero choices is an error.
    pub fn into_text(self) -> Result<String> {
        self.choices
            .into_iter()
            .next()
            .map(|choice| choice.message.content.unwrap_or_default())
            .ok_or_else(|| LLMError::InvalidResponse("no choices in response".to_string()))
    }
}

#[derive(Debug, Deserialize)]
pub struct OpenAICompatModelList {
    #[serde(default)]
    data: Vec<OpenAICompatModel>,
}

#[derive(Debug, Deserialize)]
struct OpenAICompatModel {
    id: String,
}

impl OpenAICompatModelList {
    pub fn into_ids(self) -> Vec<String> {
        self.data.into_iter().map(|model| model.id).collect()
    }
}
