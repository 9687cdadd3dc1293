use futures::StreamExt;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use agent_core::tools::{ToolCall, ToolCallAccumulator};
use agent_core::{AgentError, AgentEvent};
use agent_llm::{FinishReason, LLMChunk, LLMStream};

pub struct StreamHandlingOutput {
    pub content: String,
    pub token_count: usize,
    pub tool_calls: Vec<ToolCall>,
    /// `None` when the vendor closed the stream without saying why.
    pub finish_reason: Option<FinishReason>,
}

impl StreamHandlingOutput {
    /// Tools run when calls were assembled and the vendor stopped for them,
    /// or gave no reason at all.
    pub fn wants_tools(&self) -> bool {
        !self.tool_calls.is_empty()
            && matches!(self.finish_reason, None | Some(FinishReason::ToolCalls))
    }
}

/// Drain one round: forward text as `token` events and merge tool-call
/// fragments. Cancellation is checked between chunks.
pub async fn consume_llm_stream(
    mut stream: LLMStream,
    event_tx: &mpsc::Sender<AgentEvent>,
    cancel_token: &CancellationToken,
    session_id: &str,
) -> Result<StreamHandlingOutput, AgentError> {
    let mut content = String::new();
    let mut token_count = 0usize;
    let mut tool_calls = ToolCallAccumulator::new();
    let mut finish_reason = None;

    loop {
        let chunk_result = tokio::select! {
            biased;
            _ = cancel_token.cancelled() => return Err(AgentError::Cancelled),
            next = stream.next() => match next {
                Some(chunk_result) => chunk_result,
                None => break,
            },
        };

        match chunk_result {
            Ok(LLMChunk::Token(token)) => {
                if token.is_empty() {
                    continue;
                }
                token_count += token.len();
                content.push_str(&token);

                let _ = event_tx.send(AgentEvent::Token { content: token }).await;
            }
            Ok(LLMChunk::ToolCalls(partial_calls)) => {
                log::debug!(
                    "[{}] Received {} tool call parts",
                    session_id,
                    partial_calls.len()
                );
                tool_calls.extend(partial_calls);
            }
            Ok(LLMChunk::Finished(reason)) => {
                log::debug!("[{}] LLM finished: {:?}", session_id, reason);
                finish_reason = Some(reason);
            }
            Ok(LLMChunk::Done) => {
                log::debug!("[{}] LLM stream completed", session_id);
                break;
            }
            Err(error) => {
                log::warn!("[{}] Stream error: {}", session_id, error);
                return Err(AgentError::LLM(error.to_string()));
            }
        }
    }

    Ok(StreamHandlingOutput {
        content,
        token_count,
        tool_calls: tool_calls.finalize(),
        finish_reason,
    })
}
