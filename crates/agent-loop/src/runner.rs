use std::sync::Arc;
use std::time::Instant;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use agent_core::tools::{parse_tool_args, ToolCall, ToolRegistry, ToolResult};
use agent_core::{AgentError, AgentEvent, Message, Role, Session};
use agent_llm::LLMProvider;
use agent_tools::{ApprovalGate, ApprovalOutcome};

use crate::config::AgentLoopConfig;
use crate::stream::handler::consume_llm_stream;

pub type Result<T> = std::result::Result<T, AgentError>;

/// What the loop may call: the tool table and the gate in front of it.
#[derive(Clone)]
pub struct AgentTools {
    pub registry: Arc<ToolRegistry>,
    pub approvals: Arc<ApprovalGate>,
}

impl AgentTools {
    pub fn new(registry: Arc<ToolRegistry>, approvals: Arc<ApprovalGate>) -> Self {
        Self {
            registry,
            approvals,
        }
    }
}

pub async fn run_agent_loop(
    session: &mut Session,
    initial_message: String,
    event_tx: mpsc::Sender<AgentEvent>,
    llm: Arc<dyn LLMProvider>,
    tools: AgentTools,
    cancel_token: CancellationToken,
) -> Result<String> {
    run_agent_loop_with_config(
        session,
        initial_message,
        event_tx,
        llm,
        tools,
        cancel_token,
        AgentLoopConfig::default(),
    )
    .await
}

/// Drive the model until it answers without requesting tools.
///
/// Returns the visible text of the final round. Every failure, including
/// cancellation, is reported once as an `error` event before it is returned.
pub async fn run_agent_loop_with_config(
    session: &mut Session,
    initial_message: String,
    event_tx: mpsc::Sender<AgentEvent>,
    llm: Arc<dyn LLMProvider>,
    tools: AgentTools,
    cancel_token: CancellationToken,
    config: AgentLoopConfig,
) -> Result<String> {
    let session_id = session.id.clone();
    let started = Instant::now();

    let result = drive(
        session,
        initial_message,
        &event_tx,
        llm.as_ref(),
        &tools,
        &cancel_token,
        &config,
    )
    .await;

    match &result {
        Ok(_) => log::info!(
            "[{}] Agent loop finished in {}ms",
            session_id,
            started.elapsed().as_millis()
        ),
        Err(error) => {
            log::warn!("[{}] Agent loop failed: {}", session_id, error);
            let _ = event_tx
                .send(AgentEvent::Error {
                    message: error.to_string(),
                })
                .await;
        }
    }
    result
}

async fn drive(
    session: &mut Session,
    initial_message: String,
    event_tx: &mpsc::Sender<AgentEvent>,
    llm: &dyn LLMProvider,
    tools: &AgentTools,
    cancel_token: &CancellationToken,
    config: &AgentLoopConfig,
) -> Result<String> {
    let session_id = session.id.clone();
    log::debug!(
        "[{}] Starting agent loop with message: {}",
        session_id,
        initial_message
    );

    seed_system_prompt(session, config.effective_system_prompt());
    if !config.skip_initial_user_message {
        session.add_message(Message::user(initial_message));
    }

    let tool_schemas = tools.registry.list_tools();
    log::debug!(
        "[{}] Tool catalog: {} tools, max {} rounds",
        session_id,
        tool_schemas.len(),
        config.max_rounds
    );

    for round in 0..config.max_rounds {
        if cancel_token.is_cancelled() {
            return Err(AgentError::Cancelled);
        }
        log::debug!(
            "[{}] Round {} with {} messages",
            session_id,
            round + 1,
            session.messages.len()
        );

        let stream = llm
            .chat_stream(&session.messages, &tool_schemas, cancel_token)
            .await
            .map_err(|error| match error {
                agent_llm::LLMError::Cancelled => AgentError::Cancelled,
                other => AgentError::LLM(other.to_string()),
            })?;

        let stream_output = consume_llm_stream(stream, event_tx, cancel_token, &session_id).await?;

        if !stream_output.wants_tools() {
            let content = stream_output.content;
            session.add_message(Message::assistant(content.clone(), None));
            let _ = event_tx.send(AgentEvent::Complete).await;
            return Ok(content);
        }

        log::info!(
            "[{}] Round {} requested {} tool calls",
            session_id,
            round + 1,
            stream_output.tool_calls.len()
        );
        session.add_message(Message::assistant(
            stream_output.content,
            Some(stream_output.tool_calls.clone()),
        ));

        for tool_call in &stream_output.tool_calls {
            let result = run_tool_call(tool_call, event_tx, tools, cancel_token, &session_id).await;
            let content =
                truncate_tool_output(&result.content, config.tool_result_preview_chars);
            session.add_message(Message::tool_result(tool_call.id.clone(), content.clone()));

            let _ = event_tx
                .send(AgentEvent::ToolComplete {
                    tool_call_id: tool_call.id.clone(),
                    result: ToolResult { content, ..result },
                })
                .await;

            if cancel_token.is_cancelled() {
                return Err(AgentError::Cancelled);
            }
        }
    }

    Err(AgentError::MaxRoundsExceeded(config.max_rounds))
}

/// Gate, then execute one call. Never fails: every problem becomes an
/// error result the model can read.
async fn run_tool_call(
    tool_call: &ToolCall,
    event_tx: &mpsc::Sender<AgentEvent>,
    tools: &AgentTools,
    cancel_token: &CancellationToken,
    session_id: &str,
) -> ToolResult {
    let name = tool_call.function.name.as_str();
    let parsed = parse_tool_args(&tool_call.function.arguments);

    let _ = event_tx
        .send(AgentEvent::ToolStart {
            tool_call_id: tool_call.id.clone(),
            tool_name: name.to_string(),
            arguments: parsed
                .clone()
                .unwrap_or_else(|_| serde_json::Value::String(tool_call.function.arguments.clone())),
        })
        .await;

    // Calls the registry will reject anyway are not worth a human decision.
    if let (Ok(args), true) = (&parsed, tools.registry.contains(name)) {
        let verdict = tools
            .approvals
            .request(name, args, event_tx, cancel_token)
            .await;
        if let Some(message) = verdict.denial_message() {
            log::info!("[{}] Tool '{}' not run: {:?}", session_id, name, verdict.outcome);
            return ToolResult::error(&tool_call.id, message);
        }
        if verdict.outcome == ApprovalOutcome::Approved {
            log::info!("[{}] Tool '{}' approved: {}", session_id, name, verdict.command);
        }
    }

    let started = Instant::now();
    let result = tokio::select! {
        biased;
        _ = cancel_token.cancelled() => {
            ToolResult::error(&tool_call.id, "Error: cancelled before the tool finished")
        }
        result = tools.registry.execute(tool_call) => result,
    };
    log::debug!(
        "[{}] Tool '{}' finished in {}ms (error: {})",
        session_id,
        name,
        started.elapsed().as_millis(),
        result.is_error
    );
    result
}

/// Put `prompt` first in the transcript, replacing an existing system
/// message. An empty prompt leaves the transcript alone.
fn seed_system_prompt(session: &mut Session, prompt: &str) {
    if prompt.trim().is_empty() {
        return;
    }
    match session
        .messages
        .iter_mut()
        .find(|message| message.role == Role::System)
    {
        Some(system_message) => system_message.content = prompt.to_string(),
        None => session.messages.insert(0, Message::system(prompt)),
    }
}

/// Keep the first `max_chars` characters and note how many were dropped.
pub fn truncate_tool_output(content: &str, max_chars: usize) -> String {
    let total = content.chars().count();
    if total <= max_chars {
        return content.to_string();
    }
    let kept: String = content.chars().take(max_chars).collect();
    format!("{kept}\n... [output truncated, {} more characters]", total - max_chars)
}
