//! The multi-round tool-calling loop.
//!
//! Each round streams one model response, merges tool-call fragments, puts
//! every requested call through the approval gate and the registry, and
//! feeds the results back until the model answers in plain text.

pub mod config;
pub mod runner;
pub mod stream;

pub use config::{AgentLoopConfig, DEFAULT_AGENT_SYSTEM_PROMPT};
pub use runner::{run_agent_loop, run_agent_loop_with_config, truncate_tool_output, AgentTools};

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;
    use std::sync::{Arc, Mutex};

    use agent_core::tools::{ToolCallDelta, ToolRegistry, ToolSchema};
    use agent_core::{AgentError, AgentEvent, Message, Role, Session};
    use agent_llm::{FinishReason, LLMChunk, LLMError, LLMProvider, LLMStream};
    use agent_tools::{
        register_builtin_tools, ApprovalGate, ApprovalPolicy, CommandExecutor, CommandOutput,
        CommandSpec,
    };
    use async_trait::async_trait;
    use tokio::sync::mpsc;
    use tokio_util::sync::CancellationToken;

    use super::*;

    /// Replays one scripted chunk list per round and records what it was sent.
    struct ScriptedProvider {
        rounds: Mutex<VecDeque<Vec<Result<LLMChunk, LLMError>>>>,
        repeat_last: bool,
        seen: Mutex<Vec<Vec<Message>>>,
        catalogs: Mutex<Vec<Vec<String>>>,
    }

    impl ScriptedProvider {
        fn new(rounds: Vec<Vec<Result<LLMChunk, LLMError>>>) -> Arc<Self> {
            Arc::new(Self {
                rounds: Mutex::new(rounds.into()),
                repeat_last: false,
                seen: Mutex::new(Vec::new()),
                catalogs: Mutex::new(Vec::new()),
            })
        }

        fn forever(round: Vec<Result<LLMChunk, LLMError>>) -> Arc<Self> {
            Arc::new(Self {
                rounds: Mutex::new(vec![round].into()),
                repeat_last: true,
                seen: Mutex::new(Vec::new()),
                catalogs: Mutex::new(Vec::new()),
            })
        }

        fn calls(&self) -> usize {
            self.seen.lock().unwrap().len()
        }

        fn transcript(&self, round: usize) -> Vec<Message> {
            self.seen.lock().unwrap()[round].clone()
        }
    }

    fn clone_round(round: &[Result<LLMChunk, LLMError>]) -> Vec<Result<LLMChunk, LLMError>> {
        round
            .iter()
            .map(|item| match item {
                Ok(chunk) => Ok(chunk.clone()),
                Err(error) => Err(LLMError::Stream(error.to_string())),
            })
            .collect()
    }

    #[async_trait]
    impl LLMProvider for ScriptedProvider {
        fn name(&self) -> &str {
            "scripted"
        }

        fn supports_tools(&self) -> bool {
            true
        }

        async fn ask(&self, _prompt: &str, _cancel: &CancellationToken) -> agent_llm::provider::Result<LLMStream> {
            Err(LLMError::ToolsUnsupported("ask".to_string()))
        }

        async fn ask_blocking(&self, _prompt: &str, _cancel: &CancellationToken) -> agent_llm::provider::Result<String> {
            Err(LLMError::ToolsUnsupported("ask_blocking".to_string()))
        }

        async fn chat_stream(
            &self,
            messages: &[Message],
            tools: &[ToolSchema],
            _cancel: &CancellationToken,
        ) -> agent_llm::provider::Result<LLMStream> {
            self.seen.lock().unwrap().push(messages.to_vec());
            self.catalogs
                .lock()
                .unwrap()
                .push(tools.iter().map(|t| t.function.name.clone()).collect());

            let mut rounds = self.rounds.lock().unwrap();
            let round = if self.repeat_last {
                rounds.front().map(|round| clone_round(round))
            } else {
                rounds.pop_front()
            }
            .ok_or_else(|| LLMError::InvalidResponse("script exhausted".to_string()))?;
            Ok(Box::pin(futures::stream::iter(round)))
        }

        async fn is_ready(&self) -> bool {
            true
        }
    }

    /// Records every command and answers with fixed output.
    struct FakeExecutor {
        output: String,
        specs: Mutex<Vec<CommandSpec>>,
    }

    impl FakeExecutor {
        fn replying(output: &str) -> Arc<Self> {
            Arc::new(Self {
                output: output.to_string(),
                specs: Mutex::new(Vec::new()),
            })
        }

        fn runs(&self) -> Vec<CommandSpec> {
            self.specs.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl CommandExecutor for FakeExecutor {
        async fn run(&self, spec: &CommandSpec) -> Result<CommandOutput, agent_core::ToolError> {
            self.specs.lock().unwrap().push(spec.clone());
            Ok(CommandOutput {
                output: self.output.clone(),
                exit_code: Some(0),
            })
        }
    }

    fn tools_with(executor: Arc<FakeExecutor>) -> AgentTools {
        let registry = Arc::new(ToolRegistry::new());
        register_builtin_tools(&registry, executor).unwrap();
        AgentTools::new(registry, Arc::new(ApprovalGate::new(ApprovalPolicy::default())))
    }

    fn tool_round(id: &str, name: &str, arguments: &str) -> Vec<Result<LLMChunk, LLMError>> {
        vec![
            Ok(LLMChunk::ToolCalls(vec![ToolCallDelta::new(id, name, arguments)])),
            Ok(LLMChunk::Finished(FinishReason::ToolCalls)),
            Ok(LLMChunk::Done),
        ]
    }

    fn text_round(text: &str) -> Vec<Result<LLMChunk, LLMError>> {
        vec![
            Ok(LLMChunk::Token(text.to_string())),
            Ok(LLMChunk::Finished(FinishReason::Stop)),
            Ok(LLMChunk::Done),
        ]
    }

    async fn collect(mut event_rx: mpsc::Receiver<AgentEvent>) -> Vec<AgentEvent> {
        let mut events = Vec::new();
        while let Some(event) = event_rx.recv().await {
            events.push(event);
        }
        events
    }

    fn error_events(events: &[AgentEvent]) -> Vec<String> {
        events
            .iter()
            .filter_map(|event| match event {
                AgentEvent::Error { message } => Some(message.clone()),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn agent_loop_config_default() {
        let config = AgentLoopConfig::default();
        assert_eq!(config.max_rounds, 10);
        assert_eq!(config.tool_result_preview_chars, 4000);
        assert!(config.system_prompt.is_none());
        assert!(!config.skip_initial_user_message);
        assert_eq!(config.effective_system_prompt(), DEFAULT_AGENT_SYSTEM_PROMPT);
    }

    #[test]
    fn agent_loop_config_from_partial_json() {
        let config: AgentLoopConfig = serde_json::from_str(r#"{"max_rounds": 3}"#).unwrap();
        assert_eq!(config.max_rounds, 3);
        assert_eq!(config.tool_result_preview_chars, 4000);
    }

    #[tokio::test]
    async fn lists_pods_in_default_namespace() {
        let provider = ScriptedProvider::new(vec![
            vec![
                Ok(LLMChunk::ToolCalls(vec![ToolCallDelta::new(
                    "call_1",
                    "kubectl",
                    "{\"command\":",
                )])),
                Ok(LLMChunk::ToolCalls(vec![ToolCallDelta::new(
                    "",
                    "",
                    "\"get pods -n default\"}",
                )])),
                Ok(LLMChunk::Finished(FinishReason::ToolCalls)),
                Ok(LLMChunk::Done),
            ],
            text_round("Two pods are running: web-0 and web-1."),
        ]);
        let executor = FakeExecutor::replying("NAME    READY\nweb-0   1/1\nweb-1   1/1");
        let tools = tools_with(Arc::clone(&executor));
        let mut session = Session::new("e2e");
        let (event_tx, event_rx) = mpsc::channel(64);

        let (result, events) = tokio::join!(
            run_agent_loop(
                &mut session,
                "list pods in namespace default".to_string(),
                event_tx,
                provider.clone(),
                tools,
                CancellationToken::new(),
            ),
            collect(event_rx)
        );

        assert_eq!(result.unwrap(), "Two pods are running: web-0 and web-1.");
        assert_eq!(provider.calls(), 2);

        let runs = executor.runs();
        assert_eq!(runs.len(), 1);
        assert_eq!(runs[0].program, "kubectl");
        assert_eq!(runs[0].args, vec!["get", "pods", "-n", "default"]);

        assert!(!events
            .iter()
            .any(|event| matches!(event, AgentEvent::ApprovalRequired { .. })));
        assert!(matches!(
            &events[0],
            AgentEvent::ToolStart { tool_name, arguments, .. }
                if tool_name == "kubectl" && arguments["command"] == "get pods -n default"
        ));
        assert!(matches!(events.last(), Some(AgentEvent::Complete)));

        let second = provider.transcript(1);
        let roles: Vec<Role> = second.iter().map(|m| m.role).collect();
        assert_eq!(
            roles,
            vec![Role::System, Role::User, Role::Assistant, Role::Tool]
        );
        assert_eq!(second[3].tool_call_id.as_deref(), Some("call_1"));
        assert!(second[3].content.contains("web-0"));
        let calls = second[2].tool_calls.as_ref().unwrap();
        assert_eq!(calls[0].function.arguments, "{\"command\":\"get pods -n default\"}");

        assert_eq!(session.messages.len(), 5);
        assert_eq!(session.messages[4].role, Role::Assistant);
    }

    #[tokio::test]
    async fn catalog_comes_from_registry() {
        let provider = ScriptedProvider::new(vec![text_round("hi")]);
        let tools = tools_with(FakeExecutor::replying(""));
        let mut session = Session::new("catalog");
        let (event_tx, _event_rx) = mpsc::channel(64);

        run_agent_loop(
            &mut session,
            "hello".to_string(),
            event_tx,
            provider.clone(),
            tools,
            CancellationToken::new(),
        )
        .await
        .unwrap();

        assert_eq!(provider.catalogs.lock().unwrap()[0], vec!["bash", "kubectl"]);
    }

    #[tokio::test]
    async fn stops_after_max_rounds() {
        let provider = ScriptedProvider::forever(tool_round(
            "call_x",
            "kubectl",
            r#"{"command":"get pods"}"#,
        ));
        let tools = tools_with(FakeExecutor::replying("pods"));
        let mut session = Session::new("loop");
        let (event_tx, event_rx) = mpsc::channel(256);
        let config = AgentLoopConfig {
            max_rounds: 2,
            ..Default::default()
        };

        let (result, events) = tokio::join!(
            run_agent_loop_with_config(
                &mut session,
                "keep going".to_string(),
                event_tx,
                provider.clone(),
                tools,
                CancellationToken::new(),
                config,
            ),
            collect(event_rx)
        );

        assert_eq!(result.unwrap_err(), AgentError::MaxRoundsExceeded(2));
        assert_eq!(provider.calls(), 2);
        assert_eq!(
            error_events(&events),
            vec!["exceeded maximum tool call iterations (2)".to_string()]
        );
    }

    #[tokio::test]
    async fn long_tool_output_is_truncated_in_transcript() {
        let provider = ScriptedProvider::new(vec![
            tool_round("call_1", "kubectl", r#"{"command":"logs web-0"}"#),
            text_round("done"),
        ]);
        let tools = tools_with(FakeExecutor::replying(&"x".repeat(50)));
        let mut session = Session::new("trunc");
        let (event_tx, _event_rx) = mpsc::channel(64);
        let config = AgentLoopConfig {
            tool_result_preview_chars: 10,
            ..Default::default()
        };

        run_agent_loop_with_config(
            &mut session,
            "show logs".to_string(),
            event_tx,
            provider.clone(),
            tools,
            CancellationToken::new(),
            config,
        )
        .await
        .unwrap();

        let tool_message = &provider.transcript(1)[3];
        assert_eq!(
            tool_message.content,
            "xxxxxxxxxx\n... [output truncated, 40 more characters]"
        );
    }

    #[tokio::test]
    async fn denied_command_is_not_run() {
        let provider = ScriptedProvider::new(vec![
            tool_round("call_1", "bash", r#"{"command":"rm -rf /var/lib/app"}"#),
            text_round("I did not delete anything."),
        ]);
        let executor = FakeExecutor::replying("");
        let tools = tools_with(Arc::clone(&executor));
        let gate = Arc::clone(&tools.approvals);
        let mut session = Session::new("deny");
        let (event_tx, mut event_rx) = mpsc::channel(64);

        let decider = async move {
            let mut seen = Vec::new();
            while let Some(event) = event_rx.recv().await {
                if let AgentEvent::ApprovalRequired { id, category, .. } = &event {
                    assert_eq!(category.as_str(), "dangerous");
                    gate.decide(id, false).unwrap();
                }
                seen.push(event);
            }
            seen
        };

        let (result, events) = tokio::join!(
            run_agent_loop(
                &mut session,
                "clean up".to_string(),
                event_tx,
                provider.clone(),
                tools,
                CancellationToken::new(),
            ),
            decider
        );

        assert_eq!(result.unwrap(), "I did not delete anything.");
        assert!(executor.runs().is_empty());

        let tool_message = &provider.transcript(1)[3];
        assert_eq!(
            tool_message.content,
            "Error: user denied execution of 'rm -rf /var/lib/app'"
        );
        assert!(events.iter().any(|event| matches!(
            event,
            AgentEvent::ToolComplete { result, .. } if result.is_error
        )));
    }

    #[tokio::test]
    async fn cancel_while_awaiting_approval() {
        let provider = ScriptedProvider::new(vec![
            tool_round("call_1", "kubectl", r#"{"command":"delete pod web-0"}"#),
            text_round("unreachable"),
        ]);
        let executor = FakeExecutor::replying("");
        let tools = tools_with(Arc::clone(&executor));
        let gate = Arc::clone(&tools.approvals);
        let cancel = CancellationToken::new();
        let mut session = Session::new("cancel");
        let (event_tx, mut event_rx) = mpsc::channel(64);

        let canceller = {
            let cancel = cancel.clone();
            async move {
                let mut seen = Vec::new();
                while let Some(event) = event_rx.recv().await {
                    if matches!(event, AgentEvent::ApprovalRequired { .. }) {
                        cancel.cancel();
                    }
                    seen.push(event);
                }
                seen
            }
        };

        let (result, events) = tokio::join!(
            run_agent_loop(
                &mut session,
                "delete web-0".to_string(),
                event_tx,
                provider.clone(),
                tools,
                cancel,
            ),
            canceller
        );

        assert_eq!(result.unwrap_err(), AgentError::Cancelled);
        assert_eq!(provider.calls(), 1);
        assert!(executor.runs().is_empty());
        assert!(gate.pending().is_empty());
        assert_eq!(error_events(&events), vec!["Cancelled".to_string()]);
    }

    #[tokio::test]
    async fn unknown_tool_is_an_error_result_without_approval() {
        let provider = ScriptedProvider::new(vec![
            tool_round("call_1", "helm", r#"{"command":"list"}"#),
            text_round("helm is not available"),
        ]);
        let tools = tools_with(FakeExecutor::replying(""));
        let mut session = Session::new("unknown");
        let (event_tx, event_rx) = mpsc::channel(64);

        let (result, events) = tokio::join!(
            run_agent_loop(
                &mut session,
                "list releases".to_string(),
                event_tx,
                provider.clone(),
                tools,
                CancellationToken::new(),
            ),
            collect(event_rx)
        );

        assert!(result.is_ok());
        assert!(provider.transcript(1)[3].content.contains("unknown tool 'helm'"));
        assert!(!events
            .iter()
            .any(|event| matches!(event, AgentEvent::ApprovalRequired { .. })));
    }

    #[tokio::test]
    async fn stream_failure_reports_one_error_after_tokens() {
        let provider = ScriptedProvider::new(vec![vec![
            Ok(LLMChunk::Token("Looking".to_string())),
            Err(LLMError::Stream("connection reset".to_string())),
        ]]);
        let tools = tools_with(FakeExecutor::replying(""));
        let mut session = Session::new("broken");
        let (event_tx, event_rx) = mpsc::channel(64);

        let (result, events) = tokio::join!(
            run_agent_loop(
                &mut session,
                "hi".to_string(),
                event_tx,
                provider.clone(),
                tools,
                CancellationToken::new(),
            ),
            collect(event_rx)
        );

        assert!(matches!(result, Err(AgentError::LLM(_))));
        assert!(matches!(&events[0], AgentEvent::Token { content } if content == "Looking"));
        assert_eq!(error_events(&events).len(), 1);
        assert!(!events.iter().any(|event| matches!(event, AgentEvent::Complete)));
    }

    #[tokio::test]
    async fn custom_system_prompt_and_existing_history() {
        let provider = ScriptedProvider::new(vec![text_round("ok")]);
        let tools = tools_with(FakeExecutor::replying(""));
        let mut session = Session::new("history");
        session.add_message(Message::user("earlier question"));
        session.add_message(Message::assistant("earlier answer", None));
        let (event_tx, _event_rx) = mpsc::channel(64);
        let config = AgentLoopConfig {
            system_prompt: Some("Answer in one word.".to_string()),
            ..Default::default()
        };

        run_agent_loop_with_config(
            &mut session,
            "and now?".to_string(),
            event_tx,
            provider.clone(),
            tools,
            CancellationToken::new(),
            config,
        )
        .await
        .unwrap();

        let sent = provider.transcript(0);
        assert_eq!(sent[0].role, Role::System);
        assert_eq!(sent[0].content, "Answer in one word.");
        assert_eq!(sent.last().unwrap().content, "and now?");
        assert_eq!(sent.len(), 4);
    }
}
