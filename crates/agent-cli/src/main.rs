use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use colored::Colorize;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use agent_core::Session;
use agent_loop::{run_agent_loop_with_config, AgentLoopConfig};

mod console;
mod logging;
mod setup;

use console::{render_events, Input};
use logging::init_logging;
use setup::{build_runtime, ProviderArgs, Runtime, RuntimeOptions};

#[derive(Parser, Debug)]
#[command(name = "agent-cli")]
#[command(about = "Tool-calling agent for Kubernetes clusters and Linux hosts")]
#[command(version)]
struct Cli {
    /// Enable debug mode
    #[arg(long, short, env = "DEBUG", default_value = "false")]
    debug: bool,

    #[command(flatten)]
    provider: ProviderArgs,

    /// JSON file listing tool servers to start
    #[arg(long, env = "MCP_CONFIG")]
    mcp_config: Option<PathBuf>,

    /// JSON file overriding the command classification lists
    #[arg(long, env = "APPROVAL_POLICY")]
    approval_policy: Option<PathBuf>,

    /// Seconds to wait for an approval before treating it as denied
    #[arg(long, env = "APPROVAL_TIMEOUT_SECS", default_value_t = 60)]
    approval_timeout_secs: u64,

    #[arg(long, env = "AGENT_MAX_ROUNDS", default_value_t = 10)]
    max_rounds: usize,

    /// Replace the built-in system prompt
    #[arg(long, env = "AGENT_SYSTEM_PROMPT")]
    system_prompt: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Start interactive chat
    Chat,
    /// Answer a single prompt
    Ask {
        /// Prompt text
        prompt: String,
    },
    /// List models offered by the provider
    Models,
    /// List registered tools
    Tools,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_logging(cli.debug);

    let runtime = build_runtime(RuntimeOptions {
        provider: &cli.provider,
        mcp_config: cli.mcp_config.as_deref(),
        approval_policy: cli.approval_policy.as_deref(),
        approval_timeout: Duration::from_secs(cli.approval_timeout_secs.max(1)),
    })
    .await?;

    let config = AgentLoopConfig {
        max_rounds: cli.max_rounds.max(1),
        system_prompt: cli.system_prompt.clone(),
        ..Default::default()
    };

    let result = match &cli.command {
        Commands::Chat => run_interactive_chat(&runtime, &config, cli.debug).await,
        Commands::Ask { prompt } => {
            let mut session = Session::new(uuid::Uuid::new_v4().to_string());
            match run_prompt(&runtime, &config, &mut session, prompt, Input::stdin(), cli.debug)
                .await?
            {
                Some(_) => Ok(()),
                None => Err(anyhow::anyhow!("agent run did not complete")),
            }
        }
        Commands::Models => list_models(&runtime).await,
        Commands::Tools => {
            list_tools(&runtime);
            Ok(())
        }
    };

    runtime.mcp.disconnect_all().await;
    result
}

/// One agent run. Ctrl-C cancels the run, not the process.
async fn run_prompt(
    runtime: &Runtime,
    config: &AgentLoopConfig,
    session: &mut Session,
    prompt: &str,
    input: Input,
    debug: bool,
) -> anyhow::Result<Option<String>> {
    let cancel = CancellationToken::new();
    let ctrl_c = tokio::spawn({
        let cancel = cancel.clone();
        async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                cancel.cancel();
            }
        }
    });

    let (event_tx, event_rx) = mpsc::channel(256);
    let renderer = render_events(
        event_rx,
        Arc::clone(&runtime.tools.approvals),
        input,
        debug,
    );
    let run = run_agent_loop_with_config(
        session,
        prompt.to_string(),
        event_tx,
        Arc::clone(&runtime.llm),
        runtime.tools.clone(),
        cancel,
        config.clone(),
    );

    let (result, ()) = tokio::join!(run, renderer);
    ctrl_c.abort();

    match result {
        Ok(answer) => Ok(Some(answer)),
        // Already shown by the renderer; the chat session goes on.
        Err(error) => {
            log::debug!("Run ended with error: {}", error);
            Ok(None)
        }
    }
}

async fn run_interactive_chat(
    runtime: &Runtime,
    config: &AgentLoopConfig,
    debug: bool,
) -> anyhow::Result<()> {
    let mut session = Session::new(uuid::Uuid::new_v4().to_string());
    let input = Input::stdin();

    println!("{}", "🤖 Agent Interactive Chat".cyan().bold());
    println!("{}", format!("Session ID: {}", session.id).dimmed());
    println!("{}", "Type 'exit' or 'quit' to leave".dimmed());
    println!();

    loop {
        let Some(line) = input.read_line(&format!("{} ", "You:".cyan().bold())).await? else {
            break;
        };
        let line = line.trim();

        if line.eq_ignore_ascii_case("exit") || line.eq_ignore_ascii_case("quit") {
            println!("{}", "👋 Goodbye!".cyan());
            break;
        }
        if line.is_empty() {
            continue;
        }

        println!("{}", "Assistant:".green().bold());
        run_prompt(runtime, config, &mut session, line, input.clone(), debug).await?;
        println!();
    }

    Ok(())
}

async fn list_models(runtime: &Runtime) -> anyhow::Result<()> {
    let models = runtime.llm.list_models().await?;
    if models.is_empty() {
        println!("{}", "Provider did not report any models".dimmed());
    }
    for model in models {
        println!("{model}");
    }
    Ok(())
}

fn list_tools(runtime: &Runtime) {
    let registry = &runtime.tools.registry;
    for schema in registry.list_tools() {
        let name = schema.function.name;
        let source = registry
            .source_of(&name)
            .unwrap_or_else(|| "builtin".to_string());
        println!(
            "{} {} {}",
            name.bold(),
            format!("({source})").dimmed(),
            schema.function.description
        );
    }
}
