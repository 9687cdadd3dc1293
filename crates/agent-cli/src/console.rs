use std::io::{self, Write};
use std::sync::Arc;

use colored::Colorize;
use tokio::io::{AsyncBufReadExt, BufReader, Lines, Stdin};
use tokio::sync::{mpsc, Mutex};

use agent_core::{AgentEvent, ApprovalCategory};
use agent_tools::{ApprovalError, ApprovalGate};

/// Shared stdin so prompts and approval questions never read concurrently.
#[derive(Clone)]
pub struct Input {
    lines: Arc<Mutex<Lines<BufReader<Stdin>>>>,
}

impl Input {
    pub fn stdin() -> Self {
        Self {
            lines: Arc::new(Mutex::new(BufReader::new(tokio::io::stdin()).lines())),
        }
    }

    /// `None` on end of input.
    pub async fn read_line(&self, prompt: &str) -> io::Result<Option<String>> {
        print!("{prompt}");
        io::stdout().flush()?;
        self.lines.lock().await.next_line().await
    }
}

/// `y`/`yes` approve; anything else denies.
pub fn parse_decision(answer: &str) -> bool {
    matches!(answer.trim().to_ascii_lowercase().as_str(), "y" | "yes")
}

fn category_label(category: ApprovalCategory) -> colored::ColoredString {
    match category {
        ApprovalCategory::ReadOnly => category.as_str().green(),
        ApprovalCategory::Write => category.as_str().yellow(),
        ApprovalCategory::Dangerous => category.as_str().red().bold(),
    }
}

fn preview(text: &str, max_lines: usize) -> String {
    let mut lines: Vec<&str> = text.lines().take(max_lines + 1).collect();
    if lines.len() > max_lines {
        lines.truncate(max_lines);
        lines.push("...");
    }
    lines.join("\n   ")
}

/// Print events until the run drops its sender, answering approval
/// requests from `input`.
pub async fn render_events(
    mut event_rx: mpsc::Receiver<AgentEvent>,
    approvals: Arc<ApprovalGate>,
    input: Input,
    debug: bool,
) {
    let mut mid_line = false;

    while let Some(event) = event_rx.recv().await {
        match event {
            AgentEvent::Token { content } => {
                print!("{content}");
                let _ = io::stdout().flush();
                mid_line = !content.ends_with('\n');
            }
            AgentEvent::ToolStart {
                tool_name,
                arguments,
                ..
            } => {
                if mid_line {
                    println!();
                    mid_line = false;
                }
                println!("{}", format!("🔧 {tool_name}").yellow());
                if debug {
                    println!("{}", format!("   Args: {arguments}").dimmed());
                }
            }
            AgentEvent::ApprovalRequired {
                id,
                tool_name,
                command,
                category,
            } => {
                println!(
                    "{} [{}] {}",
                    "⚠️  Approval required".bold(),
                    category_label(category),
                    tool_name
                );
                println!("   {}", command.cyan());

                let approved = match input.read_line("   Run it? [y/N] ").await {
                    Ok(Some(answer)) => parse_decision(&answer),
                    Ok(None) | Err(_) => false,
                };
                match approvals.decide(&id, approved) {
                    Ok(()) => {}
                    Err(ApprovalError::AlreadyProcessed(_)) => {
                        println!("{}", "   Approval expired before the answer arrived".dimmed());
                    }
                    Err(error) => log::warn!("Failed to record decision for {}: {}", id, error),
                }
            }
            AgentEvent::ToolComplete { result, .. } => {
                let body = preview(&result.content, 8);
                if result.is_error {
                    println!("{}", format!("❌ {body}").red());
                } else {
                    println!("{}", format!("✅ {body}").dimmed());
                }
            }
            AgentEvent::Complete => {
                if mid_line {
                    println!();
                    mid_line = false;
                }
            }
            AgentEvent::Error { message } => {
                if mid_line {
                    println!();
                    mid_line = false;
                }
                println!("{}", format!("❌ Error: {message}").red());
            }
        }
    }
}
