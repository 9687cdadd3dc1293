use std::process::Stdio;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};
use tracing::{debug, error, info, warn};

use crate::config::McpServerConfig;
use crate::error::{McpError, Result};
use crate::protocol::{BoxedReader, BoxedWriter};

/// Grace period between SIGTERM and SIGKILL.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// Launches a tool server as a child process speaking line-delimited
/// JSON-RPC on its stdin and stdout.
pub struct StdioTransport;

impl StdioTransport {
    pub fn spawn(config: &McpServerConfig) -> Result<(StdioProcess, BoxedReader, BoxedWriter)> {
        info!(
            "Starting MCP server '{}': {} {:?}",
            config.name, config.command, config.args
        );

        let mut cmd = Command::new(&config.command);
        cmd.args(&config.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        if let Some(cwd) = &config.cwd {
            cmd.current_dir(cwd);
        }
        if !config.env.is_empty() {
            cmd.envs(&config.env);
        }

        let mut child = cmd.spawn().map_err(|e| {
            error!("Failed to spawn MCP server '{}': {}", config.name, e);
            McpError::Transport(format!("failed to spawn '{}': {e}", config.command))
        })?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| McpError::Transport("failed to capture stdin".to_string()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| McpError::Transport("failed to capture stdout".to_string()))?;

        if let Some(stderr) = child.stderr.take() {
            let name = config.name.clone();
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    debug!("[MCP {} stderr] {}", name, line);
                }
            });
        }

        let process = StdioProcess {
            name: config.name.clone(),
            child,
        };
        Ok((process, Box::new(BufReader::new(stdout)), Box::new(stdin)))
    }
}

/// Handle on a running tool-server process.
pub struct StdioProcess {
    name: String,
    child: Child,
}

impl StdioProcess {
    pub fn id(&self) -> Option<u32> {
        self.child.id()
    }

    /// SIGTERM, then SIGKILL if the process outlives the grace period.
    /// Callers close stdin first so well-behaved servers exit on EOF.
    pub async fn shutdown(mut self) {
        if let Ok(Some(status)) = self.child.try_wait() {
            debug!("MCP server '{}' already exited: {}", self.name, status);
            return;
        }

        #[cfg(unix)]
        if let Some(pid) = self.child.id() {
            // SAFETY: signalling a pid we spawned and have not yet reaped.
            unsafe {
                libc::kill(pid as libc::pid_t, libc::SIGTERM);
            }
        }

        match tokio::time::timeout(SHUTDOWN_GRACE, self.child.wait()).await {
            Ok(Ok(status)) => info!("MCP server '{}' exited: {}", self.name, status),
            _ => {
                warn!(
                    "MCP server '{}' did not exit within {:?}, killing",
                    self.name, SHUTDOWN_GRACE
                );
                if let Err(e) = self.child.kill().await {
                    warn!("Failed to kill MCP server '{}': {}", self.name, e);
                }
            }
        }
    }
}
