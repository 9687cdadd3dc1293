//! Process execution behind the built-in command tools.

use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use agent_core::tools::ToolError;
use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::{Child, Command};
use tokio::task::JoinHandle;

/// Output kept per command; older bytes are dropped first.
pub const MAX_OUTPUT_BYTES: usize = 1024 * 1024;

/// How long to wait for the pipes to drain after the process exits.
const DRAIN_GRACE: Duration = Duration::from_secs(2);

/// One process to run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandSpec {
    pub program: String,
    pub args: Vec<String>,
    pub cwd: Option<PathBuf>,
    pub timeout: Duration,
}

impl CommandSpec {
    pub fn new(program: impl Into<String>, args: Vec<String>, timeout: Duration) -> Self {
        Self {
            program: program.into(),
            args,
            cwd: None,
            timeout,
        }
    }

    /// `sh -c <script>`
    pub fn shell(script: impl Into<String>, timeout: Duration) -> Self {
        Self::new("sh", vec!["-c".to_string(), script.into()], timeout)
    }

    pub fn with_cwd(mut self, cwd: impl Into<PathBuf>) -> Self {
        self.cwd = Some(cwd.into());
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandOutput {
    /// stdout and stderr interleaved in arrival order.
    pub output: String,
    pub exit_code: Option<i32>,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.exit_code == Some(0)
    }
}

/// Process-spawning capability used by the command tools.
#[async_trait]
pub trait CommandExecutor: Send + Sync {
    /// Run to completion. Hitting `spec.timeout` yields
    /// [`ToolError::Timeout`] with whatever output was captured.
    async fn run(&self, spec: &CommandSpec) -> Result<CommandOutput, ToolError>;
}

/// Runs commands as local child processes.
#[derive(Debug, Default, Clone)]
pub struct ShellCommandExecutor;

impl ShellCommandExecutor {
    pub fn new() -> Self {
        Self
    }
}

type SharedBuffer = Arc<Mutex<Vec<u8>>>;

fn append_capped(buffer: &SharedBuffer, bytes: &[u8]) {
    let mut buffer = buffer.lock();
    buffer.extend_from_slice(bytes);
    if buffer.len() > MAX_OUTPUT_BYTES {
        let excess = buffer.len() - MAX_OUTPUT_BYTES;
        buffer.drain(..excess);
    }
}

fn snapshot(buffer: &SharedBuffer) -> String {
    String::from_utf8_lossy(&buffer.lock()).into_owned()
}

fn spawn_reader<R>(mut reader: R, buffer: SharedBuffer) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut chunk = [0u8; 8192];
        loop {
            match reader.read(&mut chunk).await {
                Ok(0) => break,
                Ok(read) => append_capped(&buffer, &chunk[..read]),
                Err(error) => {
                    log::debug!("command output read failed: {}", error);
                    break;
                }
            }
        }
    })
}

/// Kill the child and, on unix, the process group it leads.
fn kill_tree(child: &mut Child) {
    #[cfg(unix)]
    if let Some(pid) = child.id() {
        // SAFETY: signalling a process group we created; a stale id only yields ESRCH.
        unsafe {
            libc::kill(-(pid as libc::pid_t), libc::SIGKILL);
        }
    }
    if let Err(error) = child.start_kill() {
        log::debug!("failed to kill timed out command: {}", error);
    }
}

#[async_trait]
impl CommandExecutor for ShellCommandExecutor {
    async fn run(&self, spec: &CommandSpec) -> Result<CommandOutput, ToolError> {
        let mut command = Command::new(&spec.program);
        command
            .args(&spec.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(cwd) = &spec.cwd {
            command.current_dir(cwd);
        }
        #[cfg(unix)]
        command.process_group(0);

        log::debug!("running {} {:?}", spec.program, spec.args);

        let mut child = command.spawn().map_err(|error| {
            ToolError::Execution(format!("failed to start '{}': {}", spec.program, error))
        })?;

        let buffer: SharedBuffer = Arc::new(Mutex::new(Vec::new()));
        let mut readers = Vec::with_capacity(2);
        if let Some(stdout) = child.stdout.take() {
            readers.push(spawn_reader(stdout, buffer.clone()));
        }
        if let Some(stderr) = child.stderr.take() {
            readers.push(spawn_reader(stderr, buffer.clone()));
        }

        let status = match tokio::time::timeout(spec.timeout, child.wait()).await {
            Ok(status) => status.map_err(|error| {
                ToolError::Execution(format!("failed to wait for '{}': {}", spec.program, error))
            })?,
            Err(_) => {
                kill_tree(&mut child);
                let _ = child.wait().await;
                for reader in &readers {
                    reader.abort();
                }
                log::warn!(
                    "{} timed out after {}s",
                    spec.program,
                    spec.timeout.as_secs()
                );
                return Err(ToolError::Timeout {
                    seconds: spec.timeout.as_secs(),
                    partial_output: snapshot(&buffer),
                });
            }
        };

        for reader in readers {
            let abort = reader.abort_handle();
            if tokio::time::timeout(DRAIN_GRACE, reader).await.is_err() {
                // A background grandchild still holds the pipe open.
                abort.abort();
            }
        }

        Ok(CommandOutput {
            output: snapshot(&buffer),
            exit_code: status.code(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn captures_stdout_and_stderr() {
        let spec = CommandSpec::shell("echo out; echo err 1>&2", Duration::from_secs(10));
        let output = ShellCommandExecutor::new().run(&spec).await.unwrap();

        assert!(output.success());
        assert!(output.output.contains("out"));
        assert!(output.output.contains("err"));
    }

    #[tokio::test]
    async fn reports_exit_code() {
        let spec = CommandSpec::shell("exit 3", Duration::from_secs(10));
        let output = ShellCommandExecutor::new().run(&spec).await.unwrap();

        assert_eq!(output.exit_code, Some(3));
        assert!(!output.success());
    }

    #[tokio::test]
    async fn missing_program_is_execution_error() {
        let spec = CommandSpec::new("definitely-not-a-real-binary-xyz", vec![], Duration::from_secs(5));
        let error = ShellCommandExecutor::new().run(&spec).await.unwrap_err();

        assert!(matches!(error, ToolError::Execution(_)));
    }

    #[tokio::test]
    async fn timeout_keeps_partial_output() {
        let spec = CommandSpec::shell("echo started; sleep 30", Duration::from_millis(500));
        let error = ShellCommandExecutor::new().run(&spec).await.unwrap_err();

        match error {
            ToolError::Timeout { partial_output, .. } => {
                assert!(partial_output.contains("started"));
            }
            other => panic!("expected timeout, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn runs_in_requested_directory() {
        let spec = CommandSpec::shell("pwd", Duration::from_secs(5)).with_cwd("/");
        let output = ShellCommandExecutor::new().run(&spec).await.unwrap();

        assert_eq!(output.output.trim(), "/");
    }

    #[test]
    fn buffer_drops_oldest_bytes() {
        let buffer: SharedBuffer = Arc::new(Mutex::new(Vec::new()));
        append_capped(&buffer, &vec![b'a'; MAX_OUTPUT_BYTES]);
        append_capped(&buffer, b"tail");

        let content = buffer.lock();
        assert_eq!(content.len(), MAX_OUTPUT_BYTES);
        assert!(content.ends_with(b"tail"));
    }
}
