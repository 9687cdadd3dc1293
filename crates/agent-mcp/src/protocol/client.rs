use serde_json::Value;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Mutex as StdMutex;
use std::time::Duration;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::{McpError, Result};
use crate::protocol::models::*;

pub type BoxedReader = Box<dyn AsyncBufRead + Unpin + Send>;
pub type BoxedWriter = Box<dyn AsyncWrite + Unpin + Send>;

/// Both pipe ends, owned by whoever holds the connection lock.
struct ConnectionIo {
    reader: BoxedReader,
    writer: BoxedWriter,
    /// Bytes of a line not yet complete. Survives a dropped call so the next
    /// reader resumes mid-line instead of parsing half a message.
    partial: Vec<u8>,
    /// Set while a request line is being written. Still set on entry means
    /// a dropped call left a torn line on the pipe.
    writing: bool,
}

/// One JSON-RPC session over a line-delimited byte stream.
///
/// A call holds the IO lock from writing its request until its own response
/// arrives, so concurrent callers never see each other's responses.
pub struct McpConnection {
    name: String,
    io: Mutex<ConnectionIo>,
    next_id: AtomicU64,
    ready: AtomicBool,
    not_ready_reason: StdMutex<Option<String>>,
    timeout: Duration,
}

impl McpConnection {
    pub fn new(
        name: impl Into<String>,
        reader: BoxedReader,
        writer: BoxedWriter,
        timeout: Duration,
    ) -> Self {
        Self {
            name: name.into(),
            io: Mutex::new(ConnectionIo {
                reader,
                writer,
                partial: Vec::new(),
                writing: false,
            }),
            next_id: AtomicU64::new(1),
            ready: AtomicBool::new(true),
            not_ready_reason: StdMutex::new(None),
            timeout,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::SeqCst)
    }

    pub fn mark_not_ready(&self, reason: impl Into<String>) {
        let reason = reason.into();
        if self.ready.swap(false, Ordering::SeqCst) {
            warn!("MCP server '{}' is no longer ready: {}", self.name, reason);
        }
        if let Ok(mut slot) = self.not_ready_reason.lock() {
            slot.get_or_insert(reason);
        }
    }

    fn ensure_ready(&self) -> Result<()> {
        if self.is_ready() {
            return Ok(());
        }
        let reason = self
            .not_ready_reason
            .lock()
            .ok()
            .and_then(|slot| slot.clone())
            .unwrap_or_else(|| "connection closed".to_string());
        Err(McpError::NotReady(format!("{}: {}", self.name, reason)))
    }

    /// Fail the connection for good and return the error for this call.
    fn fail(&self, error: McpError) -> McpError {
        self.mark_not_ready(error.to_string());
        error
    }

    /// Send `method` and wait for its result, bounded by the connection
    /// timeout and `cancel`, whichever fires first.
    pub async fn request(
        &self,
        method: &str,
        params: Option<Value>,
        cancel: &CancellationToken,
    ) -> Result<Value> {
        self.ensure_ready()?;
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);

        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(McpError::Cancelled),
            _ = tokio::time::sleep(self.timeout) => {
                warn!("MCP '{}' request {} ({}) timed out", self.name, id, method);
                Err(McpError::Timeout {
                    method: method.to_string(),
                    timeout_ms: self.timeout.as_millis() as u64,
                })
            }
            result = self.round_trip(id, method, params) => result,
        }
    }

    async fn round_trip(&self, id: u64, method: &str, params: Option<Value>) -> Result<Value> {
        let line = serde_json::to_string(&JsonRpcRequest::new(id, method, params))?;
        let mut io = self.io.lock().await;
        self.ensure_ready()?;

        self.write_line(&mut io, &line).await?;
        debug!("MCP '{}' -> {}", self.name, line);

        loop {
            let raw = self.read_line(&mut io).await?;
            let trimmed = raw.trim();
            if trimmed.is_empty() {
                continue;
            }

            let message: JsonRpcMessage = serde_json::from_str(trimmed).map_err(|e| {
                self.fail(McpError::Protocol(format!("malformed message: {e}")))
            })?;
            if message.jsonrpc != JSONRPC_VERSION {
                return Err(self.fail(McpError::Protocol(format!(
                    "unsupported jsonrpc version '{}'",
                    message.jsonrpc
                ))));
            }

            match message.response_id() {
                Some(response_id) if response_id == id => {
                    if let Some(error) = message.error {
                        return Err(McpError::Rpc {
                            code: error.code,
                            message: error.message,
                        });
                    }
                    return message.result.ok_or_else(|| {
                        self.fail(McpError::Protocol(format!(
                            "response {id} has neither result nor error"
                        )))
                    });
                }
                Some(stale) => debug!("MCP '{}' skipping stale response {}", self.name, stale),
                None => match message.method.as_deref() {
                    Some(other) => debug!("MCP '{}' skipping server message {}", self.name, other),
                    None => {
                        return Err(self.fail(McpError::Protocol(
                            "response without a numeric id".to_string(),
                        )))
                    }
                },
            }
        }
    }

    /// Fire-and-forget message; no response is read.
    pub async fn notify(&self, method: &str, params: Option<Value>) -> Result<()> {
        self.ensure_ready()?;
        let line = serde_json::to_string(&JsonRpcNotification::new(method, params))?;
        let mut io = self.io.lock().await;
        self.write_line(&mut io, &line).await
    }

    async fn write_line(&self, io: &mut ConnectionIo, line: &str) -> Result<()> {
        if io.writing {
            return Err(self.fail(McpError::Transport(
                "previous request was interrupted mid-write".to_string(),
            )));
        }
        io.writing = true;

        let mut bytes = Vec::with_capacity(line.len() + 1);
        bytes.extend_from_slice(line.as_bytes());
        bytes.push(b'\n');
        if let Err(e) = io.writer.write_all(&bytes).await {
            return Err(self.fail(McpError::Transport(format!("failed to write: {e}"))));
        }
        if let Err(e) = io.writer.flush().await {
            return Err(self.fail(McpError::Transport(format!("failed to flush: {e}"))));
        }

        io.writing = false;
        Ok(())
    }

    async fn read_line(&self, io: &mut ConnectionIo) -> Result<String> {
        let ConnectionIo {
            reader, partial, ..
        } = io;
        match reader.read_until(b'\n', partial).await {
            Ok(0) => Err(self.fail(McpError::Disconnected)),
            Ok(_) if !partial.ends_with(b"\n") => Err(self.fail(McpError::Disconnected)),
            Ok(_) => {
                let bytes = std::mem::take(partial);
                String::from_utf8(bytes)
                    .map_err(|_| self.fail(McpError::Protocol("message is not UTF-8".to_string())))
            }
            Err(e) => Err(self.fail(McpError::Transport(format!("failed to read: {e}")))),
        }
    }

    /// `initialize` handshake followed by `notifications/initialized`.
    pub async fn initialize(&self, cancel: &CancellationToken) -> Result<McpInitializeResult> {
        let params = serde_json::to_value(McpInitializeRequest::default())?;
        let result = self.request("initialize", Some(params), cancel).await?;
        let result: McpInitializeResult = serde_json::from_value(result)
            .map_err(|e| self.fail(McpError::Protocol(format!("invalid initialize result: {e}"))))?;

        self.notify("notifications/initialized", None).await?;

        if let Some(server) = &result.server_info {
            info!(
                "MCP server '{}' initialized: {} v{} (protocol {})",
                self.name, server.name, server.version, result.protocol_version
            );
        }
        Ok(result)
    }

    /// Every tool the server advertises, following pagination cursors.
    pub async fn list_tools(&self, cancel: &CancellationToken) -> Result<Vec<McpToolInfo>> {
        let mut tools = Vec::new();
        let mut cursor: Option<String> = None;

        loop {
            let params = cursor
                .take()
                .map(|cursor| serde_json::json!({ "cursor": cursor }));
            let result = self.request("tools/list", params, cancel).await?;
            let page: McpToolListResult = serde_json::from_value(result)
                .map_err(|e| self.fail(McpError::Protocol(format!("invalid tools/list result: {e}"))))?;

            tools.extend(page.tools);
            match page.next_cursor {
                Some(next) if !next.is_empty() => cursor = Some(next),
                _ => break,
            }
        }

        Ok(tools)
    }

    pub async fn call_tool(
        &self,
        name: &str,
        arguments: Value,
        cancel: &CancellationToken,
    ) -> Result<McpCallResult> {
        let params = serde_json::to_value(McpToolCallRequest {
            name: name.to_string(),
            arguments,
        })?;
        let result = self.request("tools/call", Some(params), cancel).await?;
        let result: McpToolCallResult = serde_json::from_value(result)
            .map_err(|e| self.fail(McpError::Protocol(format!("invalid tools/call result: {e}"))))?;

        Ok(result.into())
    }

    pub async fn ping(&self, cancel: &CancellationToken) -> Result<()> {
        self.request("ping", None, cancel).await.map(|_| ())
    }

    /// Close both pipe ends. The peer sees EOF on its stdin.
    pub async fn close(&self) {
        self.mark_not_ready("connection closed");
        let mut io = self.io.lock().await;
        if let Err(e) = io.writer.shutdown().await {
            debug!("MCP '{}' shutdown of writer failed: {}", self.name, e);
        }
        io.writer = Box::new(tokio::io::sink());
        io.reader = Box::new(tokio::io::BufReader::new(tokio::io::empty()));
    }
}
