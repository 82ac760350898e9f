//! JSON-RPC over stdio transport.
//!
//! One [`StdioTransport`] owns one MCP server child process:
//! - a writer half guarded by a mutex (one line per message)
//! - a reader task framing stdout into lines for the router
//! - a router task owning the pending-request table
//! - a stderr task logging the server's diagnostics and keeping a short tail
//!
//! Requests carry per-transport ids starting at 1. Responses are matched by
//! id, so concurrent callers may complete in any order.

use std::process::Stdio;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStderr, Command};
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::task::JoinHandle;

use super::correlator::{run_router, Correlator, LineBuffer, RouterMessage};
use super::errors::McpError;
use super::types::{
    InitializeResult, JsonRpcNotification, JsonRpcRequest, McpServerConfig, PROTOCOL_VERSION,
};
use crate::events::EventBus;

// ─── Constants ───────────────────────────────────────────────────────────────

/// Time allowed for the child to exit after kill.
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

/// How long to wait for stderr to drain after the child is gone.
const STDERR_DRAIN_TIMEOUT: Duration = Duration::from_millis(500);

/// Stderr kept for failure messages.
const STDERR_TAIL_CHARS: usize = 2000;

/// Read size for stdout chunks.
const READ_CHUNK: usize = 8192;

type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

// ─── Transport ───────────────────────────────────────────────────────────────

/// Bi-directional JSON-RPC transport over a child process's stdio.
pub struct StdioTransport {
    server_name: String,
    writer: Mutex<BoxedWriter>,
    child: Mutex<Option<Child>>,
    router: mpsc::UnboundedSender<RouterMessage>,
    next_id: AtomicU64,
    timeout: Duration,
    closed: AtomicBool,
    eof: Arc<AtomicBool>,
    stderr_tail: Arc<std::sync::Mutex<String>>,
    stderr_task: std::sync::Mutex<Option<JoinHandle<()>>>,
    reader_task: JoinHandle<()>,
}

impl StdioTransport {
    /// Spawn the server and complete the `initialize` handshake.
    ///
    /// On handshake failure the child is killed and whatever it wrote to
    /// stderr is appended to the error.
    pub async fn connect(
        name: &str,
        config: &McpServerConfig,
        events: EventBus,
    ) -> Result<(Self, InitializeResult), McpError> {
        let mut cmd = Command::new(&config.command);
        cmd.args(&config.args);
        for (key, value) in &config.env {
            cmd.env(key, value);
        }
        if let Some(dir) = &config.cwd {
            cmd.current_dir(dir);
        }

        // Windows: prevent console window from appearing for child processes
        #[cfg(target_os = "windows")]
        {
            use std::os::windows::process::CommandExt;
            const CREATE_NO_WINDOW: u32 = 0x08000000;
            cmd.creation_flags(CREATE_NO_WINDOW);
        }

        cmd.stdin(Stdio::piped());
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::piped());
        cmd.kill_on_drop(true);

        let mut child = cmd.spawn().map_err(|e| McpError::SpawnFailed {
            name: name.to_string(),
            reason: format!("{e}"),
        })?;

        let stdin = child.stdin.take().ok_or(McpError::SpawnFailed {
            name: name.to_string(),
            reason: "failed to capture stdin".into(),
        })?;
        let stdout = child.stdout.take().ok_or(McpError::SpawnFailed {
            name: name.to_string(),
            reason: "failed to capture stdout".into(),
        })?;
        let stderr = child.stderr.take();

        tracing::debug!(server = name, command = %config.command, pid = ?child.id(), "spawned MCP server");

        let transport = Self::from_io(
            name,
            Box::new(stdin),
            stdout,
            stderr,
            Some(child),
            config.timeout(),
            events,
        );

        match transport.initialize().await {
            Ok(init) => Ok((transport, init)),
            Err(e) => {
                transport.close().await;
                let stderr_ctx = transport.stderr_tail();
                if !stderr_ctx.is_empty() {
                    tracing::warn!(server = name, stderr = %stderr_ctx, "server stderr captured on failure");
                }
                Err(match e {
                    timeout @ McpError::Timeout { .. } => timeout,
                    other => McpError::InitFailed {
                        name: name.to_string(),
                        reason: format!("{other}{}", format_stderr_suffix(&stderr_ctx)),
                    },
                })
            }
        }
    }

    /// Build a transport over arbitrary byte streams and start its tasks.
    ///
    /// `connect` uses this with the child's pipes; tests use in-memory duplex
    /// streams in place of a process.
    pub fn from_io<R>(
        server_name: &str,
        writer: BoxedWriter,
        reader: R,
        stderr: Option<ChildStderr>,
        child: Option<Child>,
        timeout: Duration,
        events: EventBus,
    ) -> Self
    where
        R: AsyncRead + Send + Unpin + 'static,
    {
        let (router, inbox) = mpsc::unbounded_channel();
        tokio::spawn(run_router(Correlator::new(server_name, events), inbox));

        let eof = Arc::new(AtomicBool::new(false));
        let reader_task = tokio::spawn(read_stdout(
            server_name.to_string(),
            reader,
            router.clone(),
            Arc::clone(&eof),
        ));

        let stderr_tail = Arc::new(std::sync::Mutex::new(String::new()));
        let stderr_task = stderr.map(|stderr| {
            tokio::spawn(drain_stderr(
                server_name.to_string(),
                stderr,
                Arc::clone(&stderr_tail),
            ))
        });

        Self {
            server_name: server_name.to_string(),
            writer: Mutex::new(writer),
            child: Mutex::new(child),
            router,
            next_id: AtomicU64::new(1),
            timeout,
            closed: AtomicBool::new(false),
            eof,
            stderr_tail,
            stderr_task: std::sync::Mutex::new(stderr_task),
            reader_task,
        }
    }

    pub fn server_name(&self) -> &str {
        &self.server_name
    }

    /// False once closed or once the server's stdout hit EOF.
    pub fn is_connected(&self) -> bool {
        !self.closed.load(Ordering::SeqCst) && !self.eof.load(Ordering::SeqCst)
    }

    /// Send a request and wait for the response with the same id.
    pub async fn request(
        &self,
        method: &str,
        params: Option<serde_json::Value>,
    ) -> Result<serde_json::Value, McpError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(self.closed_error("transport closed"));
        }

        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let (reply, response) = oneshot::channel();
        self.router
            .send(RouterMessage::Register { id, reply })
            .map_err(|_| self.closed_error("router stopped"))?;

        if let Err(e) = self.write_message(&JsonRpcRequest::new(id, method, params)).await {
            let _ = self.router.send(RouterMessage::Forget { id });
            return Err(e);
        }
        tracing::trace!(server = %self.server_name, id, method, "request sent");

        match tokio::time::timeout(self.timeout, response).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(self.closed_error("router dropped the request")),
            Err(_) => {
                // Only this id is abandoned; other callers keep waiting.
                let _ = self.router.send(RouterMessage::Forget { id });
                Err(McpError::Timeout {
                    server: self.server_name.clone(),
                    method: method.to_string(),
                    timeout_ms: u64::try_from(self.timeout.as_millis()).unwrap_or(u64::MAX),
                })
            }
        }
    }

    /// Send a notification (no id, no response).
    pub async fn notify(
        &self,
        method: &str,
        params: Option<serde_json::Value>,
    ) -> Result<(), McpError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(self.closed_error("transport closed"));
        }
        self.write_message(&JsonRpcNotification::new(method, params)).await
    }

    /// Terminate the child and reject everything still pending. Idempotent.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let _ = self.router.send(RouterMessage::Closed {
            reason: "transport closed".into(),
        });

        if let Some(mut child) = self.child.lock().await.take() {
            let _ = child.start_kill();
            if tokio::time::timeout(SHUTDOWN_TIMEOUT, child.wait()).await.is_err() {
                tracing::warn!(server = %self.server_name, "server did not exit after kill");
            }
        }

        let _ = self.writer.lock().await.shutdown().await;

        let stderr_task = self
            .stderr_task
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .take();
        if let Some(handle) = stderr_task {
            let _ = tokio::time::timeout(STDERR_DRAIN_TIMEOUT, handle).await;
        }
        tracing::debug!(server = %self.server_name, "transport closed");
    }

    /// Most recent stderr output, truncated.
    pub fn stderr_tail(&self) -> String {
        self.stderr_tail
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .clone()
    }

    async fn initialize(&self) -> Result<InitializeResult, McpError> {
        let params = serde_json::json!({
            "protocolVersion": PROTOCOL_VERSION,
            "capabilities": {},
            "clientInfo": {
                "name": env!("CARGO_PKG_NAME"),
                "version": env!("CARGO_PKG_VERSION"),
            },
        });
        let result = self.request("initialize", Some(params)).await?;
        let init: InitializeResult =
            serde_json::from_value(result).map_err(|e| McpError::InvalidResponse {
                server: self.server_name.clone(),
                reason: format!("failed to parse initialize response: {e}"),
            })?;
        self.notify("notifications/initialized", None).await?;

        tracing::info!(
            server = %self.server_name,
            protocol = init.protocol_version.as_deref().unwrap_or("unknown"),
            remote = init.server_info.as_ref().and_then(|i| i.name.as_deref()).unwrap_or("unknown"),
            "MCP handshake complete"
        );
        Ok(init)
    }

    async fn write_message<T: Serialize>(&self, message: &T) -> Result<(), McpError> {
        let mut json = serde_json::to_string(message).map_err(|e| McpError::TransportError {
            server: self.server_name.clone(),
            reason: format!("failed to serialize message: {e}"),
        })?;
        json.push('\n');

        let mut writer = self.writer.lock().await;
        writer
            .write_all(json.as_bytes())
            .await
            .map_err(|e| McpError::TransportError {
                server: self.server_name.clone(),
                reason: format!("failed to write to stdin: {e}"),
            })?;
        writer
            .flush()
            .await
            .map_err(|e| McpError::TransportError {
                server: self.server_name.clone(),
                reason: format!("failed to flush stdin: {e}"),
            })
    }

    fn closed_error(&self, reason: &str) -> McpError {
        McpError::ConnectionClosed {
            server: self.server_name.clone(),
            reason: reason.to_string(),
        }
    }
}

impl Drop for StdioTransport {
    fn drop(&mut self) {
        self.reader_task.abort();
    }
}

// ─── Background Tasks ────────────────────────────────────────────────────────

async fn read_stdout<R>(
    server: String,
    mut reader: R,
    router: mpsc::UnboundedSender<RouterMessage>,
    eof: Arc<AtomicBool>,
) where
    R: AsyncRead + Unpin,
{
    let mut framer = LineBuffer::new();
    let mut chunk = vec![0u8; READ_CHUNK];
    let reason = loop {
        match reader.read(&mut chunk).await {
            Ok(0) => break "server stdout closed (process may have exited)".to_string(),
            Ok(n) => {
                for line in framer.push(&chunk[..n]) {
                    if router.send(RouterMessage::Line(line)).is_err() {
                        return;
                    }
                }
                if let Some(bytes) = framer.take_oversized() {
                    tracing::warn!(server = %server, bytes, "discarding oversized stdout line");
                    if router.send(RouterMessage::Oversized { bytes }).is_err() {
                        return;
                    }
                }
            }
            Err(e) => break format!("failed to read from stdout: {e}"),
        }
    };
    eof.store(true, Ordering::SeqCst);
    tracing::debug!(server = %server, reason = %reason, "stdout reader finished");
    let _ = router.send(RouterMessage::Closed { reason });
}

async fn drain_stderr(server: String, stderr: ChildStderr, tail: Arc<std::sync::Mutex<String>>) {
    let mut lines = BufReader::new(stderr).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        tracing::debug!(server = %server, line = %line, "server stderr");
        let mut tail = tail.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        tail.push_str(&line);
        tail.push('\n');
        if tail.len() > STDERR_TAIL_CHARS {
            let mut cut = tail.len() - STDERR_TAIL_CHARS;
            while !tail.is_char_boundary(cut) {
                cut += 1;
            }
            tail.drain(..cut);
        }
    }
}

/// Format a stderr suffix for error messages (empty string if no stderr).
fn format_stderr_suffix(stderr: &str) -> String {
    if stderr.is_empty() {
        String::new()
    } else {
        format!(" | stderr: {}", stderr.trim())
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────
