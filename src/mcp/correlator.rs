//! Request/response correlation for the stdio transport.
//!
//! The reader task never touches the pending table directly. It splits
//! stdout into lines with a [`LineBuffer`] and forwards them as
//! [`RouterMessage`]s to a single router task that owns the [`Correlator`].
//! Callers register their oneshot sender through the same channel, so the
//! table has exactly one owner and can be exercised without a process.

use std::collections::HashMap;

use tokio::sync::{mpsc, oneshot};

use super::errors::McpError;
use super::types::IncomingMessage;
use crate::events::{EventBus, EventKind};

/// What a waiting caller receives.
pub type Reply = Result<serde_json::Value, McpError>;

/// Longest slice of a dropped line kept in logs and events.
const DROPPED_PREVIEW_CHARS: usize = 200;

/// Longest stdout line accepted from a server.
pub const MAX_LINE_BYTES: usize = 10 * 1024 * 1024;

// ─── Line Framing ────────────────────────────────────────────────────────────

/// Accumulates raw stdout bytes and yields complete newline-terminated lines.
///
/// A line longer than the limit is discarded up to its newline and
/// reported once through [`LineBuffer::take_oversized`].
#[derive(Debug)]
pub struct LineBuffer {
    buf: Vec<u8>,
    max_line: usize,
    skipping: bool,
    oversized: Option<usize>,
}

impl Default for LineBuffer {
    fn default() -> Self {
        Self::with_limit(MAX_LINE_BYTES)
    }
}

impl LineBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_limit(max_line: usize) -> Self {
        Self {
            buf: Vec::new(),
            max_line,
            skipping: false,
            oversized: None,
        }
    }

    /// Append `chunk` and drain every complete line. Trailing `\r` is
    /// stripped; blank lines are skipped; a partial tail stays buffered.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        let mut rest = chunk;
        if self.skipping {
            let Some(pos) = rest.iter().position(|b| *b == b'\n') else {
                return Vec::new();
            };
            self.skipping = false;
            rest = &rest[pos + 1..];
        }
        self.buf.extend_from_slice(rest);

        let mut lines = Vec::new();
        while let Some(pos) = self.buf.iter().position(|b| *b == b'\n') {
            let raw: Vec<u8> = self.buf.drain(..=pos).collect();
            if pos > self.max_line {
                self.oversized = Some(pos);
                continue;
            }
            let line = String::from_utf8_lossy(&raw[..raw.len() - 1]);
            let line = line.trim_end_matches('\r').trim();
            if !line.is_empty() {
                lines.push(line.to_string());
            }
        }

        if self.buf.len() > self.max_line {
            self.oversized = Some(self.buf.len());
            self.buf = Vec::new();
            self.skipping = true;
        }
        lines
    }

    /// Size of the last discarded oversized line, if one was seen since the
    /// previous call.
    pub fn take_oversized(&mut self) -> Option<usize> {
        self.oversized.take()
    }

    /// Bytes waiting for a newline.
    pub fn pending_bytes(&self) -> usize {
        self.buf.len()
    }
}

// ─── Router Messages ─────────────────────────────────────────────────────────

/// Input to the router task.
#[derive(Debug)]
pub enum RouterMessage {
    /// A caller is about to send request `id`.
    Register { id: u64, reply: oneshot::Sender<Reply> },
    /// The caller gave up on `id` (timeout or write failure).
    Forget { id: u64 },
    /// One complete line from stdout.
    Line(String),
    /// A line over the size limit was thrown away.
    Oversized { bytes: usize },
    /// The connection is gone; reject everything pending.
    Closed { reason: String },
}

// ─── Correlator ──────────────────────────────────────────────────────────────

/// Pending-request table keyed by JSON-RPC id.
pub struct Correlator {
    server: String,
    pending: HashMap<u64, oneshot::Sender<Reply>>,
    closed: Option<String>,
    events: EventBus,
}

impl Correlator {
    pub fn new(server: impl Into<String>, events: EventBus) -> Self {
        Self {
            server: server.into(),
            pending: HashMap::new(),
            closed: None,
            events,
        }
    }

    /// Apply one router message.
    pub fn apply(&mut self, message: RouterMessage) {
        match message {
            RouterMessage::Register { id, reply } => self.register(id, reply),
            RouterMessage::Forget { id } => self.forget(id),
            RouterMessage::Line(line) => self.handle_line(&line),
            RouterMessage::Oversized { bytes } => {
                self.drop_line("", &format!("line of at least {bytes} bytes exceeds the limit"))
            }
            RouterMessage::Closed { reason } => self.reject_all(&reason),
        }
    }

    /// Track a new request. After close, the caller is rejected immediately.
    pub fn register(&mut self, id: u64, reply: oneshot::Sender<Reply>) {
        if let Some(reason) = &self.closed {
            let _ = reply.send(Err(McpError::ConnectionClosed {
                server: self.server.clone(),
                reason: reason.clone(),
            }));
            return;
        }
        if self.pending.insert(id, reply).is_some() {
            tracing::warn!(server = %self.server, id, "request id reused while pending");
        }
    }

    pub fn forget(&mut self, id: u64) {
        self.pending.remove(&id);
    }

    /// Parse one line and resolve the matching request, if any.
    ///
    /// Malformed lines and responses for unknown ids are dropped.
    pub fn handle_line(&mut self, line: &str) {
        let message: IncomingMessage = match serde_json::from_str(line) {
            Ok(m) => m,
            Err(e) => {
                self.drop_line(line, &format!("not JSON-RPC: {e}"));
                return;
            }
        };

        if let Some(method) = &message.method {
            tracing::debug!(server = %self.server, method = %method, "ignoring server-initiated message");
            return;
        }

        let Some(id) = message.response_id() else {
            self.drop_line(line, "response without a usable id");
            return;
        };

        let Some(reply) = self.pending.remove(&id) else {
            tracing::debug!(server = %self.server, id, "response for unknown or abandoned request");
            return;
        };

        // The caller may have timed out between the send and now.
        let _ = reply.send(extract_result(message));
    }

    /// Reject every pending request and refuse new ones.
    pub fn reject_all(&mut self, reason: &str) {
        if self.closed.is_none() {
            self.closed = Some(reason.to_string());
        }
        let count = self.pending.len();
        for (_, reply) in self.pending.drain() {
            let _ = reply.send(Err(McpError::ConnectionClosed {
                server: self.server.clone(),
                reason: reason.to_string(),
            }));
        }
        if count > 0 {
            tracing::warn!(server = %self.server, pending = count, reason, "rejected pending requests");
        }
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    fn drop_line(&self, line: &str, reason: &str) {
        let preview: String = line.chars().take(DROPPED_PREVIEW_CHARS).collect();
        tracing::debug!(server = %self.server, reason, line = %preview, "dropping stdout line");
        self.events.emit(
            EventKind::TransportMessageDropped,
            serde_json::json!({ "server": self.server, "reason": reason, "line": preview }),
        );
    }
}

/// Run the router until every sender is gone, then reject what is left.
pub async fn run_router(mut correlator: Correlator, mut inbox: mpsc::UnboundedReceiver<RouterMessage>) {
    while let Some(message) = inbox.recv().await {
        correlator.apply(message);
    }
    correlator.reject_all("transport dropped");
}

// ─── Response Helpers ────────────────────────────────────────────────────────

/// Turn a response into the caller's result, converting `error` to `McpError`.
pub fn extract_result(message: IncomingMessage) -> Reply {
    if let Some(err) = message.error {
        return Err(McpError::ServerError {
            code: err.code,
            message: err.message,
            data: err.data,
        });
    }

    message.result.ok_or(McpError::ServerError {
        code: super::types::error_codes::INTERNAL_ERROR,
        message: "response missing both result and error".into(),
        data: None,
    })
}

// ─── Tests ───────────────────────────────────────────────────────────────────
