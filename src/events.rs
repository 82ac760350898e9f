//! Instrumentation bus: a structured side-channel for runtime events.
//!
//! Every layer above the error taxonomy reports what it is doing here
//! instead of printing: call lifecycle, retries, connections, auth cache
//! activity and dropped protocol lines. Observers subscribe to a
//! `tokio::sync::broadcast` channel; publishing with no subscribers is fine.
//!
//! The [`Logger`] trait is the narrow logging surface host programs can
//! plug in; [`TracingLogger`] forwards to `tracing`.

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::broadcast;

// ─── Event Names ─────────────────────────────────────────────────────────────

/// Named runtime event kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum EventKind {
    #[serde(rename = "call:start")]
    CallStart,
    #[serde(rename = "call:success")]
    CallSuccess,
    #[serde(rename = "call:error")]
    CallError,
    #[serde(rename = "call:retry")]
    CallRetry,
    #[serde(rename = "connection:open")]
    ConnectionOpen,
    #[serde(rename = "connection:close")]
    ConnectionClose,
    #[serde(rename = "connection:error")]
    ConnectionError,
    #[serde(rename = "auth:resolved")]
    AuthResolved,
    #[serde(rename = "auth:cache_hit")]
    AuthCacheHit,
    #[serde(rename = "auth:refresh")]
    AuthRefresh,
    #[serde(rename = "transport:message_dropped")]
    TransportMessageDropped,
}

impl EventKind {
    /// Wire name, e.g. `call:start`.
    pub fn name(self) -> &'static str {
        match self {
            Self::CallStart => "call:start",
            Self::CallSuccess => "call:success",
            Self::CallError => "call:error",
            Self::CallRetry => "call:retry",
            Self::ConnectionOpen => "connection:open",
            Self::ConnectionClose => "connection:close",
            Self::ConnectionError => "connection:error",
            Self::AuthResolved => "auth:resolved",
            Self::AuthCacheHit => "auth:cache_hit",
            Self::AuthRefresh => "auth:refresh",
            Self::TransportMessageDropped => "transport:message_dropped",
        }
    }
}

/// One emitted event.
#[derive(Debug, Clone, Serialize)]
pub struct RuntimeEvent {
    pub kind: EventKind,
    pub timestamp: DateTime<Utc>,
    pub data: serde_json::Value,
}

// ─── Bus ─────────────────────────────────────────────────────────────────────

/// Default number of buffered events per subscriber before lagging.
const DEFAULT_CAPACITY: usize = 256;

/// Broadcast bus for [`RuntimeEvent`]s. Cheap to clone; clones share the channel.
#[derive(Debug, Clone)]
pub struct EventBus {
    sender: broadcast::Sender<RuntimeEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<RuntimeEvent> {
        self.sender.subscribe()
    }

    /// Publish an event, stamping it with the current time.
    ///
    /// Returns the number of subscribers that received it (zero when nobody
    /// listens, which is not an error).
    pub fn emit(&self, kind: EventKind, data: serde_json::Value) -> usize {
        let event = RuntimeEvent {
            kind,
            timestamp: Utc::now(),
            data,
        };
        tracing::trace!(event = kind.name(), "runtime event");
        self.sender.send(event).unwrap_or(0)
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

// ─── Logger ──────────────────────────────────────────────────────────────────

/// Minimal logging surface for host programs that want to capture runtime
/// logs without installing a `tracing` subscriber.
pub trait Logger: Send + Sync {
    fn debug(&self, message: &str, context: Option<&serde_json::Value>);
    fn info(&self, message: &str, context: Option<&serde_json::Value>);
    fn warn(&self, message: &str, context: Option<&serde_json::Value>);
    fn error(&self, message: &str, context: Option<&serde_json::Value>);
}

/// [`Logger`] that forwards to `tracing` under the `toolbridge` target.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingLogger;

impl Logger for TracingLogger {
    fn debug(&self, message: &str, context: Option<&serde_json::Value>) {
        tracing::debug!(target: "toolbridge", context = ?context, "{message}");
    }

    fn info(&self, message: &str, context: Option<&serde_json::Value>) {
        tracing::info!(target: "toolbridge", context = ?context, "{message}");
    }

    fn warn(&self, message: &str, context: Option<&serde_json::Value>) {
        tracing::warn!(target: "toolbridge", context = ?context, "{message}");
    }

    fn error(&self, message: &str, context: Option<&serde_json::Value>) {
        tracing::error!(target: "toolbridge", context = ?context, "{message}");
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────
