//! MCP transport error types.

use thiserror::Error;

use crate::errors::{codes, ErrorCategory, RuntimeError};

/// Errors that can occur while talking to an MCP server.
#[derive(Debug, Error)]
pub enum McpError {
    /// The server process failed to start.
    #[error("failed to spawn server '{name}': {reason}")]
    SpawnFailed { name: String, reason: String },

    /// The initialization handshake failed.
    #[error("server '{name}' initialization failed: {reason}")]
    InitFailed { name: String, reason: String },

    /// I/O or framing failure on stdio.
    #[error("transport error for server '{server}': {reason}")]
    TransportError { server: String, reason: String },

    /// The connection went away while a request was pending.
    #[error("connection to server '{server}' closed: {reason}")]
    ConnectionClosed { server: String, reason: String },

    /// Server returned a JSON-RPC error response.
    #[error("server error [{code}]: {message}")]
    ServerError {
        code: i32,
        message: String,
        data: Option<serde_json::Value>,
    },

    /// A tool reported failure via `isError`.
    #[error("tool '{tool}' failed: {message}")]
    ToolFailed { tool: String, message: String },

    /// A request exceeded its budget.
    #[error("'{method}' on server '{server}' timed out after {timeout_ms}ms")]
    Timeout {
        server: String,
        method: String,
        timeout_ms: u64,
    },

    /// Server replied with something that is not the expected shape.
    #[error("invalid response from server '{server}': {reason}")]
    InvalidResponse { server: String, reason: String },

    /// Reconnect-and-retry cycles exhausted.
    #[error("tool '{tool}' failed after {attempts} reconnect attempts: {last}")]
    RetriesExhausted {
        tool: String,
        attempts: u32,
        last: Box<McpError>,
    },
}

impl From<McpError> for RuntimeError {
    fn from(err: McpError) -> Self {
        let message = err.to_string();
        match err {
            McpError::SpawnFailed { ref name, .. } | McpError::InitFailed { ref name, .. } => {
                let server = name.clone();
                RuntimeError::connection(message)
                    .with_context(serde_json::json!({ "server": server }))
                    .with_cause(err)
            }
            McpError::ConnectionClosed { ref server, .. } => {
                let server = server.clone();
                RuntimeError::new(ErrorCategory::Connection, codes::CONNECTION_CLOSED, message)
                    .with_context(serde_json::json!({ "server": server }))
                    .with_cause(err)
            }
            McpError::TransportError { .. } | McpError::InvalidResponse { .. } => {
                RuntimeError::transport(message).with_cause(err)
            }
            McpError::ServerError { code, ref data, .. } => {
                let context = serde_json::json!({ "rpcCode": code, "data": data });
                RuntimeError::new(ErrorCategory::Execution, codes::RPC_ERROR, message)
                    .with_context(context)
                    .with_cause(err)
            }
            McpError::ToolFailed { ref tool, .. } => {
                let tool = tool.clone();
                RuntimeError::execution(message)
                    .with_context(serde_json::json!({ "tool": tool }))
                    .with_cause(err)
            }
            McpError::Timeout {
                ref method,
                timeout_ms,
                ..
            } => {
                let context = serde_json::json!({ "method": method, "timeoutMs": timeout_ms });
                RuntimeError::timeout(message)
                    .with_context(context)
                    .with_cause(err)
            }
            McpError::RetriesExhausted { ref tool, attempts, .. } => {
                let context = serde_json::json!({ "tool": tool, "attempts": attempts });
                RuntimeError::execution(message)
                    .with_context(context)
                    .with_cause(err)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timeout_maps_to_timeout_category() {
        let err: RuntimeError = McpError::Timeout {
            server: "fs".into(),
            method: "tools/call".into(),
            timeout_ms: 60_000,
        }
        .into();
        assert_eq!(err.category, ErrorCategory::Timeout);
        assert!(err.retryable);
    }

    #[test]
    fn test_closed_maps_to_connection_closed() {
        let err: RuntimeError = McpError::ConnectionClosed {
            server: "fs".into(),
            reason: "stdout EOF".into(),
        }
        .into();
        assert_eq!(err.category, ErrorCategory::Connection);
        assert_eq!(err.code, codes::CONNECTION_CLOSED);
    }

    #[test]
    fn test_exhausted_is_execution_with_cause() {
        let err: RuntimeError = McpError::RetriesExhausted {
            tool: "read".into(),
            attempts: 2,
            last: Box::new(McpError::ToolFailed {
                tool: "read".into(),
                message: "no such file".into(),
            }),
        }
        .into();
        assert_eq!(err.category, ErrorCategory::Execution);
        assert!(err.message.contains("no such file"));
        assert!(std::error::Error::source(&err).is_some());
    }
}
