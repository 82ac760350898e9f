//! MCP source adapter.
//!
//! Holds one lazily created [`StdioTransport`] per source and reuses it
//! across calls. A broken connection is replaced on the next use; a call
//! that fails at the transport level is re-issued over a fresh connection
//! up to `max_retries` times.

use std::sync::Arc;

use async_trait::async_trait;
use futures::future::BoxFuture;
use tokio::sync::Mutex;

use super::errors::McpError;
use super::transport::StdioTransport;
use super::types::{CallToolResult, ListToolsResult, McpServerConfig};
use crate::adapter::{SourceAdapter, ToolDefinition};
use crate::errors::{Result, RuntimeError};
use crate::events::{EventBus, EventKind};

/// Upper bound on `tools/list` pages, against servers that loop cursors.
const MAX_LIST_PAGES: usize = 100;

/// Produces a connected transport. The default spawns the configured command.
pub type Connector =
    Arc<dyn Fn() -> BoxFuture<'static, std::result::Result<StdioTransport, McpError>> + Send + Sync>;

// ─── McpAdapter ──────────────────────────────────────────────────────────────

pub struct McpAdapter {
    name: String,
    config: McpServerConfig,
    events: EventBus,
    connector: Connector,
    connection: Mutex<Option<Arc<StdioTransport>>>,
}

impl McpAdapter {
    pub fn new(name: impl Into<String>, config: McpServerConfig, events: EventBus) -> Self {
        let name = name.into();
        let connector = spawn_connector(name.clone(), config.clone(), events.clone());
        Self::with_connector(name, config, events, connector)
    }

    /// Use a custom connector instead of spawning `config.command`.
    pub fn with_connector(
        name: impl Into<String>,
        config: McpServerConfig,
        events: EventBus,
        connector: Connector,
    ) -> Self {
        Self {
            name: name.into(),
            config,
            events,
            connector,
            connection: Mutex::new(None),
        }
    }

    /// The live transport, connecting first if there is none.
    async fn transport(&self) -> std::result::Result<Arc<StdioTransport>, McpError> {
        let mut slot = self.connection.lock().await;
        if let Some(existing) = slot.as_ref() {
            if existing.is_connected() {
                return Ok(Arc::clone(existing));
            }
            tracing::info!(source = %self.name, "MCP connection lost; reconnecting");
            existing.close().await;
            *slot = None;
            self.events.emit(
                EventKind::ConnectionClose,
                serde_json::json!({ "source": self.name, "reason": "connection lost" }),
            );
        }

        match (self.connector)().await {
            Ok(transport) => {
                let transport = Arc::new(transport);
                *slot = Some(Arc::clone(&transport));
                self.events.emit(
                    EventKind::ConnectionOpen,
                    serde_json::json!({ "source": self.name, "transport": "stdio" }),
                );
                Ok(transport)
            }
            Err(e) => {
                tracing::warn!(source = %self.name, error = %e, "MCP connect failed");
                self.events.emit(
                    EventKind::ConnectionError,
                    serde_json::json!({ "source": self.name, "error": e.to_string() }),
                );
                Err(e)
            }
        }
    }

    /// Close and forget the current transport, if any.
    async fn disconnect(&self) -> bool {
        let taken = self.connection.lock().await.take();
        match taken {
            Some(transport) => {
                transport.close().await;
                self.events.emit(
                    EventKind::ConnectionClose,
                    serde_json::json!({ "source": self.name }),
                );
                true
            }
            None => false,
        }
    }

    async fn call_once(
        &self,
        tool: &str,
        params: &serde_json::Value,
    ) -> std::result::Result<serde_json::Value, McpError> {
        let transport = self.transport().await?;
        let result = transport
            .request(
                "tools/call",
                Some(serde_json::json!({ "name": tool, "arguments": params })),
            )
            .await?;
        extract_tool_result(tool, result)
    }

    async fn list_tools(&self) -> std::result::Result<Vec<ToolDefinition>, McpError> {
        let transport = self.transport().await?;
        let mut tools = Vec::new();
        let mut cursor: Option<String> = None;

        for _ in 0..MAX_LIST_PAGES {
            let params = cursor
                .as_ref()
                .map(|c| serde_json::json!({ "cursor": c }));
            let raw = transport.request("tools/list", params).await?;
            let page: ListToolsResult =
                serde_json::from_value(raw).map_err(|e| McpError::InvalidResponse {
                    server: self.name.clone(),
                    reason: format!("failed to parse tools/list response: {e}"),
                })?;

            tools.extend(page.tools.into_iter().map(|t| ToolDefinition {
                name: t.name,
                description: t.description,
                input_schema: t
                    .input_schema
                    .unwrap_or_else(|| serde_json::json!({ "type": "object" })),
                output_schema: t.output_schema,
            }));

            match page.next_cursor.filter(|c| !c.is_empty()) {
                Some(next) if cursor.as_deref() != Some(next.as_str()) => cursor = Some(next),
                _ => return Ok(tools),
            }
        }

        tracing::warn!(source = %self.name, pages = MAX_LIST_PAGES, "tools/list pagination cut off");
        Ok(tools)
    }
}

#[async_trait]
impl SourceAdapter for McpAdapter {
    fn kind(&self) -> &'static str {
        "mcp"
    }

    async fn discover(&self) -> Result<Vec<ToolDefinition>> {
        let tools = self.list_tools().await.map_err(|e| match e {
            McpError::ServerError { .. } | McpError::InvalidResponse { .. } => {
                RuntimeError::discovery(format!("tool discovery on '{}' failed: {e}", self.name))
                    .with_cause(e)
            }
            other => RuntimeError::from(other),
        })?;
        tracing::debug!(source = %self.name, count = tools.len(), "discovered MCP tools");
        Ok(tools)
    }

    async fn execute(&self, tool: &str, params: serde_json::Value) -> Result<serde_json::Value> {
        let mut reconnects = 0u32;
        loop {
            match self.call_once(tool, &params).await {
                Ok(value) => return Ok(value),
                Err(e) if is_connection_fault(&e) && reconnects < self.config.max_retries => {
                    reconnects += 1;
                    tracing::warn!(
                        source = %self.name,
                        tool = %tool,
                        attempt = reconnects,
                        max_retries = self.config.max_retries,
                        error = %e,
                        "MCP call failed; reconnecting"
                    );
                    self.disconnect().await;
                }
                Err(e) if reconnects > 0 => {
                    return Err(McpError::RetriesExhausted {
                        tool: tool.to_string(),
                        attempts: reconnects,
                        last: Box::new(e),
                    }
                    .into());
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    async fn validate(&self) -> bool {
        match self.transport().await {
            Ok(_) => true,
            Err(e) => {
                tracing::debug!(source = %self.name, error = %e, "MCP validation failed");
                false
            }
        }
    }

    async fn close(&self) -> Result<()> {
        if self.disconnect().await {
            tracing::info!(source = %self.name, "MCP adapter closed");
        }
        Ok(())
    }
}

// ─── Helpers ─────────────────────────────────────────────────────────────────

fn spawn_connector(name: String, config: McpServerConfig, events: EventBus) -> Connector {
    Arc::new(move || -> BoxFuture<'static, std::result::Result<StdioTransport, McpError>> {
        let (name, config, events) = (name.clone(), config.clone(), events.clone());
        Box::pin(async move {
            StdioTransport::connect(&name, &config, events)
                .await
                .map(|(transport, _init)| transport)
        })
    })
}

/// Failures a fresh connection might cure. Tool and RPC errors come from a
/// healthy server and are returned as-is.
fn is_connection_fault(err: &McpError) -> bool {
    matches!(
        err,
        McpError::SpawnFailed { .. }
            | McpError::InitFailed { .. }
            | McpError::TransportError { .. }
            | McpError::ConnectionClosed { .. }
            | McpError::Timeout { .. }
            | McpError::InvalidResponse { .. }
    )
}

/// Unwrap a `tools/call` result to plain data.
///
/// One content item yields its `text` (or the item itself), none yields
/// null, several yield the item array. `isError` becomes a failure carrying
/// the content text.
pub fn extract_tool_result(
    tool: &str,
    result: serde_json::Value,
) -> std::result::Result<serde_json::Value, McpError> {
    let has_content = result.get("content").is_some();
    let parsed: CallToolResult = serde_json::from_value(result.clone()).unwrap_or_default();

    if parsed.is_error {
        let message = parsed
            .content
            .iter()
            .filter_map(|item| item.get("text").and_then(serde_json::Value::as_str))
            .collect::<Vec<_>>()
            .join("\n");
        return Err(McpError::ToolFailed {
            tool: tool.to_string(),
            message: if message.is_empty() {
                "tool reported an error".to_string()
            } else {
                message
            },
        });
    }

    if !has_content {
        return Ok(parsed.structured_content.unwrap_or(result));
    }

    let mut content = parsed.content;
    Ok(match content.len() {
        0 => serde_json::Value::Null,
        1 => {
            let item = content.remove(0);
            match item.get("text") {
                Some(text) => text.clone(),
                None => item,
            }
        }
        _ => serde_json::Value::Array(content),
    })
}

// ─── Tests ───────────────────────────────────────────────────────────────────
