//! Source adapters and the registry that owns them.
//!
//! A [`SourceAdapter`] speaks one transport (MCP over stdio, REST/OpenAPI,
//! GraphQL) and exposes the same four capabilities for all of them. The
//! [`AdapterRegistry`] maps source names to adapters; the dispatcher routes
//! `source__tool` ids through it.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::errors::Result;

// ─── ToolDefinition ──────────────────────────────────────────────────────────

/// A tool as reported by discovery. Schemas are raw JSON Schema values,
/// exactly as the source described them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolDefinition {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default = "empty_object_schema")]
    pub input_schema: serde_json::Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_schema: Option<serde_json::Value>,
}

fn empty_object_schema() -> serde_json::Value {
    serde_json::json!({ "type": "object" })
}

// ─── SourceAdapter ───────────────────────────────────────────────────────────

/// One backend transport.
#[async_trait]
pub trait SourceAdapter: Send + Sync {
    /// Short transport label (`mcp`, `openapi`, `graphql`) for logs.
    fn kind(&self) -> &'static str;

    /// Current tool catalog. Not cached by the adapter.
    async fn discover(&self) -> Result<Vec<ToolDefinition>>;

    /// Invoke `tool` once and return its result as plain data.
    async fn execute(&self, tool: &str, params: serde_json::Value) -> Result<serde_json::Value>;

    /// Best-effort connectivity and configuration check. Never errors.
    async fn validate(&self) -> bool;

    /// Release transport resources. Calling it again is a no-op.
    async fn close(&self) -> Result<()>;
}

// ─── AdapterRegistry ─────────────────────────────────────────────────────────

/// Source name → adapter. Last registration for a name wins.
#[derive(Default)]
pub struct AdapterRegistry {
    adapters: RwLock<HashMap<String, Arc<dyn SourceAdapter>>>,
}

impl AdapterRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `adapter` under `name`.
    ///
    /// Returns the adapter previously registered under that name, if any. It
    /// is NOT closed; closing superseded adapters is the caller's job.
    pub fn register_adapter(
        &self,
        name: impl Into<String>,
        adapter: Arc<dyn SourceAdapter>,
    ) -> Option<Arc<dyn SourceAdapter>> {
        let name = name.into();
        tracing::debug!(source = %name, kind = adapter.kind(), "registering adapter");
        let previous = self.write().insert(name.clone(), adapter);
        if previous.is_some() {
            tracing::info!(source = %name, "adapter replaced; previous instance left open");
        }
        previous
    }

    /// Look up the adapter for a source.
    pub fn get(&self, name: &str) -> Option<Arc<dyn SourceAdapter>> {
        self.read().get(name).cloned()
    }

    /// Remove and return the adapter for a source, without closing it.
    pub fn unregister(&self, name: &str) -> Option<Arc<dyn SourceAdapter>> {
        self.write().remove(name)
    }

    /// Registered source names, sorted.
    pub fn source_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.read().keys().cloned().collect();
        names.sort();
        names
    }

    /// Snapshot of every `(name, adapter)` pair, sorted by name.
    pub fn entries(&self) -> Vec<(String, Arc<dyn SourceAdapter>)> {
        let mut entries: Vec<_> = self
            .read()
            .iter()
            .map(|(name, adapter)| (name.clone(), Arc::clone(adapter)))
            .collect();
        entries.sort_by(|a, b| a.0.cmp(&b.0));
        entries
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }

    /// Close every adapter and empty the registry. Close failures are logged.
    pub async fn close_all(&self) {
        let drained: Vec<(String, Arc<dyn SourceAdapter>)> = self.write().drain().collect();
        for (name, adapter) in drained {
            if let Err(e) = adapter.close().await {
                tracing::warn!(source = %name, error = %e, "adapter close failed");
            }
        }
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, HashMap<String, Arc<dyn SourceAdapter>>> {
        self.adapters
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, HashMap<String, Arc<dyn SourceAdapter>>> {
        self.adapters
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────
