//! Runtime configuration loading.
//!
//! A config names every source and how to reach it:
//!
//! ```yaml
//! retry:
//!   maxAttempts: 4
//! sources:
//!   files:
//!     type: mcp
//!     command: npx
//!     args: ["-y", "@modelcontextprotocol/server-filesystem", "/tmp"]
//!   petstore:
//!     type: openapi
//!     spec: https://petstore3.swagger.io/api/v3/openapi.json
//!     auth: { type: bearer, token: "${PETSTORE_TOKEN}" }
//!   countries:
//!     type: graphql
//!     endpoint: https://countries.trevorblades.com/
//! ```
//!
//! Auth strings keep their `${VAR}` references until a request resolves
//! them. MCP child environments are substituted when the registry is built.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

use serde::Deserialize;

use crate::adapter::{AdapterRegistry, SourceAdapter};
use crate::auth::{env, AuthResolver};
use crate::errors::{Result, RuntimeError};
use crate::events::EventBus;
use crate::http::{GraphQlAdapter, GraphQlSourceConfig, OpenApiSourceConfig, RestAdapter};
use crate::mcp::{McpAdapter, McpServerConfig};
use crate::retry::{RetryOverride, RetryPolicy};

// ─── Public Types ────────────────────────────────────────────────────────────

/// One source, tagged by transport.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum SourceConfig {
    /// Local MCP server over stdio. Credentials go through `env`.
    Mcp(McpServerConfig),
    #[serde(rename = "openapi", alias = "rest")]
    OpenApi(OpenApiSourceConfig),
    #[serde(rename = "graphql")]
    GraphQl(GraphQlSourceConfig),
}

impl SourceConfig {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Mcp(_) => "mcp",
            Self::OpenApi(_) => "openapi",
            Self::GraphQl(_) => "graphql",
        }
    }
}

/// Top-level runtime configuration.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RuntimeConfig {
    #[serde(default)]
    pub sources: BTreeMap<String, SourceConfig>,
    /// Overrides on top of [`RetryPolicy::default`].
    #[serde(default)]
    pub retry: Option<RetryOverride>,
}

// ─── Loading ─────────────────────────────────────────────────────────────────

impl RuntimeConfig {
    pub fn from_yaml_str(text: &str) -> Result<Self> {
        let config: Self = serde_yaml::from_str(text).map_err(|e| {
            RuntimeError::config(format!("failed to parse config: {e}")).with_cause(e)
        })?;
        config.check()?;
        Ok(config)
    }

    pub fn from_json_str(text: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(text).map_err(|e| {
            RuntimeError::config(format!("failed to parse config: {e}")).with_cause(e)
        })?;
        config.check()?;
        Ok(config)
    }

    /// Load a `.json` file as JSON and anything else as YAML.
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path).map_err(|e| {
            RuntimeError::config(format!("failed to read {}: {e}", path.display())).with_cause(e)
        })?;
        let is_json = path
            .extension()
            .and_then(|ext| ext.to_str())
            .is_some_and(|ext| ext.eq_ignore_ascii_case("json"));
        tracing::debug!(path = %path.display(), "loading runtime config");
        if is_json {
            Self::from_json_str(&raw)
        } else {
            Self::from_yaml_str(&raw)
        }
    }

    /// The base retry policy with this config's overrides applied.
    pub fn retry_policy(&self) -> RetryPolicy {
        match &self.retry {
            Some(overrides) => RetryPolicy::default().merged(overrides),
            None => RetryPolicy::default(),
        }
    }

    /// Build one adapter per source. Nothing connects until first use.
    pub fn build_registry(&self, events: &EventBus, resolver: Arc<AuthResolver>) -> AdapterRegistry {
        let registry = AdapterRegistry::new();
        for (name, source) in &self.sources {
            let adapter: Arc<dyn SourceAdapter> = match source {
                SourceConfig::Mcp(server) => Arc::new(McpAdapter::new(
                    name.clone(),
                    with_substituted_env(server),
                    events.clone(),
                )),
                SourceConfig::OpenApi(rest) => Arc::new(RestAdapter::new(
                    name.clone(),
                    rest.clone(),
                    Some(Arc::clone(&resolver)),
                )),
                SourceConfig::GraphQl(graphql) => Arc::new(GraphQlAdapter::new(
                    name.clone(),
                    graphql.clone(),
                    Some(Arc::clone(&resolver)),
                )),
            };
            registry.register_adapter(name.clone(), adapter);
        }
        tracing::info!(count = registry.len(), "adapter registry built");
        registry
    }

    fn check(&self) -> Result<()> {
        for (name, source) in &self.sources {
            if name.is_empty() || name.contains("__") {
                return Err(RuntimeError::config(format!(
                    "source name '{name}' must be non-empty and must not contain '__'"
                )));
            }
            let missing = match source {
                SourceConfig::Mcp(server) => server.command.trim().is_empty().then_some("command"),
                SourceConfig::GraphQl(graphql) => {
                    graphql.endpoint.trim().is_empty().then_some("endpoint")
                }
                SourceConfig::OpenApi(_) => None,
            };
            if let Some(field) = missing {
                return Err(RuntimeError::config(format!(
                    "{} source '{name}' is missing '{field}'",
                    source.kind()
                )));
            }
        }
        Ok(())
    }
}

fn with_substituted_env(server: &McpServerConfig) -> McpServerConfig {
    let mut server = server.clone();
    for value in server.env.values_mut() {
        *value = env::substitute(value);
    }
    server
}

// ─── Tests ───────────────────────────────────────────────────────────────────
