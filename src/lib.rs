//! Toolbridge: one call surface over heterogeneous tool backends.
//!
//! Local MCP servers over stdio, REST endpoints described by OpenAPI, and
//! GraphQL endpoints are each wrapped in a [`SourceAdapter`]. The
//! [`Dispatcher`] routes `source__tool` ids to them under a retry policy and
//! reports every call on the [`EventBus`]. All failures surface as one
//! [`RuntimeError`] shape.

pub mod adapter;
pub mod auth;
pub mod config;
pub mod dispatcher;
pub mod errors;
pub mod events;
pub mod http;
pub mod mcp;
pub mod retry;
pub mod schema;

use std::path::Path;
use std::sync::Arc;

pub use adapter::{AdapterRegistry, SourceAdapter, ToolDefinition};
pub use auth::{AuthConfig, AuthResolver};
pub use config::{RuntimeConfig, SourceConfig};
pub use dispatcher::{CallOptions, Dispatcher, ToolId};
pub use errors::{ErrorCategory, Result, RuntimeError};
pub use events::{EventBus, EventKind, Logger, RuntimeEvent, TracingLogger};
pub use retry::{retry_with_backoff, RetryOverride, RetryPolicy};

// ─── Tracing ─────────────────────────────────────────────────────────────────

/// Filter used when `RUST_LOG` is unset.
pub const DEFAULT_LOG_FILTER: &str = "toolbridge=info,warn";

/// Output format for [`init_tracing`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum LogFormat {
    #[default]
    Text,
    /// One JSON object per line.
    Json,
}

/// Install a global `tracing` subscriber writing to stderr.
///
/// `RUST_LOG` wins over `default_filter`. Returns `false` if a subscriber
/// was already installed, in which case nothing changes.
pub fn init_tracing(default_filter: &str, format: LogFormat) -> bool {
    use tracing_subscriber::fmt;
    use tracing_subscriber::EnvFilter;

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));
    let builder = fmt::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(true)
        .with_thread_ids(false);

    let installed = match format {
        LogFormat::Text => builder.try_init().is_ok(),
        LogFormat::Json => builder.json().try_init().is_ok(),
    };
    if installed {
        tracing::info!(version = env!("CARGO_PKG_VERSION"), "toolbridge tracing initialized");
    }
    installed
}

// ─── Runtime ─────────────────────────────────────────────────────────────────

/// Everything a host needs, wired from one [`RuntimeConfig`].
pub struct Runtime {
    pub events: EventBus,
    pub auth: Arc<AuthResolver>,
    pub dispatcher: Dispatcher,
}

impl Runtime {
    pub fn from_config(config: &RuntimeConfig) -> Result<Self> {
        let events = EventBus::default();
        let auth = Arc::new(AuthResolver::new(events.clone())?);
        let registry = Arc::new(config.build_registry(&events, Arc::clone(&auth)));
        let dispatcher = Dispatcher::new(registry, events.clone()).with_policy(config.retry_policy());
        Ok(Self {
            events,
            auth,
            dispatcher,
        })
    }

    /// Load a YAML or JSON config file and build the runtime from it.
    pub fn from_path(path: &Path) -> Result<Self> {
        Self::from_config(&RuntimeConfig::load(path)?)
    }

    pub async fn call(&self, tool_id: &str, params: serde_json::Value) -> Result<serde_json::Value> {
        self.dispatcher.call(tool_id, params).await
    }

    /// Close every adapter. Safe to call more than once.
    pub async fn shutdown(&self) {
        self.dispatcher.shutdown().await;
    }
}
