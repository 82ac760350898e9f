//! Runtime error taxonomy.
//!
//! Every failure that crosses the runtime boundary is a [`RuntimeError`]:
//! a stable `code`, a human-readable `message`, a machine-usable
//! [`ErrorCategory`] and a `retryable` flag. Module-local error enums
//! (`McpError`, `HttpError`) convert into it at the adapter boundary, so no
//! transport-specific type ever reaches a caller.

use std::error::Error as StdError;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Convenience alias used throughout the crate.
pub type Result<T, E = RuntimeError> = std::result::Result<T, E>;

// ─── Category ────────────────────────────────────────────────────────────────

/// Coarse classification of a failure. The category alone decides the
/// default retryability of an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCategory {
    /// Bad or missing configuration, malformed tool ids.
    Config,
    /// Input or output did not match a schema.
    Validation,
    /// Tool discovery failed.
    Discovery,
    /// Could not establish or keep a connection.
    Connection,
    /// The tool ran and reported failure.
    Execution,
    /// An operation exceeded its time budget.
    Timeout,
    /// Low-level I/O or protocol failure.
    Transport,
    /// Credentials missing, rejected or unresolvable.
    Auth,
    /// The remote side asked us to slow down.
    RateLimit,
    /// Bug or unknown foreign error.
    Internal,
}

impl ErrorCategory {
    /// Default retryability for errors of this category.
    pub fn is_retryable_by_default(self) -> bool {
        matches!(
            self,
            Self::Transport | Self::Timeout | Self::Connection | Self::RateLimit
        )
    }

    /// Stable lower-case label, used in log fields and event payloads.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Config => "config",
            Self::Validation => "validation",
            Self::Discovery => "discovery",
            Self::Connection => "connection",
            Self::Execution => "execution",
            Self::Timeout => "timeout",
            Self::Transport => "transport",
            Self::Auth => "auth",
            Self::RateLimit => "rate_limit",
            Self::Internal => "internal",
        }
    }
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ─── Stable Codes ────────────────────────────────────────────────────────────

/// Stable error codes. Callers may match on these; they never change meaning.
pub mod codes {
    pub const INVALID_TOOL_ID: &str = "INVALID_TOOL_ID";
    pub const ADAPTER_NOT_FOUND: &str = "ADAPTER_NOT_FOUND";
    pub const INVALID_CONFIG: &str = "INVALID_CONFIG";
    pub const VALIDATION_FAILED: &str = "VALIDATION_FAILED";
    pub const TOOL_NOT_FOUND: &str = "TOOL_NOT_FOUND";
    pub const DISCOVERY_FAILED: &str = "DISCOVERY_FAILED";
    pub const SPEC_LOAD_FAILED: &str = "SPEC_LOAD_FAILED";
    pub const CONNECTION_FAILED: &str = "CONNECTION_FAILED";
    pub const CONNECTION_CLOSED: &str = "CONNECTION_CLOSED";
    pub const EXECUTION_FAILED: &str = "EXECUTION_FAILED";
    pub const HTTP_STATUS: &str = "HTTP_STATUS";
    pub const GRAPHQL_ERRORS: &str = "GRAPHQL_ERRORS";
    pub const RPC_ERROR: &str = "RPC_ERROR";
    pub const TIMEOUT: &str = "TIMEOUT";
    pub const TRANSPORT_FAILED: &str = "TRANSPORT_FAILED";
    pub const AUTH_FAILED: &str = "AUTH_FAILED";
    pub const AUTH_UNSUPPORTED: &str = "AUTH_UNSUPPORTED";
    pub const RATE_LIMITED: &str = "RATE_LIMITED";
    pub const INTERNAL: &str = "INTERNAL";
}

// ─── RuntimeError ────────────────────────────────────────────────────────────

/// Shared, cloneable handle to an underlying cause.
pub type Cause = Arc<dyn StdError + Send + Sync + 'static>;

/// The normalized error every runtime operation fails with.
#[derive(Debug, Clone, Error)]
#[error("[{code}] {message}")]
pub struct RuntimeError {
    /// Stable machine-readable code (see [`codes`]).
    pub code: &'static str,
    /// Human-readable description.
    pub message: String,
    /// Taxonomy category.
    pub category: ErrorCategory,
    /// Whether retrying may succeed. Defaults from the category.
    pub retryable: bool,
    /// Optional structured context (status codes, tool names, paths).
    pub context: Option<serde_json::Value>,
    /// Server-declared delay before the next attempt (rate limits).
    pub retry_after: Option<Duration>,
    /// Wrapped underlying error.
    #[source]
    pub cause: Option<Cause>,
}

impl RuntimeError {
    /// Create an error whose retryability follows its category.
    pub fn new(category: ErrorCategory, code: &'static str, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            category,
            retryable: category.is_retryable_by_default(),
            context: None,
            retry_after: None,
            cause: None,
        }
    }

    pub fn config(message: impl Into<String>) -> Self {
        Self::new(ErrorCategory::Config, codes::INVALID_CONFIG, message)
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Self::new(ErrorCategory::Validation, codes::VALIDATION_FAILED, message)
    }

    pub fn discovery(message: impl Into<String>) -> Self {
        Self::new(ErrorCategory::Discovery, codes::DISCOVERY_FAILED, message)
    }

    pub fn connection(message: impl Into<String>) -> Self {
        Self::new(ErrorCategory::Connection, codes::CONNECTION_FAILED, message)
    }

    pub fn execution(message: impl Into<String>) -> Self {
        Self::new(ErrorCategory::Execution, codes::EXECUTION_FAILED, message)
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(ErrorCategory::Timeout, codes::TIMEOUT, message)
    }

    pub fn transport(message: impl Into<String>) -> Self {
        Self::new(ErrorCategory::Transport, codes::TRANSPORT_FAILED, message)
    }

    pub fn auth(message: impl Into<String>) -> Self {
        Self::new(ErrorCategory::Auth, codes::AUTH_FAILED, message)
    }

    pub fn rate_limit(message: impl Into<String>, retry_after: Option<Duration>) -> Self {
        let mut err = Self::new(ErrorCategory::RateLimit, codes::RATE_LIMITED, message);
        err.retry_after = retry_after;
        err
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(ErrorCategory::Internal, codes::INTERNAL, message)
    }

    /// Replace the stable code.
    pub fn with_code(mut self, code: &'static str) -> Self {
        self.code = code;
        self
    }

    /// Override the category default.
    pub fn with_retryable(mut self, retryable: bool) -> Self {
        self.retryable = retryable;
        self
    }

    /// Attach structured context, merging object keys into any existing context.
    pub fn with_context(mut self, context: serde_json::Value) -> Self {
        self.context = match (self.context.take(), context) {
            (Some(serde_json::Value::Object(mut existing)), serde_json::Value::Object(extra)) => {
                existing.extend(extra);
                Some(serde_json::Value::Object(existing))
            }
            (_, ctx) => Some(ctx),
        };
        self
    }

    /// Attach an underlying cause.
    pub fn with_cause<E>(mut self, cause: E) -> Self
    where
        E: StdError + Send + Sync + 'static,
    {
        self.cause = Some(Arc::new(cause));
        self
    }

    /// Wrap an arbitrary foreign error into the INTERNAL category.
    pub fn wrap<E>(err: E) -> Self
    where
        E: StdError + Send + Sync + 'static,
    {
        Self::internal(err.to_string()).with_cause(err)
    }

    /// HTTP-like status stored in the context, if any.
    pub fn status(&self) -> Option<u16> {
        self.context
            .as_ref()
            .and_then(|c| c.get("status"))
            .and_then(serde_json::Value::as_u64)
            .and_then(|s| u16::try_from(s).ok())
    }

    /// Serializable summary, used for event payloads.
    pub fn to_json(&self) -> serde_json::Value {
        serde_json::json!({
            "code": self.code,
            "message": self.message,
            "category": self.category,
            "retryable": self.retryable,
            "context": self.context,
        })
    }
}

impl From<serde_json::Error> for RuntimeError {
    fn from(err: serde_json::Error) -> Self {
        Self::wrap(err)
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────
