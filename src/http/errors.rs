//! HTTP adapter error types.
//!
//! Carry the endpoint and status needed for log entries; converted into
//! [`RuntimeError`] at the adapter boundary.

use std::time::Duration;

use thiserror::Error;

use crate::errors::{codes, ErrorCategory, RuntimeError};

/// Longest response body kept in error context.
const BODY_CONTEXT_CHARS: usize = 1000;

/// Errors that can occur while talking to an HTTP source.
#[derive(Debug, Error)]
pub enum HttpError {
    /// The reqwest client could not be built.
    #[error("failed to build HTTP client: {reason}")]
    ClientBuild { reason: String },

    /// TCP/TLS connection to the endpoint failed.
    #[error("connection failed to {endpoint}: {reason}")]
    ConnectionFailed { endpoint: String, reason: String },

    /// The endpoint did not answer within the configured timeout.
    #[error("request to {endpoint} timed out after {timeout_ms}ms")]
    Timeout { endpoint: String, timeout_ms: u64 },

    /// Any other failure while sending or reading the body.
    #[error("request to {endpoint} failed: {reason}")]
    RequestFailed { endpoint: String, reason: String },

    /// Non-2xx HTTP response.
    #[error("HTTP {status} from {endpoint}: {body}")]
    Status {
        endpoint: String,
        status: u16,
        body: String,
        retry_after: Option<Duration>,
    },

    /// The request could not be built from the given parameters.
    #[error("invalid request for '{tool}': {reason}")]
    InvalidRequest { tool: String, reason: String },

    /// The API description could not be loaded or parsed.
    #[error("failed to load API spec from {location}: {reason}")]
    SpecLoad { location: String, reason: String },

    /// The tool name does not match anything the source describes.
    #[error("unknown tool: '{tool}'")]
    UnknownTool { tool: String },

    /// A GraphQL response carried an `errors` array.
    #[error("GraphQL errors for '{field}': {message}")]
    GraphQl {
        field: String,
        message: String,
        errors: serde_json::Value,
    },

    /// The response body did not have the expected shape.
    #[error("invalid response from {endpoint}: {reason}")]
    InvalidResponse { endpoint: String, reason: String },
}

impl HttpError {
    /// HTTP status, if this error came from a response.
    pub fn status(&self) -> Option<u16> {
        match self {
            HttpError::Status { status, .. } => Some(*status),
            _ => None,
        }
    }

    /// Whether the server rejected the credentials.
    pub fn is_auth_rejection(&self) -> bool {
        matches!(self.status(), Some(401))
    }
}

impl From<HttpError> for RuntimeError {
    fn from(err: HttpError) -> Self {
        let message = err.to_string();
        let base = match &err {
            HttpError::ClientBuild { .. } => RuntimeError::internal(message),
            HttpError::ConnectionFailed { endpoint, .. } => RuntimeError::connection(message)
                .with_context(serde_json::json!({ "endpoint": endpoint })),
            HttpError::Timeout {
                endpoint,
                timeout_ms,
            } => RuntimeError::timeout(message)
                .with_context(serde_json::json!({ "endpoint": endpoint, "timeoutMs": timeout_ms })),
            HttpError::RequestFailed { endpoint, .. } => RuntimeError::transport(message)
                .with_context(serde_json::json!({ "endpoint": endpoint })),
            HttpError::Status {
                endpoint,
                status,
                body,
                retry_after,
            } => {
                let context = serde_json::json!({
                    "endpoint": endpoint,
                    "status": status,
                    "body": truncate(body),
                });
                match status {
                    401 | 403 => RuntimeError::auth(message),
                    429 => RuntimeError::rate_limit(message, *retry_after),
                    _ => RuntimeError::new(ErrorCategory::Execution, codes::HTTP_STATUS, message),
                }
                .with_context(context)
            }
            HttpError::InvalidRequest { tool, .. } => RuntimeError::validation(message)
                .with_context(serde_json::json!({ "tool": tool })),
            HttpError::SpecLoad { location, .. } => {
                RuntimeError::new(ErrorCategory::Discovery, codes::SPEC_LOAD_FAILED, message)
                    .with_context(serde_json::json!({ "location": location }))
            }
            HttpError::UnknownTool { tool } => {
                RuntimeError::new(ErrorCategory::Config, codes::TOOL_NOT_FOUND, message)
                    .with_context(serde_json::json!({ "tool": tool }))
            }
            HttpError::GraphQl { field, errors, .. } => {
                RuntimeError::new(ErrorCategory::Execution, codes::GRAPHQL_ERRORS, message)
                    .with_context(serde_json::json!({ "field": field, "errors": errors }))
            }
            HttpError::InvalidResponse { endpoint, .. } => RuntimeError::transport(message)
                .with_context(serde_json::json!({ "endpoint": endpoint })),
        };
        base.with_cause(err)
    }
}

fn truncate(body: &str) -> String {
    if body.chars().count() <= BODY_CONTEXT_CHARS {
        return body.to_string();
    }
    let mut out: String = body.chars().take(BODY_CONTEXT_CHARS).collect();
    out.push_str("...(truncated)");
    out
}
