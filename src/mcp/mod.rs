//! MCP client over stdio.
//!
//! Spawns server processes, speaks newline-delimited JSON-RPC 2.0 with them,
//! and exposes their tools as a [`SourceAdapter`](crate::adapter::SourceAdapter).

pub mod adapter;
pub mod correlator;
pub mod errors;
pub mod transport;
pub mod types;

pub use adapter::{extract_tool_result, Connector, McpAdapter};
pub use errors::McpError;
pub use transport::StdioTransport;
pub use types::McpServerConfig;
