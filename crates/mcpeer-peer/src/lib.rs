//! MCP peers for mcpeer.
//!
//! Both peer flavors share the same machinery: a [`Router`] mapping inbound
//! requests and notifications to handlers behind a capability gate, a
//! [`Session`] owning the outbound correlation table and lifecycle state,
//! a [`WorkerPool`] for deferred handlers, and a bound
//! [`Transport`](mcpeer_transport::Transport). [`McpServer`] pre-registers
//! the server method surface; [`McpClient`] drives the handshake and serves
//! the reverse direction (sampling, roots, elicitation).
//!
//! # Example
//!
//! ```no_run
//! use mcpeer_peer::{McpServer, ServerOptions};
//! use mcpeer_protocol::{CallToolResult, ToolDefinition};
//! use serde_json::json;
//!
//! let server = McpServer::new(ServerOptions::new("echo-server", "0.1.0"));
//! server.add_tool(
//!     ToolDefinition::new("echo", json!({"type": "object"})),
//!     |args| {
//!         let text = args["text"].as_str().unwrap_or_default();
//!         Ok(CallToolResult::text(text))
//!     },
//! );
//! server.serve_stdio().unwrap();
//! ```

#![forbid(unsafe_code)]

pub mod client;
pub mod paged;
pub mod pool;
pub mod router;
pub mod server;
pub mod session;

#[cfg(test)]
mod tests;

pub use client::{ClientOptions, ElicitationHandler, McpClient, RootsHandler, SamplingHandler};
pub use paged::PagedStore;
pub use pool::WorkerPool;
pub use router::{NotificationHandler, RequestHandler, Router};
pub use server::{
    CompletionHandler, McpServer, PromptGetHandler, ResourceReadHandler, ServerOptions,
    ToolHandler,
};
pub use session::{Session, SessionState};

use mcpeer_core::{McpError, McpResult};
use serde_json::Value;

/// Decodes request params at the handler boundary.
pub(crate) fn parse_params<T: serde::de::DeserializeOwned>(params: Value) -> McpResult<T> {
    serde_json::from_value(params).map_err(|e| McpError::invalid_params(e.to_string()))
}

/// Decodes a peer's result payload.
pub(crate) fn parse_result<T: serde::de::DeserializeOwned>(value: Value) -> McpResult<T> {
    serde_json::from_value(value).map_err(|e| McpError::parse(format!("invalid result: {e}")))
}
