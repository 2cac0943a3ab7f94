//! mcpeer: a bidirectional Model Context Protocol peer library.
//!
//! An MCP peer acts as either a *server* (exposing tools, resources,
//! prompts, completions, and logging) or a *client* (consuming those
//! capabilities, and optionally serving sampling/roots/elicitation requests
//! back to the server). Both flavors share one JSON-RPC 2.0 session engine
//! over pluggable byte-stream transports: line-delimited stdio and
//! Streamable HTTP ship in the box.
//!
//! This crate is a facade re-exporting the workspace:
//!
//! - [`mcpeer_protocol`]: wire types
//! - [`mcpeer_transport`]: transports and the frame codec
//! - [`mcpeer_peer`]: [`McpServer`] and [`McpClient`]
//!
//! # Server example
//!
//! ```no_run
//! use mcpeer::prelude::*;
//! use serde_json::json;
//!
//! let server = McpServer::new(ServerOptions::new("echo-server", "1.0.0"));
//! server.add_tool(
//!     ToolDefinition::new("echo", json!({"type": "object"})),
//!     |args| {
//!         let text = args["text"].as_str().unwrap_or_default();
//!         Ok(CallToolResult::text(text))
//!     },
//! );
//! server.serve_stdio().unwrap();
//! ```
//!
//! # Client example
//!
//! ```no_run
//! use std::sync::Arc;
//! use mcpeer::prelude::*;
//!
//! let client = McpClient::new(ClientOptions::new("demo-client", "1.0.0"));
//! let transport = Arc::new(HttpClientTransport::new("http://127.0.0.1:8080/mcp"));
//! client.connect(transport).unwrap();
//! let init = client.initialize().unwrap();
//! println!("connected to {}", init.server_info.name);
//! ```

#![forbid(unsafe_code)]

pub use mcpeer_core::{McpError, McpResult, codes, logging};
pub use mcpeer_peer::{
    ClientOptions, McpClient, McpServer, PagedStore, Router, ServerOptions, Session, SessionState,
    WorkerPool,
};
pub use mcpeer_protocol as protocol;
pub use mcpeer_transport::{
    Codec, HttpClientTransport, HttpServerOptions, HttpServerTransport, StdioTransport, Transport,
};

/// Commonly used items, importable in one line.
pub mod prelude {
    pub use mcpeer_core::{McpError, McpResult};
    pub use mcpeer_peer::{ClientOptions, McpClient, McpServer, ServerOptions};
    pub use mcpeer_protocol::{
        Annotations, CallToolResult, ClientCapabilities, CompletionRef, CompletionResult, Content,
        GetPromptResult, Implementation, InitializeResult, LogLevel, PromptArgument,
        PromptDefinition, PromptMessage, ResourceContent, ResourceDefinition, ResourceTemplate,
        Root, SamplingRequest, SamplingResult, ServerCapabilities, ToolDefinition,
    };
    pub use mcpeer_transport::{
        HttpClientTransport, HttpServerOptions, HttpServerTransport, StdioTransport, Transport,
    };
}
