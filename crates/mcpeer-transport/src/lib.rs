//! Transports for mcpeer.
//!
//! A [`Transport`] moves JSON-RPC frames between peers over some byte
//! stream. Two implementations ship with the workspace:
//!
//! - [`StdioTransport`]: newline-delimited JSON over a file-descriptor pair
//!   (stdin/stdout for subprocess servers)
//! - [`HttpServerTransport`] / [`HttpClientTransport`]: the Streamable HTTP
//!   binding (POST request/response, optional SSE streaming, session-ID
//!   header management)
//!
//! The [`Codec`] sits underneath both, turning raw JSON text into the frame
//! union and back.

pub mod codec;
pub mod http;
pub mod stdio;

use std::sync::Arc;

use mcpeer_core::{McpError, McpResult};
use mcpeer_protocol::JsonRpcMessage;

pub use codec::Codec;
pub use http::{HttpClientTransport, HttpServerOptions, HttpServerTransport};
pub use stdio::StdioTransport;

/// Callback invoked for every inbound frame.
///
/// The return value is the immediate reply, if any: peers return
/// `Some(response)` for requests they dispatched and `None` for
/// notifications and correlated responses. Reply-bearing transports (HTTP
/// POST) deliver the reply inside the originating request context; stream
/// transports put it on their ordinary send path.
pub type MessageCallback = Arc<dyn Fn(JsonRpcMessage) -> Option<JsonRpcMessage> + Send + Sync>;

/// Callback invoked for transport-level and codec-level errors that do not
/// terminate the stream.
pub type ErrorCallback = Arc<dyn Fn(McpError) + Send + Sync>;

/// A bidirectional frame transport.
///
/// All methods take `&self`; implementations synchronize internally so a
/// transport can be shared across threads behind an `Arc`.
pub trait Transport: Send + Sync {
    /// Runs the transport, invoking `on_message` for each inbound frame.
    ///
    /// Blocks the calling thread until [`shutdown`](Transport::shutdown) is
    /// invoked or the peer disconnects. Parse errors are reported through
    /// `on_error` and do not terminate the loop.
    ///
    /// # Errors
    ///
    /// Returns an error if the transport cannot be brought up (e.g. a
    /// listener fails to bind).
    fn start(&self, on_message: MessageCallback, on_error: Option<ErrorCallback>) -> McpResult<()>;

    /// Sends a frame to the remote peer.
    ///
    /// Frames are delivered in the order `send` was called.
    ///
    /// # Errors
    ///
    /// Returns a transport error after [`shutdown`](Transport::shutdown) or
    /// when the underlying stream has failed.
    fn send(&self, message: &JsonRpcMessage) -> McpResult<()>;

    /// Initiates shutdown. Idempotent; unblocks a pending `start`.
    fn shutdown(&self);

    /// Returns true while the transport is usable.
    fn is_connected(&self) -> bool;
}
