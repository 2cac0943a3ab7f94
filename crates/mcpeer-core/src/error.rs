//! Error taxonomy for MCP operations.
//!
//! Four error kinds cover the whole library: `Parse` for malformed frames,
//! `Protocol` for well-formed JSON-RPC error responses (and for errors a
//! handler wants to put on the wire), `Transport` for I/O and lifecycle
//! failures, and `Timeout` for expired outbound calls. Only `Parse` and
//! `Protocol` carry wire-visible codes; `Transport` and `Timeout` are
//! internal and map to `-32603` if they ever need a wire shape.

use serde_json::Value;

/// JSON-RPC error codes used by MCP.
pub mod codes {
    /// Malformed JSON or structural frame violation.
    pub const PARSE_ERROR: i32 = -32700;
    /// Request violates the protocol (e.g. capability not negotiated).
    pub const INVALID_REQUEST: i32 = -32600;
    /// No handler registered for the method.
    pub const METHOD_NOT_FOUND: i32 = -32601;
    /// Parameters failed validation.
    pub const INVALID_PARAMS: i32 = -32602;
    /// Handler failure or other internal error.
    pub const INTERNAL_ERROR: i32 = -32603;
    /// MCP-specific: resource URI not known to the server.
    pub const RESOURCE_NOT_FOUND: i32 = -32002;
}

/// Result alias used throughout mcpeer.
pub type McpResult<T> = Result<T, McpError>;

/// Library-wide error type.
#[derive(Debug, Clone)]
pub enum McpError {
    /// Malformed JSON or a structural frame violation.
    Parse(String),
    /// A protocol-level error with a wire-visible code.
    Protocol {
        /// JSON-RPC error code.
        code: i32,
        /// Human-readable message.
        message: String,
        /// Optional structured payload.
        data: Option<Value>,
    },
    /// Transport failure: I/O error, peer closed, send after shutdown.
    Transport(String),
    /// An outbound request exceeded its deadline.
    Timeout(String),
}

impl McpError {
    /// Creates a parse error.
    #[must_use]
    pub fn parse(message: impl Into<String>) -> Self {
        McpError::Parse(message.into())
    }

    /// Creates a protocol error with an explicit code.
    #[must_use]
    pub fn protocol(code: i32, message: impl Into<String>) -> Self {
        McpError::Protocol {
            code,
            message: message.into(),
            data: None,
        }
    }

    /// Creates an invalid-request error (`-32600`).
    #[must_use]
    pub fn invalid_request(message: impl Into<String>) -> Self {
        Self::protocol(codes::INVALID_REQUEST, message)
    }

    /// Creates a method-not-found error (`-32601`).
    #[must_use]
    pub fn method_not_found(method: &str) -> Self {
        Self::protocol(codes::METHOD_NOT_FOUND, format!("Method not found: {method}"))
    }

    /// Creates an invalid-params error (`-32602`).
    #[must_use]
    pub fn invalid_params(message: impl Into<String>) -> Self {
        Self::protocol(codes::INVALID_PARAMS, message)
    }

    /// Creates an internal error (`-32603`).
    #[must_use]
    pub fn internal(message: impl Into<String>) -> Self {
        Self::protocol(codes::INTERNAL_ERROR, message)
    }

    /// Creates a resource-not-found error (`-32002`).
    #[must_use]
    pub fn resource_not_found(uri: &str) -> Self {
        Self::protocol(
            codes::RESOURCE_NOT_FOUND,
            format!("Resource not found: {uri}"),
        )
    }

    /// Creates a transport error.
    #[must_use]
    pub fn transport(message: impl Into<String>) -> Self {
        McpError::Transport(message.into())
    }

    /// Creates a timeout error.
    #[must_use]
    pub fn timeout(message: impl Into<String>) -> Self {
        McpError::Timeout(message.into())
    }

    /// Returns the wire-visible JSON-RPC code for this error.
    ///
    /// Transport and timeout errors never originate on the wire; when one
    /// must be surfaced as a response anyway it degrades to internal-error.
    #[must_use]
    pub fn wire_code(&self) -> i32 {
        match self {
            McpError::Parse(_) => codes::PARSE_ERROR,
            McpError::Protocol { code, .. } => *code,
            McpError::Transport(_) | McpError::Timeout(_) => codes::INTERNAL_ERROR,
        }
    }

    /// Returns the human-readable message.
    #[must_use]
    pub fn message(&self) -> &str {
        match self {
            McpError::Parse(m) | McpError::Transport(m) | McpError::Timeout(m) => m,
            McpError::Protocol { message, .. } => message,
        }
    }

    /// Returns true if this is a timeout error.
    #[must_use]
    pub fn is_timeout(&self) -> bool {
        matches!(self, McpError::Timeout(_))
    }

    /// Returns true if this is a transport error.
    #[must_use]
    pub fn is_transport(&self) -> bool {
        matches!(self, McpError::Transport(_))
    }
}

impl std::fmt::Display for McpError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            McpError::Parse(m) => write!(f, "parse error: {m}"),
            McpError::Protocol { code, message, .. } => {
                write!(f, "protocol error {code}: {message}")
            }
            McpError::Transport(m) => write!(f, "transport error: {m}"),
            McpError::Timeout(m) => write!(f, "timeout: {m}"),
        }
    }
}

impl std::error::Error for McpError {}

impl From<std::io::Error> for McpError {
    fn from(err: std::io::Error) -> Self {
        McpError::Transport(err.to_string())
    }
}

impl From<serde_json::Error> for McpError {
    fn from(err: serde_json::Error) -> Self {
        McpError::Parse(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wire_codes() {
        assert_eq!(McpError::parse("x").wire_code(), codes::PARSE_ERROR);
        assert_eq!(
            McpError::method_not_found("tools/list").wire_code(),
            codes::METHOD_NOT_FOUND
        );
        assert_eq!(
            McpError::resource_not_found("file:///a").wire_code(),
            codes::RESOURCE_NOT_FOUND
        );
        // Internal kinds degrade to internal-error on the wire.
        assert_eq!(
            McpError::transport("closed").wire_code(),
            codes::INTERNAL_ERROR
        );
        assert_eq!(
            McpError::timeout("tools/call").wire_code(),
            codes::INTERNAL_ERROR
        );
    }

    #[test]
    fn display_includes_kind_and_message() {
        let err = McpError::invalid_params("missing field `name`");
        let s = err.to_string();
        assert!(s.contains("-32602"));
        assert!(s.contains("missing field `name`"));

        assert!(McpError::timeout("ping").to_string().starts_with("timeout"));
    }

    #[test]
    fn io_and_json_conversions() {
        let io = std::io::Error::new(std::io::ErrorKind::BrokenPipe, "pipe gone");
        let err: McpError = io.into();
        assert!(err.is_transport());

        let json = serde_json::from_str::<Value>("{nope").unwrap_err();
        let err: McpError = json.into();
        assert!(matches!(err, McpError::Parse(_)));
    }
}
