//! Version constants.

/// The MCP protocol revision this library speaks.
pub const PROTOCOL_VERSION: &str = "2025-06-18";

/// The JSON-RPC version string. Used as a static reference to avoid allocations.
pub const JSONRPC_VERSION: &str = "2.0";

/// Library version, mirrored from the crate manifest.
pub const LIBRARY_VERSION: &str = env!("CARGO_PKG_VERSION");
