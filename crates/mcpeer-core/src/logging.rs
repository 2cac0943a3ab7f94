//! Structured logging for mcpeer.
//!
//! Built on the standard [`log`] facade. All mcpeer crates log through the
//! targets below so embedders can filter per subsystem, e.g.
//! `RUST_LOG=mcpeer::transport=trace,mcpeer::router=debug`.
//!
//! mcpeer does not bundle a log implementation; initialize your preferred
//! backend (`env_logger`, `simple_logger`, a `tracing-log` bridge, ...)
//! before starting a peer.

// Re-export log macros for ergonomic use.
pub use log::{debug, error, info, trace, warn};
pub use log::{Level, LevelFilter};

/// Log targets used by mcpeer components.
///
/// Use these constants with the `target:` argument to log macros
/// for consistent filtering.
pub mod targets {
    /// Root target for all mcpeer logs.
    pub const MCPEER: &str = "mcpeer";

    /// Server lifecycle and request handling.
    pub const SERVER: &str = "mcpeer::server";

    /// Client lifecycle and outbound calls.
    pub const CLIENT: &str = "mcpeer::client";

    /// Transport layer (stdio, HTTP).
    pub const TRANSPORT: &str = "mcpeer::transport";

    /// Request routing and method dispatch.
    pub const ROUTER: &str = "mcpeer::router";

    /// Handler execution.
    pub const HANDLER: &str = "mcpeer::handler";

    /// Session state and outbound correlation.
    pub const SESSION: &str = "mcpeer::session";

    /// Codec operations (frame parse/serialize).
    pub const CODEC: &str = "mcpeer::codec";
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn log_targets_are_hierarchical() {
        assert!(targets::SERVER.starts_with(targets::MCPEER));
        assert!(targets::CLIENT.starts_with(targets::MCPEER));
        assert!(targets::TRANSPORT.starts_with(targets::MCPEER));
        assert!(targets::ROUTER.starts_with(targets::MCPEER));
        assert!(targets::HANDLER.starts_with(targets::MCPEER));
        assert!(targets::SESSION.starts_with(targets::MCPEER));
        assert!(targets::CODEC.starts_with(targets::MCPEER));
    }
}
