//! Core types for mcpeer.
//!
//! This crate provides the building blocks shared by every other mcpeer
//! crate:
//! - The [`McpError`] taxonomy and [`McpResult`] alias
//! - Wire error codes ([`codes`])
//! - Structured logging targets over the `log` facade
//!
//! # Design Principles
//!
//! - Internal error kinds (transport failures, timeouts) never cross the
//!   wire; only [`McpError::wire_code`]-mapped codes do
//! - All types are `Send + Sync`
//! - No logger implementation is bundled; embedders pick their backend

#![forbid(unsafe_code)]

mod error;
pub mod logging;

pub use error::{McpError, McpResult, codes};
