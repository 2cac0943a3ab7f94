//! MCP protocol types for mcpeer.
//!
//! This crate defines the wire-level vocabulary shared by both peer flavors:
//!
//! - [`jsonrpc`]: the JSON-RPC 2.0 frame union (request / notification /
//!   response) and request IDs
//! - [`types`]: MCP domain entities (tools, resources, prompts, content,
//!   capabilities, sampling, ...)
//! - [`messages`]: per-method parameter and result shapes
//! - [`version`]: protocol and library version constants
//!
//! Field names are camelCase on the wire and snake_case in memory; the
//! mapping lives entirely in serde attributes here so the rest of the
//! workspace never spells a wire name.

#![forbid(unsafe_code)]

pub mod jsonrpc;
pub mod messages;
pub mod types;
pub mod version;

pub use jsonrpc::{
    JsonRpcError, JsonRpcMessage, JsonRpcNotification, JsonRpcRequest, JsonRpcResponse, RequestId,
};
pub use messages::{
    CallToolParams, CancelledParams, CompleteParams, CompletionArgument, GetPromptParams,
    InitializeParams, ListPromptsParams, ListPromptsResult, ListResourceTemplatesParams,
    ListResourceTemplatesResult, ListResourcesParams, ListResourcesResult, ListRootsResult,
    ListToolsParams, ListToolsResult, ProgressParams, ProgressToken, ReadResourceParams,
    ReadResourceResult, RequestMeta, ResourceUpdatedParams, SetLogLevelParams,
    SubscribeResourceParams, UnsubscribeResourceParams,
};
pub use types::{
    Annotations, CallToolResult, ClientCapabilities, CompletionRef, CompletionResult, Content,
    ElicitationRequest, ElicitationResult, GetPromptResult, Implementation, InitializeResult,
    LogLevel, LogMessage, ModelHint, ModelPreferences, PromptArgument, PromptDefinition,
    PromptMessage, ResourceContent, ResourceDefinition, ResourceTemplate, Role, Root,
    SamplingRequest, SamplingResult, ServerCapabilities, ToolDefinition,
};
pub use version::{JSONRPC_VERSION, LIBRARY_VERSION, PROTOCOL_VERSION};
