//! Per-method parameter and result shapes.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::jsonrpc::RequestId;
use crate::types::{
    ClientCapabilities, CompletionRef, Implementation, LogLevel, ResourceContent,
    ResourceDefinition, ResourceTemplate, Root, ToolDefinition,
};

// ============================================================================
// Progress token and request metadata
// ============================================================================

/// Progress token used to correlate progress notifications with requests.
///
/// Can be either a string or an integer on the wire.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ProgressToken {
    /// Integer progress token.
    Number(i64),
    /// String progress token.
    String(String),
}

impl From<i64> for ProgressToken {
    fn from(n: i64) -> Self {
        ProgressToken::Number(n)
    }
}

impl From<&str> for ProgressToken {
    fn from(s: &str) -> Self {
        ProgressToken::String(s.to_owned())
    }
}

impl From<String> for ProgressToken {
    fn from(s: String) -> Self {
        ProgressToken::String(s)
    }
}

impl std::fmt::Display for ProgressToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProgressToken::Number(n) => write!(f, "{n}"),
            ProgressToken::String(s) => write!(f, "{s}"),
        }
    }
}

/// Request metadata carried under `_meta`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RequestMeta {
    /// Progress token under which progress notifications are emitted.
    #[serde(rename = "progressToken", skip_serializing_if = "Option::is_none")]
    pub progress_token: Option<ProgressToken>,
}

// ============================================================================
// Initialize
// ============================================================================

/// `initialize` request params.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InitializeParams {
    /// Protocol version requested by the client.
    #[serde(rename = "protocolVersion")]
    pub protocol_version: String,
    /// Client capabilities.
    #[serde(default)]
    pub capabilities: ClientCapabilities,
    /// Client implementation info.
    #[serde(rename = "clientInfo")]
    pub client_info: Implementation,
}

// ============================================================================
// Tools
// ============================================================================

/// `tools/list` request params.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ListToolsParams {
    /// Cursor for pagination.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cursor: Option<String>,
}

/// `tools/list` response result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ListToolsResult {
    /// One page of tool definitions.
    pub tools: Vec<ToolDefinition>,
    /// Cursor for the next page, absent on the last page.
    #[serde(rename = "nextCursor", skip_serializing_if = "Option::is_none")]
    pub next_cursor: Option<String>,
}

/// `tools/call` request params.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CallToolParams {
    /// Tool name.
    pub name: String,
    /// Tool arguments.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub arguments: Option<Value>,
    /// Request metadata (progress token).
    #[serde(rename = "_meta", default, skip_serializing_if = "Option::is_none")]
    pub meta: Option<RequestMeta>,
}

// ============================================================================
// Resources
// ============================================================================

/// `resources/list` request params.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ListResourcesParams {
    /// Cursor for pagination.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cursor: Option<String>,
}

/// `resources/list` response result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ListResourcesResult {
    /// One page of resource definitions.
    pub resources: Vec<ResourceDefinition>,
    /// Cursor for the next page.
    #[serde(rename = "nextCursor", skip_serializing_if = "Option::is_none")]
    pub next_cursor: Option<String>,
}

/// `resources/templates/list` request params.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ListResourceTemplatesParams {
    /// Cursor for pagination.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cursor: Option<String>,
}

/// `resources/templates/list` response result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ListResourceTemplatesResult {
    /// One page of resource templates.
    #[serde(rename = "resourceTemplates")]
    pub resource_templates: Vec<ResourceTemplate>,
    /// Cursor for the next page.
    #[serde(rename = "nextCursor", skip_serializing_if = "Option::is_none")]
    pub next_cursor: Option<String>,
}

/// `resources/read` request params.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReadResourceParams {
    /// Resource URI to read.
    pub uri: String,
    /// Request metadata (progress token).
    #[serde(rename = "_meta", default, skip_serializing_if = "Option::is_none")]
    pub meta: Option<RequestMeta>,
}

/// `resources/read` response result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReadResourceResult {
    /// Resource contents.
    pub contents: Vec<ResourceContent>,
}

/// `resources/subscribe` request params.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubscribeResourceParams {
    /// Resource URI to subscribe to.
    pub uri: String,
}

/// `resources/unsubscribe` request params.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UnsubscribeResourceParams {
    /// Resource URI to unsubscribe from.
    pub uri: String,
}

// ============================================================================
// Prompts
// ============================================================================

/// `prompts/list` request params.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ListPromptsParams {
    /// Cursor for pagination.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cursor: Option<String>,
}

/// `prompts/list` response result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ListPromptsResult {
    /// One page of prompt definitions.
    pub prompts: Vec<crate::types::PromptDefinition>,
    /// Cursor for the next page.
    #[serde(rename = "nextCursor", skip_serializing_if = "Option::is_none")]
    pub next_cursor: Option<String>,
}

/// `prompts/get` request params.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GetPromptParams {
    /// Prompt name.
    pub name: String,
    /// Prompt arguments (string key/value pairs).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub arguments: Option<HashMap<String, String>>,
    /// Request metadata (progress token).
    #[serde(rename = "_meta", default, skip_serializing_if = "Option::is_none")]
    pub meta: Option<RequestMeta>,
}

// ============================================================================
// Completion
// ============================================================================

/// The argument being completed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompletionArgument {
    /// Argument name.
    pub name: String,
    /// Partial value typed so far.
    pub value: String,
}

/// `completion/complete` request params.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompleteParams {
    /// What is being completed (prompt or resource).
    #[serde(rename = "ref")]
    pub reference: CompletionRef,
    /// The argument under completion.
    pub argument: CompletionArgument,
}

// ============================================================================
// Logging
// ============================================================================

/// `logging/setLevel` request params.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SetLogLevelParams {
    /// Minimum level the client wants to receive.
    pub level: LogLevel,
}

// ============================================================================
// Roots
// ============================================================================

/// `roots/list` response result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ListRootsResult {
    /// Filesystem roots exposed by the client.
    pub roots: Vec<Root>,
}

// ============================================================================
// Notifications
// ============================================================================

/// `notifications/cancelled` params.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CancelledParams {
    /// The ID of the request to cancel.
    #[serde(rename = "requestId")]
    pub request_id: RequestId,
    /// Optional reason for cancellation.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

/// `notifications/progress` params.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressParams {
    /// Progress token from the original request's `_meta.progressToken`.
    #[serde(rename = "progressToken")]
    pub progress_token: ProgressToken,
    /// Progress so far; absolute when `total` is absent.
    pub progress: f64,
    /// Total expected progress, when determinate.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub total: Option<f64>,
    /// Optional status message.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

/// `notifications/resources/updated` params.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceUpdatedParams {
    /// URI of the updated resource.
    pub uri: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn list_params_serialize_compactly() {
        let params = ListToolsParams { cursor: None };
        assert_eq!(serde_json::to_value(&params).unwrap(), json!({}));

        let params = ListToolsParams {
            cursor: Some("50".into()),
        };
        assert_eq!(
            serde_json::to_value(&params).unwrap(),
            json!({"cursor": "50"})
        );
    }

    #[test]
    fn call_tool_params_with_meta() {
        let params: CallToolParams = serde_json::from_value(json!({
            "name": "echo",
            "arguments": {"text": "hi"},
            "_meta": {"progressToken": "tok-1"}
        }))
        .unwrap();
        assert_eq!(params.name, "echo");
        assert_eq!(
            params.meta.unwrap().progress_token,
            Some(ProgressToken::String("tok-1".into()))
        );
    }

    #[test]
    fn call_tool_params_arguments_optional() {
        let params: CallToolParams = serde_json::from_value(json!({"name": "echo"})).unwrap();
        assert!(params.arguments.is_none());
        assert!(params.meta.is_none());
    }

    #[test]
    fn progress_token_untagged() {
        let n: ProgressToken = serde_json::from_value(json!(3)).unwrap();
        assert_eq!(n, ProgressToken::Number(3));
        let s: ProgressToken = serde_json::from_value(json!("op")).unwrap();
        assert_eq!(s, ProgressToken::String("op".into()));
    }

    #[test]
    fn cancelled_params_roundtrip() {
        let params = CancelledParams {
            request_id: RequestId::Number(9),
            reason: Some("user closed tab".into()),
        };
        let value = serde_json::to_value(&params).unwrap();
        assert_eq!(value, json!({"requestId": 9, "reason": "user closed tab"}));

        let back: CancelledParams = serde_json::from_value(value).unwrap();
        assert_eq!(back, params);
    }

    #[test]
    fn complete_params_wire_shape() {
        let params = CompleteParams {
            reference: CompletionRef {
                ref_type: "ref/prompt".into(),
                name: "greet".into(),
            },
            argument: CompletionArgument {
                name: "language".into(),
                value: "fr".into(),
            },
        };
        let value = serde_json::to_value(&params).unwrap();
        assert_eq!(value["ref"]["type"], "ref/prompt");
        assert_eq!(value["argument"]["name"], "language");
    }

    #[test]
    fn initialize_params_defaults_capabilities() {
        let params: InitializeParams = serde_json::from_value(json!({
            "protocolVersion": "2025-06-18",
            "clientInfo": {"name": "cli", "version": "0.1"}
        }))
        .unwrap();
        assert!(params.capabilities.sampling.is_none());
        assert_eq!(params.client_info.name, "cli");
    }

    #[test]
    fn progress_params_omit_absent_fields() {
        let params = ProgressParams {
            progress_token: ProgressToken::Number(1),
            progress: 0.5,
            total: None,
            message: None,
        };
        assert_eq!(
            serde_json::to_value(&params).unwrap(),
            json!({"progressToken": 1, "progress": 0.5})
        );
    }
}
