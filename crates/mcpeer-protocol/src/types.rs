//! MCP domain entities.
//!
//! Everything here is JSON-serializable with camelCase wire names. Presence
//! of an optional capability field denotes support; capability values are
//! free-form JSON blobs whose schema belongs to the protocol, not to this
//! library.

use serde::{Deserialize, Serialize};
use serde_json::Value;

// ============================================================================
// Annotations
// ============================================================================

/// Optional display annotations attached to content and definitions.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Annotations {
    /// Intended audience ("user", "assistant").
    #[serde(skip_serializing_if = "Option::is_none")]
    pub audience: Option<Vec<String>>,
    /// Priority from 0.0 to 1.0.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub priority: Option<f64>,
    /// ISO 8601 timestamp of the last modification.
    #[serde(rename = "lastModified", skip_serializing_if = "Option::is_none")]
    pub last_modified: Option<String>,
}

// ============================================================================
// Content
// ============================================================================

/// Content variants carried in tool results and prompt messages.
///
/// Wire-tagged by `type`; unknown tags are a decoding error.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Content {
    /// Plain text.
    #[serde(rename = "text")]
    Text {
        /// The text content.
        text: String,
        /// Optional annotations.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        annotations: Option<Annotations>,
    },
    /// Base64-encoded image data.
    #[serde(rename = "image")]
    Image {
        /// Base64 payload.
        data: String,
        /// MIME type (e.g. "image/png").
        #[serde(rename = "mimeType")]
        mime_type: String,
        /// Optional annotations.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        annotations: Option<Annotations>,
    },
    /// Base64-encoded audio data.
    #[serde(rename = "audio")]
    Audio {
        /// Base64 payload.
        data: String,
        /// MIME type (e.g. "audio/wav").
        #[serde(rename = "mimeType")]
        mime_type: String,
        /// Optional annotations.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        annotations: Option<Annotations>,
    },
    /// A link to a resource the receiver may read later.
    #[serde(rename = "resource_link")]
    ResourceLink {
        /// Resource URI.
        uri: String,
        /// Display name.
        name: String,
        /// Optional description.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        description: Option<String>,
        /// MIME type.
        #[serde(rename = "mimeType", default, skip_serializing_if = "Option::is_none")]
        mime_type: Option<String>,
        /// Optional annotations.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        annotations: Option<Annotations>,
    },
    /// Resource contents embedded inline.
    #[serde(rename = "resource")]
    Resource {
        /// The embedded resource.
        resource: ResourceContent,
    },
}

impl Content {
    /// Creates plain text content.
    #[must_use]
    pub fn text(text: impl Into<String>) -> Self {
        Content::Text {
            text: text.into(),
            annotations: None,
        }
    }
}

// ============================================================================
// Tools
// ============================================================================

/// Tool definition advertised via `tools/list`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolDefinition {
    /// Tool name; the registry key.
    pub name: String,
    /// Human-readable title.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    /// Tool description.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Input schema (JSON Schema).
    #[serde(rename = "inputSchema")]
    pub input_schema: Value,
    /// Output schema for `structuredContent` (JSON Schema).
    #[serde(rename = "outputSchema", skip_serializing_if = "Option::is_none")]
    pub output_schema: Option<Value>,
    /// Free-form tool annotations.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub annotations: Option<Value>,
}

impl ToolDefinition {
    /// Creates a minimal tool definition with the given name and input schema.
    #[must_use]
    pub fn new(name: impl Into<String>, input_schema: Value) -> Self {
        Self {
            name: name.into(),
            title: None,
            description: None,
            input_schema,
            output_schema: None,
            annotations: None,
        }
    }

    /// Sets the description.
    #[must_use]
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }
}

/// Result of a `tools/call` invocation.
///
/// A failing tool is still a *successful* JSON-RPC response: the failure is
/// signalled by `is_error` with the message wrapped as text content.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CallToolResult {
    /// Tool output content.
    pub content: Vec<Content>,
    /// Structured output matching the tool's `outputSchema`.
    #[serde(rename = "structuredContent", skip_serializing_if = "Option::is_none")]
    pub structured_content: Option<Value>,
    /// Whether the tool call failed.
    #[serde(rename = "isError", default, skip_serializing_if = "std::ops::Not::not")]
    pub is_error: bool,
}

impl CallToolResult {
    /// Creates a successful text result.
    #[must_use]
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            content: vec![Content::text(text)],
            structured_content: None,
            is_error: false,
        }
    }

    /// Creates a failed result carrying the error message as text content.
    #[must_use]
    pub fn error(message: impl Into<String>) -> Self {
        Self {
            content: vec![Content::text(message)],
            structured_content: None,
            is_error: true,
        }
    }
}

// ============================================================================
// Resources
// ============================================================================

/// Resource definition advertised via `resources/list`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceDefinition {
    /// Resource URI; the registry key.
    pub uri: String,
    /// Display name.
    pub name: String,
    /// Human-readable title.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    /// Description.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// MIME type.
    #[serde(rename = "mimeType", skip_serializing_if = "Option::is_none")]
    pub mime_type: Option<String>,
    /// Size in bytes, if known.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub size: Option<u64>,
    /// Optional annotations.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub annotations: Option<Annotations>,
}

impl ResourceDefinition {
    /// Creates a minimal resource definition.
    #[must_use]
    pub fn new(uri: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            uri: uri.into(),
            name: name.into(),
            title: None,
            description: None,
            mime_type: None,
            size: None,
            annotations: None,
        }
    }
}

/// Contents returned from `resources/read`. Exactly one of `text` / `blob`
/// is populated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceContent {
    /// Resource URI.
    pub uri: String,
    /// MIME type.
    #[serde(rename = "mimeType", skip_serializing_if = "Option::is_none")]
    pub mime_type: Option<String>,
    /// Text contents.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    /// Base64-encoded binary contents.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub blob: Option<String>,
}

impl ResourceContent {
    /// Creates text resource contents.
    #[must_use]
    pub fn text(uri: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            uri: uri.into(),
            mime_type: None,
            text: Some(text.into()),
            blob: None,
        }
    }

    /// Creates binary (base64) resource contents.
    #[must_use]
    pub fn blob(uri: impl Into<String>, blob: impl Into<String>) -> Self {
        Self {
            uri: uri.into(),
            mime_type: None,
            text: None,
            blob: Some(blob.into()),
        }
    }
}

/// Resource template advertised via `resources/templates/list`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceTemplate {
    /// URI template (e.g. `file:///logs/{name}`); the registry key.
    #[serde(rename = "uriTemplate")]
    pub uri_template: String,
    /// Display name.
    pub name: String,
    /// Human-readable title.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    /// Description.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// MIME type of produced contents.
    #[serde(rename = "mimeType", skip_serializing_if = "Option::is_none")]
    pub mime_type: Option<String>,
    /// Optional annotations.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub annotations: Option<Annotations>,
}

impl ResourceTemplate {
    /// Creates a minimal resource template.
    #[must_use]
    pub fn new(uri_template: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            uri_template: uri_template.into(),
            name: name.into(),
            title: None,
            description: None,
            mime_type: None,
            annotations: None,
        }
    }
}

// ============================================================================
// Prompts
// ============================================================================

/// Prompt argument definition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PromptArgument {
    /// Argument name.
    pub name: String,
    /// Description.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Whether the argument is required.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub required: bool,
}

/// Prompt definition advertised via `prompts/list`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PromptDefinition {
    /// Prompt name; the registry key.
    pub name: String,
    /// Human-readable title.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    /// Description.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Declared arguments.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub arguments: Vec<PromptArgument>,
}

impl PromptDefinition {
    /// Creates a minimal prompt definition.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            title: None,
            description: None,
            arguments: Vec::new(),
        }
    }
}

/// Role in prompt and sampling messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// User role.
    User,
    /// Assistant role.
    Assistant,
}

/// A message in a prompt or sampling conversation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PromptMessage {
    /// Message role.
    pub role: Role,
    /// Message content.
    pub content: Content,
}

impl PromptMessage {
    /// Creates a user text message.
    #[must_use]
    pub fn user(text: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: Content::text(text),
        }
    }

    /// Creates an assistant text message.
    #[must_use]
    pub fn assistant(text: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: Content::text(text),
        }
    }
}

/// Result of `prompts/get`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GetPromptResult {
    /// Optional prompt description.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Prompt messages.
    pub messages: Vec<PromptMessage>,
}

// ============================================================================
// Sampling (server -> client LLM requests)
// ============================================================================

/// A model name hint for sampling.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelHint {
    /// Suggested model name or family.
    pub name: String,
}

/// Model selection preferences for sampling requests.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ModelPreferences {
    /// Ordered model hints.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub hints: Vec<ModelHint>,
    /// Relative cost priority (0.0 to 1.0).
    #[serde(rename = "costPriority", skip_serializing_if = "Option::is_none")]
    pub cost_priority: Option<f64>,
    /// Relative speed priority (0.0 to 1.0).
    #[serde(rename = "speedPriority", skip_serializing_if = "Option::is_none")]
    pub speed_priority: Option<f64>,
    /// Relative intelligence priority (0.0 to 1.0).
    #[serde(
        rename = "intelligencePriority",
        skip_serializing_if = "Option::is_none"
    )]
    pub intelligence_priority: Option<f64>,
}

/// `sampling/createMessage` request payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SamplingRequest {
    /// Conversation messages.
    pub messages: Vec<PromptMessage>,
    /// Model preferences.
    #[serde(rename = "modelPreferences", skip_serializing_if = "Option::is_none")]
    pub model_preferences: Option<ModelPreferences>,
    /// Optional system prompt.
    #[serde(rename = "systemPrompt", skip_serializing_if = "Option::is_none")]
    pub system_prompt: Option<String>,
    /// Maximum tokens to generate.
    #[serde(rename = "maxTokens", skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<i64>,
}

impl SamplingRequest {
    /// Creates a sampling request from messages.
    #[must_use]
    pub fn new(messages: Vec<PromptMessage>) -> Self {
        Self {
            messages,
            model_preferences: None,
            system_prompt: None,
            max_tokens: None,
        }
    }
}

/// `sampling/createMessage` response payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SamplingResult {
    /// Role of the generated message (always assistant in practice).
    pub role: Role,
    /// Generated content.
    pub content: Content,
    /// Model that produced the completion.
    pub model: String,
    /// Reason generation stopped.
    #[serde(rename = "stopReason", skip_serializing_if = "Option::is_none")]
    pub stop_reason: Option<String>,
}

// ============================================================================
// Elicitation (server -> client user input requests)
// ============================================================================

/// `elicitation/create` request payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ElicitationRequest {
    /// Message shown to the user.
    pub message: String,
    /// Schema the response content must satisfy.
    #[serde(rename = "requestedSchema")]
    pub requested_schema: Value,
}

/// `elicitation/create` response payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ElicitationResult {
    /// "accept", "decline", or "cancel".
    pub action: String,
    /// User-provided content when accepted.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content: Option<Value>,
}

// ============================================================================
// Roots
// ============================================================================

/// A filesystem root exposed by the client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Root {
    /// `file://` URI of the root.
    pub uri: String,
    /// Display name.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

// ============================================================================
// Completion
// ============================================================================

/// Reference naming what a completion request targets.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompletionRef {
    /// "ref/prompt" or "ref/resource".
    #[serde(rename = "type")]
    pub ref_type: String,
    /// Prompt name or resource URI.
    pub name: String,
}

/// Result of `completion/complete`. At most 100 values.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CompletionResult {
    /// Completion candidates.
    pub values: Vec<String>,
    /// Total number of candidates, if known.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub total: Option<i64>,
    /// Whether more candidates exist beyond `values`.
    #[serde(rename = "hasMore", default, skip_serializing_if = "std::ops::Not::not")]
    pub has_more: bool,
}

// ============================================================================
// Capabilities
// ============================================================================

/// Server capabilities advertised during initialization.
///
/// Presence (not value) of a field denotes support. Values are free-form
/// JSON whose schema is protocol-defined (e.g. `{"listChanged": true}`).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ServerCapabilities {
    /// Tool support.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tools: Option<Value>,
    /// Resource support.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resources: Option<Value>,
    /// Prompt support.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub prompts: Option<Value>,
    /// Logging support.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub logging: Option<Value>,
    /// Completion support.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completions: Option<Value>,
    /// Experimental capabilities.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub experimental: Option<Value>,
}

/// Client capabilities advertised during initialization.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ClientCapabilities {
    /// Filesystem roots support.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub roots: Option<Value>,
    /// Sampling support.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sampling: Option<Value>,
    /// Elicitation support.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub elicitation: Option<Value>,
    /// Experimental capabilities.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub experimental: Option<Value>,
}

/// Implementation info exchanged during initialization.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Implementation {
    /// Implementation name.
    pub name: String,
    /// Human-readable title.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    /// Implementation version.
    pub version: String,
}

impl Implementation {
    /// Creates implementation info with a name and version.
    #[must_use]
    pub fn new(name: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            title: None,
            version: version.into(),
        }
    }
}

/// Result of `initialize`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InitializeResult {
    /// Negotiated protocol version.
    #[serde(rename = "protocolVersion")]
    pub protocol_version: String,
    /// Server capabilities.
    pub capabilities: ServerCapabilities,
    /// Server implementation info.
    #[serde(rename = "serverInfo")]
    pub server_info: Implementation,
    /// Optional usage instructions for the client.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub instructions: Option<String>,
}

// ============================================================================
// Logging
// ============================================================================

/// Syslog-style log severity for `notifications/message`.
///
/// Ordered from least to most severe; the server suppresses messages below
/// its current minimum level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    /// Debug-level messages.
    Debug,
    /// Informational messages.
    Info,
    /// Normal but significant condition.
    Notice,
    /// Warning conditions.
    Warning,
    /// Error conditions.
    Error,
    /// Critical conditions.
    Critical,
    /// Action must be taken immediately.
    Alert,
    /// System is unusable.
    Emergency,
}

impl LogLevel {
    /// Returns the wire string for this level.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Notice => "notice",
            LogLevel::Warning => "warning",
            LogLevel::Error => "error",
            LogLevel::Critical => "critical",
            LogLevel::Alert => "alert",
            LogLevel::Emergency => "emergency",
        }
    }
}

impl std::fmt::Display for LogLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Payload of a `notifications/message` log notification.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogMessage {
    /// Severity.
    pub level: LogLevel,
    /// Logger name.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub logger: Option<String>,
    /// Arbitrary structured payload.
    pub data: Value,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn content_text_roundtrip() {
        let content = Content::text("hello");
        let value = serde_json::to_value(&content).unwrap();
        assert_eq!(value, json!({"type": "text", "text": "hello"}));

        let back: Content = serde_json::from_value(value).unwrap();
        assert_eq!(back, content);
    }

    #[test]
    fn content_image_uses_camel_case_mime_type() {
        let content = Content::Image {
            data: "aGk=".into(),
            mime_type: "image/png".into(),
            annotations: None,
        };
        let value = serde_json::to_value(&content).unwrap();
        assert_eq!(value["type"], "image");
        assert_eq!(value["mimeType"], "image/png");
    }

    #[test]
    fn content_resource_link_tag() {
        let content = Content::ResourceLink {
            uri: "file:///a".into(),
            name: "a".into(),
            description: None,
            mime_type: None,
            annotations: None,
        };
        let value = serde_json::to_value(&content).unwrap();
        assert_eq!(value["type"], "resource_link");
    }

    #[test]
    fn content_embedded_resource_roundtrip() {
        let content = Content::Resource {
            resource: ResourceContent::text("file:///a", "body"),
        };
        let value = serde_json::to_value(&content).unwrap();
        assert_eq!(value["type"], "resource");
        assert_eq!(value["resource"]["uri"], "file:///a");
        assert_eq!(value["resource"]["text"], "body");

        let back: Content = serde_json::from_value(value).unwrap();
        assert_eq!(back, content);
    }

    #[test]
    fn content_unknown_tag_is_decode_error() {
        let result = serde_json::from_value::<Content>(json!({"type": "video", "data": "x"}));
        assert!(result.is_err());
    }

    #[test]
    fn tool_definition_wire_shape() {
        let tool = ToolDefinition::new("echo", json!({"type": "object"}))
            .with_description("Echoes input");
        let value = serde_json::to_value(&tool).unwrap();
        assert_eq!(value["name"], "echo");
        assert_eq!(value["inputSchema"]["type"], "object");
        assert_eq!(value["description"], "Echoes input");
        assert!(value.get("outputSchema").is_none());
        assert!(value.get("title").is_none());
    }

    #[test]
    fn call_tool_result_omits_false_is_error() {
        let ok = CallToolResult::text("fine");
        let value = serde_json::to_value(&ok).unwrap();
        assert!(value.get("isError").is_none());

        let failed = CallToolResult::error("boom");
        let value = serde_json::to_value(&failed).unwrap();
        assert_eq!(value["isError"], true);
        assert_eq!(value["content"][0]["text"], "boom");
    }

    #[test]
    fn capabilities_presence_denotes_support() {
        let caps = ServerCapabilities {
            tools: Some(json!({"listChanged": true})),
            logging: Some(json!({})),
            ..Default::default()
        };
        let value = serde_json::to_value(&caps).unwrap();
        assert!(value.get("tools").is_some());
        assert!(value.get("logging").is_some());
        assert!(value.get("resources").is_none());
        assert!(value.get("prompts").is_none());
    }

    #[test]
    fn log_level_ordering_and_strings() {
        assert!(LogLevel::Debug < LogLevel::Info);
        assert!(LogLevel::Warning < LogLevel::Error);
        assert!(LogLevel::Alert < LogLevel::Emergency);

        assert_eq!(serde_json::to_value(LogLevel::Notice).unwrap(), "notice");
        let level: LogLevel = serde_json::from_value(json!("emergency")).unwrap();
        assert_eq!(level, LogLevel::Emergency);
    }

    #[test]
    fn initialize_result_wire_shape() {
        let result = InitializeResult {
            protocol_version: crate::version::PROTOCOL_VERSION.into(),
            capabilities: ServerCapabilities::default(),
            server_info: Implementation::new("demo", "1.0.0"),
            instructions: None,
        };
        let value = serde_json::to_value(&result).unwrap();
        assert_eq!(value["protocolVersion"], "2025-06-18");
        assert_eq!(value["serverInfo"]["name"], "demo");
        assert!(value.get("instructions").is_none());
    }

    #[test]
    fn completion_ref_uses_type_key() {
        let r = CompletionRef {
            ref_type: "ref/prompt".into(),
            name: "greet".into(),
        };
        let value = serde_json::to_value(&r).unwrap();
        assert_eq!(value["type"], "ref/prompt");
        assert_eq!(value["name"], "greet");
    }

    #[test]
    fn sampling_request_roundtrip() {
        let req = SamplingRequest {
            messages: vec![PromptMessage::user("hi")],
            model_preferences: Some(ModelPreferences {
                hints: vec![ModelHint {
                    name: "claude".into(),
                }],
                cost_priority: Some(0.2),
                speed_priority: None,
                intelligence_priority: Some(0.9),
            }),
            system_prompt: Some("be brief".into()),
            max_tokens: Some(128),
        };
        let value = serde_json::to_value(&req).unwrap();
        assert_eq!(value["maxTokens"], 128);
        assert_eq!(value["systemPrompt"], "be brief");
        assert_eq!(value["modelPreferences"]["costPriority"], 0.2);
        assert_eq!(value["messages"][0]["role"], "user");

        let back: SamplingRequest = serde_json::from_value(value).unwrap();
        assert_eq!(back, req);
    }
}
