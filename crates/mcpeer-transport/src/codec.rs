//! Frame-level codec: JSON text to the frame union and back.
//!
//! Disambiguation rule: (method && id) ⇒ request, (method && !id) ⇒
//! notification, (id && !method) ⇒ response. The codec validates structure
//! only; `params` and `result` pass through as arbitrary JSON, and
//! schema-specific decoding happens at the handler boundary.

use mcpeer_core::{McpError, McpResult};
use mcpeer_protocol::{
    JSONRPC_VERSION, JsonRpcError, JsonRpcMessage, JsonRpcNotification, JsonRpcRequest,
    JsonRpcResponse, RequestId,
};
use serde_json::Value;

/// Codec for parsing and serializing JSON-RPC frames.
#[derive(Debug, Default, Clone, Copy)]
pub struct Codec;

impl Codec {
    /// Parses a single JSON-RPC frame.
    ///
    /// # Errors
    ///
    /// Returns a parse error when the input is malformed JSON, not a JSON
    /// object, missing `jsonrpc: "2.0"`, carries a null id, or has neither
    /// `method` nor `id`.
    pub fn parse(raw: &str) -> McpResult<JsonRpcMessage> {
        if raw.trim().is_empty() {
            return Err(McpError::parse("Empty input"));
        }
        let value: Value = serde_json::from_str(raw)
            .map_err(|e| McpError::parse(format!("JSON parse error: {e}")))?;
        if !value.is_object() {
            return Err(McpError::parse("Message must be a JSON object"));
        }
        Self::parse_object(&value)
    }

    /// Parses a JSON-RPC batch (top-level array).
    ///
    /// # Errors
    ///
    /// Returns a parse error when the input is not a JSON array or any
    /// element fails frame validation.
    pub fn parse_batch(raw: &str) -> McpResult<Vec<JsonRpcMessage>> {
        if raw.trim().is_empty() {
            return Err(McpError::parse("Empty input"));
        }
        let value: Value = serde_json::from_str(raw)
            .map_err(|e| McpError::parse(format!("JSON parse error: {e}")))?;
        let items = value
            .as_array()
            .ok_or_else(|| McpError::parse("Batch must be a JSON array"))?;

        let mut messages = Vec::with_capacity(items.len());
        for item in items {
            if !item.is_object() {
                return Err(McpError::parse("Each batch item must be a JSON object"));
            }
            messages.push(Self::parse_object(item)?);
        }
        Ok(messages)
    }

    /// Serializes a frame to compact JSON.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization fails.
    pub fn serialize(message: &JsonRpcMessage) -> McpResult<String> {
        serde_json::to_string(message).map_err(McpError::from)
    }

    /// Serializes a batch to a compact JSON array.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization fails.
    pub fn serialize_batch(messages: &[JsonRpcMessage]) -> McpResult<String> {
        serde_json::to_string(messages).map_err(McpError::from)
    }

    /// Validates and classifies one already-parsed JSON object.
    fn parse_object(value: &Value) -> McpResult<JsonRpcMessage> {
        match value.get("jsonrpc") {
            None => return Err(McpError::parse("Missing 'jsonrpc' field")),
            Some(v) if v.as_str() == Some(JSONRPC_VERSION) => {}
            Some(_) => {
                return Err(McpError::parse("Invalid jsonrpc version, expected '2.0'"));
            }
        }

        let id_field = value.get("id");
        let has_method = value.get("method").is_some();

        match (has_method, id_field) {
            (true, Some(id)) => {
                let id = parse_id(id, "Request")?;
                let method = method_str(value)?;
                Ok(JsonRpcMessage::Request(JsonRpcRequest {
                    jsonrpc: std::borrow::Cow::Borrowed(JSONRPC_VERSION),
                    id,
                    method,
                    params: value.get("params").cloned(),
                    meta: value.get("_meta").cloned(),
                }))
            }
            (true, None) => {
                let method = method_str(value)?;
                Ok(JsonRpcMessage::Notification(JsonRpcNotification {
                    jsonrpc: std::borrow::Cow::Borrowed(JSONRPC_VERSION),
                    method,
                    params: value.get("params").cloned(),
                }))
            }
            (false, Some(id)) => {
                let id = parse_id(id, "Response")?;
                let error = match value.get("error") {
                    Some(e) => Some(
                        serde_json::from_value::<JsonRpcError>(e.clone())
                            .map_err(|e| McpError::parse(format!("Invalid error object: {e}")))?,
                    ),
                    None => None,
                };
                Ok(JsonRpcMessage::Response(JsonRpcResponse {
                    jsonrpc: std::borrow::Cow::Borrowed(JSONRPC_VERSION),
                    id,
                    result: value.get("result").cloned(),
                    error,
                }))
            }
            (false, None) => Err(McpError::parse(
                "Cannot determine message type: missing both 'id' and 'method'",
            )),
        }
    }
}

fn parse_id(id: &Value, kind: &str) -> McpResult<RequestId> {
    if id.is_null() {
        return Err(McpError::parse(format!("{kind} ID must not be null")));
    }
    serde_json::from_value(id.clone())
        .map_err(|_| McpError::parse(format!("{kind} ID must be an integer or a string")))
}

fn method_str(value: &Value) -> McpResult<String> {
    value
        .get("method")
        .and_then(Value::as_str)
        .map(str::to_owned)
        .ok_or_else(|| McpError::parse("'method' must be a string"))
}
