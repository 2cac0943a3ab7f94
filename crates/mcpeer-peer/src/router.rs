//! Method routing with capability gating.
//!
//! The router maps inbound requests and notifications to registered
//! handlers. Requests for methods with a registered capability requirement
//! are rejected with invalid-request until the negotiated capability pair
//! advertises that capability.
//!
//! Handlers are always invoked with the routing mutex released, so a handler
//! may call back into the router (e.g. [`Router::set_capabilities`]) without
//! deadlocking.

use std::collections::HashMap;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Mutex};

use mcpeer_core::logging::{debug, targets, trace};
use mcpeer_core::{McpError, McpResult};
use mcpeer_protocol::{
    ClientCapabilities, JsonRpcMessage, JsonRpcResponse, ServerCapabilities,
};
use serde_json::Value;

/// A request handler: params in, result JSON or a protocol error out.
pub type RequestHandler = Arc<dyn Fn(Value) -> McpResult<Value> + Send + Sync>;

/// A notification handler. Has no reply; errors are swallowed.
pub type NotificationHandler = Arc<dyn Fn(Value) + Send + Sync>;

#[derive(Default)]
struct RouterInner {
    request_handlers: HashMap<String, RequestHandler>,
    notification_handlers: HashMap<String, NotificationHandler>,
    capability_requirements: HashMap<String, String>,
    server_caps: ServerCapabilities,
    client_caps: ClientCapabilities,
}

impl RouterInner {
    /// Returns true when the method's capability requirement (if any) is
    /// satisfied by the negotiated pair.
    fn check_capability(&self, method: &str) -> bool {
        let Some(capability) = self.capability_requirements.get(method) else {
            return true;
        };
        match capability.as_str() {
            "tools" => self.server_caps.tools.is_some(),
            "resources" => self.server_caps.resources.is_some(),
            "prompts" => self.server_caps.prompts.is_some(),
            "logging" => self.server_caps.logging.is_some(),
            "completions" => self.server_caps.completions.is_some(),
            "sampling" => self.client_caps.sampling.is_some(),
            "roots" => self.client_caps.roots.is_some(),
            "elicitation" => self.client_caps.elicitation.is_some(),
            _ => false,
        }
    }
}

/// Routes JSON-RPC requests and notifications to registered handlers.
pub struct Router {
    inner: Mutex<RouterInner>,
}

impl Router {
    /// Creates an empty router.
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(RouterInner::default()),
        }
    }

    /// Registers a request handler. Re-registering a method replaces the
    /// previous handler.
    pub fn on_request<F>(&self, method: impl Into<String>, handler: F)
    where
        F: Fn(Value) -> McpResult<Value> + Send + Sync + 'static,
    {
        let mut inner = self.inner.lock().expect("router lock poisoned");
        inner
            .request_handlers
            .insert(method.into(), Arc::new(handler));
    }

    /// Registers a notification handler.
    pub fn on_notification<F>(&self, method: impl Into<String>, handler: F)
    where
        F: Fn(Value) + Send + Sync + 'static,
    {
        let mut inner = self.inner.lock().expect("router lock poisoned");
        inner
            .notification_handlers
            .insert(method.into(), Arc::new(handler));
    }

    /// Requires a capability for a method. Until [`set_capabilities`]
    /// advertises it, dispatching the method yields invalid-request.
    ///
    /// [`set_capabilities`]: Router::set_capabilities
    pub fn require_capability(&self, method: impl Into<String>, capability: impl Into<String>) {
        let mut inner = self.inner.lock().expect("router lock poisoned");
        inner
            .capability_requirements
            .insert(method.into(), capability.into());
    }

    /// Publishes the negotiated capability pair used by the gate.
    pub fn set_capabilities(&self, server: ServerCapabilities, client: ClientCapabilities) {
        let mut inner = self.inner.lock().expect("router lock poisoned");
        inner.server_caps = server;
        inner.client_caps = client;
    }

    /// Returns true when a handler (request or notification) is registered
    /// for the method.
    #[must_use]
    pub fn has_handler(&self, method: &str) -> bool {
        let inner = self.inner.lock().expect("router lock poisoned");
        inner.request_handlers.contains_key(method)
            || inner.notification_handlers.contains_key(method)
    }

    /// Dispatches one inbound frame, returning the response frame for
    /// requests.
    ///
    /// Responses are never dispatched here; the peer short-circuits them to
    /// its session before routing.
    pub fn dispatch(&self, message: JsonRpcMessage) -> Option<JsonRpcMessage> {
        match message {
            JsonRpcMessage::Request(request) => {
                trace!(target: targets::ROUTER, "dispatching request {}", request.method);

                // Hold the lock only to gate and copy out the handler.
                let handler = {
                    let inner = self.inner.lock().expect("router lock poisoned");
                    if !inner.check_capability(&request.method) {
                        let err = McpError::invalid_request(format!(
                            "Capability not supported: {}",
                            request.method
                        ));
                        return Some(JsonRpcMessage::Response(JsonRpcResponse::error(
                            request.id,
                            err.into(),
                        )));
                    }
                    match inner.request_handlers.get(&request.method) {
                        Some(handler) => Arc::clone(handler),
                        None => {
                            let err = McpError::method_not_found(&request.method);
                            return Some(JsonRpcMessage::Response(JsonRpcResponse::error(
                                request.id,
                                err.into(),
                            )));
                        }
                    }
                };

                let params = request
                    .params
                    .unwrap_or_else(|| Value::Object(serde_json::Map::new()));

                // Invoke with the mutex released so handlers may re-enter.
                let outcome = panic::catch_unwind(AssertUnwindSafe(|| handler(params)));
                let response = match outcome {
                    Ok(Ok(result)) => JsonRpcResponse::success(request.id, result),
                    Ok(Err(err)) => JsonRpcResponse::error(request.id, err.into()),
                    Err(payload) => {
                        let err = McpError::internal(format!(
                            "handler panicked: {}",
                            panic_message(payload.as_ref())
                        ));
                        JsonRpcResponse::error(request.id, err.into())
                    }
                };
                Some(JsonRpcMessage::Response(response))
            }
            JsonRpcMessage::Notification(notification) => {
                let handler = {
                    let inner = self.inner.lock().expect("router lock poisoned");
                    inner
                        .notification_handlers
                        .get(&notification.method)
                        .cloned()
                };
                // Unknown notifications are dropped silently.
                let Some(handler) = handler else {
                    debug!(
                        target: targets::ROUTER,
                        "no handler for notification {}",
                        notification.method
                    );
                    return None;
                };
                let params = notification
                    .params
                    .unwrap_or_else(|| Value::Object(serde_json::Map::new()));
                // Notifications have no reply; swallow panics.
                let _ = panic::catch_unwind(AssertUnwindSafe(|| handler(params)));
                None
            }
            JsonRpcMessage::Response(_) => None,
        }
    }
}

impl Default for Router {
    fn default() -> Self {
        Self::new()
    }
}

pub(crate) fn panic_message(payload: &(dyn std::any::Any + Send)) -> &str {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s
    } else {
        "unknown panic"
    }
}
