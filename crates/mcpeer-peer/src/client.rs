//! MCP client peer.
//!
//! An [`McpClient`] drives the handshake, exposes the typed method surface,
//! and serves the reverse direction: `sampling/createMessage`, `roots/list`,
//! and `elicitation/create` requests issued by the connected server are
//! routed to embedder-registered handlers through the same [`Router`]
//! machinery the server uses.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use mcpeer_core::logging::{debug, targets, warn};
use mcpeer_core::{McpError, McpResult};
use mcpeer_protocol::{
    CallToolResult, CancelledParams, ClientCapabilities, CompletionArgument, CompletionRef,
    CompletionResult, ElicitationRequest, ElicitationResult, GetPromptResult, Implementation,
    InitializeResult, JsonRpcMessage, JsonRpcNotification, LIBRARY_VERSION, ListPromptsResult,
    ListResourceTemplatesResult, ListResourcesResult, ListRootsResult, ListToolsResult,
    LogLevel, LogMessage, PROTOCOL_VERSION, ProgressParams, ReadResourceResult, RequestId,
    ResourceContent, ResourceUpdatedParams, Root, SamplingRequest, SamplingResult,
    ServerCapabilities,
};
use mcpeer_transport::{ErrorCallback, MessageCallback, Transport};
use serde_json::{Value, json};

use crate::router::Router;
use crate::session::{Session, SessionState};
use crate::{parse_params, parse_result};

/// Handler serving `sampling/createMessage` requests from the server.
pub type SamplingHandler = Arc<dyn Fn(SamplingRequest) -> McpResult<SamplingResult> + Send + Sync>;

/// Handler serving `roots/list` requests from the server.
pub type RootsHandler = Arc<dyn Fn() -> McpResult<Vec<Root>> + Send + Sync>;

/// Handler serving `elicitation/create` requests from the server.
pub type ElicitationHandler =
    Arc<dyn Fn(ElicitationRequest) -> McpResult<ElicitationResult> + Send + Sync>;

/// Client configuration.
#[derive(Clone)]
pub struct ClientOptions {
    /// Implementation info sent in `initialize`.
    pub client_info: Implementation,
    /// Capabilities advertised in `initialize`.
    pub capabilities: ClientCapabilities,
    /// Deadline for outbound calls.
    pub request_timeout: Duration,
}

impl ClientOptions {
    /// Creates options with the given client name and version.
    #[must_use]
    pub fn new(name: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            client_info: Implementation::new(name, version),
            capabilities: ClientCapabilities::default(),
            request_timeout: Duration::from_millis(30_000),
        }
    }

    /// Sets the advertised capabilities.
    #[must_use]
    pub fn with_capabilities(mut self, capabilities: ClientCapabilities) -> Self {
        self.capabilities = capabilities;
        self
    }

    /// Sets the outbound call timeout.
    #[must_use]
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self::new("mcpeer-client", LIBRARY_VERSION)
    }
}

#[derive(Default)]
struct ClientCallbacks {
    tools_changed: Mutex<Option<Arc<dyn Fn() + Send + Sync>>>,
    resources_changed: Mutex<Option<Arc<dyn Fn() + Send + Sync>>>,
    prompts_changed: Mutex<Option<Arc<dyn Fn() + Send + Sync>>>,
    resource_updated: Mutex<Option<Arc<dyn Fn(&str) + Send + Sync>>>,
    log_message: Mutex<Option<Arc<dyn Fn(LogMessage) + Send + Sync>>>,
    progress: Mutex<Option<Arc<dyn Fn(ProgressParams) + Send + Sync>>>,
    sampling: Mutex<Option<SamplingHandler>>,
    roots: Mutex<Option<RootsHandler>>,
    elicitation: Mutex<Option<ElicitationHandler>>,
}

/// An MCP client peer.
pub struct McpClient {
    opts: ClientOptions,
    session: Arc<Session>,
    router: Arc<Router>,
    callbacks: Arc<ClientCallbacks>,
    transport: Mutex<Option<Arc<dyn Transport>>>,
    transport_thread: Mutex<Option<JoinHandle<()>>>,
    connected: Arc<AtomicBool>,
}

impl McpClient {
    /// Creates a client. Call [`connect`](McpClient::connect) and then
    /// [`initialize`](McpClient::initialize) before anything else.
    #[must_use]
    pub fn new(opts: ClientOptions) -> Self {
        let session = Arc::new(Session::new());
        session.set_request_timeout(opts.request_timeout);
        let client = Self {
            session,
            router: Arc::new(Router::new()),
            callbacks: Arc::new(ClientCallbacks::default()),
            transport: Mutex::new(None),
            transport_thread: Mutex::new(None),
            connected: Arc::new(AtomicBool::new(false)),
            opts,
        };
        client.setup_handlers();
        client
    }

    /// Binds the client to a transport and starts the receive loop on a
    /// background thread.
    ///
    /// # Errors
    ///
    /// Returns an error when already connected or when the transport does
    /// not come up.
    pub fn connect(&self, transport: Arc<dyn Transport>) -> McpResult<()> {
        {
            let mut slot = self.lock_transport();
            if slot.is_some() {
                return Err(McpError::transport("client is already connected"));
            }
            *slot = Some(Arc::clone(&transport));
        }
        self.session.set_state(SessionState::Uninitialized);

        let on_message = self.message_callback();
        let on_error: ErrorCallback = Arc::new(|err| {
            warn!(target: targets::CLIENT, "transport error: {err}");
        });

        let thread_transport = Arc::clone(&transport);
        let connected = Arc::clone(&self.connected);
        let handle = std::thread::Builder::new()
            .name("mcpeer-client-transport".to_owned())
            .spawn(move || {
                if let Err(e) = thread_transport.start(on_message, Some(on_error)) {
                    warn!(target: targets::CLIENT, "transport stopped: {e}");
                }
                connected.store(false, Ordering::SeqCst);
            })
            .map_err(|e| McpError::transport(format!("failed to spawn transport thread: {e}")))?;
        *self
            .transport_thread
            .lock()
            .expect("transport thread lock poisoned") = Some(handle);

        // Wait for the transport to come up before the first send.
        for _ in 0..200 {
            if transport.is_connected() {
                self.connected.store(true, Ordering::SeqCst);
                return Ok(());
            }
            std::thread::sleep(Duration::from_millis(10));
        }
        self.disconnect();
        Err(McpError::transport("transport did not come up"))
    }

    /// Tears the connection down, failing any blocked waiters.
    pub fn disconnect(&self) {
        self.session.set_state(SessionState::ShuttingDown);
        let transport = self.lock_transport().take();
        if let Some(transport) = transport {
            transport.shutdown();
        }
        let handle = self
            .transport_thread
            .lock()
            .expect("transport thread lock poisoned")
            .take();
        if let Some(handle) = handle {
            let _ = handle.join();
        }
        self.connected.store(false, Ordering::SeqCst);
        let dropped = self.session.fail_all_pending();
        if dropped > 0 {
            debug!(target: targets::SESSION, "dropped {dropped} pending calls at disconnect");
        }
        self.session.set_state(SessionState::Closed);
    }

    /// Performs the `initialize` handshake and sends
    /// `notifications/initialized`.
    ///
    /// # Errors
    ///
    /// Returns protocol, transport, or timeout errors; on success the
    /// negotiated capabilities are published to the router gate.
    pub fn initialize(&self) -> McpResult<InitializeResult> {
        self.session.set_state(SessionState::Initializing);
        let params = json!({
            "protocolVersion": PROTOCOL_VERSION,
            "clientInfo": self.opts.client_info,
            "capabilities": self.opts.capabilities,
        });
        let value = self.request("initialize", Some(params))?;
        let result: InitializeResult = parse_result(value)?;

        self.session
            .set_server_capabilities(result.capabilities.clone());
        self.session
            .set_client_capabilities(self.opts.capabilities.clone());
        self.session
            .set_protocol_version(result.protocol_version.clone());
        self.router
            .set_capabilities(result.capabilities.clone(), self.opts.capabilities.clone());
        self.session.set_state(SessionState::Ready);

        self.notify("notifications/initialized", None)?;
        Ok(result)
    }

    // ========================================================================
    // Method surface
    // ========================================================================

    /// Pings the server.
    ///
    /// # Errors
    ///
    /// Returns protocol, transport, or timeout errors.
    pub fn ping(&self) -> McpResult<()> {
        self.request("ping", Some(json!({})))?;
        Ok(())
    }

    /// Lists one page of tools.
    ///
    /// # Errors
    ///
    /// Returns protocol, transport, or timeout errors.
    pub fn list_tools(&self, cursor: Option<String>) -> McpResult<ListToolsResult> {
        parse_result(self.request("tools/list", Some(cursor_params(cursor)))?)
    }

    /// Calls a tool. A failing tool surfaces as `is_error` on the result,
    /// not as an `Err`.
    ///
    /// # Errors
    ///
    /// Returns protocol, transport, or timeout errors.
    pub fn call_tool(&self, name: &str, arguments: Value) -> McpResult<CallToolResult> {
        let params = json!({"name": name, "arguments": arguments});
        parse_result(self.request("tools/call", Some(params))?)
    }

    /// Lists one page of resources.
    ///
    /// # Errors
    ///
    /// Returns protocol, transport, or timeout errors.
    pub fn list_resources(&self, cursor: Option<String>) -> McpResult<ListResourcesResult> {
        parse_result(self.request("resources/list", Some(cursor_params(cursor)))?)
    }

    /// Lists one page of resource templates.
    ///
    /// # Errors
    ///
    /// Returns protocol, transport, or timeout errors.
    pub fn list_resource_templates(
        &self,
        cursor: Option<String>,
    ) -> McpResult<ListResourceTemplatesResult> {
        parse_result(self.request("resources/templates/list", Some(cursor_params(cursor)))?)
    }

    /// Reads a resource by URI.
    ///
    /// # Errors
    ///
    /// Returns protocol, transport, or timeout errors; an unknown URI is a
    /// resource-not-found protocol error.
    pub fn read_resource(&self, uri: &str) -> McpResult<Vec<ResourceContent>> {
        let result: ReadResourceResult =
            parse_result(self.request("resources/read", Some(json!({"uri": uri})))?)?;
        Ok(result.contents)
    }

    /// Subscribes to update notifications for a resource URI.
    ///
    /// # Errors
    ///
    /// Returns protocol, transport, or timeout errors.
    pub fn subscribe_resource(&self, uri: &str) -> McpResult<()> {
        self.request("resources/subscribe", Some(json!({"uri": uri})))?;
        Ok(())
    }

    /// Removes a resource URI from the subscription set.
    ///
    /// # Errors
    ///
    /// Returns protocol, transport, or timeout errors.
    pub fn unsubscribe_resource(&self, uri: &str) -> McpResult<()> {
        self.request("resources/unsubscribe", Some(json!({"uri": uri})))?;
        Ok(())
    }

    /// Lists one page of prompts.
    ///
    /// # Errors
    ///
    /// Returns protocol, transport, or timeout errors.
    pub fn list_prompts(&self, cursor: Option<String>) -> McpResult<ListPromptsResult> {
        parse_result(self.request("prompts/list", Some(cursor_params(cursor)))?)
    }

    /// Fetches a prompt with the given arguments.
    ///
    /// # Errors
    ///
    /// Returns protocol, transport, or timeout errors.
    pub fn get_prompt(
        &self,
        name: &str,
        arguments: Option<HashMap<String, String>>,
    ) -> McpResult<GetPromptResult> {
        let mut params = json!({"name": name});
        if let Some(arguments) = arguments {
            params["arguments"] = serde_json::to_value(arguments).map_err(McpError::from)?;
        }
        parse_result(self.request("prompts/get", Some(params))?)
    }

    /// Requests completion candidates for a prompt or resource argument.
    ///
    /// # Errors
    ///
    /// Returns protocol, transport, or timeout errors; method-not-found
    /// when the server has no completion handler.
    pub fn complete(
        &self,
        reference: CompletionRef,
        argument_name: &str,
        argument_value: &str,
    ) -> McpResult<CompletionResult> {
        let params = json!({
            "ref": reference,
            "argument": CompletionArgument {
                name: argument_name.to_owned(),
                value: argument_value.to_owned(),
            },
        });
        parse_result(self.request("completion/complete", Some(params))?)
    }

    /// Sets the server's minimum log level for `notifications/message`.
    ///
    /// # Errors
    ///
    /// Returns protocol, transport, or timeout errors.
    pub fn set_log_level(&self, level: LogLevel) -> McpResult<()> {
        self.request("logging/setLevel", Some(json!({"level": level})))?;
        Ok(())
    }

    /// Emits `notifications/cancelled` for an in-flight request.
    ///
    /// The pending entry is untouched on this side: the call will still
    /// time out, or a late response will be dropped.
    ///
    /// # Errors
    ///
    /// Returns a transport error when the notification cannot be sent.
    pub fn cancel_request(&self, id: RequestId, reason: Option<String>) -> McpResult<()> {
        let params = CancelledParams {
            request_id: id,
            reason,
        };
        let value = serde_json::to_value(params).map_err(McpError::from)?;
        self.notify("notifications/cancelled", Some(value))
    }

    // ========================================================================
    // Notification callbacks and reverse-request handlers
    // ========================================================================

    /// Sets the callback for `notifications/tools/list_changed`.
    pub fn on_tools_changed<F: Fn() + Send + Sync + 'static>(&self, callback: F) {
        *self.callbacks.tools_changed.lock().expect("callback lock poisoned") =
            Some(Arc::new(callback));
    }

    /// Sets the callback for `notifications/resources/list_changed`.
    pub fn on_resources_changed<F: Fn() + Send + Sync + 'static>(&self, callback: F) {
        *self
            .callbacks
            .resources_changed
            .lock()
            .expect("callback lock poisoned") = Some(Arc::new(callback));
    }

    /// Sets the callback for `notifications/prompts/list_changed`.
    pub fn on_prompts_changed<F: Fn() + Send + Sync + 'static>(&self, callback: F) {
        *self
            .callbacks
            .prompts_changed
            .lock()
            .expect("callback lock poisoned") = Some(Arc::new(callback));
    }

    /// Sets the callback for `notifications/resources/updated`.
    pub fn on_resource_updated<F: Fn(&str) + Send + Sync + 'static>(&self, callback: F) {
        *self
            .callbacks
            .resource_updated
            .lock()
            .expect("callback lock poisoned") = Some(Arc::new(callback));
    }

    /// Sets the callback for `notifications/message`.
    pub fn on_log_message<F: Fn(LogMessage) + Send + Sync + 'static>(&self, callback: F) {
        *self
            .callbacks
            .log_message
            .lock()
            .expect("callback lock poisoned") = Some(Arc::new(callback));
    }

    /// Sets the callback for `notifications/progress`.
    pub fn on_progress<F: Fn(ProgressParams) + Send + Sync + 'static>(&self, callback: F) {
        *self.callbacks.progress.lock().expect("callback lock poisoned") =
            Some(Arc::new(callback));
    }

    /// Installs the handler serving `sampling/createMessage`. Advertise the
    /// `sampling` capability for the server to be allowed to call it.
    pub fn on_sampling_request<F>(&self, handler: F)
    where
        F: Fn(SamplingRequest) -> McpResult<SamplingResult> + Send + Sync + 'static,
    {
        *self.callbacks.sampling.lock().expect("callback lock poisoned") =
            Some(Arc::new(handler));
    }

    /// Installs the handler serving `roots/list`.
    pub fn on_roots_request<F>(&self, handler: F)
    where
        F: Fn() -> McpResult<Vec<Root>> + Send + Sync + 'static,
    {
        *self.callbacks.roots.lock().expect("callback lock poisoned") = Some(Arc::new(handler));
    }

    /// Installs the handler serving `elicitation/create`.
    pub fn on_elicitation_request<F>(&self, handler: F)
    where
        F: Fn(ElicitationRequest) -> McpResult<ElicitationResult> + Send + Sync + 'static,
    {
        *self
            .callbacks
            .elicitation
            .lock()
            .expect("callback lock poisoned") = Some(Arc::new(handler));
    }

    // ========================================================================
    // Accessors
    // ========================================================================

    /// Returns the capabilities the server advertised, once initialized.
    #[must_use]
    pub fn server_capabilities(&self) -> ServerCapabilities {
        self.session.server_capabilities()
    }

    /// Returns the negotiated protocol version (empty before handshake).
    #[must_use]
    pub fn protocol_version(&self) -> String {
        self.session.protocol_version()
    }

    /// Returns true while the transport is up.
    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    /// Returns the session owning outbound correlation and lifecycle state.
    #[must_use]
    pub fn session(&self) -> &Arc<Session> {
        &self.session
    }

    // ========================================================================
    // Internals
    // ========================================================================

    fn lock_transport(&self) -> std::sync::MutexGuard<'_, Option<Arc<dyn Transport>>> {
        self.transport.lock().expect("transport slot lock poisoned")
    }

    fn transport(&self) -> McpResult<Arc<dyn Transport>> {
        self.lock_transport()
            .clone()
            .ok_or_else(|| McpError::transport("not connected"))
    }

    fn request(&self, method: &str, params: Option<Value>) -> McpResult<Value> {
        if !self.connected.load(Ordering::SeqCst) {
            return Err(McpError::transport("not connected"));
        }
        let transport = self.transport()?;
        let response = self.session.call(&transport, method, params)?;
        match response.error {
            Some(err) => Err(McpError::Protocol {
                code: err.code,
                message: err.message,
                data: err.data,
            }),
            None => Ok(response.result.unwrap_or(Value::Null)),
        }
    }

    fn notify(&self, method: &str, params: Option<Value>) -> McpResult<()> {
        self.transport()?
            .send(&JsonRpcMessage::Notification(JsonRpcNotification::new(
                method, params,
            )))
    }

    fn message_callback(&self) -> MessageCallback {
        let session = Arc::clone(&self.session);
        let router = Arc::clone(&self.router);
        Arc::new(move |message| {
            for id in session.check_timeouts() {
                debug!(target: targets::SESSION, "swept timed-out outbound request {id}");
            }
            match message {
                JsonRpcMessage::Response(response) => {
                    let id = response.id.clone();
                    if !session.complete_request(&id, response) {
                        // Late response after timeout, or an id we never
                        // issued; drop silently.
                        debug!(target: targets::SESSION, "dropping response for unknown id {id}");
                    }
                    None
                }
                other => router.dispatch(other),
            }
        })
    }

    /// Registers notification handlers and the reverse-request surface.
    fn setup_handlers(&self) {
        let router = &self.router;

        {
            let callbacks = Arc::clone(&self.callbacks);
            router.on_notification("notifications/tools/list_changed", move |_| {
                let cb = callbacks.tools_changed.lock().expect("callback lock poisoned").clone();
                if let Some(cb) = cb {
                    cb();
                }
            });
        }
        {
            let callbacks = Arc::clone(&self.callbacks);
            router.on_notification("notifications/resources/list_changed", move |_| {
                let cb = callbacks
                    .resources_changed
                    .lock()
                    .expect("callback lock poisoned")
                    .clone();
                if let Some(cb) = cb {
                    cb();
                }
            });
        }
        {
            let callbacks = Arc::clone(&self.callbacks);
            router.on_notification("notifications/prompts/list_changed", move |_| {
                let cb = callbacks
                    .prompts_changed
                    .lock()
                    .expect("callback lock poisoned")
                    .clone();
                if let Some(cb) = cb {
                    cb();
                }
            });
        }
        {
            let callbacks = Arc::clone(&self.callbacks);
            router.on_notification("notifications/resources/updated", move |params| {
                let cb = callbacks
                    .resource_updated
                    .lock()
                    .expect("callback lock poisoned")
                    .clone();
                if let Some(cb) = cb {
                    if let Ok(params) = serde_json::from_value::<ResourceUpdatedParams>(params) {
                        cb(&params.uri);
                    }
                }
            });
        }
        {
            let callbacks = Arc::clone(&self.callbacks);
            router.on_notification("notifications/message", move |params| {
                let cb = callbacks
                    .log_message
                    .lock()
                    .expect("callback lock poisoned")
                    .clone();
                if let Some(cb) = cb {
                    if let Ok(message) = serde_json::from_value::<LogMessage>(params) {
                        cb(message);
                    }
                }
            });
        }
        {
            let callbacks = Arc::clone(&self.callbacks);
            router.on_notification("notifications/progress", move |params| {
                let cb = callbacks.progress.lock().expect("callback lock poisoned").clone();
                if let Some(cb) = cb {
                    if let Ok(params) = serde_json::from_value::<ProgressParams>(params) {
                        cb(params);
                    }
                }
            });
        }
        router.on_notification("notifications/cancelled", |params| {
            debug!(target: targets::CLIENT, "peer cancelled a request: {params}");
        });

        // Reverse requests, gated on the capabilities this client advertised.
        {
            let callbacks = Arc::clone(&self.callbacks);
            router.on_request("sampling/createMessage", move |params| {
                let handler = callbacks
                    .sampling
                    .lock()
                    .expect("callback lock poisoned")
                    .clone()
                    .ok_or_else(|| McpError::method_not_found("sampling/createMessage"))?;
                let request: SamplingRequest = parse_params(params)?;
                let result = handler(request)?;
                serde_json::to_value(result).map_err(McpError::from)
            });
            router.require_capability("sampling/createMessage", "sampling");
        }
        {
            let callbacks = Arc::clone(&self.callbacks);
            router.on_request("roots/list", move |_| {
                let handler = callbacks
                    .roots
                    .lock()
                    .expect("callback lock poisoned")
                    .clone()
                    .ok_or_else(|| McpError::method_not_found("roots/list"))?;
                let roots = handler()?;
                serde_json::to_value(ListRootsResult { roots }).map_err(McpError::from)
            });
            router.require_capability("roots/list", "roots");
        }
        {
            let callbacks = Arc::clone(&self.callbacks);
            router.on_request("elicitation/create", move |params| {
                let handler = callbacks
                    .elicitation
                    .lock()
                    .expect("callback lock poisoned")
                    .clone()
                    .ok_or_else(|| McpError::method_not_found("elicitation/create"))?;
                let request: ElicitationRequest = parse_params(params)?;
                let result = handler(request)?;
                serde_json::to_value(result).map_err(McpError::from)
            });
            router.require_capability("elicitation/create", "elicitation");
        }
    }
}

impl Drop for McpClient {
    fn drop(&mut self) {
        self.disconnect();
    }
}

fn cursor_params(cursor: Option<String>) -> Value {
    match cursor {
        Some(cursor) => json!({"cursor": cursor}),
        None => json!({}),
    }
}
