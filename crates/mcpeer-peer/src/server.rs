//! MCP server peer.
//!
//! An [`McpServer`] owns the registries (tools, resources, templates,
//! prompts), a [`Router`] with the full MCP method surface, a [`Session`]
//! for server-initiated reverse calls, and a worker pool for deferred tool
//! handlers. It is transport-agnostic: hand [`serve`](McpServer::serve) any
//! [`Transport`].

use std::collections::{BTreeSet, HashMap};
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use mcpeer_core::logging::{debug, info, targets, warn};
use mcpeer_core::{McpError, McpResult};
use mcpeer_protocol::{
    CallToolParams, CallToolResult, CompleteParams, CompletionRef, CompletionResult,
    ElicitationRequest, ElicitationResult, GetPromptParams, GetPromptResult, Implementation,
    InitializeParams, InitializeResult, JsonRpcMessage, JsonRpcNotification,
    LIBRARY_VERSION, ListPromptsParams, ListPromptsResult, ListResourceTemplatesParams,
    ListResourceTemplatesResult, ListResourcesParams, ListResourcesResult, ListRootsResult,
    ListToolsParams, ListToolsResult, LogLevel, PROTOCOL_VERSION, ProgressParams, ProgressToken,
    PromptDefinition, ReadResourceParams, ReadResourceResult, ResourceContent, ResourceDefinition,
    ResourceTemplate, Root, SamplingRequest, SamplingResult, ServerCapabilities,
    SetLogLevelParams, SubscribeResourceParams, ToolDefinition, UnsubscribeResourceParams,
};
use mcpeer_transport::{
    ErrorCallback, HttpServerOptions, HttpServerTransport, MessageCallback, StdioTransport,
    Transport,
};
use serde_json::{Value, json};

use crate::paged::PagedStore;
use crate::pool::WorkerPool;
use crate::router::{Router, panic_message};
use crate::session::{Session, SessionState};
use crate::{parse_params, parse_result};

/// Synchronous tool handler: arguments in, tool result out.
///
/// A returned error becomes a *successful* `tools/call` response carrying
/// `isError: true`; tool failure is a tool-level signal, not a JSON-RPC
/// error.
pub type ToolHandler = Arc<dyn Fn(Value) -> McpResult<CallToolResult> + Send + Sync>;

/// Resource read handler: resolved URI in, contents out.
pub type ResourceReadHandler = Arc<dyn Fn(&str) -> McpResult<Vec<ResourceContent>> + Send + Sync>;

/// Prompt handler: prompt name and string arguments in, messages out.
pub type PromptGetHandler =
    Arc<dyn Fn(&str, HashMap<String, String>) -> McpResult<GetPromptResult> + Send + Sync>;

/// Completion handler: reference plus the argument under completion.
pub type CompletionHandler =
    Arc<dyn Fn(&CompletionRef, &str, &str) -> McpResult<CompletionResult> + Send + Sync>;

/// Server configuration.
#[derive(Clone)]
pub struct ServerOptions {
    /// Implementation info advertised in `initialize`.
    pub server_info: Implementation,
    /// Optional usage instructions for connecting clients.
    pub instructions: Option<String>,
    /// Worker pool size for deferred tool handlers.
    pub thread_pool_size: usize,
    /// Deadline for server-initiated reverse calls.
    pub request_timeout: Duration,
    /// Page size for the `*/list` methods.
    pub page_size: usize,
}

impl ServerOptions {
    /// Creates options with the given server name and version and the
    /// defaults: pool of 4, 30 second timeout, pages of 50.
    #[must_use]
    pub fn new(name: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            server_info: Implementation::new(name, version),
            instructions: None,
            thread_pool_size: 4,
            request_timeout: Duration::from_millis(30_000),
            page_size: 50,
        }
    }

    /// Sets the instructions returned from `initialize`.
    #[must_use]
    pub fn with_instructions(mut self, instructions: impl Into<String>) -> Self {
        self.instructions = Some(instructions.into());
        self
    }

    /// Sets the reverse-call timeout.
    #[must_use]
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    /// Sets the list page size.
    #[must_use]
    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size;
        self
    }

    /// Sets the worker pool size.
    #[must_use]
    pub fn with_thread_pool_size(mut self, size: usize) -> Self {
        self.thread_pool_size = size;
        self
    }
}

impl Default for ServerOptions {
    fn default() -> Self {
        Self::new("mcpeer-server", LIBRARY_VERSION)
    }
}

/// Registries behind the store mutex.
struct ServerStore {
    tools: PagedStore<ToolDefinition>,
    tool_handlers: HashMap<String, ToolHandler>,
    deferred_tool_handlers: HashMap<String, ToolHandler>,
    resources: PagedStore<ResourceDefinition>,
    resource_handlers: HashMap<String, ResourceReadHandler>,
    resource_templates: PagedStore<ResourceTemplate>,
    resource_template_handlers: HashMap<String, ResourceReadHandler>,
    prompts: PagedStore<PromptDefinition>,
    prompt_handlers: HashMap<String, PromptGetHandler>,
    completion_handler: Option<CompletionHandler>,
    subscribed_uris: BTreeSet<String>,
}

impl ServerStore {
    fn new(page_size: usize) -> Self {
        Self {
            tools: PagedStore::new(page_size),
            tool_handlers: HashMap::new(),
            deferred_tool_handlers: HashMap::new(),
            resources: PagedStore::new(page_size),
            resource_handlers: HashMap::new(),
            resource_templates: PagedStore::new(page_size),
            resource_template_handlers: HashMap::new(),
            prompts: PagedStore::new(page_size),
            prompt_handlers: HashMap::new(),
            completion_handler: None,
            subscribed_uris: BTreeSet::new(),
        }
    }

    /// Computes the capabilities to advertise from what is registered:
    /// presence of a field denotes support.
    fn build_capabilities(&self) -> ServerCapabilities {
        let mut caps = ServerCapabilities {
            logging: Some(json!({})),
            ..Default::default()
        };
        if !self.tools.is_empty() {
            caps.tools = Some(json!({"listChanged": true}));
        }
        if !self.resources.is_empty() || !self.resource_templates.is_empty() {
            caps.resources = Some(json!({"subscribe": true, "listChanged": true}));
        }
        if !self.prompts.is_empty() {
            caps.prompts = Some(json!({"listChanged": true}));
        }
        if self.completion_handler.is_some() {
            caps.completions = Some(json!({}));
        }
        caps
    }
}

/// An MCP server peer.
pub struct McpServer {
    opts: ServerOptions,
    session: Arc<Session>,
    router: Arc<Router>,
    store: Arc<Mutex<ServerStore>>,
    transport: Arc<Mutex<Option<Arc<dyn Transport>>>>,
    pool: Arc<Mutex<Option<Arc<WorkerPool>>>>,
    running: Arc<AtomicBool>,
    min_log_level: Arc<Mutex<LogLevel>>,
}

impl McpServer {
    /// Creates a server with the full MCP method surface registered.
    #[must_use]
    pub fn new(opts: ServerOptions) -> Self {
        let session = Arc::new(Session::new());
        session.set_request_timeout(opts.request_timeout);
        let server = Self {
            store: Arc::new(Mutex::new(ServerStore::new(opts.page_size))),
            session,
            router: Arc::new(Router::new()),
            transport: Arc::new(Mutex::new(None)),
            pool: Arc::new(Mutex::new(None)),
            running: Arc::new(AtomicBool::new(false)),
            min_log_level: Arc::new(Mutex::new(LogLevel::Info)),
            opts,
        };
        server.setup_handlers();
        server
    }

    // ========================================================================
    // Registration
    // ========================================================================

    /// Adds (or replaces) a tool with a synchronous handler.
    pub fn add_tool<F>(&self, def: ToolDefinition, handler: F)
    where
        F: Fn(Value) -> McpResult<CallToolResult> + Send + Sync + 'static,
    {
        let name = def.name.clone();
        {
            let mut store = self.lock_store();
            store.tools.upsert(def, |t| t.name == name);
            store.deferred_tool_handlers.remove(&name);
            store.tool_handlers.insert(name, Arc::new(handler));
        }
        self.notify_list_changed("notifications/tools/list_changed");
    }

    /// Adds (or replaces) a tool whose handler runs on the worker pool, so
    /// the thread that received the frame is not blocked for its duration.
    pub fn add_tool_deferred<F>(&self, def: ToolDefinition, handler: F)
    where
        F: Fn(Value) -> McpResult<CallToolResult> + Send + Sync + 'static,
    {
        let name = def.name.clone();
        {
            let mut store = self.lock_store();
            store.tools.upsert(def, |t| t.name == name);
            store.tool_handlers.remove(&name);
            store.deferred_tool_handlers.insert(name, Arc::new(handler));
        }
        self.notify_list_changed("notifications/tools/list_changed");
    }

    /// Removes a tool by name.
    pub fn remove_tool(&self, name: &str) {
        {
            let mut store = self.lock_store();
            store.tools.remove(|t| t.name == name);
            store.tool_handlers.remove(name);
            store.deferred_tool_handlers.remove(name);
        }
        self.notify_list_changed("notifications/tools/list_changed");
    }

    /// Adds (or replaces) a fixed-URI resource.
    pub fn add_resource<F>(&self, def: ResourceDefinition, handler: F)
    where
        F: Fn(&str) -> McpResult<Vec<ResourceContent>> + Send + Sync + 'static,
    {
        let uri = def.uri.clone();
        {
            let mut store = self.lock_store();
            store.resources.upsert(def, |r| r.uri == uri);
            store.resource_handlers.insert(uri, Arc::new(handler));
        }
        self.notify_list_changed("notifications/resources/list_changed");
    }

    /// Adds (or replaces) a resource template.
    ///
    /// Template matching for `resources/read` is a prefix match on the
    /// template text up to its first `{`.
    pub fn add_resource_template<F>(&self, template: ResourceTemplate, handler: F)
    where
        F: Fn(&str) -> McpResult<Vec<ResourceContent>> + Send + Sync + 'static,
    {
        let key = template.uri_template.clone();
        let mut store = self.lock_store();
        store
            .resource_templates
            .upsert(template, |t| t.uri_template == key);
        store.resource_template_handlers.insert(key, Arc::new(handler));
    }

    /// Removes a fixed-URI resource.
    pub fn remove_resource(&self, uri: &str) {
        {
            let mut store = self.lock_store();
            store.resources.remove(|r| r.uri == uri);
            store.resource_handlers.remove(uri);
        }
        self.notify_list_changed("notifications/resources/list_changed");
    }

    /// Adds (or replaces) a prompt.
    pub fn add_prompt<F>(&self, def: PromptDefinition, handler: F)
    where
        F: Fn(&str, HashMap<String, String>) -> McpResult<GetPromptResult> + Send + Sync + 'static,
    {
        let name = def.name.clone();
        {
            let mut store = self.lock_store();
            store.prompts.upsert(def, |p| p.name == name);
            store.prompt_handlers.insert(name, Arc::new(handler));
        }
        self.notify_list_changed("notifications/prompts/list_changed");
    }

    /// Removes a prompt by name.
    pub fn remove_prompt(&self, name: &str) {
        {
            let mut store = self.lock_store();
            store.prompts.remove(|p| p.name == name);
            store.prompt_handlers.remove(name);
        }
        self.notify_list_changed("notifications/prompts/list_changed");
    }

    /// Installs the completion handler backing `completion/complete`.
    pub fn set_completion_handler<F>(&self, handler: F)
    where
        F: Fn(&CompletionRef, &str, &str) -> McpResult<CompletionResult> + Send + Sync + 'static,
    {
        self.lock_store().completion_handler = Some(Arc::new(handler));
    }

    // ========================================================================
    // Outbound notifications
    // ========================================================================

    /// Emits `notifications/resources/updated` for `uri`, but only when the
    /// uri is in the subscription set.
    pub fn notify_resource_updated(&self, uri: &str) {
        let subscribed = self.lock_store().subscribed_uris.contains(uri);
        if subscribed && self.running.load(Ordering::SeqCst) {
            self.send_notification(
                "notifications/resources/updated",
                Some(json!({"uri": uri})),
            );
        }
    }

    /// Emits a `notifications/message` log notification, suppressed below
    /// the current minimum level.
    pub fn log(&self, level: LogLevel, logger: &str, data: Value) {
        if level < *self.min_log_level.lock().expect("log level lock poisoned") {
            return;
        }
        if !self.running.load(Ordering::SeqCst) {
            return;
        }
        self.send_notification(
            "notifications/message",
            Some(json!({"level": level, "logger": logger, "data": data})),
        );
    }

    /// Emits a `notifications/progress` notification under a progress token.
    pub fn send_progress(
        &self,
        token: impl Into<ProgressToken>,
        progress: f64,
        total: Option<f64>,
        message: Option<String>,
    ) {
        let params = ProgressParams {
            progress_token: token.into(),
            progress,
            total,
            message,
        };
        if let Ok(value) = serde_json::to_value(&params) {
            self.send_notification("notifications/progress", Some(value));
        }
    }

    // ========================================================================
    // Reverse calls (server -> client)
    // ========================================================================

    /// Asks the connected client for an LLM completion.
    ///
    /// # Errors
    ///
    /// Returns protocol, transport, or timeout errors from the outbound
    /// call machinery.
    pub fn request_sampling(&self, request: SamplingRequest) -> McpResult<SamplingResult> {
        let params = serde_json::to_value(request).map_err(McpError::from)?;
        let value = self.request_peer("sampling/createMessage", Some(params))?;
        parse_result(value)
    }

    /// Asks the connected client for its filesystem roots.
    ///
    /// # Errors
    ///
    /// Returns protocol, transport, or timeout errors from the outbound
    /// call machinery.
    pub fn request_roots(&self) -> McpResult<Vec<Root>> {
        let value = self.request_peer("roots/list", Some(json!({})))?;
        let result: ListRootsResult = parse_result(value)?;
        Ok(result.roots)
    }

    /// Asks the connected client to elicit user input.
    ///
    /// # Errors
    ///
    /// Returns protocol, transport, or timeout errors from the outbound
    /// call machinery.
    pub fn request_elicitation(&self, request: ElicitationRequest) -> McpResult<ElicitationResult> {
        let params = serde_json::to_value(request).map_err(McpError::from)?;
        let value = self.request_peer("elicitation/create", Some(params))?;
        parse_result(value)
    }

    // ========================================================================
    // Serving
    // ========================================================================

    /// Runs the server over the given transport. Blocks until shutdown or
    /// peer disconnect.
    ///
    /// # Errors
    ///
    /// Returns an error when the server is already serving or the transport
    /// fails to come up.
    pub fn serve(&self, transport: Arc<dyn Transport>) -> McpResult<()> {
        if self.running.swap(true, Ordering::SeqCst) {
            return Err(McpError::transport("server is already serving"));
        }
        *self.lock_transport() = Some(Arc::clone(&transport));
        *self.pool.lock().expect("pool slot lock poisoned") =
            Some(Arc::new(WorkerPool::new(self.opts.thread_pool_size)));
        info!(
            target: targets::SERVER,
            "{} v{} serving",
            self.opts.server_info.name,
            self.opts.server_info.version
        );

        let on_message = self.message_callback();
        let on_error: ErrorCallback = Arc::new(|err| {
            warn!(target: targets::SERVER, "transport error: {err}");
        });
        let result = transport.start(on_message, Some(on_error));

        self.running.store(false, Ordering::SeqCst);
        *self.lock_transport() = None;
        if let Some(pool) = self.pool.lock().expect("pool slot lock poisoned").take() {
            pool.shutdown();
        }
        let dropped = self.session.fail_all_pending();
        if dropped > 0 {
            debug!(target: targets::SESSION, "dropped {dropped} pending reverse calls at shutdown");
        }
        self.session.set_state(SessionState::Closed);
        info!(target: targets::SERVER, "server stopped");
        result
    }

    /// Runs the server over stdin/stdout.
    ///
    /// # Errors
    ///
    /// See [`serve`](McpServer::serve).
    pub fn serve_stdio(&self) -> McpResult<()> {
        self.serve(Arc::new(StdioTransport::stdio()?))
    }

    /// Runs the server over Streamable HTTP on `host:port`.
    ///
    /// # Errors
    ///
    /// See [`serve`](McpServer::serve).
    pub fn serve_http(&self, host: &str, port: u16) -> McpResult<()> {
        let opts = HttpServerOptions {
            host: host.to_owned(),
            port,
            ..Default::default()
        };
        self.serve(Arc::new(HttpServerTransport::new(opts)))
    }

    /// Initiates shutdown: unblocks [`serve`](McpServer::serve) and fails
    /// blocked waiters.
    pub fn shutdown(&self) {
        self.session.set_state(SessionState::ShuttingDown);
        let transport = self.lock_transport().clone();
        if let Some(transport) = transport {
            transport.shutdown();
        }
    }

    /// Returns true while [`serve`](McpServer::serve) is running.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    // ========================================================================
    // Introspection
    // ========================================================================

    /// Returns all registered tools.
    #[must_use]
    pub fn tools(&self) -> Vec<ToolDefinition> {
        self.lock_store().tools.items().to_vec()
    }

    /// Returns all registered resources.
    #[must_use]
    pub fn resources(&self) -> Vec<ResourceDefinition> {
        self.lock_store().resources.items().to_vec()
    }

    /// Returns all registered resource templates.
    #[must_use]
    pub fn resource_templates(&self) -> Vec<ResourceTemplate> {
        self.lock_store().resource_templates.items().to_vec()
    }

    /// Returns all registered prompts.
    #[must_use]
    pub fn prompts(&self) -> Vec<PromptDefinition> {
        self.lock_store().prompts.items().to_vec()
    }

    /// Returns the currently subscribed resource URIs.
    #[must_use]
    pub fn subscribed_uris(&self) -> Vec<String> {
        self.lock_store().subscribed_uris.iter().cloned().collect()
    }

    /// Returns the session owning lifecycle state and reverse-call
    /// correlation.
    #[must_use]
    pub fn session(&self) -> &Arc<Session> {
        &self.session
    }

    /// Returns the router, for registering custom methods.
    #[must_use]
    pub fn router(&self) -> &Arc<Router> {
        &self.router
    }

    // ========================================================================
    // Internals
    // ========================================================================

    fn lock_store(&self) -> std::sync::MutexGuard<'_, ServerStore> {
        self.store.lock().expect("server store lock poisoned")
    }

    fn lock_transport(&self) -> std::sync::MutexGuard<'_, Option<Arc<dyn Transport>>> {
        self.transport.lock().expect("transport slot lock poisoned")
    }

    fn notify_list_changed(&self, method: &str) {
        if self.running.load(Ordering::SeqCst) {
            self.send_notification(method, None);
        }
    }

    fn send_notification(&self, method: &str, params: Option<Value>) {
        let transport = self.lock_transport().clone();
        if let Some(transport) = transport {
            let notification = JsonRpcNotification::new(method, params);
            if let Err(e) = transport.send(&JsonRpcMessage::Notification(notification)) {
                warn!(target: targets::SERVER, "failed to send {method}: {e}");
            }
        }
    }

    fn request_peer(&self, method: &str, params: Option<Value>) -> McpResult<Value> {
        let transport = self
            .lock_transport()
            .clone()
            .ok_or_else(|| McpError::transport("server is not serving"))?;
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

    /// Builds the inbound frame callback shared by every transport.
    fn message_callback(&self) -> MessageCallback {
        let session = Arc::clone(&self.session);
        let router = Arc::clone(&self.router);
        Arc::new(move |message| {
            // Sweep stale reverse-call entries while traffic flows.
            for id in session.check_timeouts() {
                debug!(target: targets::SESSION, "swept timed-out outbound request {id}");
            }
            match message {
                JsonRpcMessage::Response(response) => {
                    let id = response.id.clone();
                    if !session.complete_request(&id, response) {
                        // Not an id we issued (or it already timed out).
                        debug!(target: targets::SESSION, "dropping response for unknown id {id}");
                    }
                    None
                }
                other => router.dispatch(other),
            }
        })
    }

    /// Registers the MCP method surface and its capability requirements.
    #[allow(clippy::too_many_lines)]
    fn setup_handlers(&self) {
        let router = &self.router;

        // initialize
        {
            let session = Arc::clone(&self.session);
            let store = Arc::clone(&self.store);
            let server_info = self.opts.server_info.clone();
            let instructions = self.opts.instructions.clone();
            router.on_request("initialize", move |params| {
                let params: InitializeParams = parse_params(params)?;
                debug!(
                    target: targets::SESSION,
                    "initializing session with client {}",
                    params.client_info.name
                );

                session.set_state(SessionState::Initializing);
                session.set_client_capabilities(params.capabilities);
                // We accept exactly one protocol revision.
                session.set_protocol_version(PROTOCOL_VERSION);

                let capabilities = {
                    let store = store.lock().expect("server store lock poisoned");
                    store.build_capabilities()
                };
                session.set_server_capabilities(capabilities.clone());

                let result = InitializeResult {
                    protocol_version: PROTOCOL_VERSION.to_owned(),
                    capabilities,
                    server_info: server_info.clone(),
                    instructions: instructions.clone(),
                };
                serde_json::to_value(result).map_err(McpError::from)
            });
        }

        // notifications/initialized: session becomes Ready and the
        // negotiated pair is published to the router's capability gate.
        {
            let session = Arc::clone(&self.session);
            let router_weak = Arc::downgrade(router);
            router.on_notification("notifications/initialized", move |_| {
                session.set_state(SessionState::Ready);
                if let Some(router) = router_weak.upgrade() {
                    router.set_capabilities(
                        session.server_capabilities(),
                        session.client_capabilities(),
                    );
                }
            });
        }

        // ping: never gated.
        router.on_request("ping", |_| Ok(json!({})));

        // tools/list
        {
            let store = Arc::clone(&self.store);
            router.on_request("tools/list", move |params| {
                let params: ListToolsParams = parse_params(params)?;
                let store = store.lock().expect("server store lock poisoned");
                let (tools, next_cursor) = store.tools.page(params.cursor.as_deref());
                serde_json::to_value(ListToolsResult { tools, next_cursor }).map_err(McpError::from)
            });
            router.require_capability("tools/list", "tools");
        }

        // tools/call
        {
            let store = Arc::clone(&self.store);
            let pool = Arc::clone(&self.pool);
            router.on_request("tools/call", move |params| {
                let params: CallToolParams = parse_params(params)?;
                let arguments = params.arguments.unwrap_or_else(|| json!({}));

                let (handler, deferred) = {
                    let store = store.lock().expect("server store lock poisoned");
                    if let Some(handler) = store.tool_handlers.get(&params.name) {
                        (Arc::clone(handler), false)
                    } else if let Some(handler) = store.deferred_tool_handlers.get(&params.name) {
                        (Arc::clone(handler), true)
                    } else {
                        return Err(McpError::invalid_params(format!(
                            "Unknown tool: {}",
                            params.name
                        )));
                    }
                };

                let pool = if deferred {
                    pool.lock().expect("pool slot lock poisoned").clone()
                } else {
                    None
                };
                let result = match pool {
                    Some(pool) => {
                        let (tx, rx) = crossbeam_channel::bounded(1);
                        let job_handler = Arc::clone(&handler);
                        let args = arguments.clone();
                        let queued = pool.execute(move || {
                            let _ = tx.send(run_tool(&job_handler, args));
                        });
                        if queued {
                            rx.recv().unwrap_or_else(|_| {
                                CallToolResult::error("tool execution was aborted")
                            })
                        } else {
                            run_tool(&handler, arguments)
                        }
                    }
                    None => run_tool(&handler, arguments),
                };
                serde_json::to_value(result).map_err(McpError::from)
            });
            router.require_capability("tools/call", "tools");
        }

        // resources/list
        {
            let store = Arc::clone(&self.store);
            router.on_request("resources/list", move |params| {
                let params: ListResourcesParams = parse_params(params)?;
                let store = store.lock().expect("server store lock poisoned");
                let (resources, next_cursor) = store.resources.page(params.cursor.as_deref());
                serde_json::to_value(ListResourcesResult {
                    resources,
                    next_cursor,
                })
                .map_err(McpError::from)
            });
            router.require_capability("resources/list", "resources");
        }

        // resources/templates/list
        {
            let store = Arc::clone(&self.store);
            router.on_request("resources/templates/list", move |params| {
                let params: ListResourceTemplatesParams = parse_params(params)?;
                let store = store.lock().expect("server store lock poisoned");
                let (resource_templates, next_cursor) =
                    store.resource_templates.page(params.cursor.as_deref());
                serde_json::to_value(ListResourceTemplatesResult {
                    resource_templates,
                    next_cursor,
                })
                .map_err(McpError::from)
            });
            router.require_capability("resources/templates/list", "resources");
        }

        // resources/read: exact URI first, then template prefix match.
        {
            let store = Arc::clone(&self.store);
            router.on_request("resources/read", move |params| {
                let params: ReadResourceParams = parse_params(params)?;
                let handler = {
                    let store = store.lock().expect("server store lock poisoned");
                    match store.resource_handlers.get(&params.uri) {
                        Some(handler) => Some(Arc::clone(handler)),
                        None => store.resource_template_handlers.iter().find_map(
                            |(template, handler)| {
                                let prefix = template.split('{').next().unwrap_or(template);
                                params.uri.starts_with(prefix).then(|| Arc::clone(handler))
                            },
                        ),
                    }
                };
                let handler =
                    handler.ok_or_else(|| McpError::resource_not_found(&params.uri))?;

                let contents =
                    match panic::catch_unwind(AssertUnwindSafe(|| handler(&params.uri))) {
                        Ok(Ok(contents)) => contents,
                        Ok(Err(e)) => return Err(e),
                        Err(payload) => {
                            return Err(McpError::internal(format!(
                                "resource handler panicked: {}",
                                panic_message(payload.as_ref())
                            )));
                        }
                    };
                serde_json::to_value(ReadResourceResult { contents }).map_err(McpError::from)
            });
            router.require_capability("resources/read", "resources");
        }

        // resources/subscribe + resources/unsubscribe
        {
            let store = Arc::clone(&self.store);
            router.on_request("resources/subscribe", move |params| {
                let params: SubscribeResourceParams = parse_params(params)?;
                store
                    .lock()
                    .expect("server store lock poisoned")
                    .subscribed_uris
                    .insert(params.uri);
                Ok(json!({}))
            });
            router.require_capability("resources/subscribe", "resources");
        }
        {
            let store = Arc::clone(&self.store);
            router.on_request("resources/unsubscribe", move |params| {
                let params: UnsubscribeResourceParams = parse_params(params)?;
                store
                    .lock()
                    .expect("server store lock poisoned")
                    .subscribed_uris
                    .remove(&params.uri);
                Ok(json!({}))
            });
            router.require_capability("resources/unsubscribe", "resources");
        }

        // prompts/list
        {
            let store = Arc::clone(&self.store);
            router.on_request("prompts/list", move |params| {
                let params: ListPromptsParams = parse_params(params)?;
                let store = store.lock().expect("server store lock poisoned");
                let (prompts, next_cursor) = store.prompts.page(params.cursor.as_deref());
                serde_json::to_value(ListPromptsResult {
                    prompts,
                    next_cursor,
                })
                .map_err(McpError::from)
            });
            router.require_capability("prompts/list", "prompts");
        }

        // prompts/get
        {
            let store = Arc::clone(&self.store);
            router.on_request("prompts/get", move |params| {
                let params: GetPromptParams = parse_params(params)?;
                let handler = {
                    let store = store.lock().expect("server store lock poisoned");
                    store.prompt_handlers.get(&params.name).cloned()
                };
                let handler = handler.ok_or_else(|| {
                    McpError::invalid_params(format!("Unknown prompt: {}", params.name))
                })?;
                let arguments = params.arguments.unwrap_or_default();
                let result =
                    match panic::catch_unwind(AssertUnwindSafe(|| handler(&params.name, arguments)))
                    {
                        Ok(Ok(result)) => result,
                        Ok(Err(e)) => return Err(e),
                        Err(payload) => {
                            return Err(McpError::internal(format!(
                                "prompt handler panicked: {}",
                                panic_message(payload.as_ref())
                            )));
                        }
                    };
                serde_json::to_value(result).map_err(McpError::from)
            });
            router.require_capability("prompts/get", "prompts");
        }

        // completion/complete: ungated so a missing handler reports
        // method-not-found rather than a capability rejection.
        {
            let store = Arc::clone(&self.store);
            router.on_request("completion/complete", move |params| {
                let handler = {
                    let store = store.lock().expect("server store lock poisoned");
                    store.completion_handler.clone()
                };
                let handler =
                    handler.ok_or_else(|| McpError::method_not_found("completion/complete"))?;
                let params: CompleteParams = parse_params(params)?;
                let mut result =
                    handler(&params.reference, &params.argument.name, &params.argument.value)?;
                result.values.truncate(100);
                serde_json::to_value(result).map_err(McpError::from)
            });
        }

        // logging/setLevel
        {
            let min_log_level = Arc::clone(&self.min_log_level);
            router.on_request("logging/setLevel", move |params| {
                let params: SetLogLevelParams = parse_params(params)?;
                *min_log_level.lock().expect("log level lock poisoned") = params.level;
                Ok(json!({}))
            });
            router.require_capability("logging/setLevel", "logging");
        }

        // notifications/cancelled: informational. Handlers that want to be
        // cancellable consult their own cancellation flags; there is no
        // universal abort mechanism.
        router.on_notification("notifications/cancelled", |params| {
            let request_id = params.get("requestId").cloned().unwrap_or(Value::Null);
            let reason = params
                .get("reason")
                .and_then(Value::as_str)
                .unwrap_or("unspecified");
            info!(
                target: targets::SESSION,
                "cancellation requested for {request_id} (reason: {reason})"
            );
        });
    }
}

/// Runs a tool handler, converting failures (including panics) into
/// `isError` results rather than wire errors.
fn run_tool(handler: &ToolHandler, arguments: Value) -> CallToolResult {
    match panic::catch_unwind(AssertUnwindSafe(|| handler(arguments))) {
        Ok(Ok(result)) => result,
        Ok(Err(e)) => CallToolResult::error(e.message()),
        Err(payload) => CallToolResult::error(panic_message(payload.as_ref())),
    }
}
