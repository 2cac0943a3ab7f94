//! Streamable HTTP transport.
//!
//! A single endpoint path (default `/mcp`) serves three methods:
//!
//! - **POST**: body is a single JSON-RPC frame or a batch. Replies are
//!   returned in the response body: a single JSON object, a JSON array for
//!   batches (responses in input order, notifications skipped), or HTTP 202
//!   with an empty body when the input was notifications only. When the
//!   `Accept` header includes `text/event-stream` the replies are emitted as
//!   SSE `data:` events closed by an `event: done` sentinel.
//! - **GET**: opens a long-lived SSE stream used for server-initiated
//!   frames; a `: ping` keepalive comment is sent periodically.
//! - **DELETE**: terminates the named session (404 when unknown).
//!
//! Sessions are keyed by the `Mcp-Session-Id` header. The server mints a
//! UUIDv4 on the first request that lacks one and returns it in the response
//! header. An `MCP-Protocol-Version` header, when present, must match the
//! peer's supported version. An `Origin` header is validated against the
//! configured allow-list to defeat cross-origin misuse.

use std::collections::HashMap;
use std::io::Read;
use std::sync::atomic::{AtomicBool, AtomicU16, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread;
use std::time::Duration;

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};
use mcpeer_core::logging::{debug, info, targets, warn};
use mcpeer_core::{McpError, McpResult, codes};
use mcpeer_protocol::{JsonRpcMessage, PROTOCOL_VERSION};
use tiny_http::{Header, Method, Response, StatusCode};

use crate::{Codec, ErrorCallback, MessageCallback, Transport};

/// How long the accept loop waits per poll before re-checking shutdown.
const ACCEPT_TICK: Duration = Duration::from_millis(100);

/// Formats one SSE `data:` event.
fn sse_event(json: &str) -> String {
    format!("data: {json}\n\n")
}

fn header(field: &str, value: &str) -> Header {
    Header::from_bytes(field.as_bytes(), value.as_bytes()).expect("static header is valid")
}

fn header_value(request: &tiny_http::Request, name: &str) -> Option<String> {
    request
        .headers()
        .iter()
        .find(|h| h.field.as_str().as_str().eq_ignore_ascii_case(name))
        .map(|h| h.value.as_str().to_owned())
}

type JsonResponse = Response<std::io::Cursor<Vec<u8>>>;

fn json_response(status: u16, body: impl Into<String>) -> JsonResponse {
    Response::from_string(body.into())
        .with_status_code(status)
        .with_header(header("Content-Type", "application/json"))
}

// ============================================================================
// Server transport
// ============================================================================

/// Configuration for [`HttpServerTransport`].
#[derive(Debug, Clone)]
pub struct HttpServerOptions {
    /// Bind host.
    pub host: String,
    /// Bind port. Use 0 for an ephemeral port.
    pub port: u16,
    /// Endpoint path.
    pub mcp_path: String,
    /// Exact-match Origin allow-list. Empty means any origin is accepted.
    pub allowed_origins: Vec<String>,
    /// Keepalive interval for GET SSE streams.
    pub ping_interval: Duration,
}

impl Default for HttpServerOptions {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_owned(),
            port: 8080,
            mcp_path: "/mcp".to_owned(),
            allowed_origins: Vec::new(),
            ping_interval: Duration::from_secs(30),
        }
    }
}

/// One HTTP session: a routing context shared across requests carrying the
/// same `Mcp-Session-Id`.
struct HttpSession {
    id: String,
    /// Sink feeding the session's open GET SSE stream, if any.
    sink: Mutex<Option<Sender<Vec<u8>>>>,
}

impl HttpSession {
    fn new(id: String) -> Self {
        Self {
            id,
            sink: Mutex::new(None),
        }
    }

    /// Queues an SSE event on the session's stream; clears the sink when the
    /// stream reader has gone away.
    fn push(&self, event: &str) {
        let mut sink = self.sink.lock().expect("sse sink lock poisoned");
        let reader_gone = match sink.as_ref() {
            Some(tx) => tx.send(event.as_bytes().to_vec()).is_err(),
            None => false,
        };
        if reader_gone {
            *sink = None;
        }
    }
}

/// Server side of the Streamable HTTP binding.
pub struct HttpServerTransport {
    opts: HttpServerOptions,
    running: AtomicBool,
    shutdown_requested: AtomicBool,
    bound_port: AtomicU16,
    sessions: Mutex<HashMap<String, Arc<HttpSession>>>,
}

impl HttpServerTransport {
    /// Creates a server transport with the given options.
    #[must_use]
    pub fn new(opts: HttpServerOptions) -> Self {
        Self {
            opts,
            running: AtomicBool::new(false),
            shutdown_requested: AtomicBool::new(false),
            bound_port: AtomicU16::new(0),
            sessions: Mutex::new(HashMap::new()),
        }
    }

    /// Returns the port actually bound, once [`start`](Transport::start) has
    /// brought the listener up. Useful with `port: 0`.
    #[must_use]
    pub fn port(&self) -> u16 {
        let bound = self.bound_port.load(Ordering::SeqCst);
        if bound != 0 { bound } else { self.opts.port }
    }

    /// Sends a frame to one session's SSE stream, if it has one open.
    ///
    /// # Errors
    ///
    /// Returns an error if the frame cannot be serialized.
    pub fn send_to_session(&self, session_id: &str, message: &JsonRpcMessage) -> McpResult<()> {
        let event = sse_event(&Codec::serialize(message)?);
        let session = {
            let sessions = self.sessions.lock().expect("session table lock poisoned");
            sessions.get(session_id).cloned()
        };
        if let Some(session) = session {
            session.push(&event);
        }
        Ok(())
    }

    fn origin_allowed(&self, origin: &str) -> bool {
        self.opts.allowed_origins.is_empty()
            || self.opts.allowed_origins.iter().any(|a| a == origin)
    }

    /// Looks up the request's session, minting a new one when the header is
    /// absent. Returns the session and the freshly minted id, if any.
    fn resolve_session(
        &self,
        request: &tiny_http::Request,
    ) -> Result<(Arc<HttpSession>, Option<String>), JsonResponse> {
        match header_value(request, "Mcp-Session-Id").filter(|v| !v.is_empty()) {
            None => {
                let id = uuid::Uuid::new_v4().to_string();
                let session = Arc::new(HttpSession::new(id.clone()));
                self.sessions
                    .lock()
                    .expect("session table lock poisoned")
                    .insert(id.clone(), Arc::clone(&session));
                debug!(target: targets::TRANSPORT, "minted http session {id}");
                Ok((session, Some(id)))
            }
            Some(id) => {
                let sessions = self.sessions.lock().expect("session table lock poisoned");
                match sessions.get(&id) {
                    Some(session) => Ok((Arc::clone(session), None)),
                    None => Err(json_response(404, r#"{"error":"Session not found"}"#)),
                }
            }
        }
    }

    fn handle_request(
        &self,
        request: tiny_http::Request,
        on_message: &MessageCallback,
        on_error: Option<&ErrorCallback>,
    ) {
        let url = request.url().to_owned();
        let path = url.split('?').next().unwrap_or(&url);
        if path != self.opts.mcp_path {
            let _ = request.respond(json_response(404, r#"{"error":"Not found"}"#));
            return;
        }

        if let Some(origin) = header_value(&request, "Origin") {
            if !self.origin_allowed(&origin) {
                let _ = request.respond(json_response(403, r#"{"error":"Invalid origin"}"#));
                return;
            }
        }

        match request.method() {
            Method::Post => self.handle_post(request, on_message, on_error),
            Method::Get => self.handle_get(request),
            Method::Delete => self.handle_delete(request),
            _ => {
                let _ = request.respond(json_response(405, r#"{"error":"Method not allowed"}"#));
            }
        }
    }

    fn handle_post(
        &self,
        mut request: tiny_http::Request,
        on_message: &MessageCallback,
        on_error: Option<&ErrorCallback>,
    ) {
        if let Some(version) = header_value(&request, "MCP-Protocol-Version") {
            if version != PROTOCOL_VERSION {
                let _ = request.respond(json_response(
                    400,
                    r#"{"error":"Unsupported protocol version"}"#,
                ));
                return;
            }
        }

        let (_session, minted) = match self.resolve_session(&request) {
            Ok(pair) => pair,
            Err(response) => {
                let _ = request.respond(response);
                return;
            }
        };

        let mut body = String::new();
        if request.as_reader().read_to_string(&mut body).is_err() {
            let _ = request.respond(json_response(400, r#"{"error":"Unreadable body"}"#));
            return;
        }

        let is_batch = body.trim_start().starts_with('[');
        let parsed = if is_batch {
            Codec::parse_batch(&body)
        } else {
            Codec::parse(&body).map(|frame| vec![frame])
        };
        let frames = match parsed {
            Ok(frames) => frames,
            Err(e) => {
                if let Some(cb) = on_error {
                    cb(e.clone());
                }
                let error_body = serde_json::json!({
                    "jsonrpc": "2.0",
                    "id": null,
                    "error": {"code": codes::PARSE_ERROR, "message": e.message()},
                });
                let _ = request.respond(json_response(400, error_body.to_string()));
                return;
            }
        };

        // Responses to requests, in input order; notifications produce none.
        let mut replies = Vec::new();
        for frame in frames {
            if let Some(reply) = on_message(frame) {
                replies.push(reply);
            }
        }

        let wants_sse = header_value(&request, "Accept")
            .is_some_and(|accept| accept.contains("text/event-stream"));

        let mut response = if wants_sse {
            let mut stream_body = String::new();
            for reply in &replies {
                match Codec::serialize(reply) {
                    Ok(json) => stream_body.push_str(&sse_event(&json)),
                    Err(e) => warn!(target: targets::TRANSPORT, "failed to serialize reply: {e}"),
                }
            }
            stream_body.push_str("event: done\ndata: {}\n\n");
            Response::from_string(stream_body)
                .with_header(header("Content-Type", "text/event-stream"))
        } else if replies.is_empty() {
            Response::from_string(String::new()).with_status_code(202)
        } else if is_batch {
            match Codec::serialize_batch(&replies) {
                Ok(json) => json_response(200, json),
                Err(e) => json_response(500, format!(r#"{{"error":"{e}"}}"#)),
            }
        } else {
            match Codec::serialize(&replies[0]) {
                Ok(json) => json_response(200, json),
                Err(e) => json_response(500, format!(r#"{{"error":"{e}"}}"#)),
            }
        };

        if let Some(id) = minted {
            response.add_header(header("Mcp-Session-Id", &id));
        }
        let _ = request.respond(response);
    }

    fn handle_get(&self, request: tiny_http::Request) {
        let (session, minted) = match self.resolve_session(&request) {
            Ok(pair) => pair,
            Err(response) => {
                let _ = request.respond(response);
                return;
            }
        };

        let (tx, rx) = crossbeam_channel::unbounded::<Vec<u8>>();
        {
            let mut sink = session.sink.lock().expect("sse sink lock poisoned");
            // A new GET stream supersedes any previous one for this session.
            *sink = Some(tx);
        }
        debug!(target: targets::TRANSPORT, "sse stream opened for session {}", session.id);

        let stream = SseStream::new(rx, self.opts.ping_interval);
        let mut response = Response::new(
            StatusCode(200),
            vec![
                header("Content-Type", "text/event-stream"),
                header("Cache-Control", "no-cache"),
            ],
            stream,
            None,
            None,
        );
        if let Some(id) = minted {
            response.add_header(header("Mcp-Session-Id", &id));
        }
        // Blocks until the client disconnects or the sink is dropped.
        let _ = request.respond(response);
        debug!(target: targets::TRANSPORT, "sse stream closed for session {}", session.id);
    }

    fn handle_delete(&self, request: tiny_http::Request) {
        let Some(id) = header_value(&request, "Mcp-Session-Id").filter(|v| !v.is_empty()) else {
            let _ = request.respond(json_response(400, r#"{"error":"Missing Mcp-Session-Id"}"#));
            return;
        };
        let removed = self
            .sessions
            .lock()
            .expect("session table lock poisoned")
            .remove(&id);
        match removed {
            Some(_) => {
                let _ = request.respond(json_response(200, "{}"));
            }
            None => {
                let _ = request.respond(json_response(404, r#"{"error":"Session not found"}"#));
            }
        }
    }
}

impl Transport for HttpServerTransport {
    fn start(&self, on_message: MessageCallback, on_error: Option<ErrorCallback>) -> McpResult<()> {
        if self.shutdown_requested.load(Ordering::SeqCst) {
            return Ok(());
        }
        if self.running.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        let addr = format!("{}:{}", self.opts.host, self.opts.port);
        let server = tiny_http::Server::http(&addr).map_err(|e| {
            self.running.store(false, Ordering::SeqCst);
            McpError::transport(format!("failed to start HTTP server on {addr}: {e}"))
        })?;
        if let Some(socket) = server.server_addr().to_ip() {
            self.bound_port.store(socket.port(), Ordering::SeqCst);
        }
        info!(
            target: targets::TRANSPORT,
            "http transport listening on {}:{}{}",
            self.opts.host,
            self.port(),
            self.opts.mcp_path
        );

        thread::scope(|scope| {
            while self.running.load(Ordering::SeqCst) {
                match server.recv_timeout(ACCEPT_TICK) {
                    Ok(Some(request)) => {
                        let on_message = Arc::clone(&on_message);
                        let on_error = on_error.clone();
                        scope.spawn(move || {
                            self.handle_request(request, &on_message, on_error.as_ref());
                        });
                    }
                    Ok(None) => {}
                    Err(e) => {
                        if self.running.load(Ordering::SeqCst) {
                            warn!(target: targets::TRANSPORT, "http accept failed: {e}");
                        }
                        break;
                    }
                }
            }
            // Drop every SSE sink so lingering GET streams terminate and
            // their handler threads can be joined by the scope.
            self.sessions
                .lock()
                .expect("session table lock poisoned")
                .clear();
        });
        Ok(())
    }

    fn send(&self, message: &JsonRpcMessage) -> McpResult<()> {
        if self.shutdown_requested.load(Ordering::SeqCst) {
            return Err(McpError::transport("transport is shut down"));
        }
        let event = sse_event(&Codec::serialize(message)?);
        let sessions: Vec<Arc<HttpSession>> = {
            let table = self.sessions.lock().expect("session table lock poisoned");
            table.values().cloned().collect()
        };
        for session in sessions {
            session.push(&event);
        }
        Ok(())
    }

    fn shutdown(&self) {
        self.shutdown_requested.store(true, Ordering::SeqCst);
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }
        // Sinks are cleared by the accept loop on its way out.
    }

    fn is_connected(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }
}

/// Blocking reader feeding a chunked SSE response from a channel.
///
/// Emits a `: ping` keepalive whenever no event arrives within the
/// configured interval, and reports EOF once every sender is gone.
struct SseStream {
    rx: Receiver<Vec<u8>>,
    ping_interval: Duration,
    pending: Vec<u8>,
    pos: usize,
}

impl SseStream {
    fn new(rx: Receiver<Vec<u8>>, ping_interval: Duration) -> Self {
        Self {
            rx,
            ping_interval,
            // Initial keepalive so the client sees the stream open promptly.
            pending: b": ping\n\n".to_vec(),
            pos: 0,
        }
    }
}

impl Read for SseStream {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        if self.pos >= self.pending.len() {
            match self.rx.recv_timeout(self.ping_interval) {
                Ok(bytes) => {
                    self.pending = bytes;
                    self.pos = 0;
                }
                Err(RecvTimeoutError::Timeout) => {
                    self.pending = b": ping\n\n".to_vec();
                    self.pos = 0;
                }
                Err(RecvTimeoutError::Disconnected) => return Ok(0),
            }
        }
        let n = (self.pending.len() - self.pos).min(buf.len());
        buf[..n].copy_from_slice(&self.pending[self.pos..self.pos + n]);
        self.pos += n;
        Ok(n)
    }
}

// ============================================================================
// Client transport
// ============================================================================

/// Client side of the Streamable HTTP binding.
///
/// Every outbound frame is POSTed to the base URL with the required headers;
/// any frames in the response body are surfaced on the message callback. The
/// negotiated `Mcp-Session-Id` is captured from the first response and
/// attached to every later request.
pub struct HttpClientTransport {
    base_url: String,
    agent: ureq::Agent,
    session_id: Mutex<Option<String>>,
    on_message: Mutex<Option<MessageCallback>>,
    on_error: Mutex<Option<ErrorCallback>>,
    connected: AtomicBool,
    shutdown_requested: AtomicBool,
    lifecycle: Mutex<bool>,
    lifecycle_cv: Condvar,
}

impl HttpClientTransport {
    /// Creates a client transport for the given endpoint URL
    /// (e.g. `http://127.0.0.1:8080/mcp`).
    #[must_use]
    pub fn new(base_url: impl Into<String>) -> Self {
        let agent = ureq::AgentBuilder::new()
            .timeout_connect(Duration::from_secs(10))
            .timeout_read(Duration::from_secs(60))
            .build();
        Self {
            base_url: base_url.into(),
            agent,
            session_id: Mutex::new(None),
            on_message: Mutex::new(None),
            on_error: Mutex::new(None),
            connected: AtomicBool::new(false),
            shutdown_requested: AtomicBool::new(false),
            lifecycle: Mutex::new(false),
            lifecycle_cv: Condvar::new(),
        }
    }

    /// Returns the session id negotiated with the server, if any.
    #[must_use]
    pub fn session_id(&self) -> Option<String> {
        self.session_id.lock().expect("session id lock poisoned").clone()
    }

    fn dispatch(&self, message: JsonRpcMessage) {
        let callback = self
            .on_message
            .lock()
            .expect("message callback lock poisoned")
            .clone();
        if let Some(cb) = callback {
            if let Some(reply) = cb(message) {
                if let Err(e) = self.send(&reply) {
                    warn!(target: targets::TRANSPORT, "failed to send reply: {e}");
                }
            }
        }
    }

    fn report(&self, err: McpError) {
        let callback = self
            .on_error
            .lock()
            .expect("error callback lock poisoned")
            .clone();
        match callback {
            Some(cb) => cb(err),
            None => warn!(target: targets::TRANSPORT, "http client error: {err}"),
        }
    }

    fn dispatch_json_body(&self, body: &str) {
        let parsed = if body.trim_start().starts_with('[') {
            Codec::parse_batch(body)
        } else {
            Codec::parse(body).map(|frame| vec![frame])
        };
        match parsed {
            Ok(frames) => {
                for frame in frames {
                    self.dispatch(frame);
                }
            }
            Err(e) => self.report(e),
        }
    }

    fn dispatch_sse_body(&self, body: &str) {
        for event in body.split("\n\n") {
            let mut data = String::new();
            let mut done = false;
            for line in event.lines() {
                if line.starts_with(':') {
                    continue; // keepalive comment
                }
                if let Some(name) = line.strip_prefix("event:") {
                    if name.trim() == "done" {
                        done = true;
                    }
                } else if let Some(payload) = line.strip_prefix("data:") {
                    data.push_str(payload.trim_start());
                }
            }
            if done {
                break;
            }
            if !data.is_empty() {
                match Codec::parse(&data) {
                    Ok(frame) => self.dispatch(frame),
                    Err(e) => self.report(e),
                }
            }
        }
    }
}

impl Transport for HttpClientTransport {
    fn start(&self, on_message: MessageCallback, on_error: Option<ErrorCallback>) -> McpResult<()> {
        if self.shutdown_requested.load(Ordering::SeqCst) {
            return Ok(());
        }
        *self
            .on_message
            .lock()
            .expect("message callback lock poisoned") = Some(on_message);
        *self.on_error.lock().expect("error callback lock poisoned") = on_error;
        self.connected.store(true, Ordering::SeqCst);

        // Block until shutdown so every transport has one lifecycle shape.
        let mut done = self.lifecycle.lock().expect("lifecycle lock poisoned");
        while !*done {
            done = self
                .lifecycle_cv
                .wait(done)
                .expect("lifecycle lock poisoned");
        }
        Ok(())
    }

    fn send(&self, message: &JsonRpcMessage) -> McpResult<()> {
        if self.shutdown_requested.load(Ordering::SeqCst) {
            return Err(McpError::transport("transport is shut down"));
        }
        if !self.connected.load(Ordering::SeqCst) {
            return Err(McpError::transport("not connected"));
        }

        let body = Codec::serialize(message)?;
        let mut request = self
            .agent
            .post(&self.base_url)
            .set("Content-Type", "application/json")
            .set("Accept", "application/json, text/event-stream")
            .set("MCP-Protocol-Version", PROTOCOL_VERSION);
        if let Some(session_id) = self.session_id() {
            request = request.set("Mcp-Session-Id", &session_id);
        }

        let response = request.send_string(&body).map_err(|e| match e {
            ureq::Error::Status(code, _) => McpError::transport(format!("HTTP error {code}")),
            ureq::Error::Transport(t) => McpError::transport(format!("HTTP POST failed: {t}")),
        })?;

        if let Some(session_id) = response.header("Mcp-Session-Id") {
            *self.session_id.lock().expect("session id lock poisoned") =
                Some(session_id.to_owned());
        }

        let status = response.status();
        let content_type = response
            .header("Content-Type")
            .unwrap_or_default()
            .to_owned();
        let text = response
            .into_string()
            .map_err(|e| McpError::transport(format!("failed to read response body: {e}")))?;

        if status == 202 || text.trim().is_empty() {
            return Ok(());
        }
        if content_type.starts_with("text/event-stream") {
            self.dispatch_sse_body(&text);
        } else {
            self.dispatch_json_body(&text);
        }
        Ok(())
    }

    fn shutdown(&self) {
        self.shutdown_requested.store(true, Ordering::SeqCst);
        self.connected.store(false, Ordering::SeqCst);
        let mut done = self.lifecycle.lock().expect("lifecycle lock poisoned");
        *done = true;
        self.lifecycle_cv.notify_all();
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }
}
