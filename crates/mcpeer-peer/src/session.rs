//! Session state and outbound request correlation.
//!
//! One [`Session`] per peer owns the outbound ID counter, the pending-call
//! tables, the lifecycle state, and the negotiated capability pair. Pending
//! entries are removed exactly once: by the matching response, by the
//! timeout path, or by [`Session::fail_all_pending`] at shutdown.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use crossbeam_channel::{RecvTimeoutError, Sender};
use mcpeer_core::logging::{debug, targets};
use mcpeer_core::{McpError, McpResult};
use mcpeer_protocol::{
    ClientCapabilities, JsonRpcMessage, JsonRpcRequest, JsonRpcResponse, ProgressToken, RequestId,
    ServerCapabilities,
};
use mcpeer_transport::Transport;
use serde_json::Value;

/// Lifecycle of a peer connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// No handshake has happened yet.
    Uninitialized,
    /// `initialize` is in flight.
    Initializing,
    /// Handshake complete; all methods legal.
    Ready,
    /// Shutdown has begun.
    ShuttingDown,
    /// The connection is gone.
    Closed,
}

/// One in-flight outbound request.
struct PendingRequest {
    method: String,
    created_at: Instant,
    completer: Sender<JsonRpcResponse>,
    progress_token: Option<ProgressToken>,
}

struct SessionInner {
    state: SessionState,
    next_id: i64,
    pending_int: HashMap<i64, PendingRequest>,
    pending_str: HashMap<String, PendingRequest>,
    server_capabilities: ServerCapabilities,
    client_capabilities: ClientCapabilities,
    protocol_version: String,
    session_id: Option<String>,
    request_timeout: Duration,
}

/// Peer session: lifecycle state plus the outbound correlation table.
pub struct Session {
    inner: Mutex<SessionInner>,
}

impl Session {
    /// Creates an uninitialized session with a 30 second request timeout.
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(SessionInner {
                state: SessionState::Uninitialized,
                next_id: 1,
                pending_int: HashMap::new(),
                pending_str: HashMap::new(),
                server_capabilities: ServerCapabilities::default(),
                client_capabilities: ClientCapabilities::default(),
                protocol_version: String::new(),
                session_id: None,
                request_timeout: Duration::from_millis(30_000),
            }),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, SessionInner> {
        self.inner.lock().expect("session lock poisoned")
    }

    /// Returns the lifecycle state.
    #[must_use]
    pub fn state(&self) -> SessionState {
        self.lock().state
    }

    /// Sets the lifecycle state.
    pub fn set_state(&self, state: SessionState) {
        self.lock().state = state;
    }

    /// Allocates the next outbound request ID. Monotonic; never reused
    /// within the peer's lifetime.
    #[must_use]
    pub fn next_id(&self) -> RequestId {
        let mut inner = self.lock();
        let id = inner.next_id;
        inner.next_id += 1;
        RequestId::Number(id)
    }

    /// Allocates an ID and records a pending entry whose completer fires
    /// when the matching response arrives.
    pub fn register_request(&self, method: &str, completer: Sender<JsonRpcResponse>) -> RequestId {
        let mut inner = self.lock();
        let id = inner.next_id;
        inner.next_id += 1;
        inner.pending_int.insert(
            id,
            PendingRequest {
                method: method.to_owned(),
                created_at: Instant::now(),
                completer,
                progress_token: None,
            },
        );
        RequestId::Number(id)
    }

    /// Completes a pending request with its response. Returns whether an
    /// entry existed; late or unknown responses return false and are
    /// dropped by the caller.
    pub fn complete_request(&self, id: &RequestId, response: JsonRpcResponse) -> bool {
        let entry = {
            let mut inner = self.lock();
            match id {
                RequestId::Number(n) => inner.pending_int.remove(n),
                RequestId::String(s) => inner.pending_str.remove(s),
            }
        };
        match entry {
            Some(pending) => {
                // The waiter may have timed out already; a dead channel is fine.
                let _ = pending.completer.send(response);
                true
            }
            None => false,
        }
    }

    /// Associates a progress token with a pending request.
    pub fn register_progress_token(&self, id: &RequestId, token: ProgressToken) {
        let mut inner = self.lock();
        let entry = match id {
            RequestId::Number(n) => inner.pending_int.get_mut(n),
            RequestId::String(s) => inner.pending_str.get_mut(s),
        };
        if let Some(pending) = entry {
            pending.progress_token = Some(token);
        }
    }

    /// Returns the progress token registered for a pending request, if any.
    #[must_use]
    pub fn progress_token(&self, id: &RequestId) -> Option<ProgressToken> {
        let inner = self.lock();
        let entry = match id {
            RequestId::Number(n) => inner.pending_int.get(n),
            RequestId::String(s) => inner.pending_str.get(s),
        };
        entry.and_then(|pending| pending.progress_token.clone())
    }

    /// Returns true while the given request is pending.
    #[must_use]
    pub fn has_pending_request(&self, id: &RequestId) -> bool {
        let inner = self.lock();
        match id {
            RequestId::Number(n) => inner.pending_int.contains_key(n),
            RequestId::String(s) => inner.pending_str.contains_key(s),
        }
    }

    /// Sets the per-request timeout.
    pub fn set_request_timeout(&self, timeout: Duration) {
        self.lock().request_timeout = timeout;
    }

    /// Returns the per-request timeout.
    #[must_use]
    pub fn request_timeout(&self) -> Duration {
        self.lock().request_timeout
    }

    /// Drains and returns every pending entry older than the timeout.
    ///
    /// Dropping an entry drops its completer, so an abandoned waiter
    /// observes a disconnect. Blocking waiters created by [`Session::call`]
    /// enforce their own deadline and normally retire their entry first.
    pub fn check_timeouts(&self) -> Vec<RequestId> {
        let mut inner = self.lock();
        let timeout = inner.request_timeout;
        let now = Instant::now();
        let mut timed_out = Vec::new();

        let stale_int: Vec<i64> = inner
            .pending_int
            .iter()
            .filter(|(_, p)| now.duration_since(p.created_at) > timeout)
            .map(|(&id, _)| id)
            .collect();
        for id in stale_int {
            inner.pending_int.remove(&id);
            timed_out.push(RequestId::Number(id));
        }

        let stale_str: Vec<String> = inner
            .pending_str
            .iter()
            .filter(|(_, p)| now.duration_since(p.created_at) > timeout)
            .map(|(id, _)| id.clone())
            .collect();
        for id in stale_str {
            inner.pending_str.remove(&id);
            timed_out.push(RequestId::String(id));
        }

        timed_out
    }

    /// Drops every pending entry, failing any blocked waiters with a
    /// disconnect. Returns how many entries were dropped.
    pub fn fail_all_pending(&self) -> usize {
        let mut inner = self.lock();
        let count = inner.pending_int.len() + inner.pending_str.len();
        inner.pending_int.clear();
        inner.pending_str.clear();
        count
    }

    /// Returns the negotiated server capabilities.
    #[must_use]
    pub fn server_capabilities(&self) -> ServerCapabilities {
        self.lock().server_capabilities.clone()
    }

    /// Stores the negotiated server capabilities.
    pub fn set_server_capabilities(&self, capabilities: ServerCapabilities) {
        self.lock().server_capabilities = capabilities;
    }

    /// Returns the negotiated client capabilities.
    #[must_use]
    pub fn client_capabilities(&self) -> ClientCapabilities {
        self.lock().client_capabilities.clone()
    }

    /// Stores the negotiated client capabilities.
    pub fn set_client_capabilities(&self, capabilities: ClientCapabilities) {
        self.lock().client_capabilities = capabilities;
    }

    /// Returns the negotiated protocol version (empty before handshake).
    #[must_use]
    pub fn protocol_version(&self) -> String {
        self.lock().protocol_version.clone()
    }

    /// Stores the negotiated protocol version.
    pub fn set_protocol_version(&self, version: impl Into<String>) {
        self.lock().protocol_version = version.into();
    }

    /// Returns the transport session id, if one has been assigned.
    #[must_use]
    pub fn session_id(&self) -> Option<String> {
        self.lock().session_id.clone()
    }

    /// Stores the transport session id.
    pub fn set_session_id(&self, id: Option<String>) {
        self.lock().session_id = id;
    }

    /// Issues an outbound request and blocks until the correlated response
    /// arrives or the deadline passes.
    ///
    /// Used by both peer flavors: client-issued calls and server-issued
    /// reverse calls share this table and ID space.
    ///
    /// # Errors
    ///
    /// Returns a timeout error when the deadline expires, or a transport
    /// error when the send fails or the connection closes while waiting.
    pub fn call(
        &self,
        transport: &Arc<dyn Transport>,
        method: &str,
        params: Option<Value>,
    ) -> McpResult<JsonRpcResponse> {
        let (tx, rx) = crossbeam_channel::bounded(1);
        let id = self.register_request(method, tx);
        let timeout = self.request_timeout();

        let request = JsonRpcRequest::new(id.clone(), method, params);
        if let Err(e) = transport.send(&JsonRpcMessage::Request(request)) {
            self.remove_pending(&id);
            return Err(e);
        }

        match rx.recv_timeout(timeout) {
            Ok(response) => Ok(response),
            Err(RecvTimeoutError::Timeout) => {
                // Retire the entry so a late response is dropped by the
                // correlation lookup.
                self.remove_pending(&id);
                debug!(target: targets::SESSION, "request {id} ({method}) timed out");
                Err(McpError::timeout(format!("request timed out: {method}")))
            }
            Err(RecvTimeoutError::Disconnected) => Err(McpError::transport(format!(
                "connection closed while waiting for {method}"
            ))),
        }
    }

    fn remove_pending(&self, id: &RequestId) {
        let mut inner = self.lock();
        match id {
            RequestId::Number(n) => {
                inner.pending_int.remove(n);
            }
            RequestId::String(s) => {
                inner.pending_str.remove(s);
            }
        }
    }
}

impl Default for Session {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn ids_are_monotonic_and_unique() {
        let session = Session::new();
        let mut seen = std::collections::HashSet::new();
        for _ in 0..100 {
            let id = session.next_id();
            assert!(seen.insert(id.to_string()));
        }
        let (tx, _rx) = crossbeam_channel::bounded(1);
        let id = session.register_request("ping", tx);
        assert!(seen.insert(id.to_string()));
    }

    #[test]
    fn complete_request_fires_exactly_once() {
        let session = Session::new();
        let (tx, rx) = crossbeam_channel::bounded(1);
        let id = session.register_request("tools/list", tx);
        assert!(session.has_pending_request(&id));

        let response = JsonRpcResponse::success(id.clone(), json!({"tools": []}));
        assert!(session.complete_request(&id, response.clone()));
        assert!(!session.has_pending_request(&id));
        assert_eq!(rx.try_recv().unwrap().id, id);

        // Second completion finds nothing.
        assert!(!session.complete_request(&id, response));
    }

    #[test]
    fn completing_an_unknown_id_returns_false() {
        let session = Session::new();
        let response = JsonRpcResponse::success(RequestId::Number(42), json!({}));
        assert!(!session.complete_request(&RequestId::Number(42), response));
        let response = JsonRpcResponse::success(RequestId::String("x".into()), json!({}));
        assert!(!session.complete_request(&RequestId::String("x".into()), response));
    }

    #[test]
    fn check_timeouts_drains_only_stale_entries() {
        let session = Session::new();
        session.set_request_timeout(Duration::from_millis(50));

        let (tx, rx) = crossbeam_channel::bounded(1);
        let stale = session.register_request("slow", tx);
        std::thread::sleep(Duration::from_millis(80));
        let (tx2, _rx2) = crossbeam_channel::bounded(1);
        let fresh = session.register_request("fast", tx2);

        let timed_out = session.check_timeouts();
        assert_eq!(timed_out, vec![stale.clone()]);
        assert!(!session.has_pending_request(&stale));
        assert!(session.has_pending_request(&fresh));

        // The abandoned waiter observes a disconnect.
        assert!(matches!(
            rx.recv_timeout(Duration::from_millis(10)),
            Err(RecvTimeoutError::Disconnected)
        ));
    }

    #[test]
    fn fail_all_pending_disconnects_waiters() {
        let session = Session::new();
        let (tx, rx) = crossbeam_channel::bounded(1);
        session.register_request("a", tx);
        let (tx2, rx2) = crossbeam_channel::bounded(1);
        session.register_request("b", tx2);

        assert_eq!(session.fail_all_pending(), 2);
        assert!(matches!(rx.try_recv(), Err(crossbeam_channel::TryRecvError::Disconnected)));
        assert!(matches!(rx2.try_recv(), Err(crossbeam_channel::TryRecvError::Disconnected)));
    }

    #[test]
    fn progress_token_round_trip() {
        let session = Session::new();
        let (tx, _rx) = crossbeam_channel::bounded(1);
        let id = session.register_request("tools/call", tx);

        assert!(session.progress_token(&id).is_none());
        session.register_progress_token(&id, ProgressToken::from("tok"));
        assert_eq!(session.progress_token(&id), Some(ProgressToken::from("tok")));

        // Unknown ids are ignored.
        session.register_progress_token(&RequestId::Number(999), ProgressToken::from(1i64));
    }

    #[test]
    fn lifecycle_state_transitions() {
        let session = Session::new();
        assert_eq!(session.state(), SessionState::Uninitialized);
        session.set_state(SessionState::Initializing);
        session.set_state(SessionState::Ready);
        assert_eq!(session.state(), SessionState::Ready);
        session.set_state(SessionState::ShuttingDown);
        session.set_state(SessionState::Closed);
        assert_eq!(session.state(), SessionState::Closed);
    }
}
