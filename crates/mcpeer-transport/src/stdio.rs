//! Standard I/O transport.
//!
//! The primary transport for MCP servers running as a subprocess. Uses
//! newline-delimited JSON framing over a file-descriptor pair.
//!
//! # Wire Format
//!
//! - Each message is a single line of UTF-8 JSON terminated by `\n`
//! - A `\r` before the `\n` is accepted and stripped
//! - Empty lines are ignored
//!
//! # Threads
//!
//! [`StdioTransport::start`] runs the receive loop on the calling thread and
//! a dedicated writer thread for the send queue. The receive loop multiplexes
//! the read descriptor with an internal wakeup pipe so
//! [`shutdown`](StdioTransport::shutdown) can interrupt a blocking wait from
//! any thread. Messages queued via [`send`](StdioTransport::send) before
//! `start` are drained once the writer starts; sends after `shutdown` fail
//! with a transport error.

use std::collections::VecDeque;
use std::os::fd::RawFd;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Condvar, Mutex};
use std::thread;

use mcpeer_core::logging::{debug, error, targets, warn};
use mcpeer_core::{McpError, McpResult};
use mcpeer_protocol::JsonRpcMessage;

use crate::{Codec, ErrorCallback, MessageCallback, Transport};

/// Creates an anonymous pipe, returning `(read_fd, write_fd)`.
///
/// Useful for wiring two in-process peers together in tests and for
/// embedders that manage their own descriptor pairs.
///
/// # Errors
///
/// Returns a transport error if the pipe cannot be created.
pub fn pipe() -> McpResult<(RawFd, RawFd)> {
    sys::pipe().map_err(|e| McpError::transport(format!("failed to create pipe: {e}")))
}

/// Stdio transport over a file-descriptor pair.
pub struct StdioTransport {
    read_fd: RawFd,
    write_fd: RawFd,
    owns_fds: bool,
    wakeup_read: RawFd,
    wakeup_write: RawFd,
    queue: Mutex<VecDeque<String>>,
    queue_cv: Condvar,
    running: AtomicBool,
    shutdown_requested: AtomicBool,
    connected: AtomicBool,
}

impl StdioTransport {
    /// Creates a transport over stdin/stdout.
    ///
    /// This is the constructor for MCP servers running as a subprocess.
    ///
    /// # Errors
    ///
    /// Returns a transport error if the internal wakeup pipe cannot be
    /// created.
    pub fn stdio() -> McpResult<Self> {
        Self::build(libc::STDIN_FILENO, libc::STDOUT_FILENO, false)
    }

    /// Creates a transport over an explicit descriptor pair.
    ///
    /// The transport takes ownership of both descriptors and closes them on
    /// drop.
    ///
    /// # Errors
    ///
    /// Returns a transport error if the internal wakeup pipe cannot be
    /// created.
    pub fn from_fds(read_fd: RawFd, write_fd: RawFd) -> McpResult<Self> {
        Self::build(read_fd, write_fd, true)
    }

    fn build(read_fd: RawFd, write_fd: RawFd, owns_fds: bool) -> McpResult<Self> {
        let (wakeup_read, wakeup_write) =
            sys::pipe().map_err(|e| McpError::transport(format!("failed to create wakeup pipe: {e}")))?;
        if let Err(e) = sys::set_nonblocking(wakeup_write) {
            sys::close(wakeup_read);
            sys::close(wakeup_write);
            return Err(McpError::transport(format!(
                "failed to configure wakeup pipe: {e}"
            )));
        }
        Ok(Self {
            read_fd,
            write_fd,
            owns_fds,
            wakeup_read,
            wakeup_write,
            queue: Mutex::new(VecDeque::new()),
            queue_cv: Condvar::new(),
            running: AtomicBool::new(false),
            shutdown_requested: AtomicBool::new(false),
            connected: AtomicBool::new(false),
        })
    }

    /// Writer thread: drains the send queue to `write_fd` in FIFO order.
    ///
    /// Exits once shutdown is requested and the queue is empty, so messages
    /// already queued still go out.
    fn write_loop(&self) {
        loop {
            let line = {
                let mut queue = self.queue.lock().expect("write queue lock poisoned");
                loop {
                    if let Some(line) = queue.pop_front() {
                        break Some(line);
                    }
                    if !self.running.load(Ordering::SeqCst) {
                        break None;
                    }
                    queue = self
                        .queue_cv
                        .wait(queue)
                        .expect("write queue lock poisoned");
                }
            };

            let Some(mut line) = line else { break };
            line.push('\n');
            if let Err(e) = sys::write_all(self.write_fd, line.as_bytes()) {
                error!(target: targets::TRANSPORT, "stdio write failed: {e}");
                break;
            }
        }
    }

    /// Receive loop: multiplexes `read_fd` with the wakeup pipe, scans for
    /// complete lines, and hands each parsed frame to the message callback.
    fn read_loop(&self, on_message: &MessageCallback, on_error: Option<&ErrorCallback>) {
        let mut buffer: Vec<u8> = Vec::with_capacity(4096);
        let mut chunk = [0u8; 4096];

        while self.running.load(Ordering::SeqCst) {
            let (data_ready, wakeup_ready) =
                match sys::poll_readable(self.read_fd, self.wakeup_read) {
                    Ok(ready) => ready,
                    Err(e) => {
                        report(on_error, McpError::transport(format!("poll failed: {e}")));
                        break;
                    }
                };

            // Wakeup pipe readable: shutdown() was called, exit cleanly.
            if wakeup_ready {
                break;
            }
            if !data_ready {
                continue;
            }

            let n = match sys::read(self.read_fd, &mut chunk) {
                Ok(n) => n,
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => continue,
                Err(e) => {
                    if self.running.load(Ordering::SeqCst) {
                        report(on_error, McpError::transport(format!("read failed: {e}")));
                    }
                    break;
                }
            };
            if n == 0 {
                // EOF
                debug!(target: targets::TRANSPORT, "stdio peer closed the stream");
                self.connected.store(false, Ordering::SeqCst);
                self.running.store(false, Ordering::SeqCst);
                self.queue_cv.notify_all();
                break;
            }

            buffer.extend_from_slice(&chunk[..n]);
            self.drain_lines(&mut buffer, on_message, on_error);
        }
    }

    /// Parses every complete line currently buffered.
    fn drain_lines(
        &self,
        buffer: &mut Vec<u8>,
        on_message: &MessageCallback,
        on_error: Option<&ErrorCallback>,
    ) {
        let mut start = 0;
        while let Some(offset) = buffer[start..].iter().position(|&b| b == b'\n') {
            let end = start + offset;
            let mut line = &buffer[start..end];
            start = end + 1;

            if let [head @ .., b'\r'] = line {
                line = head;
            }
            if line.is_empty() {
                continue;
            }

            match std::str::from_utf8(line) {
                Ok(text) => match Codec::parse(text) {
                    Ok(message) => {
                        if let Some(reply) = on_message(message) {
                            if let Err(e) = self.send(&reply) {
                                warn!(
                                    target: targets::TRANSPORT,
                                    "failed to send reply: {e}"
                                );
                            }
                        }
                    }
                    Err(e) => report(on_error, e),
                },
                Err(_) => report(on_error, McpError::parse("line is not valid UTF-8")),
            }
        }
        if start > 0 {
            buffer.drain(..start);
        }
    }
}

impl Transport for StdioTransport {
    fn start(&self, on_message: MessageCallback, on_error: Option<ErrorCallback>) -> McpResult<()> {
        // shutdown() before start(): don't block, exit immediately.
        if self.shutdown_requested.load(Ordering::SeqCst) {
            return Ok(());
        }
        if self.running.swap(true, Ordering::SeqCst) {
            return Ok(()); // already running
        }
        self.connected.store(true, Ordering::SeqCst);

        thread::scope(|scope| {
            scope.spawn(|| self.write_loop());
            self.read_loop(&on_message, on_error.as_ref());
            // Unblock the writer so the scope can join it. The queue is
            // drained before the writer exits.
            self.running.store(false, Ordering::SeqCst);
            self.connected.store(false, Ordering::SeqCst);
            self.queue_cv.notify_all();
        });
        Ok(())
    }

    fn send(&self, message: &JsonRpcMessage) -> McpResult<()> {
        // Fail only if permanently shut down, not if start() hasn't run yet;
        // messages queued before start() are drained once the writer starts.
        if self.shutdown_requested.load(Ordering::SeqCst) {
            return Err(McpError::transport("transport is shut down"));
        }
        let line = Codec::serialize(message)?;
        {
            let mut queue = self.queue.lock().expect("write queue lock poisoned");
            queue.push_back(line);
        }
        self.queue_cv.notify_one();
        Ok(())
    }

    fn shutdown(&self) {
        self.shutdown_requested.store(true, Ordering::SeqCst);
        if !self.running.swap(false, Ordering::SeqCst) {
            // start() hasn't been called (or already shut down); wake the
            // writer in case it is waiting.
            self.queue_cv.notify_all();
            return;
        }
        self.connected.store(false, Ordering::SeqCst);
        self.queue_cv.notify_all();
        // Interrupt poll() in the receive loop.
        let _ = sys::write_all(self.wakeup_write, &[1]);
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }
}

impl Drop for StdioTransport {
    fn drop(&mut self) {
        self.shutdown();
        sys::close(self.wakeup_read);
        sys::close(self.wakeup_write);
        if self.owns_fds {
            sys::close(self.read_fd);
            sys::close(self.write_fd);
        }
    }
}

fn report(on_error: Option<&ErrorCallback>, err: McpError) {
    match on_error {
        Some(cb) => cb(err),
        None => warn!(target: targets::TRANSPORT, "stdio transport error: {err}"),
    }
}

/// Thin wrappers over the libc calls the transport needs. All `unsafe` in
/// this crate lives here.
mod sys {
    use std::io;
    use std::os::fd::RawFd;

    pub fn pipe() -> io::Result<(RawFd, RawFd)> {
        let mut fds = [0 as libc::c_int; 2];
        // SAFETY: fds points at a valid 2-element array for the call.
        let rc = unsafe { libc::pipe(fds.as_mut_ptr()) };
        if rc < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok((fds[0], fds[1]))
    }

    pub fn set_nonblocking(fd: RawFd) -> io::Result<()> {
        // SAFETY: fcntl on a descriptor we own.
        let flags = unsafe { libc::fcntl(fd, libc::F_GETFL, 0) };
        if flags < 0 {
            return Err(io::Error::last_os_error());
        }
        // SAFETY: as above.
        let rc = unsafe { libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) };
        if rc < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    /// Blocks until either descriptor is readable. Returns readability of
    /// `(a, b)`. Hangup and error conditions count as readable so the
    /// caller's `read` observes EOF.
    pub fn poll_readable(a: RawFd, b: RawFd) -> io::Result<(bool, bool)> {
        let mut fds = [
            libc::pollfd {
                fd: a,
                events: libc::POLLIN,
                revents: 0,
            },
            libc::pollfd {
                fd: b,
                events: libc::POLLIN,
                revents: 0,
            },
        ];
        loop {
            // SAFETY: fds is a valid array of two pollfd structs.
            let rc = unsafe { libc::poll(fds.as_mut_ptr(), 2, -1) };
            if rc < 0 {
                let err = io::Error::last_os_error();
                if err.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                return Err(err);
            }
            let ready = libc::POLLIN | libc::POLLHUP | libc::POLLERR;
            return Ok((
                fds[0].revents & ready != 0,
                fds[1].revents & ready != 0,
            ));
        }
    }

    pub fn read(fd: RawFd, buf: &mut [u8]) -> io::Result<usize> {
        loop {
            // SAFETY: buf is valid for writes of buf.len() bytes.
            let n = unsafe { libc::read(fd, buf.as_mut_ptr().cast(), buf.len()) };
            if n < 0 {
                let err = io::Error::last_os_error();
                if err.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                return Err(err);
            }
            #[allow(clippy::cast_sign_loss)]
            return Ok(n as usize);
        }
    }

    pub fn write_all(fd: RawFd, mut bytes: &[u8]) -> io::Result<()> {
        while !bytes.is_empty() {
            // SAFETY: bytes is valid for reads of bytes.len() bytes.
            let n = unsafe { libc::write(fd, bytes.as_ptr().cast(), bytes.len()) };
            if n < 0 {
                let err = io::Error::last_os_error();
                if err.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                return Err(err);
            }
            #[allow(clippy::cast_sign_loss)]
            let n = n as usize;
            bytes = &bytes[n..];
        }
        Ok(())
    }

    pub fn close(fd: RawFd) {
        // SAFETY: closing a descriptor we own; errors are ignorable here.
        unsafe {
            libc::close(fd);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mcpeer_protocol::{JsonRpcNotification, JsonRpcRequest, JsonRpcResponse, RequestId};
    use std::sync::Arc;
    use std::sync::mpsc;
    use std::time::Duration;

    /// Reads one `\n`-terminated line from a raw descriptor.
    fn read_line(fd: RawFd) -> String {
        let mut out = Vec::new();
        let mut byte = [0u8; 1];
        loop {
            let n = sys::read(fd, &mut byte).expect("read");
            if n == 0 || byte[0] == b'\n' {
                break;
            }
            out.push(byte[0]);
        }
        String::from_utf8(out).expect("utf8 line")
    }

    struct Harness {
        transport: Arc<StdioTransport>,
        /// Write end feeding the transport's reader.
        inbound_w: RawFd,
        /// Read end observing the transport's writer.
        outbound_r: RawFd,
        handle: std::thread::JoinHandle<()>,
        messages: mpsc::Receiver<JsonRpcMessage>,
        errors: mpsc::Receiver<McpError>,
    }

    /// Spawns a transport reading from one pipe and writing to another,
    /// echoing a canned response for every request it receives.
    fn spawn_harness(reply: Option<JsonRpcResponse>) -> Harness {
        let (in_r, in_w) = sys::pipe().expect("pipe");
        let (out_r, out_w) = sys::pipe().expect("pipe");
        let transport = Arc::new(StdioTransport::from_fds(in_r, out_w).expect("transport"));

        let (msg_tx, msg_rx) = mpsc::channel();
        let (err_tx, err_rx) = mpsc::channel();

        let t = Arc::clone(&transport);
        let handle = std::thread::spawn(move || {
            let on_message: MessageCallback = Arc::new(move |msg| {
                let is_request = matches!(msg, JsonRpcMessage::Request(_));
                msg_tx.send(msg).ok();
                match (&reply, is_request) {
                    (Some(resp), true) => Some(JsonRpcMessage::Response(resp.clone())),
                    _ => None,
                }
            });
            let on_error: ErrorCallback = Arc::new(move |err| {
                err_tx.send(err).ok();
            });
            t.start(on_message, Some(on_error)).expect("start");
        });

        Harness {
            transport,
            inbound_w: in_w,
            outbound_r: out_r,
            handle,
            messages: msg_rx,
            errors: err_rx,
        }
    }

    #[test]
    fn receives_lf_and_crlf_frames_and_skips_empty_lines() {
        let h = spawn_harness(None);
        let input =
            b"\n{\"jsonrpc\":\"2.0\",\"id\":1,\"method\":\"ping\"}\r\n\n{\"jsonrpc\":\"2.0\",\"method\":\"notifications/initialized\"}\n";
        sys::write_all(h.inbound_w, input).expect("write");

        let first = h
            .messages
            .recv_timeout(Duration::from_secs(5))
            .expect("first frame");
        match first {
            JsonRpcMessage::Request(req) => assert_eq!(req.method, "ping"),
            other => panic!("expected request, got {other:?}"),
        }
        let second = h
            .messages
            .recv_timeout(Duration::from_secs(5))
            .expect("second frame");
        assert!(matches!(second, JsonRpcMessage::Notification(_)));

        h.transport.shutdown();
        h.handle.join().expect("join");
        sys::close(h.inbound_w);
        sys::close(h.outbound_r);
    }

    #[test]
    fn callback_reply_goes_out_on_the_write_fd() {
        let reply = JsonRpcResponse::success(RequestId::Number(1), serde_json::json!({}));
        let h = spawn_harness(Some(reply));
        sys::write_all(h.inbound_w, b"{\"jsonrpc\":\"2.0\",\"id\":1,\"method\":\"ping\"}\n")
            .expect("write");

        let line = read_line(h.outbound_r);
        assert!(line.contains("\"id\":1"));
        assert!(line.contains("\"result\":{}"));

        h.transport.shutdown();
        h.handle.join().expect("join");
        sys::close(h.inbound_w);
        sys::close(h.outbound_r);
    }

    #[test]
    fn parse_errors_are_reported_but_do_not_stop_the_loop() {
        let h = spawn_harness(None);
        sys::write_all(h.inbound_w, b"{not json\n").expect("write");
        let err = h
            .errors
            .recv_timeout(Duration::from_secs(5))
            .expect("parse error");
        assert!(matches!(err, McpError::Parse(_)));

        // A valid frame after the bad one is still delivered.
        sys::write_all(h.inbound_w, b"{\"jsonrpc\":\"2.0\",\"id\":2,\"method\":\"ping\"}\n")
            .expect("write");
        let msg = h
            .messages
            .recv_timeout(Duration::from_secs(5))
            .expect("frame after error");
        assert!(matches!(msg, JsonRpcMessage::Request(_)));

        h.transport.shutdown();
        h.handle.join().expect("join");
        sys::close(h.inbound_w);
        sys::close(h.outbound_r);
    }

    #[test]
    fn eof_terminates_start_cleanly() {
        let h = spawn_harness(None);
        sys::close(h.inbound_w);
        h.handle.join().expect("start returns on EOF");
        assert!(!h.transport.is_connected());
        sys::close(h.outbound_r);
    }

    #[test]
    fn sends_queued_before_start_are_drained() {
        let (in_r, in_w) = sys::pipe().expect("pipe");
        let (out_r, out_w) = sys::pipe().expect("pipe");
        let transport = Arc::new(StdioTransport::from_fds(in_r, out_w).expect("transport"));

        let notif = JsonRpcMessage::Notification(JsonRpcNotification::new(
            "notifications/tools/list_changed",
            None,
        ));
        transport.send(&notif).expect("queued send");

        let t = Arc::clone(&transport);
        let handle = std::thread::spawn(move || {
            let on_message: MessageCallback = Arc::new(|_| None);
            t.start(on_message, None).expect("start");
        });

        let line = read_line(out_r);
        assert!(line.contains("notifications/tools/list_changed"));

        transport.shutdown();
        handle.join().expect("join");
        sys::close(in_w);
        sys::close(out_r);
    }

    #[test]
    fn send_after_shutdown_fails() {
        let h = spawn_harness(None);
        h.transport.shutdown();
        h.handle.join().expect("join");

        let req = JsonRpcMessage::Request(JsonRpcRequest::new(1i64, "ping", None));
        let err = h.transport.send(&req).unwrap_err();
        assert!(err.is_transport());

        sys::close(h.inbound_w);
        sys::close(h.outbound_r);
    }

    #[test]
    fn shutdown_is_idempotent_and_safe_before_start() {
        let (in_r, _in_w) = sys::pipe().expect("pipe");
        let (_out_r, out_w) = sys::pipe().expect("pipe");
        let transport = StdioTransport::from_fds(in_r, out_w).expect("transport");
        transport.shutdown();
        transport.shutdown();

        // start() after shutdown returns immediately instead of blocking.
        let on_message: MessageCallback = Arc::new(|_| None);
        transport.start(on_message, None).expect("start");
    }

    #[test]
    fn split_frame_across_chunks() {
        let h = spawn_harness(None);
        sys::write_all(h.inbound_w, b"{\"jsonrpc\":\"2.0\",\"id\":9,").expect("write");
        std::thread::sleep(Duration::from_millis(50));
        sys::write_all(h.inbound_w, b"\"method\":\"ping\"}\n").expect("write");

        let msg = h
            .messages
            .recv_timeout(Duration::from_secs(5))
            .expect("reassembled frame");
        match msg {
            JsonRpcMessage::Request(req) => assert_eq!(req.id, RequestId::Number(9)),
            other => panic!("expected request, got {other:?}"),
        }

        h.transport.shutdown();
        h.handle.join().expect("join");
        sys::close(h.inbound_w);
        sys::close(h.outbound_r);
    }
}
