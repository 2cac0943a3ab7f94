//! End-to-end tests: a real server and a real client wired over OS pipes
//! (and, at the bottom, over Streamable HTTP on an ephemeral port).

use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use crossbeam_channel::{Receiver, unbounded};
use mcpeer_core::{McpError, codes};
use mcpeer_protocol::{
    CallToolResult, ClientCapabilities, CompletionRef, CompletionResult, Content, GetPromptResult,
    LogLevel, PROTOCOL_VERSION, PromptArgument, PromptDefinition, PromptMessage, ResourceContent,
    ResourceDefinition, ResourceTemplate, Root, SamplingResult, ToolDefinition,
};
use mcpeer_transport::{
    HttpClientTransport, HttpServerOptions, HttpServerTransport, StdioTransport, stdio,
};
use serde_json::json;

use crate::session::SessionState;
use crate::{ClientOptions, McpClient, McpServer, ServerOptions};

const WAIT: Duration = Duration::from_secs(5);

/// Wires a client to a server over two pipes and starts serving on a
/// background thread. The caller still runs `initialize`.
fn connect_over_pipes(
    server: &Arc<McpServer>,
    client_opts: ClientOptions,
) -> (McpClient, JoinHandle<()>) {
    let (c2s_read, c2s_write) = stdio::pipe().expect("pipe");
    let (s2c_read, s2c_write) = stdio::pipe().expect("pipe");
    let server_transport =
        Arc::new(StdioTransport::from_fds(c2s_read, s2c_write).expect("server transport"));
    let client_transport =
        Arc::new(StdioTransport::from_fds(s2c_read, c2s_write).expect("client transport"));

    let serving = Arc::clone(server);
    let handle = std::thread::spawn(move || {
        let _ = serving.serve(server_transport);
    });

    let client = McpClient::new(client_opts);
    client.connect(client_transport).expect("connect");
    (client, handle)
}

fn teardown(server: &McpServer, client: McpClient, handle: JoinHandle<()>) {
    client.disconnect();
    server.shutdown();
    handle.join().expect("server thread");
}

fn echo_server() -> Arc<McpServer> {
    let server = Arc::new(McpServer::new(ServerOptions::new("echo-server", "0.1.0")));
    server.add_tool(
        ToolDefinition::new("echo", json!({"type": "object"})).with_description("Echoes text back"),
        |args| {
            let text = args
                .get("text")
                .and_then(|t| t.as_str())
                .ok_or_else(|| McpError::invalid_params("missing required argument: text"))?;
            Ok(CallToolResult::text(text))
        },
    );
    server
}

fn text_of(content: &Content) -> &str {
    match content {
        Content::Text { text, .. } => text,
        other => panic!("expected text content, got {other:?}"),
    }
}

#[test]
fn ping_round_trip_after_handshake() {
    let server = echo_server();
    let (client, handle) = connect_over_pipes(&server, ClientOptions::new("test-client", "0.1.0"));

    let result = client.initialize().expect("initialize");
    assert_eq!(result.protocol_version, PROTOCOL_VERSION);
    assert_eq!(result.server_info.name, "echo-server");
    assert_eq!(client.protocol_version(), PROTOCOL_VERSION);

    client.ping().expect("ping");
    assert_eq!(server.session().state(), SessionState::Ready);

    teardown(&server, client, handle);
}

#[test]
fn tool_registration_then_list() {
    let server = echo_server();
    let (client, handle) = connect_over_pipes(&server, ClientOptions::new("test-client", "0.1.0"));

    let init = client.initialize().expect("initialize");
    assert!(init.capabilities.tools.is_some());
    assert!(init.capabilities.logging.is_some());
    assert!(init.capabilities.resources.is_none());

    let listing = client.list_tools(None).expect("tools/list");
    assert_eq!(listing.tools.len(), 1);
    assert_eq!(listing.tools[0].name, "echo");
    assert!(listing.next_cursor.is_none());

    teardown(&server, client, handle);
}

#[test]
fn failing_tool_surfaces_is_error_not_wire_error() {
    let server = echo_server();
    let (client, handle) = connect_over_pipes(&server, ClientOptions::new("test-client", "0.1.0"));
    client.initialize().expect("initialize");

    // Missing "text" makes the handler fail; the call itself succeeds.
    let result = client.call_tool("echo", json!({})).expect("tools/call");
    assert!(result.is_error);
    assert!(text_of(&result.content[0]).contains("text"));

    let result = client
        .call_tool("echo", json!({"text": "hello"}))
        .expect("tools/call");
    assert!(!result.is_error);
    assert_eq!(text_of(&result.content[0]), "hello");

    teardown(&server, client, handle);
}

#[test]
fn panicking_tool_surfaces_is_error() {
    let server = Arc::new(McpServer::new(ServerOptions::new("panicky", "0.1.0")));
    server.add_tool(
        ToolDefinition::new("crash", json!({"type": "object"})),
        |_| panic!("tool blew up"),
    );
    let (client, handle) = connect_over_pipes(&server, ClientOptions::new("test-client", "0.1.0"));
    client.initialize().expect("initialize");

    let result = client.call_tool("crash", json!({})).expect("tools/call");
    assert!(result.is_error);
    assert!(text_of(&result.content[0]).contains("tool blew up"));

    // The connection survives.
    client.ping().expect("ping after panic");

    teardown(&server, client, handle);
}

#[test]
fn unknown_tool_is_invalid_params() {
    let server = echo_server();
    let (client, handle) = connect_over_pipes(&server, ClientOptions::new("test-client", "0.1.0"));
    client.initialize().expect("initialize");

    let err = client.call_tool("nope", json!({})).unwrap_err();
    match err {
        McpError::Protocol { code, .. } => assert_eq!(code, codes::INVALID_PARAMS),
        other => panic!("expected protocol error, got {other:?}"),
    }

    teardown(&server, client, handle);
}

#[test]
fn capability_gating_rejects_unadvertised_methods() {
    // No tools registered, so "tools" is absent from the advertised
    // capabilities and the gate rejects tools/* with invalid-request.
    let server = Arc::new(McpServer::new(ServerOptions::new("bare", "0.1.0")));
    let (client, handle) = connect_over_pipes(&server, ClientOptions::new("test-client", "0.1.0"));
    let init = client.initialize().expect("initialize");
    assert!(init.capabilities.tools.is_none());

    let err = client.call_tool("echo", json!({})).unwrap_err();
    match err {
        McpError::Protocol { code, .. } => assert_eq!(code, codes::INVALID_REQUEST),
        other => panic!("expected protocol error, got {other:?}"),
    }

    // Ping is never gated.
    client.ping().expect("ping");

    teardown(&server, client, handle);
}

#[test]
fn completion_without_handler_is_method_not_found() {
    let server = echo_server();
    let (client, handle) = connect_over_pipes(&server, ClientOptions::new("test-client", "0.1.0"));
    client.initialize().expect("initialize");

    let reference = CompletionRef {
        ref_type: "ref/prompt".to_owned(),
        name: "greet".to_owned(),
    };
    let err = client.complete(reference, "language", "f").unwrap_err();
    match err {
        McpError::Protocol { code, .. } => assert_eq!(code, codes::METHOD_NOT_FOUND),
        other => panic!("expected protocol error, got {other:?}"),
    }

    teardown(&server, client, handle);
}

#[test]
fn resource_read_exact_template_and_unknown() {
    let server = Arc::new(McpServer::new(ServerOptions::new("files", "0.1.0")));
    server.add_resource(
        ResourceDefinition::new("file:///a", "a"),
        |uri| Ok(vec![ResourceContent::text(uri, "contents of a")]),
    );
    server.add_resource_template(
        ResourceTemplate::new("file:///logs/{name}", "logs"),
        |uri| Ok(vec![ResourceContent::text(uri, "log body")]),
    );

    let (client, handle) = connect_over_pipes(&server, ClientOptions::new("test-client", "0.1.0"));
    let init = client.initialize().expect("initialize");
    assert!(init.capabilities.resources.is_some());

    let contents = client.read_resource("file:///a").expect("exact read");
    assert_eq!(contents[0].text.as_deref(), Some("contents of a"));

    // Template handlers match on the prefix up to the first '{'.
    let contents = client
        .read_resource("file:///logs/app.log")
        .expect("template read");
    assert_eq!(contents[0].uri, "file:///logs/app.log");
    assert_eq!(contents[0].text.as_deref(), Some("log body"));

    let err = client.read_resource("file:///missing").unwrap_err();
    match err {
        McpError::Protocol { code, .. } => assert_eq!(code, codes::RESOURCE_NOT_FOUND),
        other => panic!("expected protocol error, got {other:?}"),
    }

    let templates = client
        .list_resource_templates(None)
        .expect("templates/list");
    assert_eq!(templates.resource_templates.len(), 1);
    assert_eq!(
        templates.resource_templates[0].uri_template,
        "file:///logs/{name}"
    );

    teardown(&server, client, handle);
}

#[test]
fn subscription_filters_resource_updated_notifications() {
    let server = Arc::new(McpServer::new(ServerOptions::new("files", "0.1.0")));
    server.add_resource(
        ResourceDefinition::new("file:///a", "a"),
        |uri| Ok(vec![ResourceContent::text(uri, "a")]),
    );
    server.add_resource(
        ResourceDefinition::new("file:///b", "b"),
        |uri| Ok(vec![ResourceContent::text(uri, "b")]),
    );

    let (client, handle) = connect_over_pipes(&server, ClientOptions::new("test-client", "0.1.0"));
    let (updated_tx, updated_rx) = unbounded::<String>();
    client.on_resource_updated(move |uri| {
        updated_tx.send(uri.to_owned()).ok();
    });
    client.initialize().expect("initialize");

    client.subscribe_resource("file:///a").expect("subscribe");
    server.notify_resource_updated("file:///a");
    server.notify_resource_updated("file:///b");

    let uri = updated_rx.recv_timeout(WAIT).expect("one update");
    assert_eq!(uri, "file:///a");
    // The unsubscribed uri produced nothing.
    assert!(updated_rx.recv_timeout(Duration::from_millis(200)).is_err());

    client.unsubscribe_resource("file:///a").expect("unsubscribe");
    server.notify_resource_updated("file:///a");
    assert!(updated_rx.recv_timeout(Duration::from_millis(200)).is_err());

    teardown(&server, client, handle);
}

#[test]
fn request_timeout_fires_and_late_response_is_dropped() {
    let server = Arc::new(McpServer::new(ServerOptions::new("slow", "0.1.0")));
    server.add_tool(
        ToolDefinition::new("sleepy", json!({"type": "object"})),
        |_| {
            std::thread::sleep(Duration::from_millis(400));
            Ok(CallToolResult::text("finally"))
        },
    );

    let opts = ClientOptions::new("test-client", "0.1.0")
        .with_request_timeout(Duration::from_millis(150));
    let (client, handle) = connect_over_pipes(&server, opts);
    client.initialize().expect("initialize");

    let err = client.call_tool("sleepy", json!({})).unwrap_err();
    assert!(err.is_timeout(), "expected timeout, got {err:?}");

    // Let the late response arrive; the correlation table must drop it
    // without waking anything, and the connection stays usable.
    std::thread::sleep(Duration::from_millis(500));
    client.ping().expect("ping after dropped late response");

    teardown(&server, client, handle);
}

#[test]
fn list_methods_paginate_with_offset_cursors() {
    let opts = ServerOptions::new("paged", "0.1.0").with_page_size(3);
    let server = Arc::new(McpServer::new(opts));
    for i in 0..7 {
        server.add_tool(
            ToolDefinition::new(format!("tool-{i}"), json!({"type": "object"})),
            |_| Ok(CallToolResult::text("ok")),
        );
    }

    let (client, handle) = connect_over_pipes(&server, ClientOptions::new("test-client", "0.1.0"));
    client.initialize().expect("initialize");

    let page1 = client.list_tools(None).expect("page 1");
    assert_eq!(page1.tools.len(), 3);
    assert_eq!(page1.tools[0].name, "tool-0");
    assert_eq!(page1.next_cursor.as_deref(), Some("3"));

    let page2 = client.list_tools(page1.next_cursor).expect("page 2");
    assert_eq!(page2.tools.len(), 3);
    assert_eq!(page2.next_cursor.as_deref(), Some("6"));

    let page3 = client.list_tools(page2.next_cursor).expect("page 3");
    assert_eq!(page3.tools.len(), 1);
    assert_eq!(page3.tools[0].name, "tool-6");
    assert!(page3.next_cursor.is_none());

    // An out-of-range cursor yields an empty page and no continuation.
    let empty = client.list_tools(Some("100".to_owned())).expect("empty");
    assert!(empty.tools.is_empty());
    assert!(empty.next_cursor.is_none());

    teardown(&server, client, handle);
}

#[test]
fn registry_mutations_emit_list_changed_while_running() {
    let server = echo_server();
    let (client, handle) = connect_over_pipes(&server, ClientOptions::new("test-client", "0.1.0"));

    let (tools_tx, tools_rx) = unbounded::<()>();
    client.on_tools_changed(move || {
        tools_tx.send(()).ok();
    });
    let (prompts_tx, prompts_rx) = unbounded::<()>();
    client.on_prompts_changed(move || {
        prompts_tx.send(()).ok();
    });

    client.initialize().expect("initialize");

    server.add_tool(
        ToolDefinition::new("second", json!({"type": "object"})),
        |_| Ok(CallToolResult::text("ok")),
    );
    tools_rx.recv_timeout(WAIT).expect("add_tool change");
    server.remove_tool("second");
    tools_rx.recv_timeout(WAIT).expect("remove_tool change");
    assert!(tools_rx.recv_timeout(Duration::from_millis(200)).is_err());

    server.add_prompt(PromptDefinition::new("greet"), |_, _| {
        Ok(GetPromptResult {
            description: None,
            messages: vec![PromptMessage::user("hi")],
        })
    });
    prompts_rx.recv_timeout(WAIT).expect("add_prompt change");

    teardown(&server, client, handle);
}

#[test]
fn prompts_and_completions_round_trip() {
    let server = Arc::new(McpServer::new(ServerOptions::new("prompty", "0.1.0")));
    server.add_prompt(
        PromptDefinition {
            name: "greet".to_owned(),
            title: None,
            description: Some("Greets someone".to_owned()),
            arguments: vec![PromptArgument {
                name: "who".to_owned(),
                description: None,
                required: true,
            }],
        },
        |_, args| {
            let who = args.get("who").cloned().unwrap_or_default();
            Ok(GetPromptResult {
                description: Some("Greets someone".to_owned()),
                messages: vec![PromptMessage::user(format!("Say hello to {who}"))],
            })
        },
    );
    server.set_completion_handler(|reference, _name, value| {
        assert_eq!(reference.ref_type, "ref/prompt");
        let candidates = ["alice", "bob"];
        Ok(CompletionResult {
            values: candidates
                .iter()
                .filter(|c| c.starts_with(value))
                .map(|c| (*c).to_owned())
                .collect(),
            total: None,
            has_more: false,
        })
    });

    let (client, handle) = connect_over_pipes(&server, ClientOptions::new("test-client", "0.1.0"));
    let init = client.initialize().expect("initialize");
    assert!(init.capabilities.prompts.is_some());
    assert!(init.capabilities.completions.is_some());

    let prompts = client.list_prompts(None).expect("prompts/list");
    assert_eq!(prompts.prompts.len(), 1);
    assert!(prompts.prompts[0].arguments[0].required);

    let mut args = std::collections::HashMap::new();
    args.insert("who".to_owned(), "alice".to_owned());
    let prompt = client.get_prompt("greet", Some(args)).expect("prompts/get");
    assert_eq!(text_of(&prompt.messages[0].content), "Say hello to alice");

    let reference = CompletionRef {
        ref_type: "ref/prompt".to_owned(),
        name: "greet".to_owned(),
    };
    let completion = client.complete(reference, "who", "a").expect("complete");
    assert_eq!(completion.values, vec!["alice".to_owned()]);

    teardown(&server, client, handle);
}

#[test]
fn reverse_calls_share_the_outbound_machinery() {
    let server = echo_server();
    let opts = ClientOptions::new("test-client", "0.1.0").with_capabilities(ClientCapabilities {
        roots: Some(json!({})),
        sampling: Some(json!({})),
        ..Default::default()
    });
    let (client, handle) = connect_over_pipes(&server, opts);

    client.on_roots_request(|| {
        Ok(vec![Root {
            uri: "file:///workspace".to_owned(),
            name: Some("workspace".to_owned()),
        }])
    });
    client.on_sampling_request(|request| {
        assert_eq!(request.messages.len(), 1);
        Ok(SamplingResult {
            role: mcpeer_protocol::Role::Assistant,
            content: Content::text("generated"),
            model: "test-model".to_owned(),
            stop_reason: Some("endTurn".to_owned()),
        })
    });

    client.initialize().expect("initialize");

    let roots = server.request_roots().expect("roots/list");
    assert_eq!(roots.len(), 1);
    assert_eq!(roots[0].uri, "file:///workspace");

    let sampling = server
        .request_sampling(mcpeer_protocol::SamplingRequest::new(vec![
            PromptMessage::user("hello"),
        ]))
        .expect("sampling/createMessage");
    assert_eq!(sampling.model, "test-model");
    assert_eq!(text_of(&sampling.content), "generated");

    // Elicitation was not advertised, so the client-side gate rejects it.
    let err = server
        .request_elicitation(mcpeer_protocol::ElicitationRequest {
            message: "confirm?".to_owned(),
            requested_schema: json!({"type": "object"}),
        })
        .unwrap_err();
    match err {
        McpError::Protocol { code, .. } => assert_eq!(code, codes::INVALID_REQUEST),
        other => panic!("expected protocol error, got {other:?}"),
    }

    teardown(&server, client, handle);
}

#[test]
fn progress_and_filtered_log_notifications() {
    let server = echo_server();
    let (client, handle) = connect_over_pipes(&server, ClientOptions::new("test-client", "0.1.0"));

    let (progress_tx, progress_rx) = unbounded();
    client.on_progress(move |params| {
        progress_tx.send(params).ok();
    });
    let (log_tx, log_rx): (_, Receiver<mcpeer_protocol::LogMessage>) = unbounded();
    client.on_log_message(move |message| {
        log_tx.send(message).ok();
    });

    client.initialize().expect("initialize");

    server.send_progress("op-1", 0.5, Some(1.0), Some("halfway".to_owned()));
    let progress = progress_rx.recv_timeout(WAIT).expect("progress");
    assert_eq!(progress.progress, 0.5);
    assert_eq!(progress.total, Some(1.0));

    // Debug is below the default Info floor and must be suppressed.
    server.log(LogLevel::Debug, "test", json!("hidden"));
    server.log(LogLevel::Warning, "test", json!("visible"));
    let message = log_rx.recv_timeout(WAIT).expect("log message");
    assert_eq!(message.level, LogLevel::Warning);
    assert_eq!(message.data, json!("visible"));

    // Lowering the floor lets debug through.
    client.set_log_level(LogLevel::Debug).expect("setLevel");
    server.log(LogLevel::Debug, "test", json!("now visible"));
    let message = log_rx.recv_timeout(WAIT).expect("debug log message");
    assert_eq!(message.level, LogLevel::Debug);

    teardown(&server, client, handle);
}

#[test]
fn deferred_tools_run_on_the_worker_pool() {
    let server = Arc::new(McpServer::new(ServerOptions::new("deferred", "0.1.0")));
    server.add_tool_deferred(
        ToolDefinition::new("background", json!({"type": "object"})),
        |_| {
            let worker = std::thread::current()
                .name()
                .unwrap_or_default()
                .to_owned();
            Ok(CallToolResult::text(worker))
        },
    );

    let (client, handle) = connect_over_pipes(&server, ClientOptions::new("test-client", "0.1.0"));
    client.initialize().expect("initialize");

    let result = client.call_tool("background", json!({})).expect("call");
    assert!(text_of(&result.content[0]).starts_with("mcpeer-worker-"));

    teardown(&server, client, handle);
}

#[test]
fn cancellation_notification_is_informational() {
    let server = echo_server();
    let (client, handle) = connect_over_pipes(&server, ClientOptions::new("test-client", "0.1.0"));
    client.initialize().expect("initialize");

    client
        .cancel_request(
            mcpeer_protocol::RequestId::Number(999),
            Some("changed my mind".to_owned()),
        )
        .expect("cancelled notification");

    // The notification has no reply and must not disturb the session.
    client.ping().expect("ping after cancel");

    teardown(&server, client, handle);
}

#[test]
fn streamable_http_end_to_end() {
    let server = echo_server();
    let http = Arc::new(HttpServerTransport::new(HttpServerOptions {
        port: 0,
        ..Default::default()
    }));

    let serving = Arc::clone(&server);
    let transport = Arc::clone(&http);
    let handle = std::thread::spawn(move || {
        let _ = serving.serve(transport);
    });
    for _ in 0..100 {
        if http.port() != 0 && server.is_running() {
            break;
        }
        std::thread::sleep(Duration::from_millis(10));
    }

    let url = format!("http://127.0.0.1:{}/mcp", http.port());
    let client_transport = Arc::new(HttpClientTransport::new(url));
    let client = McpClient::new(ClientOptions::new("http-client", "0.1.0"));
    client
        .connect(Arc::clone(&client_transport) as Arc<dyn mcpeer_transport::Transport>)
        .expect("connect");

    let init = client.initialize().expect("initialize over http");
    assert!(init.capabilities.tools.is_some());
    assert!(client_transport.session_id().is_some());

    let listing = client.list_tools(None).expect("tools/list over http");
    assert_eq!(listing.tools[0].name, "echo");

    let result = client
        .call_tool("echo", json!({"text": "over http"}))
        .expect("tools/call over http");
    assert_eq!(text_of(&result.content[0]), "over http");

    client.disconnect();
    server.shutdown();
    handle.join().expect("server thread");
}
