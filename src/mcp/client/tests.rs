use super::*;
use crate::utils::test_utils::{http_response, serve_sequence, test_http_client, CapturedRequest};
use rust_mcp_schema::LATEST_PROTOCOL_VERSION;
use serde_json::json;

fn http_server(id: &str, base_url: &str) -> McpServerConfig {
    McpServerConfig {
        id: id.to_string(),
        name: "Search".to_string(),
        transport: Some("streamable-http".to_string()),
        base_url: Some(base_url.to_string()),
        activate: Some(true),
        ..Default::default()
    }
}

fn stdio_server(id: &str, script: &str) -> McpServerConfig {
    McpServerConfig {
        id: id.to_string(),
        transport: Some("stdio".to_string()),
        command: Some("sh".to_string()),
        args: Some(vec!["-c".to_string(), script.to_string()]),
        activate: Some(true),
        ..Default::default()
    }
}

fn client_for(servers: Vec<McpServerConfig>) -> McpClient {
    McpClient::new(McpRegistry::new(servers), test_http_client())
}

fn method_of(request: &CapturedRequest) -> String {
    request
        .json()
        .get("method")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string()
}

/// Answers initialize, initialized, tools/list (as SSE) and tools/call.
fn scripted_http_reply(request: &CapturedRequest) -> String {
    let body = request.json();
    let id = body.get("id").cloned().unwrap_or(Value::Null);
    match method_of(request).as_str() {
        "initialize" => http_response(
            "200 OK",
            "application/json",
            &[("mcp-session-id", "session-1")],
            &json!({
                "jsonrpc": "2.0",
                "id": id,
                "result": {
                    "protocolVersion": "2025-06-18",
                    "capabilities": {"tools": {}},
                    "serverInfo": {"name": "mock", "version": "0.1.0"}
                }
            })
            .to_string(),
        ),
        "notifications/initialized" => http_response("202 Accepted", "application/json", &[], ""),
        "tools/list" => {
            let payload = json!({
                "jsonrpc": "2.0",
                "id": id,
                "result": {"tools": [
                    {"name": "run", "description": "Run a search", "inputSchema": {"type": "object"}},
                    {"name": "hidden", "inputSchema": {"type": "object"}}
                ]}
            });
            http_response(
                "200 OK",
                "Text/Event-Stream; Charset=UTF-8",
                &[],
                &format!("event: message\ndata: {payload}\n\n"),
            )
        }
        _ => http_response(
            "200 OK",
            "application/json",
            &[],
            &json!({
                "jsonrpc": "2.0",
                "id": id,
                "result": {
                    "content": [{"type": "text", "text": "{\"a\":1}"}],
                    "structuredContent": {"a": 1}
                }
            })
            .to_string(),
        ),
    }
}

#[tokio::test]
async fn streamable_http_session_lists_and_calls_tools() {
    let (base_url, captured, server) = serve_sequence(4, scripted_http_reply).await;
    let mut config = http_server("search", &base_url);
    config.allowed_tools = Some(vec!["run".to_string()]);
    let client = client_for(vec![config]);

    let mut arguments = Map::new();
    arguments.insert("q".to_string(), json!("rust"));
    let output = client
        .call_tool("search", "run", arguments)
        .await
        .expect("tool call should succeed");
    assert_eq!(output.content.to_text(), r#"{"a":1}"#);
    assert!(!output.is_error);

    let tools = client.list_tools("SEARCH").await.expect("cached tools");
    assert_eq!(tools.len(), 1);
    assert_eq!(tools[0].qualified_name(), "search__run");
    assert_eq!(tools[0].description.as_deref(), Some("Run a search"));

    server.await.expect("join").expect("server");
    let requests = captured.lock().await;
    let methods: Vec<String> = requests.iter().map(method_of).collect();
    assert_eq!(
        methods,
        vec!["initialize", "notifications/initialized", "tools/list", "tools/call"]
    );
    assert_eq!(
        requests[0].header("mcp-protocol-version"),
        Some(LATEST_PROTOCOL_VERSION)
    );
    assert_eq!(requests[0].header("mcp-session-id"), None);
    for request in &requests[1..] {
        assert_eq!(request.header("mcp-protocol-version"), Some("2025-06-18"));
        assert_eq!(request.header("mcp-session-id"), Some("session-1"));
        assert_eq!(
            request.header("accept"),
            Some("application/json, text/event-stream")
        );
    }
    let call = requests[3].json();
    assert_eq!(call["params"]["name"], "run");
    assert_eq!(call["params"]["arguments"], json!({"q": "rust"}));
}

#[tokio::test]
async fn unlisted_tool_is_not_found() {
    let (base_url, _captured, server) = serve_sequence(3, scripted_http_reply).await;
    let client = client_for(vec![http_server("search", &base_url)]);

    let err = client
        .call_tool("search", "missing", Map::new())
        .await
        .unwrap_err();
    assert_eq!(
        err,
        McpError::ToolNotFound {
            server_id: "search".to_string(),
            tool: "missing".to_string()
        }
    );
    assert!(!err.is_retryable());
    server.await.expect("join").expect("server");
}

#[tokio::test]
async fn allow_list_and_unknown_servers_fail_without_connecting() {
    let mut config = http_server("search", "http://127.0.0.1:9/mcp");
    config.allowed_tools = Some(vec!["run".to_string()]);
    let client = client_for(vec![config]);

    let err = client.call_tool("search", "delete", Map::new()).await.unwrap_err();
    assert!(matches!(err, McpError::ToolNotFound { .. }));

    let err = client.call_tool("nowhere", "run", Map::new()).await.unwrap_err();
    assert_eq!(err, McpError::ServerNotFound("nowhere".to_string()));
}

#[tokio::test]
async fn unreachable_server_is_a_retryable_connectivity_error() {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("listener should bind");
    let addr = listener.local_addr().expect("local addr");
    drop(listener);

    let config = http_server("search", &format!("http://{addr}/mcp"));
    let client = client_for(vec![config.clone()]);

    let err = client.call_tool("search", "run", Map::new()).await.unwrap_err();
    assert!(matches!(err, McpError::Connectivity { ref server_id, .. } if server_id == "search"));
    assert!(err.is_retryable());
    assert!(!client.check_connectivity(&config).await);
}

const FAKE_STDIO_SERVER: &str = r#"
read -r line
printf '%s\n' '{"jsonrpc":"2.0","id":0,"result":{"protocolVersion":"2025-11-25","capabilities":{"tools":{}},"serverInfo":{"name":"fake","version":"1.0.0"}}}'
read -r line
read -r line
printf '%s\n' '{"jsonrpc":"2.0","id":1,"result":{"tools":[{"name":"echo","inputSchema":{"type":"object"}}]}}'
read -r line
printf '%s\n' '{"jsonrpc":"2.0","id":2,"result":{"content":[{"type":"text","text":"pong"}]}}'
read -r line
"#;

#[tokio::test]
async fn stdio_server_round_trip() {
    let client = client_for(vec![stdio_server("local", FAKE_STDIO_SERVER)]);

    let tools = client.list_tools("local").await.expect("tools");
    assert_eq!(tools.len(), 1);
    assert_eq!(tools[0].name, "echo");

    let output = client
        .call_tool("local", "echo", Map::new())
        .await
        .expect("call");
    assert_eq!(output.content.to_text(), "pong");
}

#[tokio::test]
async fn connectivity_check_reports_handshake_outcome() {
    let client = client_for(Vec::new());
    assert!(
        client
            .check_connectivity(&stdio_server("local", FAKE_STDIO_SERVER))
            .await
    );

    let missing = McpServerConfig {
        command: Some("/definitely-missing-command".to_string()),
        ..stdio_server("broken", "")
    };
    assert!(!client.check_connectivity(&missing).await);
}

#[test]
fn list_servers_honours_explicit_ids() {
    let client = client_for(vec![
        http_server("a", "http://a/mcp"),
        McpServerConfig {
            activate: Some(false),
            ..http_server("b", "http://b/mcp")
        },
        http_server("c", "http://c/mcp"),
    ]);
    let all: Vec<String> = client.list_servers(None).into_iter().map(|s| s.id).collect();
    assert_eq!(all, vec!["a", "c"]);

    let picked = client.list_servers(Some(&["c".to_string(), "b".to_string()]));
    assert_eq!(picked.len(), 1);
    assert_eq!(picked[0].id, "c");
}
