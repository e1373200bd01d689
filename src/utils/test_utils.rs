//! Test fixtures: raw HTTP servers and a scripted completion provider.

use std::sync::Arc;

use futures_util::StreamExt;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

use crate::core::provider::{
    CompletionProvider, ProviderError, ProviderEvent, ProviderRequest, ProviderStream,
};

#[derive(Debug, Clone)]
pub struct CapturedRequest {
    pub request_line: String,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

impl CapturedRequest {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }

    pub fn json(&self) -> serde_json::Value {
        serde_json::from_slice(&self.body).unwrap_or(serde_json::Value::Null)
    }
}

pub type CapturedRequests = Arc<Mutex<Vec<CapturedRequest>>>;

pub async fn read_http_request(stream: &mut TcpStream) -> Result<CapturedRequest, String> {
    let mut buffer = Vec::new();
    let mut header_end = None;
    while header_end.is_none() {
        let mut chunk = [0_u8; 1024];
        let read = stream
            .read(&mut chunk)
            .await
            .map_err(|err| err.to_string())?;
        if read == 0 {
            return Err("Unexpected EOF while reading HTTP headers".to_string());
        }
        buffer.extend_from_slice(&chunk[..read]);
        header_end = buffer
            .windows(4)
            .position(|window| window == b"\r\n\r\n")
            .map(|index| index + 4);
    }

    let header_end = header_end.expect("header end should exist");
    let header_text =
        std::str::from_utf8(&buffer[..header_end]).map_err(|err| err.to_string())?;
    let mut lines = header_text.split("\r\n").filter(|line| !line.is_empty());
    let request_line = lines
        .next()
        .ok_or_else(|| "Missing HTTP request line".to_string())?
        .to_string();

    let mut headers = Vec::new();
    let mut content_length = 0_usize;
    for line in lines {
        let Some((name, value)) = line.split_once(':') else {
            continue;
        };
        let value = value.trim().to_string();
        if name.eq_ignore_ascii_case("content-length") {
            content_length = value.parse::<usize>().map_err(|err| err.to_string())?;
        }
        headers.push((name.to_string(), value));
    }

    let mut body = buffer[header_end..].to_vec();
    while body.len() < content_length {
        let mut chunk = vec![0_u8; content_length - body.len()];
        let read = stream
            .read(&mut chunk)
            .await
            .map_err(|err| err.to_string())?;
        if read == 0 {
            return Err("Unexpected EOF while reading HTTP body".to_string());
        }
        body.extend_from_slice(&chunk[..read]);
    }
    body.truncate(content_length);

    Ok(CapturedRequest {
        request_line,
        headers,
        body,
    })
}

/// Formats a complete HTTP/1.1 response with an explicit content length.
pub fn http_response(status: &str, content_type: &str, extra_headers: &[(&str, &str)], body: &str) -> String {
    let mut head = format!(
        "HTTP/1.1 {status}\r\ncontent-type: {content_type}\r\ncontent-length: {}\r\nconnection: close\r\n",
        body.len()
    );
    for (name, value) in extra_headers {
        head.push_str(&format!("{name}: {value}\r\n"));
    }
    format!("{head}\r\n{body}")
}

/// Serves one canned response per accepted connection, in order.
///
/// `respond` sees each captured request and returns the raw response text.
pub async fn serve_sequence<F>(
    responses: usize,
    mut respond: F,
) -> (String, CapturedRequests, JoinHandle<Result<(), String>>)
where
    F: FnMut(&CapturedRequest) -> String + Send + 'static,
{
    let listener = TcpListener::bind("127.0.0.1:0")
        .await
        .expect("listener should bind");
    let addr = listener.local_addr().expect("local addr should resolve");
    let captured: CapturedRequests = Arc::new(Mutex::new(Vec::new()));
    let captured_for_server = Arc::clone(&captured);

    let handle = tokio::spawn(async move {
        for _ in 0..responses {
            let (mut stream, _) = listener.accept().await.map_err(|err| err.to_string())?;
            let request = read_http_request(&mut stream).await?;
            let response = respond(&request);
            captured_for_server.lock().await.push(request);
            stream
                .write_all(response.as_bytes())
                .await
                .map_err(|err| err.to_string())?;
            stream.shutdown().await.map_err(|err| err.to_string())?;
        }
        Ok(())
    });

    (format!("http://{addr}"), captured, handle)
}

pub fn test_http_client() -> reqwest::Client {
    reqwest::Client::builder()
        .no_proxy()
        .build()
        .expect("client should build")
}

/// Canned provider behaviour for one `open_stream` call.
pub enum ScriptedReply {
    Events(Vec<Result<ProviderEvent, ProviderError>>),
    /// Yields the events, then never finishes.
    EventsThenHang(Vec<Result<ProviderEvent, ProviderError>>),
    Reject(ProviderError),
}

impl ScriptedReply {
    /// Content chunks followed by `Done`.
    pub fn text(chunks: &[&str]) -> Self {
        let mut events: Vec<_> = chunks
            .iter()
            .map(|chunk| Ok(ProviderEvent::Content((*chunk).to_string())))
            .collect();
        events.push(Ok(ProviderEvent::Done));
        ScriptedReply::Events(events)
    }
}

/// Provider that replays scripted replies in order and records each request.
#[derive(Default)]
pub struct ScriptedProvider {
    replies: std::sync::Mutex<std::collections::VecDeque<ScriptedReply>>,
    pub requests: std::sync::Mutex<Vec<ProviderRequest>>,
}

impl ScriptedProvider {
    pub fn new(replies: Vec<ScriptedReply>) -> Self {
        Self {
            replies: std::sync::Mutex::new(replies.into()),
            requests: std::sync::Mutex::new(Vec::new()),
        }
    }

    pub fn request_count(&self) -> usize {
        self.requests.lock().expect("requests lock").len()
    }
}

#[async_trait::async_trait]
impl CompletionProvider for ScriptedProvider {
    async fn open_stream(&self, request: ProviderRequest) -> Result<ProviderStream, ProviderError> {
        self.requests.lock().expect("requests lock").push(request);
        let reply = self
            .replies
            .lock()
            .expect("replies lock")
            .pop_front()
            .unwrap_or_else(|| ScriptedReply::text(&[]));
        match reply {
            ScriptedReply::Events(events) => Ok(futures_util::stream::iter(events).boxed()),
            ScriptedReply::EventsThenHang(events) => Ok(futures_util::stream::iter(events)
                .chain(futures_util::stream::pending())
                .boxed()),
            ScriptedReply::Reject(err) => Err(err),
        }
    }
}

/// In-memory MCP service with canned tool listings and call results.
#[derive(Default)]
pub struct FakeMcpService {
    pub servers: Vec<crate::core::config::McpServerConfig>,
    pub tools: Vec<crate::mcp::McpToolInfo>,
    pub outputs: std::collections::HashMap<
        String,
        Result<crate::mcp::McpToolOutput, crate::mcp::McpError>,
    >,
    pub calls: std::sync::Mutex<Vec<(String, String, serde_json::Map<String, serde_json::Value>)>>,
}

impl FakeMcpService {
    pub fn with_server(mut self, id: &str) -> Self {
        self.servers.push(crate::core::config::McpServerConfig {
            id: id.to_string(),
            name: id.to_string(),
            activate: Some(true),
            ..Default::default()
        });
        self
    }

    pub fn with_tool(
        mut self,
        server_id: &str,
        name: &str,
        output: Result<crate::mcp::McpToolOutput, crate::mcp::McpError>,
    ) -> Self {
        self.tools.push(crate::mcp::McpToolInfo {
            server_id: server_id.to_string(),
            name: name.to_string(),
            description: Some(format!("{name} on {server_id}")),
            input_schema: serde_json::json!({"type": "object", "properties": {}}),
        });
        self.outputs
            .insert(format!("{server_id}{}{name}", crate::mcp::MCP_TOOL_SEPARATOR), output);
        self
    }
}

#[async_trait::async_trait]
impl crate::mcp::McpService for FakeMcpService {
    fn list_servers(&self, server_ids: Option<&[String]>) -> Vec<crate::core::config::McpServerConfig> {
        self.servers
            .iter()
            .filter(|server| match server_ids {
                Some(ids) => ids.iter().any(|id| id.eq_ignore_ascii_case(&server.id)),
                None => true,
            })
            .cloned()
            .collect()
    }

    async fn check_connectivity(&self, server: &crate::core::config::McpServerConfig) -> bool {
        self.servers.iter().any(|known| known.id == server.id)
    }

    async fn list_tools(&self, server_id: &str) -> Result<Vec<crate::mcp::McpToolInfo>, crate::mcp::McpError> {
        if !self.servers.iter().any(|server| server.id == server_id) {
            return Err(crate::mcp::McpError::ServerNotFound(server_id.to_string()));
        }
        Ok(self
            .tools
            .iter()
            .filter(|tool| tool.server_id == server_id)
            .cloned()
            .collect())
    }

    async fn call_tool(
        &self,
        server_id: &str,
        tool: &str,
        arguments: serde_json::Map<String, serde_json::Value>,
    ) -> Result<crate::mcp::McpToolOutput, crate::mcp::McpError> {
        self.calls
            .lock()
            .expect("calls lock")
            .push((server_id.to_string(), tool.to_string(), arguments));
        if !self.servers.iter().any(|server| server.id == server_id) {
            return Err(crate::mcp::McpError::ServerNotFound(server_id.to_string()));
        }
        self.outputs
            .get(&format!("{server_id}{}{tool}", crate::mcp::MCP_TOOL_SEPARATOR))
            .cloned()
            .unwrap_or_else(|| {
                Err(crate::mcp::McpError::ToolNotFound {
                    server_id: server_id.to_string(),
                    tool: tool.to_string(),
                })
            })
    }
}
