use crate::core::config::McpServerConfig;
use crate::mcp::transport::{connectivity, McpTransport};
use crate::mcp::McpError;
use crate::utils::sse::{is_event_stream_content_type, sse_data_payload, SseLineBuffer};
use async_trait::async_trait;
use futures_util::StreamExt;
use rust_mcp_schema::schema_utils::{
    ClientMessage, FromMessage, MessageFromClient, NotificationFromClient, RequestFromClient,
    ServerMessage,
};
use rust_mcp_schema::RequestId;
use std::sync::atomic::{AtomicI64, Ordering};
use tokio::sync::Mutex;
use tracing::debug;

const MCP_JSON_CONTENT_TYPE: &str = "application/json";
const MCP_JSON_AND_SSE_ACCEPT: &str = "application/json, text/event-stream";
const MCP_PROTOCOL_VERSION_HEADER: &str = "MCP-Protocol-Version";
const MCP_SESSION_HEADER: &str = "mcp-session-id";

#[derive(Default)]
struct SessionState {
    session_id: Option<String>,
    protocol_version: Option<String>,
}

/// A remote MCP server reached over streamable HTTP.
///
/// Responses may be plain JSON or an event stream; the session id handed out
/// by the server is echoed on every later request.
pub struct StreamableHttpTransport {
    server_id: String,
    client: reqwest::Client,
    base_url: String,
    headers: Vec<(String, String)>,
    state: Mutex<SessionState>,
    next_request_id: AtomicI64,
}

impl StreamableHttpTransport {
    pub fn new(client: reqwest::Client, config: &McpServerConfig) -> Result<Self, McpError> {
        let base_url = config.base_url.clone().ok_or_else(|| {
            McpError::Config(format!(
                "MCP base_url is required for HTTP transports (server {}).",
                config.id
            ))
        })?;
        let headers = config
            .headers
            .as_ref()
            .map(|headers| {
                headers
                    .iter()
                    .map(|(name, value)| (name.clone(), value.clone()))
                    .collect()
            })
            .unwrap_or_default();
        Ok(Self {
            server_id: config.id.clone(),
            client,
            base_url,
            headers,
            state: Mutex::new(SessionState::default()),
            next_request_id: AtomicI64::new(0),
        })
    }

    pub async fn session_id(&self) -> Option<String> {
        self.state.lock().await.session_id.clone()
    }

    async fn post(&self, message: &ClientMessage) -> Result<reqwest::Response, McpError> {
        let payload =
            serde_json::to_string(message).map_err(|err| connectivity(&self.server_id, err.to_string()))?;
        let (session_id, protocol_version) = {
            let state = self.state.lock().await;
            (state.session_id.clone(), state.protocol_version.clone())
        };

        let mut request = self
            .client
            .post(&self.base_url)
            .header("Content-Type", MCP_JSON_CONTENT_TYPE)
            .header("Accept", MCP_JSON_AND_SSE_ACCEPT)
            .body(payload);
        for (name, value) in &self.headers {
            request = request.header(name.as_str(), value.as_str());
        }
        if let Some(version) = protocol_version.filter(|version| !version.trim().is_empty()) {
            request = request.header(MCP_PROTOCOL_VERSION_HEADER, version);
        }
        if let Some(session_id) = session_id {
            request = request.header(MCP_SESSION_HEADER, session_id);
        }

        let response = request
            .send()
            .await
            .map_err(|err| connectivity(&self.server_id, err.to_string()))?;
        if !response.status().is_success() {
            return Err(connectivity(
                &self.server_id,
                format!("HTTP error: {}", response.status()),
            ));
        }

        if let Some(session_id) = response
            .headers()
            .get(MCP_SESSION_HEADER)
            .and_then(|value| value.to_str().ok())
        {
            self.state.lock().await.session_id = Some(session_id.to_string());
        }
        Ok(response)
    }
}

#[async_trait]
impl McpTransport for StreamableHttpTransport {
    async fn send_request(&self, request: RequestFromClient) -> Result<ServerMessage, McpError> {
        let request_id = self.next_request_id.fetch_add(1, Ordering::SeqCst);
        let message = ClientMessage::from_message(
            MessageFromClient::RequestFromClient(request),
            Some(RequestId::Integer(request_id)),
        )
        .map_err(|err| connectivity(&self.server_id, err.to_string()))?;
        debug!(server_id = %self.server_id, url = %self.base_url, request_id, "Sending MCP HTTP request");

        let response = self.post(&message).await?;
        let content_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
            .unwrap_or("")
            .to_string();

        if is_event_stream_content_type(&content_type) {
            next_sse_server_message(response)
                .await
                .map_err(|err| connectivity(&self.server_id, err))
        } else {
            let body = response
                .bytes()
                .await
                .map_err(|err| connectivity(&self.server_id, err.to_string()))?;
            serde_json::from_slice::<ServerMessage>(&body)
                .map_err(|err| connectivity(&self.server_id, format!("invalid MCP response: {err}")))
        }
    }

    async fn send_notification(&self, notification: NotificationFromClient) -> Result<(), McpError> {
        let message = ClientMessage::from_message(
            MessageFromClient::NotificationFromClient(notification),
            None,
        )
        .map_err(|err| connectivity(&self.server_id, err.to_string()))?;
        self.post(&message).await.map(|_| ())
    }

    async fn set_protocol_version(&self, version: &str) {
        self.state.lock().await.protocol_version = Some(version.to_string());
    }
}

/// Reads an event stream until the first response or error message.
async fn next_sse_server_message(response: reqwest::Response) -> Result<ServerMessage, String> {
    let mut stream = response.bytes_stream();
    let mut buffer = SseLineBuffer::default();

    while let Some(chunk) = stream.next().await {
        let chunk = chunk.map_err(|err| err.to_string())?;
        for line in buffer.push(&chunk) {
            if let Some(message) = decode_sse_line(&line)? {
                return Ok(message);
            }
        }
    }
    for line in buffer.finish() {
        if let Some(message) = decode_sse_line(&line)? {
            return Ok(message);
        }
    }
    Err("Empty event-stream response.".to_string())
}

fn decode_sse_line(line: &str) -> Result<Option<ServerMessage>, String> {
    let Some(payload) = sse_data_payload(line) else {
        return Ok(None);
    };
    if payload.is_empty() {
        return Ok(None);
    }
    let message = serde_json::from_str::<ServerMessage>(payload).map_err(|err| err.to_string())?;
    Ok(matches!(message, ServerMessage::Response(_) | ServerMessage::Error(_)).then_some(message))
}
