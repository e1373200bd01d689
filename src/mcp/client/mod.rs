use crate::core::config::{Config, McpServerConfig};
use crate::mcp::registry::McpRegistry;
use crate::mcp::transport::stdio::StdioTransport;
use crate::mcp::transport::streamable_http::StreamableHttpTransport;
use crate::mcp::transport::{self, McpTransport, McpTransportKind};
use crate::mcp::{McpError, McpService, McpToolInfo, McpToolOutput};
use async_trait::async_trait;
use rust_mcp_schema::schema_utils::{NotificationFromClient, RequestFromClient};
use rust_mcp_schema::CallToolRequestParams;
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, OnceCell};
use tracing::{debug, info, warn};

mod protocol;

pub(crate) const MCP_MAX_TOOL_LIST: usize = 100;
const MCP_HTTP_CONNECT_TIMEOUT_SECONDS: u64 = 10;
const MCP_HTTP_REQUEST_TIMEOUT_SECONDS: u64 = 60;
const MCP_HTTP_POOL_IDLE_TIMEOUT_SECONDS: u64 = 90;
const MCP_HTTP_POOL_MAX_IDLE_PER_HOST: usize = 8;
const STDIO_REQUEST_TIMEOUT_SECONDS: u64 = 60;
const CONNECTIVITY_CHECK_TIMEOUT_SECONDS: u64 = 15;

pub fn build_mcp_http_client() -> Result<reqwest::Client, McpError> {
    reqwest::Client::builder()
        .connect_timeout(Duration::from_secs(MCP_HTTP_CONNECT_TIMEOUT_SECONDS))
        .timeout(Duration::from_secs(MCP_HTTP_REQUEST_TIMEOUT_SECONDS))
        .pool_idle_timeout(Duration::from_secs(MCP_HTTP_POOL_IDLE_TIMEOUT_SECONDS))
        .pool_max_idle_per_host(MCP_HTTP_POOL_MAX_IDLE_PER_HOST)
        .build()
        .map_err(|err| McpError::Config(format!("unable to build MCP HTTP client: {err}")))
}

/// An initialized connection to one server.
struct McpSession {
    server: McpServerConfig,
    transport: Box<dyn McpTransport>,
    tools: OnceCell<Vec<McpToolInfo>>,
}

impl McpSession {
    async fn tools(&self) -> Result<&[McpToolInfo], McpError> {
        self.tools
            .get_or_try_init(|| fetch_tools(&self.server, self.transport.as_ref()))
            .await
            .map(Vec::as_slice)
    }
}

type SessionSlot = Arc<OnceCell<Arc<McpSession>>>;

/// Client for every configured MCP server.
///
/// Sessions are opened lazily on first use and shared by later calls. A
/// session whose transport fails is dropped so the next call reconnects.
pub struct McpClient {
    registry: McpRegistry,
    http: reqwest::Client,
    request_timeout: Duration,
    sessions: Mutex<HashMap<String, SessionSlot>>,
}

impl McpClient {
    pub fn new(registry: McpRegistry, http: reqwest::Client) -> Self {
        Self {
            registry,
            http,
            request_timeout: Duration::from_secs(STDIO_REQUEST_TIMEOUT_SECONDS),
            sessions: Mutex::new(HashMap::new()),
        }
    }

    pub fn from_config(config: &Config) -> Result<Self, McpError> {
        Ok(Self::new(
            McpRegistry::from_config(config),
            build_mcp_http_client()?,
        ))
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub fn registry(&self) -> &McpRegistry {
        &self.registry
    }

    async fn connect(&self, server: &McpServerConfig) -> Result<McpSession, McpError> {
        let transport: Box<dyn McpTransport> = match McpTransportKind::from_config(server)? {
            McpTransportKind::Stdio => Box::new(StdioTransport::spawn(server, self.request_timeout)?),
            McpTransportKind::StreamableHttp => {
                Box::new(StreamableHttpTransport::new(self.http.clone(), server)?)
            }
        };
        transport
            .set_protocol_version(&protocol::requested_protocol_version(server))
            .await;

        let response = transport
            .send_request(RequestFromClient::InitializeRequest(
                protocol::client_details_for(server),
            ))
            .await?;
        let details = protocol::parse_initialize_result(response)?;
        transport.set_protocol_version(&details.protocol_version).await;
        transport
            .send_notification(NotificationFromClient::InitializedNotification(None))
            .await?;
        info!(
            server_id = %server.id,
            protocol_version = %details.protocol_version,
            server_name = %details.server_info.name,
            "Connected to MCP server"
        );

        Ok(McpSession {
            server: server.clone(),
            transport,
            tools: OnceCell::new(),
        })
    }

    async fn session(&self, server_id: &str) -> Result<Arc<McpSession>, McpError> {
        let server = self
            .registry
            .find_server(server_id)
            .ok_or_else(|| McpError::ServerNotFound(server_id.to_string()))?;
        let slot = {
            let mut sessions = self.sessions.lock().await;
            Arc::clone(
                sessions
                    .entry(server.id.to_ascii_lowercase())
                    .or_insert_with(|| Arc::new(OnceCell::new())),
            )
        };
        let session = slot
            .get_or_try_init(|| async { self.connect(server).await.map(Arc::new) })
            .await?;
        Ok(Arc::clone(session))
    }

    async fn evict(&self, server_id: &str) {
        debug!(server_id, "Dropping MCP session after transport failure");
        self.sessions
            .lock()
            .await
            .remove(&server_id.to_ascii_lowercase());
    }

    async fn evict_on_connectivity<T>(
        &self,
        server_id: &str,
        result: Result<T, McpError>,
    ) -> Result<T, McpError> {
        if matches!(result, Err(McpError::Connectivity { .. })) {
            self.evict(server_id).await;
        }
        result
    }
}

async fn fetch_tools(
    server: &McpServerConfig,
    transport: &dyn McpTransport,
) -> Result<Vec<McpToolInfo>, McpError> {
    let mut tools = Vec::new();
    let mut cursor = None;
    loop {
        let response = transport
            .send_request(RequestFromClient::ListToolsRequest(
                protocol::paginated_params(cursor),
            ))
            .await?;
        if transport::is_method_not_found(&response) {
            debug!(server_id = %server.id, "MCP server does not list tools");
            break;
        }
        let page = protocol::parse_list_tools(response)?;
        for tool in page.tools {
            if tools.len() >= MCP_MAX_TOOL_LIST {
                break;
            }
            if !server.allows_tool(&tool.name) {
                continue;
            }
            let input_schema = serde_json::to_value(&tool.input_schema)
                .unwrap_or_else(|_| serde_json::json!({"type": "object"}));
            tools.push(McpToolInfo {
                server_id: server.id.clone(),
                name: tool.name,
                description: tool.description,
                input_schema,
            });
        }
        cursor = page.next_cursor;
        if cursor.is_none() || tools.len() >= MCP_MAX_TOOL_LIST {
            break;
        }
    }
    debug!(server_id = %server.id, count = tools.len(), "Listed MCP tools");
    Ok(tools)
}

#[async_trait]
impl McpService for McpClient {
    fn list_servers(&self, server_ids: Option<&[String]>) -> Vec<McpServerConfig> {
        self.registry.select(server_ids)
    }

    async fn check_connectivity(&self, server: &McpServerConfig) -> bool {
        let attempt = tokio::time::timeout(
            Duration::from_secs(CONNECTIVITY_CHECK_TIMEOUT_SECONDS),
            self.connect(server),
        )
        .await;
        match attempt {
            Ok(Ok(_session)) => true,
            Ok(Err(err)) => {
                warn!(server_id = %server.id, error = %err, "MCP connectivity check failed");
                false
            }
            Err(_) => {
                warn!(server_id = %server.id, "MCP connectivity check timed out");
                false
            }
        }
    }

    async fn list_tools(&self, server_id: &str) -> Result<Vec<McpToolInfo>, McpError> {
        let result = match self.session(server_id).await {
            Ok(session) => session.tools().await.map(<[McpToolInfo]>::to_vec),
            Err(err) => Err(err),
        };
        self.evict_on_connectivity(server_id, result).await
    }

    async fn call_tool(
        &self,
        server_id: &str,
        tool: &str,
        arguments: Map<String, Value>,
    ) -> Result<McpToolOutput, McpError> {
        let not_found = || McpError::ToolNotFound {
            server_id: server_id.to_string(),
            tool: tool.to_string(),
        };
        let server = self
            .registry
            .find_server(server_id)
            .ok_or_else(|| McpError::ServerNotFound(server_id.to_string()))?;
        if !server.allows_tool(tool) {
            return Err(not_found());
        }

        let result = async {
            let session = self.session(server_id).await?;
            if !session.tools().await?.iter().any(|info| info.name == tool) {
                return Err(not_found());
            }
            debug!(server_id, tool, "Calling MCP tool");
            let params = CallToolRequestParams::new(tool).with_arguments(arguments);
            let response = session
                .transport
                .send_request(RequestFromClient::CallToolRequest(params))
                .await?;
            protocol::parse_call_tool(response)
        }
        .await;
        self.evict_on_connectivity(server_id, result).await
    }
}

#[cfg(test)]
mod tests;
