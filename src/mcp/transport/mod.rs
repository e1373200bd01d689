//! Shared MCP transport abstractions.
//!
//! Both transports carry `rust-mcp-schema` messages; the client above them
//! never needs to know which one it is talking to.

use crate::core::config::McpServerConfig;
use crate::mcp::McpError;
use async_trait::async_trait;
use rust_mcp_schema::schema_utils::{NotificationFromClient, RequestFromClient, ServerMessage};

pub mod stdio;
pub mod streamable_http;

/// JSON-RPC code used by servers to indicate unsupported methods.
pub const MCP_METHOD_NOT_FOUND: i64 = -32601;

/// Supported MCP transport backends.
///
/// - [`McpTransportKind::Stdio`] for locally spawned processes.
/// - [`McpTransportKind::StreamableHttp`] for remote servers over HTTP/SSE.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum McpTransportKind {
    StreamableHttp,
    Stdio,
}

impl McpTransportKind {
    /// Resolves transport type from config, defaulting to streamable HTTP.
    pub fn from_config(config: &McpServerConfig) -> Result<Self, McpError> {
        let transport = config
            .transport
            .as_deref()
            .unwrap_or("streamable-http")
            .to_ascii_lowercase();
        match transport.as_str() {
            "streamable-http" | "streamable_http" | "http" => Ok(McpTransportKind::StreamableHttp),
            "stdio" => Ok(McpTransportKind::Stdio),
            other => Err(McpError::Config(format!(
                "unsupported MCP transport `{other}` for server {}",
                config.id
            ))),
        }
    }
}

#[async_trait]
pub trait McpTransport: Send + Sync {
    async fn send_request(&self, request: RequestFromClient) -> Result<ServerMessage, McpError>;

    async fn send_notification(&self, notification: NotificationFromClient) -> Result<(), McpError>;

    /// Records the version agreed during initialize for later requests.
    async fn set_protocol_version(&self, _version: &str) {}
}

/// Returns true when a server reports the JSON-RPC method-not-found code.
pub fn is_method_not_found(message: &ServerMessage) -> bool {
    matches!(
        message,
        ServerMessage::Error(error) if error.error.code == MCP_METHOD_NOT_FOUND
    )
}

pub(crate) fn connectivity(server_id: &str, message: impl Into<String>) -> McpError {
    McpError::Connectivity {
        server_id: server_id.to_string(),
        message: message.into(),
    }
}
