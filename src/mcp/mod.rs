//! Model Context Protocol client support.
//!
//! [`client::McpClient`] speaks to configured servers over stdio or
//! streamable HTTP. The rest of the crate talks to it through the
//! [`McpService`] trait so dispatch can be exercised without live servers.

use async_trait::async_trait;
use serde_json::{Map, Value};
use thiserror::Error;

use crate::core::config::McpServerConfig;

pub mod client;
pub mod registry;
pub mod transport;

/// Separator between server id and tool name in proxied tool names.
pub const MCP_TOOL_SEPARATOR: &str = "__";

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum McpError {
    #[error("MCP server {server_id} is unreachable: {message}")]
    Connectivity { server_id: String, message: String },
    #[error("MCP server {server_id} has no tool named {tool}")]
    ToolNotFound { server_id: String, tool: String },
    #[error("no active MCP server with id {0}")]
    ServerNotFound(String),
    #[error("MCP error {code}: {message}")]
    Protocol { code: i64, message: String },
    #[error("invalid MCP server configuration: {0}")]
    Config(String),
}

impl McpError {
    /// Connectivity failures may succeed on a later attempt; nothing else will.
    pub fn is_retryable(&self) -> bool {
        matches!(self, McpError::Connectivity { .. })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct McpToolInfo {
    pub server_id: String,
    pub name: String,
    pub description: Option<String>,
    pub input_schema: Value,
}

impl McpToolInfo {
    /// The name under which the tool is offered to the model.
    pub fn qualified_name(&self) -> String {
        format!("{}{MCP_TOOL_SEPARATOR}{}", self.server_id, self.name)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum McpContent {
    Text(String),
    Object(Value),
    Fragments(Vec<String>),
}

impl McpContent {
    /// Object content is rendered as compact JSON.
    pub fn to_text(&self) -> String {
        match self {
            McpContent::Text(text) => text.clone(),
            McpContent::Object(value) => {
                serde_json::to_string(value).unwrap_or_else(|_| value.to_string())
            }
            McpContent::Fragments(fragments) => fragments.join("\n"),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct McpToolOutput {
    pub content: McpContent,
    pub is_error: bool,
}

#[async_trait]
pub trait McpService: Send + Sync {
    /// Active servers, narrowed to `server_ids` when an explicit list is given.
    fn list_servers(&self, server_ids: Option<&[String]>) -> Vec<McpServerConfig>;

    /// Performs a full handshake. Failures are logged and reported as `false`.
    async fn check_connectivity(&self, server: &McpServerConfig) -> bool;

    async fn list_tools(&self, server_id: &str) -> Result<Vec<McpToolInfo>, McpError>;

    async fn call_tool(
        &self,
        server_id: &str,
        tool: &str,
        arguments: Map<String, Value>,
    ) -> Result<McpToolOutput, McpError>;
}
