//! Routes tool calls to tools exposed by MCP servers.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Map, Value};

use crate::api::ChatToolDefinition;
use crate::core::action::{Action, ActionResult};
use crate::core::context::RequestContext;
use crate::mcp::McpService;
use crate::tools::schema::{normalize_arguments, required_str, ParameterType, ToolSchema};
use crate::tools::{Tool, ToolError};

pub const MCP_PROXY_TOOL: &str = "mcp";

pub struct McpProxyTool {
    mcp: Arc<dyn McpService>,
}

impl McpProxyTool {
    pub fn new(mcp: Arc<dyn McpService>) -> Self {
        Self { mcp }
    }
}

#[async_trait]
impl Tool for McpProxyTool {
    fn name(&self) -> &str {
        MCP_PROXY_TOOL
    }

    fn description(&self) -> &str {
        "Call a tool on a connected MCP server"
    }

    fn schema(&self) -> ToolSchema {
        ToolSchema::new()
            .param("server", ParameterType::String, "MCP server id", true)
            .param("tool", ParameterType::String, "Tool name on that server", true)
            .param("arguments", ParameterType::Object, "Arguments for the tool", false)
    }

    async fn execute(
        &self,
        action: &Action,
        correlation_id: &str,
        ctx: &RequestContext,
    ) -> Result<ActionResult, ToolError> {
        let args = normalize_arguments(&action.params)?;
        let server = required_str(&args, "server")?;
        let tool = required_str(&args, "tool")?;
        let arguments = match args.get("arguments") {
            Some(value) => normalize_arguments(value)?,
            None => Map::new(),
        };

        if let Some(allowed) = ctx.mcp_server_ids.as_deref() {
            if !allowed.iter().any(|id| id.eq_ignore_ascii_case(server)) {
                return Err(crate::mcp::McpError::ServerNotFound(server.to_string()).into());
            }
        }

        tracing::debug!(correlation_id, server, tool, "Calling MCP tool");
        let output = tokio::select! {
            biased;
            _ = ctx.signal.cancelled() => return Err(ToolError::Cancelled),
            output = self.mcp.call_tool(server, tool, arguments) => output?,
        };

        let text = output.content.to_text();
        let result = if output.is_error {
            let mut failed = ActionResult::failure(if text.trim().is_empty() {
                format!("{server}/{tool} reported an error")
            } else {
                text.clone()
            });
            failed.content = crate::core::action::ActionContent::Text(text);
            failed
        } else {
            ActionResult::success(text)
        };
        Ok(result
            .with_metadata("server", json!(server))
            .with_metadata("tool", json!(tool)))
    }

    /// One definition per reachable server tool, named `server__tool`.
    async fn definitions(&self, ctx: &RequestContext) -> Vec<ChatToolDefinition> {
        let mut definitions = Vec::new();
        for server in self.mcp.list_servers(ctx.mcp_server_ids.as_deref()) {
            match self.mcp.list_tools(&server.id).await {
                Ok(tools) => definitions.extend(tools.into_iter().map(|tool| {
                    let parameters = match tool.input_schema {
                        Value::Object(_) => tool.input_schema.clone(),
                        _ => json!({"type": "object", "properties": {}}),
                    };
                    ChatToolDefinition::function(tool.qualified_name(), tool.description, parameters)
                })),
                Err(err) => {
                    tracing::warn!(server = %server.id, error = %err, "Skipping MCP server tools");
                }
            }
        }
        definitions
    }
}
