//! Tools the agent can run, and the registry that holds them.
//!
//! Every tool satisfies the same contract:
//! `execute(action, correlation_id, context) -> ActionResult`. Tools are
//! registered explicitly when the process starts; the registry does not
//! change afterwards. The MCP proxy is the one tool whose reachable
//! capabilities are resolved per call against live servers.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

use crate::api::ChatToolDefinition;
use crate::core::action::{Action, ActionResult};
use crate::core::config::Config;
use crate::core::context::RequestContext;
use crate::mcp::{McpError, McpService};

pub mod files;
pub mod mcp_proxy;
pub mod schema;
pub mod terminal;
pub mod web;
pub mod workspace;

pub use mcp_proxy::{McpProxyTool, MCP_PROXY_TOOL};
pub use schema::{normalize_arguments, ParameterSpec, ParameterType, ToolSchema};
pub use workspace::Workspace;

#[derive(Debug, Error)]
pub enum ToolError {
    #[error("invalid arguments: {0}")]
    InvalidArguments(String),
    #[error("{0}")]
    Execution(String),
    #[error("I/O error on {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("timed out after {0} seconds")]
    Timeout(u64),
    #[error(transparent)]
    Mcp(#[from] McpError),
    #[error("HTTP request failed: {message}")]
    Http { message: String, retryable: bool },
    #[error("cancelled")]
    Cancelled,
    #[error("no tool named {0}")]
    UnknownTool(String),
    #[error("tool {0} is registered twice")]
    DuplicateName(String),
}

impl ToolError {
    pub fn io(path: impl Into<String>, source: std::io::Error) -> Self {
        ToolError::Io {
            path: path.into(),
            source,
        }
    }

    /// Whether repeating the same call could plausibly succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            ToolError::Mcp(err) => err.is_retryable(),
            ToolError::Timeout(_) => true,
            ToolError::Http { retryable, .. } => *retryable,
            _ => false,
        }
    }
}

#[async_trait]
pub trait Tool: Send + Sync {
    fn name(&self) -> &str;

    fn description(&self) -> &str;

    fn schema(&self) -> ToolSchema;

    async fn execute(
        &self,
        action: &Action,
        correlation_id: &str,
        ctx: &RequestContext,
    ) -> Result<ActionResult, ToolError>;

    /// Condensed form of `result` to keep in conversation memory instead of
    /// the raw content.
    fn resolve_memory(&self, _action: &Action, _result: &ActionResult) -> Option<String> {
        None
    }

    /// Function definitions offered to the model for this tool.
    async fn definitions(&self, _ctx: &RequestContext) -> Vec<ChatToolDefinition> {
        vec![ChatToolDefinition::function(
            self.name(),
            Some(self.description().to_string()),
            self.schema().to_json_schema(),
        )]
    }
}

/// Immutable name → tool mapping built once at startup.
#[derive(Clone, Default)]
pub struct ToolRegistry {
    tools: HashMap<String, Arc<dyn Tool>>,
    order: Vec<String>,
}

impl ToolRegistry {
    pub fn builder() -> ToolRegistryBuilder {
        ToolRegistryBuilder::default()
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.tools.get(name).cloned()
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.order.iter().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    /// Every function definition the model may call, in registration order.
    pub async fn definitions(&self, ctx: &RequestContext) -> Vec<ChatToolDefinition> {
        let mut definitions = Vec::new();
        for name in &self.order {
            if let Some(tool) = self.tools.get(name) {
                definitions.extend(tool.definitions(ctx).await);
            }
        }
        definitions
    }
}

#[derive(Default)]
pub struct ToolRegistryBuilder {
    tools: Vec<Arc<dyn Tool>>,
}

impl ToolRegistryBuilder {
    pub fn register(mut self, tool: impl Tool + 'static) -> Self {
        self.tools.push(Arc::new(tool));
        self
    }

    pub fn register_arc(mut self, tool: Arc<dyn Tool>) -> Self {
        self.tools.push(tool);
        self
    }

    pub fn build(self) -> Result<ToolRegistry, ToolError> {
        let mut registry = ToolRegistry::default();
        for tool in self.tools {
            let name = tool.name().to_string();
            if registry.tools.contains_key(&name) {
                return Err(ToolError::DuplicateName(name));
            }
            registry.order.push(name.clone());
            registry.tools.insert(name, tool);
        }
        Ok(registry)
    }
}

/// The built-in local tools plus the MCP proxy.
pub fn builtin_registry(
    config: &Config,
    http: reqwest::Client,
    mcp: Arc<dyn McpService>,
) -> Result<ToolRegistry, ToolError> {
    let root = match &config.agent.workspace_root {
        Some(root) => root.clone(),
        None => std::env::current_dir().unwrap_or_else(|_| PathBuf::from(".")),
    };
    let workspace = Workspace::new(root);
    let terminal_timeout = Duration::from_secs(config.agent.terminal_timeout_seconds);

    ToolRegistry::builder()
        .register(terminal::TerminalRunTool::new(workspace.clone(), terminal_timeout))
        .register(files::ReadFileTool::new(workspace.clone()))
        .register(files::WriteFileTool::new(workspace.clone()))
        .register(files::ListDirectoryTool::new(workspace))
        .register(web::WebFetchTool::new(http))
        .register(McpProxyTool::new(mcp))
        .build()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    struct Echo(&'static str);

    #[async_trait]
    impl Tool for Echo {
        fn name(&self) -> &str {
            self.0
        }

        fn description(&self) -> &str {
            "Echo the text argument"
        }

        fn schema(&self) -> ToolSchema {
            ToolSchema::new().param("text", ParameterType::String, "Text to echo", true)
        }

        async fn execute(
            &self,
            action: &Action,
            _correlation_id: &str,
            _ctx: &RequestContext,
        ) -> Result<ActionResult, ToolError> {
            let args = normalize_arguments(&action.params)?;
            Ok(ActionResult::success(schema::required_str(&args, "text")?))
        }
    }

    #[test]
    fn duplicate_names_are_rejected() {
        let err = ToolRegistry::builder()
            .register(Echo("echo"))
            .register(Echo("echo"))
            .build()
            .err()
            .expect("duplicate should fail");
        assert!(matches!(err, ToolError::DuplicateName(name) if name == "echo"));
    }

    #[tokio::test]
    async fn registry_keeps_registration_order() {
        let registry = ToolRegistry::builder()
            .register(Echo("b"))
            .register(Echo("a"))
            .build()
            .expect("registry");
        assert_eq!(registry.names().collect::<Vec<_>>(), vec!["b", "a"]);
        assert!(registry.get("a").is_some());
        assert!(registry.get("c").is_none());

        let definitions = registry.definitions(&RequestContext::new("c1")).await;
        assert_eq!(definitions.len(), 2);
        assert_eq!(definitions[0].function.name, "b");

        let tool = registry.get("b").expect("tool");
        let result = tool
            .execute(
                &Action::new("b", json!({"text": "hi"})),
                "corr-1",
                &RequestContext::new("c1"),
            )
            .await
            .expect("execute");
        assert_eq!(result.content.to_text(), "hi");
    }

    #[test]
    fn retryability_follows_error_kind() {
        assert!(ToolError::Mcp(McpError::Connectivity {
            server_id: "s".into(),
            message: "down".into()
        })
        .is_retryable());
        assert!(!ToolError::Mcp(McpError::ToolNotFound {
            server_id: "s".into(),
            tool: "t".into()
        })
        .is_retryable());
        assert!(ToolError::Timeout(5).is_retryable());
        assert!(!ToolError::InvalidArguments("x".into()).is_retryable());
    }
}
