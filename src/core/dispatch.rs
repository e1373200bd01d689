//! Turns actions into tool invocations and their results into memory.

use std::sync::Arc;
use std::time::Instant;

use futures_util::{stream, StreamExt};
use serde_json::{json, Value};

use crate::core::action::{Action, ActionResult, ActionStatus};
use crate::core::context::RequestContext;
use crate::core::message::{Message, MessageMetadata, Role};
use crate::mcp::MCP_TOOL_SEPARATOR;
use crate::tools::{normalize_arguments, Tool, ToolError, ToolRegistry, MCP_PROXY_TOOL};

const DEFAULT_CONCURRENCY: usize = 4;

#[derive(Clone)]
pub struct ActionDispatcher {
    registry: Arc<ToolRegistry>,
    concurrency: usize,
}

impl ActionDispatcher {
    pub fn new(registry: Arc<ToolRegistry>) -> Self {
        Self {
            registry,
            concurrency: DEFAULT_CONCURRENCY,
        }
    }

    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }

    pub fn registry(&self) -> &ToolRegistry {
        &self.registry
    }

    /// Runs `action` and always produces exactly one result.
    ///
    /// Invocation errors become `failure` results carrying the error text and
    /// a `retryable` flag. When the tool condenses its output for memory, the
    /// condensed form is stored in `result.memory`.
    pub async fn dispatch(
        &self,
        action: &Action,
        correlation_id: &str,
        ctx: &RequestContext,
    ) -> ActionResult {
        let started = Instant::now();
        let outcome = match self.resolve(action) {
            Ok((tool, routed)) => self
                .invoke(tool.as_ref(), &routed, correlation_id, ctx)
                .await
                .map(|result| (tool, routed, result)),
            Err(err) => Err(err),
        };

        let result = match outcome {
            Ok((tool, routed, mut result)) => {
                if result.status == ActionStatus::Failure {
                    if result.error.as_deref().map(str::trim).unwrap_or_default().is_empty() {
                        result.error = Some(format!("{} failed", action.kind));
                    }
                    if !result.metadata.contains_key("retryable") {
                        result.metadata.insert("retryable".to_string(), json!(false));
                    }
                }
                if let Some(memory) = tool.resolve_memory(&routed, &result) {
                    result.memory = Some(memory);
                    result.memorized = Some(true);
                }
                result
            }
            Err(err) => {
                tracing::warn!(
                    conversation_id = %ctx.conversation_id,
                    correlation_id,
                    tool = %action.kind,
                    error = %err,
                    "Tool invocation failed"
                );
                ActionResult::failure(err.to_string())
                    .with_metadata("retryable", json!(err.is_retryable()))
            }
        };

        tracing::debug!(
            conversation_id = %ctx.conversation_id,
            correlation_id,
            tool = %action.kind,
            status = result.status.as_str(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Action dispatched"
        );
        result
    }

    /// Dispatches independent actions with bounded concurrency. Results come
    /// back in issue order, each paired with its correlation id.
    pub async fn dispatch_all(
        &self,
        actions: &[Action],
        ctx: &RequestContext,
    ) -> Vec<(String, ActionResult)> {
        stream::iter(actions.iter().map(|action| async move {
            let correlation_id = uuid::Uuid::new_v4().to_string();
            let result = self.dispatch(action, &correlation_id, ctx).await;
            (correlation_id, result)
        }))
        .buffered(self.concurrency)
        .collect()
        .await
    }

    /// Finds the tool for `action`, rewriting `server__tool` names into an
    /// MCP proxy call.
    fn resolve(&self, action: &Action) -> Result<(Arc<dyn Tool>, Action), ToolError> {
        let name = action.kind.trim();
        if let Some(tool) = self.registry.get(name) {
            return Ok((tool, action.clone()));
        }

        let Some((server, tool_name)) = name.split_once(MCP_TOOL_SEPARATOR) else {
            return Err(ToolError::UnknownTool(name.to_string()));
        };
        if server.is_empty() || tool_name.is_empty() {
            return Err(ToolError::UnknownTool(name.to_string()));
        }
        let proxy = self
            .registry
            .get(MCP_PROXY_TOOL)
            .ok_or_else(|| ToolError::UnknownTool(name.to_string()))?;
        let arguments = normalize_arguments(&action.params)?;
        let routed = Action::new(
            MCP_PROXY_TOOL,
            json!({
                "server": server,
                "tool": tool_name,
                "arguments": Value::Object(arguments),
            }),
        );
        Ok((proxy, routed))
    }

    async fn invoke(
        &self,
        tool: &dyn Tool,
        action: &Action,
        correlation_id: &str,
        ctx: &RequestContext,
    ) -> Result<ActionResult, ToolError> {
        let arguments = normalize_arguments(&action.params)?;
        tool.schema().validate(&arguments)?;
        let normalized = Action::new(action.kind.clone(), Value::Object(arguments));

        tokio::select! {
            biased;
            _ = ctx.signal.cancelled() => Err(ToolError::Cancelled),
            result = tool.execute(&normalized, correlation_id, ctx) => result,
        }
    }
}

/// The tool-role message recording `result` under `pid`.
pub fn memory_message(
    action: &Action,
    correlation_id: &str,
    result: &ActionResult,
    pid: &str,
) -> Message {
    Message::new(pid, Role::Tool, result.memory_content()).with_metadata(MessageMetadata {
        memorized: result.memorized.unwrap_or(true),
        action_type: Some(action.kind.clone()),
        status: Some(result.status),
        correlation_id: Some(correlation_id.to_string()),
    })
}
