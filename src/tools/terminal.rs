use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;
use tokio::process::Command;

use crate::core::action::{Action, ActionContent, ActionResult};
use crate::core::context::RequestContext;
use crate::tools::schema::{normalize_arguments, required_str, ParameterType, ToolSchema};
use crate::tools::{Tool, ToolError, Workspace};

pub const TERMINAL_RUN_TOOL: &str = "terminal_run";
const MAX_OUTPUT_CHARS: usize = 32_000;

/// Runs a shell command inside the workspace.
///
/// The child is killed if the call is cancelled or times out.
pub struct TerminalRunTool {
    workspace: Workspace,
    timeout: Duration,
}

impl TerminalRunTool {
    pub fn new(workspace: Workspace, timeout: Duration) -> Self {
        Self { workspace, timeout }
    }
}

#[async_trait]
impl Tool for TerminalRunTool {
    fn name(&self) -> &str {
        TERMINAL_RUN_TOOL
    }

    fn description(&self) -> &str {
        "Run a shell command in the workspace and return its output"
    }

    fn schema(&self) -> ToolSchema {
        ToolSchema::new()
            .param("command", ParameterType::String, "Command line passed to `sh -c`", true)
            .param(
                "cwd",
                ParameterType::String,
                "Working directory relative to the workspace root",
                false,
            )
    }

    async fn execute(
        &self,
        action: &Action,
        correlation_id: &str,
        ctx: &RequestContext,
    ) -> Result<ActionResult, ToolError> {
        let args = normalize_arguments(&action.params)?;
        let command = required_str(&args, "command")?;
        let cwd = match args.get("cwd").and_then(|value| value.as_str()) {
            Some(dir) => self.workspace.resolve(dir)?,
            None => self.workspace.root().to_path_buf(),
        };
        tracing::debug!(correlation_id, command, cwd = %cwd.display(), "Running terminal command");

        let child = Command::new("sh")
            .arg("-c")
            .arg(command)
            .current_dir(&cwd)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|err| ToolError::io(cwd.display().to_string(), err))?;

        let output = tokio::select! {
            biased;
            _ = ctx.signal.cancelled() => return Err(ToolError::Cancelled),
            output = tokio::time::timeout(self.timeout, child.wait_with_output()) => match output {
                Ok(output) => output.map_err(|err| ToolError::io(command, err))?,
                Err(_) => return Err(ToolError::Timeout(self.timeout.as_secs())),
            },
        };

        let stdout = truncate_output(&String::from_utf8_lossy(&output.stdout));
        let stderr = truncate_output(&String::from_utf8_lossy(&output.stderr));
        let exit_code = output.status.code();

        let mut result = if output.status.success() {
            ActionResult::success(stdout)
        } else {
            let reason = match exit_code {
                Some(code) => format!("command exited with status {code}"),
                None => "command was terminated by a signal".to_string(),
            };
            let mut failed = ActionResult::failure(reason);
            if !stdout.is_empty() {
                failed.content = ActionContent::Text(stdout);
            }
            failed
        };
        if !stderr.is_empty() {
            result.stderr = Some(stderr);
        }
        Ok(result.with_metadata("exit_code", json!(exit_code)))
    }
}

fn truncate_output(text: &str) -> String {
    match text.char_indices().nth(MAX_OUTPUT_CHARS) {
        Some((cut, _)) => format!("{}\n[output truncated]", &text[..cut]),
        None => text.to_string(),
    }
}
