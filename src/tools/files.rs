//! Workspace file tools.

use async_trait::async_trait;
use serde_json::json;

use crate::core::action::{Action, ActionResult};
use crate::core::context::RequestContext;
use crate::tools::schema::{normalize_arguments, required_str, ParameterType, ToolSchema};
use crate::tools::{Tool, ToolError, Workspace};

pub const READ_FILE_TOOL: &str = "read_file";
pub const WRITE_FILE_TOOL: &str = "write_file";
pub const LIST_DIRECTORY_TOOL: &str = "list_directory";

const MAX_READ_BYTES: u64 = 512 * 1024;
const MAX_OUTLINE_ENTRIES: usize = 40;

const OUTLINE_PREFIXES: &[&str] = &[
    "pub ", "fn ", "struct ", "enum ", "trait ", "impl ", "mod ", "type ", "const ", "class ",
    "def ", "function ", "export ", "interface ", "# ", "## ", "### ",
];

pub struct ReadFileTool {
    workspace: Workspace,
}

impl ReadFileTool {
    pub fn new(workspace: Workspace) -> Self {
        Self { workspace }
    }
}

#[async_trait]
impl Tool for ReadFileTool {
    fn name(&self) -> &str {
        READ_FILE_TOOL
    }

    fn description(&self) -> &str {
        "Read a UTF-8 text file from the workspace"
    }

    fn schema(&self) -> ToolSchema {
        ToolSchema::new().param(
            "path",
            ParameterType::String,
            "File path relative to the workspace root",
            true,
        )
    }

    async fn execute(
        &self,
        action: &Action,
        _correlation_id: &str,
        _ctx: &RequestContext,
    ) -> Result<ActionResult, ToolError> {
        let args = normalize_arguments(&action.params)?;
        let requested = required_str(&args, "path")?;
        let path = self.workspace.resolve(requested)?;

        let metadata = tokio::fs::metadata(&path)
            .await
            .map_err(|err| ToolError::io(requested, err))?;
        if metadata.len() > MAX_READ_BYTES {
            return Err(ToolError::Execution(format!(
                "{requested} is {} bytes; files over {MAX_READ_BYTES} bytes are not read",
                metadata.len()
            )));
        }
        let bytes = tokio::fs::read(&path)
            .await
            .map_err(|err| ToolError::io(requested, err))?;
        let text = String::from_utf8(bytes)
            .map_err(|_| ToolError::Execution(format!("{requested} is not valid UTF-8")))?;

        Ok(ActionResult::success(text)
            .with_metadata("path", json!(requested))
            .with_metadata("bytes", json!(metadata.len())))
    }

    /// Keeps an outline of the file in memory instead of its full text.
    fn resolve_memory(&self, action: &Action, result: &ActionResult) -> Option<String> {
        if !result.is_success() {
            return None;
        }
        let path = normalize_arguments(&action.params)
            .ok()
            .and_then(|args| args.get("path").and_then(|v| v.as_str()).map(str::to_string))
            .unwrap_or_default();
        Some(file_outline(&path, &result.content.to_text()))
    }
}

/// Tagged summary of a file: size, line count and declaration-like lines.
pub fn file_outline(path: &str, text: &str) -> String {
    let line_count = text.lines().count();
    let mut outline = format!(
        "<file path=\"{path}\" lines=\"{line_count}\" bytes=\"{}\">\n",
        text.len()
    );
    let entries: Vec<(usize, &str)> = text
        .lines()
        .enumerate()
        .filter_map(|(index, line)| {
            let trimmed = line.trim_start();
            OUTLINE_PREFIXES
                .iter()
                .any(|prefix| trimmed.starts_with(prefix))
                .then_some((index + 1, line.trim_end()))
        })
        .take(MAX_OUTLINE_ENTRIES)
        .collect();
    for (line_no, line) in &entries {
        outline.push_str(&format!("{line_no}: {line}\n"));
    }
    if entries.is_empty() {
        if let Some((index, first)) = text
            .lines()
            .enumerate()
            .find(|(_, line)| !line.trim().is_empty())
        {
            outline.push_str(&format!("{}: {}\n", index + 1, first.trim_end()));
        }
    }
    outline.push_str("</file>");
    outline
}

pub struct WriteFileTool {
    workspace: Workspace,
}

impl WriteFileTool {
    pub fn new(workspace: Workspace) -> Self {
        Self { workspace }
    }
}

#[async_trait]
impl Tool for WriteFileTool {
    fn name(&self) -> &str {
        WRITE_FILE_TOOL
    }

    fn description(&self) -> &str {
        "Create or overwrite a text file in the workspace"
    }

    fn schema(&self) -> ToolSchema {
        ToolSchema::new()
            .param("path", ParameterType::String, "File path relative to the workspace root", true)
            .param("content", ParameterType::String, "Full file contents", true)
    }

    async fn execute(
        &self,
        action: &Action,
        correlation_id: &str,
        _ctx: &RequestContext,
    ) -> Result<ActionResult, ToolError> {
        let args = normalize_arguments(&action.params)?;
        let requested = required_str(&args, "path")?;
        let content = required_str(&args, "content")?;
        let path = self.workspace.resolve(requested)?;
        if path == self.workspace.root() {
            return Err(ToolError::InvalidArguments(
                "path must name a file, not the workspace root".to_string(),
            ));
        }

        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|err| ToolError::io(requested, err))?;
        }
        tokio::fs::write(&path, content)
            .await
            .map_err(|err| ToolError::io(requested, err))?;
        tracing::debug!(correlation_id, path = requested, bytes = content.len(), "Wrote file");

        Ok(ActionResult::success(format!(
            "Wrote {} bytes to {requested}",
            content.len()
        )))
    }
}

pub struct ListDirectoryTool {
    workspace: Workspace,
}

impl ListDirectoryTool {
    pub fn new(workspace: Workspace) -> Self {
        Self { workspace }
    }
}

#[async_trait]
impl Tool for ListDirectoryTool {
    fn name(&self) -> &str {
        LIST_DIRECTORY_TOOL
    }

    fn description(&self) -> &str {
        "List the entries of a workspace directory; directories end in `/`"
    }

    fn schema(&self) -> ToolSchema {
        ToolSchema::new().param(
            "path",
            ParameterType::String,
            "Directory relative to the workspace root (defaults to the root)",
            false,
        )
    }

    async fn execute(
        &self,
        action: &Action,
        _correlation_id: &str,
        _ctx: &RequestContext,
    ) -> Result<ActionResult, ToolError> {
        let args = normalize_arguments(&action.params)?;
        let requested = args.get("path").and_then(|v| v.as_str()).unwrap_or(".");
        let path = self.workspace.resolve(requested)?;

        let mut reader = tokio::fs::read_dir(&path)
            .await
            .map_err(|err| ToolError::io(requested, err))?;
        let mut entries = Vec::new();
        while let Some(entry) = reader
            .next_entry()
            .await
            .map_err(|err| ToolError::io(requested, err))?
        {
            let mut name = entry.file_name().to_string_lossy().into_owned();
            let is_dir = entry
                .file_type()
                .await
                .map(|kind| kind.is_dir())
                .unwrap_or(false);
            if is_dir {
                name.push('/');
            }
            entries.push(name);
        }
        entries.sort();
        Ok(ActionResult::fragments(entries))
    }
}
