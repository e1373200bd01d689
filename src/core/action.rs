//! Actions emitted by the model and the results produced by running them.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::core::chat_stream::PendingToolCall;

/// A structured "do this next" instruction extracted from model output.
///
/// `params` is kept as raw JSON: providers hand arguments over either as an
/// encoded string or as an object, and the dispatcher normalizes both.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Action {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub params: Value,
}

impl Action {
    pub fn new(kind: impl Into<String>, params: Value) -> Self {
        Self {
            kind: kind.into(),
            params,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ActionStatus {
    Success,
    Failure,
}

impl ActionStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            ActionStatus::Success => "success",
            ActionStatus::Failure => "failure",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ActionContent {
    Text(String),
    Fragments(Vec<String>),
}

impl ActionContent {
    pub fn to_text(&self) -> String {
        match self {
            ActionContent::Text(text) => text.clone(),
            ActionContent::Fragments(fragments) => fragments.join("\n"),
        }
    }

    pub fn is_empty(&self) -> bool {
        match self {
            ActionContent::Text(text) => text.trim().is_empty(),
            ActionContent::Fragments(fragments) => {
                fragments.iter().all(|fragment| fragment.trim().is_empty())
            }
        }
    }
}

impl Default for ActionContent {
    fn default() -> Self {
        ActionContent::Text(String::new())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionResult {
    pub status: ActionStatus,
    #[serde(default)]
    pub content: ActionContent,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stderr: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memorized: Option<bool>,
    /// Condensed form recorded in conversation memory instead of `content`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memory: Option<String>,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub metadata: Map<String, Value>,
}

impl ActionResult {
    pub fn success(content: impl Into<String>) -> Self {
        Self {
            status: ActionStatus::Success,
            content: ActionContent::Text(content.into()),
            error: None,
            stderr: None,
            memorized: None,
            memory: None,
            metadata: Map::new(),
        }
    }

    pub fn fragments(fragments: Vec<String>) -> Self {
        Self {
            content: ActionContent::Fragments(fragments),
            ..Self::success(String::new())
        }
    }

    /// A failure whose error text is never empty.
    pub fn failure(error: impl Into<String>) -> Self {
        let mut error = error.into();
        if error.trim().is_empty() {
            error = "Action failed without an error message.".to_string();
        }
        Self {
            status: ActionStatus::Failure,
            content: ActionContent::Text(error.clone()),
            error: Some(error),
            stderr: None,
            memorized: None,
            memory: None,
            metadata: Map::new(),
        }
    }

    pub fn with_metadata(mut self, key: &str, value: Value) -> Self {
        self.metadata.insert(key.to_string(), value);
        self
    }

    pub fn is_success(&self) -> bool {
        self.status == ActionStatus::Success
    }

    /// Text persisted into the conversation: the condensed memory when a tool
    /// supplied one, otherwise the raw content (plus stderr/error details).
    pub fn memory_content(&self) -> String {
        if let Some(memory) = &self.memory {
            return memory.clone();
        }
        let mut text = self.content.to_text();
        if let Some(stderr) = self.stderr.as_deref().filter(|s| !s.trim().is_empty()) {
            if !text.is_empty() {
                text.push('\n');
            }
            text.push_str("stderr:\n");
            text.push_str(stderr);
        }
        if let Some(error) = self.error.as_deref() {
            if !text.contains(error) {
                if !text.is_empty() {
                    text.push('\n');
                }
                text.push_str("error: ");
                text.push_str(error);
            }
        }
        text
    }
}

/// Collects the actions a completion asks for.
///
/// Native tool calls win; otherwise the visible text is scanned for a JSON
/// action object, either bare or inside a fenced block.
pub fn extract_actions(tool_calls: &[PendingToolCall], visible_text: &str) -> Vec<Action> {
    if !tool_calls.is_empty() {
        return tool_calls
            .iter()
            .filter_map(|call| {
                let name = call.name.as_deref()?.trim();
                if name.is_empty() {
                    return None;
                }
                Some(Action::new(name, Value::String(call.arguments.clone())))
            })
            .collect();
    }

    parse_action_text(visible_text).into_iter().collect()
}

/// Finds a single action encoded as JSON in model text.
///
/// Accepted shapes: `{"action": {"type", "params"}}`, `{"type", "params"}`
/// and `{"tool", "arguments"}`.
pub fn parse_action_text(text: &str) -> Option<Action> {
    let trimmed = text.trim();
    if trimmed.is_empty() {
        return None;
    }

    std::iter::once(trimmed)
        .chain(fenced_blocks(trimmed))
        .filter_map(|candidate| serde_json::from_str::<Value>(candidate).ok())
        .find_map(|value| action_from_value(&value))
}

fn action_from_value(value: &Value) -> Option<Action> {
    let object = value.as_object()?;
    if let Some(inner) = object.get("action") {
        return action_from_value(inner);
    }

    let kind = object
        .get("type")
        .or_else(|| object.get("tool"))
        .and_then(Value::as_str)?
        .trim();
    if kind.is_empty() {
        return None;
    }
    let params = object
        .get("params")
        .or_else(|| object.get("arguments"))
        .cloned()
        .unwrap_or(Value::Object(Map::new()));
    Some(Action::new(kind, params))
}

fn fenced_blocks(text: &str) -> impl Iterator<Item = &str> {
    text.split("```")
        .enumerate()
        .filter(|(index, _)| index % 2 == 1)
        .map(|(_, block)| {
            // Drop an info string such as `json` or `action` on the fence line.
            match block.split_once('\n') {
                Some((info, body)) if !info.trim_start().starts_with('{') => body.trim(),
                _ => block.trim(),
            }
        })
}
