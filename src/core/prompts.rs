//! Prompt templates for the orchestrator's local path.
//!
//! Templates are opaque text with `{{name}}` placeholders.

pub const AGENT_SYSTEM_PROMPT: &str = "You are an agent working inside a software workspace. \
Use the available tools when they help you reach the user's goal. \
If your model cannot call tools natively, reply with a single JSON object \
{\"type\": \"<tool name>\", \"params\": {...}} to request one tool call. \
When the goal is met, answer in plain text without a tool call.";

pub const AUTO_REPLY_PROMPT: &str = "Continue the conversation. Reply to the latest message \
in plain text, without calling tools.";

pub const TITLE_PROMPT: &str = "Write a short title (at most eight words) for a conversation \
that starts like this. Reply with the title only.\n\n{{content}}";

pub const SUMMARY_PROMPT: &str = "Summarize the following conversation in a few sentences. \
Keep decisions, open questions and any tool results that matter.\n\n{{transcript}}";

pub const AGENT_GENERATION_PROMPT: &str = "Design an assistant for this request: {{description}}\n\n\
Reply with a JSON object with the string fields \"name\", \"description\" and \"instructions\".";

/// Replaces every `{{key}}` in `template` with its value.
pub fn render(template: &str, values: &[(&str, &str)]) -> String {
    values.iter().fold(template.to_string(), |text, (key, value)| {
        text.replace(&format!("{{{{{key}}}}}"), value)
    })
}
