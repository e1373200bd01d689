use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::api::ChatMessage;
use crate::core::action::ActionStatus;

/// Parent id carried by root messages.
pub const ROOT_PID: &str = "-1";

pub const ROLE_USER: &str = "user";
pub const ROLE_ASSISTANT: &str = "assistant";
pub const ROLE_TOOL: &str = "tool";
pub const ROLE_SYSTEM: &str = "system";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum Role {
    User,
    Assistant,
    Tool,
    System,
}

impl Role {
    pub fn as_str(self) -> &'static str {
        match self {
            Role::User => ROLE_USER,
            Role::Assistant => ROLE_ASSISTANT,
            Role::Tool => ROLE_TOOL,
            Role::System => ROLE_SYSTEM,
        }
    }

    pub fn is_user(self) -> bool {
        self == Role::User
    }

    pub fn is_assistant(self) -> bool {
        self == Role::Assistant
    }
}

impl TryFrom<&str> for Role {
    type Error = String;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        match value {
            ROLE_USER => Ok(Role::User),
            ROLE_ASSISTANT => Ok(Role::Assistant),
            ROLE_TOOL => Ok(Role::Tool),
            ROLE_SYSTEM => Ok(Role::System),
            _ => Err(format!("invalid message role: {value}")),
        }
    }
}

impl TryFrom<String> for Role {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::try_from(value.as_str())
    }
}

impl From<Role> for String {
    fn from(value: Role) -> Self {
        value.as_str().to_string()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MessageMetadata {
    /// Retained in durable history rather than treated as scratch output.
    #[serde(default)]
    pub memorized: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub action_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<ActionStatus>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub id: String,
    pub pid: String,
    pub role: Role,
    pub content: String,
    pub is_active: bool,
    #[serde(default)]
    pub metadata: MessageMetadata,
    pub created_at: DateTime<Utc>,
}

impl Message {
    /// Creates an active message with a fresh id under `pid`.
    pub fn new(pid: impl Into<String>, role: Role, content: impl Into<String>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            pid: pid.into(),
            role,
            content: content.into(),
            is_active: true,
            metadata: MessageMetadata::default(),
            created_at: Utc::now(),
        }
    }

    pub fn root(role: Role, content: impl Into<String>) -> Self {
        Self::new(ROOT_PID, role, content)
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    pub fn with_metadata(mut self, metadata: MessageMetadata) -> Self {
        self.metadata = metadata;
        self
    }

    pub fn is_root(&self) -> bool {
        self.pid == ROOT_PID
    }

    /// Renders the message for a provider request.
    ///
    /// Tool results are replayed as user-visible observations so that history
    /// stays valid for providers that reject orphan `tool` messages.
    pub fn to_api_message(&self) -> ChatMessage {
        match self.role {
            Role::Tool => {
                let action = self.metadata.action_type.as_deref().unwrap_or("tool");
                let status = self
                    .metadata
                    .status
                    .map(ActionStatus::as_str)
                    .unwrap_or("unknown");
                ChatMessage::new(
                    ROLE_USER,
                    format!("Observation from `{action}` ({status}):\n{}", self.content),
                )
            }
            role => ChatMessage::new(role.as_str(), self.content.clone()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn role_round_trips_through_strings() {
        for role in [Role::User, Role::Assistant, Role::Tool, Role::System] {
            assert_eq!(Role::try_from(role.as_str()), Ok(role));
        }
        assert!(Role::try_from("narrator").is_err());
    }

    #[test]
    fn root_messages_use_sentinel_parent() {
        let message = Message::root(Role::User, "hello");
        assert!(message.is_root());
        assert!(message.is_active);
        assert_eq!(message.pid, ROOT_PID);
    }

    #[test]
    fn tool_messages_render_as_observations() {
        let mut message = Message::new("parent", Role::Tool, "exit status 2");
        message.metadata.action_type = Some("terminal_run".to_string());
        message.metadata.status = Some(ActionStatus::Failure);

        let api = message.to_api_message();
        assert_eq!(api.role, ROLE_USER);
        assert_eq!(
            api.content,
            "Observation from `terminal_run` (failure):\nexit status 2"
        );
    }

    #[test]
    fn message_serializes_role_as_plain_string() {
        let message = Message::root(Role::Assistant, "hi").with_id("m1");
        let value = serde_json::to_value(&message).expect("serialize");
        assert_eq!(value["role"], "assistant");
        assert_eq!(value["pid"], ROOT_PID);
        let back: Message = serde_json::from_value(value).expect("deserialize");
        assert_eq!(back, message);
    }
}
