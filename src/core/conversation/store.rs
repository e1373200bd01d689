use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::RwLock;

use crate::core::conversation::tree::{self, TreeError};
use crate::core::message::{Message, MessageMetadata, ROOT_PID};
use crate::core::tokens::TokenUsage;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("conversation {0} not found")]
    NotFound(String),
    #[error("message {message_id} not found in conversation {conversation_id}")]
    UnknownMessage {
        conversation_id: String,
        message_id: String,
    },
    #[error("parent {pid} does not exist in conversation {conversation_id}")]
    UnknownParent {
        conversation_id: String,
        pid: String,
    },
    #[error("message {message_id} already exists in conversation {conversation_id}")]
    DuplicateMessage {
        conversation_id: String,
        message_id: String,
    },
    #[error(transparent)]
    Tree(#[from] TreeError),
    #[error("conversation storage I/O failed: {0}")]
    Io(#[from] std::io::Error),
    #[error("stored record for conversation {expected} belongs to {found}")]
    IdMismatch { expected: String, found: String },
    #[error("conversation record is malformed: {0}")]
    Serde(#[from] serde_json::Error),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Conversation {
    pub id: String,
    #[serde(default)]
    pub messages: Vec<Message>,
    #[serde(default)]
    pub input_tokens: u64,
    #[serde(default)]
    pub output_tokens: u64,
    /// Bound to the forwarded subscription sub-server.
    #[serde(default)]
    pub subscription: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_model: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl Conversation {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            messages: Vec::new(),
            input_tokens: 0,
            output_tokens: 0,
            subscription: false,
            default_model: None,
            created_at: Utc::now(),
        }
    }

    pub fn usage(&self) -> TokenUsage {
        TokenUsage::new(self.input_tokens, self.output_tokens)
    }

    pub fn message(&self, id: &str) -> Option<&Message> {
        self.messages.iter().find(|message| message.id == id)
    }

    pub fn active_path(&self) -> Result<Vec<&Message>, TreeError> {
        tree::active_path(&self.messages)
    }

    /// Id of the deepest message on the active branch.
    pub fn active_leaf_id(&self) -> Result<Option<String>, TreeError> {
        Ok(self.active_path()?.last().map(|message| message.id.clone()))
    }

    /// Validates and appends `message`.
    ///
    /// An active message deactivates its siblings so the active branch stays
    /// a single path.
    pub fn push_message(&mut self, message: Message) -> Result<(), StoreError> {
        if self.message(&message.id).is_some() {
            return Err(StoreError::DuplicateMessage {
                conversation_id: self.id.clone(),
                message_id: message.id,
            });
        }
        if message.pid != ROOT_PID && self.message(&message.pid).is_none() {
            return Err(StoreError::UnknownParent {
                conversation_id: self.id.clone(),
                pid: message.pid,
            });
        }
        if message.is_active {
            for sibling in self
                .messages
                .iter_mut()
                .filter(|existing| existing.pid == message.pid)
            {
                sibling.is_active = false;
            }
        }
        self.messages.push(message);
        Ok(())
    }

    pub fn update_message(
        &mut self,
        message_id: &str,
        content: String,
        metadata: Option<MessageMetadata>,
    ) -> Result<Message, StoreError> {
        let conversation_id = self.id.clone();
        let message = self
            .messages
            .iter_mut()
            .find(|message| message.id == message_id)
            .ok_or_else(|| StoreError::UnknownMessage {
                conversation_id,
                message_id: message_id.to_string(),
            })?;
        message.content = content;
        if let Some(metadata) = metadata {
            message.metadata = metadata;
        }
        Ok(message.clone())
    }

    pub fn record_usage(&mut self, usage: TokenUsage) -> TokenUsage {
        self.input_tokens = self.input_tokens.saturating_add(usage.input_tokens);
        self.output_tokens = self.output_tokens.saturating_add(usage.output_tokens);
        self.usage()
    }
}

/// Persistence for conversations. Append and update only; nothing is deleted.
///
/// Implementations apply every mutation under their own lock, so concurrent
/// callers never lose token-counter increments.
#[async_trait]
pub trait ConversationStore: Send + Sync {
    async fn get(&self, conversation_id: &str) -> Result<Option<Conversation>, StoreError>;

    async fn get_or_create(&self, conversation_id: &str) -> Result<Conversation, StoreError>;

    async fn append_message(
        &self,
        conversation_id: &str,
        message: Message,
    ) -> Result<Message, StoreError>;

    async fn update_message(
        &self,
        conversation_id: &str,
        message_id: &str,
        content: String,
        metadata: Option<MessageMetadata>,
    ) -> Result<Message, StoreError>;

    /// Atomically adds `usage` to the conversation counters and returns the
    /// new totals.
    async fn add_token_usage(
        &self,
        conversation_id: &str,
        usage: TokenUsage,
    ) -> Result<TokenUsage, StoreError>;

    async fn set_subscription(
        &self,
        conversation_id: &str,
        subscription: bool,
        default_model: Option<String>,
    ) -> Result<(), StoreError>;

    async fn switch_branch(&self, conversation_id: &str, message_id: &str)
        -> Result<(), StoreError>;
}

#[derive(Default)]
pub struct InMemoryConversationStore {
    conversations: RwLock<HashMap<String, Conversation>>,
}

impl InMemoryConversationStore {
    pub fn new() -> Self {
        Self::default()
    }

    async fn with_conversation<T>(
        &self,
        conversation_id: &str,
        mutate: impl FnOnce(&mut Conversation) -> Result<T, StoreError> + Send,
    ) -> Result<T, StoreError> {
        let mut conversations = self.conversations.write().await;
        let conversation = conversations
            .get_mut(conversation_id)
            .ok_or_else(|| StoreError::NotFound(conversation_id.to_string()))?;
        mutate(conversation)
    }
}

#[async_trait]
impl ConversationStore for InMemoryConversationStore {
    async fn get(&self, conversation_id: &str) -> Result<Option<Conversation>, StoreError> {
        Ok(self.conversations.read().await.get(conversation_id).cloned())
    }

    async fn get_or_create(&self, conversation_id: &str) -> Result<Conversation, StoreError> {
        let mut conversations = self.conversations.write().await;
        let conversation = conversations
            .entry(conversation_id.to_string())
            .or_insert_with(|| Conversation::new(conversation_id));
        Ok(conversation.clone())
    }

    async fn append_message(
        &self,
        conversation_id: &str,
        message: Message,
    ) -> Result<Message, StoreError> {
        self.with_conversation(conversation_id, |conversation| {
            conversation.push_message(message.clone())?;
            Ok(message)
        })
        .await
    }

    async fn update_message(
        &self,
        conversation_id: &str,
        message_id: &str,
        content: String,
        metadata: Option<MessageMetadata>,
    ) -> Result<Message, StoreError> {
        self.with_conversation(conversation_id, |conversation| {
            conversation.update_message(message_id, content, metadata)
        })
        .await
    }

    async fn add_token_usage(
        &self,
        conversation_id: &str,
        usage: TokenUsage,
    ) -> Result<TokenUsage, StoreError> {
        self.with_conversation(conversation_id, |conversation| {
            Ok(conversation.record_usage(usage))
        })
        .await
    }

    async fn set_subscription(
        &self,
        conversation_id: &str,
        subscription: bool,
        default_model: Option<String>,
    ) -> Result<(), StoreError> {
        self.with_conversation(conversation_id, |conversation| {
            conversation.subscription = subscription;
            conversation.default_model = default_model;
            Ok(())
        })
        .await
    }

    async fn switch_branch(
        &self,
        conversation_id: &str,
        message_id: &str,
    ) -> Result<(), StoreError> {
        self.with_conversation(conversation_id, |conversation| {
            Ok(tree::switch_branch(&mut conversation.messages, message_id)?)
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::message::Role;
    use std::sync::Arc;

    #[tokio::test]
    async fn append_validates_parent_and_deactivates_siblings() {
        let store = InMemoryConversationStore::new();
        store.get_or_create("c1").await.expect("create");

        let root = store
            .append_message("c1", Message::root(Role::User, "hello").with_id("u1"))
            .await
            .expect("root");
        store
            .append_message("c1", Message::new(&root.id, Role::Assistant, "v1").with_id("a1"))
            .await
            .expect("first reply");
        store
            .append_message("c1", Message::new(&root.id, Role::Assistant, "v2").with_id("a2"))
            .await
            .expect("regenerated reply");

        let conversation = store.get("c1").await.expect("get").expect("exists");
        let path: Vec<&str> = conversation
            .active_path()
            .expect("path")
            .iter()
            .map(|message| message.id.as_str())
            .collect();
        assert_eq!(path, vec!["u1", "a2"]);
        assert!(!conversation.message("a1").expect("a1").is_active);

        let err = store
            .append_message("c1", Message::new("nope", Role::User, "x"))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::UnknownParent { .. }));

        let err = store
            .append_message("c1", Message::root(Role::User, "again").with_id("u1"))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::DuplicateMessage { .. }));
    }

    #[tokio::test]
    async fn missing_conversation_is_reported() {
        let store = InMemoryConversationStore::new();
        let err = store
            .add_token_usage("ghost", TokenUsage::new(1, 1))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::NotFound(id) if id == "ghost"));
        assert!(store.get("ghost").await.expect("get").is_none());
    }

    #[tokio::test]
    async fn concurrent_usage_increments_are_not_lost() {
        let store = Arc::new(InMemoryConversationStore::new());
        store.get_or_create("c1").await.expect("create");

        let mut handles = Vec::new();
        for _ in 0..50 {
            let store = Arc::clone(&store);
            handles.push(tokio::spawn(async move {
                store
                    .add_token_usage("c1", TokenUsage::new(2, 3))
                    .await
                    .expect("increment");
            }));
        }
        for handle in handles {
            handle.await.expect("join");
        }

        let conversation = store.get("c1").await.expect("get").expect("exists");
        assert_eq!(conversation.usage(), TokenUsage::new(100, 150));
    }

    #[tokio::test]
    async fn update_and_subscription_changes_persist() {
        let store = InMemoryConversationStore::new();
        store.get_or_create("c1").await.expect("create");
        store
            .append_message("c1", Message::root(Role::User, "draft").with_id("m1"))
            .await
            .expect("append");

        let updated = store
            .update_message("c1", "m1", "final".to_string(), None)
            .await
            .expect("update");
        assert_eq!(updated.content, "final");

        store
            .set_subscription("c1", true, Some("pro-model".to_string()))
            .await
            .expect("subscription");
        let conversation = store.get("c1").await.expect("get").expect("exists");
        assert!(conversation.subscription);
        assert_eq!(conversation.default_model.as_deref(), Some("pro-model"));
    }
}
