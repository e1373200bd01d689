//! Conversation store backed by one JSON document per conversation.

use std::io::Write;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tempfile::NamedTempFile;
use tokio::sync::Mutex;

use crate::core::conversation::store::{Conversation, ConversationStore, StoreError};
use crate::core::conversation::tree;
use crate::core::message::{Message, MessageMetadata};
use crate::core::tokens::TokenUsage;

/// Stores each conversation under `<dir>/<id>.json`.
///
/// All reads and writes go through a single store-wide lock, which makes
/// every read-modify-write (including token increments) atomic with respect
/// to other callers of the same store.
pub struct JsonFileConversationStore {
    dir: PathBuf,
    lock: Mutex<()>,
}

impl JsonFileConversationStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            lock: Mutex::new(()),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, conversation_id: &str) -> PathBuf {
        self.dir
            .join(format!("{}.json", encode_file_stem(conversation_id)))
    }

    async fn load(&self, conversation_id: &str) -> Result<Option<Conversation>, StoreError> {
        let path = self.path_for(conversation_id);
        match tokio::fs::read(&path).await {
            Ok(bytes) => {
                let conversation: Conversation = serde_json::from_slice(&bytes)?;
                if conversation.id != conversation_id {
                    return Err(StoreError::IdMismatch {
                        expected: conversation_id.to_string(),
                        found: conversation.id,
                    });
                }
                Ok(Some(conversation))
            }
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    async fn save(&self, conversation: &Conversation) -> Result<(), StoreError> {
        let contents = serde_json::to_vec_pretty(conversation)?;
        let path = self.path_for(&conversation.id);
        let dir = self.dir.clone();
        tokio::task::spawn_blocking(move || write_atomically(&dir, &path, &contents))
            .await
            .map_err(|err| StoreError::Io(std::io::Error::other(err)))??;
        tracing::debug!(conversation_id = %conversation.id, "Persisted conversation");
        Ok(())
    }

    async fn mutate<T>(
        &self,
        conversation_id: &str,
        apply: impl FnOnce(&mut Conversation) -> Result<T, StoreError> + Send,
    ) -> Result<T, StoreError> {
        let _guard = self.lock.lock().await;
        let mut conversation = self
            .load(conversation_id)
            .await?
            .ok_or_else(|| StoreError::NotFound(conversation_id.to_string()))?;
        let value = apply(&mut conversation)?;
        self.save(&conversation).await?;
        Ok(value)
    }
}

fn write_atomically(dir: &Path, path: &Path, contents: &[u8]) -> Result<(), std::io::Error> {
    std::fs::create_dir_all(dir)?;
    let mut temp_file = NamedTempFile::new_in(dir)?;
    temp_file.write_all(contents)?;
    temp_file.as_file_mut().sync_all()?;
    temp_file.persist(path).map_err(|err| err.error)?;
    Ok(())
}

/// Maps an opaque conversation id onto a safe, collision-free file stem.
///
/// ASCII alphanumerics, `-` and `_` are kept; every other byte (including
/// `%` itself) is written as `%XX`, so distinct ids never share a file.
fn encode_file_stem(id: &str) -> String {
    let mut stem = String::with_capacity(id.len());
    for byte in id.bytes() {
        if byte.is_ascii_alphanumeric() || byte == b'-' || byte == b'_' {
            stem.push(char::from(byte));
        } else {
            stem.push_str(&format!("%{byte:02X}"));
        }
    }
    if stem.is_empty() {
        // The encoding of a non-empty id never starts with `%%`.
        "%%".to_string()
    } else {
        stem
    }
}

#[async_trait]
impl ConversationStore for JsonFileConversationStore {
    async fn get(&self, conversation_id: &str) -> Result<Option<Conversation>, StoreError> {
        let _guard = self.lock.lock().await;
        self.load(conversation_id).await
    }

    async fn get_or_create(&self, conversation_id: &str) -> Result<Conversation, StoreError> {
        let _guard = self.lock.lock().await;
        if let Some(existing) = self.load(conversation_id).await? {
            return Ok(existing);
        }
        let conversation = Conversation::new(conversation_id);
        self.save(&conversation).await?;
        Ok(conversation)
    }

    async fn append_message(
        &self,
        conversation_id: &str,
        message: Message,
    ) -> Result<Message, StoreError> {
        self.mutate(conversation_id, |conversation| {
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
        self.mutate(conversation_id, |conversation| {
            conversation.update_message(message_id, content, metadata)
        })
        .await
    }

    async fn add_token_usage(
        &self,
        conversation_id: &str,
        usage: TokenUsage,
    ) -> Result<TokenUsage, StoreError> {
        self.mutate(conversation_id, |conversation| {
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
        self.mutate(conversation_id, |conversation| {
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
        self.mutate(conversation_id, |conversation| {
            tree::switch_branch(&mut conversation.messages, message_id).map_err(StoreError::from)
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::message::Role;
    use std::sync::Arc;

    #[test]
    fn ids_are_encoded_into_distinct_file_stems() {
        assert_eq!(encode_file_stem("c1"), "c1");
        assert_eq!(encode_file_stem("team_a"), "team_a");
        assert_eq!(encode_file_stem("team/a"), "team%2Fa");
        assert_eq!(encode_file_stem("team.a"), "team%2Ea");
        assert_eq!(encode_file_stem("../etc"), "%2E%2E%2Fetc");
        assert_eq!(encode_file_stem("100%"), "100%25");
        assert_eq!(encode_file_stem("é"), "%C3%A9");
        assert_eq!(encode_file_stem(""), "%%");
    }

    #[tokio::test]
    async fn similar_ids_keep_separate_records() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = JsonFileConversationStore::new(dir.path());

        store.get_or_create("team/a").await.expect("create");
        store
            .add_token_usage("team/a", TokenUsage::new(5, 5))
            .await
            .expect("usage");

        assert!(store.get("team_a").await.expect("get").is_none());
        assert!(store.get("team.a").await.expect("get").is_none());

        let other = store.get_or_create("team_a").await.expect("create other");
        assert_eq!(other.id, "team_a");
        assert_eq!(other.usage(), TokenUsage::default());

        let original = store.get("team/a").await.expect("get").expect("exists");
        assert_eq!(original.id, "team/a");
        assert_eq!(original.usage(), TokenUsage::new(5, 5));
    }

    #[tokio::test]
    async fn records_filed_under_another_id_are_rejected() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = JsonFileConversationStore::new(dir.path());
        store.get_or_create("c1").await.expect("create");
        std::fs::copy(dir.path().join("c1.json"), dir.path().join("c2.json")).expect("copy");

        let err = store.get("c2").await.expect_err("mismatched id");
        assert!(matches!(
            err,
            StoreError::IdMismatch { ref expected, ref found } if expected == "c2" && found == "c1"
        ));
        assert!(store
            .add_token_usage("c2", TokenUsage::new(1, 1))
            .await
            .is_err());
    }

    #[tokio::test]
    async fn conversations_survive_a_new_store_instance() {
        let dir = tempfile::tempdir().expect("tempdir");
        {
            let store = JsonFileConversationStore::new(dir.path());
            store.get_or_create("c1").await.expect("create");
            store
                .append_message("c1", Message::root(Role::User, "list files").with_id("u1"))
                .await
                .expect("append");
            store
                .add_token_usage("c1", TokenUsage::new(10, 4))
                .await
                .expect("usage");
        }

        let reopened = JsonFileConversationStore::new(dir.path());
        let conversation = reopened.get("c1").await.expect("get").expect("exists");
        assert_eq!(conversation.messages.len(), 1);
        assert_eq!(conversation.messages[0].content, "list files");
        assert_eq!(conversation.usage(), TokenUsage::new(10, 4));
        assert!(dir.path().join("c1.json").exists());
    }

    #[tokio::test]
    async fn concurrent_increments_serialize_through_the_lock() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = Arc::new(JsonFileConversationStore::new(dir.path()));
        store.get_or_create("c1").await.expect("create");

        let tasks: Vec<_> = (0..10)
            .map(|_| {
                let store = Arc::clone(&store);
                tokio::spawn(async move {
                    store
                        .add_token_usage("c1", TokenUsage::new(1, 2))
                        .await
                        .expect("increment")
                })
            })
            .collect();
        for task in tasks {
            task.await.expect("join");
        }

        let conversation = store.get("c1").await.expect("get").expect("exists");
        assert_eq!(conversation.usage(), TokenUsage::new(10, 20));
    }

    #[tokio::test]
    async fn corrupt_records_surface_as_errors() {
        let dir = tempfile::tempdir().expect("tempdir");
        std::fs::write(dir.path().join("bad.json"), b"{not json").expect("write");
        let store = JsonFileConversationStore::new(dir.path());
        assert!(matches!(store.get("bad").await, Err(StoreError::Serde(_))));
    }
}
