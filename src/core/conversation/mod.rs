//! Conversation persistence and the message forest.

pub mod file_store;
pub mod store;
pub mod tree;

pub use file_store::JsonFileConversationStore;
pub use store::{Conversation, ConversationStore, InMemoryConversationStore, StoreError};
pub use tree::{active_path, build_forest, switch_branch, MessageForest, TreeError};
