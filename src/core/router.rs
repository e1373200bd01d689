//! Local-versus-forward execution routing.

use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;

use crate::core::conversation::{ConversationStore, StoreError};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelDescriptor {
    pub model: Option<String>,
    /// Bound to the subscription sub-server.
    pub subscription: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionPath {
    Local,
    Forward,
}

impl ExecutionPath {
    pub fn as_str(self) -> &'static str {
        match self {
            ExecutionPath::Local => "local",
            ExecutionPath::Forward => "forward",
        }
    }
}

#[derive(Debug, Error)]
pub enum RouterError {
    #[error("no default model is recorded for conversation {0}")]
    MissingConversation(String),
    #[error("default model lookup failed for conversation {conversation_id}: {source}")]
    Lookup {
        conversation_id: String,
        #[source]
        source: StoreError,
    },
}

/// Where the per-conversation default-model binding lives.
#[async_trait]
pub trait DefaultModelSource: Send + Sync {
    async fn default_model(&self, conversation_id: &str) -> Result<ModelDescriptor, RouterError>;
}

/// Reads the binding straight from the conversation record.
pub struct StoreModelSource {
    store: Arc<dyn ConversationStore>,
}

impl StoreModelSource {
    pub fn new(store: Arc<dyn ConversationStore>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl DefaultModelSource for StoreModelSource {
    async fn default_model(&self, conversation_id: &str) -> Result<ModelDescriptor, RouterError> {
        let conversation = self
            .store
            .get(conversation_id)
            .await
            .map_err(|source| RouterError::Lookup {
                conversation_id: conversation_id.to_string(),
                source,
            })?
            .ok_or_else(|| RouterError::MissingConversation(conversation_id.to_string()))?;
        Ok(ModelDescriptor {
            model: conversation.default_model,
            subscription: conversation.subscription,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouteDecision {
    pub path: ExecutionPath,
    pub descriptor: ModelDescriptor,
}

/// Decides per request whether work runs against the provider directly or
/// is forwarded. Nothing is cached: a binding changed between two requests
/// is honoured by the second one.
pub struct ModelRouter {
    source: Arc<dyn DefaultModelSource>,
}

impl ModelRouter {
    pub fn new(source: Arc<dyn DefaultModelSource>) -> Self {
        Self { source }
    }

    pub async fn choose_execution_path(
        &self,
        conversation_id: &str,
    ) -> Result<RouteDecision, RouterError> {
        let descriptor = self.source.default_model(conversation_id).await?;
        let path = if descriptor.subscription {
            ExecutionPath::Forward
        } else {
            ExecutionPath::Local
        };
        tracing::debug!(conversation_id, path = path.as_str(), "Route decided");
        Ok(RouteDecision { path, descriptor })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::conversation::InMemoryConversationStore;

    #[tokio::test]
    async fn subscription_binding_selects_forward_path() {
        let store = Arc::new(InMemoryConversationStore::new());
        store.get_or_create("c1").await.expect("create");
        let router = ModelRouter::new(Arc::new(StoreModelSource::new(store.clone())));

        let decision = router.choose_execution_path("c1").await.expect("route");
        assert_eq!(decision.path, ExecutionPath::Local);

        store
            .set_subscription("c1", true, Some("pro".into()))
            .await
            .expect("bind");
        let decision = router.choose_execution_path("c1").await.expect("route");
        assert_eq!(decision.path, ExecutionPath::Forward);
        assert_eq!(decision.descriptor.model.as_deref(), Some("pro"));
    }

    #[tokio::test]
    async fn lookup_failures_are_surfaced_not_defaulted() {
        let store = Arc::new(InMemoryConversationStore::new());
        let router = ModelRouter::new(Arc::new(StoreModelSource::new(store)));
        let err = router.choose_execution_path("missing").await.unwrap_err();
        assert!(matches!(err, RouterError::MissingConversation(id) if id == "missing"));
    }

    struct FailingSource;

    #[async_trait]
    impl DefaultModelSource for FailingSource {
        async fn default_model(&self, conversation_id: &str) -> Result<ModelDescriptor, RouterError> {
            Err(RouterError::Lookup {
                conversation_id: conversation_id.to_string(),
                source: StoreError::Io(std::io::Error::other("disk gone")),
            })
        }
    }

    #[tokio::test]
    async fn source_errors_propagate() {
        let router = ModelRouter::new(Arc::new(FailingSource));
        let err = router.choose_execution_path("c1").await.unwrap_err();
        assert!(err.to_string().contains("disk gone"));
    }
}
