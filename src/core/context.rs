use tokio_util::sync::CancellationToken;

/// Per-request state threaded through every operation.
///
/// The bearer token travels with the request that owns it; nothing in the
/// crate keeps a process-wide "current token".
#[derive(Debug, Clone, Default)]
pub struct RequestContext {
    pub conversation_id: String,
    pub auth_token: Option<String>,
    /// Explicit MCP server allow-list. `None` means every active server.
    pub mcp_server_ids: Option<Vec<String>>,
    pub signal: CancellationToken,
}

impl RequestContext {
    pub fn new(conversation_id: impl Into<String>) -> Self {
        Self {
            conversation_id: conversation_id.into(),
            ..Self::default()
        }
    }

    pub fn with_auth_token(mut self, token: impl Into<String>) -> Self {
        self.auth_token = Some(token.into());
        self
    }

    pub fn with_mcp_servers(mut self, ids: Vec<String>) -> Self {
        self.mcp_server_ids = Some(ids);
        self
    }

    pub fn with_signal(mut self, signal: CancellationToken) -> Self {
        self.signal = signal;
        self
    }

    pub fn is_cancelled(&self) -> bool {
        self.signal.is_cancelled()
    }
}
