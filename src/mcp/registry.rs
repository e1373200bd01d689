use crate::core::config::{Config, McpServerConfig};

#[derive(Debug, Clone, Default)]
pub struct McpRegistry {
    servers: Vec<McpServerConfig>,
}

impl McpRegistry {
    pub fn from_config(config: &Config) -> Self {
        Self::new(config.mcp_servers.clone())
    }

    /// Keeps only active servers; later duplicates of an id are ignored.
    pub fn new(servers: Vec<McpServerConfig>) -> Self {
        let mut kept: Vec<McpServerConfig> = Vec::new();
        for server in servers.into_iter().filter(McpServerConfig::is_active) {
            if kept.iter().any(|existing| existing.id.eq_ignore_ascii_case(&server.id)) {
                tracing::warn!(server_id = %server.id, "Ignoring duplicate MCP server id");
                continue;
            }
            kept.push(server);
        }
        Self { servers: kept }
    }

    pub fn servers(&self) -> &[McpServerConfig] {
        &self.servers
    }

    pub fn find_server(&self, id: &str) -> Option<&McpServerConfig> {
        self.servers
            .iter()
            .find(|server| server.id.eq_ignore_ascii_case(id))
    }

    /// Active servers, restricted to `ids` when the caller names them.
    pub fn select(&self, ids: Option<&[String]>) -> Vec<McpServerConfig> {
        match ids {
            Some(ids) => ids
                .iter()
                .filter_map(|id| self.find_server(id))
                .cloned()
                .collect(),
            None => self.servers.clone(),
        }
    }
}
