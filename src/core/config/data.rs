use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};

use crate::core::config::defaults;

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct ProviderSettings {
    #[serde(default = "defaults::provider_base_url")]
    pub base_url: String,
    #[serde(default = "defaults::provider_model")]
    pub model: String,
    /// Environment variable holding the provider API key.
    #[serde(default = "defaults::provider_api_key_env")]
    pub api_key_env: String,
}

impl Default for ProviderSettings {
    fn default() -> Self {
        Self {
            base_url: defaults::provider_base_url(),
            model: defaults::provider_model(),
            api_key_env: defaults::provider_api_key_env(),
        }
    }
}

impl ProviderSettings {
    pub fn api_key(&self) -> Option<String> {
        std::env::var(&self.api_key_env)
            .ok()
            .filter(|key| !key.trim().is_empty())
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct SubServerSettings {
    pub domain: Option<String>,
    #[serde(default = "defaults::sub_server_timeout_seconds")]
    pub timeout_seconds: u64,
}

impl Default for SubServerSettings {
    fn default() -> Self {
        Self {
            domain: None,
            timeout_seconds: defaults::sub_server_timeout_seconds(),
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct AgentSettings {
    /// Upper bound on tool round trips per chat completion.
    #[serde(default = "defaults::agent_max_steps")]
    pub max_steps: usize,
    #[serde(default = "defaults::agent_tool_concurrency")]
    pub tool_concurrency: usize,
    #[serde(default = "defaults::agent_terminal_timeout_seconds")]
    pub terminal_timeout_seconds: u64,
    /// Root for file and terminal tools; the working directory when unset.
    pub workspace_root: Option<PathBuf>,
}

impl Default for AgentSettings {
    fn default() -> Self {
        Self {
            max_steps: defaults::agent_max_steps(),
            tool_concurrency: defaults::agent_tool_concurrency(),
            terminal_timeout_seconds: defaults::agent_terminal_timeout_seconds(),
            workspace_root: None,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Default)]
pub struct McpServerConfig {
    pub id: String,
    #[serde(default, alias = "display_name")]
    pub name: String,
    /// `stdio` or `streamable-http` (the default).
    pub transport: Option<String>,
    pub base_url: Option<String>,
    pub command: Option<String>,
    pub args: Option<Vec<String>>,
    pub env: Option<HashMap<String, String>>,
    pub headers: Option<HashMap<String, String>>,
    pub allowed_tools: Option<Vec<String>>,
    pub protocol_version: Option<String>,
    /// Only servers with `activate = true` are eligible for dispatch.
    #[serde(alias = "enabled")]
    pub activate: Option<bool>,
}

impl McpServerConfig {
    pub fn is_active(&self) -> bool {
        self.activate.unwrap_or(false)
    }

    pub fn display_name(&self) -> &str {
        if self.name.trim().is_empty() {
            &self.id
        } else {
            &self.name
        }
    }

    /// Whether `tool` passes the server's allow-list (no list allows all).
    pub fn allows_tool(&self, tool: &str) -> bool {
        match &self.allowed_tools {
            Some(allowed) => allowed.iter().any(|name| name.eq_ignore_ascii_case(tool)),
            None => true,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Default, Clone, PartialEq)]
pub struct Config {
    #[serde(default)]
    pub provider: ProviderSettings,
    #[serde(default)]
    pub sub_server: SubServerSettings,
    #[serde(default)]
    pub agent: AgentSettings,
    #[serde(default)]
    pub mcp_servers: Vec<McpServerConfig>,
    /// Extra MCP server descriptors kept in a standalone JSON or TOML file.
    pub mcp_servers_file: Option<PathBuf>,
    /// Directory for the JSON conversation store.
    pub conversations_dir: Option<PathBuf>,
}

impl Config {
    pub fn get_mcp_server(&self, id: &str) -> Option<&McpServerConfig> {
        self.mcp_servers
            .iter()
            .find(|server| server.id.eq_ignore_ascii_case(id))
    }

    /// Adds servers that are not already configured under the same id.
    pub fn merge_mcp_servers(&mut self, servers: Vec<McpServerConfig>) {
        for server in servers {
            if self.get_mcp_server(&server.id).is_none() {
                self.mcp_servers.push(server);
            }
        }
    }
}

/// Get a user-friendly display string for a path
/// Converts absolute paths to use ~ notation on Unix-like systems when possible
pub fn path_display<P: AsRef<Path>>(path: P) -> String {
    let path = path.as_ref();

    #[cfg(unix)]
    {
        if let Some(home) = std::env::var_os("HOME") {
            let home_path = PathBuf::from(home);
            if let Ok(relative) = path.strip_prefix(&home_path) {
                return format!("~/{}", relative.display());
            }
        }
    }

    path.display().to_string()
}
