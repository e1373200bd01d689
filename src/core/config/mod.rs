pub mod data;
pub mod defaults;
pub mod io;
pub mod printing;

pub use data::{path_display, AgentSettings, Config, McpServerConfig, ProviderSettings, SubServerSettings};
pub use io::{load_mcp_servers_file, ConfigError};
