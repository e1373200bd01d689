use crate::core::config::data::{path_display, Config};

impl Config {
    pub fn print_all(&self) {
        println!("Current configuration:");
        println!("  provider.base-url: {}", self.provider.base_url);
        println!("  provider.model: {}", self.provider.model);
        println!("  provider.api-key-env: {}", self.provider.api_key_env);
        match &self.sub_server.domain {
            Some(domain) => println!("  sub-server: {domain}"),
            None => println!("  sub-server: (unset)"),
        }
        println!("  agent.max-steps: {}", self.agent.max_steps);
        println!("  agent.tool-concurrency: {}", self.agent.tool_concurrency);
        match &self.agent.workspace_root {
            Some(root) => println!("  agent.workspace-root: {}", path_display(root)),
            None => println!("  agent.workspace-root: (current directory)"),
        }
        if self.mcp_servers.is_empty() {
            println!("  mcp-servers: (none configured)");
        } else {
            println!("  mcp-servers:");
            for server in &self.mcp_servers {
                let state = if server.is_active() { "on" } else { "off" };
                println!("    {} ({}): {state}", server.id, server.display_name());
            }
        }
    }
}
