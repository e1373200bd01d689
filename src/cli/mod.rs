//! Command-line interface parsing and handling
//!
//! The binary is a thin manual front end over the library: it loads the
//! configuration, wires the provider, tools and MCP client together, and runs
//! one operation per invocation.

use std::error::Error;
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;

use crate::core::action::ActionStatus;
use crate::core::chat_stream::CompletionEngine;
use crate::core::config::Config;
use crate::core::context::RequestContext;
use crate::core::conversation::{ConversationStore, JsonFileConversationStore};
use crate::core::dispatch::ActionDispatcher;
use crate::core::forward::SubServerClient;
use crate::core::orchestrator::{AgentEvent, Orchestrator};
use crate::core::provider::OpenAiProvider;
use crate::mcp::client::McpClient;
use crate::mcp::McpService;
use crate::tools::{builtin_registry, ToolRegistry};
use crate::utils::logging::init_tracing;

const LONG_VERSION: &str = concat!(
    env!("CARGO_PKG_VERSION"),
    "\ncommit: ",
    env!("VERGEN_GIT_SHA"),
    "\ndescribe: ",
    env!("VERGEN_GIT_DESCRIBE"),
    "\nbuilt: ",
    env!("VERGEN_BUILD_TIMESTAMP"),
    "\nrustc: ",
    env!("VERGEN_RUSTC_SEMVER"),
);

#[derive(Parser)]
#[command(name = "conduit")]
#[command(version, long_version = LONG_VERSION)]
#[command(about = "Agent completion and tool-execution core")]
#[command(
    long_about = "Conduit routes agent requests to a chat-completion provider or a subscription \
sub-server, streams the reply, and runs the tools the model asks for: local terminal and file \
tools, web fetches, and tools exposed by MCP servers.\n\n\
Environment Variables:\n\
  OPENAI_API_KEY    Provider API key (the variable name is configurable)\n\
  CONDUIT_LOG       Log filter, e.g. `conduit=debug` (falls back to RUST_LOG)"
)]
pub struct Args {
    #[command(subcommand)]
    pub command: Commands,

    /// Use this configuration file instead of the default location
    #[arg(short = 'c', long, global = true, value_name = "PATH")]
    pub config: Option<PathBuf>,

    /// Write logs to this file instead of stderr
    #[arg(short = 'l', long, global = true, value_name = "PATH")]
    pub log_file: Option<PathBuf>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run the agent loop for a goal and stream the reply
    Chat {
        /// What the agent should do
        #[arg(required = true, trailing_var_arg = true)]
        goal: Vec<String>,
        /// Conversation to continue (a new one is started otherwise)
        #[arg(long, value_name = "ID")]
        conversation: Option<String>,
        /// Restrict MCP tools to these server ids
        #[arg(long = "mcp-server", value_name = "ID")]
        mcp_servers: Vec<String>,
        /// Bearer token for the subscription sub-server
        #[arg(long, env = "CONDUIT_AUTH_TOKEN", hide_env_values = true)]
        auth_token: Option<String>,
    },
    /// Inspect configured MCP servers
    Mcp {
        #[command(subcommand)]
        command: McpCommands,
    },
    /// List the tools offered to the model
    Tools,
    /// Print the effective configuration
    Config,
}

#[derive(Subcommand)]
pub enum McpCommands {
    /// List active MCP servers
    List,
    /// Connect to a server and report whether the handshake succeeds
    Check {
        /// Server id
        id: String,
    },
    /// List the tools a server exposes
    Tools {
        /// Server id
        id: String,
    },
}

pub fn main() -> Result<(), Box<dyn Error>> {
    tokio::runtime::Runtime::new()?.block_on(async_main())
}

async fn async_main() -> Result<(), Box<dyn Error>> {
    let args = Args::parse();
    init_tracing(args.log_file.as_deref())?;

    let config_path = match args.config {
        Some(path) => path,
        None => Config::default_config_path()?,
    };
    let config = Config::load_with_servers_file(&config_path)?;

    match args.command {
        Commands::Config => {
            config.print_all();
            Ok(())
        }
        Commands::Mcp { command } => run_mcp(&config, command).await,
        Commands::Tools => {
            let (registry, _) = build_registry(&config)?;
            let ctx = RequestContext::new("cli");
            for definition in registry.definitions(&ctx).await {
                let description = definition.function.description.unwrap_or_default();
                println!("{}  {}", definition.function.name, description);
            }
            Ok(())
        }
        Commands::Chat {
            goal,
            conversation,
            mcp_servers,
            auth_token,
        } => {
            let goal = goal.join(" ");
            run_chat(&config, &goal, conversation, mcp_servers, auth_token).await
        }
    }
}

fn build_registry(config: &Config) -> Result<(ToolRegistry, Arc<McpClient>), Box<dyn Error>> {
    let mcp = Arc::new(McpClient::from_config(config)?);
    let registry = builtin_registry(config, reqwest::Client::new(), mcp.clone())?;
    Ok((registry, mcp))
}

async fn run_mcp(config: &Config, command: McpCommands) -> Result<(), Box<dyn Error>> {
    let client = McpClient::from_config(config)?;
    match command {
        McpCommands::List => {
            let servers = client.list_servers(None);
            if servers.is_empty() {
                println!("No active MCP servers configured.");
            }
            for server in servers {
                let transport = server.transport.as_deref().unwrap_or("streamable-http");
                println!("{}  {}  ({transport})", server.id, server.display_name());
            }
        }
        McpCommands::Check { id } => {
            let server = client
                .registry()
                .find_server(&id)
                .cloned()
                .ok_or_else(|| format!("no active MCP server with id {id}"))?;
            if client.check_connectivity(&server).await {
                println!("{}: reachable", server.id);
            } else {
                println!("{}: unreachable", server.id);
                std::process::exit(1);
            }
        }
        McpCommands::Tools { id } => {
            for tool in client.list_tools(&id).await? {
                println!(
                    "{}  {}",
                    tool.qualified_name(),
                    tool.description.unwrap_or_default()
                );
            }
        }
    }
    Ok(())
}

async fn run_chat(
    config: &Config,
    goal: &str,
    conversation: Option<String>,
    mcp_servers: Vec<String>,
    auth_token: Option<String>,
) -> Result<(), Box<dyn Error>> {
    let http = reqwest::Client::new();
    let (registry, _mcp) = build_registry(config)?;
    let store: Arc<dyn ConversationStore> =
        Arc::new(JsonFileConversationStore::new(config.conversations_path()?));

    let provider = OpenAiProvider::new(
        http.clone(),
        config.provider.base_url.clone(),
        config.provider.api_key(),
    );
    let engine = CompletionEngine::new(Arc::new(provider), config.provider.model.clone());
    let dispatcher =
        ActionDispatcher::new(Arc::new(registry)).with_concurrency(config.agent.tool_concurrency);
    let sub_server = SubServerClient::new(
        http,
        config.sub_server.domain.clone().unwrap_or_default(),
    )
    .with_timeout(Duration::from_secs(config.sub_server.timeout_seconds));
    let orchestrator = Orchestrator::new(store, engine, dispatcher, sub_server)
        .with_max_steps(config.agent.max_steps);

    let conversation_id = conversation.unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
    let signal = CancellationToken::new();
    let mut ctx = RequestContext::new(conversation_id.clone()).with_signal(signal.clone());
    if let Some(token) = auth_token {
        ctx = ctx.with_auth_token(token);
    }
    if !mcp_servers.is_empty() {
        ctx = ctx.with_mcp_servers(mcp_servers);
    }

    let interrupt = tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            signal.cancel();
        }
    });

    let mut stdout = std::io::stdout();
    let outcome = orchestrator
        .chat_completion(goal, &ctx, |event| match event {
            AgentEvent::Token(delta) => {
                let _ = write!(stdout, "{delta}");
                let _ = stdout.flush();
            }
            AgentEvent::ActionStarted { action } => {
                eprintln!("\n→ {}", action.kind);
            }
            AgentEvent::ActionFinished { action, result, .. } => match result.status {
                ActionStatus::Success => eprintln!("✓ {}", action.kind),
                ActionStatus::Failure => eprintln!(
                    "✗ {}: {}",
                    action.kind,
                    result.error.as_deref().unwrap_or("failed")
                ),
            },
        })
        .await;
    interrupt.abort();

    let outcome = outcome?;
    println!();
    eprintln!(
        "conversation {conversation_id}: {} step(s), {} action(s), tokens in/out {}/{}",
        outcome.steps,
        outcome.actions.len(),
        outcome.totals.input_tokens,
        outcome.totals.output_tokens
    );
    Ok(())
}
