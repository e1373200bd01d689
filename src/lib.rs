//! Conduit is the agent completion and tool-execution core of a chat backend.
//!
//! The crate is organized around a small set of collaborating layers:
//! - [`core`] owns conversations, token accounting, model routing, the
//!   streaming completion engine, action dispatch and the orchestrator that
//!   ties them together.
//! - [`tools`] holds the tool contract, the explicit registry and the
//!   built-in local tools, plus the proxy onto MCP servers.
//! - [`mcp`] provides the Model Context Protocol client and its stdio and
//!   streamable HTTP transports.
//! - [`api`] defines the OpenAI-compatible chat payloads.
//!
//! The binary (`src/main.rs`) routes through [`crate::cli::main`].

pub mod api;
pub mod cli;
pub mod core;
pub mod mcp;
pub mod tools;
pub mod utils;
