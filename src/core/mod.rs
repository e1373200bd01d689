pub mod action;
pub mod chat_stream;
pub mod config;
pub mod context;
pub mod conversation;
pub mod dispatch;
pub mod forward;
pub mod message;
pub mod orchestrator;
pub mod prompts;
pub mod provider;
pub mod router;
pub mod thinking;
pub mod tokens;
