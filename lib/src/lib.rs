//! Tether Agent Library
//!
//! An Agent Client Protocol (ACP) adapter: a long-lived agent process
//! bridging an external coding assistant to an editor acting as ACP
//! client. Speaks JSON-RPC 2.0 over newline-delimited stdio and a
//! single-shot HTTP surface, and brokers bidirectional traffic: inbound
//! initialize/session/prompt/tool calls, and outbound file, terminal,
//! permission, and session-update traffic back into the client.

pub mod agent;
pub mod bridge;
pub mod config;
pub mod error;
pub mod extensions;
pub mod fs_client;
pub mod fs_tools;
pub mod permissions;
pub mod pool;
pub mod protocol;
pub mod rpc;
pub mod server;
pub mod session;
pub mod terminal_exec;
pub mod terminal_manager;
pub mod tool_calls;
pub mod tools;
pub mod transport;
pub mod validation_utils;

pub use agent::Agent;
pub use bridge::{AssistantBridge, EchoBridge};
pub use config::AgentConfig;
pub use error::{AgentError, Result};
pub use server::AgentServer;
