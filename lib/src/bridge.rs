//! Facade over the upstream coding assistant
//!
//! The assistant process itself is an external collaborator; the core
//! only sees this trait. A prompt turn streams [`BridgeEvent`]s: text
//! chunks are forwarded to the client as `agent_message_chunk` updates,
//! and tool requests are looped through the dispatcher, with the result
//! handed back so the assistant can continue.

use crate::protocol::StopReason;
use crate::session::Session;
use crate::tools::ToolExecution;
use crate::Result;
use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::{mpsc, oneshot};

/// Identity advertised in the `initialize` response meta.
#[derive(Debug, Clone)]
pub struct BridgeInfo {
    pub name: String,
    pub version: String,
}

/// Authentication state as the assistant reports it.
#[derive(Debug, Clone)]
pub struct AuthStatus {
    pub authenticated: bool,
    pub method: Option<String>,
}

/// One event in a streaming prompt turn.
#[derive(Debug)]
pub enum BridgeEvent {
    /// A chunk of assistant output text.
    Chunk(String),
    /// The assistant wants a tool executed; the execution result is sent
    /// back on `respond`.
    ToolRequest {
        name: String,
        parameters: Value,
        respond: oneshot::Sender<ToolExecution>,
    },
}

/// The upstream assistant, reduced to what the adapter needs.
#[async_trait]
pub trait AssistantBridge: Send + Sync {
    fn info(&self) -> BridgeInfo;

    async fn version(&self) -> Result<String>;

    async fn check_auth(&self) -> Result<AuthStatus>;

    /// Run one prompt turn, emitting events until the turn ends.
    async fn prompt(
        &self,
        session: &Session,
        prompt: String,
        events: mpsc::Sender<BridgeEvent>,
    ) -> Result<StopReason>;

    async fn close(&self) -> Result<()>;
}

/// Development bridge: echoes the prompt back as a single chunk. Useful
/// for wiring checks and demos without an assistant installed.
pub struct EchoBridge;

#[async_trait]
impl AssistantBridge for EchoBridge {
    fn info(&self) -> BridgeInfo {
        BridgeInfo {
            name: "echo".to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }

    async fn version(&self) -> Result<String> {
        Ok(env!("CARGO_PKG_VERSION").to_string())
    }

    async fn check_auth(&self) -> Result<AuthStatus> {
        Ok(AuthStatus {
            authenticated: true,
            method: None,
        })
    }

    async fn prompt(
        &self,
        _session: &Session,
        prompt: String,
        events: mpsc::Sender<BridgeEvent>,
    ) -> Result<StopReason> {
        let _ = events.send(BridgeEvent::Chunk(prompt)).await;
        Ok(StopReason::EndTurn)
    }

    async fn close(&self) -> Result<()> {
        Ok(())
    }
}
