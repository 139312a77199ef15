//! Agent orchestrator
//!
//! Wires the transport-facing method table to the session, tool,
//! permission, and terminal subsystems. One `Agent` serves one client
//! connection; reverse calls (fs, terminals) travel the same connection.

use crate::bridge::{AssistantBridge, BridgeEvent};
use crate::config::AgentConfig;
use crate::extensions::ExtensionRegistry;
use crate::fs_client::RpcFsClient;
use crate::fs_tools::FilesystemProvider;
use crate::permissions::{PermissionBroker, PermissionRequest};
use crate::protocol::{ClientCapabilities, ContentBlock, SessionUpdate, StopReason};
use crate::rpc::{MethodHandler, RequestCtx, RpcConnection};
use crate::session::{CreateSessionParams, SessionManager};
use crate::terminal_manager::{RpcTerminalClient, TerminalClient, TerminalManager};
use crate::tool_calls::ToolCallManager;
use crate::tools::{ToolCallRequest, ToolProvider, ToolRegistry};
use crate::validation_utils::validate_cwd_param;
use crate::{AgentError, Result};
use futures::FutureExt;
use serde_json::{json, Value};
use std::future::Future;
use std::sync::Arc;
use tokio::sync::mpsc;

/// Protocol revision this agent speaks.
pub const PROTOCOL_VERSION: &str = "1.0.0";

/// The ACP agent: method handlers plus the components they orchestrate.
pub struct Agent {
    config: AgentConfig,
    sessions: Arc<SessionManager>,
    tool_calls: Arc<ToolCallManager>,
    tools: Arc<ToolRegistry>,
    permissions: Arc<PermissionBroker>,
    terminals: Arc<TerminalManager>,
    extensions: Arc<ExtensionRegistry>,
    fs_provider: Arc<FilesystemProvider>,
    bridge: Arc<dyn AssistantBridge>,
}

impl Agent {
    /// Build an agent bound to one connection. Reverse-call clients (fs,
    /// terminal) ride the same connection the agent serves.
    pub fn new(
        config: AgentConfig,
        bridge: Arc<dyn AssistantBridge>,
        conn: &Arc<RpcConnection>,
    ) -> Result<Arc<Self>> {
        config.validate()?;

        let tool_calls = Arc::new(ToolCallManager::new());

        let fs_client = Arc::new(RpcFsClient::new(Arc::clone(conn), config.fs.clone()));
        let fs_provider = Arc::new(FilesystemProvider::new(fs_client));
        let tools = Arc::new(ToolRegistry::new(Arc::clone(&tool_calls)));
        tools.register_provider(Arc::clone(&fs_provider) as Arc<dyn ToolProvider>);

        let terminal_client: Arc<dyn TerminalClient> =
            Arc::new(RpcTerminalClient::new(Arc::clone(conn)));
        let terminals = Arc::new(TerminalManager::new(
            terminal_client,
            config.terminal.clone(),
        ));

        let permissions = Arc::new(PermissionBroker::new(config.permissions.timeout()));
        let sessions = Arc::new(SessionManager::new(
            Arc::clone(&tool_calls),
            Arc::clone(&permissions),
            Arc::clone(&terminals),
        ));

        let agent = Arc::new(Self {
            config,
            sessions,
            tool_calls,
            tools,
            permissions,
            terminals,
            extensions: Arc::clone(conn.extensions()),
            fs_provider,
            bridge,
        });
        agent.register_builtin_extensions()?;
        Ok(agent)
    }

    pub fn sessions(&self) -> &Arc<SessionManager> {
        &self.sessions
    }

    pub fn tool_calls(&self) -> &Arc<ToolCallManager> {
        &self.tool_calls
    }

    pub fn tools(&self) -> &Arc<ToolRegistry> {
        &self.tools
    }

    pub fn permissions(&self) -> &Arc<PermissionBroker> {
        &self.permissions
    }

    pub fn terminals(&self) -> &Arc<TerminalManager> {
        &self.terminals
    }

    pub fn extensions(&self) -> &Arc<ExtensionRegistry> {
        &self.extensions
    }

    /// Drop everything owned by live sessions, then the bridge.
    pub async fn shutdown(&self) -> Result<()> {
        for session in self.sessions.list_sessions() {
            self.sessions.cancel_session(&session.id).await;
        }
        self.tools.cleanup().await;
        self.bridge.close().await
    }

    fn register_builtin_extensions(self: &Arc<Self>) -> Result<()> {
        let sessions = Arc::clone(&self.sessions);
        self.extensions.register_method(
            "_tether/list_sessions",
            Box::new(move |_params| {
                let sessions = Arc::clone(&sessions);
                async move {
                    let ids: Vec<String> = sessions
                        .list_sessions()
                        .into_iter()
                        .map(|session| session.id)
                        .collect();
                    Ok(json!({"sessions": ids}))
                }
                .boxed()
            }),
        )
    }

    /// Register the method table on a connection.
    pub fn bind(self: &Arc<Self>, conn: &RpcConnection) {
        conn.register_method("initialize", self.handler(|agent, params, _ctx| async move {
            agent.initialize(params).await
        }));
        conn.register_method("session/new", self.handler(|agent, params, _ctx| async move {
            agent.new_session(params).await
        }));
        conn.register_method("session/load", self.handler(|agent, params, _ctx| async move {
            agent.load_session(params).await
        }));
        conn.register_method(
            "session/set_mode",
            self.handler(|agent, params, _ctx| async move {
                agent.set_session_mode(params).await
            }),
        );
        conn.register_method(
            "session/cancel",
            self.handler(|agent, params, _ctx| async move { agent.cancel(params).await }),
        );
        conn.register_method(
            "session/request_permission",
            self.handler(|agent, params, _ctx| async move {
                agent.request_permission(params).await
            }),
        );
        conn.register_method(
            "tools/call",
            self.handler(|agent, params, _ctx| async move { agent.tools_call(params).await }),
        );
        let prompt_handler =
            self.handler(|agent, params, ctx| async move { agent.prompt(params, ctx).await });
        conn.register_method("prompt", prompt_handler.clone());
        // Some clients namespace the prompt method; same handler.
        conn.register_method("session/prompt", prompt_handler);
    }

    fn handler<F, Fut>(self: &Arc<Self>, f: F) -> MethodHandler
    where
        F: Fn(Arc<Agent>, Value, RequestCtx) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value>> + Send + 'static,
    {
        let agent = Arc::clone(self);
        Arc::new(move |params, ctx| f(Arc::clone(&agent), params, ctx).boxed())
    }

    /// `initialize`: capture client capabilities, wire capability-gated
    /// tooling, and advertise what this agent can do.
    pub async fn initialize(&self, params: Value) -> Result<Value> {
        let client_capabilities: ClientCapabilities = params
            .get("clientCapabilities")
            .cloned()
            .map(serde_json::from_value)
            .transpose()
            .map_err(|e| AgentError::InvalidParams(format!("Invalid clientCapabilities: {}", e)))?
            .unwrap_or_default();

        tracing::info!(
            "Initializing agent (client fs read={} write={} terminal={})",
            client_capabilities.fs.read_text_file,
            client_capabilities.fs.write_text_file,
            client_capabilities.terminal
        );

        self.fs_provider.set_capabilities(client_capabilities.fs);
        self.tools.reindex();
        self.terminals
            .set_client_capability(client_capabilities.terminal);

        let bridge_info = self.bridge.info();
        let modes: Vec<crate::protocol::ModeDescriptor> = self
            .sessions
            .modes()
            .iter()
            .map(|mode| mode.descriptor())
            .collect();

        Ok(json!({
            "protocolVersion": PROTOCOL_VERSION,
            "agentCapabilities": {
                "loadSession": true,
                "promptCapabilities": {"streaming": true},
                "tools": self.tools.capabilities(),
                "_meta": self.extensions.capabilities(),
            },
            "authMethods": [
                {"id": "none", "name": "No Authentication", "description": null}
            ],
            "modes": {"availableModes": modes, "defaultModeId": crate::session::DEFAULT_MODE},
            "meta": {
                "agentName": "Tether Agent",
                "version": env!("CARGO_PKG_VERSION"),
                "bridge": bridge_info.name,
                "logLevel": self.config.server.log_level,
            },
        }))
    }

    /// `session/new`: absolute `cwd` in, session id and mode state out.
    pub async fn new_session(&self, params: Value) -> Result<Value> {
        if let Some(reason) = validate_cwd_param(params.get("cwd")) {
            return Err(AgentError::InvalidParams(reason));
        }
        let cwd = params["cwd"].as_str().expect("validated above").to_string();
        let name = params
            .get("name")
            .and_then(Value::as_str)
            .map(str::to_string);
        let mode = params
            .get("mode")
            .and_then(Value::as_str)
            .map(str::to_string);

        let session = self
            .sessions
            .create_session(CreateSessionParams { cwd, name, mode })?;

        Ok(json!({
            "sessionId": session.id,
            "modes": self.sessions.mode_state(&session),
        }))
    }

    /// `session/load`: rehydrate by id, validating `cwd` like `session/new`.
    pub async fn load_session(&self, params: Value) -> Result<Value> {
        let session_id = params
            .get("sessionId")
            .and_then(Value::as_str)
            .ok_or_else(|| AgentError::InvalidParams("sessionId is required".to_string()))?;
        if let Some(reason) = validate_cwd_param(params.get("cwd")) {
            return Err(AgentError::InvalidParams(reason));
        }
        let cwd = params["cwd"].as_str().expect("validated above").to_string();

        let session = self.sessions.restore_session(session_id, cwd)?;
        Ok(json!({
            "sessionId": session.id,
            "modes": self.sessions.mode_state(&session),
            "meta": {
                "createdAt": chrono::DateTime::<chrono::Utc>::from(session.created_at)
                    .to_rfc3339(),
            },
        }))
    }

    /// `session/set_mode`: switch modes and tell the client.
    pub async fn set_session_mode(&self, params: Value) -> Result<Value> {
        let session_id = params
            .get("sessionId")
            .and_then(Value::as_str)
            .ok_or_else(|| AgentError::InvalidParams("sessionId is required".to_string()))?;
        let mode_id = params
            .get("modeId")
            .and_then(Value::as_str)
            .ok_or_else(|| AgentError::InvalidParams("modeId is required".to_string()))?;

        let previous = self.sessions.set_session_mode(session_id, mode_id)?;
        self.tool_calls.publish(
            session_id,
            SessionUpdate::CurrentModeUpdate {
                current_mode_id: mode_id.to_string(),
            },
        );
        Ok(json!({"previousModeId": previous}))
    }

    /// `session/cancel` notification: fan out to every subsystem.
    pub async fn cancel(&self, params: Value) -> Result<Value> {
        let session_id = params
            .get("sessionId")
            .and_then(Value::as_str)
            .ok_or_else(|| AgentError::InvalidParams("sessionId is required".to_string()))?;

        let summary = self.sessions.cancel_session(session_id).await;
        tracing::info!(
            "Session {} cancelled: {} tool call(s) failed, {} terminal(s) released",
            session_id,
            summary.tool_calls_failed,
            summary.terminals_released
        );
        Ok(Value::Null)
    }

    /// `session/request_permission`: validate, then arbitrate.
    pub async fn request_permission(&self, params: Value) -> Result<Value> {
        let request = PermissionRequest::from_params(&params)?;
        let outcome = self.permissions.request_permission(request).await?;
        Ok(json!({"outcome": outcome}))
    }

    /// `tools/call`: dispatch through the registry. The session id may
    /// arrive at the top level or inside the tool parameters.
    pub async fn tools_call(&self, params: Value) -> Result<Value> {
        let request = ToolCallRequest::from_params(&params)?;
        let session_id = params
            .get("sessionId")
            .and_then(Value::as_str)
            .or_else(|| request.parameters.get("sessionId").and_then(Value::as_str))
            .map(str::to_string);

        if let Some(session_id) = &session_id {
            let _ = self.sessions.update_session(session_id, |_| {});
        }

        let execution = self.tools.execute(request, session_id.as_deref()).await;
        Ok(execution.to_value())
    }

    /// `prompt`: drive one bridge turn, streaming chunks and looping tool
    /// requests through the dispatcher until the turn ends or the session
    /// is cancelled.
    pub async fn prompt(&self, params: Value, ctx: RequestCtx) -> Result<Value> {
        let session_id = params
            .get("sessionId")
            .and_then(Value::as_str)
            .ok_or_else(|| AgentError::InvalidParams("sessionId is required".to_string()))?
            .to_string();
        let session = self
            .sessions
            .get_session(&session_id)
            .ok_or_else(|| AgentError::Session(format!("Session not found: {}", session_id)))?;

        let prompt_text = extract_prompt_text(&params)?;
        let _ = self.sessions.update_session(&session_id, |_| {});

        let (events_tx, mut events_rx) = mpsc::channel(32);
        let bridge = Arc::clone(&self.bridge);
        let turn = tokio::spawn(async move {
            bridge.prompt(&session, prompt_text, events_tx).await
        });

        loop {
            tokio::select! {
                _ = ctx.cancel.cancelled() => {
                    turn.abort();
                    tracing::info!("Prompt turn for session {} cancelled", session_id);
                    return Ok(json!({"stopReason": StopReason::Cancelled}));
                }
                event = events_rx.recv() => match event {
                    None => break,
                    Some(BridgeEvent::Chunk(text)) => {
                        self.tool_calls.publish(
                            &session_id,
                            SessionUpdate::AgentMessageChunk {
                                content: ContentBlock::text(text),
                            },
                        );
                    }
                    Some(BridgeEvent::ToolRequest { name, parameters, respond }) => {
                        let execution = self
                            .tools
                            .execute(
                                ToolCallRequest { name, parameters },
                                Some(&session_id),
                            )
                            .await;
                        let _ = respond.send(execution);
                    }
                },
            }
        }

        let stop_reason = match turn.await {
            Ok(result) => result?,
            Err(e) if e.is_cancelled() => StopReason::Cancelled,
            Err(e) => {
                return Err(AgentError::Protocol(format!("Prompt turn panicked: {}", e)));
            }
        };
        Ok(json!({"stopReason": stop_reason}))
    }
}

fn extract_prompt_text(params: &Value) -> Result<String> {
    match params.get("prompt") {
        Some(Value::String(text)) => Ok(text.clone()),
        Some(Value::Array(blocks)) => {
            let mut text = String::new();
            for block in blocks {
                match serde_json::from_value::<ContentBlock>(block.clone()) {
                    Ok(ContentBlock::Text { text: chunk }) => {
                        if !text.is_empty() {
                            text.push('\n');
                        }
                        text.push_str(&chunk);
                    }
                    Err(_) => {
                        tracing::warn!("Skipping unsupported prompt content block");
                    }
                }
            }
            if text.trim().is_empty() {
                return Err(AgentError::InvalidParams(
                    "prompt must contain text content".to_string(),
                ));
            }
            Ok(text)
        }
        _ => Err(AgentError::InvalidParams(
            "prompt must be a string or content block array".to_string(),
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::test_support::{ScriptStep, ScriptedBridge};
    use crate::bridge::EchoBridge;
    use crate::protocol::{ToolCallStatus, ToolKind};
    use crate::tools::{Tool, ToolOutcome};
    use crate::transport::StreamTransport;
    use async_trait::async_trait;
    use tokio::io::duplex;

    fn test_conn() -> Arc<RpcConnection> {
        let (_client, server) = duplex(4096);
        let (read, write) = tokio::io::split(server);
        let transport = Arc::new(StreamTransport::new(read, write));
        RpcConnection::new(transport, Arc::new(ExtensionRegistry::new()))
    }

    fn test_agent_with(bridge: Arc<dyn AssistantBridge>) -> Arc<Agent> {
        Agent::new(AgentConfig::default(), bridge, &test_conn()).unwrap()
    }

    fn test_agent() -> Arc<Agent> {
        test_agent_with(Arc::new(EchoBridge))
    }

    async fn make_session(agent: &Agent) -> String {
        let response = agent
            .new_session(json!({"cwd": "/tmp/project"}))
            .await
            .unwrap();
        response["sessionId"].as_str().unwrap().to_string()
    }

    struct OneToolProvider {
        tool: Tool,
    }

    #[async_trait]
    impl ToolProvider for OneToolProvider {
        fn name(&self) -> &str {
            "one"
        }
        fn description(&self) -> &str {
            "single-tool test provider"
        }
        fn tools(&self) -> Vec<Tool> {
            vec![self.tool.clone()]
        }
    }

    fn register_echo_tool(agent: &Agent, name: &str) {
        agent.tools().register_provider(Arc::new(OneToolProvider {
            tool: Tool {
                name: name.to_string(),
                description: "echo".to_string(),
                parameters: json!({"type": "object"}),
                handler: Arc::new(|params| {
                    async move { Ok(ToolOutcome::ok(json!({"echo": params}))) }.boxed()
                }),
            },
        }));
    }

    #[tokio::test]
    async fn test_initialize_shape() {
        let agent = test_agent();
        agent
            .extensions()
            .register_method(
                "_myapp/action",
                Box::new(|params| async move { Ok(params) }.boxed()),
            )
            .unwrap();

        let response = agent
            .initialize(json!({
                "clientCapabilities": {
                    "fs": {"readTextFile": true, "writeTextFile": true},
                    "terminal": true
                }
            }))
            .await
            .unwrap();

        assert_eq!(response["protocolVersion"], PROTOCOL_VERSION);
        assert_eq!(response["agentCapabilities"]["loadSession"], true);
        assert_eq!(
            response["agentCapabilities"]["_meta"]["myapp"]["methods"],
            json!(["_myapp/action"])
        );
        assert_eq!(
            response["agentCapabilities"]["_meta"]["tether"]["methods"],
            json!(["_tether/list_sessions"])
        );
        assert_eq!(
            response["modes"]["availableModes"][0]["id"],
            json!("ask")
        );

        // Capability-gated fs tools materialized.
        assert_eq!(response["agentCapabilities"]["tools"]["filesystem"], true);
        assert!(agent
            .tools()
            .tool_names()
            .contains(&"read_file".to_string()));
    }

    #[tokio::test]
    async fn test_initialize_without_capabilities() {
        let agent = test_agent();
        let response = agent.initialize(json!({})).await.unwrap();
        assert_eq!(response["agentCapabilities"]["tools"]["filesystem"], false);
        assert!(agent.tools().tool_names().is_empty());
    }

    #[tokio::test]
    async fn test_new_session_and_mode_state() {
        let agent = test_agent();
        let response = agent
            .new_session(json!({"cwd": "/home/dev/repo", "name": "demo"}))
            .await
            .unwrap();

        assert!(response["sessionId"].as_str().unwrap().starts_with("sess_"));
        assert_eq!(response["modes"]["currentModeId"], "ask");
        assert_eq!(response["modes"]["availableModes"].as_array().unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_new_session_cwd_validation() {
        let agent = test_agent();

        let err = agent
            .new_session(json!({"cwd": "relative/path"}))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("cwd must be an absolute path"));

        let err = agent.new_session(json!({"cwd": 42})).await.unwrap_err();
        assert!(err.to_string().contains("cwd must be a string"));

        let err = agent.new_session(json!({})).await.unwrap_err();
        assert!(err.to_string().contains("cwd must be a string"));
    }

    #[tokio::test]
    async fn test_load_session_accepts_platform_absolute_paths() {
        let agent = test_agent();

        for cwd in ["/u/x", "C:\\w", "D:/w"] {
            let response = agent
                .load_session(json!({"sessionId": "sess_restored", "cwd": cwd}))
                .await
                .unwrap();
            assert_eq!(response["sessionId"], "sess_restored");
        }

        for cwd in json!(["relative/path", "./x", "../x", 7]).as_array().unwrap() {
            let err = agent
                .load_session(json!({"sessionId": "sess_x", "cwd": cwd}))
                .await
                .unwrap_err();
            assert_eq!(err.json_rpc_code(), -32602);
        }
    }

    #[tokio::test]
    async fn test_set_mode_emits_update() {
        let agent = test_agent();
        let session_id = make_session(&agent).await;
        let mut updates = agent.tool_calls().subscribe();

        let response = agent
            .set_session_mode(json!({"sessionId": session_id, "modeId": "plan"}))
            .await
            .unwrap();
        assert_eq!(response["previousModeId"], "ask");

        match updates.recv().await.unwrap().update {
            SessionUpdate::CurrentModeUpdate { current_mode_id } => {
                assert_eq!(current_mode_id, "plan");
            }
            other => panic!("Expected mode update, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_request_permission_auto_rejects_delete() {
        let agent = test_agent();
        let response = agent
            .request_permission(json!({
                "sessionId": "S",
                "toolCall": {"kind": "delete"},
                "options": [
                    {"optionId": "allow-once", "name": "Allow", "kind": "allow_once"},
                    {"optionId": "reject-once", "name": "Reject", "kind": "reject_once"}
                ]
            }))
            .await
            .unwrap();

        assert_eq!(
            response["outcome"],
            json!({"outcome": "selected", "optionId": "reject-once"})
        );
    }

    #[tokio::test]
    async fn test_request_permission_validation() {
        let agent = test_agent();
        let err = agent
            .request_permission(json!({"toolCall": {}, "options": []}))
            .await
            .unwrap_err();
        assert_eq!(err.json_rpc_code(), -32602);
    }

    #[tokio::test]
    async fn test_tools_call_extracts_session_from_parameters() {
        let agent = test_agent();
        let session_id = make_session(&agent).await;
        register_echo_tool(&agent, "analyze_code");
        let mut updates = agent.tool_calls().subscribe();

        let response = agent
            .tools_call(json!({
                "name": "analyze_code",
                "parameters": {"sessionId": session_id, "path": "/src/lib.rs"}
            }))
            .await
            .unwrap();

        assert_eq!(response["success"], true);
        // The lifecycle was reported against the session found inside the
        // tool parameters.
        let notification = updates.recv().await.unwrap();
        assert_eq!(notification.session_id, session_id);
        match notification.update {
            SessionUpdate::ToolCall { kind, .. } => assert_eq!(kind, ToolKind::Read),
            other => panic!("Expected tool_call, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_prompt_streams_chunks_and_tools() {
        let bridge = Arc::new(ScriptedBridge {
            script: vec![
                ScriptStep::Chunk("thinking...".to_string()),
                ScriptStep::Tool {
                    name: "analyze_code".to_string(),
                    parameters: json!({"path": "/src/lib.rs"}),
                },
            ],
        });
        let agent = test_agent_with(bridge);
        let session_id = make_session(&agent).await;
        register_echo_tool(&agent, "analyze_code");
        let mut updates = agent.tool_calls().subscribe();

        let ctx = RequestCtx {
            session_id: Some(session_id.clone()),
            cancel: Default::default(),
        };
        let response = agent
            .prompt(
                json!({
                    "sessionId": session_id,
                    "prompt": [{"type": "text", "text": "look at lib.rs"}]
                }),
                ctx,
            )
            .await
            .unwrap();
        assert_eq!(response["stopReason"], "end_turn");

        // First chunk, then the tool-call lifecycle, then the bridge's
        // follow-up chunk.
        match updates.recv().await.unwrap().update {
            SessionUpdate::AgentMessageChunk { content } => {
                assert_eq!(content, ContentBlock::text("thinking..."));
            }
            other => panic!("Expected chunk, got {:?}", other),
        }
        let mut saw_completed = false;
        let mut saw_followup = false;
        for _ in 0..4 {
            match updates.recv().await.unwrap().update {
                SessionUpdate::ToolCallUpdate { status, .. } => {
                    if status == Some(ToolCallStatus::Completed) {
                        saw_completed = true;
                    }
                }
                SessionUpdate::AgentMessageChunk { content } => {
                    assert_eq!(
                        content,
                        ContentBlock::text("tool analyze_code success=true")
                    );
                    saw_followup = true;
                }
                _ => {}
            }
        }
        assert!(saw_completed);
        assert!(saw_followup);
    }

    #[tokio::test]
    async fn test_prompt_cancellation() {
        struct StallingBridge;

        #[async_trait]
        impl AssistantBridge for StallingBridge {
            fn info(&self) -> crate::bridge::BridgeInfo {
                crate::bridge::BridgeInfo {
                    name: "stalling".to_string(),
                    version: "0.0.0".to_string(),
                }
            }
            async fn version(&self) -> Result<String> {
                Ok("0.0.0".to_string())
            }
            async fn check_auth(&self) -> Result<crate::bridge::AuthStatus> {
                Ok(crate::bridge::AuthStatus {
                    authenticated: true,
                    method: None,
                })
            }
            async fn prompt(
                &self,
                _session: &crate::session::Session,
                _prompt: String,
                _events: mpsc::Sender<BridgeEvent>,
            ) -> Result<StopReason> {
                tokio::time::sleep(std::time::Duration::from_secs(60)).await;
                Ok(StopReason::EndTurn)
            }
            async fn close(&self) -> Result<()> {
                Ok(())
            }
        }

        let agent = test_agent_with(Arc::new(StallingBridge));
        let session_id = make_session(&agent).await;

        let cancel = tokio_util::sync::CancellationToken::new();
        let ctx = RequestCtx {
            session_id: Some(session_id.clone()),
            cancel: cancel.clone(),
        };

        let turn = {
            let agent = Arc::clone(&agent);
            let session_id = session_id.clone();
            tokio::spawn(async move {
                agent
                    .prompt(json!({"sessionId": session_id, "prompt": "go"}), ctx)
                    .await
            })
        };
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        cancel.cancel();

        let response = turn.await.unwrap().unwrap();
        assert_eq!(response["stopReason"], "cancelled");
    }

    #[tokio::test]
    async fn test_prompt_rejects_empty_and_unknown_session() {
        let agent = test_agent();
        let session_id = make_session(&agent).await;

        let ctx = RequestCtx {
            session_id: None,
            cancel: Default::default(),
        };
        let err = agent
            .prompt(json!({"sessionId": session_id, "prompt": []}), ctx.clone())
            .await
            .unwrap_err();
        assert_eq!(err.json_rpc_code(), -32602);

        let err = agent
            .prompt(json!({"sessionId": "sess_ghost", "prompt": "hi"}), ctx)
            .await
            .unwrap_err();
        assert!(matches!(err, AgentError::Session(_)));
    }

    #[tokio::test]
    async fn test_list_sessions_extension() {
        let agent = test_agent();
        let a = make_session(&agent).await;
        let b = make_session(&agent).await;

        let result = agent
            .extensions()
            .invoke_method("_tether/list_sessions", json!({}))
            .await
            .unwrap();
        let ids: Vec<String> = result["sessions"]
            .as_array()
            .unwrap()
            .iter()
            .map(|v| v.as_str().unwrap().to_string())
            .collect();
        assert!(ids.contains(&a));
        assert!(ids.contains(&b));
    }

    #[tokio::test]
    async fn test_cancel_notification_handler() {
        let agent = test_agent();
        let session_id = make_session(&agent).await;
        agent
            .tool_calls()
            .report(&session_id, "read_file", Default::default());

        agent
            .cancel(json!({"sessionId": session_id}))
            .await
            .unwrap();
        assert!(agent.tool_calls().active_calls(&session_id).is_empty());
    }
}
