//! Client-hosted terminal management
//!
//! Terminals run inside the client; the agent holds capability references
//! and talks to them through `terminal/*` reverse calls. The manager owns
//! the policy gauntlet every create request passes through, tracks active
//! terminals per process and per session, and wraps the client handle so
//! that release happens exactly once.

use crate::config::TerminalConfig;
use crate::protocol::{TerminalExitStatus, TerminalOutput};
use crate::rpc::RpcConnection;
use crate::validation_utils::is_blank_str;
use crate::{AgentError, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::SystemTime;

/// Environment variable passed to `terminal/create`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnvVariable {
    pub name: String,
    pub value: String,
}

/// Outbound frame for `terminal/create`. Empty `args`/`env` are omitted
/// entirely rather than sent as empty lists.
#[derive(Debug, Clone, Serialize)]
pub struct TerminalCreateParams {
    #[serde(rename = "sessionId")]
    pub session_id: String,
    pub command: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub args: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cwd: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub env: Option<Vec<EnvVariable>>,
    #[serde(rename = "outputByteLimit", skip_serializing_if = "Option::is_none")]
    pub output_byte_limit: Option<u64>,
}

/// What a caller asks for when creating a terminal.
#[derive(Debug, Clone, Default)]
pub struct CreateTerminalRequest {
    pub command: String,
    pub args: Vec<String>,
    pub cwd: Option<String>,
    pub env: Vec<EnvVariable>,
    /// Signed on purpose: a negative value is a caller bug we reject
    /// rather than silently reinterpret.
    pub output_byte_limit: Option<i64>,
}

impl CreateTerminalRequest {
    pub fn command(command: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            command: command.into(),
            args,
            ..Default::default()
        }
    }
}

/// The four handle-bound operations plus create, as the client exposes
/// them over the reverse channel.
#[async_trait]
pub trait TerminalClient: Send + Sync {
    async fn create(&self, params: TerminalCreateParams) -> Result<String>;
    async fn output(&self, session_id: &str, terminal_id: &str) -> Result<TerminalOutput>;
    async fn wait_for_exit(
        &self,
        session_id: &str,
        terminal_id: &str,
    ) -> Result<TerminalExitStatus>;
    async fn kill(&self, session_id: &str, terminal_id: &str) -> Result<()>;
    async fn release(&self, session_id: &str, terminal_id: &str) -> Result<()>;
}

/// `TerminalClient` over a live RPC connection.
pub struct RpcTerminalClient {
    conn: Arc<RpcConnection>,
}

impl RpcTerminalClient {
    pub fn new(conn: Arc<RpcConnection>) -> Self {
        Self { conn }
    }

    fn handle_params(session_id: &str, terminal_id: &str) -> Value {
        serde_json::json!({"sessionId": session_id, "terminalId": terminal_id})
    }
}

#[async_trait]
impl TerminalClient for RpcTerminalClient {
    async fn create(&self, params: TerminalCreateParams) -> Result<String> {
        let response = self
            .conn
            .request("terminal/create", serde_json::to_value(&params)?)
            .await?;
        response
            .get("terminalId")
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| {
                AgentError::Protocol("terminal/create response missing terminalId".to_string())
            })
    }

    async fn output(&self, session_id: &str, terminal_id: &str) -> Result<TerminalOutput> {
        let response = self
            .conn
            .request("terminal/output", Self::handle_params(session_id, terminal_id))
            .await?;
        Ok(serde_json::from_value(response)?)
    }

    async fn wait_for_exit(
        &self,
        session_id: &str,
        terminal_id: &str,
    ) -> Result<TerminalExitStatus> {
        // The long-blocking terminal wait is abandoned on session cancel;
        // the terminal itself is released by the cancellation fan-out.
        let cancel = self.conn.cancellations().token_for(session_id);
        let response = self
            .conn
            .request_with_cancel(
                "terminal/wait_for_exit",
                Self::handle_params(session_id, terminal_id),
                &cancel,
            )
            .await?;
        Ok(serde_json::from_value(response)?)
    }

    async fn kill(&self, session_id: &str, terminal_id: &str) -> Result<()> {
        self.conn
            .request("terminal/kill", Self::handle_params(session_id, terminal_id))
            .await?;
        Ok(())
    }

    async fn release(&self, session_id: &str, terminal_id: &str) -> Result<()> {
        self.conn
            .request(
                "terminal/release",
                Self::handle_params(session_id, terminal_id),
            )
            .await?;
        Ok(())
    }
}

#[derive(Debug, Clone)]
struct TerminalMeta {
    session_id: String,
    command: String,
    created_at: SystemTime,
    last_activity: SystemTime,
}

#[derive(Default)]
struct Tracking {
    active: HashMap<String, TerminalMeta>,
    /// Creates that passed the cap check but have not returned from the
    /// client yet. Counted so a burst cannot overshoot the cap.
    reserved: usize,
}

/// Enforces terminal policy and tracks live handles.
pub struct TerminalManager {
    client: Arc<dyn TerminalClient>,
    config: TerminalConfig,
    client_supported: AtomicBool,
    tracking: Arc<Mutex<Tracking>>,
}

impl TerminalManager {
    pub fn new(client: Arc<dyn TerminalClient>, config: TerminalConfig) -> Self {
        Self {
            client,
            config,
            client_supported: AtomicBool::new(false),
            tracking: Arc::new(Mutex::new(Tracking::default())),
        }
    }

    /// Record whether the client advertised terminal support.
    pub fn set_client_capability(&self, supported: bool) {
        self.client_supported.store(supported, Ordering::SeqCst);
    }

    pub fn active_count(&self) -> usize {
        self.tracking.lock().expect("tracking lock poisoned").active.len()
    }

    pub fn session_count(&self, session_id: &str) -> usize {
        self.tracking
            .lock()
            .expect("tracking lock poisoned")
            .active
            .values()
            .filter(|meta| meta.session_id == session_id)
            .count()
    }

    /// A detached closure that touches one terminal's activity timestamp,
    /// usable from background tasks without borrowing the manager.
    pub fn touch_fn(&self, terminal_id: String) -> impl Fn() + Send + 'static {
        let tracking = Arc::clone(&self.tracking);
        move || {
            if let Some(meta) = tracking
                .lock()
                .expect("tracking lock poisoned")
                .active
                .get_mut(&terminal_id)
            {
                meta.last_activity = SystemTime::now();
            }
        }
    }

    /// Update a terminal's activity timestamp.
    pub fn touch(&self, terminal_id: &str) {
        if let Some(meta) = self
            .tracking
            .lock()
            .expect("tracking lock poisoned")
            .active
            .get_mut(terminal_id)
        {
            meta.last_activity = SystemTime::now();
        }
    }

    fn validate_command(&self, request: &CreateTerminalRequest) -> Result<()> {
        if is_blank_str(&request.command) {
            return Err(AgentError::InvalidParams(
                "Invalid command: must be a non-empty string".to_string(),
            ));
        }

        let full_command = if request.args.is_empty() {
            request.command.clone()
        } else {
            format!("{} {}", request.command, request.args.join(" "))
        };
        for pattern in &self.config.forbidden_commands {
            if !pattern.is_empty() && full_command.contains(pattern) {
                return Err(AgentError::InvalidParams(format!(
                    "Command contains forbidden pattern: {}",
                    pattern
                )));
            }
        }

        if let Some(allowed) = &self.config.allowed_commands {
            let first_token = request
                .command
                .split_whitespace()
                .next()
                .unwrap_or_default();
            if !allowed.iter().any(|entry| entry == first_token) {
                return Err(AgentError::InvalidParams(format!(
                    "Command not in allowed list: {}",
                    first_token
                )));
            }
        }

        Ok(())
    }

    fn resolve_output_limit(&self, requested: Option<i64>) -> Result<u64> {
        match requested {
            None => Ok(self.config.default_output_byte_limit),
            Some(limit) if limit < 0 => Err(AgentError::InvalidParams(format!(
                "outputByteLimit must not be negative, got {}",
                limit
            ))),
            Some(limit) => {
                let limit = limit as u64;
                if limit > self.config.max_output_byte_limit {
                    tracing::warn!(
                        "outputByteLimit {} exceeds maximum {}, capping",
                        limit,
                        self.config.max_output_byte_limit
                    );
                    Ok(self.config.max_output_byte_limit)
                } else {
                    Ok(limit)
                }
            }
        }
    }

    /// Create a terminal, enforcing capability, command policy, the output
    /// byte policy, and the process-wide concurrency cap, in that order.
    pub async fn create(
        &self,
        session_id: &str,
        request: CreateTerminalRequest,
    ) -> Result<ManagedTerminalHandle> {
        if !self.config.enabled || !self.client_supported.load(Ordering::SeqCst) {
            return Err(AgentError::Protocol(
                "Terminal capability not supported by client".to_string(),
            ));
        }

        self.validate_command(&request)?;
        let output_byte_limit = self.resolve_output_limit(request.output_byte_limit)?;

        {
            let mut tracking = self.tracking.lock().expect("tracking lock poisoned");
            if tracking.active.len() + tracking.reserved
                >= self.config.max_concurrent_terminals
            {
                return Err(AgentError::Protocol(
                    "Maximum concurrent terminals reached".to_string(),
                ));
            }
            tracking.reserved += 1;
        }

        let params = TerminalCreateParams {
            session_id: session_id.to_string(),
            command: request.command.clone(),
            args: if request.args.is_empty() {
                None
            } else {
                Some(request.args.clone())
            },
            cwd: request.cwd.clone(),
            env: if request.env.is_empty() {
                None
            } else {
                Some(request.env.clone())
            },
            output_byte_limit: Some(output_byte_limit),
        };

        let created = self.client.create(params).await;
        let mut tracking = self.tracking.lock().expect("tracking lock poisoned");
        tracking.reserved -= 1;
        let terminal_id = created?;

        let now = SystemTime::now();
        tracking.active.insert(
            terminal_id.clone(),
            TerminalMeta {
                session_id: session_id.to_string(),
                command: request.command,
                created_at: now,
                last_activity: now,
            },
        );
        drop(tracking);

        tracing::info!(
            "Created terminal {} for session {} ({} active)",
            terminal_id,
            session_id,
            self.active_count()
        );

        Ok(ManagedTerminalHandle {
            terminal_id,
            session_id: session_id.to_string(),
            client: Arc::clone(&self.client),
            tracking: Arc::clone(&self.tracking),
            released: Arc::new(AtomicBool::new(false)),
        })
    }

    /// Release every terminal of a session, best-effort. Returns how many
    /// were dropped from tracking.
    pub async fn release_session(&self, session_id: &str) -> usize {
        let targets: Vec<String> = {
            let mut tracking = self.tracking.lock().expect("tracking lock poisoned");
            let ids: Vec<String> = tracking
                .active
                .iter()
                .filter(|(_, meta)| meta.session_id == session_id)
                .map(|(id, _)| id.clone())
                .collect();
            for id in &ids {
                tracking.active.remove(id);
            }
            ids
        };

        for terminal_id in &targets {
            if let Err(e) = self.client.release(session_id, terminal_id).await {
                tracing::warn!(
                    "Failed to release terminal {} for session {}: {}",
                    terminal_id,
                    session_id,
                    e
                );
            }
        }
        if !targets.is_empty() {
            tracing::info!(
                "Released {} terminal(s) for session {}",
                targets.len(),
                session_id
            );
        }
        targets.len()
    }

    /// Age of a terminal's metadata, for diagnostics.
    pub fn terminal_info(&self, terminal_id: &str) -> Option<(String, String, SystemTime)> {
        self.tracking
            .lock()
            .expect("tracking lock poisoned")
            .active
            .get(terminal_id)
            .map(|meta| (meta.session_id.clone(), meta.command.clone(), meta.created_at))
    }
}

/// A client terminal handle plus manager bookkeeping.
///
/// The client owns the underlying terminal; dropping this handle does NOT
/// release it. Call [`release`](Self::release), which forwards to the
/// client and drops tracking exactly once.
pub struct ManagedTerminalHandle {
    terminal_id: String,
    session_id: String,
    client: Arc<dyn TerminalClient>,
    tracking: Arc<Mutex<Tracking>>,
    released: Arc<AtomicBool>,
}

impl std::fmt::Debug for ManagedTerminalHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ManagedTerminalHandle")
            .field("terminal_id", &self.terminal_id)
            .field("session_id", &self.session_id)
            .finish()
    }
}

impl ManagedTerminalHandle {
    pub fn id(&self) -> &str {
        &self.terminal_id
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    fn ensure_live(&self) -> Result<()> {
        if self.released.load(Ordering::SeqCst) {
            return Err(AgentError::Protocol("Terminal already released".to_string()));
        }
        Ok(())
    }

    /// Current buffered output and, once exited, the exit status.
    pub async fn current_output(&self) -> Result<TerminalOutput> {
        self.ensure_live()?;
        self.client
            .output(&self.session_id, &self.terminal_id)
            .await
    }

    /// Block until the process exits.
    pub async fn wait_for_exit(&self) -> Result<TerminalExitStatus> {
        self.ensure_live()?;
        self.client
            .wait_for_exit(&self.session_id, &self.terminal_id)
            .await
    }

    pub async fn kill(&self) -> Result<()> {
        self.ensure_live()?;
        self.client.kill(&self.session_id, &self.terminal_id).await
    }

    /// Release the client terminal and drop manager tracking. Subsequent
    /// releases are no-ops; other operations fail once released.
    pub async fn release(&self) -> Result<()> {
        if self
            .released
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Ok(());
        }
        self.tracking
            .lock()
            .expect("tracking lock poisoned")
            .active
            .remove(&self.terminal_id);
        self.client
            .release(&self.session_id, &self.terminal_id)
            .await
    }
}
