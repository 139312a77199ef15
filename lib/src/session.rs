//! Session lifecycle, mode catalog, and cancellation fan-out

use crate::permissions::PermissionBroker;
use crate::protocol::{ModeDescriptor, SessionModeState};
use crate::terminal_manager::TerminalManager;
use crate::tool_calls::ToolCallManager;
use crate::validation_utils::is_absolute_client_path;
use crate::{AgentError, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::SystemTime;
use ulid::Ulid;

/// Default mode for new sessions.
pub const DEFAULT_MODE: &str = "ask";

/// How a mode treats permission requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PermissionBehavior {
    Strict,
    Permissive,
    Auto,
}

/// One entry of the fixed mode catalog.
#[derive(Debug, Clone)]
pub struct SessionMode {
    pub id: String,
    pub name: String,
    pub description: Option<String>,
    pub permission_behavior: PermissionBehavior,
    /// Tool groups visible in this mode; `None` means none declared.
    pub available_tools: Option<Vec<String>>,
    pub system_prompt: Option<String>,
}

impl SessionMode {
    pub fn descriptor(&self) -> ModeDescriptor {
        ModeDescriptor {
            id: self.id.clone(),
            name: self.name.clone(),
            description: self.description.clone(),
        }
    }
}

/// The fixed catalog. Tool visibility grows monotonically across it:
/// plan ⊇ ask, agent ⊇ plan.
pub fn default_modes() -> Vec<SessionMode> {
    vec![
        SessionMode {
            id: "ask".to_string(),
            name: "Ask".to_string(),
            description: Some("Answer questions without touching the project".to_string()),
            permission_behavior: PermissionBehavior::Strict,
            available_tools: None,
            system_prompt: None,
        },
        SessionMode {
            id: "plan".to_string(),
            name: "Plan".to_string(),
            description: Some("Read the project and draft changes".to_string()),
            permission_behavior: PermissionBehavior::Strict,
            available_tools: Some(vec!["filesystem".to_string()]),
            system_prompt: None,
        },
        SessionMode {
            id: "agent".to_string(),
            name: "Agent".to_string(),
            description: Some("Full tool access including terminals".to_string()),
            permission_behavior: PermissionBehavior::Strict,
            available_tools: Some(vec!["filesystem".to_string(), "terminal".to_string()]),
            system_prompt: None,
        },
    ]
}

/// A live conversation with a working directory and mode.
#[derive(Debug, Clone)]
pub struct Session {
    pub id: String,
    pub cwd: String,
    pub name: Option<String>,
    pub mode: String,
    /// Assistant-specific scratch state carried across turns.
    pub scratch: Value,
    pub created_at: SystemTime,
    pub updated_at: SystemTime,
}

/// Parameters for creating a session.
#[derive(Debug, Clone, Default)]
pub struct CreateSessionParams {
    pub cwd: String,
    pub name: Option<String>,
    pub mode: Option<String>,
}

/// What a cancellation fan-out touched.
#[derive(Debug, Clone, Copy, Default)]
pub struct CancellationSummary {
    pub tool_calls_failed: usize,
    pub terminals_released: usize,
}

/// Thread-safe session registry plus the cancellation fan-out hub.
pub struct SessionManager {
    sessions: RwLock<HashMap<String, Session>>,
    modes: Vec<SessionMode>,
    tool_calls: Arc<ToolCallManager>,
    permissions: Arc<PermissionBroker>,
    terminals: Arc<TerminalManager>,
}

impl SessionManager {
    pub fn new(
        tool_calls: Arc<ToolCallManager>,
        permissions: Arc<PermissionBroker>,
        terminals: Arc<TerminalManager>,
    ) -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            modes: default_modes(),
            tool_calls,
            permissions,
            terminals,
        }
    }

    pub fn modes(&self) -> &[SessionMode] {
        &self.modes
    }

    fn mode_exists(&self, mode_id: &str) -> bool {
        self.modes.iter().any(|mode| mode.id == mode_id)
    }

    fn validate_cwd(cwd: &str) -> Result<()> {
        if !is_absolute_client_path(cwd) {
            return Err(AgentError::InvalidParams(format!(
                "cwd must be an absolute path, got: {}",
                cwd
            )));
        }
        Ok(())
    }

    /// Create a session with a fresh id.
    pub fn create_session(&self, params: CreateSessionParams) -> Result<Session> {
        self.insert_session(format!("sess_{}", Ulid::new()), params)
    }

    /// Rehydrate a session by id: return the live one when present,
    /// otherwise create it anew under the given id. Nothing survives the
    /// process, so a client reloading after a restart still converges.
    pub fn restore_session(&self, session_id: &str, cwd: String) -> Result<Session> {
        if let Some(existing) = self.get_session(session_id) {
            return Ok(existing);
        }
        Self::validate_cwd(&cwd)?;
        self.insert_session(
            session_id.to_string(),
            CreateSessionParams {
                cwd,
                ..Default::default()
            },
        )
    }

    fn insert_session(&self, id: String, params: CreateSessionParams) -> Result<Session> {
        Self::validate_cwd(&params.cwd)?;

        let mode = params.mode.unwrap_or_else(|| DEFAULT_MODE.to_string());
        if !self.mode_exists(&mode) {
            return Err(AgentError::InvalidParams(format!(
                "Unknown session mode: {}",
                mode
            )));
        }

        let now = SystemTime::now();
        let session = Session {
            id: id.clone(),
            cwd: params.cwd,
            name: params.name,
            mode,
            scratch: Value::Null,
            created_at: now,
            updated_at: now,
        };

        self.sessions
            .write()
            .expect("sessions lock poisoned")
            .insert(id.clone(), session.clone());
        tracing::info!("Created session {} in {}", id, session.cwd);
        Ok(session)
    }

    pub fn get_session(&self, session_id: &str) -> Option<Session> {
        self.sessions
            .read()
            .expect("sessions lock poisoned")
            .get(session_id)
            .cloned()
    }

    pub fn list_sessions(&self) -> Vec<Session> {
        self.sessions
            .read()
            .expect("sessions lock poisoned")
            .values()
            .cloned()
            .collect()
    }

    pub fn session_count(&self) -> usize {
        self.sessions.read().expect("sessions lock poisoned").len()
    }

    /// Mutate a session through a closure; bumps `updated_at`.
    pub fn update_session<F>(&self, session_id: &str, updater: F) -> Result<()>
    where
        F: FnOnce(&mut Session),
    {
        let mut sessions = self.sessions.write().expect("sessions lock poisoned");
        let session = sessions
            .get_mut(session_id)
            .ok_or_else(|| AgentError::Session(format!("Session not found: {}", session_id)))?;
        updater(session);
        session.updated_at = SystemTime::now();
        Ok(())
    }

    /// Switch a session's mode; returns the previous mode id.
    pub fn set_session_mode(&self, session_id: &str, mode_id: &str) -> Result<String> {
        if !self.mode_exists(mode_id) {
            return Err(AgentError::InvalidParams(format!(
                "Unknown session mode: {}",
                mode_id
            )));
        }

        let mut sessions = self.sessions.write().expect("sessions lock poisoned");
        let session = sessions
            .get_mut(session_id)
            .ok_or_else(|| AgentError::Session(format!("Session not found: {}", session_id)))?;
        let previous = std::mem::replace(&mut session.mode, mode_id.to_string());
        session.updated_at = SystemTime::now();
        tracing::info!(
            "Session {} mode: {} -> {}",
            session_id,
            previous,
            mode_id
        );
        Ok(previous)
    }

    /// Mode state for session responses.
    pub fn mode_state(&self, session: &Session) -> SessionModeState {
        SessionModeState {
            current_mode_id: session.mode.clone(),
            available_modes: self.modes.iter().map(SessionMode::descriptor).collect(),
        }
    }

    /// Cancellation fan-out: fail the session's tool calls, resolve its
    /// pending permission requests as cancelled, release its terminals.
    /// Best-effort and idempotent; the session itself stays loadable.
    pub async fn cancel_session(&self, session_id: &str) -> CancellationSummary {
        let tool_calls_failed = self.tool_calls.cancel_session(session_id);
        self.permissions.cancel_session(session_id);
        let terminals_released = self.terminals.release_session(session_id).await;

        if let Err(e) = self.update_session(session_id, |_| {}) {
            tracing::debug!("Cancelled session without registry entry: {}", e);
        }

        CancellationSummary {
            tool_calls_failed,
            terminals_released,
        }
    }
}
