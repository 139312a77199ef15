//! Tool-call lifecycle tracking and `session/update` emission
//!
//! Every tool call moves through `pending → in_progress →
//! completed|failed`, and every transition is published as a
//! `session/update` notification. Records stay in the active map for a
//! short inspection window after reaching a terminal status, then are
//! evicted so the map cannot grow without bound.

use crate::protocol::{
    ContentBlock, SessionNotification, SessionUpdate, ToolCallContent, ToolCallLocation,
    ToolCallStatus, ToolKind,
};
use crate::{AgentError, Result};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::sync::broadcast;

/// How long a terminal record remains inspectable before eviction.
const DEFAULT_RETENTION: Duration = Duration::from_secs(30);

/// Notification channel capacity; slow subscribers observe lag, the
/// manager never blocks.
const NOTIFICATION_CAPACITY: usize = 256;

/// A tracked tool call.
#[derive(Debug, Clone)]
pub struct ToolCallRecord {
    pub tool_call_id: String,
    pub session_id: String,
    pub tool_name: String,
    pub title: String,
    pub kind: ToolKind,
    pub status: ToolCallStatus,
    pub raw_input: Option<Value>,
    pub raw_output: Option<Value>,
    pub content: Vec<ToolCallContent>,
    pub locations: Vec<ToolCallLocation>,
    pub started_at: SystemTime,
    pub ended_at: Option<SystemTime>,
}

/// Fields for the initial report of a tool call.
#[derive(Debug, Clone)]
pub struct ReportArgs {
    pub title: String,
    pub kind: ToolKind,
    pub status: ToolCallStatus,
    pub raw_input: Option<Value>,
    pub locations: Option<Vec<ToolCallLocation>>,
}

impl Default for ReportArgs {
    fn default() -> Self {
        Self {
            title: String::new(),
            kind: ToolKind::Other,
            status: ToolCallStatus::Pending,
            raw_input: None,
            locations: None,
        }
    }
}

/// Changed fields for a tool-call update. Only the populated fields are
/// applied and emitted.
#[derive(Debug, Clone, Default)]
pub struct UpdateArgs {
    pub title: Option<String>,
    pub status: Option<ToolCallStatus>,
    pub content: Option<Vec<ToolCallContent>>,
    pub locations: Option<Vec<ToolCallLocation>>,
    pub raw_output: Option<Value>,
}

/// Issues tool-call ids and publishes lifecycle notifications.
pub struct ToolCallManager {
    active: Arc<Mutex<HashMap<String, ToolCallRecord>>>,
    notifier: broadcast::Sender<SessionNotification>,
    counter: AtomicU64,
    retention: Duration,
}

impl ToolCallManager {
    pub fn new() -> Self {
        Self::with_retention(DEFAULT_RETENTION)
    }

    /// Custom inspection window; tests shrink it to observe eviction.
    pub fn with_retention(retention: Duration) -> Self {
        let (notifier, _) = broadcast::channel(NOTIFICATION_CAPACITY);
        Self {
            active: Arc::new(Mutex::new(HashMap::new())),
            notifier,
            counter: AtomicU64::new(0),
            retention,
        }
    }

    /// Subscribe to `session/update` notifications.
    pub fn subscribe(&self) -> broadcast::Receiver<SessionNotification> {
        self.notifier.subscribe()
    }

    fn emit(&self, session_id: &str, update: SessionUpdate) {
        // No subscribers is fine; notifications are best-effort.
        let _ = self.notifier.send(SessionNotification {
            session_id: session_id.to_string(),
            update,
        });
    }

    /// Publish a non-tool-call session update (assistant chunks, mode
    /// changes) on the same ordered channel.
    pub fn publish(&self, session_id: &str, update: SessionUpdate) {
        self.emit(session_id, update);
    }

    fn next_id(&self, tool_name: &str) -> String {
        let epoch_ms = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis();
        let counter = self.counter.fetch_add(1, Ordering::SeqCst) + 1;
        format!("tool_{}_{}_{}", tool_name, epoch_ms, counter)
    }

    /// Report a new tool call and return its id.
    pub fn report(&self, session_id: &str, tool_name: &str, args: ReportArgs) -> String {
        let tool_call_id = self.next_id(tool_name);
        let record = ToolCallRecord {
            tool_call_id: tool_call_id.clone(),
            session_id: session_id.to_string(),
            tool_name: tool_name.to_string(),
            title: args.title.clone(),
            kind: args.kind,
            status: args.status,
            raw_input: args.raw_input.clone(),
            raw_output: None,
            content: Vec::new(),
            locations: args.locations.clone().unwrap_or_default(),
            started_at: SystemTime::now(),
            ended_at: None,
        };

        self.active
            .lock()
            .expect("tool call map poisoned")
            .insert(tool_call_id.clone(), record);

        self.emit(
            session_id,
            SessionUpdate::ToolCall {
                tool_call_id: tool_call_id.clone(),
                title: args.title,
                kind: args.kind,
                status: args.status,
                raw_input: args.raw_input,
                locations: args.locations,
            },
        );

        tracing::debug!("Reported tool call {} for session {}", tool_call_id, session_id);
        tool_call_id
    }

    /// Apply changed fields to a tracked call and emit the delta.
    pub fn update(&self, session_id: &str, tool_call_id: &str, args: UpdateArgs) -> Result<()> {
        {
            let mut active = self.active.lock().expect("tool call map poisoned");
            let record = active.get_mut(tool_call_id).ok_or_else(|| {
                AgentError::ToolExecution(format!("Unknown tool call: {}", tool_call_id))
            })?;
            if record.session_id != session_id {
                return Err(AgentError::Protocol(format!(
                    "Tool call {} belongs to session {}",
                    tool_call_id, record.session_id
                )));
            }

            if let Some(status) = args.status {
                if status.rank() < record.status.rank() || record.status.is_terminal() {
                    return Err(AgentError::Protocol(format!(
                        "Invalid status transition for {}: {:?} -> {:?}",
                        tool_call_id, record.status, status
                    )));
                }
                record.status = status;
                if status.is_terminal() {
                    record.ended_at = Some(SystemTime::now());
                    self.schedule_eviction(tool_call_id.to_string());
                }
            }
            if let Some(title) = &args.title {
                record.title = title.clone();
            }
            if let Some(content) = &args.content {
                record.content = content.clone();
            }
            if let Some(locations) = &args.locations {
                record.locations = locations.clone();
            }
            if let Some(raw_output) = &args.raw_output {
                record.raw_output = Some(raw_output.clone());
            }
        }

        self.emit(
            session_id,
            SessionUpdate::ToolCallUpdate {
                tool_call_id: tool_call_id.to_string(),
                title: args.title,
                status: args.status,
                content: args.content,
                locations: args.locations,
                raw_output: args.raw_output,
            },
        );
        Ok(())
    }

    /// Mark a call completed.
    pub fn complete(
        &self,
        session_id: &str,
        tool_call_id: &str,
        content: Option<Vec<ToolCallContent>>,
        raw_output: Option<Value>,
    ) -> Result<()> {
        self.update(
            session_id,
            tool_call_id,
            UpdateArgs {
                status: Some(ToolCallStatus::Completed),
                content,
                raw_output,
                ..Default::default()
            },
        )
    }

    /// Mark a call failed, with the error surfaced as text content.
    pub fn fail(
        &self,
        session_id: &str,
        tool_call_id: &str,
        error: &str,
        raw_output: Option<Value>,
    ) -> Result<()> {
        self.update(
            session_id,
            tool_call_id,
            UpdateArgs {
                status: Some(ToolCallStatus::Failed),
                content: Some(vec![ToolCallContent::Content {
                    content: ContentBlock::text(format!("Error: {}", error)),
                }]),
                raw_output,
                ..Default::default()
            },
        )
    }

    fn schedule_eviction(&self, tool_call_id: String) {
        let active = Arc::clone(&self.active);
        let retention = self.retention;
        tokio::spawn(async move {
            tokio::time::sleep(retention).await;
            active
                .lock()
                .expect("tool call map poisoned")
                .remove(&tool_call_id);
        });
    }

    /// Fail every non-terminal call of a session. Returns how many were
    /// transitioned.
    pub fn cancel_session(&self, session_id: &str) -> usize {
        let targets: Vec<String> = {
            let active = self.active.lock().expect("tool call map poisoned");
            active
                .values()
                .filter(|record| record.session_id == session_id && !record.status.is_terminal())
                .map(|record| record.tool_call_id.clone())
                .collect()
        };

        let mut cancelled = 0;
        for tool_call_id in targets {
            let result = self.update(
                session_id,
                &tool_call_id,
                UpdateArgs {
                    title: Some("Cancelled by user".to_string()),
                    status: Some(ToolCallStatus::Failed),
                    ..Default::default()
                },
            );
            if result.is_ok() {
                cancelled += 1;
            }
        }
        if cancelled > 0 {
            tracing::info!(
                "Cancelled {} tool call(s) for session {}",
                cancelled,
                session_id
            );
        }
        cancelled
    }

    /// Snapshot one record.
    pub fn get(&self, tool_call_id: &str) -> Option<ToolCallRecord> {
        self.active
            .lock()
            .expect("tool call map poisoned")
            .get(tool_call_id)
            .cloned()
    }

    /// Ids of a session's non-terminal calls.
    pub fn active_calls(&self, session_id: &str) -> Vec<String> {
        self.active
            .lock()
            .expect("tool call map poisoned")
            .values()
            .filter(|record| record.session_id == session_id && !record.status.is_terminal())
            .map(|record| record.tool_call_id.clone())
            .collect()
    }

    /// Total tracked records, terminal ones in their inspection window
    /// included.
    pub fn tracked_count(&self) -> usize {
        self.active.lock().expect("tool call map poisoned").len()
    }
}

impl Default for ToolCallManager {
    fn default() -> Self {
        Self::new()
    }
}
