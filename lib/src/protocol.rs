//! Wire-level data structures for the Agent Client Protocol
//!
//! Everything in this module is serialized onto the JSON-RPC channel, so
//! field names carry the exact casing the protocol mandates (camelCase for
//! structured fields, snake_case for enum discriminants).

use serde::{Deserialize, Serialize};

/// Tool call classification.
///
/// Kinds help clients choose icons and decide how to render execution
/// progress. They also drive the permission broker's default policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolKind {
    /// Reading files or data
    Read,
    /// Modifying files or content
    Edit,
    /// Removing files or data
    Delete,
    /// Moving or renaming files
    Move,
    /// Searching for information
    Search,
    /// Running commands or code
    Execute,
    /// Internal reasoning or planning
    Think,
    /// Retrieving external data
    Fetch,
    /// Changing the session mode
    SwitchMode,
    /// Everything else
    #[serde(other)]
    Other,
}

impl ToolKind {
    /// Kinds that never mutate state; the default permission policy
    /// auto-allows these.
    pub fn is_safe(&self) -> bool {
        matches!(
            self,
            ToolKind::Read | ToolKind::Search | ToolKind::Think | ToolKind::Fetch
        )
    }

    /// Kinds that mutate state; the default permission policy auto-rejects
    /// these.
    pub fn is_mutating(&self) -> bool {
        matches!(
            self,
            ToolKind::Edit | ToolKind::Delete | ToolKind::Move | ToolKind::Execute
        )
    }
}

/// Tool call execution status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolCallStatus {
    /// Input is streaming or awaiting approval; the call has not started
    Pending,
    /// The call is currently running
    InProgress,
    /// The call completed successfully
    Completed,
    /// The call failed
    Failed,
}

impl ToolCallStatus {
    /// Whether this status ends the lifecycle
    pub fn is_terminal(&self) -> bool {
        matches!(self, ToolCallStatus::Completed | ToolCallStatus::Failed)
    }

    /// Lifecycle rank used to enforce monotonic transitions
    pub(crate) fn rank(&self) -> u8 {
        match self {
            ToolCallStatus::Pending => 0,
            ToolCallStatus::InProgress => 1,
            ToolCallStatus::Completed | ToolCallStatus::Failed => 2,
        }
    }
}

/// A content block inside assistant output or tool-call content
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentBlock {
    Text { text: String },
}

impl ContentBlock {
    pub fn text(text: impl Into<String>) -> Self {
        ContentBlock::Text { text: text.into() }
    }
}

/// Content produced by a tool call
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ToolCallContent {
    /// Standard content blocks
    Content { content: ContentBlock },
    /// File modifications shown as diffs
    Diff {
        path: String,
        #[serde(rename = "oldText")]
        old_text: Option<String>,
        #[serde(rename = "newText")]
        new_text: String,
    },
    /// Live terminal output from command execution
    Terminal {
        #[serde(rename = "terminalId")]
        terminal_id: String,
    },
}

/// File location touched by a tool call, for follow-along features
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCallLocation {
    pub path: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub line: Option<u64>,
}

impl ToolCallLocation {
    pub fn new(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            line: None,
        }
    }
}

/// A `session/update` notification payload
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionNotification {
    #[serde(rename = "sessionId")]
    pub session_id: String,
    pub update: SessionUpdate,
}

/// Sub-kinds of `session/update`
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "sessionUpdate", rename_all = "snake_case")]
pub enum SessionUpdate {
    /// First report of a tool call: the full descriptor
    ToolCall {
        #[serde(rename = "toolCallId")]
        tool_call_id: String,
        title: String,
        kind: ToolKind,
        status: ToolCallStatus,
        #[serde(rename = "rawInput", skip_serializing_if = "Option::is_none")]
        raw_input: Option<serde_json::Value>,
        #[serde(skip_serializing_if = "Option::is_none")]
        locations: Option<Vec<ToolCallLocation>>,
    },
    /// Later reports carry only the fields that changed
    ToolCallUpdate {
        #[serde(rename = "toolCallId")]
        tool_call_id: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        title: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        status: Option<ToolCallStatus>,
        #[serde(skip_serializing_if = "Option::is_none")]
        content: Option<Vec<ToolCallContent>>,
        #[serde(skip_serializing_if = "Option::is_none")]
        locations: Option<Vec<ToolCallLocation>>,
        #[serde(rename = "rawOutput", skip_serializing_if = "Option::is_none")]
        raw_output: Option<serde_json::Value>,
    },
    /// A chunk of streamed assistant output
    AgentMessageChunk { content: ContentBlock },
    /// The session switched modes
    CurrentModeUpdate {
        #[serde(rename = "currentModeId")]
        current_mode_id: String,
    },
}

/// Permission option presented to the arbiter
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PermissionOption {
    #[serde(rename = "optionId")]
    pub option_id: String,
    pub name: String,
    pub kind: PermissionOptionKind,
}

/// Permission option kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PermissionOptionKind {
    AllowOnce,
    AllowAlways,
    RejectOnce,
    RejectAlways,
}

impl PermissionOptionKind {
    pub fn is_allow(&self) -> bool {
        matches!(
            self,
            PermissionOptionKind::AllowOnce | PermissionOptionKind::AllowAlways
        )
    }

    pub fn is_reject(&self) -> bool {
        matches!(
            self,
            PermissionOptionKind::RejectOnce | PermissionOptionKind::RejectAlways
        )
    }
}

/// Outcome of a permission request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum PermissionOutcome {
    /// The session was cancelled while the request was pending
    Cancelled,
    /// An option was selected, by policy or by the user
    Selected {
        #[serde(rename = "optionId")]
        option_id: String,
    },
}

/// Exit status of a client-hosted terminal
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TerminalExitStatus {
    #[serde(rename = "exitCode", skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub signal: Option<String>,
}

/// Response shape of `terminal/output`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TerminalOutput {
    pub output: String,
    pub truncated: bool,
    #[serde(rename = "exitStatus", skip_serializing_if = "Option::is_none")]
    pub exit_status: Option<TerminalExitStatus>,
}

/// Filesystem capabilities a client may advertise in `initialize`
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct FsCapabilities {
    #[serde(rename = "readTextFile", default)]
    pub read_text_file: bool,
    #[serde(rename = "writeTextFile", default)]
    pub write_text_file: bool,
}

/// Client capabilities sent with `initialize`
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct ClientCapabilities {
    #[serde(default)]
    pub fs: FsCapabilities,
    #[serde(default)]
    pub terminal: bool,
}

/// One advertised session mode
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModeDescriptor {
    pub id: String,
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

/// Mode state returned by session endpoints
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionModeState {
    #[serde(rename = "currentModeId")]
    pub current_mode_id: String,
    #[serde(rename = "availableModes")]
    pub available_modes: Vec<ModeDescriptor>,
}

/// Why a prompt turn ended
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    EndTurn,
    Cancelled,
    Refusal,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_tool_kind_wire_format() {
        assert_eq!(serde_json::to_value(ToolKind::Read).unwrap(), json!("read"));
        assert_eq!(
            serde_json::to_value(ToolKind::SwitchMode).unwrap(),
            json!("switch_mode")
        );
        let kind: ToolKind = serde_json::from_value(json!("nonsense")).unwrap();
        assert_eq!(kind, ToolKind::Other);
    }

    #[test]
    fn test_tool_kind_policy_classes() {
        assert!(ToolKind::Read.is_safe());
        assert!(ToolKind::Fetch.is_safe());
        assert!(!ToolKind::Edit.is_safe());
        assert!(ToolKind::Delete.is_mutating());
        assert!(ToolKind::Execute.is_mutating());
        assert!(!ToolKind::Other.is_safe());
        assert!(!ToolKind::Other.is_mutating());
    }

    #[test]
    fn test_status_ranks_are_monotone() {
        assert!(ToolCallStatus::Pending.rank() < ToolCallStatus::InProgress.rank());
        assert!(ToolCallStatus::InProgress.rank() < ToolCallStatus::Completed.rank());
        assert_eq!(
            ToolCallStatus::Completed.rank(),
            ToolCallStatus::Failed.rank()
        );
        assert!(ToolCallStatus::Completed.is_terminal());
        assert!(!ToolCallStatus::InProgress.is_terminal());
    }

    #[test]
    fn test_tool_call_update_serializes_changed_fields_only() {
        let update = SessionUpdate::ToolCallUpdate {
            tool_call_id: "tool_read_file_1_1".to_string(),
            title: None,
            status: Some(ToolCallStatus::InProgress),
            content: None,
            locations: None,
            raw_output: None,
        };

        let value = serde_json::to_value(&update).unwrap();
        assert_eq!(value["sessionUpdate"], "tool_call_update");
        assert_eq!(value["status"], "in_progress");
        assert!(value.get("title").is_none());
        assert!(value.get("rawOutput").is_none());
    }

    #[test]
    fn test_session_notification_shape() {
        let notification = SessionNotification {
            session_id: "sess_1".to_string(),
            update: SessionUpdate::ToolCall {
                tool_call_id: "tool_read_file_1_1".to_string(),
                title: "Reading file: /tmp/a.txt".to_string(),
                kind: ToolKind::Read,
                status: ToolCallStatus::Pending,
                raw_input: Some(json!({"path": "/tmp/a.txt"})),
                locations: Some(vec![ToolCallLocation::new("/tmp/a.txt")]),
            },
        };

        let value = serde_json::to_value(&notification).unwrap();
        assert_eq!(value["sessionId"], "sess_1");
        assert_eq!(value["update"]["sessionUpdate"], "tool_call");
        assert_eq!(value["update"]["kind"], "read");
        assert_eq!(value["update"]["locations"][0]["path"], "/tmp/a.txt");
    }

    #[test]
    fn test_terminal_content_wire_format() {
        let content = ToolCallContent::Terminal {
            terminal_id: "term-1".to_string(),
        };
        let value = serde_json::to_value(&content).unwrap();
        assert_eq!(value, json!({"type": "terminal", "terminalId": "term-1"}));
    }

    #[test]
    fn test_permission_outcome_wire_format() {
        let outcome = PermissionOutcome::Selected {
            option_id: "reject-once".to_string(),
        };
        let value = serde_json::to_value(&outcome).unwrap();
        assert_eq!(
            value,
            json!({"outcome": "selected", "optionId": "reject-once"})
        );

        let value = serde_json::to_value(&PermissionOutcome::Cancelled).unwrap();
        assert_eq!(value, json!({"outcome": "cancelled"}));
    }

    #[test]
    fn test_client_capabilities_defaults() {
        let caps: ClientCapabilities = serde_json::from_value(json!({})).unwrap();
        assert!(!caps.fs.read_text_file);
        assert!(!caps.terminal);

        let caps: ClientCapabilities = serde_json::from_value(json!({
            "fs": {"readTextFile": true, "writeTextFile": true},
            "terminal": true
        }))
        .unwrap();
        assert!(caps.fs.read_text_file);
        assert!(caps.fs.write_text_file);
        assert!(caps.terminal);
    }
}
