//! Permission brokering for tool calls
//!
//! A permission request names a session, a tool-call descriptor, and a
//! non-empty list of options. Two flows resolve it: a non-blocking default
//! policy keyed on the tool kind, and an interactive flow that parks the
//! request until the arbiter replies (or a timeout rejects it). Session
//! cancellation resolves every pending request of that session as
//! `cancelled`.

use crate::protocol::{PermissionOption, PermissionOutcome, ToolKind};
use crate::{AgentError, Result};
use serde::Deserialize;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};

/// Descriptor of the tool call a permission request is about.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ToolCallDescriptor {
    #[serde(rename = "toolCallId")]
    pub tool_call_id: Option<String>,
    pub title: Option<String>,
    pub kind: Option<ToolKind>,
}

/// A validated permission request.
#[derive(Debug, Clone)]
pub struct PermissionRequest {
    pub session_id: String,
    pub tool_call: ToolCallDescriptor,
    pub options: Vec<PermissionOption>,
}

impl PermissionRequest {
    /// Parse and validate wire params. Anything malformed fails with an
    /// invalid-params error before any policy runs.
    pub fn from_params(params: &Value) -> Result<Self> {
        let session_id = params
            .get("sessionId")
            .and_then(Value::as_str)
            .ok_or_else(|| AgentError::InvalidParams("sessionId is required".to_string()))?
            .to_string();

        let tool_call_value = params
            .get("toolCall")
            .ok_or_else(|| AgentError::InvalidParams("toolCall is required".to_string()))?;
        let tool_call: ToolCallDescriptor = serde_json::from_value(tool_call_value.clone())
            .map_err(|e| AgentError::InvalidParams(format!("Invalid toolCall: {}", e)))?;

        let options_value = params
            .get("options")
            .ok_or_else(|| AgentError::InvalidParams("options is required".to_string()))?;
        let options: Vec<PermissionOption> = serde_json::from_value(options_value.clone())
            .map_err(|e| AgentError::InvalidParams(format!("Invalid options: {}", e)))?;
        if options.is_empty() {
            return Err(AgentError::InvalidParams(
                "options must not be empty".to_string(),
            ));
        }

        Ok(Self {
            session_id,
            tool_call,
            options,
        })
    }
}

/// A parked interactive request, delivered to whoever arbitrates.
#[derive(Debug)]
pub struct PromptedRequest {
    pub request_id: u64,
    pub request: PermissionRequest,
}

struct PendingEntry {
    session_id: String,
    options: Vec<PermissionOption>,
    resolver: oneshot::Sender<PermissionOutcome>,
}

/// Arbitrates permission requests.
pub struct PermissionBroker {
    timeout: Duration,
    interactive: AtomicBool,
    prompt_tx: Mutex<Option<mpsc::UnboundedSender<PromptedRequest>>>,
    pending: Mutex<HashMap<u64, PendingEntry>>,
    next_id: AtomicU64,
}

impl PermissionBroker {
    pub fn new(timeout: Duration) -> Self {
        Self {
            timeout,
            interactive: AtomicBool::new(false),
            prompt_tx: Mutex::new(None),
            pending: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(0),
        }
    }

    /// Switch to the interactive flow. Parked requests are surfaced on the
    /// returned channel; the consumer answers via [`resolve`](Self::resolve).
    pub fn enable_interactive(&self) -> mpsc::UnboundedReceiver<PromptedRequest> {
        let (tx, rx) = mpsc::unbounded_channel();
        *self.prompt_tx.lock().expect("prompt lock poisoned") = Some(tx);
        self.interactive.store(true, Ordering::SeqCst);
        rx
    }

    /// Decide a request without blocking: safe kinds take the first allow
    /// option, mutating kinds the first reject option, anything else the
    /// first option offered.
    pub fn default_outcome(request: &PermissionRequest) -> PermissionOutcome {
        let options = &request.options;
        let pick = |predicate: fn(&PermissionOption) -> bool| {
            options.iter().find(|option| predicate(option))
        };

        let selected = match request.tool_call.kind {
            Some(kind) if kind.is_safe() => pick(|o| o.kind.is_allow()),
            Some(kind) if kind.is_mutating() => pick(|o| o.kind.is_reject()),
            _ => None,
        }
        .unwrap_or(&options[0]);

        PermissionOutcome::Selected {
            option_id: selected.option_id.clone(),
        }
    }

    /// Arbitrate one request, via whichever flow is wired.
    pub async fn request_permission(&self, request: PermissionRequest) -> Result<PermissionOutcome> {
        if !self.interactive.load(Ordering::SeqCst) {
            let outcome = Self::default_outcome(&request);
            tracing::debug!(
                "Permission request for session {} auto-resolved: {:?}",
                request.session_id,
                outcome
            );
            return Ok(outcome);
        }

        let request_id = self.next_id.fetch_add(1, Ordering::SeqCst) + 1;
        let (tx, rx) = oneshot::channel();
        {
            let mut pending = self.pending.lock().expect("pending lock poisoned");
            pending.insert(
                request_id,
                PendingEntry {
                    session_id: request.session_id.clone(),
                    options: request.options.clone(),
                    resolver: tx,
                },
            );
        }

        let prompt_tx = self
            .prompt_tx
            .lock()
            .expect("prompt lock poisoned")
            .clone();
        if let Some(prompt_tx) = prompt_tx {
            let _ = prompt_tx.send(PromptedRequest {
                request_id,
                request: request.clone(),
            });
        }

        match tokio::time::timeout(self.timeout, rx).await {
            Ok(Ok(outcome)) => Ok(outcome),
            Ok(Err(_)) => Ok(PermissionOutcome::Cancelled),
            Err(_) => {
                // Timed out: behave like a reject-once.
                let entry = self
                    .pending
                    .lock()
                    .expect("pending lock poisoned")
                    .remove(&request_id);
                let options = entry
                    .map(|entry| entry.options)
                    .unwrap_or_else(|| request.options.clone());
                tracing::warn!(
                    "Permission request {} for session {} timed out",
                    request_id,
                    request.session_id
                );
                let selected = options
                    .iter()
                    .find(|option| option.kind.is_reject())
                    .unwrap_or(&options[0]);
                Ok(PermissionOutcome::Selected {
                    option_id: selected.option_id.clone(),
                })
            }
        }
    }

    /// Resolve a parked request with the selected option. Resolving a
    /// request that already resolved is a no-op returning false.
    pub fn resolve(&self, request_id: u64, option_id: impl Into<String>) -> bool {
        let entry = self
            .pending
            .lock()
            .expect("pending lock poisoned")
            .remove(&request_id);
        match entry {
            Some(entry) => entry
                .resolver
                .send(PermissionOutcome::Selected {
                    option_id: option_id.into(),
                })
                .is_ok(),
            None => false,
        }
    }

    /// Resolve every pending request of a session as cancelled.
    pub fn cancel_session(&self, session_id: &str) {
        let entries: Vec<PendingEntry> = {
            let mut pending = self.pending.lock().expect("pending lock poisoned");
            let ids: Vec<u64> = pending
                .iter()
                .filter(|(_, entry)| entry.session_id == session_id)
                .map(|(id, _)| *id)
                .collect();
            ids.into_iter()
                .filter_map(|id| pending.remove(&id))
                .collect()
        };

        let count = entries.len();
        for entry in entries {
            let _ = entry.resolver.send(PermissionOutcome::Cancelled);
        }
        if count > 0 {
            tracing::info!(
                "Cancelled {} pending permission request(s) for session {}",
                count,
                session_id
            );
        }
    }

    /// Number of parked requests for a session.
    pub fn pending_count(&self, session_id: &str) -> usize {
        self.pending
            .lock()
            .expect("pending lock poisoned")
            .values()
            .filter(|entry| entry.session_id == session_id)
            .count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn options() -> Value {
        json!([
            {"optionId": "allow-once", "name": "Allow once", "kind": "allow_once"},
            {"optionId": "reject-once", "name": "Reject once", "kind": "reject_once"}
        ])
    }

    fn request(kind: &str) -> PermissionRequest {
        PermissionRequest::from_params(&json!({
            "sessionId": "sess_1",
            "toolCall": {"kind": kind},
            "options": options(),
        }))
        .unwrap()
    }

    #[test]
    fn test_validation_failures() {
        let missing_session = json!({"toolCall": {}, "options": options()});
        assert!(matches!(
            PermissionRequest::from_params(&missing_session),
            Err(AgentError::InvalidParams(_))
        ));

        let missing_tool_call = json!({"sessionId": "s", "options": options()});
        assert!(matches!(
            PermissionRequest::from_params(&missing_tool_call),
            Err(AgentError::InvalidParams(_))
        ));

        let empty_options = json!({"sessionId": "s", "toolCall": {}, "options": []});
        assert!(matches!(
            PermissionRequest::from_params(&empty_options),
            Err(AgentError::InvalidParams(_))
        ));

        let bad_kind = json!({
            "sessionId": "s",
            "toolCall": {},
            "options": [{"optionId": "x", "name": "X", "kind": "maybe_later"}]
        });
        assert!(matches!(
            PermissionRequest::from_params(&bad_kind),
            Err(AgentError::InvalidParams(_))
        ));
    }

    #[test]
    fn test_default_policy_allows_safe_kinds() {
        for kind in ["read", "search", "think", "fetch"] {
            let outcome = PermissionBroker::default_outcome(&request(kind));
            assert_eq!(
                outcome,
                PermissionOutcome::Selected {
                    option_id: "allow-once".to_string()
                },
                "kind {} should auto-allow",
                kind
            );
        }
    }

    #[test]
    fn test_default_policy_rejects_mutating_kinds() {
        for kind in ["edit", "delete", "move", "execute"] {
            let outcome = PermissionBroker::default_outcome(&request(kind));
            assert_eq!(
                outcome,
                PermissionOutcome::Selected {
                    option_id: "reject-once".to_string()
                },
                "kind {} should auto-reject",
                kind
            );
        }
    }

    #[test]
    fn test_default_policy_falls_back_to_first_option() {
        let outcome = PermissionBroker::default_outcome(&request("other"));
        assert_eq!(
            outcome,
            PermissionOutcome::Selected {
                option_id: "allow-once".to_string()
            }
        );
    }

    #[tokio::test]
    async fn test_default_flow_never_blocks() {
        let broker = PermissionBroker::new(Duration::from_secs(300));
        let outcome = broker.request_permission(request("delete")).await.unwrap();
        assert_eq!(
            outcome,
            PermissionOutcome::Selected {
                option_id: "reject-once".to_string()
            }
        );
    }

    #[tokio::test]
    async fn test_interactive_resolution() {
        let broker = std::sync::Arc::new(PermissionBroker::new(Duration::from_secs(300)));
        let mut prompts = broker.enable_interactive();

        let worker = {
            let broker = std::sync::Arc::clone(&broker);
            tokio::spawn(async move { broker.request_permission(request("edit")).await })
        };

        let prompted = prompts.recv().await.unwrap();
        assert_eq!(prompted.request.session_id, "sess_1");
        assert!(broker.resolve(prompted.request_id, "allow-once"));

        let outcome = worker.await.unwrap().unwrap();
        assert_eq!(
            outcome,
            PermissionOutcome::Selected {
                option_id: "allow-once".to_string()
            }
        );

        // Double-resolution is a no-op.
        assert!(!broker.resolve(prompted.request_id, "reject-once"));
    }

    #[tokio::test]
    async fn test_interactive_timeout_rejects_once() {
        let broker = PermissionBroker::new(Duration::from_millis(30));
        let _prompts = broker.enable_interactive();

        let outcome = broker.request_permission(request("edit")).await.unwrap();
        assert_eq!(
            outcome,
            PermissionOutcome::Selected {
                option_id: "reject-once".to_string()
            }
        );
    }

    #[tokio::test]
    async fn test_cancel_session_resolves_pending_as_cancelled() {
        let broker = std::sync::Arc::new(PermissionBroker::new(Duration::from_secs(300)));
        let mut prompts = broker.enable_interactive();

        let worker = {
            let broker = std::sync::Arc::clone(&broker);
            tokio::spawn(async move { broker.request_permission(request("execute")).await })
        };
        let _ = prompts.recv().await.unwrap();
        assert_eq!(broker.pending_count("sess_1"), 1);

        broker.cancel_session("sess_1");

        let outcome = worker.await.unwrap().unwrap();
        assert_eq!(outcome, PermissionOutcome::Cancelled);
        assert_eq!(broker.pending_count("sess_1"), 0);

        // Cancelling again is a no-op.
        broker.cancel_session("sess_1");
    }
}
