//! Tool registry and execution dispatcher
//!
//! Providers contribute named tools; the registry keeps a flat name index
//! and drives every execution through the same pipeline: resolution,
//! parameter validation, lifecycle reporting, handler invocation, and
//! structured result assembly. All failures come back as structured
//! results, never as thrown errors.

use crate::protocol::{ToolCallContent, ToolCallLocation, ToolCallStatus, ToolKind};
use crate::tool_calls::{ReportArgs, ToolCallManager, UpdateArgs};
use crate::{AgentError, Result};
use async_trait::async_trait;
use futures::future::BoxFuture;
use serde_json::{json, Map, Value};
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Instant;

/// Marker key the dispatcher injects for session-scoped tools.
pub const SESSION_ID_PARAM: &str = "_sessionId";

/// Handler invoked with the validated params object.
pub type ToolHandler =
    Arc<dyn Fn(Value) -> BoxFuture<'static, Result<ToolOutcome>> + Send + Sync>;

/// What a handler reports back.
#[derive(Debug, Clone, Default)]
pub struct ToolOutcome {
    pub success: bool,
    pub result: Option<Value>,
    pub error: Option<String>,
    pub metadata: Option<Value>,
}

impl ToolOutcome {
    pub fn ok(result: Value) -> Self {
        Self {
            success: true,
            result: Some(result),
            ..Default::default()
        }
    }

    pub fn ok_with_metadata(result: Value, metadata: Value) -> Self {
        Self {
            success: true,
            result: Some(result),
            metadata: Some(metadata),
            ..Default::default()
        }
    }

    pub fn failure(error: impl Into<String>) -> Self {
        Self {
            success: false,
            error: Some(error.into()),
            ..Default::default()
        }
    }
}

/// A named, schema-validated capability.
#[derive(Clone)]
pub struct Tool {
    pub name: String,
    pub description: String,
    /// JSON-Schema-style object: `{"type": "object", "properties": {...},
    /// "required": [...]}`
    pub parameters: Value,
    pub handler: ToolHandler,
}

impl std::fmt::Debug for Tool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Tool")
            .field("name", &self.name)
            .field("description", &self.description)
            .finish_non_exhaustive()
    }
}

/// A source of tools. Providers may yield zero tools until their backing
/// capabilities arrive; the registry reindexes on demand.
#[async_trait]
pub trait ToolProvider: Send + Sync {
    fn name(&self) -> &str;
    fn description(&self) -> &str;
    fn tools(&self) -> Vec<Tool>;

    async fn cleanup(&self) -> Result<()> {
        Ok(())
    }
}

/// An inbound `tools/call` request.
#[derive(Debug, Clone)]
pub struct ToolCallRequest {
    pub name: String,
    pub parameters: Value,
}

impl ToolCallRequest {
    pub fn from_params(params: &Value) -> Result<Self> {
        let name = params
            .get("name")
            .and_then(Value::as_str)
            .ok_or_else(|| AgentError::InvalidParams("name is required".to_string()))?
            .to_string();
        let parameters = params.get("parameters").cloned().unwrap_or(Value::Null);
        Ok(Self { name, parameters })
    }
}

/// The structured result of one execution. Serialized as the `tools/call`
/// response body.
#[derive(Debug, Clone)]
pub struct ToolExecution {
    pub success: bool,
    pub result: Option<Value>,
    pub error: Option<String>,
    pub metadata: Value,
    pub tool_call_id: Option<String>,
}

impl ToolExecution {
    pub fn to_value(&self) -> Value {
        let mut body = Map::new();
        body.insert("success".to_string(), Value::Bool(self.success));
        if let Some(result) = &self.result {
            body.insert("result".to_string(), result.clone());
        }
        if let Some(error) = &self.error {
            body.insert("error".to_string(), Value::String(error.clone()));
        }
        body.insert("metadata".to_string(), self.metadata.clone());
        Value::Object(body)
    }
}

/// Map a tool name onto its display/policy kind.
pub fn derive_kind(name: &str) -> ToolKind {
    match name {
        "read_file" | "copy_file" | "list_directory" | "get_file_info" | "analyze_code"
        | "get_project_info" => ToolKind::Read,
        "write_file" | "append_file" | "create_file" | "patch_file" | "apply_code_changes" => {
            ToolKind::Edit
        }
        "delete_file" | "remove_file" | "remove_directory" => ToolKind::Delete,
        "move_file" | "rename_file" => ToolKind::Move,
        "search_codebase" | "search_files" | "grep" | "find_files" | "find_references"
        | "find_definitions" => ToolKind::Search,
        "run_tests" | "run_command" | "execute_command" | "run_script" | "shell" => {
            ToolKind::Execute
        }
        "fetch_url" | "http_request" | "download_file" | "api_request" | "web_search" => {
            ToolKind::Fetch
        }
        "think" | "reason" | "plan" | "analyze" | "explain_code" => ToolKind::Think,
        "switch_mode" | "set_mode" | "change_mode" => ToolKind::SwitchMode,
        _ => ToolKind::Other,
    }
}

fn str_param<'a>(params: &'a Value, key: &str) -> Option<&'a str> {
    params.get(key).and_then(Value::as_str)
}

/// Human-readable title for a call, from well-known parameter shapes.
pub fn derive_title(name: &str, params: &Value) -> String {
    let path = str_param(params, "path").unwrap_or("?");
    match name {
        "read_file" => format!("Reading file: {}", path),
        "write_file" => format!("Writing file: {}", path),
        "create_file" => format!("Creating file: {}", path),
        "append_file" => format!("Appending to file: {}", path),
        "patch_file" | "apply_code_changes" => format!("Editing file: {}", path),
        "copy_file" => format!("Copying file: {}", path),
        "delete_file" | "remove_file" => format!("Deleting file: {}", path),
        "remove_directory" => format!("Removing directory: {}", path),
        "list_directory" => format!("Listing directory: {}", path),
        "get_file_info" => format!("Inspecting file: {}", path),
        "move_file" | "rename_file" => {
            let source = str_param(params, "source")
                .or_else(|| str_param(params, "sourcePath"))
                .unwrap_or("?");
            let destination = str_param(params, "destination")
                .or_else(|| str_param(params, "destinationPath"))
                .unwrap_or("?");
            format!("Moving: {} to {}", source, destination)
        }
        "search_codebase" | "search_files" | "grep" | "find_files" | "find_references"
        | "find_definitions" => {
            let query = str_param(params, "query")
                .or_else(|| str_param(params, "pattern"))
                .unwrap_or("?");
            format!("Searching: {}", query)
        }
        "run_command" | "execute_command" | "run_script" | "shell" => {
            format!("$ {}", str_param(params, "command").unwrap_or("?"))
        }
        "run_tests" => "Running tests".to_string(),
        "fetch_url" | "http_request" | "download_file" | "api_request" => {
            format!("Fetching: {}", str_param(params, "url").unwrap_or("?"))
        }
        "web_search" => format!(
            "Searching the web: {}",
            str_param(params, "query").unwrap_or("?")
        ),
        "think" | "reason" | "plan" | "analyze" | "explain_code" => "Thinking".to_string(),
        "switch_mode" | "set_mode" | "change_mode" => {
            let mode = str_param(params, "mode")
                .or_else(|| str_param(params, "modeId"))
                .unwrap_or("?");
            format!("Switching mode: {}", mode)
        }
        other => other.to_string(),
    }
}

/// File locations referenced by well-known params: `path`,
/// `source`/`sourcePath`, `destination`/`destinationPath`, and every
/// member of `files[]`.
pub fn derive_locations(params: &Value) -> Option<Vec<ToolCallLocation>> {
    let mut locations = Vec::new();
    for key in ["path", "source", "sourcePath", "destination", "destinationPath"] {
        if let Some(value) = str_param(params, key) {
            locations.push(ToolCallLocation::new(value));
        }
    }
    if let Some(files) = params.get("files").and_then(Value::as_array) {
        for file in files {
            if let Some(path) = file.as_str() {
                locations.push(ToolCallLocation::new(path));
            }
        }
    }
    if locations.is_empty() {
        None
    } else {
        Some(locations)
    }
}

/// Convert a handler's `metadata.diffs` list into diff content blocks.
/// The entry shape belongs to the upstream assistant; anything without a
/// usable path is skipped.
fn diffs_to_content(metadata: Option<&Value>) -> Option<Vec<ToolCallContent>> {
    let diffs = metadata?.get("diffs")?.as_array()?;
    let content: Vec<ToolCallContent> = diffs
        .iter()
        .filter_map(|diff| {
            let path = diff
                .get("path")
                .or_else(|| diff.get("filePath"))
                .and_then(Value::as_str)?;
            let old_text = diff
                .get("oldText")
                .or_else(|| diff.get("old_text"))
                .and_then(Value::as_str)
                .map(str::to_string);
            let new_text = diff
                .get("newText")
                .or_else(|| diff.get("new_text"))
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string();
            Some(ToolCallContent::Diff {
                path: path.to_string(),
                old_text,
                new_text,
            })
        })
        .collect();
    if content.is_empty() {
        None
    } else {
        Some(content)
    }
}

fn validate_parameters(tool: &Tool, params: &Value) -> std::result::Result<(), String> {
    if !params.is_object() {
        return Err(format!(
            "Invalid parameters for {}: expected an object, got {}",
            tool.name,
            json_type_name(params)
        ));
    }
    let required = tool
        .parameters
        .get("required")
        .and_then(Value::as_array)
        .cloned()
        .unwrap_or_default();
    for key in required {
        let Some(key) = key.as_str() else { continue };
        match params.get(key) {
            None | Some(Value::Null) => {
                return Err(format!("Missing required parameter: {}", key));
            }
            Some(_) => {}
        }
    }
    Ok(())
}

fn json_type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

/// Holds providers and dispatches executions.
pub struct ToolRegistry {
    providers: RwLock<Vec<Arc<dyn ToolProvider>>>,
    tools: RwLock<HashMap<String, Tool>>,
    tool_calls: Arc<ToolCallManager>,
}

impl ToolRegistry {
    pub fn new(tool_calls: Arc<ToolCallManager>) -> Self {
        Self {
            providers: RwLock::new(Vec::new()),
            tools: RwLock::new(HashMap::new()),
            tool_calls,
        }
    }

    /// Register a provider and index its current tools.
    pub fn register_provider(&self, provider: Arc<dyn ToolProvider>) {
        {
            let mut tools = self.tools.write().expect("tools lock poisoned");
            for tool in provider.tools() {
                tools.insert(tool.name.clone(), tool);
            }
        }
        tracing::info!("Registered tool provider: {}", provider.name());
        self.providers
            .write()
            .expect("providers lock poisoned")
            .push(provider);
    }

    /// Re-pull tools from every provider. Providers that gated their tools
    /// on capabilities surface them here once those arrive.
    pub fn reindex(&self) {
        let providers = self
            .providers
            .read()
            .expect("providers lock poisoned")
            .clone();
        let mut tools = self.tools.write().expect("tools lock poisoned");
        tools.clear();
        for provider in providers {
            for tool in provider.tools() {
                tools.insert(tool.name.clone(), tool);
            }
        }
    }

    pub fn tool_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .tools
            .read()
            .expect("tools lock poisoned")
            .keys()
            .cloned()
            .collect();
        names.sort();
        names
    }

    pub fn provider_names(&self) -> Vec<String> {
        self.providers
            .read()
            .expect("providers lock poisoned")
            .iter()
            .map(|provider| provider.name().to_string())
            .collect()
    }

    /// Advertised capability summary.
    pub fn capabilities(&self) -> Value {
        let names = self.tool_names();
        let filesystem = names.iter().any(|n| n == "read_file" || n == "write_file");
        json!({
            "tools": names,
            "providers": self.provider_names(),
            "filesystem": filesystem,
            "cursor": false,
        })
    }

    /// Run every provider's cleanup hook.
    pub async fn cleanup(&self) {
        let providers = self
            .providers
            .read()
            .expect("providers lock poisoned")
            .clone();
        for provider in providers {
            if let Err(e) = provider.cleanup().await {
                tracing::warn!("Provider {} cleanup failed: {}", provider.name(), e);
            }
        }
    }

    /// Execute one tool call. When a session id is in scope the lifecycle
    /// is reported as `session/update` notifications; the result is always
    /// structured, with timing metadata attached regardless of outcome.
    pub async fn execute(
        &self,
        request: ToolCallRequest,
        session_id: Option<&str>,
    ) -> ToolExecution {
        let started = Instant::now();
        let executed_at = chrono::Utc::now().to_rfc3339();
        let name = request.name.clone();

        let finish = |success: bool,
                      result: Option<Value>,
                      error: Option<String>,
                      tool_call_id: Option<String>| {
            let mut metadata = Map::new();
            metadata.insert("toolName".to_string(), Value::String(name.clone()));
            metadata.insert(
                "duration".to_string(),
                json!(started.elapsed().as_millis() as u64),
            );
            metadata.insert("executedAt".to_string(), Value::String(executed_at.clone()));
            if let Some(id) = &tool_call_id {
                metadata.insert("toolCallId".to_string(), Value::String(id.clone()));
            }
            ToolExecution {
                success,
                result,
                error,
                metadata: Value::Object(metadata),
                tool_call_id,
            }
        };

        // Resolution.
        let tool = self
            .tools
            .read()
            .expect("tools lock poisoned")
            .get(&request.name)
            .cloned();
        let Some(tool) = tool else {
            tracing::warn!("Tool not found: {}", request.name);
            return finish(
                false,
                None,
                Some(format!("Tool not found: {}", request.name)),
                None,
            );
        };

        // Validation, before any handler work. With a session in scope the
        // failure is still reported, as a single failed-status update.
        if let Err(detail) = validate_parameters(&tool, &request.parameters) {
            let tool_call_id = session_id.map(|session_id| {
                self.tool_calls.report(
                    session_id,
                    &tool.name,
                    ReportArgs {
                        title: derive_title(&tool.name, &request.parameters),
                        kind: derive_kind(&tool.name),
                        status: ToolCallStatus::Failed,
                        raw_input: Some(request.parameters.clone()),
                        locations: derive_locations(&request.parameters),
                    },
                )
            });
            return finish(false, None, Some(detail), tool_call_id);
        }

        // Reporting.
        let tool_call_id = session_id.map(|session_id| {
            let id = self.tool_calls.report(
                session_id,
                &tool.name,
                ReportArgs {
                    title: derive_title(&tool.name, &request.parameters),
                    kind: derive_kind(&tool.name),
                    status: ToolCallStatus::Pending,
                    raw_input: Some(request.parameters.clone()),
                    locations: derive_locations(&request.parameters),
                },
            );
            let _ = self.tool_calls.update(
                session_id,
                &id,
                UpdateArgs {
                    status: Some(ToolCallStatus::InProgress),
                    ..Default::default()
                },
            );
            id
        });

        // Session-scoped tools find the session id inside their params.
        let mut parameters = request.parameters;
        if let Some(session_id) = session_id {
            if let Some(object) = parameters.as_object_mut() {
                object.insert(
                    SESSION_ID_PARAM.to_string(),
                    Value::String(session_id.to_string()),
                );
            }
        }

        let outcome = match (tool.handler)(parameters).await {
            Ok(outcome) => outcome,
            Err(AgentError::Cancelled) => {
                // The session was cancelled under us; whichever of the
                // fan-out and this path reaches the record first, the
                // client sees the same terminal update.
                if let (Some(session_id), Some(id)) = (session_id, &tool_call_id) {
                    let _ = self.tool_calls.update(
                        session_id,
                        id,
                        UpdateArgs {
                            title: Some("Cancelled by user".to_string()),
                            status: Some(ToolCallStatus::Failed),
                            ..Default::default()
                        },
                    );
                }
                return finish(
                    false,
                    None,
                    Some("Cancelled by user".to_string()),
                    tool_call_id,
                );
            }
            Err(e) => ToolOutcome::failure(e.to_string()),
        };

        if outcome.success {
            if let (Some(session_id), Some(id)) = (session_id, &tool_call_id) {
                let content = diffs_to_content(outcome.metadata.as_ref());
                let _ = self
                    .tool_calls
                    .complete(session_id, id, content, outcome.result.clone());
            }
            finish(true, outcome.result, None, tool_call_id)
        } else {
            let message = outcome
                .error
                .unwrap_or_else(|| "Tool execution failed".to_string());
            if let (Some(session_id), Some(id)) = (session_id, &tool_call_id) {
                let _ = self
                    .tool_calls
                    .fail(session_id, id, &message, outcome.result.clone());
            }
            finish(false, outcome.result, Some(message), tool_call_id)
        }
    }
}
