//! Filesystem tool provider
//!
//! Exposes `read_file` and `write_file` over the [`FsClient`] reverse
//! channel. The provider is registered at startup but yields tools only
//! for the capabilities the client actually advertised in `initialize`;
//! the registry reindexes once those arrive.

use crate::fs_client::FsClient;
use crate::protocol::FsCapabilities;
use crate::tools::{Tool, ToolOutcome, ToolProvider, SESSION_ID_PARAM};
use async_trait::async_trait;
use futures::FutureExt;
use serde_json::{json, Value};
use std::sync::{Arc, Mutex};

pub struct FilesystemProvider {
    fs: Arc<dyn FsClient>,
    capabilities: Mutex<FsCapabilities>,
}

fn session_scope(params: &Value, tool: &str) -> Result<String, String> {
    params
        .get(SESSION_ID_PARAM)
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| format!("{} requires an active session", tool))
}

impl FilesystemProvider {
    pub fn new(fs: Arc<dyn FsClient>) -> Self {
        Self {
            fs,
            capabilities: Mutex::new(FsCapabilities::default()),
        }
    }

    /// Record what the client advertised. Callers reindex the registry
    /// afterwards.
    pub fn set_capabilities(&self, capabilities: FsCapabilities) {
        *self.capabilities.lock().expect("capabilities lock poisoned") = capabilities;
    }

    fn read_file_tool(&self) -> Tool {
        let fs = Arc::clone(&self.fs);
        Tool {
            name: "read_file".to_string(),
            description: "Read a text file through the client".to_string(),
            parameters: json!({
                "type": "object",
                "properties": {
                    "path": {"type": "string", "description": "Absolute file path"},
                    "line": {"type": "number", "description": "1-based start line"},
                    "limit": {"type": "number", "description": "Maximum number of lines"},
                },
                "required": ["path"],
            }),
            handler: Arc::new(move |params: Value| {
                let fs = Arc::clone(&fs);
                async move {
                    let session_id = match session_scope(&params, "read_file") {
                        Ok(session_id) => session_id,
                        Err(message) => return Ok(ToolOutcome::failure(message)),
                    };
                    let path = params["path"].as_str().unwrap_or_default().to_string();
                    let line = params.get("line").and_then(Value::as_u64);
                    let limit = params.get("limit").and_then(Value::as_u64);

                    match fs.read_text_file(&session_id, &path, line, limit).await {
                        Ok(content) => Ok(ToolOutcome::ok(json!({
                            "path": path,
                            "content": content,
                            "_meta": {"byteLength": content.len()},
                        }))),
                        Err(e @ crate::AgentError::Cancelled) => Err(e),
                        Err(e) => Ok(ToolOutcome::failure(format!(
                            "Failed to read {}: {}",
                            path, e
                        ))),
                    }
                }
                .boxed()
            }),
        }
    }

    fn write_file_tool(&self) -> Tool {
        let fs = Arc::clone(&self.fs);
        Tool {
            name: "write_file".to_string(),
            description: "Write a text file through the client".to_string(),
            parameters: json!({
                "type": "object",
                "properties": {
                    "path": {"type": "string", "description": "Absolute file path"},
                    "content": {"type": "string", "description": "Full file content"},
                },
                "required": ["path", "content"],
            }),
            handler: Arc::new(move |params: Value| {
                let fs = Arc::clone(&fs);
                async move {
                    let session_id = match session_scope(&params, "write_file") {
                        Ok(session_id) => session_id,
                        Err(message) => return Ok(ToolOutcome::failure(message)),
                    };
                    let path = params["path"].as_str().unwrap_or_default().to_string();
                    let content = params["content"].as_str().unwrap_or_default().to_string();

                    match fs.write_text_file(&session_id, &path, &content).await {
                        Ok(()) => Ok(ToolOutcome::ok(json!({
                            "path": path,
                            "bytesWritten": content.len(),
                        }))),
                        Err(e @ crate::AgentError::Cancelled) => Err(e),
                        Err(e) => Ok(ToolOutcome::failure(format!(
                            "Failed to write {}: {}",
                            path, e
                        ))),
                    }
                }
                .boxed()
            }),
        }
    }
}

#[async_trait]
impl ToolProvider for FilesystemProvider {
    fn name(&self) -> &str {
        "filesystem"
    }

    fn description(&self) -> &str {
        "File access through the client's fs capabilities"
    }

    fn tools(&self) -> Vec<Tool> {
        let capabilities = *self.capabilities.lock().expect("capabilities lock poisoned");
        let mut tools = Vec::new();
        if capabilities.read_text_file {
            tools.push(self.read_file_tool());
        }
        if capabilities.write_text_file {
            tools.push(self.write_file_tool());
        }
        tools
    }
}
