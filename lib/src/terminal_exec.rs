//! Execution helpers over managed terminals
//!
//! Convenience flows built on [`ManagedTerminalHandle`]: one-shot
//! execution, execution with a deadline, execution reported as a live
//! tool call, sequential command runs, and output streaming by polling.
//! Every flow releases its terminal on the way out, success or not.

use crate::protocol::{TerminalExitStatus, ToolCallContent, ToolCallStatus, ToolKind};
use crate::terminal_manager::{
    CreateTerminalRequest, EnvVariable, ManagedTerminalHandle, TerminalManager,
};
use crate::tool_calls::{ReportArgs, ToolCallManager, UpdateArgs};
use crate::Result;
use serde_json::json;
use std::time::Duration;

/// Grace period after a kill before giving up on an exit status.
const KILL_GRACE: Duration = Duration::from_millis(100);

/// How often a progress run pokes the activity timestamp. The client
/// streams output on its own; this only keeps the terminal looking alive.
const ACTIVITY_TOUCH_INTERVAL: Duration = Duration::from_secs(2);

/// Shared options for the execution helpers.
#[derive(Debug, Clone, Default)]
pub struct ExecOptions {
    pub cwd: Option<String>,
    pub env: Vec<EnvVariable>,
    pub output_byte_limit: Option<i64>,
}

/// Outcome of one executed command.
#[derive(Debug, Clone, Default)]
pub struct ExecResult {
    pub output: String,
    pub exit_code: Option<i32>,
    pub signal: Option<String>,
    pub truncated: bool,
    pub timed_out: bool,
}

impl ExecResult {
    pub fn succeeded(&self) -> bool {
        !self.timed_out && self.exit_code == Some(0)
    }
}

/// Outcome of a progress-reported run.
#[derive(Debug, Clone)]
pub struct ProgressResult {
    pub result: ExecResult,
    pub tool_call_id: String,
    pub terminal_id: String,
}

fn create_request(command: &str, args: &[String], options: &ExecOptions) -> CreateTerminalRequest {
    CreateTerminalRequest {
        command: command.to_string(),
        args: args.to_vec(),
        cwd: options.cwd.clone(),
        env: options.env.clone(),
        output_byte_limit: options.output_byte_limit,
    }
}

async fn collect_result(
    handle: &ManagedTerminalHandle,
    status: TerminalExitStatus,
    timed_out: bool,
) -> ExecResult {
    let (output, truncated) = match handle.current_output().await {
        Ok(output) => (output.output, output.truncated),
        Err(e) => {
            tracing::warn!("Failed to fetch terminal output: {}", e);
            (String::new(), false)
        }
    };
    ExecResult {
        output,
        exit_code: status.exit_code,
        signal: status.signal,
        truncated,
        timed_out,
    }
}

/// Create, wait for exit, fetch output, release.
pub async fn execute_simple(
    manager: &TerminalManager,
    session_id: &str,
    command: &str,
    args: &[String],
    options: ExecOptions,
) -> Result<ExecResult> {
    let handle = manager
        .create(session_id, create_request(command, args, &options))
        .await?;

    let waited = handle.wait_for_exit().await;
    let result = match waited {
        Ok(status) => Ok(collect_result(&handle, status, false).await),
        Err(e) => Err(e),
    };
    if let Err(e) = handle.release().await {
        tracing::warn!("Failed to release terminal {}: {}", handle.id(), e);
    }
    result
}

/// Like [`execute_simple`], racing a deadline against the exit. On
/// timeout the process is killed, the exit status fetched best-effort
/// within a short grace window, and the terminal always released.
pub async fn execute_with_timeout(
    manager: &TerminalManager,
    session_id: &str,
    command: &str,
    args: &[String],
    options: ExecOptions,
    timeout: Duration,
) -> Result<ExecResult> {
    let handle = manager
        .create(session_id, create_request(command, args, &options))
        .await?;

    let result = match tokio::time::timeout(timeout, handle.wait_for_exit()).await {
        Ok(Ok(status)) => Ok(collect_result(&handle, status, false).await),
        Ok(Err(e)) => Err(e),
        Err(_elapsed) => {
            tracing::warn!(
                "Command {} timed out after {:?}, killing terminal {}",
                command,
                timeout,
                handle.id()
            );
            if let Err(e) = handle.kill().await {
                tracing::warn!("Failed to kill terminal {}: {}", handle.id(), e);
            }
            let status = match tokio::time::timeout(KILL_GRACE, handle.wait_for_exit()).await {
                Ok(Ok(status)) => status,
                _ => TerminalExitStatus::default(),
            };
            Ok(collect_result(&handle, status, true).await)
        }
    };

    if let Err(e) = handle.release().await {
        tracing::warn!("Failed to release terminal {}: {}", handle.id(), e);
    }
    result
}

/// Run a command as a reported tool call: an `execute` tool call carrying
/// a terminal content pointer, completed or failed with the exit status.
pub async fn execute_with_progress(
    manager: &TerminalManager,
    session_id: &str,
    command: &str,
    args: &[String],
    tool_calls: &ToolCallManager,
    options: ExecOptions,
) -> Result<ProgressResult> {
    let title = if args.is_empty() {
        format!("$ {}", command)
    } else {
        format!("$ {} {}", command, args.join(" "))
    };

    // The terminal is running by the time anyone observes this call, so
    // it is reported in progress from the start.
    let tool_call_id = tool_calls.report(
        session_id,
        "run_command",
        ReportArgs {
            title,
            kind: ToolKind::Execute,
            status: ToolCallStatus::InProgress,
            raw_input: Some(json!({"command": command, "args": args})),
            locations: None,
        },
    );

    let handle = match manager
        .create(session_id, create_request(command, args, &options))
        .await
    {
        Ok(handle) => handle,
        Err(e) => {
            let _ = tool_calls.fail(session_id, &tool_call_id, &e.to_string(), None);
            return Err(e);
        }
    };
    let terminal_id = handle.id().to_string();

    let _ = tool_calls.update(
        session_id,
        &tool_call_id,
        UpdateArgs {
            content: Some(vec![ToolCallContent::Terminal {
                terminal_id: terminal_id.clone(),
            }]),
            ..Default::default()
        },
    );

    // The client streams output autonomously; this timer only refreshes
    // the activity timestamp.
    let toucher = {
        let touch = manager.touch_fn(terminal_id.clone());
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(ACTIVITY_TOUCH_INTERVAL);
            loop {
                interval.tick().await;
                touch();
            }
        })
    };

    let waited = handle.wait_for_exit().await;
    toucher.abort();

    let result = match waited {
        Ok(status) => collect_result(&handle, status, false).await,
        Err(e) => {
            let _ = tool_calls.fail(session_id, &tool_call_id, &e.to_string(), None);
            if let Err(release_err) = handle.release().await {
                tracing::warn!(
                    "Failed to release terminal {}: {}",
                    handle.id(),
                    release_err
                );
            }
            return Err(e);
        }
    };

    let raw_output = json!({
        "exitCode": result.exit_code,
        "signal": result.signal,
        "truncated": result.truncated,
    });
    if result.succeeded() {
        let _ = tool_calls.update(
            session_id,
            &tool_call_id,
            UpdateArgs {
                title: Some("✓ Command completed successfully".to_string()),
                status: Some(ToolCallStatus::Completed),
                raw_output: Some(raw_output),
                ..Default::default()
            },
        );
    } else {
        let title = match (&result.exit_code, &result.signal) {
            (Some(code), _) => format!("✗ Command failed with exit code {}", code),
            (None, Some(signal)) => format!("✗ Command terminated by signal {}", signal),
            (None, None) => "✗ Command failed".to_string(),
        };
        let _ = tool_calls.update(
            session_id,
            &tool_call_id,
            UpdateArgs {
                title: Some(title),
                status: Some(ToolCallStatus::Failed),
                raw_output: Some(raw_output),
                ..Default::default()
            },
        );
    }

    if let Err(e) = handle.release().await {
        tracing::warn!("Failed to release terminal {}: {}", handle.id(), e);
    }

    Ok(ProgressResult {
        result,
        tool_call_id,
        terminal_id,
    })
}

/// One command in a sequential run.
#[derive(Debug, Clone)]
pub struct CommandSpec {
    pub command: String,
    pub args: Vec<String>,
}

impl CommandSpec {
    pub fn new(command: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            command: command.into(),
            args,
        }
    }
}

/// Options for [`execute_sequential`].
#[derive(Debug, Clone)]
pub struct SequentialOptions {
    pub cwd: Option<String>,
    pub env: Vec<EnvVariable>,
    /// Stop at the first non-zero exit. On by default.
    pub stop_on_error: bool,
}

impl Default for SequentialOptions {
    fn default() -> Self {
        Self {
            cwd: None,
            env: Vec::new(),
            stop_on_error: true,
        }
    }
}

/// Run commands one at a time in a shared working directory and
/// environment.
pub async fn execute_sequential(
    manager: &TerminalManager,
    session_id: &str,
    commands: &[CommandSpec],
    options: SequentialOptions,
) -> Result<Vec<ExecResult>> {
    let mut results = Vec::with_capacity(commands.len());
    for spec in commands {
        let result = execute_simple(
            manager,
            session_id,
            &spec.command,
            &spec.args,
            ExecOptions {
                cwd: options.cwd.clone(),
                env: options.env.clone(),
                output_byte_limit: None,
            },
        )
        .await?;

        let failed = !result.succeeded();
        results.push(result);
        if failed && options.stop_on_error {
            tracing::info!(
                "Sequential run stopped at {} after non-zero exit",
                spec.command
            );
            break;
        }
    }
    Ok(results)
}

/// Options for [`stream_output`].
#[derive(Debug, Clone)]
pub struct StreamOptions {
    pub poll_interval: Duration,
}

impl Default for StreamOptions {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(1000),
        }
    }
}

/// Poll a terminal's buffered output and hand each new slice to the
/// callback. Returns once an exit status is observed.
pub async fn stream_output<F>(
    handle: &ManagedTerminalHandle,
    mut on_chunk: F,
    options: StreamOptions,
) -> Result<TerminalExitStatus>
where
    F: FnMut(&str),
{
    let mut seen = 0usize;
    loop {
        let output = handle.current_output().await?;
        if output.output.len() > seen {
            on_chunk(&output.output[seen..]);
            seen = output.output.len();
        }
        if let Some(status) = output.exit_status {
            return Ok(status);
        }
        tokio::time::sleep(options.poll_interval).await;
    }
}
