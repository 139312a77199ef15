//! Configuration types for the Tether Agent

use serde::{Deserialize, Serialize};
use std::time::Duration;

fn default_log_level() -> String {
    "info".to_string()
}

fn default_max_concurrent_terminals() -> usize {
    8
}

fn default_output_byte_limit() -> u64 {
    1_048_576 // 1MB
}

fn default_max_output_byte_limit() -> u64 {
    10_485_760 // 10MB
}

fn default_permission_timeout_secs() -> u64 {
    300
}

fn default_max_connections() -> usize {
    10
}

fn default_acquire_timeout_ms() -> u64 {
    5_000
}

fn default_max_idle_secs() -> u64 {
    300
}

fn default_fs_retries() -> u32 {
    3
}

fn default_fs_retry_delay_ms() -> u64 {
    100
}

/// Main configuration structure for the Tether Agent
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct AgentConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub terminal: TerminalConfig,
    #[serde(default)]
    pub pool: PoolConfig,
    #[serde(default)]
    pub permissions: PermissionConfig,
    #[serde(default)]
    pub fs: FsConfig,
}

/// Server configuration options
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ServerConfig {
    /// Port for the one-shot HTTP surface (stdio is used when unset)
    pub port: Option<u16>,
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: None,
            log_level: default_log_level(),
        }
    }
}

/// Policy for client-hosted terminals
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TerminalConfig {
    /// Whether terminal tooling is enabled at all
    #[serde(default = "crate::config::default_true")]
    pub enabled: bool,
    /// When set, the command's first token must be in this list
    pub allowed_commands: Option<Vec<String>>,
    /// Commands containing any of these substrings are rejected
    #[serde(default)]
    pub forbidden_commands: Vec<String>,
    #[serde(default = "default_max_concurrent_terminals")]
    pub max_concurrent_terminals: usize,
    /// Applied when a create request does not name a limit
    #[serde(default = "default_output_byte_limit")]
    pub default_output_byte_limit: u64,
    /// Requests above this are capped, with a warning
    #[serde(default = "default_max_output_byte_limit")]
    pub max_output_byte_limit: u64,
}

pub(crate) fn default_true() -> bool {
    true
}

impl Default for TerminalConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            allowed_commands: None,
            forbidden_commands: Vec::new(),
            max_concurrent_terminals: default_max_concurrent_terminals(),
            default_output_byte_limit: default_output_byte_limit(),
            max_output_byte_limit: default_max_output_byte_limit(),
        }
    }
}

/// Connection pool tuning
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct PoolConfig {
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
    #[serde(default = "default_acquire_timeout_ms")]
    pub acquire_timeout_ms: u64,
    #[serde(default = "default_max_idle_secs")]
    pub max_idle_secs: u64,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_connections: default_max_connections(),
            acquire_timeout_ms: default_acquire_timeout_ms(),
            max_idle_secs: default_max_idle_secs(),
        }
    }
}

impl PoolConfig {
    pub fn acquire_timeout(&self) -> Duration {
        Duration::from_millis(self.acquire_timeout_ms)
    }

    pub fn max_idle_time(&self) -> Duration {
        Duration::from_secs(self.max_idle_secs)
    }
}

/// Permission broker tuning
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct PermissionConfig {
    /// How long an interactive permission request may stay pending before
    /// it resolves as reject-once
    #[serde(default = "default_permission_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for PermissionConfig {
    fn default() -> Self {
        Self {
            timeout_secs: default_permission_timeout_secs(),
        }
    }
}

impl PermissionConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

/// Filesystem reverse-call tuning
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct FsConfig {
    /// Retry budget for transient read failures
    #[serde(default = "default_fs_retries")]
    pub retries: u32,
    /// Base delay; attempt N waits `retry_delay * N`
    #[serde(default = "default_fs_retry_delay_ms")]
    pub retry_delay_ms: u64,
}

impl Default for FsConfig {
    fn default() -> Self {
        Self {
            retries: default_fs_retries(),
            retry_delay_ms: default_fs_retry_delay_ms(),
        }
    }
}

impl FsConfig {
    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }
}

impl AgentConfig {
    /// Validate the configuration.
    ///
    /// Validation is tolerant of not-yet-wired subsystems (a tool provider
    /// with zero tools is fine until client capabilities arrive); genuine
    /// misconfiguration is an error.
    pub fn validate(&self) -> crate::Result<()> {
        if !["error", "warn", "info", "debug", "trace"].contains(&self.server.log_level.as_str()) {
            return Err(crate::AgentError::Config(format!(
                "Invalid log level: {}",
                self.server.log_level
            )));
        }

        if self.terminal.enabled && self.terminal.max_concurrent_terminals == 0 {
            return Err(crate::AgentError::Config(
                "Terminal support enabled but max_concurrent_terminals is 0".to_string(),
            ));
        }

        if self.terminal.default_output_byte_limit > self.terminal.max_output_byte_limit {
            return Err(crate::AgentError::Config(format!(
                "Default output byte limit {} exceeds maximum {}",
                self.terminal.default_output_byte_limit, self.terminal.max_output_byte_limit
            )));
        }

        if self.pool.max_connections == 0 {
            return Err(crate::AgentError::Config(
                "Pool max_connections must be at least 1".to_string(),
            ));
        }

        Ok(())
    }

    /// Load configuration from a JSON string
    pub fn from_json(json: &str) -> crate::Result<Self> {
        let config: AgentConfig = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Serialize configuration to a JSON string
    pub fn to_json(&self) -> crate::Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }
}
