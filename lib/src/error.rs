//! Error types for the Tether Agent

use thiserror::Error;

/// JSON-RPC error code for a malformed request envelope
pub const INVALID_REQUEST: i64 = -32600;
/// JSON-RPC error code for an unknown method
pub const METHOD_NOT_FOUND: i64 = -32601;
/// JSON-RPC error code for invalid parameters
pub const INVALID_PARAMS: i64 = -32602;
/// JSON-RPC error code for internal errors
pub const INTERNAL_ERROR: i64 = -32603;

/// Main error type for the Tether Agent
#[derive(Error, Debug)]
pub enum AgentError {
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Method not found: {0}")]
    MethodNotFound(String),

    #[error("{0}")]
    InvalidParams(String),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Session error: {0}")]
    Session(String),

    #[error("Tool execution error: {0}")]
    ToolExecution(String),

    #[error("Permission denied: {0}")]
    Permission(String),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Operation cancelled")]
    Cancelled,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl AgentError {
    /// Map this error onto the JSON-RPC error code it travels as.
    ///
    /// Everything that is not a well-known protocol-level failure maps to
    /// `-32603` internal error with a descriptive message.
    pub fn json_rpc_code(&self) -> i64 {
        match self {
            AgentError::InvalidRequest(_) => INVALID_REQUEST,
            AgentError::MethodNotFound(_) => METHOD_NOT_FOUND,
            AgentError::InvalidParams(_) => INVALID_PARAMS,
            _ => INTERNAL_ERROR,
        }
    }

    /// Whether a failed client call is worth retrying.
    ///
    /// Validation, routing, and permission failures are deterministic;
    /// transport and IO failures may be transient.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            AgentError::Transport(_) | AgentError::Io(_) | AgentError::Protocol(_)
        )
    }
}

/// Convenience type alias for Results using AgentError
pub type Result<T> = std::result::Result<T, AgentError>;

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;

    #[test]
    fn test_error_display() {
        let err = AgentError::Protocol("capability missing".to_string());
        assert_eq!(err.to_string(), "Protocol error: capability missing");

        let err = AgentError::Session("session timeout".to_string());
        assert_eq!(err.to_string(), "Session error: session timeout");

        let err = AgentError::MethodNotFound("foo/bar".to_string());
        assert_eq!(err.to_string(), "Method not found: foo/bar");

        let err = AgentError::InvalidParams("cwd must be a string".to_string());
        assert_eq!(err.to_string(), "cwd must be a string");
    }

    #[test]
    fn test_json_rpc_code_mapping() {
        assert_eq!(
            AgentError::InvalidRequest("bad".into()).json_rpc_code(),
            INVALID_REQUEST
        );
        assert_eq!(
            AgentError::MethodNotFound("x".into()).json_rpc_code(),
            METHOD_NOT_FOUND
        );
        assert_eq!(
            AgentError::InvalidParams("x".into()).json_rpc_code(),
            INVALID_PARAMS
        );
        assert_eq!(
            AgentError::Protocol("x".into()).json_rpc_code(),
            INTERNAL_ERROR
        );
        assert_eq!(
            AgentError::ToolExecution("x".into()).json_rpc_code(),
            INTERNAL_ERROR
        );
    }

    #[test]
    fn test_transient_classification() {
        assert!(AgentError::Transport("reset".into()).is_transient());
        assert!(
            AgentError::Io(io::Error::new(io::ErrorKind::Interrupted, "interrupted"))
                .is_transient()
        );
        assert!(!AgentError::InvalidParams("bad".into()).is_transient());
        assert!(!AgentError::Permission("rejected".into()).is_transient());
    }

    #[test]
    fn test_io_error_conversion() {
        let io_error = io::Error::new(io::ErrorKind::NotFound, "file not found");
        let agent_error: AgentError = io_error.into();

        match agent_error {
            AgentError::Io(_) => {}
            _ => panic!("Expected Io variant"),
        }
    }

    #[test]
    fn test_serde_error_conversion() {
        let json = "{invalid json";
        let serde_error = serde_json::from_str::<serde_json::Value>(json).unwrap_err();
        let agent_error: AgentError = serde_error.into();

        match agent_error {
            AgentError::Serialization(_) => {}
            _ => panic!("Expected Serialization variant"),
        }
    }
}
