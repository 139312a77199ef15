//! Common validation utilities shared across the protocol surface
//!
//! Validation functions here return bool or `Option<String>` rather than
//! `Result` so that call sites can keep their domain-specific error types
//! while the actual checks stay in one place.

/// Check if a string is empty or contains only whitespace
#[inline]
pub fn is_blank_str(value: &str) -> bool {
    value.trim().is_empty()
}

/// Check whether a path string is absolute from the client's point of view.
///
/// Clients may run on a different platform than the agent, so this accepts
/// both Unix absolute paths (`/home/user`) and Windows absolute paths with
/// either separator (`C:\work`, `D:/work`). `std::path::Path::is_absolute`
/// would reject the foreign platform's shape, which is why the check is
/// done on the raw string.
pub fn is_absolute_client_path(path: &str) -> bool {
    let mut chars = path.chars();
    match chars.next() {
        Some('/') => true,
        Some(c) if c.is_ascii_alphabetic() => {
            matches!(chars.next(), Some(':')) && matches!(chars.next(), Some('/') | Some('\\'))
        }
        _ => false,
    }
}

/// Validate a `cwd` parameter as it arrives on the wire.
///
/// Returns `None` when valid, or `Some(reason)` suitable for an invalid
/// params error. Non-string values (or a missing field) are reported as a
/// type error; relative paths as an absolute-path error.
pub fn validate_cwd_param(value: Option<&serde_json::Value>) -> Option<String> {
    match value {
        Some(serde_json::Value::String(cwd)) => {
            if is_absolute_client_path(cwd) {
                None
            } else {
                Some(format!("cwd must be an absolute path, got: {}", cwd))
            }
        }
        Some(_) => Some("cwd must be a string".to_string()),
        None => Some("cwd must be a string".to_string()),
    }
}
