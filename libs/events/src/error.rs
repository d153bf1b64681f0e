//! Error types for audit record emission.

use thiserror::Error;

/// Text fragment that marks an authorization denial from the cluster.
const PERMISSION_SIGNATURE: &str = "forbidden";

/// Errors that can occur when emitting audit records.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum EventError {
    /// The sink refused the record because the operator lacks permissions.
    #[error("permission denied: {0}")]
    PermissionDenied(String),

    /// Any other sink failure.
    #[error("audit sink error: {0}")]
    Sink(String),
}

impl EventError {
    /// Classify a raw sink error message.
    pub fn from_message(message: impl Into<String>) -> Self {
        let message = message.into();
        if is_permission_error(&message) {
            EventError::PermissionDenied(message)
        } else {
            EventError::Sink(message)
        }
    }

    pub fn is_permission_denied(&self) -> bool {
        matches!(self, EventError::PermissionDenied(_))
    }
}

/// Returns true if an error text carries the authorization-denial signature.
pub fn is_permission_error(text: &str) -> bool {
    text.to_ascii_lowercase().contains(PERMISSION_SIGNATURE)
}

/// Result type for event operations.
pub type EventResult<T> = Result<T, EventError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classification() {
        assert!(EventError::from_message("events is Forbidden: user cannot create").is_permission_denied());
        assert!(!EventError::from_message("connection reset").is_permission_denied());
    }
}
