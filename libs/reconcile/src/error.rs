//! Reconciliation errors.

use std::time::Duration;

use thiserror::Error;

/// Errors raised while reconciling a managed pair.
#[derive(Debug, Error)]
pub enum ReconcileError {
    /// The managed object no longer exists.
    #[error("resource not found: {0}")]
    NotFound(String),

    /// Conflict detected (concurrent modification).
    #[error("conflict: {0}")]
    Conflict(String),

    /// Timeout waiting for an operation.
    #[error("timeout after {elapsed:?} waiting for {resource}")]
    Timeout {
        resource: String,
        elapsed: Duration,
    },

    /// Transition data could not be loaded.
    #[error("invalid transition table: {0}")]
    InvalidTransitions(String),

    /// Internal error.
    #[error("internal error: {0}")]
    Internal(String),
}

/// Result type for reconciliation operations.
pub type ReconcileResult<T> = Result<T, ReconcileError>;
