//! Error types for the persisted model.

use thiserror::Error;

/// Errors produced while interpreting persisted documents.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ModelError {
    /// A token is not part of its vocabulary.
    #[error("unknown {vocabulary} token: {token:?}")]
    UnknownToken {
        vocabulary: &'static str,
        token: String,
    },

    /// A unit index does not exist in the status list.
    #[error("unit index {index} out of range ({len} units)")]
    UnitOutOfRange { index: usize, len: usize },
}
