//! # ttpair-model
//!
//! Persisted document types for replicated in-memory database pairs.
//!
//! A [`ManagedPair`] holds the desired [`PairSpec`] and the operator-written
//! [`PairStatus`]. The status carries:
//! - the pair-level high-level state with its previous value and switch time
//! - one [`UnitStatus`] per managed unit (database units first, subscribers after)
//! - the single outstanding [`AsyncStatus`]
//! - rolling upgrade bookkeeping ([`UpgradeStatus`])
//! - the subscriber group's aggregate state
//!
//! All state tokens are closed vocabularies persisted as plain strings.

#[macro_use]
mod macros;

mod error;
mod pair;
mod states;
mod unit;

pub use error::ModelError;
pub use pair::*;
pub use states::*;
pub use unit::*;

/// Result type for model operations.
pub type ModelResult<T> = Result<T, ModelError>;
