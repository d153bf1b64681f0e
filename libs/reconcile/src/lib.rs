//! Reconciliation primitives for managed pairs.
//!
//! - [`gate_pass`] decides whether an invocation does a real pass. Cadence
//!   is anchored on the last real pass, so no-op invocations never shift it.
//! - [`TransitionTable`] holds the declarative pair and upgrade tables.
//!
//! # Invariants
//!
//! - Gating is deterministic given the same status, generation and clock
//! - Table lookups are pure; an unknown cell never panics

mod error;
mod gate;
mod transitions;

pub use error::{ReconcileError, ReconcileResult};
pub use gate::{gate_pass, GateDecision, GateReason};
pub use transitions::{table_health, Transition, TransitionTable};
pub use ttpair_model::DEFAULT_POLLING_INTERVAL;
