//! # ttpair-events
//!
//! Audit trail for managed pairs.
//!
//! - [`EventReporter`] emits records and never fails its caller
//! - [`unit_changes`] filters a unit's state delta down to the lines worth saying
//! - [`EventNamer`] names records `tt<epoch secs>-<discriminator>`
//! - [`AuditSink`] is where records go ([`TracingSink`] in production,
//!   [`MemorySink`] in tests)

mod delta;
mod error;
mod record;
mod reporter;
mod sink;

pub use delta::{unit_changes, UnitDelta};
pub use error::{is_permission_error, EventError, EventResult};
pub use record::{reason, truncate_message, AuditRecord, EventNamer, Severity, MAX_MESSAGE_LEN};
pub use reporter::{EventReporter, PERMISSION_FAILURE_MESSAGE};
pub use sink::{AuditSink, MemorySink, TracingSink};
