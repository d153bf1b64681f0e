//! Audit records and their names.

use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use ttpair_model::ObjectKey;

/// Longest message accepted by the audit sink.
pub const MAX_MESSAGE_LEN: usize = 1022;

/// Reasons attached to audit records.
pub mod reason {
    pub const STATE_CHANGE: &str = "StateChange";
    pub const INFO: &str = "Info";
    pub const ERROR: &str = "Error";
    pub const FATAL: &str = "Fatal";
    pub const FAILED_CREATE: &str = "FailedCreate";
    pub const FAILED_CREATE_EVENT: &str = "FailedCreateEvent";
    pub const FAILED_GET_STATUS: &str = "FailedGetStatus";
    pub const FAILED_UPGRADE: &str = "FailedUpgrade";
    pub const UPGRADE: &str = "Upgrade";
    pub const UPGRADE_ERROR: &str = "UpgradeError";
    pub const TASK_FAILED: &str = "TaskFailed";
    pub const TASK_INFO: &str = "TaskInfo";
}

/// Severity of an audit record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Severity {
    Normal,
    Warning,
}

impl std::fmt::Display for Severity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Severity::Normal => write!(f, "Normal"),
            Severity::Warning => write!(f, "Warning"),
        }
    }
}

/// One audit record about a managed object.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditRecord {
    /// Unique name, `tt<epoch secs>-<discriminator>`.
    pub name: String,
    pub object: ObjectKey,
    pub severity: Severity,
    pub reason: String,
    pub message: String,
    pub timestamp: DateTime<Utc>,
}

/// Generates record names that are unique within one process.
///
/// Names combine the ten-digit epoch second with a four-digit
/// discriminator that counts records created in the same second and
/// restarts at zero when the second changes.
#[derive(Debug, Default)]
pub struct EventNamer {
    state: Mutex<NamerState>,
}

#[derive(Debug, Default)]
struct NamerState {
    second: i64,
    discriminator: u32,
}

impl EventNamer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Name for a record created at `now`.
    pub fn next_name(&self, now: DateTime<Utc>) -> String {
        let second = now.timestamp();
        let discriminator = {
            let mut state = match self.state.lock() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            if state.second == second {
                state.discriminator += 1;
            } else {
                state.second = second;
                state.discriminator = 0;
            }
            state.discriminator
        };
        format_name(second, discriminator)
    }
}

fn format_name(second: i64, discriminator: u32) -> String {
    format!("tt{:010}-{:04}", second, discriminator)
}

/// Cut a message to [`MAX_MESSAGE_LEN`] bytes on a character boundary.
pub fn truncate_message(message: &str) -> &str {
    if message.len() <= MAX_MESSAGE_LEN {
        return message;
    }
    let mut end = MAX_MESSAGE_LEN;
    while !message.is_char_boundary(end) {
        end -= 1;
    }
    &message[..end]
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use proptest::prelude::*;

    #[test]
    fn test_discriminator_resets_each_second() {
        let namer = EventNamer::new();
        let t0 = Utc.timestamp_opt(1_700_000_000, 0).unwrap();
        let t1 = Utc.timestamp_opt(1_700_000_001, 0).unwrap();

        assert_eq!(namer.next_name(t0), "tt1700000000-0000");
        assert_eq!(namer.next_name(t0), "tt1700000000-0001");
        assert_eq!(namer.next_name(t1), "tt1700000001-0000");
    }

    #[test]
    fn test_truncate_respects_char_boundary() {
        let long = "é".repeat(600);
        let cut = truncate_message(&long);
        assert!(cut.len() <= MAX_MESSAGE_LEN);
        assert_eq!(cut.chars().count(), MAX_MESSAGE_LEN / 2);
        assert_eq!(truncate_message("short"), "short");
    }

    proptest! {
        #[test]
        fn names_within_a_second_are_unique(count in 1usize..200, second in 0i64..4_000_000_000) {
            let namer = EventNamer::new();
            let now = Utc.timestamp_opt(second, 0).unwrap();
            let mut names: Vec<String> = (0..count).map(|_| namer.next_name(now)).collect();
            names.sort();
            names.dedup();
            prop_assert_eq!(names.len(), count);
        }

        #[test]
        fn name_shape_is_fixed(second in 0i64..9_999_999_999, discriminator in 0u32..10_000) {
            let name = format_name(second, discriminator);
            prop_assert_eq!(name.len(), 2 + 10 + 1 + 4);
            prop_assert!(name.starts_with("tt"));
        }
    }
}
