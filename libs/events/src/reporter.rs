//! The reporter that every component uses to emit audit records.

use std::sync::Arc;

use chrono::Utc;
use tracing::{debug, error, warn};
use ttpair_model::{ManagedPair, ObjectKey, UnitStatus};

use crate::delta::unit_changes;
use crate::error::EventResult;
use crate::record::{reason, truncate_message, AuditRecord, EventNamer, Severity};
use crate::sink::AuditSink;

/// Message recorded when the sink rejects a record for lack of permissions.
pub const PERMISSION_FAILURE_MESSAGE: &str =
    "Failed to create event: Lack of permissions to perform cluster action";

/// Emits audit records about managed pairs.
///
/// Recording never fails the caller. A sink error is logged; a permission
/// error is additionally reported once as its own record.
pub struct EventReporter {
    sink: Arc<dyn AuditSink>,
    namer: EventNamer,
}

impl EventReporter {
    pub fn new(sink: Arc<dyn AuditSink>) -> Self {
        Self {
            sink,
            namer: EventNamer::new(),
        }
    }

    /// Record one message about `pair`. Empty messages are skipped.
    pub async fn record(
        &self,
        pair: &mut ManagedPair,
        severity: Severity,
        reason: &str,
        message: impl AsRef<str>,
    ) {
        let message = message.as_ref();
        if message.is_empty() {
            return;
        }
        pair.status.last_event += 1;
        let key = pair.key();

        match self.emit(&key, severity, reason, message).await {
            Ok(()) => {}
            Err(e) if e.is_permission_denied() => {
                warn!(pair = %key, error = %e, "Audit record rejected for lack of permissions");
                if let Err(e) = self
                    .emit(
                        &key,
                        Severity::Warning,
                        reason::FAILED_CREATE_EVENT,
                        PERMISSION_FAILURE_MESSAGE,
                    )
                    .await
                {
                    error!(pair = %key, error = %e, "Failed to report permission failure");
                }
            }
            Err(e) => {
                warn!(pair = %key, reason, error = %e, text = message, "Failed to create audit record");
            }
        }
    }

    pub async fn normal(&self, pair: &mut ManagedPair, reason: &str, message: impl AsRef<str>) {
        self.record(pair, Severity::Normal, reason, message).await;
    }

    pub async fn warning(&self, pair: &mut ManagedPair, reason: &str, message: impl AsRef<str>) {
        self.record(pair, Severity::Warning, reason, message).await;
    }

    /// Report how unit `index` changed since `before` was taken.
    pub async fn report_unit_changes(
        &self,
        pair: &mut ManagedPair,
        before: &UnitStatus,
        index: usize,
    ) {
        let Some(current) = pair.status.units.get(index) else {
            return;
        };
        let deltas = unit_changes(
            before,
            current,
            pair.status.high_level_state,
            pair.is_replicated(),
        );
        debug!(unit = %current.name, count = deltas.len(), "Unit changes");
        for delta in deltas {
            self.record(pair, delta.severity, delta.reason, &delta.message)
                .await;
        }
    }

    async fn emit(
        &self,
        key: &ObjectKey,
        severity: Severity,
        reason: &str,
        message: &str,
    ) -> EventResult<()> {
        let now = Utc::now();
        let record = AuditRecord {
            name: self.namer.next_name(now),
            object: key.clone(),
            severity,
            reason: reason.to_string(),
            message: truncate_message(message).to_string(),
            timestamp: now,
        };
        self.sink.emit(&record).await
    }
}
