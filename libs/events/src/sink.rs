//! Audit sinks.

use std::sync::Mutex;

use async_trait::async_trait;
use tracing::{info, warn};

use crate::error::EventResult;
use crate::record::{AuditRecord, Severity};

/// Destination of audit records.
#[async_trait]
pub trait AuditSink: Send + Sync {
    async fn emit(&self, record: &AuditRecord) -> EventResult<()>;
}

/// Writes records as structured `tracing` events on target `audit`.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

#[async_trait]
impl AuditSink for TracingSink {
    async fn emit(&self, record: &AuditRecord) -> EventResult<()> {
        match record.severity {
            Severity::Normal => info!(
                target: "audit",
                name = %record.name,
                object = %record.object,
                reason = %record.reason,
                "{}",
                record.message
            ),
            Severity::Warning => warn!(
                target: "audit",
                name = %record.name,
                object = %record.object,
                reason = %record.reason,
                "{}",
                record.message
            ),
        }
        Ok(())
    }
}

/// Keeps records in memory.
#[derive(Debug, Default)]
pub struct MemorySink {
    records: Mutex<Vec<AuditRecord>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of everything emitted so far.
    pub fn records(&self) -> Vec<AuditRecord> {
        match self.records.lock() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    /// Messages of everything emitted so far.
    pub fn messages(&self) -> Vec<String> {
        self.records().into_iter().map(|r| r.message).collect()
    }

    pub fn clear(&self) {
        match self.records.lock() {
            Ok(mut guard) => guard.clear(),
            Err(poisoned) => poisoned.into_inner().clear(),
        }
    }
}

#[async_trait]
impl AuditSink for MemorySink {
    async fn emit(&self, record: &AuditRecord) -> EventResult<()> {
        match self.records.lock() {
            Ok(mut guard) => guard.push(record.clone()),
            Err(poisoned) => poisoned.into_inner().push(record.clone()),
        }
        Ok(())
    }
}
