//! Security audit trail.
//!
//! Records object lifecycle events and refused operations. The in-memory log
//! is append-only and bounded; attached sinks receive every record, so a
//! persistent copy is never truncated.

use std::collections::VecDeque;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::Path;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::message::MessageKind;
use crate::types::{Handle, ObjectRef, ObjectType};

/// A sink that receives audit records. Implement this to forward records
/// to a file, a database or a remote collector.
pub trait AuditSink: Send {
    /// Append a record. Called for every audited event.
    fn append(&mut self, record: AuditRecord);
}

/// What happened.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum AuditEvent {
    Created { object_type: ObjectType },
    Destroyed,
    /// A message was refused by an access check.
    AccessDenied { message: String },
    /// Action permissions were narrowed.
    PermissionsRestricted { from: u32, to: u32 },
    DependencyAttached { dependent: Handle },
    TableGrown { size: usize },
    Shutdown,
}

/// A permanent record of a security-relevant event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditRecord {
    /// The object concerned.
    pub handle: Handle,
    /// Its unique ID, so records about a reused slot stay distinguishable.
    pub unique_id: u64,
    pub event: AuditEvent,
    /// When the event occurred.
    pub timestamp: DateTime<Utc>,
}

impl AuditRecord {
    pub(crate) fn new(object: ObjectRef, event: AuditEvent) -> Self {
        Self {
            handle: object.handle,
            unique_id: object.unique_id,
            event,
            timestamp: Utc::now(),
        }
    }

    pub(crate) fn denied(object: ObjectRef, kind: MessageKind) -> Self {
        Self::new(
            object,
            AuditEvent::AccessDenied {
                message: format!("{kind:?}"),
            },
        )
    }
}

/// A bounded, append-only log of audit records.
/// Can forward records to additional sinks via `add_forward_sink`.
pub struct AuditLog {
    records: VecDeque<AuditRecord>,
    capacity: usize,
    forward_sinks: Vec<Box<dyn AuditSink>>,
}

impl std::fmt::Debug for AuditLog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuditLog")
            .field("records", &self.records.len())
            .field("capacity", &self.capacity)
            .field("forward_sinks", &self.forward_sinks.len())
            .finish()
    }
}

impl AuditLog {
    pub fn new(capacity: usize) -> Self {
        Self {
            records: VecDeque::new(),
            capacity: capacity.max(1),
            forward_sinks: Vec::new(),
        }
    }

    /// Add a sink to receive a copy of every record.
    pub fn add_forward_sink(&mut self, sink: Box<dyn AuditSink>) {
        self.forward_sinks.push(sink);
    }

    /// Append a new record and forward it to any attached sinks.
    pub fn append(&mut self, record: AuditRecord) {
        for sink in self.forward_sinks.iter_mut() {
            sink.append(record.clone());
        }
        if self.records.len() == self.capacity {
            self.records.pop_front();
        }
        self.records.push_back(record);
    }

    /// Return the number of records held in memory.
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// Returns true if the log is empty.
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Iterate over the records, oldest first.
    pub fn iter(&self) -> impl Iterator<Item = &AuditRecord> {
        self.records.iter()
    }
}

// ---------------------------------------------------------------------------
// Built-in sink: file
// ---------------------------------------------------------------------------

/// Writes audit records as JSON lines (one per record) to a file.
/// Creates the file if it doesn't exist; appends if it does.
pub struct FileAuditSink {
    file: std::fs::File,
}

impl FileAuditSink {
    /// Open or create a file for append-only audit logging.
    pub fn new(path: impl AsRef<Path>) -> Result<Self, std::io::Error> {
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self { file })
    }
}

impl AuditSink for FileAuditSink {
    fn append(&mut self, record: AuditRecord) {
        if let Ok(line) = serde_json::to_string(&record) {
            let _ = writeln!(self.file, "{line}");
            let _ = self.file.flush();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    struct Collect(Arc<Mutex<Vec<AuditRecord>>>);

    impl AuditSink for Collect {
        fn append(&mut self, record: AuditRecord) {
            self.0.lock().unwrap().push(record);
        }
    }

    fn object(n: u32) -> ObjectRef {
        ObjectRef {
            handle: Handle::from_raw(n),
            unique_id: u64::from(n) + 100,
        }
    }

    #[test]
    fn test_log_is_bounded_but_sinks_see_everything() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let mut log = AuditLog::new(2);
        log.add_forward_sink(Box::new(Collect(Arc::clone(&seen))));

        for n in 0..5 {
            log.append(AuditRecord::new(object(n), AuditEvent::Destroyed));
        }

        assert_eq!(log.len(), 2);
        assert_eq!(log.iter().next().unwrap().handle, Handle::from_raw(3));
        assert_eq!(seen.lock().unwrap().len(), 5);
    }

    #[test]
    fn test_record_serialises_with_tagged_event() {
        let record = AuditRecord::denied(object(9), MessageKind::CtxEncrypt);
        let json = serde_json::to_string(&record).unwrap();
        assert!(json.contains(r#""event":"access_denied""#));
        assert!(json.contains("CtxEncrypt"));
    }
}
