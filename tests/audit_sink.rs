//! Tests for forwarding audit records to attached sinks.

use std::sync::{Arc, Mutex};

use hexkernel::{
    Attribute, AuditEvent, AuditRecord, AuditSink, FileAuditSink, Kernel, KernelConfig, KernelError,
    ObjectType, SubType,
};

/// A test sink that collects records into a shared Vec.
struct SharedVecSink {
    records: Arc<Mutex<Vec<AuditRecord>>>,
}

impl SharedVecSink {
    fn new(records: Arc<Mutex<Vec<AuditRecord>>>) -> Self {
        Self { records }
    }
}

impl AuditSink for SharedVecSink {
    fn append(&mut self, record: AuditRecord) {
        self.records.lock().unwrap().push(record);
    }
}

fn kernel() -> Kernel {
    Kernel::init(KernelConfig {
        lock_pages: false,
        ..KernelConfig::default()
    })
    .unwrap()
}

#[test]
fn test_forward_sink_receives_records() {
    let kernel = kernel();
    let records = Arc::new(Mutex::new(Vec::new()));
    kernel.add_audit_sink(Box::new(SharedVecSink::new(Arc::clone(&records))));

    // 1. Create and destroy one object.
    let ctx = kernel.create_object(ObjectType::Context, SubType::CTX_CONV, 0).unwrap();
    let unique_id = kernel.unique_id(ctx).unwrap();
    kernel.destroy_object(ctx).unwrap();

    // 2. The sink saw both events for that object.
    let collected = records.lock().unwrap();
    let events: Vec<_> = collected
        .iter()
        .filter(|r| r.handle == ctx && r.unique_id == unique_id)
        .map(|r| r.event.clone())
        .collect();
    assert_eq!(
        events,
        vec![
            AuditEvent::Created {
                object_type: ObjectType::Context
            },
            AuditEvent::Destroyed,
        ]
    );

    // 3. The in-memory log holds the same records.
    let in_memory = kernel
        .audit_records()
        .into_iter()
        .filter(|r| r.handle == ctx)
        .count();
    assert_eq!(in_memory, 2);
}

#[test]
fn test_forward_sink_sees_refusals() {
    let kernel = kernel();
    let records = Arc::new(Mutex::new(Vec::new()));
    kernel.add_audit_sink(Box::new(SharedVecSink::new(Arc::clone(&records))));

    let ctx = kernel.create_object(ObjectType::Context, SubType::CTX_CONV, 0).unwrap();
    assert_eq!(
        kernel.get_attribute(ctx, Attribute::ActionPerms),
        Err(KernelError::Permission)
    );

    let denied = records
        .lock()
        .unwrap()
        .iter()
        .any(|r| r.handle == ctx && matches!(r.event, AuditEvent::AccessDenied { .. }));
    assert!(denied, "refused message not forwarded");
}

#[test]
fn test_file_sink_writes_json_lines() {
    let path = std::env::temp_dir().join(format!("hexkernel-audit-{}.jsonl", std::process::id()));
    let _ = std::fs::remove_file(&path);

    {
        let kernel = kernel();
        kernel.add_audit_sink(Box::new(FileAuditSink::new(&path).unwrap()));
        let ctx = kernel.create_object(ObjectType::Context, SubType::CTX_HASH, 0).unwrap();
        kernel.destroy_object(ctx).unwrap();
    }

    let contents = std::fs::read_to_string(&path).unwrap();
    let _ = std::fs::remove_file(&path);
    let lines: Vec<_> = contents.lines().collect();
    assert!(lines.len() >= 2);
    assert!(lines.iter().any(|l| l.contains(r#""event":"created""#)));
    assert!(lines.iter().any(|l| l.contains(r#""event":"destroyed""#)));
    for line in lines {
        serde_json::from_str::<AuditRecord>(line).unwrap();
    }
}
