//! The reference monitor.
//!
//! Every operation on every object goes through [`Kernel::send_message`]. The
//! kernel owns the object table, the deferred-message queue, the secure
//! allocator backing object instances and the audit trail. All table state
//! lives behind one mutex that is held only for short, bounded sections and
//! never across a call into an object's handler.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard};

use crate::alloc::SecureAllocator;
use crate::audit::{AuditEvent, AuditLog, AuditRecord, AuditSink};
use crate::config::KernelConfig;
use crate::error::{kernel_trap, KernelError, KernelResult};
use crate::message::{Attribute, MessageKind, Payload};
use crate::types::{Handle, ObjectRef, ObjectType};

mod access;
mod dependency;
mod dispatch;
mod hooks;
mod lifecycle;
mod properties;
mod queue;
mod route;
mod table;
mod wait;

pub(crate) use table::ObjectRecord;

use dispatch::Message;
use queue::MessageQueue;
use table::ObjectTable;

/// Everything guarded by the table lock.
#[derive(Debug)]
pub(crate) struct KernelState {
    pub table: ObjectTable,
    pub queue: MessageQueue,
    /// Audit records raised with the table locked. Sinks may do I/O or call
    /// back into the kernel, so they only ever see these after unlocking.
    audit_backlog: Vec<AuditRecord>,
}

impl KernelState {
    pub(crate) fn audit_later(&mut self, record: AuditRecord) {
        self.audit_backlog.push(record);
    }
}

/// A running kernel instance.
///
/// Created once with [`Kernel::init`]; [`Kernel::shutdown`] (or drop)
/// destroys every remaining object, dependents before the objects they
/// depend on and the system object last.
pub struct Kernel {
    config: KernelConfig,
    state: Mutex<KernelState>,
    shutting_down: AtomicBool,
    allocator: SecureAllocator,
    audit: Mutex<AuditLog>,
}

impl std::fmt::Debug for Kernel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Kernel")
            .field("config", &self.config)
            .field("shutting_down", &self.is_shutting_down())
            .finish_non_exhaustive()
    }
}

impl Kernel {
    /// Validate `config`, check the ACL tables, create the system device and
    /// default user, then optionally run the self-test.
    ///
    /// An inconsistent ACL table is fatal. A failed self-test returns
    /// [`KernelError::Failed`].
    pub fn init(config: KernelConfig) -> KernelResult<Self> {
        config.validate()?;
        if let Err(defect) = crate::acl::check_tables() {
            kernel_trap!("ACL self-check failed: {defect}");
        }

        let allocator = SecureAllocator::new(config.lock_pages, config.max_alloc_size)?;
        let state = KernelState {
            table: ObjectTable::new(
                config.initial_table_size,
                config.max_table_size,
                table::time_seed(),
            ),
            queue: MessageQueue::new(config.max_queue_len),
            audit_backlog: Vec::new(),
        };
        let kernel = Self {
            audit: Mutex::new(AuditLog::new(config.audit_capacity)),
            config,
            state: Mutex::new(state),
            shutting_down: AtomicBool::new(false),
            allocator,
        };

        kernel.create_system_objects()?;
        if kernel.config.run_self_test {
            crate::selftest::run(&kernel).map_err(|e| {
                log::error!("kernel self-test failed: {e}");
                KernelError::Failed
            })?;
        }
        log::debug!(
            "kernel up: {} table slots, {} objects",
            kernel.config.initial_table_size,
            kernel.object_count()
        );
        Ok(kernel)
    }

    pub fn config(&self) -> &KernelConfig {
        &self.config
    }

    pub(crate) fn lock_state(&self) -> MutexGuard<'_, KernelState> {
        self.state
            .lock()
            .unwrap_or_else(|_| kernel_trap!("object table lock poisoned"))
    }

    pub(crate) fn allocator(&self) -> &SecureAllocator {
        &self.allocator
    }

    /// Append to the audit log. Never called with the table locked.
    pub(crate) fn audit(&self, record: AuditRecord) {
        match self.audit.lock() {
            Ok(mut log) => log.append(record),
            Err(_) => kernel_trap!("audit log lock poisoned"),
        }
    }

    /// Move records queued with [`KernelState::audit_later`] to the log.
    /// The caller must not hold the table lock.
    pub(crate) fn flush_audit(&self) {
        let backlog = std::mem::take(&mut self.lock_state().audit_backlog);
        for record in backlog {
            self.audit(record);
        }
    }

    /// Send a message as an external caller.
    ///
    /// `value` carries the attribute ID, check type, object type and so on,
    /// depending on `kind`. Outputs are written back through `payload`.
    pub fn send_message(
        &self,
        handle: Handle,
        kind: MessageKind,
        payload: &mut Payload<'_>,
        value: i32,
    ) -> KernelResult<()> {
        self.dispatch(handle, Message::external(kind, payload, value))
    }

    /// Send a message from inside the library.
    pub(crate) fn send_internal(
        &self,
        handle: Handle,
        kind: MessageKind,
        payload: &mut Payload<'_>,
        value: i32,
    ) -> KernelResult<()> {
        self.dispatch(handle, Message::internal(kind, payload, value))
    }

    // -----------------------------------------------------------------------
    // Convenience wrappers over send_message
    // -----------------------------------------------------------------------

    /// Create an object through the system device. The new object is
    /// initialised and visible to the caller.
    pub fn create_object(
        &self,
        object_type: ObjectType,
        subtype: crate::types::SubType,
        arg: i32,
    ) -> KernelResult<Handle> {
        let mut info = crate::message::CreateObjectInfo::new(subtype, arg);
        self.send_message(
            Handle::SYSTEM,
            MessageKind::DevCreateObject,
            &mut Payload::Create(&mut info),
            object_type as i32,
        )?;
        info.result.ok_or(KernelError::Failed)
    }

    pub fn destroy_object(&self, handle: Handle) -> KernelResult<()> {
        self.send_message(handle, MessageKind::Destroy, &mut Payload::None, 0)
    }

    pub fn get_attribute(&self, handle: Handle, attribute: Attribute) -> KernelResult<i32> {
        let mut value = 0;
        self.send_message(
            handle,
            MessageKind::GetAttribute,
            &mut Payload::Int(&mut value),
            attribute as i32,
        )?;
        Ok(value)
    }

    pub fn set_attribute(&self, handle: Handle, attribute: Attribute, value: i32) -> KernelResult<()> {
        let mut value = value;
        self.send_message(
            handle,
            MessageKind::SetAttribute,
            &mut Payload::Int(&mut value),
            attribute as i32,
        )
    }

    pub fn get_attribute_data(&self, handle: Handle, attribute: Attribute) -> KernelResult<Vec<u8>> {
        let mut out = Vec::new();
        self.send_message(
            handle,
            MessageKind::GetAttributeS,
            &mut Payload::Output(&mut out),
            attribute as i32,
        )?;
        Ok(out)
    }

    pub fn set_attribute_data(&self, handle: Handle, attribute: Attribute, data: &[u8]) -> KernelResult<()> {
        self.send_message(
            handle,
            MessageKind::SetAttributeS,
            &mut Payload::Data(data),
            attribute as i32,
        )
    }

    pub fn delete_attribute(&self, handle: Handle, attribute: Attribute) -> KernelResult<()> {
        self.send_message(
            handle,
            MessageKind::DeleteAttribute,
            &mut Payload::None,
            attribute as i32,
        )
    }

    pub fn encrypt(&self, handle: Handle, data: &mut [u8]) -> KernelResult<()> {
        self.send_message(handle, MessageKind::CtxEncrypt, &mut Payload::Buffer(data), 0)
    }

    pub fn decrypt(&self, handle: Handle, data: &mut [u8]) -> KernelResult<()> {
        self.send_message(handle, MessageKind::CtxDecrypt, &mut Payload::Buffer(data), 0)
    }

    /// Feed `data` to a hash or MAC context. An empty slice finishes it.
    pub fn hash(&self, handle: Handle, data: &[u8]) -> KernelResult<()> {
        self.send_message(handle, MessageKind::CtxHash, &mut Payload::Data(data), 0)
    }

    pub fn sign(&self, handle: Handle, data: &[u8]) -> KernelResult<Vec<u8>> {
        let mut sig = crate::message::SignatureData {
            data: data.to_vec(),
            signature: Vec::new(),
        };
        self.send_message(handle, MessageKind::CtxSign, &mut Payload::Signature(&mut sig), 0)?;
        Ok(sig.signature)
    }

    pub fn sig_check(&self, handle: Handle, data: &[u8], signature: &[u8]) -> KernelResult<()> {
        let mut sig = crate::message::SignatureData {
            data: data.to_vec(),
            signature: signature.to_vec(),
        };
        self.send_message(handle, MessageKind::CtxSigCheck, &mut Payload::Signature(&mut sig), 0)
    }

    pub fn check(&self, handle: Handle, check: crate::message::CheckType) -> KernelResult<()> {
        self.send_message(handle, MessageKind::Check, &mut Payload::None, check as i32)
    }

    /// `len` random bytes from the system device.
    pub fn get_random(&self, len: usize) -> KernelResult<Vec<u8>> {
        let mut out = vec![0u8; len];
        self.send_message(
            Handle::SYSTEM,
            MessageKind::GetAttributeS,
            &mut Payload::Output(&mut out),
            Attribute::DevRandom as i32,
        )?;
        Ok(out)
    }

    /// Make `handle` depend on `dependent`, optionally taking a reference.
    pub fn set_dependent_object(&self, handle: Handle, dependent: Handle, increment_ref: bool) -> KernelResult<()> {
        let mut dep = dependent.as_value();
        self.send_message(
            handle,
            MessageKind::SetDependent,
            &mut Payload::Int(&mut dep),
            i32::from(increment_ref),
        )
    }

    // -----------------------------------------------------------------------
    // Audit and diagnostics
    // -----------------------------------------------------------------------

    /// Forward every future audit record to `sink`.
    pub fn add_audit_sink(&self, sink: Box<dyn AuditSink>) {
        match self.audit.lock() {
            Ok(mut log) => log.add_forward_sink(sink),
            Err(_) => kernel_trap!("audit log lock poisoned"),
        }
    }

    /// A copy of the in-memory audit records, oldest first.
    pub fn audit_records(&self) -> Vec<AuditRecord> {
        match self.audit.lock() {
            Ok(log) => log.iter().cloned().collect(),
            Err(_) => kernel_trap!("audit log lock poisoned"),
        }
    }

    /// Number of live objects, including the system objects.
    pub fn object_count(&self) -> usize {
        self.lock_state().table.len()
    }

    pub fn table_size(&self) -> usize {
        self.lock_state().table.size()
    }

    /// True if `handle` names a live object.
    pub fn is_valid_object(&self, handle: Handle) -> bool {
        self.lock_state().table.get(handle).is_some()
    }

    /// The unique ID of the object currently at `handle`.
    pub fn unique_id(&self, handle: Handle) -> Option<u64> {
        self.lock_state().table.get(handle).map(|r| r.unique_id)
    }

    pub(crate) fn object_ref(&self, handle: Handle) -> Option<ObjectRef> {
        self.lock_state().table.object_ref(handle)
    }

    /// Verify the checksum of every live secure block. Returns the number of
    /// blocks checked. A corrupted block is fatal.
    pub fn verify_memory(&self) -> usize {
        self.allocator.verify_all()
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::Acquire)
    }

    /// Destroy every object and refuse further work. Idempotent.
    pub fn shutdown(&self) {
        if self.shutting_down.swap(true, Ordering::AcqRel) {
            return;
        }
        log::debug!("kernel shutting down with {} objects", self.object_count());
        self.destroy_all_objects();
        self.audit(AuditRecord::new(
            ObjectRef {
                handle: Handle::SYSTEM,
                unique_id: 0,
            },
            AuditEvent::Shutdown,
        ));
    }
}

impl Drop for Kernel {
    fn drop(&mut self) {
        if self.state.is_poisoned() {
            // A handler panicked mid-flight. Instances are still zeroised
            // as their blocks drop.
            return;
        }
        self.shutdown();
    }
}
