//! Side channels around the message path.
//!
//! Three narrow exceptions, each restricted to the object kinds that need
//! it:
//! - suspend / resume: the system device and the default user give up their
//!   lock for long operations and take it back afterwards
//! - acquire: certificates and hardware devices lend their handler and
//!   instance to kernel-internal code
//! - key extract / import: raw key bytes move between keyed contexts and a
//!   device doing a wrap or unwrap
//!
//! None of these is reachable from outside the crate.

use std::sync::{Arc, MutexGuard};
use std::thread;

use super::Kernel;
use crate::alloc::SecureBlock;
use crate::error::{kernel_trap, KernelError, KernelResult};
use crate::keys::KeyMaterial;
use crate::objects::ObjectBody;
use crate::types::{Handle, ObjectFlags, ObjectRef, ObjectType, SubType};

/// Lock state given up by [`Kernel::suspend`].
#[must_use = "a suspended object must be resumed"]
#[derive(Debug)]
pub(crate) struct SuspendToken {
    object: ObjectRef,
    lock_count: u32,
}

/// An object held outside the message path. Released on drop.
pub(crate) struct AcquiredObject<'k> {
    kernel: &'k Kernel,
    object: ObjectRef,
    body: Arc<ObjectBody>,
}

const KEYED_CONTEXTS: SubType = SubType::CTX_CONV
    .union(SubType::CTX_MAC)
    .union(SubType::CTX_GENERIC);

impl Kernel {
    /// Release the lock this thread holds on a system object.
    pub(crate) fn suspend(&self, object: ObjectRef) -> KernelResult<SuspendToken> {
        if !object.handle.is_reserved() {
            return Err(KernelError::Permission);
        }
        let mut state = self.lock_state();
        let record = state
            .table
            .get_ref_mut(object)
            .ok_or(KernelError::Signalled)?;
        if !record.in_use_by_current() {
            return Err(KernelError::Permission);
        }
        let token = SuspendToken {
            object,
            lock_count: record.lock_count,
        };
        record.lock_count = 0;
        record.lock_owner = None;
        log::trace!("suspended {} at lock count {}", object.handle, token.lock_count);
        Ok(token)
    }

    /// Take back a suspended lock, waiting as long as it takes for any
    /// thread that picked the object up in the meantime.
    pub(crate) fn resume(&self, token: SuspendToken) -> KernelResult<()> {
        let state = self.lock_state();
        let mut state = self.wait_for_object(state, token.object, false)?;
        let record = state
            .table
            .get_ref_mut(token.object)
            .ok_or(KernelError::Signalled)?;
        record.lock_count += token.lock_count;
        record.lock_owner = Some(thread::current().id());
        Ok(())
    }

    /// Borrow a certificate or a non-system device directly.
    pub(crate) fn acquire_object(&self, handle: Handle) -> KernelResult<AcquiredObject<'_>> {
        self.acquire_with(handle, |object_type, subtype, _| {
            let allowed = object_type == ObjectType::Certificate
                || (object_type == ObjectType::Device && subtype != SubType::DEV_SYSTEM);
            if allowed {
                Ok(())
            } else {
                Err(KernelError::Permission)
            }
        })
    }

    fn acquire_with(
        &self,
        handle: Handle,
        allow: impl Fn(ObjectType, SubType, ObjectFlags) -> KernelResult<()>,
    ) -> KernelResult<AcquiredObject<'_>> {
        let state = self.lock_state();
        let object = state
            .table
            .object_ref(handle)
            .ok_or(KernelError::InvalidObject)?;
        let mut state = self.wait_for_object(state, object, true)?;
        let record = state
            .table
            .get_ref_mut(object)
            .ok_or(KernelError::Signalled)?;
        allow(record.object_type, record.subtype, record.flags)?;
        if record.is_invalid_state() {
            return Err(record.state_error());
        }
        record.lock_count += 1;
        record.lock_owner = Some(thread::current().id());
        Ok(AcquiredObject {
            kernel: self,
            object,
            body: Arc::clone(&record.body),
        })
    }

    /// Copy the key out of a keyed context in the high state.
    pub(crate) fn extract_key_data(&self, handle: Handle) -> KernelResult<KeyMaterial> {
        let held = self.acquire_with(handle, |object_type, subtype, flags| {
            if object_type != ObjectType::Context || !KEYED_CONTEXTS.contains(subtype) {
                return Err(KernelError::Permission);
            }
            if !flags.contains(ObjectFlags::HIGH) {
                return Err(KernelError::NotInitialised);
            }
            Ok(())
        })?;
        let block = held.instance();
        held.body.handler.export_key(&block)
    }

    /// Load a key into a keyed context in the low state, moving it high.
    pub(crate) fn import_key_data(&self, handle: Handle, key: &[u8]) -> KernelResult<()> {
        let held = self.acquire_with(handle, |object_type, subtype, flags| {
            if object_type != ObjectType::Context || !KEYED_CONTEXTS.contains(subtype) {
                return Err(KernelError::Permission);
            }
            if flags.contains(ObjectFlags::HIGH) {
                return Err(KernelError::Permission);
            }
            Ok(())
        })?;
        {
            let mut block = held.instance();
            held.body.handler.import_key(&mut block, key)?;
        }
        if let Some(record) = self.lock_state().table.get_ref_mut(held.object) {
            record.flags.insert(ObjectFlags::HIGH);
        }
        Ok(())
    }
}

impl AcquiredObject<'_> {
    pub(crate) fn handle(&self) -> Handle {
        self.object.handle
    }

    /// The object's handler as its concrete type.
    pub(crate) fn handler<T: 'static>(&self) -> Option<&T> {
        self.body.handler.as_any().downcast_ref::<T>()
    }

    pub(crate) fn instance(&self) -> MutexGuard<'_, SecureBlock> {
        self.body
            .instance
            .lock()
            .unwrap_or_else(|_| kernel_trap!("instance lock of {} poisoned", self.object.handle))
    }
}

impl Drop for AcquiredObject<'_> {
    fn drop(&mut self) {
        let mut state = self.kernel.lock_state();
        let Some(record) = state.table.get_ref_mut(self.object) else {
            if self.kernel.is_shutting_down() {
                return;
            }
            kernel_trap!("{} vanished while acquired", self.object.handle);
        };
        record.lock_count = record
            .lock_count
            .checked_sub(1)
            .unwrap_or_else(|| kernel_trap!("lock count underflow on {}", self.object.handle));
        let idle = record.lock_count == 0;
        if idle {
            record.lock_owner = None;
        }
        drop(state);
        if idle {
            self.kernel.drain_queue(self.object);
        }
    }
}
