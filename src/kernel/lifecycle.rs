//! Object creation and destruction.
//!
//! New objects start internal and not initialised. The creator finishes
//! setting them up and then sends `SetAttribute(Initialised)`; only after
//! that do they accept their full message set. Destruction only ever
//! happens as the handling of a destroy message, never directly.

use std::sync::{Arc, Mutex};

use super::dependency::depth;
use super::table::{Dependency, ObjectRecord};
use super::Kernel;
use crate::audit::{AuditEvent, AuditRecord};
use crate::error::{kernel_trap, KernelError, KernelResult};
use crate::message::{Attribute, MessageKind, Payload};
use crate::objects::{self, ObjectBody, ObjectHandler};
use crate::types::{ActionPermissions, Handle, ObjectFlags, ObjectRef, ObjectType, SubType};

/// Everything needed to place a new object in the table.
pub(crate) struct ObjectSpec {
    pub object_type: ObjectType,
    pub subtype: SubType,
    /// Bytes of secure instance memory.
    pub size_hint: usize,
    pub owner: Option<Handle>,
    pub action_perms: ActionPermissions,
    /// Device the object is bound to. Takes a reference on it.
    pub dependent_device: Option<ObjectRef>,
    pub handler: Box<dyn ObjectHandler>,
}

impl Kernel {
    /// Allocate instance memory and a table slot for a new object.
    pub(crate) fn allocate_object(&self, spec: ObjectSpec) -> KernelResult<ObjectRef> {
        let block = self.allocator().allocate(spec.size_hint)?;
        let record = ObjectRecord {
            object_type: spec.object_type,
            subtype: spec.subtype,
            flags: ObjectFlags::NOT_INITED | ObjectFlags::INTERNAL,
            action_perms: spec.action_perms,
            lock_count: 0,
            lock_owner: None,
            owner_thread: None,
            ref_count: 1,
            forward_count: None,
            usage_count: None,
            unique_id: 0,
            owner: spec.owner,
            dependent_object: None,
            dependent_device: None,
            body: Arc::new(ObjectBody {
                handler: spec.handler,
                instance: Mutex::new(block),
            }),
        };

        let mut state = self.lock_state();
        if let Some(device) = spec.dependent_device {
            state.table.get_ref(device).ok_or(KernelError::Signalled)?;
        }
        let (handle, grown) = state.table.insert(record)?;
        let object = state
            .table
            .object_ref(handle)
            .unwrap_or_else(|| kernel_trap!("new object {handle} missing from the table"));

        if let Some(device) = spec.dependent_device {
            if let Some(record) = state.table.get_ref_mut(device) {
                record.ref_count = record.ref_count.saturating_add(1);
            }
            if let Some(record) = state.table.get_mut(handle) {
                record.dependent_device = Some(Dependency {
                    target: device,
                    counted: true,
                });
            }
        }
        drop(state);

        if let Some(size) = grown {
            log::debug!("object table grown to {size} slots");
            self.audit(AuditRecord::new(object, AuditEvent::TableGrown { size }));
        }
        log::debug!(
            "created {:?} {:?} at {handle} (id {})",
            spec.object_type,
            spec.subtype,
            object.unique_id
        );
        self.audit(AuditRecord::new(
            object,
            AuditEvent::Created {
                object_type: spec.object_type,
            },
        ));
        Ok(object)
    }

    /// Create a fully initialised object of `subtype`, bound to `device`.
    /// The object stays internal; external creators get it made visible by
    /// the creation message's post-dispatch step.
    pub(crate) fn create_bound_object(
        &self,
        device: ObjectRef,
        subtype: SubType,
        arg: i32,
    ) -> KernelResult<Handle> {
        let object_type = subtype.object_type().ok_or(KernelError::Invalid)?;
        let device_subtype = self
            .lock_state()
            .table
            .get_ref(device)
            .map(|r| r.subtype)
            .ok_or(KernelError::Signalled)?;
        let blueprint = objects::blueprint(subtype, arg)?;
        let bound = crate::acl::dependency::find(subtype, device_subtype).is_some();

        let object = self.allocate_object(ObjectSpec {
            object_type,
            subtype,
            size_hint: blueprint.instance_size,
            owner: Some(device.handle),
            action_perms: blueprint.action_perms,
            dependent_device: bound.then_some(device),
            handler: blueprint.handler,
        })?;
        self.complete_creation(object)?;
        Ok(object.handle)
    }

    /// Report that construction finished.
    fn complete_creation(&self, object: ObjectRef) -> KernelResult<()> {
        let mut yes = 1;
        let result = self.send_internal(
            object.handle,
            MessageKind::SetAttribute,
            &mut Payload::Int(&mut yes),
            Attribute::Initialised as i32,
        );
        if let Err(e) = result {
            log::warn!("initialising {} failed: {e}", object.handle);
            // Best effort: the object is unusable either way.
            let _ = self.dispatch_converted_destroy(object);
            return Err(e);
        }
        Ok(())
    }

    /// Remove a destroyed object's record, wipe its instance and release the
    /// references it held. Returns the objects to destroy next: those whose
    /// last reference that was, and signalled objects it was still creating.
    pub(crate) fn finish_destroy(
        &self,
        state: &mut super::KernelState,
        object: ObjectRef,
    ) -> Vec<ObjectRef> {
        if state.table.get_ref(object).is_none() {
            return Vec::new();
        }
        let Some(record) = state.table.remove(object.handle) else {
            return Vec::new();
        };
        let discarded = state.queue.discard(object.handle);
        if discarded > 0 {
            log::debug!("discarded {discarded} messages queued for {}", object.handle);
        }

        match record.body.instance.lock() {
            Ok(mut block) => block.wipe(),
            Err(_) => kernel_trap!("instance lock of {} poisoned", object.handle),
        }

        let mut released = Vec::new();
        for dep in record.dependencies().filter(|d| d.counted) {
            if let Some(target) = state.table.get_ref_mut(dep.target) {
                target.ref_count = target.ref_count.saturating_sub(1);
                if target.ref_count == 0 {
                    released.push(dep.target);
                }
            }
        }

        // Objects this one was still constructing that were destroyed in the
        // meantime: nobody is left to report their completion.
        let abandoned = ObjectFlags::NOT_INITED | ObjectFlags::SIGNALLED;
        let orphans: Vec<ObjectRef> = state
            .table
            .handles()
            .into_iter()
            .filter(|h| {
                state
                    .table
                    .get(*h)
                    .is_some_and(|r| r.owner == Some(object.handle) && r.flags.contains(abandoned))
            })
            .filter_map(|h| state.table.object_ref(h))
            .collect();
        if !orphans.is_empty() {
            log::debug!("{} abandoned {} objects under construction", object.handle, orphans.len());
        }
        released.extend(orphans);

        log::debug!("destroyed {} (id {})", object.handle, object.unique_id);
        state.audit_later(AuditRecord::new(object, AuditEvent::Destroyed));
        released
    }

    /// Destroy objects whose last reference went away with a dependent.
    pub(crate) fn destroy_released(&self, released: Vec<ObjectRef>) {
        for object in released {
            if object.handle.is_reserved() {
                continue;
            }
            if let Err(e) = self.dispatch_converted_destroy(object) {
                log::warn!("releasing {} failed: {e}", object.handle);
            }
        }
    }

    /// Create the system device and the default user at the reserved
    /// handles and make both externally visible.
    pub(crate) fn create_system_objects(&self) -> KernelResult<()> {
        for (expected, subtype) in [
            (Handle::SYSTEM, SubType::DEV_SYSTEM),
            (Handle::DEFAULT_USER, SubType::USER_SO),
        ] {
            let blueprint = objects::blueprint(subtype, 0)?;
            let object = self.allocate_object(ObjectSpec {
                object_type: subtype.object_type().ok_or(KernelError::Invalid)?,
                subtype,
                size_hint: blueprint.instance_size,
                owner: None,
                action_perms: blueprint.action_perms,
                dependent_device: None,
                handler: blueprint.handler,
            })?;
            if object.handle != expected {
                kernel_trap!("{subtype:?} landed at {} instead of {expected}", object.handle);
            }
            self.complete_creation(object)?;
            let mut state = self.lock_state();
            self.make_external(&mut state, object.handle);
        }
        Ok(())
    }

    /// Shutdown teardown: the default user, then every other object with the
    /// longest dependency chains first, then the system device.
    pub(crate) fn destroy_all_objects(&self) {
        if let Some(user) = self.object_ref(Handle::DEFAULT_USER) {
            self.destroy_for_shutdown(user);
        }

        let mut ordered: Vec<(usize, ObjectRef)> = {
            let state = self.lock_state();
            state
                .table
                .handles()
                .into_iter()
                .filter(|h| !h.is_reserved())
                .filter_map(|h| state.table.object_ref(h))
                .map(|object| (depth(&state.table, object), object))
                .collect()
        };
        ordered.sort_by(|a, b| b.0.cmp(&a.0));
        for (_, object) in ordered {
            self.destroy_for_shutdown(object);
        }

        if let Some(system) = self.object_ref(Handle::SYSTEM) {
            self.destroy_for_shutdown(system);
        }
        let left = self.object_count();
        if left > 0 {
            log::warn!("{left} objects survived shutdown");
        }
    }

    fn destroy_for_shutdown(&self, object: ObjectRef) {
        let Err(e) = self.dispatch_converted_destroy(object) else {
            return;
        };
        // Still busy in another thread: drop the record. The instance is
        // wiped when that thread releases its handle on the body.
        log::warn!("forcing {} out of the table: {e}", object.handle);
        let mut state = self.lock_state();
        if state.table.get_ref(object).is_some() {
            state.table.remove(object.handle);
            state.queue.discard(object.handle);
            drop(state);
            self.audit(AuditRecord::new(object, AuditEvent::Destroyed));
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{OnceLock, Weak};

    use super::*;
    use crate::audit::AuditSink;
    use crate::config::KernelConfig;

    fn test_kernel() -> Kernel {
        Kernel::init(KernelConfig {
            lock_pages: false,
            ..KernelConfig::default()
        })
        .unwrap()
    }

    /// A hash context left under construction, as a creator would see it.
    fn unfinished(kernel: &Kernel, owner: Option<Handle>) -> ObjectRef {
        let blueprint = objects::blueprint(SubType::CTX_HASH, 0).unwrap();
        kernel
            .allocate_object(ObjectSpec {
                object_type: ObjectType::Context,
                subtype: SubType::CTX_HASH,
                size_hint: blueprint.instance_size,
                owner,
                action_perms: blueprint.action_perms,
                dependent_device: None,
                handler: blueprint.handler,
            })
            .unwrap()
    }

    fn set_initialised(kernel: &Kernel, handle: Handle) -> KernelResult<()> {
        let mut yes = 1;
        kernel.send_internal(
            handle,
            MessageKind::SetAttribute,
            &mut Payload::Int(&mut yes),
            Attribute::Initialised as i32,
        )
    }

    #[test]
    fn test_destroy_during_construction() {
        let kernel = test_kernel();
        let object = unfinished(&kernel, None);
        let handle = object.handle;

        // 1. Only status queries get through before initialisation.
        let mut label = Vec::new();
        assert_eq!(
            kernel.send_internal(
                handle,
                MessageKind::GetAttributeS,
                &mut Payload::Output(&mut label),
                Attribute::CtxLabel as i32,
            ),
            Err(KernelError::NotInitialised)
        );
        let mut status = 0;
        kernel
            .send_internal(
                handle,
                MessageKind::GetAttribute,
                &mut Payload::Int(&mut status),
                Attribute::Status as i32,
            )
            .unwrap();
        assert_eq!(status, KernelError::NotInitialised.status());

        // 2. A destroy only signals it.
        kernel
            .send_internal(handle, MessageKind::Destroy, &mut Payload::None, 0)
            .unwrap();
        assert!(kernel.is_valid_object(handle));

        // 3. The creator's completion report finishes it off.
        assert_eq!(set_initialised(&kernel, handle), Err(KernelError::Signalled));
        assert!(!kernel.is_valid_object(handle));
    }

    #[test]
    fn test_owner_destroy_reaps_signalled_objects() {
        let kernel = test_kernel();
        let device = kernel
            .create_object(ObjectType::Device, SubType::DEV_HARDWARE, 0)
            .unwrap();

        // 1. Two objects under construction by the device, one signalled.
        let signalled = unfinished(&kernel, Some(device));
        let pending = unfinished(&kernel, Some(device));
        kernel
            .send_internal(signalled.handle, MessageKind::Destroy, &mut Payload::None, 0)
            .unwrap();
        assert!(kernel.is_valid_object(signalled.handle));

        // 2. The device goes away and takes the signalled one with it.
        kernel.destroy_object(device).unwrap();
        assert!(!kernel.is_valid_object(device));
        assert!(!kernel.is_valid_object(signalled.handle));
        assert!(kernel.is_valid_object(pending.handle));
        let destroyed = kernel
            .audit_records()
            .into_iter()
            .any(|r| r.handle == signalled.handle && r.event == AuditEvent::Destroyed);
        assert!(destroyed);
    }

    #[test]
    fn test_destroyed_instance_is_wiped() {
        let kernel = test_kernel();
        let ctx = kernel
            .create_object(ObjectType::Context, SubType::CTX_CONV, 0)
            .unwrap();
        kernel
            .send_message(ctx, MessageKind::CtxGenKey, &mut Payload::None, 0)
            .unwrap();

        // 1. Hold on to the body past the record's removal.
        let body = Arc::clone(&kernel.lock_state().table.get(ctx).unwrap().body);
        assert!(body.instance.lock().unwrap().payload().iter().any(|b| *b != 0));

        // 2. Nothing of the key survives the destroy.
        kernel.destroy_object(ctx).unwrap();
        assert!(!kernel.is_valid_object(ctx));
        assert!(body.instance.lock().unwrap().payload().iter().all(|b| *b == 0));
    }

    /// Counts records delivered while the table lock was held.
    struct LockedWhileAuditing {
        kernel: Arc<OnceLock<Weak<Kernel>>>,
        seen: Arc<AtomicUsize>,
        locked: Arc<AtomicUsize>,
    }

    impl AuditSink for LockedWhileAuditing {
        fn append(&mut self, _record: AuditRecord) {
            let Some(kernel) = self.kernel.get().and_then(Weak::upgrade) else {
                return;
            };
            self.seen.fetch_add(1, Ordering::SeqCst);
            if kernel.state.try_lock().is_err() {
                self.locked.fetch_add(1, Ordering::SeqCst);
            }
        }
    }

    #[test]
    fn test_sinks_run_with_the_table_unlocked() {
        let kernel = Arc::new(test_kernel());
        let slot = Arc::new(OnceLock::new());
        let seen = Arc::new(AtomicUsize::new(0));
        let locked = Arc::new(AtomicUsize::new(0));
        kernel.add_audit_sink(Box::new(LockedWhileAuditing {
            kernel: Arc::clone(&slot),
            seen: Arc::clone(&seen),
            locked: Arc::clone(&locked),
        }));
        slot.set(Arc::downgrade(&kernel)).unwrap();

        // 1. Narrow a context's permissions, then destroy it.
        let ctx = kernel
            .create_object(ObjectType::Context, SubType::CTX_CONV, 0)
            .unwrap();
        let mut none = ActionPermissions::NONE_AVAILABLE.bits() as i32;
        kernel
            .send_internal(
                ctx,
                MessageKind::SetAttribute,
                &mut Payload::Int(&mut none),
                Attribute::ActionPerms as i32,
            )
            .unwrap();
        kernel.destroy_object(ctx).unwrap();

        // 2. Every record reached the sink after the lock was released.
        let events: Vec<_> = kernel
            .audit_records()
            .into_iter()
            .filter(|r| r.handle == ctx)
            .map(|r| r.event)
            .collect();
        assert!(events
            .iter()
            .any(|e| matches!(e, AuditEvent::PermissionsRestricted { .. })));
        assert!(events.contains(&AuditEvent::Destroyed));
        assert!(seen.load(Ordering::SeqCst) >= 3);
        assert_eq!(locked.load(Ordering::SeqCst), 0);
    }
}
