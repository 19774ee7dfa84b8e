//! Message validation, routing and delivery.
//!
//! Per message, in order: shutdown gate, payload shape, addressability of
//! the handle, routing to the final target, waiting for a target another
//! thread is using, subtype and lifecycle gates, then either inline handling
//! by the kernel or delivery to the object's handler with the table
//! unlocked. Post-dispatch effects run after the handler returns, and any
//! messages deferred while the object was busy are drained in order once
//! its lock count returns to zero.

use std::sync::{Arc, MutexGuard};
use std::thread;

use super::hooks::Next;
use super::queue::QueuedMessage;
use super::{Kernel, KernelState};
use crate::acl::message::{self, HandlingFlags, MessageHandling};
use crate::audit::AuditRecord;
use crate::error::{kernel_trap, KernelError, KernelResult};
use crate::message::{Attribute, MessageKind, Origin, Payload};
use crate::objects::Invocation;
use crate::types::{Handle, ObjectFlags, ObjectRef};

/// One message in flight.
pub(crate) struct Message<'a, 'p> {
    pub kind: MessageKind,
    pub value: i32,
    pub payload: &'a mut Payload<'p>,
    pub origin: Origin,
    /// A destroy converted from another message because the object became
    /// unusable. Skips the checks the original message already passed.
    pub converted: bool,
}

impl<'a, 'p> Message<'a, 'p> {
    pub(crate) fn external(kind: MessageKind, payload: &'a mut Payload<'p>, value: i32) -> Self {
        Self {
            kind,
            value,
            payload,
            origin: Origin::External,
            converted: false,
        }
    }

    pub(crate) fn internal(kind: MessageKind, payload: &'a mut Payload<'p>, value: i32) -> Self {
        Self {
            origin: Origin::Internal,
            ..Self::external(kind, payload, value)
        }
    }

    fn is_status_query(&self) -> bool {
        self.kind == MessageKind::GetAttribute && self.value == Attribute::Status as i32
    }

    /// Messages an object that is not initialised or is signalled still
    /// accepts.
    fn allowed_in_invalid_state(&self) -> bool {
        self.kind == MessageKind::Destroy
            || self.is_status_query()
            || (self.kind == MessageKind::SetAttribute && self.value == Attribute::Initialised as i32)
    }
}

/// Run `dispatch` for a destroy converted from a failed message.
fn converted_destroy<'a, 'p>(payload: &'a mut Payload<'p>) -> Message<'a, 'p> {
    Message {
        converted: true,
        ..Message::internal(MessageKind::Destroy, payload, 0)
    }
}

impl Kernel {
    pub(crate) fn dispatch(&self, handle: Handle, mut msg: Message<'_, '_>) -> KernelResult<()> {
        let handling = message::lookup(msg.kind);
        log::trace!("{:?} -> {handle} value {} ({:?})", msg.kind, msg.value, msg.origin);

        if self.is_shutting_down()
            && !handling.flags.contains(HandlingFlags::SHUTDOWN_OK)
            && !msg.is_status_query()
        {
            return Err(KernelError::ShuttingDown);
        }
        if msg.origin.is_external() && handling.flags.contains(HandlingFlags::INTERNAL_ONLY) {
            return Err(KernelError::Permission);
        }
        message::check_param(handling.param, msg.value, msg.payload)?;

        let state = self.lock_state();
        let result = self.dispatch_locked(state, handle, handling, &mut msg);
        self.flush_audit();
        if let Err(KernelError::Permission) = result {
            log::warn!("{:?} to {handle} refused", msg.kind);
            if let Some(object) = self.object_ref(handle) {
                self.audit(AuditRecord::denied(object, msg.kind));
            }
        }
        result
    }

    fn dispatch_locked<'k>(
        &'k self,
        mut state: MutexGuard<'k, KernelState>,
        handle: Handle,
        handling: &'static MessageHandling,
        msg: &mut Message<'_, '_>,
    ) -> KernelResult<()> {
        // The caller must be able to address the handle at all.
        let record = state.table.get(handle).ok_or(KernelError::InvalidObject)?;
        if msg.origin.is_external() && (record.is_internal() || record.owned_elsewhere()) {
            return Err(KernelError::InvalidObject);
        }
        if handle.is_reserved()
            && !self.is_shutting_down()
            && matches!(
                msg.kind,
                MessageKind::Destroy | MessageKind::IncRefCount | MessageKind::DecRefCount
            )
        {
            return Err(KernelError::Permission);
        }

        let target = self.route(&state.table, handle, handling, msg.value)?;
        let object = state
            .table
            .object_ref(target)
            .ok_or(KernelError::InvalidObject)?;
        state = self.wait_for_object(state, object, true)?;

        let record = state
            .table
            .get_ref(object)
            .ok_or(KernelError::Signalled)?;
        if !handling.subtypes.contains(record.subtype) {
            return Err(KernelError::InvalidObject);
        }
        if !msg.converted && record.is_invalid_state() && !msg.allowed_in_invalid_state() {
            return Err(record.state_error());
        }

        if msg.kind == MessageKind::SetDependent {
            // Drops and retakes the table lock, so it owns the guard.
            return self.set_dependent(state, object, msg);
        }
        if handling.is_inline() {
            return match self.handle_inline(&mut state, object, msg)? {
                Next::Done => Ok(()),
                Next::Destroy => {
                    drop(state);
                    self.dispatch_converted_destroy(object)
                }
                Next::Handler => kernel_trap!("inline {:?} asked for a handler", msg.kind),
            };
        }

        if !msg.converted {
            let record = state.table.get_ref(object).ok_or(KernelError::Signalled)?;
            handling.state.check(record.is_high())?;
            match self.pre_dispatch(&mut state, object, handling, msg)? {
                Next::Handler => {}
                Next::Done => return Ok(()),
                Next::Destroy => {
                    drop(state);
                    self.dispatch_converted_destroy(object)?;
                    // Completing initialisation of a signalled object
                    // destroys it.
                    return Err(KernelError::Signalled);
                }
            }
        }

        let record = state.table.get_ref(object).ok_or(KernelError::Signalled)?;
        if record.in_use_by_current() {
            return self.defer(&mut state, object, handling, msg);
        }
        self.invoke(state, object, handling, msg)
    }

    pub(super) fn dispatch_converted_destroy(&self, object: ObjectRef) -> KernelResult<()> {
        let mut none = Payload::None;
        let state = self.lock_state();
        if state.table.get_ref(object).is_none() {
            return Ok(());
        }
        let state = self.wait_for_object(state, object, true)?;
        let mut msg = converted_destroy(&mut none);
        let record = state.table.get_ref(object).ok_or(KernelError::Signalled)?;
        if record.in_use_by_current() {
            let mut state = state;
            return self.defer(&mut state, object, message::lookup(MessageKind::Destroy), &mut msg);
        }
        self.invoke(state, object, message::lookup(MessageKind::Destroy), &mut msg)
    }

    /// Queue a message for an object this thread is already inside.
    fn defer(
        &self,
        state: &mut KernelState,
        object: ObjectRef,
        handling: &'static MessageHandling,
        msg: &mut Message<'_, '_>,
    ) -> KernelResult<()> {
        let returns_value = msg.kind == MessageKind::GetAttribute;
        let payload = msg.payload.to_owned_input().filter(|_| !returns_value).ok_or_else(|| {
            log::debug!("{:?} to busy {} returns data, cannot defer", msg.kind, object.handle);
            KernelError::Incomplete
        })?;
        log::trace!("deferring {:?} to {}", msg.kind, object.handle);
        state.queue.enqueue(QueuedMessage {
            object,
            kind: msg.kind,
            value: msg.value,
            payload,
            origin: msg.origin,
            handling,
        })
    }

    /// Mark the object in use, call its handler with the table unlocked, then
    /// apply post-dispatch effects and drain deferred messages.
    fn invoke<'k>(
        &'k self,
        mut state: MutexGuard<'k, KernelState>,
        object: ObjectRef,
        handling: &'static MessageHandling,
        msg: &mut Message<'_, '_>,
    ) -> KernelResult<()> {
        let body = {
            let record = state
                .table
                .get_ref_mut(object)
                .ok_or(KernelError::Signalled)?;
            record.lock_count += 1;
            record.lock_owner = Some(thread::current().id());
            Arc::clone(&record.body)
        };
        drop(state);

        let mut inv = Invocation::new(
            self,
            object,
            msg.kind,
            msg.value,
            msg.payload,
            msg.origin,
            &body.instance,
        );
        let result = body.handler.handle(&mut inv);

        let mut state = self.lock_state();
        let Some(record) = state.table.get_ref_mut(object) else {
            if self.is_shutting_down() {
                return result;
            }
            kernel_trap!("{} vanished while in use", object.handle);
        };
        record.lock_count = record
            .lock_count
            .checked_sub(1)
            .unwrap_or_else(|| kernel_trap!("lock count underflow on {}", object.handle));
        if record.lock_count == 0 {
            record.lock_owner = None;
        }
        let idle = record.lock_count == 0;

        if msg.kind == MessageKind::Destroy {
            let cascade = self.finish_destroy(&mut state, object);
            drop(state);
            self.flush_audit();
            self.destroy_released(cascade);
            return Ok(());
        }

        if result.is_ok() {
            self.post_dispatch(&mut state, object, handling, msg);
        }
        drop(state);

        if idle {
            self.drain_queue(object);
        }
        result
    }

    /// Deliver messages deferred for `object`, oldest first. Their senders
    /// already got success, so failures end the drain and drop the rest.
    ///
    /// If another thread has picked the object up in the meantime the
    /// entries stay queued: that thread drains them when it goes idle.
    pub(super) fn drain_queue(&self, object: ObjectRef) {
        loop {
            let mut state = self.lock_state();
            let Some(front) = state.queue.peek_for(object.handle) else {
                return;
            };
            let front_kind = front.kind;
            let deliverable = match state.table.get_ref(object) {
                Some(record) if record.in_use() => return,
                Some(record) => !record.is_invalid_state() || front_kind == MessageKind::Destroy,
                None => false,
            };
            if !deliverable {
                let dropped = state.queue.discard(object.handle);
                log::debug!("dropping {dropped} deferred messages for {}", object.handle);
                return;
            }
            let Some(mut queued) = state.queue.next_for(object.handle) else {
                return;
            };

            let mut payload = queued.payload.as_payload();
            let mut msg = Message {
                kind: queued.kind,
                value: queued.value,
                payload: &mut payload,
                origin: queued.origin,
                converted: false,
            };
            let result = self.deliver_queued(state, object, queued.handling, &mut msg);
            self.flush_audit();
            if let Err(e) = result {
                log::warn!("deferred {:?} to {} failed: {e}", queued.kind, object.handle);
                self.lock_state().queue.discard(object.handle);
                return;
            }
        }
    }

    fn deliver_queued<'k>(
        &'k self,
        mut state: MutexGuard<'k, KernelState>,
        object: ObjectRef,
        handling: &'static MessageHandling,
        msg: &mut Message<'_, '_>,
    ) -> KernelResult<()> {
        let record = state.table.get_ref(object).ok_or(KernelError::Signalled)?;
        handling.state.check(record.is_high())?;
        match self.pre_dispatch(&mut state, object, handling, msg)? {
            Next::Handler => self.invoke(state, object, handling, msg),
            Next::Done => Ok(()),
            Next::Destroy => {
                drop(state);
                self.dispatch_converted_destroy(object)
            }
        }
    }

    /// Clear the internal flag on an object created for an external caller.
    pub(crate) fn make_external(&self, state: &mut KernelState, handle: Handle) {
        if let Some(record) = state.table.get_mut(handle) {
            record.flags.remove(ObjectFlags::INTERNAL);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::any::Any;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Mutex;
    use std::time::Duration;

    use super::*;
    use crate::config::KernelConfig;
    use crate::kernel::lifecycle::ObjectSpec;
    use crate::objects::{ObjectBody, ObjectHandler};
    use crate::types::{ActionPermissions, ObjectType, SubType};

    /// Logs entry and exit of every label write. The first "outer" write
    /// messages its own object from inside the handler.
    #[derive(Default)]
    struct Recorder {
        log: Mutex<Vec<String>>,
        reentered: AtomicBool,
        nested_read: Mutex<Option<KernelResult<()>>>,
    }

    impl ObjectHandler for Recorder {
        fn handle(&self, inv: &mut Invocation<'_, '_>) -> KernelResult<()> {
            if inv.kind != MessageKind::SetAttributeS {
                return Ok(());
            }
            let label = String::from_utf8_lossy(inv.data()?).into_owned();
            self.log.lock().unwrap().push(format!("enter {label}"));
            if label == "outer" && !self.reentered.swap(true, Ordering::SeqCst) {
                inv.kernel.send_internal(
                    inv.object.handle,
                    MessageKind::SetAttributeS,
                    &mut Payload::Data(b"inner"),
                    Attribute::CtxLabel as i32,
                )?;
                let mut algorithm = 0;
                let read = inv.kernel.send_internal(
                    inv.object.handle,
                    MessageKind::GetAttribute,
                    &mut Payload::Int(&mut algorithm),
                    Attribute::CtxAlgorithm as i32,
                );
                *self.nested_read.lock().unwrap() = Some(read);
            }
            if label.starts_with("slow") {
                thread::sleep(Duration::from_millis(2));
            }
            self.log.lock().unwrap().push(format!("exit {label}"));
            Ok(())
        }

        fn as_any(&self) -> &dyn Any {
            self
        }
    }

    fn test_kernel() -> Kernel {
        Kernel::init(KernelConfig {
            lock_pages: false,
            ..KernelConfig::default()
        })
        .unwrap()
    }

    fn recorder_object(kernel: &Kernel) -> Handle {
        let object = kernel
            .allocate_object(ObjectSpec {
                object_type: ObjectType::Context,
                subtype: SubType::CTX_GENERIC,
                size_hint: 16,
                owner: None,
                action_perms: ActionPermissions::NONE_AVAILABLE,
                dependent_device: None,
                handler: Box::new(Recorder::default()),
            })
            .unwrap();
        let mut yes = 1;
        kernel
            .send_internal(
                object.handle,
                MessageKind::SetAttribute,
                &mut Payload::Int(&mut yes),
                Attribute::Initialised as i32,
            )
            .unwrap();
        object.handle
    }

    fn body_of(kernel: &Kernel, handle: Handle) -> Arc<ObjectBody> {
        Arc::clone(&kernel.lock_state().table.get(handle).unwrap().body)
    }

    fn set_label(kernel: &Kernel, handle: Handle, label: &str) -> KernelResult<()> {
        kernel.send_internal(
            handle,
            MessageKind::SetAttributeS,
            &mut Payload::Data(label.as_bytes()),
            Attribute::CtxLabel as i32,
        )
    }

    #[test]
    fn test_reentrant_message_runs_after_the_outer_one() {
        let kernel = test_kernel();
        let handle = recorder_object(&kernel);

        // 1. The nested write is queued and delivered once the outer
        // handler has returned, before the outer send completes.
        set_label(&kernel, handle, "outer").unwrap();
        let body = body_of(&kernel, handle);
        let recorder = body.handler.as_any().downcast_ref::<Recorder>().unwrap();
        assert_eq!(
            *recorder.log.lock().unwrap(),
            vec!["enter outer", "exit outer", "enter inner", "exit inner"]
        );

        // 2. A nested read has nowhere to deliver its result.
        assert_eq!(
            *recorder.nested_read.lock().unwrap(),
            Some(Err(KernelError::Incomplete))
        );
    }

    #[test]
    fn test_other_threads_wait_for_a_busy_object() {
        let kernel = test_kernel();
        let handle = recorder_object(&kernel);

        // 1. Two threads hammer the same object.
        thread::scope(|s| {
            for t in 0..2 {
                let kernel = &kernel;
                s.spawn(move || {
                    for i in 0..5 {
                        set_label(kernel, handle, &format!("slow-{t}-{i}")).unwrap();
                    }
                });
            }
        });

        // 2. Every entry is followed by its own exit: no overlap.
        let body = body_of(&kernel, handle);
        let recorder = body.handler.as_any().downcast_ref::<Recorder>().unwrap();
        let log = recorder.log.lock().unwrap().clone();
        assert_eq!(log.len(), 20);
        for pair in log.chunks(2) {
            assert_eq!(pair[0].strip_prefix("enter "), pair[1].strip_prefix("exit "));
        }
    }

    #[test]
    fn test_deferred_message_survives_a_busy_object() {
        // Goal: a message deferred on one thread is not lost when another
        // thread has the object by the time the queue is drained.
        let kernel = test_kernel();
        let handle = recorder_object(&kernel);
        let object = kernel.object_ref(handle).unwrap();
        let other = thread::spawn(|| thread::current().id()).join().unwrap();

        // 1. A deferred write, with the object held by another thread.
        {
            let mut state = kernel.lock_state();
            state
                .queue
                .enqueue(QueuedMessage {
                    object,
                    kind: MessageKind::SetAttributeS,
                    value: Attribute::CtxLabel as i32,
                    payload: crate::message::OwnedPayload::Data(b"late".to_vec()),
                    origin: Origin::Internal,
                    handling: message::lookup(MessageKind::SetAttributeS),
                })
                .unwrap();
            let record = state.table.get_ref_mut(object).unwrap();
            record.lock_count = 1;
            record.lock_owner = Some(other);
        }

        // 2. Draining now leaves it queued.
        kernel.drain_queue(object);
        assert_eq!(kernel.lock_state().queue.len(), 1);

        // 3. Once the object is free the drain delivers it.
        {
            let mut state = kernel.lock_state();
            let record = state.table.get_ref_mut(object).unwrap();
            record.lock_count = 0;
            record.lock_owner = None;
        }
        kernel.drain_queue(object);
        assert_eq!(kernel.lock_state().queue.len(), 0);
        let body = body_of(&kernel, handle);
        let recorder = body.handler.as_any().downcast_ref::<Recorder>().unwrap();
        assert_eq!(*recorder.log.lock().unwrap(), vec!["enter late", "exit late"]);
    }

    #[test]
    fn test_deferred_messages_for_a_destroyed_object_are_dropped() {
        let kernel = test_kernel();
        let handle = recorder_object(&kernel);
        let object = kernel.object_ref(handle).unwrap();
        kernel.lock_state().queue.enqueue(QueuedMessage {
            object,
            kind: MessageKind::SetAttributeS,
            value: Attribute::CtxLabel as i32,
            payload: crate::message::OwnedPayload::Data(b"orphan".to_vec()),
            origin: Origin::Internal,
            handling: message::lookup(MessageKind::SetAttributeS),
        })
        .unwrap();

        // Destroying discards the queue along with the object.
        kernel.dispatch_converted_destroy(object).unwrap();
        assert_eq!(kernel.lock_state().queue.len(), 0);
        kernel.drain_queue(object);
        assert!(!kernel.is_valid_object(handle));
    }

    #[test]
    fn test_external_callers_cannot_see_internal_objects() {
        let kernel = test_kernel();
        let handle = recorder_object(&kernel);
        let result = kernel.send_message(
            handle,
            MessageKind::SetAttributeS,
            &mut Payload::Data(b"x"),
            Attribute::CtxLabel as i32,
        );
        assert_eq!(result, Err(KernelError::InvalidObject));
    }
}
