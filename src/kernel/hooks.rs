//! Pre- and post-dispatch hooks and the kernel's inline messages.

use super::dispatch::Message;
use super::{Kernel, KernelState};
use crate::acl::attribute::{self, AttrFlags, ValueRange};
use crate::acl::mechanism::{self, ObjectParam};
use crate::acl::message::{MessageHandling, PostDispatch, PreDispatch};
use crate::acl::{check, Operation};
use crate::error::{kernel_trap, ArgPosition, KernelError, KernelResult};
use crate::message::{Attribute, MessageKind, Origin, Payload};
use crate::types::{Action, Handle, ObjectFlags, ObjectRef, ObjectType, PermLevel, SubType};

/// What happens after a hook has run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Next {
    /// Deliver to the object's handler.
    Handler,
    /// Fully handled by the kernel.
    Done,
    /// The object can no longer be used: destroy it.
    Destroy,
}

fn bad(position: ArgPosition) -> KernelError {
    KernelError::BadArgument(position)
}

impl Kernel {
    /// Run the message's pre-dispatch check with the table locked.
    pub(crate) fn pre_dispatch(
        &self,
        state: &mut KernelState,
        object: ObjectRef,
        handling: &MessageHandling,
        msg: &mut Message<'_, '_>,
    ) -> KernelResult<Next> {
        match handling.pre {
            PreDispatch::None => Ok(Next::Handler),
            PreDispatch::Destroy => self.pre_destroy(state, object, msg),
            PreDispatch::Attribute => self.pre_attribute(state, object, msg),
            PreDispatch::Action(action) => {
                check_action(state, object, action, msg.origin)?;
                let record = record(state, object)?;
                if msg.kind == MessageKind::CtxHash
                    && record.subtype == SubType::CTX_MAC
                    && !record.is_high()
                {
                    return Err(KernelError::NotInitialised);
                }
                Ok(Next::Handler)
            }
            PreDispatch::Compare => {
                let acl = check::find_compare(msg.value)?;
                if !acl.subtypes.contains(record(state, object)?.subtype) {
                    return Err(bad(ArgPosition::Value));
                }
                if let Payload::Data(data) = &*msg.payload {
                    acl.check_length(data.len())?;
                }
                Ok(Next::Handler)
            }
            PreDispatch::Check => self.pre_check(state, object, msg),
            PreDispatch::Create => pre_create(state, object, msg),
            PreDispatch::Mechanism => pre_mechanism(state, msg),
            PreDispatch::KeyMgmt => {
                let acl = mechanism::find_key_mgmt(msg.value)?;
                if let Payload::KeyMgmt(info) = &*msg.payload {
                    acl.name.check(info.name.len(), ArgPosition::Str1)?;
                    if msg.kind == MessageKind::KeySetKey {
                        let handle = info.object.ok_or(bad(ArgPosition::Num1))?;
                        check_object_arg(state, handle, msg.origin, &acl.object, ArgPosition::Num1)?;
                    }
                }
                Ok(Next::Handler)
            }
            PreDispatch::CertMgmt => {
                let acl = mechanism::find_cert_mgmt(msg.value)?;
                if let Payload::CertMgmt(info) = &*msg.payload {
                    check_object_arg(state, info.ca_key, msg.origin, &acl.ca_key, ArgPosition::Num1)?;
                    check_object_arg(state, info.request, msg.origin, &acl.request, ArgPosition::Num2)?;
                }
                Ok(Next::Handler)
            }
        }
    }

    fn pre_destroy(
        &self,
        state: &mut KernelState,
        object: ObjectRef,
        msg: &Message<'_, '_>,
    ) -> KernelResult<Next> {
        let record = record_mut(state, object)?;
        if msg.origin.is_external() && record.ref_count > 1 {
            // Other holders remain: the caller just gives up its reference.
            record.flags.insert(ObjectFlags::INTERNAL);
            record.ref_count -= 1;
            return Ok(Next::Done);
        }
        if record.flags.contains(ObjectFlags::NOT_INITED) {
            // Destroyed once its creator reports completion.
            log::debug!("{} destroyed during construction, signalling", object.handle);
            record.flags.insert(ObjectFlags::SIGNALLED);
            return Ok(Next::Done);
        }
        Ok(Next::Handler)
    }

    fn pre_attribute(
        &self,
        state: &mut KernelState,
        object: ObjectRef,
        msg: &mut Message<'_, '_>,
    ) -> KernelResult<Next> {
        let acl = attribute::find(msg.value)?;
        let record = record(state, object)?;
        let op = match msg.kind {
            MessageKind::GetAttribute | MessageKind::GetAttributeS => Operation::Read,
            MessageKind::DeleteAttribute => Operation::Delete,
            _ => Operation::Write,
        };

        if !acl.subtypes.contains(record.subtype) {
            return Err(bad(ArgPosition::Value));
        }
        let numeric_message = matches!(msg.kind, MessageKind::GetAttribute | MessageKind::SetAttribute);
        if op != Operation::Delete && numeric_message != acl.value_type.is_numeric() {
            return Err(bad(ArgPosition::Value));
        }
        let is_property = acl.flags.contains(AttrFlags::PROPERTY);
        if is_property
            && record.flags.contains(ObjectFlags::ATTR_LOCKED)
            && !matches!(
                acl.attribute,
                Attribute::Locked
                    | Attribute::Status
                    | Attribute::ObjectType
                    | Attribute::ObjectSubType
                    | Attribute::Initialised
            )
        {
            return Err(KernelError::Permission);
        }
        acl.access.check(msg.origin, record.is_high(), op)?;

        let subtype = record.subtype;
        match (&mut *msg.payload, op) {
            (Payload::Int(value), Operation::Write) => {
                acl.check_numeric(subtype, value)?;
                if let ValueRange::Object { subtypes, state: required } = acl.range {
                    let handle = Handle::from_value(**value).ok_or(bad(ArgPosition::Num1))?;
                    let param = ObjectParam {
                        subtypes,
                        state: required,
                    };
                    check_object_arg(state, handle, msg.origin, &param, ArgPosition::Num1)?;
                }
            }
            (Payload::Data(data), Operation::Write) => acl.check_length(subtype, data.len())?,
            (Payload::Output(out), Operation::Read) if acl.flags.contains(AttrFlags::SIZED_READ) => {
                acl.check_length(subtype, out.len())?
            }
            _ => {}
        }

        if is_property {
            return self.handle_property(state, object, acl.attribute, msg);
        }
        Ok(Next::Handler)
    }

    fn pre_check(
        &self,
        state: &mut KernelState,
        object: ObjectRef,
        msg: &Message<'_, '_>,
    ) -> KernelResult<Next> {
        let acl = check::find_check(msg.value)?;
        let record = record(state, object)?;
        if !acl.subtypes.contains(record.subtype) {
            return Err(KernelError::NotAvailable);
        }
        acl.state.check(record.is_high())?;
        if let Some(action) = acl.action {
            check_action(state, object, action, msg.origin)?;
        }
        Ok(if acl.delegate_usage.is_some() {
            Next::Handler
        } else {
            Next::Done
        })
    }

    /// Kernel-side effects of a successful handler call.
    pub(crate) fn post_dispatch(
        &self,
        state: &mut KernelState,
        object: ObjectRef,
        handling: &MessageHandling,
        msg: &Message<'_, '_>,
    ) {
        for post in handling.post {
            match post {
                PostDispatch::UpdateUsageCount => {
                    if let Some(record) = state.table.get_ref_mut(object) {
                        if let Some(count) = record.usage_count.as_mut() {
                            *count = count.saturating_sub(1);
                        }
                    }
                }
                PostDispatch::ChangeState => {
                    if let Some(record) = state.table.get_ref_mut(object) {
                        record.flags.insert(ObjectFlags::HIGH);
                    }
                }
                PostDispatch::ChangeStateOnTrigger => {
                    let trigger = attribute::find(msg.value)
                        .is_ok_and(|acl| acl.flags.contains(AttrFlags::TRIGGER));
                    if trigger {
                        if let Some(record) = state.table.get_ref_mut(object) {
                            log::debug!("{} moved to the high state", object.handle);
                            record.flags.insert(ObjectFlags::HIGH);
                        }
                    }
                }
                PostDispatch::MakeExternal => {
                    if msg.origin == Origin::External {
                        let created = match &*msg.payload {
                            Payload::Create(info) => info.result,
                            Payload::CertMgmt(info) => info.result,
                            _ => None,
                        };
                        if let Some(handle) = created {
                            self.make_external(state, handle);
                        }
                    }
                }
            }
        }
    }

    /// Reference counting and dependency lookup, handled with the lock held.
    pub(crate) fn handle_inline(
        &self,
        state: &mut KernelState,
        object: ObjectRef,
        msg: &mut Message<'_, '_>,
    ) -> KernelResult<Next> {
        match msg.kind {
            MessageKind::IncRefCount => {
                let record = record_mut(state, object)?;
                record.ref_count = record.ref_count.checked_add(1).ok_or(KernelError::Overflow)?;
                Ok(Next::Done)
            }
            MessageKind::DecRefCount => {
                let record = record_mut(state, object)?;
                if msg.origin.is_external() {
                    // Hide it from external callers before anything else.
                    record.flags.insert(ObjectFlags::INTERNAL);
                }
                if record.ref_count > 1 {
                    record.ref_count -= 1;
                    Ok(Next::Done)
                } else {
                    record.ref_count = 0;
                    log::debug!("{} released its last reference", object.handle);
                    Ok(Next::Destroy)
                }
            }
            MessageKind::GetDependent => {
                let wanted = ObjectType::from_value(msg.value).ok_or(bad(ArgPosition::Value))?;
                let found = record(state, object)?
                    .dependencies()
                    .map(|d| d.target)
                    .find(|d| state.table.get_ref(*d).is_some_and(|r| r.object_type == wanted))
                    .ok_or(KernelError::NotFound)?;
                if let Payload::Int(out) = &mut *msg.payload {
                    **out = found.handle.as_value();
                }
                Ok(Next::Done)
            }
            other => kernel_trap!("{other:?} is not an inline message"),
        }
    }
}

pub(crate) fn record(state: &KernelState, object: ObjectRef) -> KernelResult<&super::ObjectRecord> {
    state.table.get_ref(object).ok_or(KernelError::Signalled)
}

pub(crate) fn record_mut(state: &mut KernelState, object: ObjectRef) -> KernelResult<&mut super::ObjectRecord> {
    state.table.get_ref_mut(object).ok_or(KernelError::Signalled)
}

/// Action permission and remaining usage count.
pub(crate) fn check_action(
    state: &KernelState,
    object: ObjectRef,
    action: Action,
    origin: Origin,
) -> KernelResult<()> {
    let record = record(state, object)?;
    match record.action_perms.level(action) {
        PermLevel::NotAvailable => return Err(KernelError::NotAvailable),
        PermLevel::None => return Err(KernelError::Permission),
        PermLevel::NoneExternal if origin.is_external() => return Err(KernelError::Permission),
        _ => {}
    }
    if record.usage_count == Some(0) {
        return Err(KernelError::Permission);
    }
    Ok(())
}

/// An object named inside a payload: addressable by the sender, of an
/// allowed subtype and in the required state.
pub(crate) fn check_object_arg(
    state: &KernelState,
    handle: Handle,
    origin: Origin,
    param: &ObjectParam,
    position: ArgPosition,
) -> KernelResult<()> {
    let record = state.table.get(handle).ok_or(bad(position))?;
    if origin.is_external() && (record.is_internal() || record.owned_elsewhere()) {
        return Err(bad(position));
    }
    if !param.subtypes.contains(record.subtype) {
        return Err(bad(position));
    }
    if record.is_invalid_state() {
        return Err(record.state_error());
    }
    param.state.check(record.is_high())
}

fn pre_create(state: &KernelState, object: ObjectRef, msg: &Message<'_, '_>) -> KernelResult<Next> {
    let device = record(state, object)?.subtype;
    let Payload::Create(info) = &*msg.payload else {
        return Err(bad(ArgPosition::Str1));
    };
    let wanted = ObjectType::from_value(msg.value).ok_or(bad(ArgPosition::Value))?;
    if info.subtype.object_type() != Some(wanted) {
        return Err(bad(ArgPosition::Num1));
    }
    if !mechanism::creatable_by(device).contains(info.subtype) {
        return Err(KernelError::Permission);
    }
    Ok(Next::Handler)
}

fn pre_mechanism(state: &KernelState, msg: &Message<'_, '_>) -> KernelResult<Next> {
    match &*msg.payload {
        Payload::Wrap(info) => {
            let acl = mechanism::find_wrap(msg.kind)?;
            check_object_arg(state, info.key_context, msg.origin, &acl.key_context, ArgPosition::Num1)?;
            check_object_arg(state, info.wrap_context, msg.origin, &acl.wrap_context, ArgPosition::Num2)?;
            if msg.kind == MessageKind::DevImport {
                acl.wrapped.check(info.wrapped.len(), ArgPosition::Str1)?;
            }
            if info.key_context == info.wrap_context {
                return Err(bad(ArgPosition::Num2));
            }
        }
        Payload::Derive(info) => {
            let acl = &mechanism::DERIVE;
            acl.input.check(info.input.len(), ArgPosition::Str1)?;
            acl.salt.check(info.salt.len(), ArgPosition::Str2)?;
            if !(acl.min_iterations..=acl.max_iterations).contains(&info.iterations) {
                return Err(bad(ArgPosition::Num1));
            }
            acl.output.check(info.output_len, ArgPosition::Num2)?;
        }
        _ => return Err(bad(ArgPosition::Str1)),
    }
    Ok(Next::Handler)
}
