//! Kernel-managed object properties.
//!
//! These live in the object record, not the instance, and are answered
//! without involving the object's handler. Every property that limits an
//! object can only be tightened: usage counts and forward counts go down,
//! action permissions are combined with [`ActionPermissions::restrict`].

use std::thread;

use super::dispatch::Message;
use super::hooks::{record_mut, Next};
use super::{Kernel, KernelState};
use crate::audit::{AuditEvent, AuditRecord};
use crate::error::{kernel_trap, ArgPosition, KernelError, KernelResult};
use crate::message::{Attribute, MessageKind, Payload, UNUSED};
use crate::types::{ActionPermissions, ObjectFlags, ObjectRef};

fn count_value(count: Option<u32>) -> i32 {
    count.map_or(UNUSED, |n| i32::try_from(n).unwrap_or(i32::MAX))
}

fn to_count(value: i32) -> KernelResult<u32> {
    u32::try_from(value).map_err(|_| KernelError::BadArgument(ArgPosition::Num1))
}

impl Kernel {
    pub(crate) fn handle_property(
        &self,
        state: &mut KernelState,
        object: ObjectRef,
        attribute: Attribute,
        msg: &mut Message<'_, '_>,
    ) -> KernelResult<Next> {
        let Payload::Int(value) = &mut *msg.payload else {
            return Err(KernelError::BadArgument(ArgPosition::Str1));
        };
        let record = record_mut(state, object)?;

        if msg.kind == MessageKind::GetAttribute {
            **value = match attribute {
                Attribute::Status => {
                    if record.is_invalid_state() {
                        record.state_error().status()
                    } else {
                        0
                    }
                }
                Attribute::ObjectType => record.object_type as i32,
                Attribute::ObjectSubType => record.subtype.bits() as i32,
                Attribute::Owner => i32::from(record.flags.contains(ObjectFlags::OWNED)),
                Attribute::ForwardCount => count_value(record.forward_count),
                Attribute::Locked => i32::from(record.flags.contains(ObjectFlags::ATTR_LOCKED)),
                Attribute::UsageCount => count_value(record.usage_count),
                Attribute::Internal => i32::from(record.is_internal()),
                Attribute::ActionPerms => record.action_perms.bits() as i32,
                other => kernel_trap!("no read path for property {other:?}"),
            };
            return Ok(Next::Done);
        }

        let new = **value;
        match attribute {
            Attribute::Owner => {
                if new != 0 {
                    if record.forward_count == Some(0) {
                        return Err(KernelError::Permission);
                    }
                    if let Some(n) = record.forward_count.as_mut() {
                        *n -= 1;
                    }
                    record.flags.insert(ObjectFlags::OWNED);
                    record.owner_thread = Some(thread::current().id());
                } else {
                    record.flags.remove(ObjectFlags::OWNED);
                    record.owner_thread = None;
                }
            }
            Attribute::ForwardCount => {
                let new = to_count(new)?;
                if record.forward_count.is_some_and(|n| new > n) {
                    return Err(KernelError::Permission);
                }
                record.forward_count = Some(new);
            }
            Attribute::UsageCount => {
                let new = to_count(new)?;
                if record.usage_count.is_some_and(|n| new > n) {
                    return Err(KernelError::Permission);
                }
                record.usage_count = Some(new);
            }
            Attribute::HighSecurity => {
                record.flags.insert(ObjectFlags::ATTR_LOCKED);
                record.forward_count = Some(0);
            }
            Attribute::Internal => {
                if new != 0 {
                    record.flags.insert(ObjectFlags::INTERNAL);
                } else {
                    record.flags.remove(ObjectFlags::INTERNAL);
                }
            }
            Attribute::ActionPerms => {
                let requested = u32::try_from(new)
                    .ok()
                    .and_then(ActionPermissions::from_bits)
                    .ok_or(KernelError::BadArgument(ArgPosition::Num1))?;
                let before = record.action_perms;
                record.action_perms = before.restrict(requested);
                let after = record.action_perms;
                if after != before {
                    state.audit_later(AuditRecord::new(
                        object,
                        AuditEvent::PermissionsRestricted {
                            from: before.bits(),
                            to: after.bits(),
                        },
                    ));
                }
            }
            Attribute::Initialised => {
                if !record.flags.contains(ObjectFlags::NOT_INITED) {
                    return Err(KernelError::AlreadyInitialised);
                }
                record.flags.remove(ObjectFlags::NOT_INITED);
                if record.flags.contains(ObjectFlags::SIGNALLED) {
                    return Ok(Next::Destroy);
                }
                log::debug!("{} initialised", object.handle);
            }
            other => kernel_trap!("no write path for property {other:?}"),
        }
        Ok(Next::Done)
    }
}
