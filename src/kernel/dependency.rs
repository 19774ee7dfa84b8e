//! Dependency edges between objects.
//!
//! Attaching a certificate to a public-key context narrows the context's
//! action permissions to the certificate's key usage. Reading the key usage
//! means messaging the certificate, which cannot happen with the table
//! locked, so the lock is dropped for the query. Both objects are looked up
//! again by unique ID afterwards; if either was destroyed in the meantime the
//! attach fails with [`KernelError::Signalled`]. The slot and cycle checks
//! are repeated too, since either object may have gained an edge while the
//! table was unlocked.

use std::collections::HashSet;
use std::sync::MutexGuard;

use super::dispatch::Message;
use super::table::{Dependency, ObjectTable};
use super::{Kernel, KernelState};
use crate::acl::dependency::{self, DependencyFlags};
use crate::audit::{AuditEvent, AuditRecord};
use crate::error::{ArgPosition, KernelError, KernelResult};
use crate::message::{Attribute, MessageKind, Payload};
use crate::types::{Handle, ObjectRef};

/// True if `from` reaches `target` by following dependency edges.
pub(crate) fn depends_on(table: &ObjectTable, from: ObjectRef, target: ObjectRef) -> bool {
    let mut seen = HashSet::new();
    let mut pending = vec![from];
    while let Some(current) = pending.pop() {
        if current == target {
            return true;
        }
        if !seen.insert(current) {
            continue;
        }
        if let Some(record) = table.get_ref(current) {
            pending.extend(record.dependencies().map(|d| d.target));
        }
    }
    false
}

/// Longest dependency chain below `object`, in edges.
pub(crate) fn depth(table: &ObjectTable, object: ObjectRef) -> usize {
    fn walk(table: &ObjectTable, object: ObjectRef, budget: usize) -> usize {
        if budget == 0 {
            return 0;
        }
        table.get_ref(object).map_or(0, |record| {
            record
                .dependencies()
                .filter(|d| table.get_ref(d.target).is_some())
                .map(|d| 1 + walk(table, d.target, budget - 1))
                .max()
                .unwrap_or(0)
        })
    }
    walk(table, object, 8)
}

impl Kernel {
    pub(crate) fn set_dependent<'k>(
        &'k self,
        mut state: MutexGuard<'k, KernelState>,
        object: ObjectRef,
        msg: &mut Message<'_, '_>,
    ) -> KernelResult<()> {
        let bad = KernelError::BadArgument(ArgPosition::Num1);
        let raw = msg.payload.int().ok_or(KernelError::BadArgument(ArgPosition::Str1))?;
        let counted = msg.value != 0;
        let dep_handle = Handle::from_value(raw).ok_or(bad)?;
        let dependent = state.table.object_ref(dep_handle).ok_or(bad)?;
        let dep_record = state.table.get(dep_handle).ok_or(bad)?;
        if msg.origin.is_external() && (dep_record.is_internal() || dep_record.owned_elsewhere()) {
            return Err(bad);
        }
        if dependent.handle == object.handle {
            return Err(bad);
        }
        let dep_subtype = dep_record.subtype;

        let record = state.table.get_ref(object).ok_or(KernelError::Signalled)?;
        let rule = dependency::find(record.subtype, dep_subtype).ok_or(bad)?;
        let device_slot = dependency::uses_device_slot(dep_subtype);
        let slot_taken = |state: &KernelState| {
            state.table.get_ref(object).is_some_and(|r| {
                if device_slot {
                    r.dependent_device.is_some()
                } else {
                    r.dependent_object.is_some()
                }
            })
        };
        if slot_taken(&state) {
            return Err(KernelError::AlreadyInitialised);
        }
        if depends_on(&state.table, dependent, object) {
            log::warn!("refusing dependency cycle {} -> {}", object.handle, dependent.handle);
            return Err(bad);
        }

        let mut restricted = None;
        if rule.flags.contains(DependencyFlags::PROPAGATE_PERMS) {
            drop(state);
            let mut usage = 0;
            self.send_internal(
                dependent.handle,
                MessageKind::GetAttribute,
                &mut Payload::Int(&mut usage),
                Attribute::CertKeyUsage as i32,
            )?;
            state = self.lock_state();

            // Anything checked above may have changed while unlocked.
            let (Some(record), Some(dep_record)) =
                (state.table.get_ref(object), state.table.get_ref(dependent))
            else {
                log::debug!("{} or {} went away during attach", object.handle, dependent.handle);
                return Err(KernelError::Signalled);
            };
            if dependency::find(record.subtype, dep_record.subtype).is_none() {
                return Err(bad);
            }
            if slot_taken(&state) {
                return Err(KernelError::AlreadyInitialised);
            }
            if depends_on(&state.table, dependent, object) {
                log::warn!(
                    "refusing dependency cycle {} -> {} formed during attach",
                    object.handle,
                    dependent.handle
                );
                return Err(bad);
            }

            let record = state
                .table
                .get_ref_mut(object)
                .ok_or(KernelError::Signalled)?;
            let before = record.action_perms;
            record.action_perms = before.restrict(dependency::permissions_for_key_usage(usage));
            let after = record.action_perms;
            if after != before {
                restricted = Some(AuditRecord::new(
                    object,
                    AuditEvent::PermissionsRestricted {
                        from: before.bits(),
                        to: after.bits(),
                    },
                ));
            }
        }

        if counted {
            let dep_record = state
                .table
                .get_ref_mut(dependent)
                .ok_or(KernelError::Signalled)?;
            dep_record.ref_count = dep_record
                .ref_count
                .checked_add(1)
                .ok_or(KernelError::Overflow)?;
        }
        let record = state
            .table
            .get_ref_mut(object)
            .ok_or(KernelError::Signalled)?;
        let edge = Some(Dependency {
            target: dependent,
            counted,
        });
        if device_slot {
            record.dependent_device = edge;
        } else {
            record.dependent_object = edge;
        }
        drop(state);

        log::debug!("{} now depends on {}", object.handle, dependent.handle);
        if let Some(record) = restricted {
            self.audit(record);
        }
        self.audit(AuditRecord::new(
            object,
            AuditEvent::DependencyAttached {
                dependent: dependent.handle,
            },
        ));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::any::Any;
    use std::sync::{Arc, Mutex};

    use super::*;
    use crate::config::KernelConfig;
    use crate::kernel::lifecycle::ObjectSpec;
    use crate::message::key_usage;
    use crate::objects::{Invocation, ObjectHandler};
    use crate::types::{ActionPermissions, ObjectType, SubType};

    /// A certificate that, asked for its key usage, makes itself depend on
    /// `back_to` first.
    struct LinksBack {
        back_to: Mutex<Option<Handle>>,
        linked: Mutex<Option<KernelResult<()>>>,
    }

    impl ObjectHandler for LinksBack {
        fn handle(&self, inv: &mut Invocation<'_, '_>) -> KernelResult<()> {
            if inv.kind != MessageKind::GetAttribute {
                return Ok(());
            }
            if let Some(target) = self.back_to.lock().unwrap().take() {
                let mut raw = target.as_value();
                let linked = inv.kernel.send_internal(
                    inv.object.handle,
                    MessageKind::SetDependent,
                    &mut Payload::Int(&mut raw),
                    0,
                );
                *self.linked.lock().unwrap() = Some(linked);
            }
            inv.set_int(key_usage::DIGITAL_SIGNATURE)
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

    fn attach(kernel: &Kernel, object: Handle, dependent: Handle) -> KernelResult<()> {
        let mut raw = dependent.as_value();
        kernel.send_internal(object, MessageKind::SetDependent, &mut Payload::Int(&mut raw), 0)
    }

    #[test]
    fn test_cycle_formed_while_unlocked_is_refused() {
        // Goal: the permission query runs with the table unlocked; an edge
        // added in that window must not let the attach close a cycle.
        let kernel = test_kernel();
        let ctx = kernel
            .create_object(ObjectType::Context, SubType::CTX_PKC, 0)
            .unwrap();

        // 1. A certificate whose key-usage read links it back to the context.
        let cert = kernel
            .allocate_object(ObjectSpec {
                object_type: ObjectType::Certificate,
                subtype: SubType::CERT_CERTIFICATE,
                size_hint: 16,
                owner: None,
                action_perms: ActionPermissions::NONE_AVAILABLE,
                dependent_device: None,
                handler: Box::new(LinksBack {
                    back_to: Mutex::new(Some(ctx)),
                    linked: Mutex::new(None),
                }),
            })
            .unwrap();
        let mut yes = 1;
        kernel
            .send_internal(
                cert.handle,
                MessageKind::SetAttribute,
                &mut Payload::Int(&mut yes),
                Attribute::Initialised as i32,
            )
            .unwrap();

        // 2. The attach notices the new reverse edge.
        assert_eq!(
            attach(&kernel, ctx, cert.handle),
            Err(KernelError::BadArgument(ArgPosition::Num1))
        );
        let body = Arc::clone(&kernel.lock_state().table.get(cert.handle).unwrap().body);
        let handler = body.handler.as_any().downcast_ref::<LinksBack>().unwrap();
        assert_eq!(*handler.linked.lock().unwrap(), Some(Ok(())));

        // 3. Only the reverse edge exists.
        let state = kernel.lock_state();
        let ctx_ref = state.table.object_ref(ctx).unwrap();
        assert!(depends_on(&state.table, cert, ctx_ref));
        assert!(!depends_on(&state.table, ctx_ref, cert));
    }

    #[test]
    fn test_device_edge_and_depth() {
        let kernel = test_kernel();
        let ctx = kernel
            .create_object(ObjectType::Context, SubType::CTX_PKC, 0)
            .unwrap();
        let device = kernel
            .create_object(ObjectType::Device, SubType::DEV_HARDWARE, 0)
            .unwrap();
        attach(&kernel, ctx, device).unwrap();

        let state = kernel.lock_state();
        let ctx_ref = state.table.object_ref(ctx).unwrap();
        let device_ref = state.table.object_ref(device).unwrap();
        assert!(depends_on(&state.table, ctx_ref, device_ref));
        assert_eq!(depth(&state.table, ctx_ref), 1);
        assert_eq!(depth(&state.table, device_ref), 0);
    }
}
