//! Finding the object that actually handles a message.
//!
//! Routing follows dependency edges: a message for a certificate's key sent
//! to the certificate reaches the context it depends on, an encrypt sent to
//! an envelope reaches its session-key context, and so on.

use super::table::ObjectTable;
use super::Kernel;
use crate::acl::message::{MessageHandling, Routing};
use crate::acl::{attribute, check};
use crate::error::{KernelError, KernelResult};
use crate::message::MessageKind;
use crate::types::{Handle, ObjectType};

/// Longest dependency chain followed while routing.
const MAX_ROUTE_DEPTH: usize = 4;

/// The nearest object of `target` type starting at `handle`, following
/// dependent objects before dependent devices.
pub(crate) fn find_target(table: &ObjectTable, handle: Handle, target: ObjectType) -> Option<Handle> {
    let mut current = handle;
    for _ in 0..MAX_ROUTE_DEPTH {
        let record = table.get(current)?;
        if record.object_type == target {
            return Some(current);
        }
        let next = record
            .dependencies()
            .map(|dep| dep.target)
            .find(|dep| {
                table
                    .get_ref(*dep)
                    .is_some_and(|r| r.object_type == target)
            })
            .or_else(|| record.dependent_object.map(|d| d.target))?;
        // A stale edge ends the walk.
        table.get_ref(next)?;
        current = next.handle;
    }
    None
}

impl Kernel {
    pub(crate) fn route(
        &self,
        table: &ObjectTable,
        handle: Handle,
        handling: &MessageHandling,
        value: i32,
    ) -> KernelResult<Handle> {
        let target = match handling.routing {
            Routing::Direct => return Ok(handle),
            Routing::Fixed(t) => find_target(table, handle, t),
            Routing::FixedAlt(a, b) => {
                find_target(table, handle, a).or_else(|| find_target(table, handle, b))
            }
            Routing::Implicit => {
                let routing = match handling.kind {
                    k if k.is_attribute() => attribute::find(value)?.routing,
                    MessageKind::Check => check::find_check(value)?.routing,
                    MessageKind::Compare => check::find_compare(value)?.routing,
                    _ => None,
                };
                match routing {
                    Some(t) => find_target(table, handle, t),
                    None => return Ok(handle),
                }
            }
        };
        target.ok_or(KernelError::InvalidObject)
    }
}
