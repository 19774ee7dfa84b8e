//! Secure sessions.
//!
//! Only the configuration side is modelled: a session collects its peer
//! details and credentials in the low state and is activated by writing
//! `SessionActive`, which moves it into the high state and freezes its
//! configuration.

use std::any::Any;
use std::sync::Mutex;

use super::{lock, Blueprint, Invocation, ObjectHandler};
use crate::error::{ArgPosition, KernelError, KernelResult};
use crate::message::{Attribute, MessageKind, Payload};
use crate::types::{ObjectType, SubType};

#[derive(Debug, Default)]
struct SessionState {
    server_name: Option<Vec<u8>>,
    port: Option<i32>,
    user_name: Option<Vec<u8>>,
    active: bool,
}

pub(crate) struct SessionHandler {
    subtype: SubType,
    state: Mutex<SessionState>,
}

pub(crate) fn blueprint(subtype: SubType) -> Blueprint {
    let handler = SessionHandler {
        subtype,
        state: Mutex::new(SessionState::default()),
    };
    Blueprint::new(handler, crate::alloc::MIN_ALLOC_SIZE)
}

impl SessionHandler {
    fn has_dependent(inv: &Invocation<'_, '_>, object_type: ObjectType) -> KernelResult<bool> {
        let mut raw = 0;
        match inv.kernel.send_internal(
            inv.object.handle,
            MessageKind::GetDependent,
            &mut Payload::Int(&mut raw),
            object_type as i32,
        ) {
            Ok(()) => Ok(true),
            Err(KernelError::NotFound) => Ok(false),
            Err(e) => Err(e),
        }
    }

    fn activate(&self, inv: &Invocation<'_, '_>) -> KernelResult<()> {
        {
            let state = lock(&self.state);
            if state.server_name.is_none() || state.port.is_none() {
                return Err(KernelError::NotInitialised);
            }
            if self.subtype == SubType::SESSION_SSH && state.user_name.is_none() {
                return Err(KernelError::NotInitialised);
            }
        }
        // A server needs its own key to answer with.
        if self.subtype == SubType::SESSION_SSL_SERVER && !Self::has_dependent(inv, ObjectType::Context)? {
            return Err(KernelError::NotInitialised);
        }
        lock(&self.state).active = true;
        log::debug!("session {} activated", inv.object.handle);
        Ok(())
    }
}

impl ObjectHandler for SessionHandler {
    fn handle(&self, inv: &mut Invocation<'_, '_>) -> KernelResult<()> {
        match inv.kind {
            MessageKind::Destroy => Ok(()),
            MessageKind::GetAttribute => {
                let state = lock(&self.state);
                let value = match inv.attribute()? {
                    Attribute::SessionServerPort => state.port.ok_or(KernelError::NotFound)?,
                    Attribute::SessionActive => i32::from(state.active),
                    _ => return Err(KernelError::NotAvailable),
                };
                drop(state);
                inv.set_int(value)
            }
            MessageKind::GetAttributeS => {
                let state = lock(&self.state);
                let bytes = match inv.attribute()? {
                    Attribute::SessionServerName => state.server_name.clone(),
                    Attribute::SessionUserName => state.user_name.clone(),
                    _ => return Err(KernelError::NotAvailable),
                }
                .ok_or(KernelError::NotFound)?;
                drop(state);
                inv.write_output(&bytes)
            }
            MessageKind::SetAttribute => {
                let value = inv.int()?;
                match inv.attribute()? {
                    Attribute::SessionServerPort => {
                        lock(&self.state).port = Some(value);
                        Ok(())
                    }
                    Attribute::SessionActive if value != 0 => self.activate(inv),
                    Attribute::SessionActive => Err(KernelError::BadArgument(ArgPosition::Num1)),
                    _ => Err(KernelError::NotAvailable),
                }
            }
            MessageKind::SetAttributeS => {
                let data = inv.data()?.to_vec();
                let mut state = lock(&self.state);
                match inv.attribute()? {
                    Attribute::SessionServerName => state.server_name = Some(data),
                    Attribute::SessionUserName => state.user_name = Some(data),
                    _ => return Err(KernelError::NotAvailable),
                }
                Ok(())
            }
            _ => Err(KernelError::NotAvailable),
        }
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}
