//! Envelopes and de-envelopes.
//!
//! Data pushed into an envelope is encrypted under its session key and
//! buffered as ciphertext followed by the 16-byte tag; data pushed into a
//! de-envelope is split the same way and decrypted. Popping drains the
//! buffer. The session key is a conventional context attached as the
//! envelope's dependent object, so crypt messages sent to the envelope reach
//! it by routing.

use std::any::Any;
use std::sync::Mutex;

use zeroize::Zeroize;

use super::{lock, Blueprint, Invocation, ObjectHandler};
use crate::crypto::TAG_LEN;
use crate::error::{ArgPosition, KernelError, KernelResult};
use crate::message::{content_type, Attribute, MessageKind, Payload};
use crate::types::{Handle, ObjectType, SubType};

#[derive(Debug)]
struct EnvelopeState {
    buffer: Vec<u8>,
    data_size: Option<i32>,
    content_type: i32,
}

pub(crate) struct EnvelopeHandler {
    subtype: SubType,
    state: Mutex<EnvelopeState>,
}

pub(crate) fn blueprint(subtype: SubType) -> Blueprint {
    let handler = EnvelopeHandler {
        subtype,
        state: Mutex::new(EnvelopeState {
            buffer: Vec::new(),
            data_size: None,
            content_type: content_type::DATA,
        }),
    };
    Blueprint::new(handler, crate::alloc::MIN_ALLOC_SIZE)
}

impl EnvelopeHandler {
    fn session_key(inv: &Invocation<'_, '_>) -> KernelResult<Handle> {
        let mut raw = 0;
        let found = inv.kernel.send_internal(
            inv.object.handle,
            MessageKind::GetDependent,
            &mut Payload::Int(&mut raw),
            ObjectType::Context as i32,
        );
        match found {
            Ok(()) => Handle::from_value(raw).ok_or(KernelError::Failed),
            Err(KernelError::NotFound) => Err(KernelError::NotInitialised),
            Err(e) => Err(e),
        }
    }

    fn push(&self, inv: &mut Invocation<'_, '_>) -> KernelResult<()> {
        let key = Self::session_key(inv)?;
        let data = inv.data()?;
        if data.is_empty() {
            return Ok(());
        }
        let kernel = inv.kernel;
        let this = inv.object.handle;

        if self.subtype == SubType::ENV_ENVELOPE {
            let mut sealed = data.to_vec();
            kernel.send_internal(this, MessageKind::CtxEncrypt, &mut Payload::Buffer(&mut sealed), 0)?;
            let mut tag = Vec::new();
            kernel.send_internal(
                key,
                MessageKind::GetAttributeS,
                &mut Payload::Output(&mut tag),
                Attribute::CtxAuthTag as i32,
            )?;
            let mut state = lock(&self.state);
            state.buffer.extend_from_slice(&sealed);
            state.buffer.extend_from_slice(&tag);
        } else {
            if data.len() <= TAG_LEN {
                return Err(KernelError::Underflow);
            }
            let (ciphertext, tag) = data.split_at(data.len() - TAG_LEN);
            kernel.send_internal(
                key,
                MessageKind::SetAttributeS,
                &mut Payload::Data(tag),
                Attribute::CtxAuthTag as i32,
            )?;
            let mut opened = ciphertext.to_vec();
            kernel.send_internal(this, MessageKind::CtxDecrypt, &mut Payload::Buffer(&mut opened), 0)?;
            lock(&self.state).buffer.extend_from_slice(&opened);
            opened.zeroize();
        }
        Ok(())
    }

    fn pop(&self, inv: &mut Invocation<'_, '_>) -> KernelResult<()> {
        let mut buffered = std::mem::take(&mut lock(&self.state).buffer);
        if buffered.is_empty() {
            return Err(KernelError::Underflow);
        }
        let result = inv.write_output(&buffered);
        buffered.zeroize();
        result
    }
}

impl ObjectHandler for EnvelopeHandler {
    fn handle(&self, inv: &mut Invocation<'_, '_>) -> KernelResult<()> {
        match inv.kind {
            MessageKind::Destroy => {
                lock(&self.state).buffer.zeroize();
                Ok(())
            }
            MessageKind::GetAttribute => {
                let state = lock(&self.state);
                let value = match inv.attribute()? {
                    Attribute::EnvDataSize => state.data_size.ok_or(KernelError::NotFound)?,
                    Attribute::EnvContentType => state.content_type,
                    _ => return Err(KernelError::NotAvailable),
                };
                drop(state);
                inv.set_int(value)
            }
            MessageKind::SetAttribute => {
                let value = inv.int()?;
                match inv.attribute()? {
                    Attribute::EnvDataSize => lock(&self.state).data_size = Some(value),
                    Attribute::EnvContentType => lock(&self.state).content_type = value,
                    Attribute::EnvSessionKey => {
                        let mut dep = value;
                        Handle::from_value(dep).ok_or(KernelError::BadArgument(ArgPosition::Num1))?;
                        inv.kernel.send_internal(
                            inv.object.handle,
                            MessageKind::SetDependent,
                            &mut Payload::Int(&mut dep),
                            1,
                        )?;
                    }
                    _ => return Err(KernelError::NotAvailable),
                }
                Ok(())
            }
            MessageKind::EnvPushData => self.push(inv),
            MessageKind::EnvPopData => self.pop(inv),
            _ => Err(KernelError::NotAvailable),
        }
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}
