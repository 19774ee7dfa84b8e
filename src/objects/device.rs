//! Devices: the system device and hardware devices.
//!
//! The system device at [`Handle::SYSTEM`] creates every other object,
//! supplies randomness and implements the key-transport mechanisms. Hardware
//! devices create a restricted set of contexts bound to themselves and keep
//! keys in on-board storage.
//!
//! Wrapped key format, as produced by `DevExport` and read by `DevImport`:
//!
//! ```text
//! iv (12) || AES-GCM ciphertext of the raw key || tag (16)
//! ```

use std::any::Any;
use std::sync::Mutex;

use zeroize::Zeroize;

use super::keyset::KeyStore;
use super::{lock, Blueprint, Invocation, ObjectHandler};
use crate::crypto::{self, NONCE_LEN, TAG_LEN};
use crate::error::{ArgPosition, KernelError, KernelResult};
use crate::keys;
use crate::message::{Attribute, MessageKind, Payload, WrapInfo};
use crate::types::{Handle, SubType};
use crate::Kernel;

/// Shortest key a wrapped blob can carry.
const MIN_WRAPPED_KEY: usize = 8;

pub(crate) struct DeviceHandler {
    subtype: SubType,
    label: Mutex<Option<Vec<u8>>>,
    store: KeyStore,
}

pub(crate) fn blueprint(subtype: SubType) -> Blueprint {
    let label = match subtype {
        SubType::DEV_SYSTEM => Some(b"system".to_vec()),
        _ => None,
    };
    let handler = DeviceHandler {
        subtype,
        label: Mutex::new(label),
        store: KeyStore::default(),
    };
    Blueprint::new(handler, crate::alloc::MIN_ALLOC_SIZE)
}

/// Encrypt `key` under `wrap_context` with a fresh IV.
fn wrap_key(kernel: &Kernel, key: &[u8], wrap_context: Handle) -> KernelResult<Vec<u8>> {
    kernel.send_internal(wrap_context, MessageKind::CtxGenIv, &mut Payload::None, 0)?;
    let mut iv = Vec::new();
    kernel.send_internal(
        wrap_context,
        MessageKind::GetAttributeS,
        &mut Payload::Output(&mut iv),
        Attribute::CtxIv as i32,
    )?;

    let mut body = key.to_vec();
    let sealed = kernel.send_internal(wrap_context, MessageKind::CtxEncrypt, &mut Payload::Buffer(&mut body), 0);
    if let Err(e) = sealed {
        body.zeroize();
        return Err(e);
    }
    let mut tag = Vec::new();
    kernel.send_internal(
        wrap_context,
        MessageKind::GetAttributeS,
        &mut Payload::Output(&mut tag),
        Attribute::CtxAuthTag as i32,
    )?;

    let mut wrapped = iv;
    wrapped.extend_from_slice(&body);
    wrapped.extend_from_slice(&tag);
    Ok(wrapped)
}

/// Decrypt a wrapped blob under `wrap_context`, returning the raw key.
fn unwrap_key(kernel: &Kernel, wrapped: &[u8], wrap_context: Handle) -> KernelResult<keys::KeyMaterial> {
    if wrapped.len() < NONCE_LEN + MIN_WRAPPED_KEY + TAG_LEN {
        return Err(KernelError::BadData);
    }
    let (iv, rest) = wrapped.split_at(NONCE_LEN);
    let (body, tag) = rest.split_at(rest.len() - TAG_LEN);
    kernel.send_internal(
        wrap_context,
        MessageKind::SetAttributeS,
        &mut Payload::Data(iv),
        Attribute::CtxIv as i32,
    )?;
    kernel.send_internal(
        wrap_context,
        MessageKind::SetAttributeS,
        &mut Payload::Data(tag),
        Attribute::CtxAuthTag as i32,
    )?;

    let mut plain = body.to_vec();
    let opened = kernel.send_internal(wrap_context, MessageKind::CtxDecrypt, &mut Payload::Buffer(&mut plain), 0);
    let key = opened.map(|()| keys::KeyMaterial::from_slice(&plain));
    plain.zeroize();
    key
}

impl DeviceHandler {
    fn random(&self, inv: &mut Invocation<'_, '_>) -> KernelResult<()> {
        let kernel = inv.kernel;
        let object = inv.object;
        // The system device lets other threads in while the generator runs.
        let token = if self.subtype == SubType::DEV_SYSTEM {
            Some(kernel.suspend(object)?)
        } else {
            None
        };
        let filled = inv.output().and_then(|out| crypto::fill_random(out));
        if let Some(token) = token {
            kernel.resume(token)?;
        }
        filled
    }

    fn mechanism(&self, inv: &mut Invocation<'_, '_>) -> KernelResult<()> {
        let kernel = inv.kernel;
        let kind = inv.kind;
        match &mut *inv.payload {
            Payload::Wrap(info) if kind == MessageKind::DevExport => {
                let WrapInfo {
                    key_context,
                    wrap_context,
                    ..
                } = **info;
                let key = kernel.extract_key_data(key_context)?;
                info.wrapped = wrap_key(kernel, key.as_bytes(), wrap_context)?;
                log::debug!("exported key of {key_context} under {wrap_context}");
                Ok(())
            }
            Payload::Wrap(info) => {
                let key = unwrap_key(kernel, &info.wrapped, info.wrap_context)?;
                kernel.import_key_data(info.key_context, key.as_bytes())?;
                log::debug!("imported key into {} under {}", info.key_context, info.wrap_context);
                Ok(())
            }
            Payload::Derive(info) => {
                let derived = keys::derive_from_password(&info.input, &info.salt, info.iterations, info.output_len)?;
                info.output = derived.as_bytes().to_vec();
                Ok(())
            }
            _ => Err(KernelError::BadArgument(ArgPosition::Str1)),
        }
    }
}

impl ObjectHandler for DeviceHandler {
    fn handle(&self, inv: &mut Invocation<'_, '_>) -> KernelResult<()> {
        match inv.kind {
            MessageKind::Destroy => {
                self.store.clear(inv.kernel);
                Ok(())
            }
            MessageKind::GetAttributeS => match inv.attribute()? {
                Attribute::DevRandom => self.random(inv),
                Attribute::DevLabel => {
                    let label = lock(&self.label).clone().ok_or(KernelError::NotFound)?;
                    inv.write_output(&label)
                }
                _ => Err(KernelError::NotAvailable),
            },
            MessageKind::SetAttributeS => match inv.attribute()? {
                Attribute::DevLabel => {
                    *lock(&self.label) = Some(inv.data()?.to_vec());
                    Ok(())
                }
                _ => Err(KernelError::NotAvailable),
            },
            MessageKind::DevCreateObject => {
                let kernel = inv.kernel;
                let device = inv.object;
                let Payload::Create(info) = &mut *inv.payload else {
                    return Err(KernelError::BadArgument(ArgPosition::Str1));
                };
                info.result = Some(kernel.create_bound_object(device, info.subtype, info.arg)?);
                Ok(())
            }
            MessageKind::DevExport | MessageKind::DevImport | MessageKind::DevDerive => self.mechanism(inv),
            MessageKind::KeyGetKey | MessageKind::KeySetKey | MessageKind::KeyDeleteKey
                if self.subtype == SubType::DEV_HARDWARE =>
            {
                self.store.handle_key_mgmt(inv)
            }
            _ => Err(KernelError::NotAvailable),
        }
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_system_device_is_labelled() {
        let blueprint = blueprint(SubType::DEV_SYSTEM);
        let device = blueprint
            .handler
            .as_any()
            .downcast_ref::<DeviceHandler>()
            .unwrap();
        assert_eq!(lock(&device.label).as_deref(), Some(&b"system"[..]));
    }
}
