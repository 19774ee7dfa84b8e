//! Memory keysets.
//!
//! A keyset stores references to other objects under a name. Storing takes a
//! reference on the object and deleting (or destroying the keyset) gives it
//! back, so a stored object outlives its creator's handle. Hardware devices
//! use the same [`KeyStore`] for their on-board key storage.

use std::any::Any;
use std::collections::BTreeMap;
use std::sync::Mutex;

use super::{lock, Blueprint, Invocation, ObjectHandler};
use crate::error::{ArgPosition, KernelError, KernelResult};
use crate::message::{Attribute, KeyItem, KeyMgmtInfo, MessageKind, Payload};
use crate::types::ObjectRef;
use crate::Kernel;

type EntryKey = (i32, String);

/// Named object references, each holding one reference count.
#[derive(Debug, Default)]
pub(crate) struct KeyStore {
    entries: Mutex<BTreeMap<EntryKey, ObjectRef>>,
}

fn key_mgmt<'i>(inv: &'i mut Invocation<'_, '_>) -> KernelResult<(KeyItem, &'i mut KeyMgmtInfo)> {
    let item = KeyItem::from_value(inv.value).ok_or(KernelError::BadArgument(ArgPosition::Value))?;
    match &mut *inv.payload {
        Payload::KeyMgmt(info) => Ok((item, &mut **info)),
        _ => Err(KernelError::BadArgument(ArgPosition::Str1)),
    }
}

impl KeyStore {
    pub(crate) fn len(&self) -> usize {
        lock(&self.entries).len()
    }

    /// Handle `KeyGetKey`, `KeySetKey` and `KeyDeleteKey`.
    pub(crate) fn handle_key_mgmt(&self, inv: &mut Invocation<'_, '_>) -> KernelResult<()> {
        let kernel = inv.kernel;
        let kind = inv.kind;
        let origin = inv.origin;
        let (item, info) = key_mgmt(inv)?;
        let key = (item as i32, info.name.clone());

        match kind {
            MessageKind::KeySetKey => {
                let handle = info.object.ok_or(KernelError::BadArgument(ArgPosition::Num1))?;
                let object = kernel
                    .object_ref(handle)
                    .ok_or(KernelError::BadArgument(ArgPosition::Num1))?;
                let mut entries = lock(&self.entries);
                if entries.contains_key(&key) {
                    return Err(KernelError::Duplicate);
                }
                kernel.send_internal(handle, MessageKind::IncRefCount, &mut Payload::None, 0)?;
                entries.insert(key, object);
                Ok(())
            }
            MessageKind::KeyGetKey => {
                let stored = lock(&self.entries).get(&key).copied().ok_or(KernelError::NotFound)?;
                if kernel.object_ref(stored.handle) != Some(stored) {
                    lock(&self.entries).remove(&key);
                    return Err(KernelError::NotFound);
                }
                if origin.is_external() {
                    let mut external = 0;
                    kernel.send_internal(
                        stored.handle,
                        MessageKind::SetAttribute,
                        &mut Payload::Int(&mut external),
                        Attribute::Internal as i32,
                    )?;
                }
                // The caller gets a reference of its own.
                kernel.send_internal(stored.handle, MessageKind::IncRefCount, &mut Payload::None, 0)?;
                info.object = Some(stored.handle);
                Ok(())
            }
            MessageKind::KeyDeleteKey => {
                let stored = lock(&self.entries).remove(&key).ok_or(KernelError::NotFound)?;
                release(kernel, stored);
                Ok(())
            }
            _ => Err(KernelError::NotAvailable),
        }
    }

    /// Give back every stored reference.
    pub(crate) fn clear(&self, kernel: &Kernel) {
        let entries = std::mem::take(&mut *lock(&self.entries));
        for stored in entries.into_values() {
            release(kernel, stored);
        }
    }
}

fn release(kernel: &Kernel, stored: ObjectRef) {
    if kernel.object_ref(stored.handle) != Some(stored) {
        return;
    }
    if let Err(e) = kernel.send_internal(stored.handle, MessageKind::DecRefCount, &mut Payload::None, 0) {
        log::debug!("releasing stored {} failed: {e}", stored.handle);
    }
}

pub(crate) struct KeysetHandler {
    name: Mutex<Option<Vec<u8>>>,
    store: KeyStore,
}

pub(crate) fn blueprint() -> Blueprint {
    let handler = KeysetHandler {
        name: Mutex::new(None),
        store: KeyStore::default(),
    };
    Blueprint::new(handler, crate::alloc::MIN_ALLOC_SIZE)
}

impl ObjectHandler for KeysetHandler {
    fn handle(&self, inv: &mut Invocation<'_, '_>) -> KernelResult<()> {
        match inv.kind {
            MessageKind::Destroy => {
                self.store.clear(inv.kernel);
                Ok(())
            }
            MessageKind::GetAttribute => match inv.attribute()? {
                Attribute::KeysetEntries => {
                    let n = i32::try_from(self.store.len()).map_err(|_| KernelError::Overflow)?;
                    inv.set_int(n)
                }
                _ => Err(KernelError::NotAvailable),
            },
            MessageKind::GetAttributeS => match inv.attribute()? {
                Attribute::KeysetName => {
                    let name = lock(&self.name).clone().ok_or(KernelError::NotFound)?;
                    inv.write_output(&name)
                }
                _ => Err(KernelError::NotAvailable),
            },
            MessageKind::SetAttributeS => match inv.attribute()? {
                Attribute::KeysetName => {
                    *lock(&self.name) = Some(inv.data()?.to_vec());
                    Ok(())
                }
                _ => Err(KernelError::NotAvailable),
            },
            MessageKind::KeyGetKey | MessageKind::KeySetKey | MessageKind::KeyDeleteKey => {
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
    fn test_key_mgmt_rejects_unknown_item() {
        // Items outside KeyItem never reach a store.
        assert!(KeyItem::from_value(0).is_none());
        assert_eq!(KeyStore::default().len(), 0);
    }
}
