//! Built-in object families.
//!
//! Each family implements [`ObjectHandler`], the single entry point the
//! kernel calls with the table unlocked. Secret state lives in the object's
//! [`SecureBlock`]; everything else a handler keeps in its own fields. The
//! kernel has already checked subtype, state, access and value ranges by the
//! time a handler runs, so handlers only implement behaviour.

use std::any::Any;
use std::sync::{Mutex, MutexGuard};

use crate::alloc::SecureBlock;
use crate::error::{kernel_trap, ArgPosition, KernelError, KernelResult};
use crate::keys::KeyMaterial;
use crate::message::{Attribute, MessageKind, Origin, Payload};
use crate::types::{ActionPermissions, ObjectRef, SubType};
use crate::Kernel;

pub(crate) mod certificate;
pub(crate) mod context;
pub(crate) mod device;
pub(crate) mod envelope;
pub(crate) mod keyset;
pub(crate) mod session;
pub(crate) mod user;

/// A family's behaviour.
pub(crate) trait ObjectHandler: Send + Sync + Any {
    /// Handle one message. `Destroy` is delivered before the instance is
    /// wiped.
    fn handle(&self, inv: &mut Invocation<'_, '_>) -> KernelResult<()>;

    /// Copy raw key bytes out for a wrap.
    fn export_key(&self, _instance: &SecureBlock) -> KernelResult<KeyMaterial> {
        Err(KernelError::NotAvailable)
    }

    /// Load raw key bytes from an unwrap.
    fn import_key(&self, _instance: &mut SecureBlock, _key: &[u8]) -> KernelResult<()> {
        Err(KernelError::NotAvailable)
    }

    fn as_any(&self) -> &dyn Any;
}

/// The handler and instance memory shared by an object's table record.
pub(crate) struct ObjectBody {
    pub handler: Box<dyn ObjectHandler>,
    pub instance: Mutex<SecureBlock>,
}

/// One delivery of a message to a handler.
pub(crate) struct Invocation<'a, 'p> {
    pub kernel: &'a Kernel,
    pub object: ObjectRef,
    pub kind: MessageKind,
    pub value: i32,
    pub payload: &'a mut Payload<'p>,
    pub origin: Origin,
    instance: &'a Mutex<SecureBlock>,
}

impl<'a, 'p> Invocation<'a, 'p> {
    pub(crate) fn new(
        kernel: &'a Kernel,
        object: ObjectRef,
        kind: MessageKind,
        value: i32,
        payload: &'a mut Payload<'p>,
        origin: Origin,
        instance: &'a Mutex<SecureBlock>,
    ) -> Self {
        Self {
            kernel,
            object,
            kind,
            value,
            payload,
            origin,
            instance,
        }
    }

    /// The object's secure instance memory.
    pub(crate) fn instance(&self) -> MutexGuard<'a, SecureBlock> {
        self.instance
            .lock()
            .unwrap_or_else(|_| kernel_trap!("instance lock of {} poisoned", self.object.handle))
    }

    /// The attribute named by an attribute message.
    pub(crate) fn attribute(&self) -> KernelResult<Attribute> {
        Attribute::from_value(self.value).ok_or(KernelError::BadArgument(ArgPosition::Value))
    }

    pub(crate) fn int(&self) -> KernelResult<i32> {
        self.payload.int().ok_or(KernelError::BadArgument(ArgPosition::Str1))
    }

    pub(crate) fn set_int(&mut self, value: i32) -> KernelResult<()> {
        match &mut *self.payload {
            Payload::Int(out) => {
                **out = value;
                Ok(())
            }
            _ => Err(KernelError::BadArgument(ArgPosition::Str1)),
        }
    }

    pub(crate) fn data(&self) -> KernelResult<&[u8]> {
        match &*self.payload {
            Payload::Data(data) => Ok(*data),
            _ => Err(KernelError::BadArgument(ArgPosition::Str1)),
        }
    }

    pub(crate) fn output(&mut self) -> KernelResult<&mut Vec<u8>> {
        match &mut *self.payload {
            Payload::Output(out) => Ok(&mut **out),
            _ => Err(KernelError::BadArgument(ArgPosition::Str1)),
        }
    }

    /// Replace the output buffer's contents.
    pub(crate) fn write_output(&mut self, bytes: &[u8]) -> KernelResult<()> {
        let out = self.output()?;
        out.clear();
        out.extend_from_slice(bytes);
        Ok(())
    }
}

/// How to build an object of one subtype.
pub(crate) struct Blueprint {
    pub handler: Box<dyn ObjectHandler>,
    pub instance_size: usize,
    pub action_perms: ActionPermissions,
}

impl Blueprint {
    pub(crate) fn new(handler: impl ObjectHandler, instance_size: usize) -> Self {
        Self {
            handler: Box::new(handler),
            instance_size,
            action_perms: ActionPermissions::NONE_AVAILABLE,
        }
    }

    pub(crate) fn with_perms(mut self, perms: ActionPermissions) -> Self {
        self.action_perms = perms;
        self
    }
}

/// The blueprint for `subtype`. `arg` is family specific: the algorithm for
/// contexts, ignored elsewhere.
pub(crate) fn blueprint(subtype: SubType, arg: i32) -> KernelResult<Blueprint> {
    if SubType::CTX_ANY.contains(subtype) {
        context::blueprint(subtype, arg)
    } else if SubType::CERT_ANY.contains(subtype) {
        Ok(certificate::blueprint(subtype))
    } else if SubType::KEYSET_ANY.contains(subtype) {
        Ok(keyset::blueprint())
    } else if SubType::ENV_ANY.contains(subtype) {
        Ok(envelope::blueprint(subtype))
    } else if SubType::SESSION_ANY.contains(subtype) {
        Ok(session::blueprint(subtype))
    } else if SubType::DEV_ANY.contains(subtype) {
        Ok(device::blueprint(subtype))
    } else if SubType::USER_ANY.contains(subtype) {
        user::blueprint(subtype)
    } else {
        Err(KernelError::BadArgument(ArgPosition::Num1))
    }
}

/// Lock a handler's own state. A poisoned lock means a handler panicked
/// mid-update.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex
        .lock()
        .unwrap_or_else(|_| kernel_trap!("object state lock poisoned"))
}
