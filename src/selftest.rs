//! Startup self-test.
//!
//! Exercises the kernel's own enforcement on a throwaway conventional
//! context: visibility of internal objects, state gating, range checks on
//! attribute writes, usage-count ratcheting and property locking. Any
//! deviation means the kernel cannot be trusted to enforce policy, so
//! [`Kernel::init`] refuses to start.

use crate::error::{ArgPosition, KernelError, KernelResult};
use crate::message::{Attribute, MessageKind, Payload};
use crate::types::{Handle, SubType};
use crate::Kernel;

/// Expect `result` to fail with exactly `expected`.
fn refused(what: &str, result: KernelResult<()>, expected: KernelError) -> KernelResult<()> {
    match result {
        Err(e) if e == expected => Ok(()),
        other => {
            log::error!("self-test: {what}: expected {expected}, got {other:?}");
            Err(KernelError::Failed)
        }
    }
}

fn set_int(kernel: &Kernel, handle: Handle, attribute: Attribute, value: i32) -> KernelResult<()> {
    let mut value = value;
    kernel.send_internal(
        handle,
        MessageKind::SetAttribute,
        &mut Payload::Int(&mut value),
        attribute as i32,
    )
}

fn encrypt_block(kernel: &Kernel, handle: Handle) -> KernelResult<()> {
    let mut block = [0u8; 16];
    kernel.send_internal(handle, MessageKind::CtxEncrypt, &mut Payload::Buffer(&mut block), 0)
}

pub(crate) fn run(kernel: &Kernel) -> KernelResult<()> {
    let system = kernel.object_ref(Handle::SYSTEM).ok_or(KernelError::Failed)?;
    let context = kernel.create_bound_object(system, SubType::CTX_CONV, 0)?;
    let result = exercise(kernel, context);
    if let Err(e) = kernel.send_internal(context, MessageKind::Destroy, &mut Payload::None, 0) {
        log::error!("self-test: destroying {context} failed: {e}");
        return Err(KernelError::Failed);
    }
    if result.is_ok() {
        log::debug!("kernel self-test passed");
    }
    result
}

fn exercise(kernel: &Kernel, context: Handle) -> KernelResult<()> {
    // Internally created objects are invisible from outside.
    let mut algorithm = 0;
    refused(
        "external access to an internal object",
        kernel.send_message(
            context,
            MessageKind::GetAttribute,
            &mut Payload::Int(&mut algorithm),
            Attribute::CtxAlgorithm as i32,
        ),
        KernelError::InvalidObject,
    )?;

    refused(
        "encrypt without a key",
        encrypt_block(kernel, context),
        KernelError::NotInitialised,
    )?;
    refused(
        "undersized key size",
        set_int(kernel, context, Attribute::CtxKeySize, 8),
        KernelError::BadArgument(ArgPosition::Num1),
    )?;
    refused(
        "oversized label",
        kernel.send_internal(
            context,
            MessageKind::SetAttributeS,
            &mut Payload::Data(&[b'x'; 65]),
            Attribute::CtxLabel as i32,
        ),
        KernelError::BadArgument(ArgPosition::Str1),
    )?;

    kernel.send_internal(context, MessageKind::CtxGenKey, &mut Payload::None, 0)?;

    set_int(kernel, context, Attribute::UsageCount, 1)?;
    encrypt_block(kernel, context)?;
    refused(
        "encrypt past the usage count",
        encrypt_block(kernel, context),
        KernelError::Permission,
    )?;
    refused(
        "raising the usage count",
        set_int(kernel, context, Attribute::UsageCount, 5),
        KernelError::Permission,
    )?;

    set_int(kernel, context, Attribute::HighSecurity, 1)?;
    refused(
        "property write after locking",
        set_int(kernel, context, Attribute::Internal, 1),
        KernelError::Permission,
    )?;
    Ok(())
}
