//! Users: the default security officer and ordinary and CA users.
//!
//! A user holds configuration options. Changes are tracked until committed
//! by writing `OptionConfigChanged = 0`, which serialises the options. CA
//! users also issue and revoke certificates through `UserCertMgmt`.

use std::any::Any;
use std::sync::Mutex;

use serde::Serialize;

use super::certificate::CertificateHandler;
use super::{lock, Blueprint, Invocation, ObjectHandler};
use crate::error::{ArgPosition, KernelError, KernelResult};
use crate::message::{algorithm, Attribute, CertAction, CertMgmtInfo, MessageKind, Payload};
use crate::types::{Handle, ObjectType, SubType};
use crate::Kernel;

const DEFAULT_KEYING_ITERATIONS: i32 = 1000;

#[derive(Debug, Serialize)]
struct UserOptions {
    encryption_algorithm: i32,
    keying_iterations: i32,
}

impl Default for UserOptions {
    fn default() -> Self {
        Self {
            encryption_algorithm: algorithm::AES_256_GCM,
            keying_iterations: DEFAULT_KEYING_ITERATIONS,
        }
    }
}

#[derive(Debug)]
struct UserState {
    name: Option<Vec<u8>>,
    options: UserOptions,
    /// Serialised form of the last committed options.
    committed: Vec<u8>,
}

impl UserState {
    /// Options differ from what was last committed.
    fn changed(&self) -> KernelResult<bool> {
        Ok(serialise(&self.options)? != self.committed)
    }
}

fn serialise(options: &UserOptions) -> KernelResult<Vec<u8>> {
    serde_json::to_vec(options).map_err(|_| KernelError::Failed)
}

pub(crate) struct UserHandler {
    subtype: SubType,
    state: Mutex<UserState>,
}

pub(crate) fn blueprint(subtype: SubType) -> KernelResult<Blueprint> {
    let options = UserOptions::default();
    let state = UserState {
        name: (subtype == SubType::USER_SO).then(|| b"Security officer".to_vec()),
        committed: serialise(&options)?,
        options,
    };
    let handler = UserHandler {
        subtype,
        state: Mutex::new(state),
    };
    Ok(Blueprint::new(handler, crate::alloc::MIN_ALLOC_SIZE))
}

impl UserHandler {
    fn commit(&self, inv: &Invocation<'_, '_>) -> KernelResult<()> {
        // The default user is shared by every thread: let them in while the
        // options are written out.
        let token = if inv.object.handle.is_reserved() {
            Some(inv.kernel.suspend(inv.object)?)
        } else {
            None
        };
        let written = {
            let mut state = lock(&self.state);
            serialise(&state.options).map(|bytes| {
                log::debug!("committed {} bytes of options for {}", bytes.len(), inv.object.handle);
                state.committed = bytes;
            })
        };
        if let Some(token) = token {
            inv.kernel.resume(token)?;
        }
        written
    }

    fn cert_mgmt(&self, inv: &mut Invocation<'_, '_>) -> KernelResult<()> {
        if self.subtype != SubType::USER_CA {
            return Err(KernelError::NotAvailable);
        }
        let kernel = inv.kernel;
        let action = CertAction::from_value(inv.value).ok_or(KernelError::BadArgument(ArgPosition::Value))?;
        let Payload::CertMgmt(info) = &mut *inv.payload else {
            return Err(KernelError::BadArgument(ArgPosition::Str1));
        };
        match action {
            CertAction::Issue => {
                let issued = issue(kernel, &**info)?;
                info.result = Some(issued);
                log::debug!("{} issued {issued} from request {}", inv.object.handle, info.request);
            }
            CertAction::Revoke => {
                let mut signer = 0;
                kernel.send_internal(
                    info.request,
                    MessageKind::GetDependent,
                    &mut Payload::Int(&mut signer),
                    ObjectType::Context as i32,
                )?;
                if Handle::from_value(signer) != Some(info.ca_key) {
                    return Err(KernelError::Permission);
                }
                let held = kernel.acquire_object(info.request)?;
                held.handler::<CertificateHandler>()
                    .ok_or(KernelError::Failed)?
                    .revoke();
                log::debug!("{} revoked {}", inv.object.handle, held.handle());
            }
        }
        Ok(())
    }
}

/// Issue a certificate for the subject and key usage of a request, signed
/// by the CA key.
fn issue(kernel: &Kernel, info: &CertMgmtInfo) -> KernelResult<Handle> {
    let (subject, usage) = {
        let held = kernel.acquire_object(info.request)?;
        let request = held.handler::<CertificateHandler>().ok_or(KernelError::Failed)?;
        if request.is_revoked() {
            return Err(KernelError::Permission);
        }
        (request.subject().ok_or(KernelError::NotInitialised)?, request.key_usage())
    };

    let system = kernel.object_ref(Handle::SYSTEM).ok_or(KernelError::Failed)?;
    let cert = kernel.create_bound_object(system, SubType::CERT_CERTIFICATE, 0)?;
    let filled = (|| {
        kernel.send_internal(
            cert,
            MessageKind::SetAttributeS,
            &mut Payload::Data(subject.as_bytes()),
            Attribute::CertSubjectName as i32,
        )?;
        if usage != 0 {
            let mut usage = usage;
            kernel.send_internal(
                cert,
                MessageKind::SetAttribute,
                &mut Payload::Int(&mut usage),
                Attribute::CertKeyUsage as i32,
            )?;
        }
        let mut key = info.ca_key.as_value();
        kernel.send_internal(
            cert,
            MessageKind::SetAttribute,
            &mut Payload::Int(&mut key),
            Attribute::CertSigningKey as i32,
        )
    })();
    if let Err(e) = filled {
        if let Err(cleanup) = kernel.send_internal(cert, MessageKind::Destroy, &mut Payload::None, 0) {
            log::warn!("discarding unfinished certificate {cert} failed: {cleanup}");
        }
        return Err(e);
    }
    Ok(cert)
}

impl ObjectHandler for UserHandler {
    fn handle(&self, inv: &mut Invocation<'_, '_>) -> KernelResult<()> {
        match inv.kind {
            MessageKind::Destroy => Ok(()),
            MessageKind::GetAttribute => {
                let state = lock(&self.state);
                let value = match inv.attribute()? {
                    Attribute::OptionEncryptionAlgo => state.options.encryption_algorithm,
                    Attribute::OptionKeyingIterations => state.options.keying_iterations,
                    Attribute::OptionConfigChanged => i32::from(state.changed()?),
                    _ => return Err(KernelError::NotAvailable),
                };
                drop(state);
                inv.set_int(value)
            }
            MessageKind::SetAttribute => {
                let value = inv.int()?;
                let attribute = inv.attribute()?;
                if attribute == Attribute::OptionConfigChanged {
                    if value != 0 {
                        return Err(KernelError::BadArgument(ArgPosition::Num1));
                    }
                    return self.commit(inv);
                }
                let mut state = lock(&self.state);
                match attribute {
                    Attribute::OptionEncryptionAlgo => state.options.encryption_algorithm = value,
                    Attribute::OptionKeyingIterations => state.options.keying_iterations = value,
                    _ => return Err(KernelError::NotAvailable),
                }
                Ok(())
            }
            MessageKind::GetAttributeS => match inv.attribute()? {
                Attribute::UserName => {
                    let name = lock(&self.state).name.clone().ok_or(KernelError::NotFound)?;
                    inv.write_output(&name)
                }
                _ => Err(KernelError::NotAvailable),
            },
            MessageKind::SetAttributeS => match inv.attribute()? {
                Attribute::UserName => {
                    lock(&self.state).name = Some(inv.data()?.to_vec());
                    Ok(())
                }
                _ => Err(KernelError::NotAvailable),
            },
            MessageKind::UserCertMgmt => self.cert_mgmt(inv),
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
    fn test_default_options_serialise() {
        let json = serde_json::to_string(&UserOptions::default()).unwrap();
        assert_eq!(json, r#"{"encryption_algorithm":2,"keying_iterations":1000}"#);
    }

    #[test]
    fn test_security_officer_has_a_name() {
        // 1. Fresh options count as committed.
        let blueprint = blueprint(SubType::USER_SO).unwrap();
        let user = blueprint.handler.as_any().downcast_ref::<UserHandler>().unwrap();
        assert!(lock(&user.state).name.is_some());
        assert!(!lock(&user.state).changed().unwrap());

        // 2. A change shows until committed or reverted.
        lock(&user.state).options.keying_iterations = 5;
        assert!(lock(&user.state).changed().unwrap());
        lock(&user.state).options.keying_iterations = DEFAULT_KEYING_ITERATIONS;
        assert!(!lock(&user.state).changed().unwrap());
    }
}
