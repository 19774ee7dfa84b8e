//! Certificates, certificate requests, chains and CRLs.
//!
//! A certificate is a set of attributes until it is signed. Setting
//! `CertSigningKey` signs a canonical JSON encoding of those attributes with
//! the given public-key context, attaches the key as the certificate's
//! dependent object and moves the certificate into the high state, after
//! which it is read-only.

use std::any::Any;
use std::sync::Mutex;

use serde::Serialize;

use super::{lock, Blueprint, Invocation, ObjectHandler};
use crate::error::{ArgPosition, KernelError, KernelResult};
use crate::message::{key_usage, Attribute, CheckType, CompareType, MessageKind, Payload, SignatureData};
use crate::types::{Handle, SubType};

#[derive(Debug, Default)]
struct CertState {
    key_usage: i32,
    self_signed: bool,
    subject: Option<String>,
    valid_to: i32,
    trusted: bool,
    revoked: bool,
    signature: Option<Vec<u8>>,
    fingerprint: Option<Vec<u8>>,
}

/// The signed part of a certificate.
#[derive(Serialize)]
struct ToBeSigned<'a> {
    subject: &'a str,
    key_usage: i32,
    valid_to: i32,
    self_signed: bool,
}

pub(crate) struct CertificateHandler {
    subtype: SubType,
    state: Mutex<CertState>,
}

pub(crate) fn blueprint(subtype: SubType) -> Blueprint {
    let handler = CertificateHandler {
        subtype,
        state: Mutex::new(CertState::default()),
    };
    Blueprint::new(handler, crate::alloc::MIN_ALLOC_SIZE)
}

impl CertificateHandler {
    pub(crate) fn subject(&self) -> Option<String> {
        lock(&self.state).subject.clone()
    }

    pub(crate) fn key_usage(&self) -> i32 {
        lock(&self.state).key_usage
    }

    pub(crate) fn is_revoked(&self) -> bool {
        lock(&self.state).revoked
    }

    /// Mark the certificate revoked. It stops vouching for anything,
    /// including other certificates.
    pub(crate) fn revoke(&self) {
        let mut state = lock(&self.state);
        state.revoked = true;
        state.trusted = false;
    }

    fn to_be_signed(&self, state: &CertState) -> KernelResult<Vec<u8>> {
        let subject = state.subject.as_deref().ok_or(KernelError::NotInitialised)?;
        serde_json::to_vec(&ToBeSigned {
            subject,
            key_usage: state.key_usage,
            valid_to: state.valid_to,
            self_signed: state.self_signed,
        })
        .map_err(|_| KernelError::Failed)
    }

    /// Sign with `key`, then take a reference on it as our dependent object.
    fn sign_with(&self, inv: &Invocation<'_, '_>, key: Handle) -> KernelResult<()> {
        let tbs = {
            let state = lock(&self.state);
            if state.signature.is_some() {
                return Err(KernelError::AlreadyInitialised);
            }
            self.to_be_signed(&state)?
        };

        let mut sig = SignatureData {
            data: tbs,
            signature: Vec::new(),
        };
        inv.kernel
            .send_internal(key, MessageKind::CtxSign, &mut Payload::Signature(&mut sig), 0)?;
        let mut dep = key.as_value();
        inv.kernel.send_internal(
            inv.object.handle,
            MessageKind::SetDependent,
            &mut Payload::Int(&mut dep),
            1,
        )?;

        let mut signed = sig.data;
        signed.extend_from_slice(&sig.signature);
        let mut state = lock(&self.state);
        state.fingerprint = Some(crate::crypto::sha256(&signed));
        state.signature = Some(sig.signature);
        log::debug!("{} signed by {key}", inv.object.handle);
        Ok(())
    }

    fn get_attribute(&self, inv: &mut Invocation<'_, '_>) -> KernelResult<()> {
        let state = lock(&self.state);
        let value = match inv.attribute()? {
            Attribute::CertKeyUsage => state.key_usage,
            Attribute::CertSelfSigned => i32::from(state.self_signed),
            Attribute::CertValidTo => state.valid_to,
            Attribute::CertTrusted => i32::from(state.trusted),
            _ => return Err(KernelError::NotAvailable),
        };
        drop(state);
        inv.set_int(value)
    }

    fn get_attribute_data(&self, inv: &mut Invocation<'_, '_>) -> KernelResult<()> {
        let state = lock(&self.state);
        let bytes = match inv.attribute()? {
            Attribute::CertSubjectName => state
                .subject
                .clone()
                .map(String::into_bytes)
                .ok_or(KernelError::NotFound)?,
            Attribute::CertFingerprint => state.fingerprint.clone().ok_or(KernelError::NotInitialised)?,
            _ => return Err(KernelError::NotAvailable),
        };
        drop(state);
        inv.write_output(&bytes)
    }

    fn set_attribute(&self, inv: &mut Invocation<'_, '_>) -> KernelResult<()> {
        let value = inv.int()?;
        match inv.attribute()? {
            Attribute::CertSigningKey => {
                let key = Handle::from_value(value).ok_or(KernelError::BadArgument(ArgPosition::Num1))?;
                return self.sign_with(inv, key);
            }
            Attribute::CertKeyUsage => lock(&self.state).key_usage = value,
            Attribute::CertSelfSigned => lock(&self.state).self_signed = value != 0,
            Attribute::CertValidTo => lock(&self.state).valid_to = value,
            Attribute::CertTrusted => {
                let mut state = lock(&self.state);
                if state.revoked && value != 0 {
                    return Err(KernelError::Permission);
                }
                state.trusted = value != 0;
            }
            _ => return Err(KernelError::NotAvailable),
        }
        Ok(())
    }

    fn compare(&self, inv: &Invocation<'_, '_>) -> KernelResult<()> {
        let data = inv.data()?;
        let state = lock(&self.state);
        let matches = match CompareType::from_value(inv.value) {
            Some(CompareType::Subject) => state.subject.as_deref().map(str::as_bytes) == Some(data),
            Some(CompareType::Fingerprint) => state.fingerprint.as_deref() == Some(data),
            _ => return Err(KernelError::NotAvailable),
        };
        if matches {
            Ok(())
        } else {
            Err(KernelError::Failed)
        }
    }
}

impl ObjectHandler for CertificateHandler {
    fn handle(&self, inv: &mut Invocation<'_, '_>) -> KernelResult<()> {
        match inv.kind {
            MessageKind::Destroy => Ok(()),
            MessageKind::GetAttribute => self.get_attribute(inv),
            MessageKind::GetAttributeS => self.get_attribute_data(inv),
            MessageKind::SetAttribute => self.set_attribute(inv),
            MessageKind::SetAttributeS => match inv.attribute()? {
                Attribute::CertSubjectName => {
                    let subject = std::str::from_utf8(inv.data()?)
                        .map_err(|_| KernelError::BadArgument(ArgPosition::Str1))?;
                    lock(&self.state).subject = Some(subject.to_owned());
                    Ok(())
                }
                _ => Err(KernelError::NotAvailable),
            },
            MessageKind::Compare => self.compare(inv),
            // The kernel only delegates the CA check.
            MessageKind::Check => match CheckType::from_value(inv.value) {
                Some(CheckType::Ca) => {
                    let state = lock(&self.state);
                    if self.subtype == SubType::CERT_CERTIFICATE
                        && !state.revoked
                        && state.key_usage & key_usage::KEY_CERT_SIGN != 0
                    {
                        Ok(())
                    } else {
                        Err(KernelError::NotAvailable)
                    }
                }
                _ => Err(KernelError::NotAvailable),
            },
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
    fn test_to_be_signed_needs_subject() {
        let handler = CertificateHandler {
            subtype: SubType::CERT_CERTIFICATE,
            state: Mutex::new(CertState::default()),
        };

        // 1. No subject yet.
        let state = lock(&handler.state);
        assert_eq!(handler.to_be_signed(&state), Err(KernelError::NotInitialised));
        drop(state);

        // 2. The encoding covers every signed field.
        lock(&handler.state).subject = Some("alice".into());
        lock(&handler.state).key_usage = key_usage::DIGITAL_SIGNATURE;
        let state = lock(&handler.state);
        let tbs = String::from_utf8(handler.to_be_signed(&state).unwrap()).unwrap();
        assert!(tbs.contains("\"subject\":\"alice\""));
        assert!(tbs.contains("\"key_usage\":1"));
    }

    #[test]
    fn test_revoke_clears_trust() {
        let handler = CertificateHandler {
            subtype: SubType::CERT_CERTIFICATE,
            state: Mutex::new(CertState::default()),
        };
        lock(&handler.state).trusted = true;
        handler.revoke();
        assert!(handler.is_revoked());
        assert!(!lock(&handler.state).trusted);
    }
}
