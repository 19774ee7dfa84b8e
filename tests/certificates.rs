//! Signing, certificates and CA issue / revoke.

use hexkernel::{
    key_usage, Attribute, CertAction, CertMgmtInfo, CheckType, CompareType, Handle, Kernel,
    KernelConfig, KernelError, MessageKind, ObjectType, Payload, SubType,
};

fn kernel() -> Kernel {
    Kernel::init(KernelConfig {
        lock_pages: false,
        ..KernelConfig::default()
    })
    .unwrap()
}

fn pkc(kernel: &Kernel) -> Handle {
    let ctx = kernel.create_object(ObjectType::Context, SubType::CTX_PKC, 0).unwrap();
    kernel
        .send_message(ctx, MessageKind::CtxGenKey, &mut Payload::None, 0)
        .unwrap();
    ctx
}

fn compare(kernel: &Kernel, handle: Handle, compare: CompareType, data: &[u8]) -> Result<(), KernelError> {
    kernel.send_message(handle, MessageKind::Compare, &mut Payload::Data(data), compare as i32)
}

fn cert_mgmt(kernel: &Kernel, ca: Handle, action: CertAction, info: &mut CertMgmtInfo) -> Result<(), KernelError> {
    kernel.send_message(ca, MessageKind::UserCertMgmt, &mut Payload::CertMgmt(info), action as i32)
}

/// A signed request for `subject` with `usage`.
fn request(kernel: &Kernel, subject: &str, usage: i32) -> Handle {
    let key = pkc(kernel);
    let req = kernel
        .create_object(ObjectType::Certificate, SubType::CERT_REQUEST, 0)
        .unwrap();
    kernel
        .set_attribute_data(req, Attribute::CertSubjectName, subject.as_bytes())
        .unwrap();
    kernel.set_attribute(req, Attribute::CertKeyUsage, usage).unwrap();
    kernel
        .set_attribute(req, Attribute::CertSigningKey, key.raw() as i32)
        .unwrap();
    req
}

#[test]
fn test_sign_and_verify() {
    let kernel = kernel();
    let key = pkc(&kernel);

    // 1. A signature verifies over the signed data only.
    let sig = kernel.sign(key, b"release v1.2").unwrap();
    kernel.sig_check(key, b"release v1.2", &sig).unwrap();
    assert_eq!(
        kernel.sig_check(key, b"release v1.3", &sig),
        Err(KernelError::Signature)
    );

    // 2. The key ID is the SHA-256 of the public key.
    let public = kernel.get_attribute_data(key, Attribute::CtxPublicKey).unwrap();
    assert_eq!(public.len(), 32);
    let id = ring::digest::digest(&ring::digest::SHA256, &public);
    compare(&kernel, key, CompareType::KeyId, id.as_ref()).unwrap();
    assert_eq!(
        compare(&kernel, key, CompareType::KeyId, &[0u8; 32]),
        Err(KernelError::Failed)
    );

    // 3. Capability checks.
    kernel.check(key, CheckType::Sign).unwrap();
    kernel.check(key, CheckType::PkcPrivate).unwrap();
    assert_eq!(kernel.check(key, CheckType::Crypt), Err(KernelError::NotAvailable));
}

#[test]
fn test_signed_certificate_is_read_only() {
    let kernel = kernel();
    let req = request(&kernel, "erin", key_usage::DIGITAL_SIGNATURE);

    assert_eq!(kernel.get_attribute_data(req, Attribute::CertSubjectName).unwrap(), b"erin");
    assert_eq!(kernel.get_attribute_data(req, Attribute::CertFingerprint).unwrap().len(), 32);
    assert_eq!(
        kernel.set_attribute_data(req, Attribute::CertSubjectName, b"mallory"),
        Err(KernelError::Permission)
    );
    assert_eq!(
        kernel.set_attribute(req, Attribute::CertKeyUsage, key_usage::ALL),
        Err(KernelError::Permission)
    );
}

#[test]
fn test_ca_issues_and_revokes() {
    // Goal: a CA user turns a request into a certificate and can later
    // revoke it, after which it no longer vouches for anything.
    let kernel = kernel();
    let ca = kernel.create_object(ObjectType::User, SubType::USER_CA, 0).unwrap();
    let ca_key = pkc(&kernel);
    let usage = key_usage::KEY_CERT_SIGN | key_usage::DIGITAL_SIGNATURE;
    let req = request(&kernel, "dave", usage);

    // 1. Issue.
    let mut info = CertMgmtInfo {
        ca_key,
        request: req,
        result: None,
    };
    cert_mgmt(&kernel, ca, CertAction::Issue, &mut info).unwrap();
    let cert = info.result.expect("issued certificate");

    // 2. The certificate carries the request's details and is visible.
    assert_eq!(kernel.get_attribute_data(cert, Attribute::CertSubjectName).unwrap(), b"dave");
    assert_eq!(kernel.get_attribute(cert, Attribute::CertKeyUsage).unwrap(), usage);
    compare(&kernel, cert, CompareType::Subject, b"dave").unwrap();
    let fingerprint = kernel.get_attribute_data(cert, Attribute::CertFingerprint).unwrap();
    compare(&kernel, cert, CompareType::Fingerprint, &fingerprint).unwrap();
    kernel.check(cert, CheckType::Cert).unwrap();
    kernel.check(cert, CheckType::Ca).unwrap();

    // 3. Only the issuing key can revoke.
    let other_key = pkc(&kernel);
    let mut wrong = CertMgmtInfo {
        ca_key: other_key,
        request: cert,
        result: None,
    };
    assert_eq!(
        cert_mgmt(&kernel, ca, CertAction::Revoke, &mut wrong),
        Err(KernelError::Permission)
    );
    kernel.check(cert, CheckType::Ca).unwrap();

    // 4. Revoke.
    let mut revoke = CertMgmtInfo {
        ca_key,
        request: cert,
        result: None,
    };
    cert_mgmt(&kernel, ca, CertAction::Revoke, &mut revoke).unwrap();
    assert_eq!(kernel.check(cert, CheckType::Ca), Err(KernelError::NotAvailable));
    assert_eq!(kernel.get_attribute(cert, Attribute::CertTrusted).unwrap(), 0);
}

#[test]
fn test_issue_needs_a_signed_request() {
    let kernel = kernel();
    let ca = kernel.create_object(ObjectType::User, SubType::USER_CA, 0).unwrap();
    let ca_key = pkc(&kernel);
    let unsigned = kernel
        .create_object(ObjectType::Certificate, SubType::CERT_REQUEST, 0)
        .unwrap();

    let mut info = CertMgmtInfo {
        ca_key,
        request: unsigned,
        result: None,
    };
    assert_eq!(
        cert_mgmt(&kernel, ca, CertAction::Issue, &mut info),
        Err(KernelError::NotInitialised)
    );
    assert_eq!(info.result, None);
}
