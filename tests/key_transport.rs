//! Moving keys and data between objects: envelopes, key wrapping, password
//! derivation and keysets.

use std::num::NonZeroU32;

use hexkernel::{
    algorithm, ArgPosition, Attribute, DeriveInfo, Handle, Kernel, KernelConfig, KernelError, KeyItem,
    KeyMgmtInfo, MechanismType, MessageKind, ObjectType, Payload, SubType, WrapInfo,
};

fn kernel() -> Kernel {
    Kernel::init(KernelConfig {
        lock_pages: false,
        ..KernelConfig::default()
    })
    .unwrap()
}

fn generated(kernel: &Kernel, subtype: SubType) -> Handle {
    let ctx = kernel.create_object(ObjectType::Context, subtype, 0).unwrap();
    kernel
        .send_message(ctx, MessageKind::CtxGenKey, &mut Payload::None, 0)
        .unwrap();
    ctx
}

/// A conventional context with a fixed key and IV.
fn fixed_key_context(kernel: &Kernel) -> Handle {
    let ctx = kernel.create_object(ObjectType::Context, SubType::CTX_CONV, 0).unwrap();
    kernel.set_attribute_data(ctx, Attribute::CtxIv, &[9u8; 12]).unwrap();
    kernel.set_attribute_data(ctx, Attribute::CtxKey, &[5u8; 32]).unwrap();
    ctx
}

fn envelope(kernel: &Kernel, subtype: SubType, key: Handle) -> Handle {
    let env = kernel.create_object(ObjectType::Envelope, subtype, 0).unwrap();
    kernel
        .set_attribute(env, Attribute::EnvSessionKey, key.raw() as i32)
        .unwrap();
    env
}

fn push(kernel: &Kernel, env: Handle, data: &[u8]) -> Result<(), KernelError> {
    kernel.send_message(env, MessageKind::EnvPushData, &mut Payload::Data(data), 0)
}

fn pop(kernel: &Kernel, env: Handle) -> Result<Vec<u8>, KernelError> {
    let mut out = Vec::new();
    kernel.send_message(env, MessageKind::EnvPopData, &mut Payload::Output(&mut out), 0)?;
    Ok(out)
}

fn wrap(kernel: &Kernel, kind: MessageKind, info: &mut WrapInfo) -> Result<(), KernelError> {
    kernel.send_message(
        Handle::SYSTEM,
        kind,
        &mut Payload::Wrap(info),
        MechanismType::Wrap as i32,
    )
}

#[test]
fn test_envelope_round_trip() {
    let kernel = kernel();
    let sender = envelope(&kernel, SubType::ENV_ENVELOPE, fixed_key_context(&kernel));
    let receiver = envelope(&kernel, SubType::ENV_DEENVELOPE, fixed_key_context(&kernel));

    // 1. Envelope: ciphertext followed by the tag.
    push(&kernel, sender, b"attack at dawn").unwrap();
    let sealed = pop(&kernel, sender).unwrap();
    assert_eq!(sealed.len(), b"attack at dawn".len() + 16);
    assert_eq!(pop(&kernel, sender), Err(KernelError::Underflow));

    // 2. De-envelope.
    push(&kernel, receiver, &sealed).unwrap();
    assert_eq!(pop(&kernel, receiver).unwrap(), b"attack at dawn");
}

#[test]
fn test_deenvelope_rejects_tampering() {
    let kernel = kernel();
    let sender = envelope(&kernel, SubType::ENV_ENVELOPE, fixed_key_context(&kernel));
    let receiver = envelope(&kernel, SubType::ENV_DEENVELOPE, fixed_key_context(&kernel));

    push(&kernel, sender, b"pay 100").unwrap();
    let sealed = pop(&kernel, sender).unwrap();

    // 1. A flipped ciphertext bit fails authentication.
    let mut tampered = sealed.clone();
    tampered[0] ^= 0x01;
    assert_eq!(push(&kernel, receiver, &tampered), Err(KernelError::BadData));
    assert_eq!(pop(&kernel, receiver), Err(KernelError::Underflow));

    // 2. The genuine message still opens afterwards.
    push(&kernel, receiver, &sealed).unwrap();
    assert_eq!(pop(&kernel, receiver).unwrap(), b"pay 100");

    // 3. Anything no longer than a tag is too short.
    assert_eq!(push(&kernel, receiver, &[0u8; 16]), Err(KernelError::Underflow));
}

#[test]
fn test_envelope_needs_a_session_key() {
    let kernel = kernel();
    let env = kernel
        .create_object(ObjectType::Envelope, SubType::ENV_ENVELOPE, 0)
        .unwrap();
    assert_eq!(push(&kernel, env, b"data"), Err(KernelError::NotInitialised));

    // A key that was never loaded cannot be attached.
    let unkeyed = kernel.create_object(ObjectType::Context, SubType::CTX_CONV, 0).unwrap();
    assert_eq!(
        kernel.set_attribute(env, Attribute::EnvSessionKey, unkeyed.raw() as i32),
        Err(KernelError::NotInitialised)
    );
}

#[test]
fn test_wrap_and_unwrap_key() {
    // Goal: a key exported under a KEK and imported elsewhere decrypts what
    // the original encrypted.
    let kernel = kernel();
    let kek = generated(&kernel, SubType::CTX_CONV);
    let original = generated(&kernel, SubType::CTX_CONV);

    // 1. Export.
    let mut export = WrapInfo {
        wrapped: Vec::new(),
        key_context: original,
        wrap_context: kek,
    };
    wrap(&kernel, MessageKind::DevExport, &mut export).unwrap();
    assert_eq!(export.wrapped.len(), 12 + 32 + 16);

    // 2. Import into a fresh context sharing the original's IV.
    let copy = kernel.create_object(ObjectType::Context, SubType::CTX_CONV, 0).unwrap();
    let iv = kernel.get_attribute_data(original, Attribute::CtxIv).unwrap();
    kernel.set_attribute_data(copy, Attribute::CtxIv, &iv).unwrap();
    let mut import = WrapInfo {
        wrapped: export.wrapped.clone(),
        key_context: copy,
        wrap_context: kek,
    };
    wrap(&kernel, MessageKind::DevImport, &mut import).unwrap();

    // 3. Encrypt with one, decrypt with the other.
    let mut block = *b"sixteen byte msg";
    kernel.encrypt(original, &mut block).unwrap();
    let tag = kernel.get_attribute_data(original, Attribute::CtxAuthTag).unwrap();
    kernel.set_attribute_data(copy, Attribute::CtxAuthTag, &tag).unwrap();
    kernel.decrypt(copy, &mut block).unwrap();
    assert_eq!(&block, b"sixteen byte msg");
}

#[test]
fn test_wrap_argument_checks() {
    let kernel = kernel();
    let kek = generated(&kernel, SubType::CTX_CONV);
    let original = generated(&kernel, SubType::CTX_CONV);
    let mut export = WrapInfo {
        wrapped: Vec::new(),
        key_context: original,
        wrap_context: kek,
    };
    wrap(&kernel, MessageKind::DevExport, &mut export).unwrap();

    // 1. A tampered blob is refused and the target stays unkeyed.
    let target = kernel.create_object(ObjectType::Context, SubType::CTX_CONV, 0).unwrap();
    let mut tampered = export.wrapped.clone();
    tampered[20] ^= 0x80;
    let mut import = WrapInfo {
        wrapped: tampered,
        key_context: target,
        wrap_context: kek,
    };
    assert_eq!(wrap(&kernel, MessageKind::DevImport, &mut import), Err(KernelError::BadData));
    let mut block = [0u8; 16];
    assert_eq!(kernel.encrypt(target, &mut block), Err(KernelError::NotInitialised));

    // 2. Exporting an unkeyed context.
    let mut unkeyed = WrapInfo {
        wrapped: Vec::new(),
        key_context: target,
        wrap_context: kek,
    };
    assert_eq!(
        wrap(&kernel, MessageKind::DevExport, &mut unkeyed),
        Err(KernelError::NotInitialised)
    );

    // 3. Wrapping a key under itself.
    let mut itself = WrapInfo {
        wrapped: Vec::new(),
        key_context: kek,
        wrap_context: kek,
    };
    assert_eq!(
        wrap(&kernel, MessageKind::DevExport, &mut itself),
        Err(KernelError::BadArgument(ArgPosition::Num2))
    );

    // 4. The mechanism must match the message.
    let result = kernel.send_message(
        Handle::SYSTEM,
        MessageKind::DevExport,
        &mut Payload::Wrap(&mut export),
        MechanismType::Derive as i32,
    );
    assert_eq!(result, Err(KernelError::BadArgument(ArgPosition::Value)));
}

#[test]
fn test_password_derivation_matches_pbkdf2() {
    let kernel = kernel();
    let mut info = DeriveInfo {
        input: b"correct horse".to_vec(),
        salt: b"NaCl and pepper".to_vec(),
        iterations: 1000,
        output_len: 32,
        output: Vec::new(),
    };
    kernel
        .send_message(
            Handle::SYSTEM,
            MessageKind::DevDerive,
            &mut Payload::Derive(&mut info),
            MechanismType::Derive as i32,
        )
        .unwrap();

    let mut expected = [0u8; 32];
    ring::pbkdf2::derive(
        ring::pbkdf2::PBKDF2_HMAC_SHA256,
        NonZeroU32::new(1000).unwrap(),
        b"NaCl and pepper",
        b"correct horse",
        &mut expected,
    );
    assert_eq!(info.output, expected);

    // Too short a salt.
    info.salt = b"salt".to_vec();
    let result = kernel.send_message(
        Handle::SYSTEM,
        MessageKind::DevDerive,
        &mut Payload::Derive(&mut info),
        MechanismType::Derive as i32,
    );
    assert_eq!(result, Err(KernelError::BadArgument(ArgPosition::Str2)));
}

#[test]
fn test_keyset_holds_its_own_reference() {
    let kernel = kernel();
    let keyset = kernel
        .create_object(ObjectType::Keyset, SubType::KEYSET_MEMORY, 0)
        .unwrap();
    let secret = generated(&kernel, SubType::CTX_GENERIC);
    let key_mgmt = |kind, info: &mut KeyMgmtInfo| {
        kernel.send_message(keyset, kind, &mut Payload::KeyMgmt(info), KeyItem::Secret as i32)
    };

    // 1. Store.
    let mut info = KeyMgmtInfo {
        name: "backup".into(),
        object: Some(secret),
    };
    key_mgmt(MessageKind::KeySetKey, &mut info).unwrap();
    assert_eq!(kernel.get_attribute(keyset, Attribute::KeysetEntries).unwrap(), 1);
    assert_eq!(
        key_mgmt(MessageKind::KeySetKey, &mut info),
        Err(KernelError::Duplicate)
    );

    // 2. The creator lets go; the keyset keeps it alive but hidden.
    kernel.destroy_object(secret).unwrap();
    assert!(kernel.is_valid_object(secret));
    assert_eq!(
        kernel.get_attribute(secret, Attribute::CtxAlgorithm),
        Err(KernelError::InvalidObject)
    );

    // 3. Fetching hands the caller a visible reference.
    let mut fetch = KeyMgmtInfo {
        name: "backup".into(),
        object: None,
    };
    key_mgmt(MessageKind::KeyGetKey, &mut fetch).unwrap();
    assert_eq!(fetch.object, Some(secret));
    assert_eq!(
        kernel.get_attribute(secret, Attribute::CtxAlgorithm).unwrap(),
        algorithm::GENERIC_SECRET
    );

    // 4. Deleting the entry leaves the caller's reference.
    key_mgmt(MessageKind::KeyDeleteKey, &mut fetch).unwrap();
    assert_eq!(kernel.get_attribute(keyset, Attribute::KeysetEntries).unwrap(), 0);
    assert!(kernel.is_valid_object(secret));
    kernel.destroy_object(secret).unwrap();
    assert!(!kernel.is_valid_object(secret));
    assert_eq!(
        key_mgmt(MessageKind::KeyGetKey, &mut fetch),
        Err(KernelError::NotFound)
    );
}

#[test]
fn test_keyset_argument_checks() {
    let kernel = kernel();
    let keyset = kernel
        .create_object(ObjectType::Keyset, SubType::KEYSET_MEMORY, 0)
        .unwrap();
    let conv = generated(&kernel, SubType::CTX_CONV);
    let secret = generated(&kernel, SubType::CTX_GENERIC);

    // 1. Only generic secrets are stored as secrets.
    let mut info = KeyMgmtInfo {
        name: "wrong kind".into(),
        object: Some(conv),
    };
    let result = kernel.send_message(
        keyset,
        MessageKind::KeySetKey,
        &mut Payload::KeyMgmt(&mut info),
        KeyItem::Secret as i32,
    );
    assert_eq!(result, Err(KernelError::BadArgument(ArgPosition::Num1)));

    // 2. Names must not be empty.
    let mut info = KeyMgmtInfo {
        name: String::new(),
        object: Some(secret),
    };
    let result = kernel.send_message(
        keyset,
        MessageKind::KeySetKey,
        &mut Payload::KeyMgmt(&mut info),
        KeyItem::Secret as i32,
    );
    assert_eq!(result, Err(KernelError::BadArgument(ArgPosition::Str1)));
}
