//! Behaviour of the remaining object families: hash and MAC contexts,
//! sessions, users and the system device.

use hexkernel::{
    algorithm, ArgPosition, Attribute, CheckType, CompareType, Handle, Kernel, KernelConfig,
    KernelError, MessageKind, ObjectType, Payload, SubType,
};

fn kernel() -> Kernel {
    Kernel::init(KernelConfig {
        lock_pages: false,
        ..KernelConfig::default()
    })
    .unwrap()
}

#[test]
fn test_hash_context() {
    let kernel = kernel();
    let hash = kernel.create_object(ObjectType::Context, SubType::CTX_HASH, 0).unwrap();
    assert_eq!(
        kernel.get_attribute(hash, Attribute::CtxAlgorithm).unwrap(),
        algorithm::SHA256
    );

    // 1. Nothing to read until the hash is finished.
    kernel.hash(hash, b"ab").unwrap();
    assert_eq!(
        kernel.get_attribute_data(hash, Attribute::CtxHashValue),
        Err(KernelError::Incomplete)
    );

    // 2. An empty block finishes it.
    kernel.hash(hash, b"c").unwrap();
    kernel.hash(hash, b"").unwrap();
    let expected = ring::digest::digest(&ring::digest::SHA256, b"abc");
    assert_eq!(
        kernel.get_attribute_data(hash, Attribute::CtxHashValue).unwrap(),
        expected.as_ref()
    );

    // 3. Compare against a known value, then refuse more data.
    kernel
        .send_message(
            hash,
            MessageKind::Compare,
            &mut Payload::Data(expected.as_ref()),
            CompareType::Hash as i32,
        )
        .unwrap();
    assert_eq!(kernel.hash(hash, b"d"), Err(KernelError::Complete));
    kernel.check(hash, CheckType::Hash).unwrap();
}

#[test]
fn test_mac_context_needs_a_key() {
    let kernel = kernel();
    let mac = kernel.create_object(ObjectType::Context, SubType::CTX_MAC, 0).unwrap();

    // 1. No key, no MAC.
    assert_eq!(kernel.hash(mac, b"message"), Err(KernelError::NotInitialised));

    // 2. Keyed, the result is plain HMAC-SHA256.
    kernel.set_attribute_data(mac, Attribute::CtxKey, &[3u8; 32]).unwrap();
    kernel.hash(mac, b"message").unwrap();
    kernel.hash(mac, b"").unwrap();
    let key = ring::hmac::Key::new(ring::hmac::HMAC_SHA256, &[3u8; 32]);
    let expected = ring::hmac::sign(&key, b"message");
    assert_eq!(
        kernel.get_attribute_data(mac, Attribute::CtxHashValue).unwrap(),
        expected.as_ref()
    );
}

#[test]
fn test_password_keying_uses_default_user_iterations() {
    let kernel = kernel();

    // 1. The default user carries the keying defaults.
    assert_eq!(
        kernel
            .get_attribute(Handle::DEFAULT_USER, Attribute::OptionKeyingIterations)
            .unwrap(),
        1000
    );
    kernel
        .set_attribute(Handle::DEFAULT_USER, Attribute::OptionKeyingIterations, 2000)
        .unwrap();

    // 2. A context keyed from a password picks them up.
    let ctx = kernel.create_object(ObjectType::Context, SubType::CTX_CONV, 0).unwrap();
    kernel
        .set_attribute_data(ctx, Attribute::CtxKeyingValue, b"correct horse")
        .unwrap();
    assert_eq!(
        kernel.get_attribute(ctx, Attribute::CtxKeyingIterations).unwrap(),
        2000
    );
    assert_eq!(
        kernel.get_attribute_data(ctx, Attribute::CtxKeyingSalt).unwrap().len(),
        16
    );
    let mut block = [0u8; 16];
    kernel.encrypt(ctx, &mut block).unwrap();
}

#[test]
fn test_user_options_commit() {
    let kernel = kernel();
    let user = kernel
        .create_object(ObjectType::User, SubType::USER_NORMAL, 0)
        .unwrap();

    // 1. Fresh options are committed.
    assert_eq!(kernel.get_attribute(user, Attribute::OptionConfigChanged).unwrap(), 0);

    // 2. An edit shows as a change until written out.
    kernel
        .set_attribute(user, Attribute::OptionEncryptionAlgo, algorithm::AES_128_GCM)
        .unwrap();
    assert_eq!(kernel.get_attribute(user, Attribute::OptionConfigChanged).unwrap(), 1);
    kernel.set_attribute(user, Attribute::OptionConfigChanged, 0).unwrap();
    assert_eq!(kernel.get_attribute(user, Attribute::OptionConfigChanged).unwrap(), 0);

    // 3. Only known algorithms, and "changed" cannot be forced on.
    assert_eq!(
        kernel.set_attribute(user, Attribute::OptionEncryptionAlgo, algorithm::SHA256),
        Err(KernelError::BadArgument(ArgPosition::Num1))
    );
    assert_eq!(
        kernel.set_attribute(user, Attribute::OptionConfigChanged, 1),
        Err(KernelError::BadArgument(ArgPosition::Num1))
    );
}

#[test]
fn test_default_user_commits_in_place() {
    let kernel = kernel();
    kernel
        .set_attribute(Handle::DEFAULT_USER, Attribute::OptionKeyingIterations, 4000)
        .unwrap();
    assert_eq!(
        kernel
            .get_attribute(Handle::DEFAULT_USER, Attribute::OptionConfigChanged)
            .unwrap(),
        1
    );
    kernel
        .set_attribute(Handle::DEFAULT_USER, Attribute::OptionConfigChanged, 0)
        .unwrap();
    assert_eq!(
        kernel
            .get_attribute(Handle::DEFAULT_USER, Attribute::OptionConfigChanged)
            .unwrap(),
        0
    );
}

#[test]
fn test_session_activation() {
    let kernel = kernel();
    let session = kernel
        .create_object(ObjectType::Session, SubType::SESSION_SSH, 0)
        .unwrap();

    // 1. Incomplete configuration.
    kernel
        .set_attribute_data(session, Attribute::SessionServerName, b"git.example.org")
        .unwrap();
    kernel.set_attribute(session, Attribute::SessionServerPort, 22).unwrap();
    assert_eq!(
        kernel.set_attribute(session, Attribute::SessionActive, 1),
        Err(KernelError::NotInitialised)
    );
    assert_eq!(kernel.get_attribute(session, Attribute::SessionActive).unwrap(), 0);

    // 2. Complete it and activate.
    kernel
        .set_attribute_data(session, Attribute::SessionUserName, b"git")
        .unwrap();
    kernel.set_attribute(session, Attribute::SessionActive, 1).unwrap();
    assert_eq!(kernel.get_attribute(session, Attribute::SessionActive).unwrap(), 1);

    // 3. The configuration is frozen.
    assert_eq!(
        kernel.set_attribute(session, Attribute::SessionServerPort, 2222),
        Err(KernelError::Permission)
    );
    assert_eq!(kernel.get_attribute(session, Attribute::SessionServerPort).unwrap(), 22);
}

#[test]
fn test_session_attribute_ranges() {
    let kernel = kernel();
    let ssl = kernel
        .create_object(ObjectType::Session, SubType::SESSION_SSL, 0)
        .unwrap();

    assert_eq!(
        kernel.set_attribute(ssl, Attribute::SessionServerPort, 0),
        Err(KernelError::BadArgument(ArgPosition::Num1))
    );
    assert_eq!(
        kernel.set_attribute(ssl, Attribute::SessionServerPort, 65536),
        Err(KernelError::BadArgument(ArgPosition::Num1))
    );
    // User names belong to SSH sessions.
    assert_eq!(
        kernel.set_attribute_data(ssl, Attribute::SessionUserName, b"root"),
        Err(KernelError::BadArgument(ArgPosition::Value))
    );
}

#[test]
fn test_server_session_needs_a_key() {
    let kernel = kernel();
    let server = kernel
        .create_object(ObjectType::Session, SubType::SESSION_SSL_SERVER, 0)
        .unwrap();
    kernel
        .set_attribute_data(server, Attribute::SessionServerName, b"0.0.0.0")
        .unwrap();
    kernel.set_attribute(server, Attribute::SessionServerPort, 443).unwrap();
    assert_eq!(
        kernel.set_attribute(server, Attribute::SessionActive, 1),
        Err(KernelError::NotInitialised)
    );

    let key = kernel.create_object(ObjectType::Context, SubType::CTX_PKC, 0).unwrap();
    kernel
        .send_message(key, MessageKind::CtxGenKey, &mut Payload::None, 0)
        .unwrap();
    kernel.set_dependent_object(server, key, true).unwrap();
    kernel.set_attribute(server, Attribute::SessionActive, 1).unwrap();
}

#[test]
fn test_system_device_randomness() {
    let kernel = kernel();

    let a = kernel.get_random(32).unwrap();
    let b = kernel.get_random(32).unwrap();
    assert_eq!(a.len(), 32);
    assert_ne!(a, b);

    assert_eq!(kernel.get_random(0), Err(KernelError::BadArgument(ArgPosition::Str1)));
    assert_eq!(
        kernel.get_random(4097),
        Err(KernelError::BadArgument(ArgPosition::Str1))
    );
    assert_eq!(
        kernel.get_attribute_data(Handle::SYSTEM, Attribute::DevLabel).unwrap(),
        b"system"
    );
}
