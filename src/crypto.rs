//! Low-level cryptographic operations for the built-in object handlers.
//!
//! Handlers reach ciphers and signatures through the functions here. Hash
//! and MAC contexts stream through `ring::digest` and `ring::hmac` directly,
//! picking the algorithm with the lookups below.
//!
//! Primitive choices:
//! - **Cipher**: AES-GCM (128 or 256-bit key), tag kept detached so buffers
//!   are transformed in place without growing
//! - **Nonce**: 96-bit, IV plus a per-context message counter
//! - **Hash / MAC**: SHA-2 family via `ring::digest` and `ring::hmac`
//! - **Signature**: Ed25519 from a 32-byte seed

use ring::aead::{self, Aad, LessSafeKey, Nonce, UnboundKey};
use ring::digest;
use ring::hmac;
use ring::rand::{SecureRandom, SystemRandom};
use ring::signature::{self, Ed25519KeyPair, KeyPair};
use zeroize::Zeroize;

use crate::error::{KernelError, KernelResult};
use crate::message::algorithm;

/// Size of the nonce / IV in bytes (96 bits).
pub const NONCE_LEN: usize = 12;

/// Size of a detached GCM tag.
pub const TAG_LEN: usize = 16;

/// Size of an Ed25519 seed and public key.
pub const ED25519_SEED_LEN: usize = 32;

/// Fill `out` from the system CSPRNG.
pub(crate) fn fill_random(out: &mut [u8]) -> KernelResult<()> {
    SystemRandom::new()
        .fill(out)
        .map_err(|_| KernelError::Failed)
}

/// The nonce for message number `counter` under `iv`. The counter is added
/// big-endian into the last four bytes.
pub(crate) fn counter_nonce(iv: &[u8; NONCE_LEN], counter: u32) -> [u8; NONCE_LEN] {
    let mut nonce = *iv;
    let mut tail = [0u8; 4];
    tail.copy_from_slice(&nonce[NONCE_LEN - 4..]);
    let mixed = u32::from_be_bytes(tail).wrapping_add(counter);
    nonce[NONCE_LEN - 4..].copy_from_slice(&mixed.to_be_bytes());
    nonce
}

fn aead_algorithm(key_len: usize) -> KernelResult<&'static aead::Algorithm> {
    match key_len {
        16 => Ok(&aead::AES_128_GCM),
        32 => Ok(&aead::AES_256_GCM),
        _ => Err(KernelError::BadArgument(crate::error::ArgPosition::Num1)),
    }
}

fn aead_key(key: &[u8]) -> KernelResult<LessSafeKey> {
    let unbound = UnboundKey::new(aead_algorithm(key.len())?, key).map_err(|_| KernelError::Failed)?;
    Ok(LessSafeKey::new(unbound))
}

/// Encrypt `data` in place, returning the detached tag.
pub(crate) fn seal_in_place(
    key: &[u8],
    nonce: [u8; NONCE_LEN],
    data: &mut [u8],
) -> KernelResult<[u8; TAG_LEN]> {
    let key = aead_key(key)?;
    let tag = key
        .seal_in_place_separate_tag(Nonce::assume_unique_for_key(nonce), Aad::empty(), data)
        .map_err(|_| KernelError::Failed)?;
    let mut out = [0u8; TAG_LEN];
    out.copy_from_slice(tag.as_ref());
    Ok(out)
}

/// Decrypt `data` in place against a detached tag. On failure `data` is
/// left unchanged.
pub(crate) fn open_in_place(
    key: &[u8],
    nonce: [u8; NONCE_LEN],
    tag: &[u8; TAG_LEN],
    data: &mut [u8],
) -> KernelResult<()> {
    let key = aead_key(key)?;
    let mut joined = Vec::with_capacity(data.len() + TAG_LEN);
    joined.extend_from_slice(data);
    joined.extend_from_slice(tag);

    let result = key
        .open_in_place(Nonce::assume_unique_for_key(nonce), Aad::empty(), &mut joined)
        .map(|plain| data.copy_from_slice(plain))
        .map_err(|_| KernelError::BadData);
    joined.zeroize();
    result
}

// ---------------------------------------------------------------------------
// Hash and MAC
// ---------------------------------------------------------------------------

pub(crate) fn digest_algorithm(algo: i32) -> Option<&'static digest::Algorithm> {
    match algo {
        algorithm::SHA256 => Some(&digest::SHA256),
        algorithm::SHA384 => Some(&digest::SHA384),
        algorithm::SHA512 => Some(&digest::SHA512),
        _ => None,
    }
}

pub(crate) fn hmac_algorithm(algo: i32) -> Option<hmac::Algorithm> {
    match algo {
        algorithm::HMAC_SHA256 => Some(hmac::HMAC_SHA256),
        algorithm::HMAC_SHA512 => Some(hmac::HMAC_SHA512),
        _ => None,
    }
}

pub(crate) fn sha256(data: &[u8]) -> Vec<u8> {
    digest::digest(&digest::SHA256, data).as_ref().to_vec()
}

// ---------------------------------------------------------------------------
// Signatures
// ---------------------------------------------------------------------------

fn ed25519_pair(seed: &[u8]) -> KernelResult<Ed25519KeyPair> {
    Ed25519KeyPair::from_seed_unchecked(seed).map_err(|_| KernelError::BadData)
}

pub(crate) fn ed25519_public_key(seed: &[u8]) -> KernelResult<Vec<u8>> {
    Ok(ed25519_pair(seed)?.public_key().as_ref().to_vec())
}

pub(crate) fn ed25519_sign(seed: &[u8], data: &[u8]) -> KernelResult<Vec<u8>> {
    Ok(ed25519_pair(seed)?.sign(data).as_ref().to_vec())
}

pub(crate) fn ed25519_verify(public_key: &[u8], data: &[u8], sig: &[u8]) -> KernelResult<()> {
    signature::UnparsedPublicKey::new(&signature::ED25519, public_key)
        .verify(data, sig)
        .map_err(|_| KernelError::Signature)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_seal_open_in_place() {
        let key = [3u8; 32];
        let nonce = counter_nonce(&[0u8; NONCE_LEN], 1);
        let mut data = *b"8 bytes!";
        let tag = seal_in_place(&key, nonce, &mut data).unwrap();
        assert_ne!(&data, b"8 bytes!");

        open_in_place(&key, nonce, &tag, &mut data).unwrap();
        assert_eq!(&data, b"8 bytes!");
    }

    #[test]
    fn test_open_with_wrong_tag_leaves_data() {
        let key = [3u8; 16];
        let nonce = [0u8; NONCE_LEN];
        let mut data = [1u8; 10];
        let mut tag = seal_in_place(&key, nonce, &mut data).unwrap();
        let sealed = data;
        tag[0] ^= 1;
        assert_eq!(
            open_in_place(&key, nonce, &tag, &mut data),
            Err(KernelError::BadData)
        );
        assert_eq!(data, sealed);
    }

    #[test]
    fn test_counter_nonce_changes_tail() {
        let iv = [0xFFu8; NONCE_LEN];
        let n = counter_nonce(&iv, 1);
        assert_eq!(&n[..8], &iv[..8]);
        assert_eq!(&n[8..], &[0, 0, 0, 0]);
    }

    #[test]
    fn test_ed25519_sign_verify() {
        let seed = [9u8; ED25519_SEED_LEN];
        let public = ed25519_public_key(&seed).unwrap();
        let sig = ed25519_sign(&seed, b"message").unwrap();
        assert!(ed25519_verify(&public, b"message", &sig).is_ok());
        assert_eq!(
            ed25519_verify(&public, b"other", &sig),
            Err(KernelError::Signature)
        );
    }
}
