//! Key material ownership and derivation.
//!
//! Two responsibilities:
//! 1. Holding key bytes that leave secure memory (extraction, import, wrap)
//!    in a type that is opaque, non-cloneable and zeroised on drop.
//! 2. Turning caller-supplied keys and passwords into working keys of the
//!    size a context needs.
//!
//! ## Derivation structure
//!
//! ```text
//! user key:  HKDF-SHA256(ikm = key, salt = keying salt, info = "hexkernel:{algorithm}")
//! password:  PBKDF2-HMAC-SHA256(password, salt, iterations)
//! ```
//!
//! A user key that already has the working size is used as-is; only shorter
//! or longer keys are stretched.

use std::num::NonZeroU32;

use ring::{hkdf, pbkdf2};
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::error::{KernelError, KernelResult};

/// Largest key any context works with.
pub const MAX_KEY_LEN: usize = 64;

/// Raw key bytes in transit between secure blocks.
///
/// - Not `Clone`.
/// - Zeroised on drop.
#[derive(Zeroize, ZeroizeOnDrop)]
pub(crate) struct KeyMaterial {
    bytes: Vec<u8>,
}

impl KeyMaterial {
    pub(crate) fn from_slice(bytes: &[u8]) -> Self {
        Self {
            bytes: bytes.to_vec(),
        }
    }

    /// `len` bytes from the system CSPRNG.
    pub(crate) fn random(len: usize) -> KernelResult<Self> {
        let mut out = Self {
            bytes: vec![0u8; len],
        };
        crate::crypto::fill_random(&mut out.bytes)?;
        Ok(out)
    }

    pub(crate) fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub(crate) fn len(&self) -> usize {
        self.bytes.len()
    }
}

/// Output length marker for HKDF.
struct OutLen(usize);

impl hkdf::KeyType for OutLen {
    fn len(&self) -> usize {
        self.0
    }
}

/// Stretch (or shrink) a user key to `out_len` bytes.
pub(crate) fn stretch_key(
    user_key: &[u8],
    salt: &[u8],
    algorithm: i32,
    out_len: usize,
) -> KernelResult<KeyMaterial> {
    if out_len == 0 || out_len > MAX_KEY_LEN {
        return Err(KernelError::BadArgument(crate::error::ArgPosition::Num1));
    }
    if user_key.len() == out_len {
        return Ok(KeyMaterial::from_slice(user_key));
    }

    let info = format!("hexkernel:{algorithm}");
    let prk = hkdf::Salt::new(hkdf::HKDF_SHA256, salt).extract(user_key);
    let info_slices = [info.as_bytes()];
    let okm = prk
        .expand(&info_slices, OutLen(out_len))
        .map_err(|_| KernelError::Failed)?;

    let mut out = KeyMaterial {
        bytes: vec![0u8; out_len],
    };
    okm.fill(&mut out.bytes).map_err(|_| KernelError::Failed)?;
    Ok(out)
}

/// Derive `out_len` bytes from a password.
pub(crate) fn derive_from_password(
    password: &[u8],
    salt: &[u8],
    iterations: u32,
    out_len: usize,
) -> KernelResult<KeyMaterial> {
    let iterations = NonZeroU32::new(iterations).ok_or(KernelError::BadArgument(
        crate::error::ArgPosition::Num1,
    ))?;
    let mut out = KeyMaterial {
        bytes: vec![0u8; out_len],
    };
    pbkdf2::derive(
        pbkdf2::PBKDF2_HMAC_SHA256,
        iterations,
        salt,
        password,
        &mut out.bytes,
    );
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stretch_produces_requested_length() {
        let key = stretch_key(&[1u8; 8], b"", 1, 32).unwrap();
        assert_eq!(key.len(), 32);
        assert_ne!(&key.as_bytes()[..8], &[1u8; 8]);
    }

    #[test]
    fn test_stretch_is_deterministic_and_salted() {
        let a = stretch_key(b"short-key", b"salt-one", 1, 16).unwrap();
        let b = stretch_key(b"short-key", b"salt-one", 1, 16).unwrap();
        let c = stretch_key(b"short-key", b"salt-two", 1, 16).unwrap();
        assert_eq!(a.as_bytes(), b.as_bytes());
        assert_ne!(a.as_bytes(), c.as_bytes());
    }

    #[test]
    fn test_exact_length_key_is_kept() {
        let key = stretch_key(&[7u8; 16], b"", 1, 16).unwrap();
        assert_eq!(key.as_bytes(), &[7u8; 16]);
    }

    #[test]
    fn test_password_derivation() {
        let a = derive_from_password(b"password", b"saltsalt", 10, 32).unwrap();
        let b = derive_from_password(b"password", b"saltsalt", 11, 32).unwrap();
        assert_ne!(a.as_bytes(), b.as_bytes());
        assert!(derive_from_password(b"password", b"saltsalt", 0, 32).is_err());
    }
}
