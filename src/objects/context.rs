//! Encryption contexts.
//!
//! Subtypes:
//! - conventional: AES-GCM over caller buffers in place, detached tag read
//!   and written through `CtxAuthTag`, nonces from the IV plus a counter
//! - hash: SHA-2, fed with `CtxHash`, finished by an empty feed
//! - MAC: HMAC-SHA2, same feeding as hash once a key is loaded
//! - public key: Ed25519 signatures, key pair generated in place
//! - generic: an opaque secret for derivation and key transport
//!
//! Key bytes (or the Ed25519 seed) live in the first [`KEY_REGION`] bytes of
//! the instance block. Everything else is kept in the handler.

use std::any::Any;
use std::sync::Mutex;

use ring::{digest, hmac};
use zeroize::Zeroize;

use super::{lock, Blueprint, Invocation, ObjectHandler};
use crate::alloc::SecureBlock;
use crate::crypto::{self, ED25519_SEED_LEN, NONCE_LEN, TAG_LEN};
use crate::error::{ArgPosition, KernelError, KernelResult};
use crate::keys::{self, KeyMaterial};
use crate::message::{algorithm, Attribute, CompareType, MessageKind, Payload};
use crate::types::{Action, ActionPermissions, Handle, PermLevel, SubType};

/// Bytes of the instance block reserved for key material.
const KEY_REGION: usize = keys::MAX_KEY_LEN;

/// Salt generated for password keying when none was set.
const DEFAULT_SALT_LEN: usize = 16;

enum Digest {
    Idle,
    Running(digest::Context),
    /// MAC input collected until the final feed.
    Collecting(Vec<u8>),
    Done(Vec<u8>),
}

struct ContextState {
    algorithm: i32,
    /// Working key length.
    key_size: usize,
    /// Bytes of key currently in the instance block.
    key_len: usize,
    iv: Option<[u8; NONCE_LEN]>,
    encrypt_counter: u32,
    decrypt_counter: u32,
    /// Tag of the last encryption.
    last_tag: Option<[u8; TAG_LEN]>,
    /// Tag the next decryption is checked against.
    expected_tag: Option<[u8; TAG_LEN]>,
    salt: Option<Vec<u8>>,
    iterations: Option<u32>,
    label: Option<Vec<u8>>,
    digest: Digest,
    public_key: Option<Vec<u8>>,
}

impl ContextState {
    fn reset_counters(&mut self) {
        self.encrypt_counter = 0;
        self.decrypt_counter = 0;
        self.last_tag = None;
        self.expected_tag = None;
    }
}

pub(crate) struct ContextHandler {
    subtype: SubType,
    state: Mutex<ContextState>,
}

const CONV_ACTIONS: &[Action] = &[Action::Encrypt, Action::Decrypt, Action::GenKey];
const HASH_ACTIONS: &[Action] = &[Action::Hash];
const MAC_ACTIONS: &[Action] = &[Action::Hash, Action::GenKey];
const PKC_ACTIONS: &[Action] = &[Action::Sign, Action::SigCheck, Action::GenKey];
const GENERIC_ACTIONS: &[Action] = &[Action::GenKey];

fn perms(actions: &[Action]) -> ActionPermissions {
    actions
        .iter()
        .fold(ActionPermissions::NONE_AVAILABLE, |p, a| p.with(*a, PermLevel::All))
}

pub(crate) fn blueprint(subtype: SubType, arg: i32) -> KernelResult<Blueprint> {
    let bad_algorithm = KernelError::BadArgument(ArgPosition::Num2);
    let (algorithm, key_size, actions): (i32, usize, &[Action]) = match subtype {
        SubType::CTX_CONV => match arg {
            0 | algorithm::AES_256_GCM => (algorithm::AES_256_GCM, 32, CONV_ACTIONS),
            algorithm::AES_128_GCM => (algorithm::AES_128_GCM, 16, CONV_ACTIONS),
            _ => return Err(bad_algorithm),
        },
        SubType::CTX_HASH => match arg {
            0 => (algorithm::SHA256, 0, HASH_ACTIONS),
            a if crypto::digest_algorithm(a).is_some() => (a, 0, HASH_ACTIONS),
            _ => return Err(bad_algorithm),
        },
        SubType::CTX_MAC => match arg {
            0 | algorithm::HMAC_SHA256 => (algorithm::HMAC_SHA256, 32, MAC_ACTIONS),
            algorithm::HMAC_SHA512 => (algorithm::HMAC_SHA512, 64, MAC_ACTIONS),
            _ => return Err(bad_algorithm),
        },
        SubType::CTX_PKC => match arg {
            0 | algorithm::ED25519 => (algorithm::ED25519, ED25519_SEED_LEN, PKC_ACTIONS),
            _ => return Err(bad_algorithm),
        },
        SubType::CTX_GENERIC => match arg {
            0 | algorithm::GENERIC_SECRET => (algorithm::GENERIC_SECRET, 32, GENERIC_ACTIONS),
            _ => return Err(bad_algorithm),
        },
        _ => return Err(KernelError::BadArgument(ArgPosition::Num1)),
    };

    let handler = ContextHandler {
        subtype,
        state: Mutex::new(ContextState {
            algorithm,
            key_size,
            key_len: 0,
            iv: None,
            encrypt_counter: 0,
            decrypt_counter: 0,
            last_tag: None,
            expected_tag: None,
            salt: None,
            iterations: None,
            label: None,
            digest: Digest::Idle,
            public_key: None,
        }),
    };
    Ok(Blueprint::new(handler, KEY_REGION).with_perms(perms(actions)))
}

fn random_iv() -> KernelResult<[u8; NONCE_LEN]> {
    let mut iv = [0u8; NONCE_LEN];
    crypto::fill_random(&mut iv)?;
    Ok(iv)
}

fn next_counter(counter: u32) -> KernelResult<u32> {
    counter.checked_add(1).ok_or(KernelError::Overflow)
}

impl ContextHandler {
    /// Place `key` in the instance block as the working key.
    fn store_key(&self, state: &mut ContextState, block: &mut SecureBlock, key: &[u8]) -> KernelResult<()> {
        if key.len() > KEY_REGION {
            return Err(KernelError::BadArgument(ArgPosition::Str1));
        }
        let region = &mut block.payload_mut()[..KEY_REGION];
        region.zeroize();
        region[..key.len()].copy_from_slice(key);
        state.key_len = key.len();
        if self.subtype == SubType::CTX_CONV && state.iv.is_none() {
            state.iv = Some(random_iv()?);
        }
        state.reset_counters();
        Ok(())
    }

    /// Stretch a user key to the working size, for conventional contexts.
    fn load_user_key(&self, inv: &Invocation<'_, '_>, key: &[u8]) -> KernelResult<()> {
        let mut state = lock(&self.state);
        let mut block = inv.instance();
        if self.subtype == SubType::CTX_CONV {
            let salt = state.salt.clone().unwrap_or_default();
            let working = keys::stretch_key(key, &salt, state.algorithm, state.key_size)?;
            self.store_key(&mut state, &mut block, working.as_bytes())
        } else {
            self.store_key(&mut state, &mut block, key)
        }
    }

    fn load_password(&self, inv: &Invocation<'_, '_>, password: &[u8]) -> KernelResult<()> {
        let (salt, iterations) = {
            let mut state = lock(&self.state);
            let salt = match &state.salt {
                Some(salt) => salt.clone(),
                None => {
                    let mut salt = vec![0u8; DEFAULT_SALT_LEN];
                    crypto::fill_random(&mut salt)?;
                    state.salt = Some(salt.clone());
                    salt
                }
            };
            (salt, state.iterations)
        };
        let iterations = match iterations {
            Some(n) => n,
            None => {
                // Fall back to the default user's configured iteration count.
                let mut n = 0;
                inv.kernel.send_internal(
                    Handle::DEFAULT_USER,
                    MessageKind::GetAttribute,
                    &mut Payload::Int(&mut n),
                    Attribute::OptionKeyingIterations as i32,
                )?;
                u32::try_from(n).map_err(|_| KernelError::Failed)?
            }
        };

        let mut state = lock(&self.state);
        let derived = keys::derive_from_password(password, &salt, iterations, state.key_size)?;
        state.iterations = Some(iterations);
        let mut block = inv.instance();
        self.store_key(&mut state, &mut block, derived.as_bytes())
    }

    fn generate_key(&self, inv: &Invocation<'_, '_>) -> KernelResult<()> {
        let mut state = lock(&self.state);
        let key = KeyMaterial::random(state.key_size)?;
        let mut block = inv.instance();
        self.store_key(&mut state, &mut block, key.as_bytes())?;
        if self.subtype == SubType::CTX_PKC {
            state.public_key = Some(crypto::ed25519_public_key(key.as_bytes())?);
        }
        log::trace!("generated {}-byte key for {}", state.key_size, inv.object.handle);
        Ok(())
    }

    fn get_attribute(&self, inv: &mut Invocation<'_, '_>) -> KernelResult<()> {
        let state = lock(&self.state);
        let value = match inv.attribute()? {
            Attribute::CtxAlgorithm => state.algorithm,
            Attribute::CtxKeySize => i32::try_from(state.key_size).map_err(|_| KernelError::Failed)?,
            Attribute::CtxKeyingIterations => {
                let n = state.iterations.ok_or(KernelError::NotInitialised)?;
                i32::try_from(n).map_err(|_| KernelError::Failed)?
            }
            _ => return Err(KernelError::NotAvailable),
        };
        drop(state);
        inv.set_int(value)
    }

    fn get_attribute_data(&self, inv: &mut Invocation<'_, '_>) -> KernelResult<()> {
        let state = lock(&self.state);
        let bytes: Vec<u8> = match inv.attribute()? {
            Attribute::CtxIv => state.iv.ok_or(KernelError::NotInitialised)?.to_vec(),
            Attribute::CtxKeyingSalt => state.salt.clone().ok_or(KernelError::NotInitialised)?,
            Attribute::CtxLabel => state.label.clone().ok_or(KernelError::NotFound)?,
            Attribute::CtxHashValue => match &state.digest {
                Digest::Done(value) => value.clone(),
                _ => return Err(KernelError::Incomplete),
            },
            Attribute::CtxAuthTag => state.last_tag.ok_or(KernelError::NotInitialised)?.to_vec(),
            Attribute::CtxPublicKey => state.public_key.clone().ok_or(KernelError::NotInitialised)?,
            _ => return Err(KernelError::NotAvailable),
        };
        drop(state);
        inv.write_output(&bytes)
    }

    fn set_attribute(&self, inv: &mut Invocation<'_, '_>) -> KernelResult<()> {
        let value = inv.int()?;
        let mut state = lock(&self.state);
        match inv.attribute()? {
            Attribute::CtxKeySize => {
                let size = usize::try_from(value).map_err(|_| KernelError::BadArgument(ArgPosition::Num1))?;
                if self.subtype == SubType::CTX_CONV {
                    state.algorithm = match size {
                        16 => algorithm::AES_128_GCM,
                        32 => algorithm::AES_256_GCM,
                        _ => return Err(KernelError::BadArgument(ArgPosition::Num1)),
                    };
                }
                state.key_size = size;
            }
            Attribute::CtxKeyingIterations => {
                state.iterations =
                    Some(u32::try_from(value).map_err(|_| KernelError::BadArgument(ArgPosition::Num1))?);
            }
            _ => return Err(KernelError::NotAvailable),
        }
        Ok(())
    }

    fn set_attribute_data(&self, inv: &mut Invocation<'_, '_>) -> KernelResult<()> {
        let data = inv.data()?;
        match inv.attribute()? {
            Attribute::CtxKey => self.load_user_key(inv, data),
            Attribute::CtxKeyingValue => self.load_password(inv, data),
            Attribute::CtxKeyingSalt => {
                lock(&self.state).salt = Some(data.to_vec());
                Ok(())
            }
            Attribute::CtxIv => {
                let mut iv = [0u8; NONCE_LEN];
                iv.copy_from_slice(data);
                let mut state = lock(&self.state);
                state.iv = Some(iv);
                state.reset_counters();
                Ok(())
            }
            Attribute::CtxLabel => {
                lock(&self.state).label = Some(data.to_vec());
                Ok(())
            }
            Attribute::CtxAuthTag => {
                let mut tag = [0u8; TAG_LEN];
                tag.copy_from_slice(data);
                lock(&self.state).expected_tag = Some(tag);
                Ok(())
            }
            _ => Err(KernelError::NotAvailable),
        }
    }

    fn crypt(&self, inv: &mut Invocation<'_, '_>) -> KernelResult<()> {
        let encrypt = inv.kind == MessageKind::CtxEncrypt;
        let mut state = lock(&self.state);
        let block = inv.instance();
        let iv = state.iv.ok_or(KernelError::NotInitialised)?;
        let key = &block.payload()[..state.key_len];
        let Payload::Buffer(data) = &mut *inv.payload else {
            return Err(KernelError::BadArgument(ArgPosition::Str1));
        };

        if encrypt {
            let counter = next_counter(state.encrypt_counter)?;
            let tag = crypto::seal_in_place(key, crypto::counter_nonce(&iv, counter), data)?;
            state.encrypt_counter = counter;
            state.last_tag = Some(tag);
        } else {
            let tag = state.expected_tag.ok_or(KernelError::NotInitialised)?;
            let counter = next_counter(state.decrypt_counter)?;
            crypto::open_in_place(key, crypto::counter_nonce(&iv, counter), &tag, data)?;
            state.decrypt_counter = counter;
            state.expected_tag = None;
        }
        Ok(())
    }

    fn feed(&self, inv: &mut Invocation<'_, '_>) -> KernelResult<()> {
        let data = inv.data()?;
        let mut state = lock(&self.state);
        let (algo, key_len) = (state.algorithm, state.key_len);
        let running = match std::mem::replace(&mut state.digest, Digest::Idle) {
            done @ Digest::Done(_) => {
                state.digest = done;
                return Err(KernelError::Complete);
            }
            Digest::Idle if self.subtype == SubType::CTX_HASH => {
                let alg = crypto::digest_algorithm(algo).ok_or(KernelError::Failed)?;
                Digest::Running(digest::Context::new(alg))
            }
            Digest::Idle => Digest::Collecting(Vec::new()),
            other => other,
        };

        if !data.is_empty() {
            state.digest = match running {
                Digest::Running(mut ctx) => {
                    ctx.update(data);
                    Digest::Running(ctx)
                }
                Digest::Collecting(mut collected) => {
                    collected.extend_from_slice(data);
                    Digest::Collecting(collected)
                }
                other => other,
            };
            return Ok(());
        }

        let value = match running {
            Digest::Running(ctx) => ctx.finish().as_ref().to_vec(),
            Digest::Collecting(mut collected) => {
                let tag = self.mac(inv, algo, key_len, &collected);
                collected.zeroize();
                tag?
            }
            _ => return Err(KernelError::Failed),
        };
        state.digest = Digest::Done(value);
        Ok(())
    }

    fn mac(&self, inv: &Invocation<'_, '_>, algo: i32, key_len: usize, data: &[u8]) -> KernelResult<Vec<u8>> {
        let alg = crypto::hmac_algorithm(algo).ok_or(KernelError::Failed)?;
        let block = inv.instance();
        let key = hmac::Key::new(alg, &block.payload()[..key_len]);
        Ok(hmac::sign(&key, data).as_ref().to_vec())
    }

    fn sign(&self, inv: &mut Invocation<'_, '_>) -> KernelResult<()> {
        let state = lock(&self.state);
        let block = inv.instance();
        let public_key = state.public_key.clone().ok_or(KernelError::NotInitialised)?;
        let Payload::Signature(sig) = &mut *inv.payload else {
            return Err(KernelError::BadArgument(ArgPosition::Str1));
        };
        if inv.kind == MessageKind::CtxSign {
            sig.signature = crypto::ed25519_sign(&block.payload()[..ED25519_SEED_LEN], &sig.data)?;
            Ok(())
        } else {
            crypto::ed25519_verify(&public_key, &sig.data, &sig.signature)
        }
    }

    fn compare(&self, inv: &Invocation<'_, '_>) -> KernelResult<()> {
        let data = inv.data()?;
        let state = lock(&self.state);
        let expected = match CompareType::from_value(inv.value) {
            Some(CompareType::Hash) => match &state.digest {
                Digest::Done(value) => value.clone(),
                _ => return Err(KernelError::Incomplete),
            },
            Some(CompareType::KeyId) => {
                crypto::sha256(state.public_key.as_deref().ok_or(KernelError::NotInitialised)?)
            }
            _ => return Err(KernelError::NotAvailable),
        };
        if expected == data {
            Ok(())
        } else {
            Err(KernelError::Failed)
        }
    }
}

impl ObjectHandler for ContextHandler {
    fn handle(&self, inv: &mut Invocation<'_, '_>) -> KernelResult<()> {
        match inv.kind {
            MessageKind::Destroy => {
                let mut state = lock(&self.state);
                state.digest = Digest::Idle;
                state.key_len = 0;
                Ok(())
            }
            MessageKind::GetAttribute => self.get_attribute(inv),
            MessageKind::GetAttributeS => self.get_attribute_data(inv),
            MessageKind::SetAttribute => self.set_attribute(inv),
            MessageKind::SetAttributeS => self.set_attribute_data(inv),
            MessageKind::DeleteAttribute => match inv.attribute()? {
                Attribute::CtxLabel => lock(&self.state)
                    .label
                    .take()
                    .map(|_| ())
                    .ok_or(KernelError::NotFound),
                _ => Err(KernelError::NotAvailable),
            },
            MessageKind::Compare => self.compare(inv),
            MessageKind::CtxEncrypt | MessageKind::CtxDecrypt => self.crypt(inv),
            MessageKind::CtxSign | MessageKind::CtxSigCheck => self.sign(inv),
            MessageKind::CtxHash => self.feed(inv),
            MessageKind::CtxGenKey => self.generate_key(inv),
            MessageKind::CtxGenIv => {
                let mut state = lock(&self.state);
                state.iv = Some(random_iv()?);
                state.reset_counters();
                Ok(())
            }
            _ => Err(KernelError::NotAvailable),
        }
    }

    fn export_key(&self, instance: &SecureBlock) -> KernelResult<KeyMaterial> {
        let key_len = lock(&self.state).key_len;
        if key_len == 0 {
            return Err(KernelError::NotInitialised);
        }
        Ok(KeyMaterial::from_slice(&instance.payload()[..key_len]))
    }

    fn import_key(&self, instance: &mut SecureBlock, key: &[u8]) -> KernelResult<()> {
        let mut state = lock(&self.state);
        match self.subtype {
            SubType::CTX_CONV => {
                state.algorithm = match key.len() {
                    16 => algorithm::AES_128_GCM,
                    32 => algorithm::AES_256_GCM,
                    _ => return Err(KernelError::BadData),
                };
                state.key_size = key.len();
            }
            _ if (16..=KEY_REGION).contains(&key.len()) => state.key_size = key.len(),
            _ => return Err(KernelError::BadData),
        }
        self.store_key(&mut state, instance, key)
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_blueprint_algorithms() {
        // 1. Defaults per subtype.
        let conv = blueprint(SubType::CTX_CONV, 0).unwrap();
        assert_eq!(conv.action_perms.level(Action::Encrypt), PermLevel::All);
        assert_eq!(conv.action_perms.level(Action::Sign), PermLevel::NotAvailable);

        // 2. An algorithm from another family is refused.
        assert_eq!(
            blueprint(SubType::CTX_CONV, algorithm::SHA256).err(),
            Some(KernelError::BadArgument(ArgPosition::Num2))
        );

        // 3. Hash contexts can only hash.
        let hash = blueprint(SubType::CTX_HASH, algorithm::SHA512).unwrap();
        assert_eq!(hash.action_perms.level(Action::Hash), PermLevel::All);
        assert_eq!(hash.action_perms.level(Action::GenKey), PermLevel::NotAvailable);
    }

    #[test]
    fn test_counter_overflow_is_an_error() {
        assert_eq!(next_counter(u32::MAX), Err(KernelError::Overflow));
        assert_eq!(next_counter(1), Ok(2));
    }
}
