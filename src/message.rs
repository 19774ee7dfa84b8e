//! Message vocabulary: kinds, attribute identifiers and payloads.
//!
//! A message is `(handle, kind, payload, value)`. The meaning of `value`
//! depends on the kind: an attribute ID for attribute messages, an object
//! type for creation, a check or compare type, and so on.

use crate::types::{Handle, SubType};

/// Who sent a message. External messages come from the library's caller and
/// face the stricter half of every ACL.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Origin {
    Internal,
    External,
}

impl Origin {
    pub fn is_external(self) -> bool {
        self == Origin::External
    }
}

/// Every message kind the dispatcher understands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageKind {
    Destroy,
    IncRefCount,
    DecRefCount,
    GetDependent,
    SetDependent,
    GetAttribute,
    GetAttributeS,
    SetAttribute,
    SetAttributeS,
    DeleteAttribute,
    Compare,
    Check,
    CtxEncrypt,
    CtxDecrypt,
    CtxSign,
    CtxSigCheck,
    CtxHash,
    CtxGenKey,
    CtxGenIv,
    EnvPushData,
    EnvPopData,
    DevCreateObject,
    DevExport,
    DevImport,
    DevDerive,
    KeyGetKey,
    KeySetKey,
    KeyDeleteKey,
    UserCertMgmt,
}

impl MessageKind {
    /// Declaration order. The message handling table is indexed the same way.
    pub const ALL: [MessageKind; 29] = [
        MessageKind::Destroy,
        MessageKind::IncRefCount,
        MessageKind::DecRefCount,
        MessageKind::GetDependent,
        MessageKind::SetDependent,
        MessageKind::GetAttribute,
        MessageKind::GetAttributeS,
        MessageKind::SetAttribute,
        MessageKind::SetAttributeS,
        MessageKind::DeleteAttribute,
        MessageKind::Compare,
        MessageKind::Check,
        MessageKind::CtxEncrypt,
        MessageKind::CtxDecrypt,
        MessageKind::CtxSign,
        MessageKind::CtxSigCheck,
        MessageKind::CtxHash,
        MessageKind::CtxGenKey,
        MessageKind::CtxGenIv,
        MessageKind::EnvPushData,
        MessageKind::EnvPopData,
        MessageKind::DevCreateObject,
        MessageKind::DevExport,
        MessageKind::DevImport,
        MessageKind::DevDerive,
        MessageKind::KeyGetKey,
        MessageKind::KeySetKey,
        MessageKind::KeyDeleteKey,
        MessageKind::UserCertMgmt,
    ];

    pub(crate) fn index(self) -> usize {
        self as usize
    }

    pub fn is_attribute(self) -> bool {
        matches!(
            self,
            Self::GetAttribute
                | Self::GetAttributeS
                | Self::SetAttribute
                | Self::SetAttributeS
                | Self::DeleteAttribute
        )
    }
}

// ---------------------------------------------------------------------------
// Attributes
// ---------------------------------------------------------------------------

/// Attribute identifiers carried in the `value` of attribute messages.
///
/// IDs below 100 are kernel properties, handled without involving the
/// object. Everything else is owned by the object's handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(i32)]
pub enum Attribute {
    Status = 1,
    ObjectType = 2,
    ObjectSubType = 3,
    Owner = 4,
    ForwardCount = 5,
    Locked = 6,
    UsageCount = 7,
    HighSecurity = 8,
    Internal = 9,
    ActionPerms = 10,
    Initialised = 11,

    CtxAlgorithm = 100,
    CtxKeySize = 101,
    CtxKey = 102,
    CtxIv = 103,
    CtxKeyingSalt = 104,
    CtxKeyingIterations = 105,
    CtxKeyingValue = 106,
    CtxLabel = 107,
    CtxHashValue = 108,
    CtxAuthTag = 109,
    CtxPublicKey = 110,

    CertKeyUsage = 200,
    CertSelfSigned = 201,
    CertSubjectName = 202,
    CertValidTo = 203,
    CertTrusted = 204,
    CertFingerprint = 205,
    CertSigningKey = 206,

    KeysetName = 300,
    KeysetEntries = 301,

    EnvDataSize = 400,
    EnvContentType = 401,
    EnvSessionKey = 402,

    SessionServerName = 500,
    SessionServerPort = 501,
    SessionUserName = 502,
    SessionActive = 503,

    DevLabel = 600,
    DevRandom = 601,

    UserName = 700,
    OptionEncryptionAlgo = 701,
    OptionKeyingIterations = 702,
    OptionConfigChanged = 703,
}

impl Attribute {
    pub const ALL: [Attribute; 44] = [
        Attribute::Status,
        Attribute::ObjectType,
        Attribute::ObjectSubType,
        Attribute::Owner,
        Attribute::ForwardCount,
        Attribute::Locked,
        Attribute::UsageCount,
        Attribute::HighSecurity,
        Attribute::Internal,
        Attribute::ActionPerms,
        Attribute::Initialised,
        Attribute::CtxAlgorithm,
        Attribute::CtxKeySize,
        Attribute::CtxKey,
        Attribute::CtxIv,
        Attribute::CtxKeyingSalt,
        Attribute::CtxKeyingIterations,
        Attribute::CtxKeyingValue,
        Attribute::CtxLabel,
        Attribute::CtxHashValue,
        Attribute::CtxAuthTag,
        Attribute::CtxPublicKey,
        Attribute::CertKeyUsage,
        Attribute::CertSelfSigned,
        Attribute::CertSubjectName,
        Attribute::CertValidTo,
        Attribute::CertTrusted,
        Attribute::CertFingerprint,
        Attribute::CertSigningKey,
        Attribute::KeysetName,
        Attribute::KeysetEntries,
        Attribute::EnvDataSize,
        Attribute::EnvContentType,
        Attribute::EnvSessionKey,
        Attribute::SessionServerName,
        Attribute::SessionServerPort,
        Attribute::SessionUserName,
        Attribute::SessionActive,
        Attribute::DevLabel,
        Attribute::DevRandom,
        Attribute::UserName,
        Attribute::OptionEncryptionAlgo,
        Attribute::OptionKeyingIterations,
        Attribute::OptionConfigChanged,
    ];

    pub fn from_value(value: i32) -> Option<Self> {
        Self::ALL.into_iter().find(|a| *a as i32 == value)
    }

    /// Kernel-managed property rather than object attribute.
    pub fn is_property(self) -> bool {
        (self as i32) < 100
    }
}

/// Sentinel for "no limit" in numeric property reads.
pub const UNUSED: i32 = -101;

/// Algorithm identifiers reported through `CtxAlgorithm` and accepted in
/// [`CreateObjectInfo::arg`] for contexts. Zero selects the subtype default.
pub mod algorithm {
    pub const AES_128_GCM: i32 = 1;
    pub const AES_256_GCM: i32 = 2;
    pub const SHA256: i32 = 10;
    pub const SHA384: i32 = 11;
    pub const SHA512: i32 = 12;
    pub const HMAC_SHA256: i32 = 20;
    pub const HMAC_SHA512: i32 = 21;
    pub const ED25519: i32 = 30;
    pub const GENERIC_SECRET: i32 = 40;
}

/// Certificate key-usage bits.
pub mod key_usage {
    pub const DIGITAL_SIGNATURE: i32 = 0x01;
    pub const NON_REPUDIATION: i32 = 0x02;
    pub const KEY_ENCIPHERMENT: i32 = 0x04;
    pub const DATA_ENCIPHERMENT: i32 = 0x08;
    pub const KEY_AGREEMENT: i32 = 0x10;
    pub const KEY_CERT_SIGN: i32 = 0x20;
    pub const CRL_SIGN: i32 = 0x40;
    pub const ALL: i32 = 0x7F;
}

/// Envelope content types.
pub mod content_type {
    pub const DATA: i32 = 1;
    pub const SIGNED: i32 = 2;
    pub const ENVELOPED: i32 = 3;
}

// ---------------------------------------------------------------------------
// Enumerated message values
// ---------------------------------------------------------------------------

/// Capability checks answered by the `Check` message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum CheckType {
    Crypt = 1,
    Hash = 2,
    Mac = 3,
    Pkc = 4,
    PkcPrivate = 5,
    Encrypt = 6,
    Decrypt = 7,
    Sign = 8,
    SigCheck = 9,
    KeyGen = 10,
    Cert = 11,
    Ca = 12,
}

impl CheckType {
    pub const ALL: [CheckType; 12] = [
        CheckType::Crypt,
        CheckType::Hash,
        CheckType::Mac,
        CheckType::Pkc,
        CheckType::PkcPrivate,
        CheckType::Encrypt,
        CheckType::Decrypt,
        CheckType::Sign,
        CheckType::SigCheck,
        CheckType::KeyGen,
        CheckType::Cert,
        CheckType::Ca,
    ];

    pub fn from_value(value: i32) -> Option<Self> {
        Self::ALL.into_iter().find(|c| *c as i32 == value)
    }
}

/// Comparisons answered by the `Compare` message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum CompareType {
    Hash = 1,
    KeyId = 2,
    Subject = 3,
    Fingerprint = 4,
}

impl CompareType {
    pub const ALL: [CompareType; 4] = [
        CompareType::Hash,
        CompareType::KeyId,
        CompareType::Subject,
        CompareType::Fingerprint,
    ];

    pub fn from_value(value: i32) -> Option<Self> {
        Self::ALL.into_iter().find(|c| *c as i32 == value)
    }
}

/// Mechanisms for device export, import and derivation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum MechanismType {
    /// Wrap a key under an AES-GCM context.
    Wrap = 1,
    /// PBKDF2-HMAC-SHA256.
    Derive = 2,
}

impl MechanismType {
    pub fn from_value(value: i32) -> Option<Self> {
        match value {
            1 => Some(Self::Wrap),
            2 => Some(Self::Derive),
            _ => None,
        }
    }
}

/// Items stored in keysets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum KeyItem {
    Certificate = 1,
    Secret = 2,
}

impl KeyItem {
    pub fn from_value(value: i32) -> Option<Self> {
        match value {
            1 => Some(Self::Certificate),
            2 => Some(Self::Secret),
            _ => None,
        }
    }
}

/// Certificate management actions for CA users.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum CertAction {
    Issue = 1,
    Revoke = 2,
}

impl CertAction {
    pub fn from_value(value: i32) -> Option<Self> {
        match value {
            1 => Some(Self::Issue),
            2 => Some(Self::Revoke),
            _ => None,
        }
    }
}

// ---------------------------------------------------------------------------
// Payloads
// ---------------------------------------------------------------------------

/// Arguments for `DevCreateObject`. The object type travels in `value`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreateObjectInfo {
    pub subtype: SubType,
    /// Family-specific selector (an algorithm for contexts). Zero for default.
    pub arg: i32,
    /// Filled in with the new object's handle.
    pub result: Option<Handle>,
}

impl CreateObjectInfo {
    pub fn new(subtype: SubType, arg: i32) -> Self {
        Self {
            subtype,
            arg,
            result: None,
        }
    }
}

/// Input and output of `CtxSign` / `CtxSigCheck`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SignatureData {
    pub data: Vec<u8>,
    pub signature: Vec<u8>,
}

/// Arguments for key wrap export and import.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WrapInfo {
    /// Output of export, input of import.
    pub wrapped: Vec<u8>,
    /// The context whose key is exported or imported.
    pub key_context: Handle,
    /// The conventional context doing the wrapping.
    pub wrap_context: Handle,
}

/// Arguments for password-based derivation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeriveInfo {
    pub input: Vec<u8>,
    pub salt: Vec<u8>,
    pub iterations: u32,
    pub output_len: usize,
    pub output: Vec<u8>,
}

/// Arguments for keyset get/set/delete. The item kind travels in `value`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyMgmtInfo {
    pub name: String,
    /// Input for set, output for get.
    pub object: Option<Handle>,
}

/// Arguments for CA certificate management. The action travels in `value`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CertMgmtInfo {
    pub ca_key: Handle,
    pub request: Handle,
    pub result: Option<Handle>,
}

/// The payload half of a message.
#[derive(Debug)]
pub enum Payload<'a> {
    None,
    /// A numeric, boolean or handle value. Input for set, output for get.
    Int(&'a mut i32),
    /// Input bytes.
    Data(&'a [u8]),
    /// Output bytes.
    Output(&'a mut Vec<u8>),
    /// Bytes transformed in place.
    Buffer(&'a mut [u8]),
    Signature(&'a mut SignatureData),
    Create(&'a mut CreateObjectInfo),
    Wrap(&'a mut WrapInfo),
    Derive(&'a mut DeriveInfo),
    KeyMgmt(&'a mut KeyMgmtInfo),
    CertMgmt(&'a mut CertMgmtInfo),
}

impl Payload<'_> {
    /// An owned copy of input-only payloads. Payloads that return data to
    /// the sender have no owned form: they cannot be deferred.
    pub(crate) fn to_owned_input(&self) -> Option<OwnedPayload> {
        match self {
            Payload::None => Some(OwnedPayload::None),
            Payload::Int(v) => Some(OwnedPayload::Int(**v)),
            Payload::Data(d) => Some(OwnedPayload::Data(d.to_vec())),
            _ => None,
        }
    }

    pub(crate) fn int(&self) -> Option<i32> {
        match self {
            Payload::Int(v) => Some(**v),
            _ => None,
        }
    }
}

/// Payload storage for deferred messages.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum OwnedPayload {
    None,
    Int(i32),
    Data(Vec<u8>),
}

impl OwnedPayload {
    pub(crate) fn as_payload(&mut self) -> Payload<'_> {
        match self {
            OwnedPayload::None => Payload::None,
            OwnedPayload::Int(v) => Payload::Int(v),
            OwnedPayload::Data(d) => Payload::Data(d),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_table_order_matches_discriminants() {
        for (i, kind) in MessageKind::ALL.iter().enumerate() {
            assert_eq!(kind.index(), i);
        }
    }

    #[test]
    fn test_attribute_lookup() {
        assert_eq!(Attribute::from_value(7), Some(Attribute::UsageCount));
        assert_eq!(Attribute::from_value(9999), None);
        assert!(Attribute::UsageCount.is_property());
        assert!(!Attribute::CtxKey.is_property());
    }

    #[test]
    fn test_output_payloads_cannot_be_deferred() {
        let mut out = Vec::new();
        assert!(Payload::Output(&mut out).to_owned_input().is_none());
        let mut v = 5;
        assert_eq!(
            Payload::Int(&mut v).to_owned_input(),
            Some(OwnedPayload::Int(5))
        );
    }
}
