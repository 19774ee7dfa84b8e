//! Core identifiers and object classification.
//!
//! Handles are plain table indices. Anything that holds on to an object
//! across a lock release pairs the handle with the object's unique ID in an
//! [`ObjectRef`], so a slot that was freed and reused is detected rather
//! than silently addressed.

use bitflags::bitflags;
use serde::{Deserialize, Serialize};

/// Number of handles reserved for the system object and the default user.
pub(crate) const RESERVED_HANDLES: usize = 2;

/// An index into the object table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Handle(u32);

impl Handle {
    /// The root system object (a system device).
    pub const SYSTEM: Handle = Handle(0);

    /// The default security-officer user.
    pub const DEFAULT_USER: Handle = Handle(1);

    pub const fn from_raw(raw: u32) -> Self {
        Self(raw)
    }

    pub const fn raw(self) -> u32 {
        self.0
    }

    /// Interpret a message integer as a handle. Negative values never are.
    pub fn from_value(value: i32) -> Option<Self> {
        u32::try_from(value).ok().map(Self)
    }

    /// The handle as a message integer.
    pub(crate) fn as_value(self) -> i32 {
        // Table sizes are capped far below i32::MAX.
        self.0 as i32
    }

    pub(crate) fn index(self) -> usize {
        self.0 as usize
    }

    pub(crate) fn is_reserved(self) -> bool {
        self.index() < RESERVED_HANDLES
    }
}

impl std::fmt::Display for Handle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// A handle paired with the unique ID of the object it named when the
/// reference was taken.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ObjectRef {
    pub handle: Handle,
    pub unique_id: u64,
}

/// The object families managed by the kernel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum ObjectType {
    Context = 1,
    Certificate = 2,
    Keyset = 3,
    Envelope = 4,
    Session = 5,
    Device = 6,
    User = 7,
}

impl ObjectType {
    pub const ALL: [ObjectType; 7] = [
        ObjectType::Context,
        ObjectType::Certificate,
        ObjectType::Keyset,
        ObjectType::Envelope,
        ObjectType::Session,
        ObjectType::Device,
        ObjectType::User,
    ];

    pub fn from_value(value: i32) -> Option<Self> {
        Self::ALL.into_iter().find(|t| *t as i32 == value)
    }

    /// Every subtype belonging to this family.
    pub const fn subtypes(self) -> SubType {
        match self {
            Self::Context => SubType::CTX_ANY,
            Self::Certificate => SubType::CERT_ANY,
            Self::Keyset => SubType::KEYSET_ANY,
            Self::Envelope => SubType::ENV_ANY,
            Self::Session => SubType::SESSION_ANY,
            Self::Device => SubType::DEV_ANY,
            Self::User => SubType::USER_ANY,
        }
    }
}

bitflags! {
    /// Object subtypes. Each subtype owns one bit, and every family's bits
    /// are disjoint, so a single mask can name subtypes across families.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct SubType: u32 {
        const CTX_CONV          = 1 << 0;
        const CTX_PKC           = 1 << 1;
        const CTX_HASH          = 1 << 2;
        const CTX_MAC           = 1 << 3;
        const CTX_GENERIC       = 1 << 4;

        const CERT_CERTIFICATE  = 1 << 5;
        const CERT_REQUEST      = 1 << 6;
        const CERT_CHAIN        = 1 << 7;
        const CERT_CRL          = 1 << 8;

        const KEYSET_MEMORY     = 1 << 9;

        const ENV_ENVELOPE      = 1 << 10;
        const ENV_DEENVELOPE    = 1 << 11;

        const SESSION_SSL       = 1 << 12;
        const SESSION_SSL_SERVER = 1 << 13;
        const SESSION_SSH       = 1 << 14;

        const DEV_SYSTEM        = 1 << 15;
        const DEV_HARDWARE      = 1 << 16;

        const USER_SO           = 1 << 17;
        const USER_NORMAL       = 1 << 18;
        const USER_CA           = 1 << 19;

        const CTX_ANY = Self::CTX_CONV.bits() | Self::CTX_PKC.bits() | Self::CTX_HASH.bits()
            | Self::CTX_MAC.bits() | Self::CTX_GENERIC.bits();
        const CERT_ANY = Self::CERT_CERTIFICATE.bits() | Self::CERT_REQUEST.bits()
            | Self::CERT_CHAIN.bits() | Self::CERT_CRL.bits();
        const KEYSET_ANY = Self::KEYSET_MEMORY.bits();
        const ENV_ANY = Self::ENV_ENVELOPE.bits() | Self::ENV_DEENVELOPE.bits();
        const SESSION_ANY = Self::SESSION_SSL.bits() | Self::SESSION_SSL_SERVER.bits()
            | Self::SESSION_SSH.bits();
        const DEV_ANY = Self::DEV_SYSTEM.bits() | Self::DEV_HARDWARE.bits();
        const USER_ANY = Self::USER_SO.bits() | Self::USER_NORMAL.bits() | Self::USER_CA.bits();
    }
}

impl SubType {
    /// The family a single subtype belongs to.
    pub fn object_type(self) -> Option<ObjectType> {
        if self.bits().count_ones() != 1 {
            return None;
        }
        ObjectType::ALL
            .into_iter()
            .find(|t| t.subtypes().contains(self))
    }
}

bitflags! {
    /// Per-object state flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct ObjectFlags: u32 {
        /// Still under construction by its creator.
        const NOT_INITED  = 1 << 0;
        /// Destroy requested or object in an unusable state.
        const SIGNALLED   = 1 << 1;
        /// Moved into the high (keyed / committed) state.
        const HIGH        = 1 << 2;
        /// Not addressable by external callers.
        const INTERNAL    = 1 << 3;
        /// Bound to a single thread.
        const OWNED       = 1 << 4;
        /// Properties frozen.
        const ATTR_LOCKED = 1 << 5;
    }
}

// ---------------------------------------------------------------------------
// Action permissions
// ---------------------------------------------------------------------------

/// Operations governed by an object's action permissions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum Action {
    Encrypt = 0,
    Decrypt = 1,
    Sign = 2,
    SigCheck = 3,
    Hash = 4,
    GenKey = 5,
}

impl Action {
    pub const ALL: [Action; 6] = [
        Action::Encrypt,
        Action::Decrypt,
        Action::Sign,
        Action::SigCheck,
        Action::Hash,
        Action::GenKey,
    ];

    const fn shift(self) -> u32 {
        self as u32 * ActionPermissions::FIELD_BITS
    }
}

/// How freely an action may be invoked. Ordered from most to least
/// restrictive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum PermLevel {
    /// The object cannot perform the action at all.
    NotAvailable = 0,
    /// The action exists but nobody may invoke it.
    None = 1,
    /// Only the library's own internals may invoke it.
    NoneExternal = 2,
    /// Anyone with access to the object may invoke it.
    All = 3,
}

impl PermLevel {
    const fn from_bits(bits: u32) -> Self {
        match bits & ActionPermissions::FIELD_MASK {
            0 => Self::NotAvailable,
            1 => Self::None,
            2 => Self::NoneExternal,
            _ => Self::All,
        }
    }
}

/// Two bits per [`Action`]. Updates go through [`ActionPermissions::restrict`],
/// which can only lower a field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(transparent)]
pub struct ActionPermissions(u32);

impl ActionPermissions {
    const FIELD_BITS: u32 = 2;
    const FIELD_MASK: u32 = 0b11;
    const VALID_MASK: u32 = (1 << (Action::ALL.len() as u32 * Self::FIELD_BITS)) - 1;

    /// No action available.
    pub const NONE_AVAILABLE: Self = Self(0);

    /// Every action permitted to everyone.
    pub const ALL: Self = Self(Self::VALID_MASK);

    /// Build from raw bits. Bits outside the action fields are rejected.
    pub const fn from_bits(bits: u32) -> Option<Self> {
        if bits & !Self::VALID_MASK != 0 {
            None
        } else {
            Some(Self(bits))
        }
    }

    pub const fn bits(self) -> u32 {
        self.0
    }

    pub const fn level(self, action: Action) -> PermLevel {
        PermLevel::from_bits(self.0 >> action.shift())
    }

    /// Set one field. Only for building initial permissions.
    pub const fn with(self, action: Action, level: PermLevel) -> Self {
        let shift = action.shift();
        Self((self.0 & !(Self::FIELD_MASK << shift)) | ((level as u32) << shift))
    }

    /// Combine with another permission set, keeping the more restrictive
    /// level for every action.
    pub fn restrict(self, other: Self) -> Self {
        Action::ALL.into_iter().fold(self, |acc, action| {
            let level = acc.level(action).min(other.level(action));
            acc.with(action, level)
        })
    }

    /// True if no field of `self` is looser than the same field of `other`.
    pub fn is_within(self, other: Self) -> bool {
        Action::ALL
            .into_iter()
            .all(|a| self.level(a) <= other.level(a))
    }
}
