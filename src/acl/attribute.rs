//! Attribute ACL: who may touch each attribute and which values it takes.

use bitflags::bitflags;

use super::ops::{NONE, R, RW, RWD, W};
use super::{valid_subtypes, AccessFlags, AclDefect, StateRequirement};
use crate::error::{ArgPosition, KernelError, KernelResult};
use crate::message::{algorithm, content_type, key_usage, Attribute};
use crate::types::{ActionPermissions, ObjectType, SubType};

/// How the attribute's value travels.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ValueType {
    Boolean,
    Numeric,
    /// Seconds since the Unix epoch.
    Time,
    String,
    /// A handle to another object.
    Object,
}

impl ValueType {
    /// Carried as an integer rather than bytes.
    pub(crate) fn is_numeric(self) -> bool {
        !matches!(self, Self::String)
    }
}

/// A range that applies only to some subtypes.
#[derive(Debug, Clone, Copy)]
pub(crate) struct SubRange {
    pub subtypes: SubType,
    pub min: i32,
    pub max: i32,
}

/// Acceptable values for a write.
#[derive(Debug, Clone, Copy)]
pub(crate) enum ValueRange {
    Any,
    Numeric { min: i32, max: i32 },
    Length { min: usize, max: usize },
    Allowed(&'static [i32]),
    /// Non-zero, using only these bits.
    Flags(i32),
    /// Numeric or length range chosen by the object's subtype.
    BySubtype(&'static [SubRange]),
    /// A handle to an object of these subtypes in this state.
    Object {
        subtypes: SubType,
        state: StateRequirement,
    },
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub(crate) struct AttrFlags: u8 {
        /// Kernel property, handled without the object.
        const PROPERTY   = 1 << 0;
        /// A successful write moves the object into the high state.
        const TRIGGER    = 1 << 1;
        /// Reads take their size from the output buffer, which is range checked.
        const SIZED_READ = 1 << 2;
    }
}

#[derive(Debug, Clone, Copy)]
pub(crate) struct AttributeAcl {
    pub attribute: Attribute,
    pub value_type: ValueType,
    pub subtypes: SubType,
    pub access: AccessFlags,
    pub flags: AttrFlags,
    /// Object family the message is routed to when sent elsewhere.
    pub routing: Option<ObjectType>,
    pub range: ValueRange,
}

const fn entry(
    attribute: Attribute,
    value_type: ValueType,
    subtypes: SubType,
    access: AccessFlags,
    range: ValueRange,
) -> AttributeAcl {
    AttributeAcl {
        attribute,
        value_type,
        subtypes,
        access,
        flags: AttrFlags::empty(),
        routing: None,
        range,
    }
}

impl AttributeAcl {
    const fn flags(mut self, flags: AttrFlags) -> Self {
        self.flags = flags;
        self
    }

    const fn routed(mut self, target: ObjectType) -> Self {
        self.routing = Some(target);
        self
    }

    const fn property(self) -> Self {
        self.flags(AttrFlags::PROPERTY)
    }
}

const ALL: SubType = SubType::all();
const CTX_KEYED: SubType = SubType::CTX_CONV
    .union(SubType::CTX_MAC)
    .union(SubType::CTX_GENERIC);
const CERT_SIGNABLE: SubType = SubType::CERT_CERTIFICATE
    .union(SubType::CERT_REQUEST)
    .union(SubType::CERT_CHAIN);
const CERT_ISSUED: SubType = SubType::CERT_CERTIFICATE.union(SubType::CERT_CHAIN);
const USER_CONFIGURABLE: SubType = SubType::USER_SO.union(SubType::USER_NORMAL);

/// Largest numeric value used for "unbounded" counters.
const MAX_COUNT: i32 = i32::MAX;

static KEY_SIZES: [SubRange; 3] = [
    SubRange { subtypes: SubType::CTX_CONV, min: 16, max: 32 },
    SubRange { subtypes: SubType::CTX_MAC, min: 16, max: 64 },
    SubRange { subtypes: SubType::CTX_GENERIC, min: 16, max: 64 },
];

static KEY_LENGTHS: [SubRange; 3] = [
    SubRange { subtypes: SubType::CTX_CONV, min: 8, max: 32 },
    SubRange { subtypes: SubType::CTX_MAC, min: 8, max: 64 },
    SubRange { subtypes: SubType::CTX_GENERIC, min: 16, max: 64 },
];

static CONTENT_TYPES: [i32; 3] = [content_type::DATA, content_type::SIGNED, content_type::ENVELOPED];

static USER_ALGORITHMS: [i32; 2] = [algorithm::AES_128_GCM, algorithm::AES_256_GCM];

use Attribute as A;
use ValueType::{Boolean, Numeric, Object, String as Str, Time};

/// Sorted by attribute ID.
pub(crate) static TABLE: &[AttributeAcl] = &[
    // Kernel properties.
    entry(A::Status, Numeric, ALL, AccessFlags::both(R, R), ValueRange::Any).property(),
    entry(A::ObjectType, Numeric, ALL, AccessFlags::both(R, R), ValueRange::Any).property(),
    entry(A::ObjectSubType, Numeric, ALL, AccessFlags::internal(R, R), ValueRange::Any).property(),
    entry(A::Owner, Boolean, ALL, AccessFlags::both(RW, RW), ValueRange::Any).property(),
    entry(
        A::ForwardCount,
        Numeric,
        ALL,
        AccessFlags::both(RW, RW),
        ValueRange::Numeric { min: 1, max: 1000 },
    )
    .property(),
    entry(A::Locked, Boolean, ALL, AccessFlags::both(R, R), ValueRange::Any).property(),
    entry(
        A::UsageCount,
        Numeric,
        SubType::CTX_ANY,
        AccessFlags::both(RW, RW),
        ValueRange::Numeric { min: 1, max: MAX_COUNT },
    )
    .property(),
    entry(A::HighSecurity, Boolean, ALL, AccessFlags::both(W, W), ValueRange::Any).property(),
    entry(A::Internal, Boolean, ALL, AccessFlags::internal(RW, RW), ValueRange::Any).property(),
    entry(
        A::ActionPerms,
        Numeric,
        SubType::CTX_ANY,
        AccessFlags::internal(RW, RW),
        ValueRange::Numeric { min: 0, max: ActionPermissions::ALL.bits() as i32 },
    )
    .property(),
    entry(A::Initialised, Boolean, ALL, AccessFlags::internal(W, W), ValueRange::Any).property(),
    // Contexts.
    entry(A::CtxAlgorithm, Numeric, SubType::CTX_ANY, AccessFlags::both(R, R), ValueRange::Any)
        .routed(ObjectType::Context),
    entry(
        A::CtxKeySize,
        Numeric,
        CTX_KEYED,
        AccessFlags::both(RW, R),
        ValueRange::BySubtype(&KEY_SIZES),
    )
    .routed(ObjectType::Context),
    entry(
        A::CtxKey,
        Str,
        CTX_KEYED,
        AccessFlags::both(W, NONE),
        ValueRange::BySubtype(&KEY_LENGTHS),
    )
    .flags(AttrFlags::TRIGGER),
    entry(
        A::CtxIv,
        Str,
        SubType::CTX_CONV,
        AccessFlags::both(RW, RW),
        ValueRange::Length { min: 12, max: 12 },
    )
    .routed(ObjectType::Context),
    entry(
        A::CtxKeyingSalt,
        Str,
        CTX_KEYED,
        AccessFlags::both(RW, R),
        ValueRange::Length { min: 8, max: 64 },
    ),
    entry(
        A::CtxKeyingIterations,
        Numeric,
        CTX_KEYED,
        AccessFlags::both(RW, R),
        ValueRange::Numeric { min: 1, max: 20000 },
    ),
    entry(
        A::CtxKeyingValue,
        Str,
        CTX_KEYED,
        AccessFlags::both(W, NONE),
        ValueRange::Length { min: 1, max: 256 },
    )
    .flags(AttrFlags::TRIGGER),
    entry(
        A::CtxLabel,
        Str,
        SubType::CTX_ANY,
        AccessFlags::both(RWD, RWD),
        ValueRange::Length { min: 1, max: 64 },
    )
    .routed(ObjectType::Context),
    entry(
        A::CtxHashValue,
        Str,
        SubType::CTX_HASH.union(SubType::CTX_MAC),
        AccessFlags::both(R, R),
        ValueRange::Any,
    )
    .routed(ObjectType::Context),
    entry(
        A::CtxAuthTag,
        Str,
        SubType::CTX_CONV,
        AccessFlags::both(NONE, RW),
        ValueRange::Length { min: 16, max: 16 },
    ),
    entry(A::CtxPublicKey, Str, SubType::CTX_PKC, AccessFlags::both(NONE, R), ValueRange::Any)
        .routed(ObjectType::Context),
    // Certificates.
    entry(
        A::CertKeyUsage,
        Numeric,
        SubType::CERT_ANY,
        AccessFlags::both(RW, R),
        ValueRange::Flags(key_usage::ALL),
    )
    .routed(ObjectType::Certificate),
    entry(A::CertSelfSigned, Boolean, CERT_ISSUED, AccessFlags::both(RW, R), ValueRange::Any)
        .routed(ObjectType::Certificate),
    entry(
        A::CertSubjectName,
        Str,
        CERT_SIGNABLE,
        AccessFlags::both(RW, R),
        ValueRange::Length { min: 1, max: 128 },
    )
    .routed(ObjectType::Certificate),
    entry(
        A::CertValidTo,
        Time,
        SubType::CERT_ANY,
        AccessFlags::both(RW, R),
        ValueRange::Numeric { min: 1, max: i32::MAX },
    )
    .routed(ObjectType::Certificate),
    entry(
        A::CertTrusted,
        Boolean,
        CERT_ISSUED,
        AccessFlags::grant(R, RW, R, R),
        ValueRange::Any,
    ),
    entry(A::CertFingerprint, Str, SubType::CERT_ANY, AccessFlags::both(NONE, R), ValueRange::Any)
        .routed(ObjectType::Certificate),
    entry(
        A::CertSigningKey,
        Object,
        SubType::CERT_ANY,
        AccessFlags::both(W, NONE),
        ValueRange::Object {
            subtypes: SubType::CTX_PKC,
            state: StateRequirement::High,
        },
    )
    .flags(AttrFlags::TRIGGER),
    // Keysets.
    entry(
        A::KeysetName,
        Str,
        SubType::KEYSET_ANY,
        AccessFlags::both(RW, RW),
        ValueRange::Length { min: 1, max: 64 },
    ),
    entry(A::KeysetEntries, Numeric, SubType::KEYSET_ANY, AccessFlags::both(R, R), ValueRange::Any),
    // Envelopes.
    entry(
        A::EnvDataSize,
        Numeric,
        SubType::ENV_ANY,
        AccessFlags::both(RW, R),
        ValueRange::Numeric { min: 1, max: i32::MAX },
    ),
    entry(
        A::EnvContentType,
        Numeric,
        SubType::ENV_ENVELOPE,
        AccessFlags::both(RW, R),
        ValueRange::Allowed(&CONTENT_TYPES),
    ),
    entry(
        A::EnvSessionKey,
        Object,
        SubType::ENV_ANY,
        AccessFlags::both(W, NONE),
        ValueRange::Object {
            subtypes: SubType::CTX_CONV,
            state: StateRequirement::High,
        },
    ),
    // Sessions.
    entry(
        A::SessionServerName,
        Str,
        SubType::SESSION_ANY,
        AccessFlags::both(RW, R),
        ValueRange::Length { min: 1, max: 255 },
    ),
    entry(
        A::SessionServerPort,
        Numeric,
        SubType::SESSION_ANY,
        AccessFlags::both(RW, R),
        ValueRange::Numeric { min: 1, max: 65535 },
    ),
    entry(
        A::SessionUserName,
        Str,
        SubType::SESSION_SSH,
        AccessFlags::both(RW, R),
        ValueRange::Length { min: 1, max: 64 },
    ),
    entry(A::SessionActive, Boolean, SubType::SESSION_ANY, AccessFlags::both(RW, R), ValueRange::Any)
        .flags(AttrFlags::TRIGGER),
    // Devices.
    entry(
        A::DevLabel,
        Str,
        SubType::DEV_ANY,
        AccessFlags::grant(RW, RW, R, R),
        ValueRange::Length { min: 1, max: 64 },
    ),
    entry(
        A::DevRandom,
        Str,
        SubType::DEV_ANY,
        AccessFlags::both(R, R),
        ValueRange::Length { min: 1, max: 4096 },
    )
    .flags(AttrFlags::SIZED_READ),
    // Users.
    entry(
        A::UserName,
        Str,
        SubType::USER_ANY,
        AccessFlags::both(RW, RW),
        ValueRange::Length { min: 1, max: 64 },
    ),
    entry(
        A::OptionEncryptionAlgo,
        Numeric,
        USER_CONFIGURABLE,
        AccessFlags::both(RW, RW),
        ValueRange::Allowed(&USER_ALGORITHMS),
    ),
    entry(
        A::OptionKeyingIterations,
        Numeric,
        USER_CONFIGURABLE,
        AccessFlags::both(RW, RW),
        ValueRange::Numeric { min: 1, max: 20000 },
    ),
    entry(A::OptionConfigChanged, Boolean, USER_CONFIGURABLE, AccessFlags::both(RW, RW), ValueRange::Any),
];

/// Look up the ACL for an attribute ID.
pub(crate) fn find(value: i32) -> KernelResult<&'static AttributeAcl> {
    TABLE
        .binary_search_by_key(&value, |acl| acl.attribute as i32)
        .map(|i| &TABLE[i])
        .map_err(|_| KernelError::BadArgument(ArgPosition::Value))
}

impl AttributeAcl {
    fn sub_range(&self, subtype: SubType, ranges: &[SubRange]) -> KernelResult<(i32, i32)> {
        ranges
            .iter()
            .find(|r| r.subtypes.contains(subtype))
            .map(|r| (r.min, r.max))
            .ok_or(KernelError::BadArgument(ArgPosition::Value))
    }

    /// Check a numeric write. Booleans are normalised to 0/1.
    pub(crate) fn check_numeric(&self, subtype: SubType, value: &mut i32) -> KernelResult<()> {
        let bad = KernelError::BadArgument(ArgPosition::Num1);
        if self.value_type == ValueType::Boolean {
            *value = i32::from(*value != 0);
            return Ok(());
        }
        let ok = match self.range {
            ValueRange::Any | ValueRange::Object { .. } => true,
            ValueRange::Numeric { min, max } => (min..=max).contains(value),
            ValueRange::Allowed(values) => values.contains(value),
            ValueRange::Flags(mask) => *value != 0 && *value & !mask == 0,
            ValueRange::BySubtype(ranges) => {
                let (min, max) = self.sub_range(subtype, ranges)?;
                (min..=max).contains(value)
            }
            ValueRange::Length { .. } => false,
        };
        if ok {
            Ok(())
        } else {
            Err(bad)
        }
    }

    /// Check the length of a string write, or of a sized read buffer.
    pub(crate) fn check_length(&self, subtype: SubType, len: usize) -> KernelResult<()> {
        let (min, max) = match self.range {
            ValueRange::Any => return Ok(()),
            ValueRange::Length { min, max } => (min, max),
            ValueRange::BySubtype(ranges) => {
                let (min, max) = self.sub_range(subtype, ranges)?;
                (min as usize, max as usize)
            }
            _ => return Err(KernelError::BadArgument(ArgPosition::Str1)),
        };
        if (min..=max).contains(&len) {
            Ok(())
        } else {
            Err(KernelError::BadArgument(ArgPosition::Str1))
        }
    }
}

// ---------------------------------------------------------------------------
// Self-check
// ---------------------------------------------------------------------------

pub(crate) fn check_table(table: &[AttributeAcl]) -> Result<(), AclDefect> {
    const NAME: &str = "attribute";
    let mut last_id = i32::MIN;
    for (i, acl) in table.iter().enumerate() {
        let defect = |problem| Err(AclDefect::new(NAME, i, problem));
        let id = acl.attribute as i32;
        if id <= last_id {
            return defect("entries out of order or duplicated");
        }
        last_id = id;

        if !valid_subtypes(acl.subtypes) {
            return defect("empty or unknown subtype mask");
        }
        if acl.access.is_empty() {
            return defect("no access permitted at all");
        }
        if acl.flags.contains(AttrFlags::PROPERTY) != acl.attribute.is_property() {
            return defect("property flag disagrees with attribute class");
        }
        if let Some(target) = acl.routing {
            if !target.subtypes().contains(acl.subtypes) {
                return defect("subtypes outside the routing target family");
            }
        }
        if let Err(problem) = check_range(acl) {
            return defect(problem);
        }
    }
    Ok(())
}

fn check_range(acl: &AttributeAcl) -> Result<(), &'static str> {
    match (acl.value_type, acl.range) {
        (_, ValueRange::Any) => Ok(()),
        (Numeric | Time, ValueRange::Numeric { min, max }) if min <= max => Ok(()),
        (Numeric, ValueRange::Allowed(values)) if !values.is_empty() => Ok(()),
        (Numeric, ValueRange::Flags(mask)) if mask > 0 => Ok(()),
        (Str, ValueRange::Length { min, max }) if min <= max => Ok(()),
        (Numeric | Str, ValueRange::BySubtype(ranges)) => {
            if ranges.is_empty() || ranges.iter().any(|r| r.min > r.max || r.min < 0) {
                return Err("malformed subtype range");
            }
            if !super::disjoint(ranges.iter().map(|r| &r.subtypes)) {
                return Err("overlapping subtype ranges");
            }
            let covered = ranges
                .iter()
                .fold(SubType::empty(), |acc, r| acc | r.subtypes);
            if covered != acl.subtypes {
                return Err("subtype ranges do not cover the attribute's subtypes");
            }
            Ok(())
        }
        (Object, ValueRange::Object { subtypes, .. }) if valid_subtypes(subtypes) => Ok(()),
        _ => Err("range does not fit the value type"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_find_known_and_unknown() {
        assert_eq!(find(Attribute::CtxKey as i32).unwrap().attribute, Attribute::CtxKey);
        assert_eq!(find(12345).err(), Some(KernelError::BadArgument(ArgPosition::Value)));
    }

    #[test]
    fn test_every_attribute_has_an_entry() {
        for attribute in Attribute::ALL {
            assert!(find(attribute as i32).is_ok(), "{attribute:?} has no ACL");
        }
    }

    #[test]
    fn test_salt_length_range() {
        let acl = find(Attribute::CtxKeyingSalt as i32).unwrap();
        assert!(acl.check_length(SubType::CTX_CONV, 7).is_err());
        assert!(acl.check_length(SubType::CTX_CONV, 8).is_ok());
        assert!(acl.check_length(SubType::CTX_CONV, 64).is_ok());
        assert!(acl.check_length(SubType::CTX_CONV, 65).is_err());
    }

    #[test]
    fn test_key_length_depends_on_subtype() {
        let acl = find(Attribute::CtxKey as i32).unwrap();
        assert!(acl.check_length(SubType::CTX_CONV, 8).is_ok());
        assert!(acl.check_length(SubType::CTX_GENERIC, 8).is_err());
        assert!(acl.check_length(SubType::CTX_MAC, 64).is_ok());
    }

    #[test]
    fn test_numeric_checks() {
        let iterations = find(Attribute::CtxKeyingIterations as i32).unwrap();
        let mut v = 0;
        assert!(iterations.check_numeric(SubType::CTX_CONV, &mut v).is_err());
        v = 20000;
        assert!(iterations.check_numeric(SubType::CTX_CONV, &mut v).is_ok());

        let usage = find(Attribute::CertKeyUsage as i32).unwrap();
        let mut bits = key_usage::DIGITAL_SIGNATURE | key_usage::KEY_CERT_SIGN;
        assert!(usage.check_numeric(SubType::CERT_CERTIFICATE, &mut bits).is_ok());
        let mut stray = 0x100;
        assert!(usage.check_numeric(SubType::CERT_CERTIFICATE, &mut stray).is_err());

        let flag = find(Attribute::SessionActive as i32).unwrap();
        let mut truthy = 42;
        flag.check_numeric(SubType::SESSION_SSL, &mut truthy).unwrap();
        assert_eq!(truthy, 1);
    }

    #[test]
    fn test_self_check_catches_defects() {
        // 1. Out of order.
        let broken = [TABLE[1], TABLE[0]];
        assert!(check_table(&broken).is_err());

        // 2. Inverted range.
        let mut bad_range = TABLE[16];
        bad_range.range = ValueRange::Numeric { min: 10, max: 1 };
        assert!(check_table(&[bad_range]).is_err());

        // 3. Overlapping subtype ranges.
        static OVERLAP: [SubRange; 2] = [
            SubRange { subtypes: SubType::CTX_ANY, min: 1, max: 2 },
            SubRange { subtypes: SubType::CTX_CONV, min: 1, max: 2 },
        ];
        let mut overlapping = TABLE[12];
        overlapping.range = ValueRange::BySubtype(&OVERLAP);
        assert!(check_table(&[overlapping]).is_err());

        // 4. Empty subtype mask.
        let mut empty = TABLE[0];
        empty.subtypes = SubType::empty();
        assert!(check_table(&[empty]).is_err());
    }
}
