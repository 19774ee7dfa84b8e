//! Parameter ACLs for device mechanisms, key management, certificate
//! management and object creation.
//!
//! These describe messages whose payload names further objects. Each object
//! named there is checked for subtype and state the same way the message
//! target is.

use super::{valid_subtypes, AclDefect, StateRequirement};
use crate::error::{ArgPosition, KernelError, KernelResult};
use crate::message::{CertAction, KeyItem, MessageKind};
use crate::types::SubType;

/// An object argument inside a payload.
#[derive(Debug, Clone, Copy)]
pub(crate) struct ObjectParam {
    pub subtypes: SubType,
    pub state: StateRequirement,
}

const fn object(subtypes: SubType, state: StateRequirement) -> ObjectParam {
    ObjectParam { subtypes, state }
}

#[derive(Debug, Clone, Copy)]
pub(crate) struct LengthRange {
    pub min: usize,
    pub max: usize,
}

impl LengthRange {
    pub(crate) fn check(self, len: usize, position: ArgPosition) -> KernelResult<()> {
        if (self.min..=self.max).contains(&len) {
            Ok(())
        } else {
            Err(KernelError::BadArgument(position))
        }
    }
}

const fn len(min: usize, max: usize) -> LengthRange {
    LengthRange { min, max }
}

/// Export and import of a key wrapped under a conventional context.
#[derive(Debug, Clone, Copy)]
pub(crate) struct WrapAcl {
    pub kind: MessageKind,
    pub key_context: ObjectParam,
    pub wrap_context: ObjectParam,
    /// Wrapped-key length, checked on import.
    pub wrapped: LengthRange,
}

/// Password-based derivation.
#[derive(Debug, Clone, Copy)]
pub(crate) struct DeriveAcl {
    pub input: LengthRange,
    pub salt: LengthRange,
    pub min_iterations: u32,
    pub max_iterations: u32,
    pub output: LengthRange,
}

const KEYED: SubType = SubType::CTX_CONV
    .union(SubType::CTX_MAC)
    .union(SubType::CTX_GENERIC);

pub(crate) static WRAP: &[WrapAcl] = &[
    WrapAcl {
        kind: MessageKind::DevExport,
        key_context: object(KEYED, StateRequirement::High),
        wrap_context: object(SubType::CTX_CONV, StateRequirement::High),
        wrapped: len(0, usize::MAX),
    },
    WrapAcl {
        kind: MessageKind::DevImport,
        key_context: object(KEYED, StateRequirement::Low),
        wrap_context: object(SubType::CTX_CONV, StateRequirement::High),
        wrapped: len(24, 256),
    },
];

pub(crate) static DERIVE: DeriveAcl = DeriveAcl {
    input: len(1, 256),
    salt: len(8, 64),
    min_iterations: 1,
    max_iterations: 100_000,
    output: len(16, 64),
};

pub(crate) fn find_wrap(kind: MessageKind) -> KernelResult<&'static WrapAcl> {
    WRAP.iter()
        .find(|acl| acl.kind == kind)
        .ok_or(KernelError::BadArgument(ArgPosition::Value))
}

// ---------------------------------------------------------------------------
// Key management
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy)]
pub(crate) struct KeyMgmtAcl {
    pub item: KeyItem,
    /// Objects that may be stored under this item.
    pub object: ObjectParam,
    pub name: LengthRange,
}

pub(crate) static KEY_MGMT: &[KeyMgmtAcl] = &[
    KeyMgmtAcl {
        item: KeyItem::Certificate,
        object: object(
            SubType::CERT_CERTIFICATE.union(SubType::CERT_CHAIN),
            StateRequirement::High,
        ),
        name: len(1, 64),
    },
    KeyMgmtAcl {
        item: KeyItem::Secret,
        object: object(SubType::CTX_GENERIC, StateRequirement::High),
        name: len(1, 64),
    },
];

pub(crate) fn find_key_mgmt(value: i32) -> KernelResult<&'static KeyMgmtAcl> {
    let item = KeyItem::from_value(value).ok_or(KernelError::BadArgument(ArgPosition::Value))?;
    KEY_MGMT
        .iter()
        .find(|acl| acl.item == item)
        .ok_or(KernelError::BadArgument(ArgPosition::Value))
}

// ---------------------------------------------------------------------------
// Certificate management
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy)]
pub(crate) struct CertMgmtAcl {
    pub action: CertAction,
    pub ca_key: ObjectParam,
    pub request: ObjectParam,
}

pub(crate) static CERT_MGMT: &[CertMgmtAcl] = &[
    CertMgmtAcl {
        action: CertAction::Issue,
        ca_key: object(SubType::CTX_PKC, StateRequirement::High),
        request: object(SubType::CERT_REQUEST, StateRequirement::High),
    },
    CertMgmtAcl {
        action: CertAction::Revoke,
        ca_key: object(SubType::CTX_PKC, StateRequirement::High),
        request: object(SubType::CERT_CERTIFICATE, StateRequirement::High),
    },
];

pub(crate) fn find_cert_mgmt(value: i32) -> KernelResult<&'static CertMgmtAcl> {
    let action = CertAction::from_value(value).ok_or(KernelError::BadArgument(ArgPosition::Value))?;
    CERT_MGMT
        .iter()
        .find(|acl| acl.action == action)
        .ok_or(KernelError::BadArgument(ArgPosition::Value))
}

// ---------------------------------------------------------------------------
// Object creation
// ---------------------------------------------------------------------------

/// Which subtypes each kind of device may create.
#[derive(Debug, Clone, Copy)]
pub(crate) struct CreateAcl {
    pub device: SubType,
    pub creatable: SubType,
}

pub(crate) static CREATE: &[CreateAcl] = &[
    CreateAcl {
        device: SubType::DEV_SYSTEM,
        creatable: SubType::all()
            .difference(SubType::DEV_SYSTEM)
            .difference(SubType::USER_SO),
    },
    CreateAcl {
        device: SubType::DEV_HARDWARE,
        creatable: SubType::CTX_CONV
            .union(SubType::CTX_GENERIC)
            .union(SubType::CTX_HASH),
    },
];

pub(crate) fn creatable_by(device: SubType) -> SubType {
    CREATE
        .iter()
        .find(|acl| acl.device == device)
        .map_or(SubType::empty(), |acl| acl.creatable)
}

// ---------------------------------------------------------------------------
// Self-check
// ---------------------------------------------------------------------------

fn check_param(param: &ObjectParam) -> bool {
    valid_subtypes(param.subtypes) && SubType::CTX_ANY.union(SubType::CERT_ANY).contains(param.subtypes)
}

fn check_len(range: LengthRange) -> bool {
    range.min <= range.max
}

pub(crate) fn check_tables() -> Result<(), AclDefect> {
    for (i, acl) in WRAP.iter().enumerate() {
        let ok = matches!(acl.kind, MessageKind::DevExport | MessageKind::DevImport)
            && check_param(&acl.key_context)
            && check_param(&acl.wrap_context)
            && check_len(acl.wrapped)
            && WRAP[..i].iter().all(|other| other.kind != acl.kind);
        if !ok {
            return Err(AclDefect::new("wrap mechanism", i, "malformed entry"));
        }
    }
    let d = &DERIVE;
    if !(check_len(d.input) && check_len(d.salt) && check_len(d.output))
        || d.min_iterations == 0
        || d.min_iterations > d.max_iterations
    {
        return Err(AclDefect::new("derive mechanism", 0, "malformed range"));
    }
    for (i, acl) in KEY_MGMT.iter().enumerate() {
        if !check_param(&acl.object) || !check_len(acl.name) || acl.name.min == 0 {
            return Err(AclDefect::new("key management", i, "malformed entry"));
        }
    }
    for (i, acl) in CERT_MGMT.iter().enumerate() {
        if !check_param(&acl.ca_key) || !check_param(&acl.request) {
            return Err(AclDefect::new("certificate management", i, "malformed entry"));
        }
    }
    for (i, acl) in CREATE.iter().enumerate() {
        if !SubType::DEV_ANY.contains(acl.device)
            || acl.device.bits().count_ones() != 1
            || !valid_subtypes(acl.creatable)
            || acl.creatable.contains(SubType::DEV_SYSTEM)
        {
            return Err(AclDefect::new("create", i, "malformed entry"));
        }
    }
    Ok(())
}
