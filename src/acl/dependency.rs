//! Which objects may depend on which.

use bitflags::bitflags;

use super::{valid_subtypes, AclDefect};
use crate::message::key_usage;
use crate::types::{Action, ActionPermissions, ObjectType, PermLevel, SubType};

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub(crate) struct DependencyFlags: u8 {
        /// Attaching the dependent narrows the object's action permissions
        /// to what the dependent certificate allows.
        const PROPAGATE_PERMS = 1 << 0;
    }
}

#[derive(Debug, Clone, Copy)]
pub(crate) struct DependencyAcl {
    /// Subtypes of the object gaining the dependency.
    pub object: SubType,
    /// Subtypes it may depend on.
    pub dependent: SubType,
    pub flags: DependencyFlags,
}

const fn rule(object: SubType, dependent: SubType) -> DependencyAcl {
    DependencyAcl {
        object,
        dependent,
        flags: DependencyFlags::empty(),
    }
}

const CERT_WITH_KEY: SubType = SubType::CERT_CERTIFICATE
    .union(SubType::CERT_CHAIN)
    .union(SubType::CERT_REQUEST);

pub(crate) static TABLE: &[DependencyAcl] = &[
    rule(SubType::CTX_ANY, SubType::DEV_ANY),
    DependencyAcl {
        object: SubType::CTX_PKC,
        dependent: CERT_WITH_KEY,
        flags: DependencyFlags::PROPAGATE_PERMS,
    },
    rule(SubType::CERT_ANY, SubType::CTX_PKC),
    rule(
        SubType::ENV_ANY,
        SubType::CTX_CONV
            .union(SubType::CTX_HASH)
            .union(SubType::CTX_MAC)
            .union(SubType::CTX_PKC),
    ),
    rule(SubType::SESSION_ANY, SubType::CTX_PKC.union(SubType::CTX_CONV)),
    rule(
        SubType::SESSION_ANY,
        SubType::CERT_CERTIFICATE.union(SubType::CERT_CHAIN),
    ),
    rule(SubType::KEYSET_ANY, SubType::DEV_ANY),
    rule(SubType::DEV_HARDWARE, SubType::DEV_SYSTEM),
    rule(SubType::USER_ANY, SubType::KEYSET_MEMORY),
];

/// The rule allowing `object` to depend on `dependent`, if any.
pub(crate) fn find(object: SubType, dependent: SubType) -> Option<&'static DependencyAcl> {
    TABLE
        .iter()
        .find(|r| r.object.contains(object) && r.dependent.contains(dependent))
}

/// Dependency on a device goes in the device slot, anything else in the
/// object slot.
pub(crate) fn uses_device_slot(dependent: SubType) -> bool {
    SubType::DEV_ANY.contains(dependent)
}

/// The action permissions a certificate's key usage allows its key.
pub(crate) fn permissions_for_key_usage(usage: i32) -> ActionPermissions {
    let signing = key_usage::DIGITAL_SIGNATURE
        | key_usage::NON_REPUDIATION
        | key_usage::KEY_CERT_SIGN
        | key_usage::CRL_SIGN;
    let encryption = key_usage::KEY_ENCIPHERMENT | key_usage::DATA_ENCIPHERMENT;

    let mut perms = ActionPermissions::ALL;
    if usage & signing == 0 {
        perms = perms
            .with(Action::Sign, PermLevel::None)
            .with(Action::SigCheck, PermLevel::None);
    }
    if usage & encryption == 0 {
        perms = perms
            .with(Action::Encrypt, PermLevel::None)
            .with(Action::Decrypt, PermLevel::None);
    }
    perms
}

pub(crate) fn check_table(table: &[DependencyAcl]) -> Result<(), AclDefect> {
    const NAME: &str = "dependency";
    for (i, r) in table.iter().enumerate() {
        let defect = |problem| Err(AclDefect::new(NAME, i, problem));
        if !valid_subtypes(r.object) || !valid_subtypes(r.dependent) {
            return defect("empty or unknown subtype mask");
        }
        let same_family = ObjectType::ALL
            .into_iter()
            .any(|t| t.subtypes().intersects(r.object) && t.subtypes().intersects(r.dependent));
        if same_family && !(r.object == SubType::DEV_HARDWARE && r.dependent == SubType::DEV_SYSTEM)
        {
            return defect("same-type dependency other than device on system device");
        }
        if r.flags.contains(DependencyFlags::PROPAGATE_PERMS)
            && !(SubType::CTX_ANY.contains(r.object) && SubType::CERT_ANY.contains(r.dependent))
        {
            return defect("permission propagation needs a context and a certificate");
        }
        for other in &table[..i] {
            if other.object.intersects(r.object) && other.dependent.intersects(r.dependent) {
                return defect("overlapping dependency rules");
            }
        }
    }
    Ok(())
}
