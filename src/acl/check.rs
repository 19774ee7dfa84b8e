//! Capability checks and comparisons.

use super::{valid_subtypes, AclDefect, StateRequirement};
use crate::error::{ArgPosition, KernelError, KernelResult};
use crate::message::{key_usage, CheckType, CompareType};
use crate::types::{Action, ObjectType, SubType};

#[derive(Debug, Clone, Copy)]
pub(crate) struct CheckAcl {
    pub check: CheckType,
    pub subtypes: SubType,
    /// Action that must be permitted, if any.
    pub action: Option<Action>,
    pub state: StateRequirement,
    pub routing: Option<ObjectType>,
    /// Answered by the object rather than the kernel, with the key usage
    /// bits it must have.
    pub delegate_usage: Option<i32>,
}

const fn check(
    check: CheckType,
    subtypes: SubType,
    action: Option<Action>,
    state: StateRequirement,
) -> CheckAcl {
    CheckAcl {
        check,
        subtypes,
        action,
        state,
        routing: None,
        delegate_usage: None,
    }
}

impl CheckAcl {
    const fn routed(mut self, target: ObjectType) -> Self {
        self.routing = Some(target);
        self
    }

    const fn delegated(mut self, usage: i32) -> Self {
        self.delegate_usage = Some(usage);
        self
    }
}

use CheckType as C;
use StateRequirement::{Any, High, Low};

const CERT_WITH_KEY: SubType = SubType::CERT_CERTIFICATE.union(SubType::CERT_CHAIN);

/// In [`CheckType`] order.
pub(crate) static CHECKS: &[CheckAcl] = &[
    check(C::Crypt, SubType::CTX_CONV, Some(Action::Encrypt), High),
    check(C::Hash, SubType::CTX_HASH, Some(Action::Hash), Any),
    check(C::Mac, SubType::CTX_MAC, Some(Action::Hash), High),
    check(C::Pkc, SubType::CTX_PKC, None, High),
    check(C::PkcPrivate, SubType::CTX_PKC, Some(Action::Sign), High),
    check(C::Encrypt, SubType::CTX_CONV, Some(Action::Encrypt), High),
    check(C::Decrypt, SubType::CTX_CONV, Some(Action::Decrypt), High),
    check(C::Sign, SubType::CTX_PKC, Some(Action::Sign), High).routed(ObjectType::Context),
    check(C::SigCheck, SubType::CTX_PKC, Some(Action::SigCheck), High).routed(ObjectType::Context),
    check(
        C::KeyGen,
        SubType::CTX_CONV
            .union(SubType::CTX_MAC)
            .union(SubType::CTX_PKC)
            .union(SubType::CTX_GENERIC),
        Some(Action::GenKey),
        Low,
    ),
    check(C::Cert, CERT_WITH_KEY, None, High).routed(ObjectType::Certificate),
    check(C::Ca, SubType::CERT_CERTIFICATE, None, High)
        .routed(ObjectType::Certificate)
        .delegated(key_usage::KEY_CERT_SIGN),
];

#[derive(Debug, Clone, Copy)]
pub(crate) struct CompareAcl {
    pub compare: CompareType,
    pub subtypes: SubType,
    pub routing: Option<ObjectType>,
    pub min_len: usize,
    pub max_len: usize,
}

/// In [`CompareType`] order.
pub(crate) static COMPARES: &[CompareAcl] = &[
    CompareAcl {
        compare: CompareType::Hash,
        subtypes: SubType::CTX_HASH.union(SubType::CTX_MAC),
        routing: None,
        min_len: 16,
        max_len: 64,
    },
    CompareAcl {
        compare: CompareType::KeyId,
        subtypes: SubType::CTX_PKC,
        routing: Some(ObjectType::Context),
        min_len: 32,
        max_len: 32,
    },
    CompareAcl {
        compare: CompareType::Subject,
        subtypes: SubType::CERT_CERTIFICATE,
        routing: Some(ObjectType::Certificate),
        min_len: 1,
        max_len: 128,
    },
    CompareAcl {
        compare: CompareType::Fingerprint,
        subtypes: CERT_WITH_KEY,
        routing: Some(ObjectType::Certificate),
        min_len: 32,
        max_len: 32,
    },
];

pub(crate) fn find_check(value: i32) -> KernelResult<&'static CheckAcl> {
    let check = CheckType::from_value(value).ok_or(KernelError::BadArgument(ArgPosition::Value))?;
    Ok(&CHECKS[check as usize - 1])
}

pub(crate) fn find_compare(value: i32) -> KernelResult<&'static CompareAcl> {
    let compare =
        CompareType::from_value(value).ok_or(KernelError::BadArgument(ArgPosition::Value))?;
    Ok(&COMPARES[compare as usize - 1])
}

impl CompareAcl {
    pub(crate) fn check_length(&self, len: usize) -> KernelResult<()> {
        if (self.min_len..=self.max_len).contains(&len) {
            Ok(())
        } else {
            Err(KernelError::BadArgument(ArgPosition::Str1))
        }
    }
}

fn routing_ok(routing: Option<ObjectType>, subtypes: SubType) -> bool {
    routing.map_or(true, |t| t.subtypes().contains(subtypes))
}

pub(crate) fn check_tables() -> Result<(), AclDefect> {
    for (i, acl) in CHECKS.iter().enumerate() {
        let defect = |problem| Err(AclDefect::new("check", i, problem));
        if acl.check as usize != i + 1 {
            return defect("entry out of position");
        }
        if !valid_subtypes(acl.subtypes) || !routing_ok(acl.routing, acl.subtypes) {
            return defect("bad subtype mask");
        }
        if let Some(usage) = acl.delegate_usage {
            if usage & !key_usage::ALL != 0 || usage == 0 || acl.routing != Some(ObjectType::Certificate) {
                return defect("delegated checks must name certificate key usage");
            }
        }
    }
    for (i, acl) in COMPARES.iter().enumerate() {
        let defect = |problem| Err(AclDefect::new("compare", i, problem));
        if acl.compare as usize != i + 1 {
            return defect("entry out of position");
        }
        if !valid_subtypes(acl.subtypes) || !routing_ok(acl.routing, acl.subtypes) {
            return defect("bad subtype mask");
        }
        if acl.min_len == 0 || acl.min_len > acl.max_len {
            return defect("malformed length range");
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lookup_by_value() {
        assert_eq!(find_check(CheckType::Ca as i32).unwrap().check, CheckType::Ca);
        assert_eq!(
            find_compare(CompareType::KeyId as i32).unwrap().compare,
            CompareType::KeyId
        );
        assert!(find_check(0).is_err());
        assert!(find_compare(99).is_err());
    }

    #[test]
    fn test_compare_lengths() {
        let fingerprint = find_compare(CompareType::Fingerprint as i32).unwrap();
        assert!(fingerprint.check_length(32).is_ok());
        assert!(fingerprint.check_length(20).is_err());
    }
}
