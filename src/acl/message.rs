//! Message handling table: one descriptor per [`MessageKind`].

use bitflags::bitflags;

use super::{valid_subtypes, AclDefect, StateRequirement};
use crate::error::{ArgPosition, KernelError, KernelResult};
use crate::message::{
    CertAction, CheckType, CompareType, KeyItem, MechanismType, MessageKind, Payload,
};
use crate::types::{Action, ObjectType, SubType};

/// How the dispatcher finds the object that actually handles a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Routing {
    /// The addressed object.
    Direct,
    /// The nearest object of this family along the dependency chain.
    Fixed(ObjectType),
    /// As `Fixed`, trying the second family if the first is absent.
    FixedAlt(ObjectType, ObjectType),
    /// Decided by the attribute, check or compare ACL named in `value`.
    Implicit,
}

/// Expected payload shape and meaning of `value`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ParamCheck {
    /// No payload, value ignored.
    Empty,
    /// Attribute ID in value, integer payload.
    AttrInt,
    /// Attribute ID in value, input bytes.
    AttrData,
    /// Attribute ID in value, output bytes.
    AttrOutput,
    /// Attribute ID in value, no payload.
    AttrNone,
    /// Non-empty in-place buffer.
    Buffer,
    /// Input bytes, possibly empty.
    Data,
    /// Output bytes.
    Output,
    Signature,
    /// Object type in value.
    Create,
    /// Mechanism type in value, wrap payload.
    Wrap,
    /// Mechanism type in value, derivation payload.
    Derive,
    /// Key item in value.
    KeyMgmt,
    /// Certificate action in value.
    CertMgmt,
    /// Compare type in value, input bytes.
    Compare,
    /// Check type in value, no payload.
    Check,
    /// Dependent handle in the integer payload, increment flag in value.
    SetDependent,
    /// Object type in value, handle returned in the integer payload.
    GetDependent,
}

/// Checks run with the table locked, before the handler is invoked.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum PreDispatch {
    None,
    Destroy,
    Attribute,
    Action(Action),
    Compare,
    Check,
    Create,
    Mechanism,
    KeyMgmt,
    CertMgmt,
}

/// Kernel-side effects applied after a successful handler call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum PostDispatch {
    /// Decrement a finite usage count.
    UpdateUsageCount,
    /// Move the object into the high state.
    ChangeState,
    /// Move into the high state if the attribute written is a trigger.
    ChangeStateOnTrigger,
    /// Make a newly created object visible to an external creator.
    MakeExternal,
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub(crate) struct HandlingFlags: u8 {
        /// Executed by the kernel itself with the table locked.
        const INLINE        = 1 << 0;
        /// Refused from external callers.
        const INTERNAL_ONLY = 1 << 1;
        /// Still accepted while the kernel shuts down.
        const SHUTDOWN_OK   = 1 << 2;
    }
}

#[derive(Debug, Clone, Copy)]
pub(crate) struct MessageHandling {
    pub kind: MessageKind,
    pub routing: Routing,
    pub subtypes: SubType,
    pub param: ParamCheck,
    pub state: StateRequirement,
    pub flags: HandlingFlags,
    pub pre: PreDispatch,
    pub post: &'static [PostDispatch],
}

const fn handling(kind: MessageKind, routing: Routing, subtypes: SubType, param: ParamCheck) -> MessageHandling {
    MessageHandling {
        kind,
        routing,
        subtypes,
        param,
        state: StateRequirement::Any,
        flags: HandlingFlags::empty(),
        pre: PreDispatch::None,
        post: &[],
    }
}

impl MessageHandling {
    const fn state(mut self, state: StateRequirement) -> Self {
        self.state = state;
        self
    }

    const fn flags(mut self, flags: HandlingFlags) -> Self {
        self.flags = flags;
        self
    }

    const fn pre(mut self, pre: PreDispatch) -> Self {
        self.pre = pre;
        self
    }

    const fn post(mut self, post: &'static [PostDispatch]) -> Self {
        self.post = post;
        self
    }

    pub(crate) fn is_inline(&self) -> bool {
        self.flags.contains(HandlingFlags::INLINE)
    }
}

use HandlingFlags as F;
use MessageKind as K;
use ParamCheck as P;
use Routing::{Direct, Fixed, FixedAlt, Implicit};

const ALL: SubType = SubType::all();
const SET_STATE: &[PostDispatch] = &[PostDispatch::ChangeStateOnTrigger];
const CRYPT_POST: &[PostDispatch] = &[PostDispatch::UpdateUsageCount];
const CREATE_POST: &[PostDispatch] = &[PostDispatch::MakeExternal];

/// Indexed by [`MessageKind::index`].
pub(crate) static TABLE: &[MessageHandling] = &[
    handling(K::Destroy, Direct, ALL, P::Empty)
        .flags(F::SHUTDOWN_OK)
        .pre(PreDispatch::Destroy),
    handling(K::IncRefCount, Direct, ALL, P::Empty).flags(F::INLINE.union(F::INTERNAL_ONLY)),
    handling(K::DecRefCount, Direct, ALL, P::Empty).flags(F::INLINE.union(F::SHUTDOWN_OK)),
    handling(K::GetDependent, Direct, ALL, P::GetDependent)
        .flags(F::INLINE.union(F::INTERNAL_ONLY)),
    handling(K::SetDependent, Direct, ALL, P::SetDependent).flags(F::INLINE),
    handling(K::GetAttribute, Implicit, ALL, P::AttrInt).pre(PreDispatch::Attribute),
    handling(K::GetAttributeS, Implicit, ALL, P::AttrOutput).pre(PreDispatch::Attribute),
    handling(K::SetAttribute, Implicit, ALL, P::AttrInt)
        .pre(PreDispatch::Attribute)
        .post(SET_STATE),
    handling(K::SetAttributeS, Implicit, ALL, P::AttrData)
        .pre(PreDispatch::Attribute)
        .post(SET_STATE),
    handling(K::DeleteAttribute, Implicit, ALL, P::AttrNone).pre(PreDispatch::Attribute),
    handling(
        K::Compare,
        Implicit,
        SubType::CTX_ANY.union(SubType::CERT_ANY),
        P::Compare,
    )
    .pre(PreDispatch::Compare),
    handling(
        K::Check,
        Implicit,
        SubType::CTX_ANY.union(SubType::CERT_ANY),
        P::Check,
    )
    .pre(PreDispatch::Check),
    handling(K::CtxEncrypt, Fixed(ObjectType::Context), SubType::CTX_CONV, P::Buffer)
        .state(StateRequirement::High)
        .pre(PreDispatch::Action(Action::Encrypt))
        .post(CRYPT_POST),
    handling(K::CtxDecrypt, Fixed(ObjectType::Context), SubType::CTX_CONV, P::Buffer)
        .state(StateRequirement::High)
        .pre(PreDispatch::Action(Action::Decrypt))
        .post(CRYPT_POST),
    handling(K::CtxSign, Fixed(ObjectType::Context), SubType::CTX_PKC, P::Signature)
        .state(StateRequirement::High)
        .pre(PreDispatch::Action(Action::Sign))
        .post(CRYPT_POST),
    handling(K::CtxSigCheck, Fixed(ObjectType::Context), SubType::CTX_PKC, P::Signature)
        .state(StateRequirement::High)
        .pre(PreDispatch::Action(Action::SigCheck))
        .post(CRYPT_POST),
    handling(
        K::CtxHash,
        Fixed(ObjectType::Context),
        SubType::CTX_HASH.union(SubType::CTX_MAC),
        P::Data,
    )
    .pre(PreDispatch::Action(Action::Hash)),
    handling(
        K::CtxGenKey,
        Direct,
        SubType::CTX_CONV
            .union(SubType::CTX_PKC)
            .union(SubType::CTX_MAC)
            .union(SubType::CTX_GENERIC),
        P::Empty,
    )
    .state(StateRequirement::Low)
    .pre(PreDispatch::Action(Action::GenKey))
    .post(&[PostDispatch::ChangeState]),
    handling(K::CtxGenIv, Direct, SubType::CTX_CONV, P::Empty),
    handling(K::EnvPushData, Direct, SubType::ENV_ANY, P::Data),
    handling(K::EnvPopData, Direct, SubType::ENV_ANY, P::Output),
    handling(K::DevCreateObject, Fixed(ObjectType::Device), SubType::DEV_ANY, P::Create)
        .pre(PreDispatch::Create)
        .post(CREATE_POST),
    handling(K::DevExport, Fixed(ObjectType::Device), SubType::DEV_ANY, P::Wrap)
        .pre(PreDispatch::Mechanism),
    handling(K::DevImport, Fixed(ObjectType::Device), SubType::DEV_ANY, P::Wrap)
        .pre(PreDispatch::Mechanism),
    handling(K::DevDerive, Fixed(ObjectType::Device), SubType::DEV_ANY, P::Derive)
        .pre(PreDispatch::Mechanism),
    handling(
        K::KeyGetKey,
        FixedAlt(ObjectType::Keyset, ObjectType::Device),
        SubType::KEYSET_ANY.union(SubType::DEV_HARDWARE),
        P::KeyMgmt,
    )
    .pre(PreDispatch::KeyMgmt),
    handling(
        K::KeySetKey,
        FixedAlt(ObjectType::Keyset, ObjectType::Device),
        SubType::KEYSET_ANY.union(SubType::DEV_HARDWARE),
        P::KeyMgmt,
    )
    .pre(PreDispatch::KeyMgmt),
    handling(
        K::KeyDeleteKey,
        FixedAlt(ObjectType::Keyset, ObjectType::Device),
        SubType::KEYSET_ANY.union(SubType::DEV_HARDWARE),
        P::KeyMgmt,
    )
    .pre(PreDispatch::KeyMgmt),
    handling(K::UserCertMgmt, Direct, SubType::USER_CA, P::CertMgmt)
        .pre(PreDispatch::CertMgmt)
        .post(CREATE_POST),
];

pub(crate) fn lookup(kind: MessageKind) -> &'static MessageHandling {
    &TABLE[kind.index()]
}

fn bad(position: ArgPosition) -> KernelError {
    KernelError::BadArgument(position)
}

fn expect(ok: bool, position: ArgPosition) -> KernelResult<()> {
    if ok {
        Ok(())
    } else {
        Err(bad(position))
    }
}

/// Check the payload shape and the enumerated part of `value`. Attribute
/// IDs are checked later against the attribute table.
pub(crate) fn check_param(param: ParamCheck, value: i32, payload: &Payload<'_>) -> KernelResult<()> {
    use ArgPosition::{Num1, Str1, Value};
    match param {
        P::Empty | P::AttrNone | P::Check => expect(matches!(payload, Payload::None), Str1)?,
        P::AttrInt | P::SetDependent | P::GetDependent => {
            expect(matches!(payload, Payload::Int(_)), Str1)?
        }
        P::AttrData | P::Data | P::Compare => expect(matches!(payload, Payload::Data(_)), Str1)?,
        P::AttrOutput | P::Output => expect(matches!(payload, Payload::Output(_)), Str1)?,
        P::Buffer => expect(matches!(payload, Payload::Buffer(b) if !b.is_empty()), Str1)?,
        P::Signature => expect(matches!(payload, Payload::Signature(_)), Str1)?,
        P::Create => expect(matches!(payload, Payload::Create(_)), Str1)?,
        P::Wrap => expect(matches!(payload, Payload::Wrap(_)), Str1)?,
        P::Derive => expect(matches!(payload, Payload::Derive(_)), Str1)?,
        P::KeyMgmt => expect(matches!(payload, Payload::KeyMgmt(_)), Str1)?,
        P::CertMgmt => expect(matches!(payload, Payload::CertMgmt(_)), Str1)?,
    }
    match param {
        P::Create | P::GetDependent => expect(ObjectType::from_value(value).is_some(), Value),
        P::Wrap => expect(MechanismType::from_value(value) == Some(MechanismType::Wrap), Value),
        P::Derive => expect(MechanismType::from_value(value) == Some(MechanismType::Derive), Value),
        P::KeyMgmt => expect(KeyItem::from_value(value).is_some(), Value),
        P::CertMgmt => expect(CertAction::from_value(value).is_some(), Value),
        P::Compare => expect(CompareType::from_value(value).is_some(), Value),
        P::Check => expect(CheckType::from_value(value).is_some(), Value),
        P::SetDependent => expect(value == 0 || value == 1, Num1),
        _ => Ok(()),
    }
}

// ---------------------------------------------------------------------------
// Self-check
// ---------------------------------------------------------------------------

pub(crate) fn check_table(table: &[MessageHandling]) -> Result<(), AclDefect> {
    const NAME: &str = "message";
    if table.len() != MessageKind::ALL.len() {
        return Err(AclDefect::new(NAME, table.len(), "table does not cover every message"));
    }
    for (i, entry) in table.iter().enumerate() {
        let defect = |problem| Err(AclDefect::new(NAME, i, problem));
        if entry.kind.index() != i {
            return defect("entry out of position");
        }
        if !valid_subtypes(entry.subtypes) {
            return defect("empty or unknown subtype mask");
        }
        let reachable = match entry.routing {
            Fixed(t) => t.subtypes(),
            FixedAlt(a, b) => a.subtypes() | b.subtypes(),
            Direct | Implicit => ALL,
        };
        if !reachable.contains(entry.subtypes) {
            return defect("subtypes outside the routing target family");
        }
        if entry.is_inline() && entry.routing != Direct {
            return defect("inline messages are never routed");
        }
        if entry.is_inline() && (entry.pre != PreDispatch::None || !entry.post.is_empty()) {
            return defect("inline messages have no dispatch hooks");
        }
        let attribute_param = matches!(entry.param, P::AttrInt | P::AttrData | P::AttrOutput | P::AttrNone);
        if attribute_param != entry.kind.is_attribute()
            || attribute_param != (entry.pre == PreDispatch::Attribute)
        {
            return defect("attribute messages must use attribute parameters and checks");
        }
        if entry.routing == Implicit
            && !(attribute_param || matches!(entry.param, P::Check | P::Compare))
        {
            return defect("implicit routing needs an ACL to route by");
        }
        if entry.post.contains(&PostDispatch::UpdateUsageCount)
            && !matches!(entry.pre, PreDispatch::Action(_))
        {
            return defect("usage count updated without an action check");
        }
    }
    Ok(())
}
