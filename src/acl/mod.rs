//! Access-control tables.
//!
//! Every table here is static and immutable, so it is read without locking.
//! The tables are the single source of truth for which subtypes accept a
//! message, which state an object must be in, who may read, write or delete
//! an attribute, and which values are acceptable.
//!
//! [`check_tables`] walks every table once at start-up. A defect found there
//! means the kernel's own policy is inconsistent, and initialisation traps.

use bitflags::bitflags;

use crate::error::{KernelError, KernelResult};
use crate::message::Origin;
use crate::types::SubType;

pub(crate) mod attribute;
pub(crate) mod check;
pub(crate) mod dependency;
pub(crate) mod mechanism;
pub(crate) mod message;

/// Operation bits used when building [`AccessFlags`].
pub(crate) mod ops {
    pub const NONE: u16 = 0;
    pub const R: u16 = 0b001;
    pub const W: u16 = 0b010;
    pub const D: u16 = 0b100;
    pub const RW: u16 = R | W;
    pub const RWD: u16 = R | W | D;
}

bitflags! {
    /// Read/write/delete permission, separately for internal and external
    /// callers and for the low and high object states.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub(crate) struct AccessFlags: u16 {
        const INT_READ_LOW    = 1 << 0;
        const INT_WRITE_LOW   = 1 << 1;
        const INT_DELETE_LOW  = 1 << 2;
        const INT_READ_HIGH   = 1 << 3;
        const INT_WRITE_HIGH  = 1 << 4;
        const INT_DELETE_HIGH = 1 << 5;
        const EXT_READ_LOW    = 1 << 6;
        const EXT_WRITE_LOW   = 1 << 7;
        const EXT_DELETE_LOW  = 1 << 8;
        const EXT_READ_HIGH   = 1 << 9;
        const EXT_WRITE_HIGH  = 1 << 10;
        const EXT_DELETE_HIGH = 1 << 11;
    }
}

/// What an attribute message does to the attribute.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Operation {
    Read,
    Write,
    Delete,
}

impl Operation {
    const fn bit(self) -> u16 {
        match self {
            Self::Read => ops::R,
            Self::Write => ops::W,
            Self::Delete => ops::D,
        }
    }
}

impl AccessFlags {
    /// Build from per-quadrant [`ops`] bits.
    pub(crate) const fn grant(int_low: u16, int_high: u16, ext_low: u16, ext_high: u16) -> Self {
        Self::from_bits_truncate(int_low | (int_high << 3) | (ext_low << 6) | (ext_high << 9))
    }

    /// The same access for internal and external callers.
    pub(crate) const fn both(low: u16, high: u16) -> Self {
        Self::grant(low, high, low, high)
    }

    /// Internal callers only.
    pub(crate) const fn internal(low: u16, high: u16) -> Self {
        Self::grant(low, high, ops::NONE, ops::NONE)
    }

    pub(crate) fn permits(self, origin: Origin, high: bool, op: Operation) -> bool {
        let shift = match (origin, high) {
            (Origin::Internal, false) => 0,
            (Origin::Internal, true) => 3,
            (Origin::External, false) => 6,
            (Origin::External, true) => 9,
        };
        self.bits() & (op.bit() << shift) != 0
    }

    /// Check an operation, distinguishing "wrong state" from "never allowed".
    pub(crate) fn check(self, origin: Origin, high: bool, op: Operation) -> KernelResult<()> {
        if self.permits(origin, high, op) {
            return Ok(());
        }
        if self.permits(origin, !high, op) {
            // Allowed, just not in the object's current state.
            return Err(if high {
                KernelError::Permission
            } else {
                KernelError::NotInitialised
            });
        }
        Err(KernelError::Permission)
    }
}

/// The object state a message needs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum StateRequirement {
    Any,
    Low,
    High,
}

impl StateRequirement {
    pub(crate) fn check(self, high: bool) -> KernelResult<()> {
        match (self, high) {
            (Self::Low, true) => Err(KernelError::Permission),
            (Self::High, false) => Err(KernelError::NotInitialised),
            _ => Ok(()),
        }
    }
}

/// A problem found in one of the static tables.
#[derive(Debug, thiserror::Error)]
#[error("{table} table entry {index}: {problem}")]
pub(crate) struct AclDefect {
    pub table: &'static str,
    pub index: usize,
    pub problem: &'static str,
}

impl AclDefect {
    pub(crate) fn new(table: &'static str, index: usize, problem: &'static str) -> Self {
        Self {
            table,
            index,
            problem,
        }
    }
}

/// True if `mask` is non-empty and names only real subtypes.
pub(crate) fn valid_subtypes(mask: SubType) -> bool {
    !mask.is_empty() && SubType::all().contains(mask)
}

/// True if no two masks share a subtype.
pub(crate) fn disjoint<'a>(masks: impl IntoIterator<Item = &'a SubType>) -> bool {
    let mut seen = SubType::empty();
    for mask in masks {
        if seen.intersects(*mask) {
            return false;
        }
        seen |= *mask;
    }
    true
}

/// Verify every static ACL table.
pub(crate) fn check_tables() -> Result<(), AclDefect> {
    attribute::check_table(attribute::TABLE)?;
    message::check_table(message::TABLE)?;
    dependency::check_table(dependency::TABLE)?;
    check::check_tables()?;
    mechanism::check_tables()?;
    Ok(())
}
