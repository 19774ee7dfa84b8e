//! The object table and its handle permutation.
//!
//! Free slots are found by stepping a maximal-length LFSR over the table, so
//! the handle a new object receives is not the next free index. Reused slots
//! are always told apart by their unique ID.

use std::sync::Arc;
use std::thread::{self, ThreadId};

use crate::error::{kernel_trap, KernelError, KernelResult};
use crate::objects::ObjectBody;
use crate::types::{
    ActionPermissions, Handle, ObjectFlags, ObjectRef, ObjectType, SubType, RESERVED_HANDLES,
};

/// Primitive polynomials for each supported table size. The top bit of each
/// is the table size itself.
const LFSR_POLYNOMIALS: [(usize, usize); 10] = [
    (128, 0x83),
    (256, 0x11D),
    (512, 0x211),
    (1024, 0x409),
    (2048, 0x805),
    (4096, 0x1053),
    (8192, 0x201B),
    (16384, 0x402B),
    (32768, 0x8003),
    (65536, 0x1002D),
];

/// Walks every non-zero value below the table size exactly once per cycle.
#[derive(Debug, Clone)]
pub(crate) struct HandleSequence {
    value: usize,
    mask: usize,
    poly: usize,
}

impl HandleSequence {
    pub(crate) fn new(size: usize, seed: usize) -> Self {
        let poly = LFSR_POLYNOMIALS
            .iter()
            .find(|(s, _)| *s == size)
            .map(|(_, p)| *p)
            .unwrap_or_else(|| kernel_trap!("no handle permutation for table size {size}"));
        let mut value = seed & (size - 1);
        if value < RESERVED_HANDLES {
            value = RESERVED_HANDLES + 42;
        }
        Self {
            value,
            mask: size,
            poly,
        }
    }

    pub(crate) fn step(&mut self) -> usize {
        self.value <<= 1;
        if self.value & self.mask != 0 {
            self.value ^= self.poly;
        }
        self.value
    }

    /// The same walk over a table twice the size, continuing from here.
    fn doubled(&self) -> Self {
        Self::new(self.mask * 2, self.value)
    }
}

/// A time-derived starting point for the permutation.
pub(crate) fn time_seed() -> usize {
    let now = chrono::Utc::now();
    (now.timestamp_subsec_nanos() as usize) ^ (now.timestamp() as usize)
}

/// An edge to another object.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Dependency {
    pub target: ObjectRef,
    /// Holds a reference on the target, released on destroy.
    pub counted: bool,
}

pub(crate) struct ObjectRecord {
    pub object_type: ObjectType,
    pub subtype: SubType,
    pub flags: ObjectFlags,
    pub action_perms: ActionPermissions,
    /// Messages in progress. Non-zero means in use by `lock_owner`.
    pub lock_count: u32,
    pub lock_owner: Option<ThreadId>,
    /// Thread the object is bound to, if any.
    pub owner_thread: Option<ThreadId>,
    pub ref_count: u32,
    /// Remaining ownership transfers, `None` for unlimited.
    pub forward_count: Option<u32>,
    /// Remaining uses, `None` for unlimited.
    pub usage_count: Option<u32>,
    pub unique_id: u64,
    /// The object that created this one.
    pub owner: Option<Handle>,
    pub dependent_object: Option<Dependency>,
    pub dependent_device: Option<Dependency>,
    pub body: Arc<ObjectBody>,
}

impl ObjectRecord {
    pub(crate) fn is_high(&self) -> bool {
        self.flags.contains(ObjectFlags::HIGH)
    }

    pub(crate) fn is_internal(&self) -> bool {
        self.flags.contains(ObjectFlags::INTERNAL)
    }

    /// Not initialised yet, or signalled.
    pub(crate) fn is_invalid_state(&self) -> bool {
        self.flags
            .intersects(ObjectFlags::NOT_INITED | ObjectFlags::SIGNALLED)
    }

    /// The error a message to an object in an invalid state receives.
    pub(crate) fn state_error(&self) -> KernelError {
        if self.flags.contains(ObjectFlags::SIGNALLED) {
            KernelError::Signalled
        } else {
            KernelError::NotInitialised
        }
    }

    pub(crate) fn in_use(&self) -> bool {
        self.lock_count > 0
    }

    pub(crate) fn in_use_by_current(&self) -> bool {
        self.in_use() && self.lock_owner == Some(thread::current().id())
    }

    /// In use by a thread other than the caller.
    pub(crate) fn busy_elsewhere(&self) -> bool {
        self.in_use() && !self.in_use_by_current()
    }

    /// Bound to a thread other than the caller.
    pub(crate) fn owned_elsewhere(&self) -> bool {
        self.flags.contains(ObjectFlags::OWNED)
            && self.owner_thread != Some(thread::current().id())
    }

    pub(crate) fn dependencies(&self) -> impl Iterator<Item = Dependency> {
        self.dependent_object.into_iter().chain(self.dependent_device)
    }
}

impl std::fmt::Debug for ObjectRecord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ObjectRecord")
            .field("object_type", &self.object_type)
            .field("subtype", &self.subtype)
            .field("flags", &self.flags)
            .field("lock_count", &self.lock_count)
            .field("ref_count", &self.ref_count)
            .field("unique_id", &self.unique_id)
            .finish_non_exhaustive()
    }
}

#[derive(Debug)]
pub(crate) struct ObjectTable {
    slots: Vec<Option<ObjectRecord>>,
    sequence: HandleSequence,
    max_size: usize,
    next_unique_id: u64,
    /// Reserved handles are handed out once, in order.
    reserved_assigned: usize,
    live: usize,
}

impl ObjectTable {
    pub(crate) fn new(initial_size: usize, max_size: usize, seed: usize) -> Self {
        let mut slots = Vec::with_capacity(initial_size);
        slots.resize_with(initial_size, || None);
        Self {
            slots,
            sequence: HandleSequence::new(initial_size, seed),
            max_size,
            next_unique_id: 1,
            reserved_assigned: 0,
            live: 0,
        }
    }

    pub(crate) fn size(&self) -> usize {
        self.slots.len()
    }

    pub(crate) fn len(&self) -> usize {
        self.live
    }

    pub(crate) fn get(&self, handle: Handle) -> Option<&ObjectRecord> {
        self.slots.get(handle.index()).and_then(Option::as_ref)
    }

    pub(crate) fn get_mut(&mut self, handle: Handle) -> Option<&mut ObjectRecord> {
        self.slots.get_mut(handle.index()).and_then(Option::as_mut)
    }

    /// The record, provided it is still the object `object` referred to.
    pub(crate) fn get_ref(&self, object: ObjectRef) -> Option<&ObjectRecord> {
        self.get(object.handle)
            .filter(|r| r.unique_id == object.unique_id)
    }

    pub(crate) fn get_ref_mut(&mut self, object: ObjectRef) -> Option<&mut ObjectRecord> {
        self.get_mut(object.handle)
            .filter(|r| r.unique_id == object.unique_id)
    }

    pub(crate) fn object_ref(&self, handle: Handle) -> Option<ObjectRef> {
        self.get(handle).map(|r| ObjectRef {
            handle,
            unique_id: r.unique_id,
        })
    }

    pub(crate) fn handles(&self) -> Vec<Handle> {
        self.slots
            .iter()
            .enumerate()
            .filter(|(_, slot)| slot.is_some())
            .map(|(i, _)| Handle::from_raw(i as u32))
            .collect()
    }

    /// Place a record in a free slot, assigning its unique ID. Returns the
    /// handle and the new table size if the table had to grow.
    pub(crate) fn insert(&mut self, mut record: ObjectRecord) -> KernelResult<(Handle, Option<usize>)> {
        let (index, grown) = self.free_slot()?;
        record.unique_id = self.next_unique_id;
        self.next_unique_id = self
            .next_unique_id
            .checked_add(1)
            .unwrap_or_else(|| kernel_trap!("object unique IDs exhausted"));
        self.slots[index] = Some(record);
        self.live += 1;
        Ok((Handle::from_raw(index as u32), grown))
    }

    pub(crate) fn remove(&mut self, handle: Handle) -> Option<ObjectRecord> {
        let record = self.slots.get_mut(handle.index())?.take()?;
        self.live -= 1;
        Some(record)
    }

    fn free_slot(&mut self) -> KernelResult<(usize, Option<usize>)> {
        if self.reserved_assigned < RESERVED_HANDLES {
            let index = self.reserved_assigned;
            if self.slots[index].is_some() {
                kernel_trap!("reserved handle {index} already occupied");
            }
            self.reserved_assigned += 1;
            return Ok((index, None));
        }

        // One full cycle visits every non-zero index.
        for _ in 0..self.size() {
            let index = self.sequence.step();
            if index >= RESERVED_HANDLES && self.slots[index].is_none() {
                return Ok((index, None));
            }
        }

        let new_size = self.size() * 2;
        if new_size > self.max_size {
            return Err(KernelError::Overflow);
        }
        self.slots.resize_with(new_size, || None);
        self.sequence = self.sequence.doubled();
        loop {
            let index = self.sequence.step();
            if index >= RESERVED_HANDLES && self.slots[index].is_none() {
                return Ok((index, Some(new_size)));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_sequence_visits_every_nonzero_value() {
        for (size, _) in LFSR_POLYNOMIALS.iter().take(5) {
            let mut seq = HandleSequence::new(*size, 77);
            let seen: HashSet<usize> = (0..size - 1).map(|_| seq.step()).collect();
            assert_eq!(seen.len(), size - 1, "size {size}");
            assert!(!seen.contains(&0));
            assert!(seen.iter().all(|v| v < size));
        }
    }

    #[test]
    fn test_low_seed_is_moved_off_reserved_handles() {
        let seq = HandleSequence::new(128, 1);
        assert_eq!(seq.value, RESERVED_HANDLES + 42);
    }

    #[test]
    fn test_doubling_stays_in_range() {
        let mut seq = HandleSequence::new(128, 100).doubled();
        for _ in 0..255 {
            let v = seq.step();
            assert!(v > 0 && v < 256);
        }
    }
}
