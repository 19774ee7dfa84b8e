//! Deferred messages for objects already busy on the sending thread.

use std::collections::VecDeque;

use crate::acl::message::MessageHandling;
use crate::error::{KernelError, KernelResult};
use crate::message::{MessageKind, Origin, OwnedPayload};
use crate::types::{Handle, ObjectRef};

#[derive(Debug)]
pub(crate) struct QueuedMessage {
    pub object: ObjectRef,
    pub kind: MessageKind,
    pub value: i32,
    pub payload: OwnedPayload,
    pub origin: Origin,
    pub handling: &'static MessageHandling,
}

/// FIFO across all objects. Entries for one object keep their order.
#[derive(Debug)]
pub(crate) struct MessageQueue {
    entries: VecDeque<QueuedMessage>,
    max_len: usize,
}

impl MessageQueue {
    pub(crate) fn new(max_len: usize) -> Self {
        Self {
            entries: VecDeque::new(),
            max_len,
        }
    }

    pub(crate) fn enqueue(&mut self, message: QueuedMessage) -> KernelResult<()> {
        if self.entries.len() >= self.max_len {
            log::warn!("message queue full, refusing {:?} for {}", message.kind, message.object.handle);
            return Err(KernelError::Overflow);
        }
        self.entries.push_back(message);
        Ok(())
    }

    /// The oldest entry for `handle`, left in place.
    pub(crate) fn peek_for(&self, handle: Handle) -> Option<&QueuedMessage> {
        self.entries.iter().find(|m| m.object.handle == handle)
    }

    /// Remove and return the oldest entry for `handle`.
    pub(crate) fn next_for(&mut self, handle: Handle) -> Option<QueuedMessage> {
        let pos = self.entries.iter().position(|m| m.object.handle == handle)?;
        self.entries.remove(pos)
    }

    /// Drop every entry for `handle`. Returns how many were dropped.
    pub(crate) fn discard(&mut self, handle: Handle) -> usize {
        let before = self.entries.len();
        self.entries.retain(|m| m.object.handle != handle);
        before - self.entries.len()
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::acl::message::lookup;

    fn queued(handle: u32, value: i32) -> QueuedMessage {
        QueuedMessage {
            object: ObjectRef {
                handle: Handle::from_raw(handle),
                unique_id: 1,
            },
            kind: MessageKind::SetAttribute,
            value,
            payload: OwnedPayload::Int(value),
            origin: Origin::Internal,
            handling: lookup(MessageKind::SetAttribute),
        }
    }

    #[test]
    fn test_per_object_order_is_kept() {
        let mut q = MessageQueue::new(8);
        q.enqueue(queued(5, 1)).unwrap();
        q.enqueue(queued(6, 2)).unwrap();
        q.enqueue(queued(5, 3)).unwrap();

        assert_eq!(q.peek_for(Handle::from_raw(5)).unwrap().value, 1);
        assert_eq!(q.next_for(Handle::from_raw(5)).unwrap().value, 1);
        assert_eq!(q.next_for(Handle::from_raw(5)).unwrap().value, 3);
        assert!(q.next_for(Handle::from_raw(5)).is_none());
        assert_eq!(q.len(), 1);
    }

    #[test]
    fn test_discard_and_capacity() {
        let mut q = MessageQueue::new(2);
        q.enqueue(queued(5, 1)).unwrap();
        q.enqueue(queued(5, 2)).unwrap();
        assert_eq!(q.enqueue(queued(7, 3)).unwrap_err(), KernelError::Overflow);

        assert_eq!(q.discard(Handle::from_raw(5)), 2);
        assert_eq!(q.len(), 0);
    }
}
