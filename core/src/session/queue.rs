//! Serialized descriptor writes
//!
//! Notification enable/disable writes for one session go through a FIFO with at most one
//! write on the air. Completion of the head is what allows the next one to start.

use crate::protocol::uuids::{DISABLE_NOTIFICATION_VALUE, ENABLE_NOTIFICATION_VALUE};
use std::collections::VecDeque;
use uuid::Uuid;

/// One queued client-configuration write
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PendingWrite {
    pub characteristic: Uuid,
    pub enable: bool,
}

impl PendingWrite {
    pub fn new(characteristic: Uuid, enable: bool) -> Self {
        Self {
            characteristic,
            enable,
        }
    }

    /// Bytes written to the descriptor
    pub fn value(&self) -> [u8; 2] {
        if self.enable {
            ENABLE_NOTIFICATION_VALUE
        } else {
            DISABLE_NOTIFICATION_VALUE
        }
    }
}

#[derive(Debug, Default)]
pub struct DescriptorWriteQueue {
    queue: VecDeque<PendingWrite>,
    in_flight: bool,
}

impl DescriptorWriteQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    /// True while the head has been handed to the transport and not yet completed
    pub fn is_in_flight(&self) -> bool {
        self.in_flight
    }

    pub fn enqueue(&mut self, write: PendingWrite) {
        self.queue.push_back(write);
    }

    /// Head of the queue
    pub fn peek(&self) -> Option<&PendingWrite> {
        self.queue.front()
    }

    /// Mark the head as in flight and return it; `None` if empty or a write is already out
    pub fn start(&mut self) -> Option<PendingWrite> {
        if self.in_flight {
            return None;
        }
        let head = *self.queue.front()?;
        self.in_flight = true;
        Some(head)
    }

    /// Drop the completed head
    pub fn complete(&mut self) -> Option<PendingWrite> {
        if !self.in_flight {
            return None;
        }
        self.in_flight = false;
        self.queue.pop_front()
    }

    pub fn clear(&mut self) {
        self.queue.clear();
        self.in_flight = false;
    }
}
