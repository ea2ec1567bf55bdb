//! Service Discovery - UUID keyed directory of service queues
//!
//! Services register message queues under a UUID; a message sent to the
//! UUID is copied into every queue registered for it, in registration order.
//!
//! Entries live in an arena and form one doubly linked list. Entries sharing
//! a shortcut key (XOR fold of the UUID) are contiguous in that list and
//! ordered by descending UUID, and the 256-slot shortcut index points at the
//! first (largest) entry of each bucket. A lookup therefore starts at the
//! bucket head and stops as soon as it walks past the key or below the UUID.

use alloc::vec::Vec;

use super::message::Message;
use super::mqueue::MessageQueues;
use crate::errno::{Errno, KResult};
use crate::types::{uuid_key, MqId, Uuid, UuidKey};
use crate::{logd, logw};

/// Queue handles one entry can hold
///
/// One entry fills a 4080-byte record: two links, the UUID and the fill
/// index, followed by the queue handles.
pub const SD_QUEUES_PER_ENTRY: usize = (4080 - 16 - 8 - 2 * 8) / 8;

/// Number of shortcut buckets
pub const SD_SHORTCUT_SIZE: usize = 256;

// ============================================================================
// Entries
// ============================================================================

#[derive(Debug)]
struct SdEntry {
    uuid: Uuid,
    key: UuidKey,
    prev: Option<usize>,
    next: Option<usize>,
    /// Registered queues in registration order
    queues: heapless::Vec<MqId, SD_QUEUES_PER_ENTRY>,
}

// ============================================================================
// Registry
// ============================================================================

/// Service directory of one kernel instance
#[derive(Debug)]
pub struct ServiceRegistry {
    shortcut: [Option<usize>; SD_SHORTCUT_SIZE],
    entries: Vec<Option<SdEntry>>,
    /// Arena slots of unlinked entries
    free: Vec<usize>,
    head: Option<usize>,
    tail: Option<usize>,
}

impl ServiceRegistry {
    pub const fn new() -> Self {
        Self {
            shortcut: [None; SD_SHORTCUT_SIZE],
            entries: Vec::new(),
            free: Vec::new(),
            head: None,
            tail: None,
        }
    }

    fn entry(&self, idx: usize) -> Option<&SdEntry> {
        self.entries.get(idx).and_then(Option::as_ref)
    }

    fn entry_mut(&mut self, idx: usize) -> Option<&mut SdEntry> {
        self.entries.get_mut(idx).and_then(Option::as_mut)
    }

    /// Arena index of the entry for `uuid`
    fn find(&self, uuid: &Uuid) -> Option<usize> {
        let key = uuid_key(uuid);
        let mut cur = self.shortcut[key as usize];

        while let Some(idx) = cur {
            let entry = self.entry(idx)?;
            if entry.key != key || entry.uuid < *uuid {
                return None;
            }
            if entry.uuid == *uuid {
                return Some(idx);
            }
            cur = entry.next;
        }
        None
    }

    fn alloc_entry(&mut self, entry: SdEntry) -> usize {
        match self.free.pop() {
            Some(idx) => {
                self.entries[idx] = Some(entry);
                idx
            }
            None => {
                self.entries.push(Some(entry));
                self.entries.len() - 1
            }
        }
    }

    /// Link `idx` in front of `before`, or at the tail if `None`
    fn link_before(&mut self, idx: usize, before: Option<usize>) {
        let prev = match before {
            Some(b) => self.entry(b).and_then(|e| e.prev),
            None => self.tail,
        };

        if let Some(entry) = self.entry_mut(idx) {
            entry.prev = prev;
            entry.next = before;
        }
        match prev {
            Some(p) => {
                if let Some(e) = self.entry_mut(p) {
                    e.next = Some(idx);
                }
            }
            None => self.head = Some(idx),
        }
        match before {
            Some(b) => {
                if let Some(e) = self.entry_mut(b) {
                    e.prev = Some(idx);
                }
            }
            None => self.tail = Some(idx),
        }
    }

    fn unlink(&mut self, idx: usize) {
        let Some(entry) = self.entries.get_mut(idx).and_then(Option::take) else {
            return;
        };

        match entry.prev {
            Some(p) => {
                if let Some(e) = self.entry_mut(p) {
                    e.next = entry.next;
                }
            }
            None => self.head = entry.next,
        }
        match entry.next {
            Some(n) => {
                if let Some(e) = self.entry_mut(n) {
                    e.prev = entry.prev;
                }
            }
            None => self.tail = entry.prev,
        }

        let slot = &mut self.shortcut[entry.key as usize];
        if *slot == Some(idx) {
            *slot = entry
                .next
                .filter(|n| self.entries[*n].as_ref().is_some_and(|e| e.key == entry.key));
        }

        self.free.push(idx);
    }

    /// Register `mq` for `uuid`. Registering the same queue twice is logged
    /// and recorded again; `ENOMEM` once the entry is full.
    pub fn register(&mut self, uuid: Uuid, mq: MqId) -> KResult<()> {
        logd!("sd", "Registering queue {} for service {}", mq, uuid);

        if let Some(idx) = self.find(&uuid) {
            let entry = self.entry_mut(idx).ok_or(Errno::NoEnt)?;
            if entry.queues.contains(&mq) {
                logw!("sd", "Queue {} registered for service {} a second time", mq, uuid);
            }
            return entry.queues.push(mq).map_err(|_| {
                logw!("sd", "Service {} has no room for more queues", uuid);
                Errno::NoMem
            });
        }

        let key = uuid_key(&uuid);
        let mut queues = heapless::Vec::new();
        // Capacity is never zero
        let _ = queues.push(mq);
        let idx = self.alloc_entry(SdEntry {
            uuid,
            key,
            prev: None,
            next: None,
            queues,
        });

        match self.shortcut[key as usize] {
            None => self.link_before(idx, None),
            Some(first) => {
                // First entry of the bucket with a smaller UUID, or the entry
                // following the bucket
                let mut cur = Some(first);
                while let Some(c) = cur {
                    match self.entry(c) {
                        Some(e) if e.key == key && e.uuid > uuid => cur = e.next,
                        _ => break,
                    }
                }
                self.link_before(idx, cur);

                if cur == Some(first) {
                    self.shortcut[key as usize] = Some(idx);
                }
                return Ok(());
            }
        }

        self.shortcut[key as usize] = Some(idx);
        Ok(())
    }

    /// Queues registered for `uuid`
    pub fn lookup(&self, uuid: &Uuid) -> Option<&[MqId]> {
        let idx = self.find(uuid)?;
        self.entry(idx).map(|e| e.queues.as_slice())
    }

    /// Hand every queue registered for `uuid` to `push`, in registration
    /// order. Returns how many pushes succeeded; failed pushes are skipped.
    pub fn send_with<F>(&self, uuid: &Uuid, mut push: F) -> KResult<usize>
    where
        F: FnMut(MqId) -> KResult<()>,
    {
        let queues = self.lookup(uuid).ok_or(Errno::NoEnt)?;

        let mut delivered = 0;
        for mq in queues {
            match push(*mq) {
                Ok(()) => delivered += 1,
                Err(e) => logd!("sd", "Delivery of service {} to queue {} failed: {}", uuid, mq, e),
            }
        }
        Ok(delivered)
    }

    /// Copy `msg` into every queue registered for `uuid`
    pub fn send(&self, uuid: &Uuid, msg: &Message, queues: &mut MessageQueues) -> KResult<usize> {
        self.send_with(uuid, |mq| queues.push(mq, msg.clone()))
    }

    /// Drop `mq` from every service; services left without queues are
    /// removed
    pub fn unregister_queue(&mut self, mq: MqId) -> usize {
        let mut removed = 0;
        let mut emptied = Vec::new();

        let mut cur = self.head;
        while let Some(idx) = cur {
            let Some(entry) = self.entry_mut(idx) else {
                break;
            };
            let before = entry.queues.len();
            entry.queues.retain(|q| *q != mq);
            removed += before - entry.queues.len();
            if entry.queues.is_empty() {
                emptied.push(idx);
            }
            cur = entry.next;
        }

        for idx in emptied {
            self.unlink(idx);
        }
        removed
    }

    /// Number of registered services
    pub fn len(&self) -> usize {
        self.entries.iter().filter(|e| e.is_some()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.head.is_none()
    }

    /// Registered services in list order
    pub fn services(&self) -> Vec<Uuid> {
        let mut out = Vec::new();
        let mut cur = self.head;
        while let Some(entry) = cur.and_then(|idx| self.entry(idx)) {
            out.push(entry.uuid);
            cur = entry.next;
        }
        out
    }
}

impl Default for ServiceRegistry {
    fn default() -> Self {
        Self::new()
    }
}
