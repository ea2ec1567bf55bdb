//! IPC Message Queue - Bounded FIFO of variable-length messages
//!
//! Every queue is one entry of the queue handle table. Messages are kept
//! decoded; their encoded size is charged against the queue quota and the
//! kernel allocator budget while they are enqueued.
//!
//! Receiving into a user buffer follows a two-phase protocol: the buffer
//! declares its capacity in its size field, and if the head message does not
//! fit the call fails with `EMSGSIZE` after writing the required size back.

use alloc::collections::VecDeque;
use alloc::sync::Arc;
use alloc::vec::Vec;

use super::message::{self, Message};
use crate::errno::{Errno, KResult};
use crate::kern::kalloc::KernelAllocator;
use crate::kern::table::{HandleCounter, HandleTable};
use crate::types::{MqId, ProcessId};
use crate::{logd, logw};

/// Called with the queue handle when a queue is destroyed
pub type TeardownNotifier = fn(MqId);

/// Sentinel quota meaning "no limit"
pub const MQUEUE_NO_LIMIT: usize = 0;

// ============================================================================
// Message Queue
// ============================================================================

/// A single queue
#[derive(Debug)]
pub struct MessageQueue {
    /// Pending messages (FIFO)
    messages: VecDeque<Message>,
    /// Maximum number of messages (0 = unlimited)
    item_quota: usize,
    /// Maximum encoded bytes of pending messages (0 = unlimited)
    byte_quota: usize,
    /// Encoded bytes of pending messages
    bytes: usize,
    /// Creating process, `None` for kernel queues
    owner: Option<ProcessId>,
    notifiers: Vec<TeardownNotifier>,
}

impl MessageQueue {
    fn new(item_quota: usize, byte_quota: usize, owner: Option<ProcessId>) -> Self {
        Self {
            messages: VecDeque::new(),
            item_quota,
            byte_quota,
            bytes: 0,
            owner,
            notifiers: Vec::new(),
        }
    }

    /// Whether one more message of `size` bytes stays within the quotas
    fn admits(&self, size: usize) -> bool {
        let items_ok =
            self.item_quota == MQUEUE_NO_LIMIT || self.messages.len() < self.item_quota;
        let bytes_ok = self.byte_quota == MQUEUE_NO_LIMIT
            || self.bytes.saturating_add(size) <= self.byte_quota;
        items_ok && bytes_ok
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn bytes(&self) -> usize {
        self.bytes
    }

    pub fn owner(&self) -> Option<ProcessId> {
        self.owner
    }

    pub fn quota(&self) -> (usize, usize) {
        (self.item_quota, self.byte_quota)
    }
}

// ============================================================================
// Queue Subsystem
// ============================================================================

/// All message queues of one kernel instance
#[derive(Debug)]
pub struct MessageQueues {
    table: HandleTable<MessageQueue>,
    handles: HandleCounter,
    allocator: Arc<KernelAllocator>,
}

impl MessageQueues {
    pub fn new(page_size: usize, allocator: Arc<KernelAllocator>) -> KResult<Self> {
        Ok(Self {
            table: HandleTable::create(page_size, 0, Arc::clone(&allocator))?,
            handles: HandleCounter::new(),
            allocator,
        })
    }

    /// Subsystem with a custom handle counter
    pub fn with_counter(
        page_size: usize,
        allocator: Arc<KernelAllocator>,
        handles: HandleCounter,
    ) -> KResult<Self> {
        let mut queues = Self::new(page_size, allocator)?;
        queues.handles = handles;
        Ok(queues)
    }

    /// Create a queue with the given quotas (0 = unlimited)
    pub fn create(
        &mut self,
        item_quota: usize,
        byte_quota: usize,
        owner: Option<ProcessId>,
    ) -> KResult<MqId> {
        let raw = self.handles.allocate().ok_or_else(|| {
            logw!("mq", "Message queue namespace exhausted");
            Errno::NoMem
        })?;

        self.table
            .set(raw, Some(MessageQueue::new(item_quota, byte_quota, owner)))?;

        let mq = MqId::from_raw(raw);
        logd!("mq", "Created queue {} (items {}, bytes {})", mq, item_quota, byte_quota);
        Ok(mq)
    }

    /// Destroy a queue; teardown notifiers run before the contents are freed
    pub fn destroy(&mut self, mq: MqId) -> KResult<()> {
        let notifiers = match self.table.get(mq.raw()) {
            Some(queue) => queue.notifiers.clone(),
            None => return Err(Errno::NoEnt),
        };
        for notify in notifiers {
            notify(mq);
        }

        if let Some(queue) = self.table.take(mq.raw()) {
            self.allocator.release(queue.bytes);
            logd!("mq", "Destroyed queue {} ({} pending)", mq, queue.messages.len());
        }
        Ok(())
    }

    fn queue(&self, mq: MqId) -> KResult<&MessageQueue> {
        self.table.get(mq.raw()).ok_or(Errno::NoEnt)
    }

    fn queue_mut(&mut self, mq: MqId) -> KResult<&mut MessageQueue> {
        self.table.get_mut(mq.raw()).ok_or(Errno::NoEnt)
    }

    pub fn get(&self, mq: MqId) -> Option<&MessageQueue> {
        self.table.get(mq.raw())
    }

    pub fn contains(&self, mq: MqId) -> bool {
        self.table.contains(mq.raw())
    }

    /// Append a message. `ENOMEM` if a quota or the allocator budget would be
    /// exceeded.
    pub fn push(&mut self, mq: MqId, msg: Message) -> KResult<()> {
        let size = msg.size();
        let allocator = Arc::clone(&self.allocator);
        let queue = self.queue_mut(mq)?;

        if !queue.admits(size) {
            logd!("mq", "Queue {} over quota, dropping {} bytes", mq, size);
            return Err(Errno::NoMem);
        }
        allocator.reserve(size)?;

        queue.bytes += size;
        queue.messages.push_back(msg);
        Ok(())
    }

    /// Head message without removing it
    pub fn peek(&self, mq: MqId) -> KResult<&Message> {
        self.queue(mq)?.messages.front().ok_or(Errno::NoMsg)
    }

    /// Remove and return the head message
    pub fn pop(&mut self, mq: MqId) -> KResult<Message> {
        let queue = self.queue_mut(mq)?;
        let msg = queue.messages.pop_front().ok_or(Errno::NoMsg)?;
        let size = msg.size();
        queue.bytes -= size;
        self.allocator.release(size);
        Ok(msg)
    }

    /// Copy the head message into `buf`. Returns the message size.
    pub fn peek_into(&self, mq: MqId, buf: &mut [u8]) -> KResult<usize> {
        let head = self.peek(mq)?;
        Self::deliver(head, buf)
    }

    /// Copy the head message into `buf` and remove it. Returns the message size.
    pub fn pop_into(&mut self, mq: MqId, buf: &mut [u8]) -> KResult<usize> {
        let size = self.peek_into(mq, buf)?;
        self.pop(mq)?;
        Ok(size)
    }

    fn deliver(head: &Message, buf: &mut [u8]) -> KResult<usize> {
        let capacity = message::buffer_capacity(buf)?;
        let size = head.size();
        if size > capacity {
            message::report_required_size(buf, size);
            return Err(Errno::MsgSize);
        }
        head.encode_into(buf)
    }

    /// Register a function to be called when `mq` is destroyed
    pub fn notify_teardown(&mut self, mq: MqId, notifier: TeardownNotifier) -> KResult<()> {
        let queue = self.queue_mut(mq)?;
        if queue.notifiers.iter().any(|n| *n as usize == notifier as usize) {
            return Err(Errno::Exist);
        }
        queue.notifiers.push(notifier);
        Ok(())
    }

    /// Change quotas; pending messages are kept even if now over quota
    pub fn set_quota(&mut self, mq: MqId, item_quota: usize, byte_quota: usize) -> KResult<()> {
        let queue = self.queue_mut(mq)?;
        queue.item_quota = item_quota;
        queue.byte_quota = byte_quota;
        Ok(())
    }

    pub fn len(&self, mq: MqId) -> KResult<usize> {
        Ok(self.queue(mq)?.len())
    }

    pub fn bytes(&self, mq: MqId) -> KResult<usize> {
        Ok(self.queue(mq)?.bytes())
    }

    pub fn owner(&self, mq: MqId) -> KResult<Option<ProcessId>> {
        Ok(self.queue(mq)?.owner())
    }

    /// Queues created by `pid`
    pub fn owned_by(&self, pid: ProcessId) -> Vec<MqId> {
        self.table
            .iter()
            .filter(|(_, q)| q.owner == Some(pid))
            .map(|(h, _)| MqId::from_raw(h))
            .collect()
    }

    /// Number of live queues
    pub fn count(&self) -> usize {
        self.table.entry_count()
    }
}

impl Drop for MessageQueues {
    fn drop(&mut self) {
        let pending: usize = self.table.iter().map(|(_, q)| q.bytes).sum();
        self.allocator.release(pending);
    }
}
