//! Property-based tests for kipc
//!
//! Queue ordering, receive-buffer size negotiation, wire decoding and
//! handle-table lookup over generated inputs.


use std::sync::Arc;

use kipc::ipc::message::{declared_kind, declared_size, receive_buffer, HEADER_SIZE, MT_INVALID};
use kipc::ipc::mqueue::MessageQueues;
use kipc::kern::kalloc::KernelAllocator;
use kipc::kern::table::HandleTable;
use kipc::{Errno, Message};
use proptest::prelude::*;
use proptest_strategies::*;

fn queues() -> MessageQueues {
    MessageQueues::new(4096, Arc::new(KernelAllocator::unlimited())).unwrap()
}

// ════════════════════════════════════════════════════════════
// Message Queue Properties
// ════════════════════════════════════════════════════════════

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    /// Pop returns messages in push order; peek sees what pop returns
    #[test]
    fn queue_is_fifo(batch in message_batch()) {
        let mut q = queues();
        let mq = q.create(0, 0, None).unwrap();
        for msg in &batch {
            q.push(mq, msg.clone()).unwrap();
        }

        for expected in &batch {
            let peeked = q.peek(mq).unwrap().clone();
            let popped = q.pop(mq).unwrap();
            prop_assert_eq!(&peeked, &popped);
            prop_assert_eq!(&popped, expected);
        }
        prop_assert_eq!(q.pop(mq), Err(Errno::NoMsg));
        prop_assert_eq!(q.bytes(mq), Ok(0));
    }

    /// An undersized buffer learns the exact size, and the retry succeeds
    #[test]
    fn size_negotiation_converges(msg in message(), short in 0usize..HEADER_SIZE) {
        let mut q = queues();
        let mq = q.create(0, 0, None).unwrap();
        q.push(mq, msg.clone()).unwrap();

        let capacity = (msg.size() - 1).saturating_sub(short).max(HEADER_SIZE);
        let mut buf = receive_buffer(capacity);
        if capacity < msg.size() {
            prop_assert_eq!(q.pop_into(mq, &mut buf), Err(Errno::MsgSize));
            prop_assert_eq!(declared_size(&buf), Some(msg.size() as u64));
            prop_assert_eq!(declared_kind(&buf), Some(MT_INVALID));
            prop_assert_eq!(q.len(mq), Ok(1));
        }

        let mut buf = receive_buffer(msg.size());
        prop_assert_eq!(q.pop_into(mq, &mut buf), Ok(msg.size()));
        prop_assert_eq!(Message::decode(&buf).unwrap(), msg);
    }

    /// Receiving from an empty queue leaves the buffer untouched
    #[test]
    fn empty_queue_keeps_buffer(fill in any::<u8>(), capacity in HEADER_SIZE..512usize) {
        let mut q = queues();
        let mq = q.create(0, 0, None).unwrap();

        let mut buf = receive_buffer(capacity);
        for b in &mut buf[8..] {
            *b = fill;
        }
        let before = buf.clone();

        prop_assert_eq!(q.peek_into(mq, &mut buf), Err(Errno::NoMsg));
        prop_assert_eq!(q.pop_into(mq, &mut buf), Err(Errno::NoMsg));
        prop_assert_eq!(buf, before);
    }

    /// Item quotas cap the queue length exactly
    #[test]
    fn item_quota_enforced(quota in 1usize..16, batch in message_batch()) {
        let mut q = queues();
        let mq = q.create(quota, 0, None).unwrap();

        let mut accepted = 0;
        for msg in batch.iter().cloned() {
            if q.push(mq, msg).is_ok() {
                accepted += 1;
            }
        }
        prop_assert_eq!(accepted, batch.len().min(quota));
        prop_assert_eq!(q.len(mq), Ok(accepted));
    }
}

// ════════════════════════════════════════════════════════════
// Wire Format Properties
// ════════════════════════════════════════════════════════════

proptest! {
    #![proptest_config(ProptestConfig::with_cases(128))]

    /// Decoding never panics on arbitrary bytes
    #[test]
    fn decode_never_panics(bytes in prop::collection::vec(any::<u8>(), 0..128)) {
        let _ = Message::decode(&bytes);
    }

    /// Encoded sizes satisfy the header invariant
    #[test]
    fn header_sizes_consistent(msg in message()) {
        let buf = msg.encode();
        let size = u64::from_le_bytes(buf[0..8].try_into().unwrap());
        let user_size = u64::from_le_bytes(buf[8..16].try_into().unwrap());
        prop_assert_eq!(size as usize, buf.len());
        prop_assert_eq!(user_size, size - HEADER_SIZE as u64);
    }
}

// ════════════════════════════════════════════════════════════
// Handle Table Properties
// ════════════════════════════════════════════════════════════

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    /// Exactly the written handles resolve; cleared ones stop resolving
    /// while their pages stay allocated
    #[test]
    fn table_lookup_matches_writes(written in handles(), probe in 1u64..200_000) {
        let mut t: HandleTable<u64> =
            HandleTable::create(4096, 0, Arc::new(KernelAllocator::unlimited())).unwrap();
        for h in &written {
            t.set(*h, Some(*h * 3)).unwrap();
        }

        prop_assert_eq!(t.entry_count(), written.len());
        prop_assert_eq!(t.get(probe).is_some(), written.contains(&probe));
        prop_assert_eq!(t.handles(), written.clone());

        let size = t.size();
        for h in &written {
            prop_assert_eq!(t.set(*h, None).unwrap(), Some(*h * 3));
            prop_assert_eq!(t.get(*h), None);
        }
        prop_assert_eq!(t.entry_count(), 0);
        prop_assert_eq!(t.size(), size);
    }
}
